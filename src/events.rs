use crate::job::{JobId, JobStatus, JobView, QueueKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Advisory; may be merged with a newer one for the same job.
    Progress,
    /// Never dropped or merged.
    StateChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub queue: QueueKind,
    pub job_id: JobId,
    pub kind: EventKind,
    pub status: JobStatus,
    pub progress: f32,
    pub rate: Option<String>,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl JobEvent {
    pub fn from_view(kind: EventKind, view: &JobView) -> Self {
        Self {
            queue: view.queue,
            job_id: view.id,
            kind,
            status: view.status,
            progress: view.progress,
            rate: view.rate.clone(),
            eta_secs: view.eta_secs,
            error: view.error.clone(),
            output_path: view.output_path.clone(),
        }
    }

    pub fn is_state_change(&self) -> bool {
        self.kind == EventKind::StateChanged
    }
}

struct ChannelState {
    buffer: VecDeque<JobEvent>,
    dropped_progress: u64,
}

struct Inner {
    state: Mutex<ChannelState>,
    ready: Condvar,
    capacity: usize,
}

/// Bounded, cloneable conduit from the workers to the foreground.
///
/// When full, progress events give way: a new progress event replaces the
/// undelivered one for the same job, or evicts the oldest progress event, or
/// is dropped. State-change events are always kept, even past the bound.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::with_capacity(capacity.min(1024)),
                    dropped_progress: 0,
                }),
                ready: Condvar::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, event: JobEvent) {
        let mut state = self.lock();
        match event.kind {
            EventKind::Progress => {
                // Merge into the newest pending event for this job if that is
                // also progress; anything older must keep its order.
                let pending = state
                    .buffer
                    .iter()
                    .rposition(|e| e.job_id == event.job_id && e.queue == event.queue);
                if let Some(idx) = pending {
                    if state.buffer[idx].kind == EventKind::Progress {
                        state.buffer[idx] = event;
                        return;
                    }
                }
                if state.buffer.len() >= self.inner.capacity && !evict_oldest_progress(&mut state)
                {
                    state.dropped_progress += 1;
                    return;
                }
                state.buffer.push_back(event);
            }
            EventKind::StateChanged => {
                if state.buffer.len() >= self.inner.capacity {
                    evict_oldest_progress(&mut state);
                }
                state.buffer.push_back(event);
            }
        }
        drop(state);
        self.inner.ready.notify_all();
    }

    /// Takes every pending event without blocking.
    pub fn drain(&self) -> Vec<JobEvent> {
        self.lock().buffer.drain(..).collect()
    }

    /// Blocks up to `timeout` for at least one event, then drains.
    pub fn wait_for(&self, timeout: Duration) -> Vec<JobEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.buffer.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let (next, _) = self
                .inner
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
        state.buffer.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Progress events discarded because the channel was full.
    pub fn dropped_progress(&self) -> u64 {
        self.lock().dropped_progress
    }
}

fn evict_oldest_progress(state: &mut ChannelState) -> bool {
    match state.buffer.iter().position(|e| e.kind == EventKind::Progress) {
        Some(idx) => {
            state.buffer.remove(idx);
            state.dropped_progress += 1;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(job: JobId, kind: EventKind, status: JobStatus, progress: f32) -> JobEvent {
        JobEvent {
            queue: QueueKind::Download,
            job_id: job,
            kind,
            status,
            progress,
            rate: None,
            eta_secs: None,
            error: None,
            output_path: None,
        }
    }

    #[test]
    fn progress_for_same_job_coalesces() {
        let channel = EventChannel::new(8);
        let job = JobId::next();
        channel.publish(event(job, EventKind::StateChanged, JobStatus::Running, 0.0));
        channel.publish(event(job, EventKind::Progress, JobStatus::Running, 10.0));
        channel.publish(event(job, EventKind::Progress, JobStatus::Running, 30.0));

        let events = channel.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].progress, 30.0);
        assert!(channel.is_empty());
    }

    #[test]
    fn progress_never_jumps_over_a_state_change() {
        let channel = EventChannel::new(8);
        let job = JobId::next();
        channel.publish(event(job, EventKind::Progress, JobStatus::Running, 50.0));
        channel.publish(event(job, EventKind::StateChanged, JobStatus::Completed, 100.0));
        channel.publish(event(job, EventKind::Progress, JobStatus::Running, 60.0));

        let kinds: Vec<EventKind> = channel.drain().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Progress, EventKind::StateChanged, EventKind::Progress]
        );
    }

    #[test]
    fn state_changes_survive_a_full_channel() {
        let channel = EventChannel::new(2);
        let a = JobId::next();
        let b = JobId::next();
        let c = JobId::next();
        channel.publish(event(a, EventKind::Progress, JobStatus::Running, 1.0));
        channel.publish(event(b, EventKind::Progress, JobStatus::Running, 1.0));
        channel.publish(event(c, EventKind::Progress, JobStatus::Running, 1.0));
        channel.publish(event(a, EventKind::StateChanged, JobStatus::Failed, 1.0));
        channel.publish(event(b, EventKind::StateChanged, JobStatus::Completed, 100.0));
        channel.publish(event(c, EventKind::StateChanged, JobStatus::Cancelled, 1.0));

        let events = channel.drain();
        let changes: Vec<JobId> = events
            .iter()
            .filter(|e| e.is_state_change())
            .map(|e| e.job_id)
            .collect();
        assert_eq!(changes, vec![a, b, c]);
        assert!(channel.dropped_progress() >= 2);
    }

    #[test]
    fn wait_for_returns_on_publish_or_timeout() {
        let channel = EventChannel::new(4);
        assert!(channel.wait_for(Duration::from_millis(20)).is_empty());

        let publisher = channel.clone();
        let job = JobId::next();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            publisher.publish(event(job, EventKind::StateChanged, JobStatus::Running, 0.0));
        });
        let events = channel.wait_for(Duration::from_secs(5));
        handle.join().expect("join");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, job);
    }
}
