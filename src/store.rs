use crate::invoker::TerminationHandle;
use crate::job::{JobId, JobRecord, JobRequest, JobStatus, JobView};
use crate::{EngineError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Which records `clear` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearFilter {
    All,
    Terminal,
    Only(JobStatus),
}

impl ClearFilter {
    fn matches(&self, status: JobStatus) -> bool {
        match self {
            ClearFilter::All => true,
            ClearFilter::Terminal => status.is_terminal(),
            ClearFilter::Only(wanted) => *wanted == status,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Unknown,
    AlreadyTerminal,
    /// Queued job moved straight to Cancelled.
    Cancelled(JobView),
    /// Running job flagged; the worker resolves it.
    Requested,
}

/// A job handed to the worker, already moved to Running.
pub(crate) struct ClaimedJob {
    pub id: JobId,
    pub request: JobRequest,
    pub termination: TerminationHandle,
    pub view: JobView,
}

#[derive(Default)]
struct StoreState {
    order: VecDeque<JobId>,
    jobs: HashMap<JobId, JobRecord>,
    paused: bool,
    shutdown: bool,
    active: Option<(JobId, TerminationHandle)>,
}

impl StoreState {
    fn has_startable_job(&self) -> bool {
        self.order
            .iter()
            .any(|id| self.jobs.get(id).is_some_and(|j| j.status == JobStatus::Queued))
    }

    fn live_jobs(&self) -> usize {
        self.jobs.values().filter(|j| !j.status.is_terminal()).count()
    }
}

/// Ordered job list plus id index for one queue. Every access goes through a
/// single mutex that is never held across a call into an external process.
pub(crate) struct QueueStore {
    state: Mutex<StoreState>,
    wake: Condvar,
    capacity: usize,
}

impl QueueStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            wake: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Records are whole between field updates, so a poisoned lock is
        // still safe to read.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, record: JobRecord) -> Result<JobView> {
        let mut state = self.lock();
        if state.live_jobs() >= self.capacity {
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }
        let view = record.view();
        state.order.push_back(record.id);
        state.jobs.insert(record.id, record);
        drop(state);
        self.wake.notify_all();
        Ok(view)
    }

    /// Inserts every record or none of them.
    pub fn insert_all(&self, records: Vec<JobRecord>) -> Result<Vec<JobView>> {
        let mut state = self.lock();
        if state.live_jobs() + records.len() > self.capacity {
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }
        let views = records
            .into_iter()
            .map(|record| {
                let view = record.view();
                state.order.push_back(record.id);
                state.jobs.insert(record.id, record);
                view
            })
            .collect();
        drop(state);
        self.wake.notify_all();
        Ok(views)
    }

    /// Blocks until a Queued job may start, then moves the earliest one to
    /// Running. Returns `None` once the store is shut down.
    pub fn claim_next(&self) -> Option<ClaimedJob> {
        let mut guard = self.lock();
        loop {
            if guard.shutdown {
                return None;
            }
            if !guard.paused && guard.active.is_none() && guard.has_startable_job() {
                break;
            }
            guard = self.wake.wait(guard).unwrap_or_else(|e| e.into_inner());
        }

        let state = &mut *guard;
        let id = state
            .order
            .iter()
            .copied()
            .find(|id| state.jobs.get(id).is_some_and(|j| j.status == JobStatus::Queued))?;
        let record = state.jobs.get_mut(&id)?;
        if let Err(e) = record.start() {
            tracing::error!(job_id = %id, error = %e, "could not start queued job");
            return None;
        }
        let termination = TerminationHandle::new();
        state.active = Some((id, termination.clone()));
        Some(ClaimedJob {
            id,
            request: record.request.clone(),
            termination,
            view: record.view(),
        })
    }

    /// Clears the active slot once its job reached a terminal state.
    pub fn release(&self, id: JobId) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|(active, _)| *active == id) {
            state.active = None;
        }
        drop(state);
        self.wake.notify_all();
    }

    pub fn with_job<R>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let mut state = self.lock();
        state.jobs.get_mut(&id).map(f)
    }

    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(record) = state.jobs.get_mut(&id) else {
            return CancelOutcome::Unknown;
        };
        match record.status {
            status if status.is_terminal() => CancelOutcome::AlreadyTerminal,
            JobStatus::Queued => match record.cancel() {
                Ok(()) => CancelOutcome::Cancelled(record.view()),
                Err(_) => CancelOutcome::AlreadyTerminal,
            },
            _ => {
                record.cancel_requested = true;
                if let Some((_, handle)) = state.active.as_ref().filter(|(active, _)| *active == id) {
                    handle.terminate();
                }
                CancelOutcome::Requested
            }
        }
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.lock();
        state.paused = paused;
        drop(state);
        self.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Wakes the worker for good and stops whatever it is running.
    pub fn shutdown(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.shutdown = true;
        if let Some((id, handle)) = state.active.as_ref() {
            handle.terminate();
            if let Some(record) = state.jobs.get_mut(id) {
                record.cancel_requested = true;
            }
        }
        drop(guard);
        self.wake.notify_all();
    }

    /// Lets a new worker claim jobs again after `shutdown`.
    pub fn reopen(&self) {
        self.lock().shutdown = false;
    }

    pub fn clear(&self, filter: ClearFilter) -> Result<Vec<JobId>> {
        let mut state = self.lock();
        let doomed: Vec<JobId> = state
            .order
            .iter()
            .copied()
            .filter(|id| state.jobs.get(id).is_some_and(|j| filter.matches(j.status)))
            .collect();

        if let Some(running) = doomed.iter().find(|id| {
            state
                .jobs
                .get(*id)
                .is_some_and(|j| matches!(j.status, JobStatus::Running | JobStatus::Paused))
        }) {
            return Err(EngineError::InvalidState(format!(
                "job {running} is running; cancel it before clearing"
            )));
        }

        for id in &doomed {
            state.jobs.remove(id);
        }
        state.order.retain(|id| !doomed.contains(id));
        Ok(doomed)
    }

    pub fn snapshot(&self) -> Vec<JobView> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).map(JobRecord::view))
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<JobView> {
        self.lock().jobs.get(&id).map(JobRecord::view)
    }

    pub fn current(&self) -> Option<JobView> {
        let state = self.lock();
        let (id, _) = state.active.as_ref()?;
        state.jobs.get(id).map(JobRecord::view)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn has_unfinished(&self) -> bool {
        self.lock().live_jobs() > 0
    }
}
