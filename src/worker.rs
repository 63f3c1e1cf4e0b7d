use crate::dialect::ToolDialect;
use crate::events::{EventChannel, EventKind, JobEvent};
use crate::invoker::{self, InvocationEvent, Outcome};
use crate::job::{JobId, JobStatus, JobView, QueueKind};
use crate::joblog::JobLogs;
use crate::locate::ToolLocator;
use crate::store::{ClaimedJob, QueueStore};
use crate::EngineError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Percent step between progress lines in the per-job log file.
const LOG_PROGRESS_STEP: f32 = 10.0;

pub(crate) struct Worker {
    pub queue: QueueKind,
    pub store: Arc<QueueStore>,
    pub events: EventChannel,
    pub dialect: Arc<dyn ToolDialect>,
    pub locator: Arc<dyn ToolLocator>,
    pub binary: PathBuf,
    pub poll_interval: Duration,
    pub job_logs: Option<JobLogs>,
}

impl Worker {
    /// Runs queued jobs one at a time until the store shuts down.
    pub fn run(self) {
        tracing::info!(queue = %self.queue, tool = %self.dialect.tool(), "worker started");
        while let Some(job) = self.store.claim_next() {
            let id = job.id;
            self.run_job(job);
            self.store.release(id);
        }
        tracing::info!(queue = %self.queue, "worker stopped");
    }

    fn run_job(&self, job: ClaimedJob) {
        let ClaimedJob {
            id,
            request,
            termination,
            view,
        } = job;

        tracing::info!(queue = %self.queue, job_id = %id, source = %request.source, "job started");
        self.events
            .publish(JobEvent::from_view(EventKind::StateChanged, &view));
        self.log(
            id,
            "info",
            "started",
            serde_json::json!({ "source": request.source, "output": request.output }),
        );

        let outcome = if termination.is_terminated() {
            Outcome::Terminated
        } else {
            match self
                .dialect
                .prepare(&self.binary, &request, self.locator.as_ref())
                .and_then(|run| invoker::invoke(run, termination.clone(), self.poll_interval))
            {
                Ok(invocation) => self.drive(id, invocation),
                Err(e) => {
                    tracing::warn!(queue = %self.queue, job_id = %id, error = %e, "job could not be launched");
                    Outcome::Failure(launch_failure_reason(&e))
                }
            }
        };

        self.finish(id, outcome);
    }

    fn drive(&self, id: JobId, mut invocation: invoker::Invocation) -> Outcome {
        self.log(
            id,
            "info",
            "spawned",
            serde_json::json!({ "tool": invocation.tool(), "pid": invocation.pid() }),
        );

        let mut next_logged = LOG_PROGRESS_STEP;
        while let Some(event) = invocation.next() {
            match event {
                InvocationEvent::Progress(update) => {
                    let view = self
                        .store
                        .with_job(id, |record| record.apply_progress(&update).then(|| record.view()))
                        .flatten();
                    let Some(view) = view else { continue };
                    if view.progress >= next_logged {
                        self.log(
                            id,
                            "info",
                            "progress",
                            serde_json::json!({ "percent": view.progress, "rate": view.rate, "eta_secs": view.eta_secs }),
                        );
                        while next_logged <= view.progress {
                            next_logged += LOG_PROGRESS_STEP;
                        }
                    }
                    self.events
                        .publish(JobEvent::from_view(EventKind::Progress, &view));
                }
                InvocationEvent::Finished(outcome) => {
                    if matches!(outcome, Outcome::Failure(_)) {
                        self.log(
                            id,
                            "warn",
                            "output_tail",
                            serde_json::json!({ "lines": invocation.output_tail() }),
                        );
                    }
                    return outcome;
                }
            }
        }
        Outcome::Failure(format!("{} stopped without reporting a result", invocation.tool()))
    }

    fn finish(&self, id: JobId, outcome: Outcome) {
        let result = self.store.with_job(id, |record| {
            // A cancel request wins over whatever the tool managed to do.
            let transition = if record.cancel_requested {
                record.cancel()
            } else {
                match &outcome {
                    Outcome::Success(path) => record.complete(path.clone()),
                    Outcome::Failure(reason) => record.fail(reason.clone()),
                    Outcome::Terminated => record.cancel(),
                }
            };
            transition.map(|()| record.view())
        });

        let view = match result {
            Some(Ok(view)) => view,
            Some(Err(e)) => {
                tracing::error!(queue = %self.queue, job_id = %id, error = %e, "could not record job outcome");
                return;
            }
            None => {
                tracing::error!(queue = %self.queue, job_id = %id, "running job vanished from its queue");
                return;
            }
        };

        if let (JobStatus::Cancelled, Outcome::Success(path)) = (view.status, &outcome) {
            self.discard_output(id, path);
        }
        self.log_terminal(&view);
        self.events
            .publish(JobEvent::from_view(EventKind::StateChanged, &view));
    }

    /// A job cancelled after its tool already produced a file leaves nothing
    /// behind.
    fn discard_output(&self, id: JobId, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(queue = %self.queue, job_id = %id, path = %path.display(), "discarded output of cancelled job");
                self.log(
                    id,
                    "info",
                    "discarded_output",
                    serde_json::json!({ "path": path }),
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(queue = %self.queue, job_id = %id, path = %path.display(), error = %e, "could not remove output of cancelled job");
                self.log(
                    id,
                    "warn",
                    "orphaned_output",
                    serde_json::json!({ "path": path, "error": e.to_string() }),
                );
            }
        }
    }

    fn log_terminal(&self, view: &JobView) {
        match view.error.as_deref() {
            Some(error) => {
                tracing::warn!(queue = %self.queue, job_id = %view.id, status = %view.status, error, "job finished")
            }
            None => tracing::info!(queue = %self.queue, job_id = %view.id, status = %view.status, "job finished"),
        }
        self.log(
            view.id,
            if view.error.is_some() { "warn" } else { "info" },
            view.status.as_str(),
            serde_json::json!({ "error": view.error, "output_path": view.output_path }),
        );
    }

    fn log(&self, id: JobId, level: &str, event: &str, data: serde_json::Value) {
        let Some(logs) = self.job_logs.as_ref() else {
            return;
        };
        if let Err(e) = logs.log_line(self.queue, id, level, event, data) {
            tracing::warn!(queue = %self.queue, job_id = %id, error = %e, "could not write job log");
        }
    }
}

fn launch_failure_reason(error: &EngineError) -> String {
    match error {
        EngineError::Validation(reason) => reason.clone(),
        EngineError::ToolMissing { tool } => format!("{tool} is not installed"),
        EngineError::ToolExecution { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PreparedRun;
    use crate::job::{JobRecord, JobRequest, OutputKind};
    use crate::locate::{StaticToolLocator, ToolKind};
    use crate::store::CancelOutcome;

    struct NeverLaunched;

    impl ToolDialect for NeverLaunched {
        fn tool(&self) -> ToolKind {
            ToolKind::Ffmpeg
        }

        fn prepare(
            &self,
            _binary: &Path,
            _request: &JobRequest,
            _locator: &dyn ToolLocator,
        ) -> crate::Result<PreparedRun> {
            Err(EngineError::InvalidState("jobs are finished by hand here".to_string()))
        }
    }

    fn worker(dir: &Path) -> Worker {
        Worker {
            queue: QueueKind::Conversion,
            store: Arc::new(QueueStore::new(10)),
            events: EventChannel::new(16),
            dialect: Arc::new(NeverLaunched),
            locator: Arc::new(StaticToolLocator::new()),
            binary: PathBuf::from("ffmpeg"),
            poll_interval: Duration::from_millis(10),
            job_logs: Some(JobLogs::new(dir.join("logs"))),
        }
    }

    fn claim(worker: &Worker, dir: &Path) -> JobId {
        let request = JobRequest::new(
            dir.join("in.mkv").to_string_lossy(),
            OutputKind::Audio,
            dir,
        );
        let id = worker
            .store
            .insert(JobRecord::new(QueueKind::Conversion, request))
            .expect("insert")
            .id;
        assert_eq!(worker.store.claim_next().map(|c| c.id), Some(id));
        id
    }

    #[test]
    fn cancel_that_wins_over_success_removes_the_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = worker(dir.path());
        let id = claim(&worker, dir.path());
        assert_eq!(worker.store.cancel(id), CancelOutcome::Requested);

        let produced = dir.path().join("in_converted.mp3");
        std::fs::write(&produced, b"audio").expect("output");
        worker.finish(id, Outcome::Success(produced.clone()));

        let view = worker.store.get(id).expect("view");
        assert_eq!(view.status, JobStatus::Cancelled);
        assert!(view.output_path.is_none());
        assert!(!produced.exists());

        let log = worker
            .job_logs
            .as_ref()
            .map(|logs| logs.path_for(QueueKind::Conversion, id))
            .expect("job logs");
        let text = std::fs::read_to_string(log).expect("job log");
        assert!(text.contains("discarded_output"));

        let last = worker.events.drain().pop().expect("event");
        assert_eq!(last.status, JobStatus::Cancelled);
    }

    #[test]
    fn successful_job_keeps_its_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = worker(dir.path());
        let id = claim(&worker, dir.path());

        let produced = dir.path().join("in_converted.mp3");
        std::fs::write(&produced, b"audio").expect("output");
        worker.finish(id, Outcome::Success(produced.clone()));

        let view = worker.store.get(id).expect("view");
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.output_path, Some(produced.clone()));
        assert!(produced.exists());
    }
}
