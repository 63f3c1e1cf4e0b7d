use crate::classify::{MediaFileClassifier, SourceClassifier, SourceKind, YouTubeClassifier};
use crate::config::EngineConfig;
use crate::dialect::{FfmpegDialect, ToolDialect, YtDlpDialect};
use crate::events::{EventChannel, EventKind, JobEvent};
use crate::job::{JobId, JobRecord, JobRequest, JobView, QueueKind};
use crate::joblog::JobLogs;
use crate::locate::{SystemToolLocator, ToolKind, ToolLocator};
use crate::playlist;
use crate::store::{CancelOutcome, ClearFilter, QueueStore};
use crate::worker::Worker;
use crate::{EngineError, Result};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub poll_interval: Duration,
    pub job_logs: Option<JobLogs>,
}

impl QueueSettings {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
            job_logs: None,
        }
    }
}

/// Public face of one queue: its store, its worker thread and the channel the
/// worker reports on. Every call returns after a short in-memory update.
///
/// A new manager accepts jobs but runs nothing until [`QueueManager::start`].
pub struct QueueManager {
    queue: QueueKind,
    store: Arc<QueueStore>,
    events: EventChannel,
    dialect: Arc<dyn ToolDialect>,
    classifier: Arc<dyn SourceClassifier>,
    locator: Arc<dyn ToolLocator>,
    settings: QueueSettings,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(
        queue: QueueKind,
        dialect: Arc<dyn ToolDialect>,
        classifier: Arc<dyn SourceClassifier>,
        locator: Arc<dyn ToolLocator>,
        events: EventChannel,
        settings: QueueSettings,
    ) -> Self {
        Self {
            queue,
            store: Arc::new(QueueStore::new(settings.capacity.max(1))),
            events,
            dialect,
            classifier,
            locator,
            settings,
            worker: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn enqueue(&self, request: JobRequest) -> Result<JobId> {
        let kind = self.validate(&request)?;
        self.locator.locate(self.dialect.tool())?;

        let view = self.store.insert(JobRecord::new(self.queue, request))?;
        self.announce(&view, kind);
        Ok(view.id)
    }

    /// Queues every request or, when any of them is rejected or they do not
    /// all fit, none of them.
    pub fn enqueue_all(&self, requests: Vec<JobRequest>) -> Result<Vec<JobId>> {
        let kinds = requests
            .iter()
            .map(|request| self.validate(request))
            .collect::<Result<Vec<_>>>()?;
        self.locator.locate(self.dialect.tool())?;

        let records = requests
            .into_iter()
            .map(|request| JobRecord::new(self.queue, request))
            .collect();
        let views = self.store.insert_all(records)?;
        for (view, kind) in views.iter().zip(kinds) {
            self.announce(view, kind);
        }
        Ok(views.iter().map(|v| v.id).collect())
    }

    fn validate(&self, request: &JobRequest) -> Result<SourceKind> {
        let source = request.source.trim();
        if source.is_empty() {
            return Err(EngineError::Validation("source is empty".to_string()));
        }
        if request.destination.as_os_str().is_empty() {
            return Err(EngineError::Validation(
                "destination directory is empty".to_string(),
            ));
        }
        match self.classifier.classify(source) {
            SourceKind::Unrecognized => Err(EngineError::Validation(format!(
                "unrecognized {} source: {source}",
                self.queue
            ))),
            SourceKind::YouTubePlaylist => Err(EngineError::Validation(format!(
                "playlist URLs are queued per video; expand it first: {source}"
            ))),
            kind => Ok(kind),
        }
    }

    fn announce(&self, view: &JobView, kind: SourceKind) {
        tracing::info!(
            queue = %self.queue,
            job_id = %view.id,
            source_kind = kind.as_str(),
            output = ?view.output,
            "job queued"
        );
        self.events
            .publish(JobEvent::from_view(EventKind::StateChanged, view));
    }

    /// Resolves the queue's tool and starts the worker. On an already started
    /// queue this only resumes it; after `shutdown` a fresh worker picks up
    /// the jobs still Queued.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            drop(worker);
            self.resume_queue();
            return Ok(());
        }

        let binary = self.locator.locate(self.dialect.tool())?;
        tracing::info!(queue = %self.queue, tool = %self.dialect.tool(), path = %binary.display(), "starting queue");

        if let Some(logs) = self.settings.job_logs.as_ref() {
            logs.prune_in_background();
        }

        let runner = Worker {
            queue: self.queue,
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            dialect: Arc::clone(&self.dialect),
            locator: Arc::clone(&self.locator),
            binary,
            poll_interval: self.settings.poll_interval,
            job_logs: self.settings.job_logs.clone(),
        };
        self.store.reopen();
        let handle = std::thread::Builder::new()
            .name(format!("{}-worker", self.queue))
            .spawn(move || runner.run())?;
        *worker = Some(handle);
        drop(worker);
        self.store.set_paused(false);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The running job, if any, finishes; nothing new starts until resumed.
    pub fn pause_queue(&self) {
        self.store.set_paused(true);
        tracing::info!(queue = %self.queue, "queue paused");
    }

    pub fn resume_queue(&self) {
        self.store.set_paused(false);
        tracing::info!(queue = %self.queue, "queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.store.is_paused()
    }

    /// Unknown and finished jobs are left alone. Queued jobs are cancelled on
    /// the spot; a running job is stopped by its worker.
    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        let outcome = self.store.cancel(id);
        match &outcome {
            CancelOutcome::Cancelled(view) => {
                tracing::info!(queue = %self.queue, job_id = %id, "queued job cancelled");
                if let Some(logs) = self.settings.job_logs.as_ref() {
                    if let Err(e) = logs.log_line(self.queue, id, "info", "cancelled", serde_json::Value::Null) {
                        tracing::warn!(queue = %self.queue, job_id = %id, error = %e, "could not write job log");
                    }
                }
                self.events
                    .publish(JobEvent::from_view(EventKind::StateChanged, view));
            }
            CancelOutcome::Requested => {
                tracing::info!(queue = %self.queue, job_id = %id, "cancellation requested");
            }
            CancelOutcome::Unknown | CancelOutcome::AlreadyTerminal => {
                tracing::debug!(queue = %self.queue, job_id = %id, "cancel ignored");
            }
        }
        outcome
    }

    pub fn clear(&self, filter: ClearFilter) -> Result<Vec<JobId>> {
        let removed = self.store.clear(filter)?;
        if !removed.is_empty() {
            tracing::debug!(queue = %self.queue, removed = removed.len(), "cleared jobs");
        }
        Ok(removed)
    }

    pub fn snapshot(&self) -> Vec<JobView> {
        self.store.snapshot()
    }

    pub fn get(&self, id: JobId) -> Option<JobView> {
        self.store.get(id)
    }

    pub fn current_job(&self) -> Option<JobView> {
        self.store.current()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// True while any job is Queued, Running or Paused.
    pub fn has_unfinished(&self) -> bool {
        self.store.has_unfinished()
    }

    /// Stops the worker. A running job is terminated and ends Cancelled;
    /// queued jobs stay Queued.
    pub fn shutdown(&self) {
        self.store.shutdown();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(queue = %self.queue, "worker thread panicked");
            }
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The download and conversion queues side by side. They share only the
/// event channel, which tags every event with its queue.
pub struct Engine {
    config: EngineConfig,
    events: EventChannel,
    locator: Arc<dyn ToolLocator>,
    downloads: QueueManager,
    conversions: QueueManager,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let locator = SystemToolLocator::new(config.paths(), config.tool_overrides.clone());
        Self::with_locator(config, Arc::new(locator))
    }

    pub fn with_locator(config: EngineConfig, locator: Arc<dyn ToolLocator>) -> Result<Self> {
        config.validate()?;

        let job_logs = match config.paths() {
            Some(paths) => {
                paths.ensure_dirs()?;
                Some(JobLogs::new(paths.job_logs_dir()))
            }
            None => None,
        };
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let events = EventChannel::new(config.event_capacity);

        let downloads = QueueManager::new(
            QueueKind::Download,
            Arc::new(YtDlpDialect::new(
                config.rate_limit.clone(),
                config.compatibility_mode,
            )),
            Arc::new(YouTubeClassifier),
            Arc::clone(&locator),
            events.clone(),
            QueueSettings {
                capacity: config.download_capacity,
                poll_interval,
                job_logs: job_logs.clone(),
            },
        );
        let conversions = QueueManager::new(
            QueueKind::Conversion,
            Arc::new(FfmpegDialect),
            Arc::new(MediaFileClassifier),
            Arc::clone(&locator),
            events.clone(),
            QueueSettings {
                capacity: config.conversion_capacity,
                poll_interval,
                job_logs,
            },
        );

        Ok(Self {
            config,
            events,
            locator,
            downloads,
            conversions,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn downloads(&self) -> &QueueManager {
        &self.downloads
    }

    pub fn conversions(&self) -> &QueueManager {
        &self.conversions
    }

    pub fn queue(&self, kind: QueueKind) -> &QueueManager {
        match kind {
            QueueKind::Download => &self.downloads,
            QueueKind::Conversion => &self.conversions,
        }
    }

    pub fn enqueue(&self, kind: QueueKind, request: JobRequest) -> Result<JobId> {
        self.queue(kind).enqueue(request)
    }

    /// Lists the playlist with yt-dlp and queues one download per video, all
    /// with the request's output settings. Custom file names do not apply to
    /// a whole playlist and are dropped.
    pub fn enqueue_playlist(&self, request: JobRequest) -> Result<Vec<JobId>> {
        let url = request.source.trim();
        if YouTubeClassifier.classify(url) != SourceKind::YouTubePlaylist {
            return Err(EngineError::Validation(format!("not a playlist URL: {url}")));
        }
        let ytdlp = self.locator.locate(ToolKind::YtDlp)?;
        let entries = playlist::expand_playlist(&ytdlp, url)?;
        if request.file_name.is_some() {
            tracing::debug!(url, "file name ignored for playlist entries");
        }
        tracing::info!(url, entries = entries.len(), "playlist expanded");

        let requests = entries
            .into_iter()
            .map(|entry| JobRequest {
                source: entry,
                file_name: None,
                ..request.clone()
            })
            .collect();
        self.downloads.enqueue_all(requests)
    }

    /// Finds which queue holds `id` and cancels it there.
    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        match self.downloads.cancel(id) {
            CancelOutcome::Unknown => self.conversions.cancel(id),
            outcome => outcome,
        }
    }

    pub fn has_unfinished(&self) -> bool {
        self.downloads.has_unfinished() || self.conversions.has_unfinished()
    }

    pub fn shutdown(&self) {
        self.downloads.shutdown();
        self.conversions.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::SourceKind;
    use crate::dialect::PreparedRun;
    use crate::job::{JobStatus, OutputKind};
    use crate::locate::{StaticToolLocator, ToolKind};
    use std::path::Path;

    struct UnusedDialect;

    impl ToolDialect for UnusedDialect {
        fn tool(&self) -> ToolKind {
            ToolKind::YtDlp
        }

        fn prepare(
            &self,
            _binary: &Path,
            _request: &JobRequest,
            _locator: &dyn ToolLocator,
        ) -> Result<PreparedRun> {
            Err(EngineError::InvalidState("not started in these tests".to_string()))
        }
    }

    struct EverythingIsAVideo;

    impl SourceClassifier for EverythingIsAVideo {
        fn classify(&self, _source: &str) -> SourceKind {
            SourceKind::YouTubeVideo
        }
    }

    fn manager(locator: StaticToolLocator, capacity: usize) -> QueueManager {
        QueueManager::new(
            QueueKind::Download,
            Arc::new(UnusedDialect),
            Arc::new(YouTubeClassifier),
            Arc::new(locator),
            EventChannel::new(16),
            QueueSettings::new(capacity),
        )
    }

    fn ytdlp() -> StaticToolLocator {
        StaticToolLocator::new().with_tool(ToolKind::YtDlp, "/opt/yt-dlp")
    }

    fn request(source: &str) -> JobRequest {
        JobRequest::new(source, OutputKind::Video, "/tmp/downloads")
    }

    #[test]
    fn enqueue_validates_before_creating_a_record() {
        let queue = manager(ytdlp(), 10);
        for source in ["", "   ", "video A", "https://vimeo.com/1"] {
            assert!(
                matches!(queue.enqueue(request(source)), Err(EngineError::Validation(_))),
                "{source:?}"
            );
        }
        let no_destination = JobRequest::new("https://youtu.be/abc", OutputKind::Audio, "");
        assert!(matches!(
            queue.enqueue(no_destination),
            Err(EngineError::Validation(_))
        ));
        assert!(queue.is_empty());
        assert!(queue.events().is_empty());
    }

    #[test]
    fn missing_tool_blocks_enqueue_and_start() {
        let queue = manager(StaticToolLocator::new(), 10);
        assert!(matches!(
            queue.enqueue(request("https://youtu.be/abc")),
            Err(EngineError::ToolMissing { .. })
        ));
        assert!(matches!(queue.start(), Err(EngineError::ToolMissing { .. })));
        assert!(!queue.is_started());
    }

    #[test]
    fn ids_are_distinct_and_order_is_kept() {
        let queue = QueueManager::new(
            QueueKind::Download,
            Arc::new(UnusedDialect),
            Arc::new(EverythingIsAVideo),
            Arc::new(ytdlp()),
            EventChannel::new(16),
            QueueSettings::new(10),
        );
        let ids: Vec<JobId> = (0..5)
            .map(|i| queue.enqueue(request(&format!("video {i}"))).expect("enqueue"))
            .collect();
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(
            queue.snapshot().iter().map(|v| v.id).collect::<Vec<_>>(),
            ids
        );
    }

    #[test]
    fn cancelling_before_start_never_runs_the_job() {
        let queue = manager(ytdlp(), 10);
        let id = queue.enqueue(request("https://youtu.be/abc")).expect("enqueue");
        assert!(matches!(queue.cancel(id), CancelOutcome::Cancelled(_)));

        let view = queue.get(id).expect("view");
        assert_eq!(view.status, JobStatus::Cancelled);
        assert!(view.started_at_ms.is_none());
        assert!(view.output_path.is_none());

        let statuses: Vec<JobStatus> = queue.events().drain().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![JobStatus::Queued, JobStatus::Cancelled]);
        assert_eq!(queue.cancel(id), CancelOutcome::AlreadyTerminal);
    }

    #[test]
    fn capacity_is_enforced() {
        let queue = manager(ytdlp(), 2);
        queue.enqueue(request("https://youtu.be/a")).expect("a");
        queue.enqueue(request("https://youtu.be/b")).expect("b");
        assert!(matches!(
            queue.enqueue(request("https://youtu.be/c")),
            Err(EngineError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn playlist_urls_are_not_queued_as_one_job() {
        let queue = manager(ytdlp(), 10);
        for source in [
            "https://www.youtube.com/playlist?list=PL123",
            "https://www.youtube.com/watch?list=PL123",
        ] {
            assert!(
                matches!(queue.enqueue(request(source)), Err(EngineError::Validation(_))),
                "{source}"
            );
        }
        queue
            .enqueue(request("https://www.youtube.com/watch?v=abc&list=PL123"))
            .expect("video inside a playlist");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_all_rejects_the_whole_batch() {
        let queue = manager(ytdlp(), 3);
        let batch = vec![
            request("https://youtu.be/a"),
            request("https://vimeo.com/1"),
        ];
        assert!(matches!(queue.enqueue_all(batch), Err(EngineError::Validation(_))));
        assert!(queue.is_empty());
        assert!(queue.events().is_empty());

        let too_many = (0..4).map(|i| request(&format!("https://youtu.be/v{i}"))).collect();
        assert!(matches!(
            queue.enqueue_all(too_many),
            Err(EngineError::QueueFull { capacity: 3 })
        ));
        assert!(queue.is_empty());

        let ids = queue
            .enqueue_all(vec![request("https://youtu.be/a"), request("https://youtu.be/b")])
            .expect("batch");
        assert_eq!(queue.snapshot().iter().map(|v| v.id).collect::<Vec<_>>(), ids);
        assert_eq!(queue.events().drain().len(), 2);
    }

    #[test]
    fn start_after_shutdown_runs_queued_jobs_again() {
        let queue = manager(ytdlp(), 10);
        queue.start().expect("start");
        queue.shutdown();
        assert!(!queue.is_started());

        let id = queue.enqueue(request("https://youtu.be/abc")).expect("enqueue");
        queue.start().expect("restart");
        assert!(queue.is_started());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.get(id).is_some_and(|v| !v.status.is_terminal()) {
            assert!(std::time::Instant::now() < deadline, "job never ran after restart");
            std::thread::sleep(Duration::from_millis(10));
        }
        let view = queue.get(id).expect("view");
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("invalid state: not started in these tests"));
    }

    #[test]
    fn engine_refuses_to_expand_non_playlists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::with_locator(
            EngineConfig::default().with_base_dir(dir.path().join("app")),
            Arc::new(ytdlp()),
        )
        .expect("engine");
        assert!(matches!(
            engine.enqueue_playlist(request("https://youtu.be/abc")),
            Err(EngineError::Validation(_))
        ));
        assert!(engine.downloads().is_empty());
    }

    #[test]
    fn engine_routes_cancel_to_the_owning_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip = dir.path().join("clip.mp4");
        std::fs::write(&clip, b"x").expect("clip");
        let locator = StaticToolLocator::new()
            .with_tool(ToolKind::YtDlp, "/opt/yt-dlp")
            .with_tool(ToolKind::Ffmpeg, "/opt/ffmpeg");
        let engine = Engine::with_locator(
            EngineConfig::default().with_base_dir(dir.path().join("app")),
            Arc::new(locator),
        )
        .expect("engine");

        let id = engine
            .enqueue(
                QueueKind::Conversion,
                JobRequest::new(clip.to_string_lossy(), OutputKind::Audio, dir.path()),
            )
            .expect("enqueue");
        assert!(matches!(engine.cancel(id), CancelOutcome::Cancelled(_)));
        assert!(engine.downloads().is_empty());
        assert!(!engine.has_unfinished());
        assert!(dir.path().join("app/logs/jobs").is_dir());
    }
}
