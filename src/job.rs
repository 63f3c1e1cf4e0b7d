use crate::progress::ProgressUpdate;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique job identifier. Ids come from one counter shared by every
/// queue and are never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Download,
    Conversion,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Download => "download",
            QueueKind::Conversion => "conversion",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// MP4 container, H.264 video + AAC audio.
    Video,
    /// MP3 audio only.
    Audio,
}

impl OutputKind {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputKind::Video => "mp4",
            OutputKind::Audio => "mp3",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "mp4" => Ok(OutputKind::Video),
            "audio" | "mp3" => Ok(OutputKind::Audio),
            other => Err(EngineError::Validation(format!(
                "unknown output kind: {other:?} (expected video/mp4 or audio/mp3)"
            ))),
        }
    }
}

/// What the foreground asks for. Never modified once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// URL for downloads, file path for conversions.
    pub source: String,
    pub output: OutputKind,
    pub destination: PathBuf,
    /// Optional output file stem; made unique inside `destination`.
    pub file_name: Option<String>,
    /// Force a re-encode to the most widely playable codecs.
    pub compatibility: bool,
}

impl JobRequest {
    pub fn new(source: impl Into<String>, output: OutputKind, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output,
            destination: destination.into(),
            file_name: None,
            compatibility: false,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_compatibility(mut self, compatibility: bool) -> Self {
        self.compatibility = compatibility;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the job state graph. Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live, mutable state of one job. Owned by its queue's store; only the
/// worker loop mutates it, apart from the cancel-requested flag.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub(crate) id: JobId,
    pub(crate) queue: QueueKind,
    pub(crate) request: JobRequest,
    pub(crate) status: JobStatus,
    pub(crate) progress: f32,
    pub(crate) rate: Option<String>,
    pub(crate) eta_secs: Option<u64>,
    pub(crate) error: Option<String>,
    pub(crate) output_path: Option<PathBuf>,
    pub(crate) cancel_requested: bool,
    pub(crate) created_at_ms: i64,
    pub(crate) started_at_ms: Option<i64>,
    pub(crate) finished_at_ms: Option<i64>,
}

impl JobRecord {
    pub(crate) fn new(queue: QueueKind, request: JobRequest) -> Self {
        Self {
            id: JobId::next(),
            queue,
            request,
            status: JobStatus::Queued,
            progress: 0.0,
            rate: None,
            eta_secs: None,
            error: None,
            output_path: None,
            cancel_requested: false,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        if next.is_terminal() {
            self.finished_at_ms = Some(now_ms());
            self.rate = None;
            self.eta_secs = None;
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.progress = 0.0;
        self.rate = None;
        self.eta_secs = None;
        self.started_at_ms = Some(now_ms());
        Ok(())
    }

    pub(crate) fn complete(&mut self, output_path: PathBuf) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100.0;
        self.output_path = Some(output_path);
        Ok(())
    }

    pub(crate) fn fail(&mut self, reason: String) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(reason);
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        self.transition(JobStatus::Cancelled)
    }

    /// Applies a progress update while Running. Percent never goes backwards.
    /// Returns false when the update was ignored.
    pub(crate) fn apply_progress(&mut self, update: &ProgressUpdate) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let percent = if update.percent.is_finite() {
            update.percent.clamp(0.0, 100.0)
        } else {
            self.progress
        };
        self.progress = self.progress.max(percent);
        if update.rate.is_some() {
            self.rate = update.rate.clone();
        }
        if update.eta_secs.is_some() {
            self.eta_secs = update.eta_secs;
        }
        true
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            queue: self.queue,
            source: self.request.source.clone(),
            output: self.request.output,
            status: self.status,
            progress: self.progress,
            rate: self.rate.clone(),
            eta_secs: self.eta_secs,
            error: self.error.clone(),
            output_path: self.output_path.clone(),
            cancel_requested: self.cancel_requested,
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            finished_at_ms: self.finished_at_ms,
        }
    }
}

/// Read-only copy of a job for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub queue: QueueKind,
    pub source: String,
    pub output: OutputKind,
    pub status: JobStatus,
    pub progress: f32,
    pub rate: Option<String>,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub cancel_requested: bool,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

pub(crate) fn now_ms() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as i64
}
