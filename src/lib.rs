pub mod classify;
pub mod cmd;
pub mod config;
pub mod dialect;
mod error;
pub mod events;
pub mod ffmpeg;
pub mod invoker;
pub mod job;
pub mod joblog;
pub mod locate;
pub mod manager;
pub mod paths;
pub mod playlist;
pub mod progress;
mod store;
mod worker;

pub use error::{EngineError, Result};
pub use events::{EventChannel, EventKind, JobEvent};
pub use job::{JobId, JobRequest, JobStatus, JobView, OutputKind, QueueKind};
pub use manager::{Engine, QueueManager, QueueSettings};
pub use store::{CancelOutcome, ClearFilter};
