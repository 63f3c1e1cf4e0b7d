use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid job request: {0}")]
    Validation(String),

    #[error("external tool is missing: {tool}")]
    ToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {reason}")]
    ToolExecution {
        tool: String,
        code: Option<i32>,
        reason: String,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
