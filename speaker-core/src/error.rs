use thiserror::Error;

/// All errors produced by speaker-core.
#[derive(Debug, Error)]
pub enum SpeakerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timed out")]
    Timeout,

    #[error("aborted")]
    Aborted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SpeakerError {
    /// A bounded wait expired. The caller may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SpeakerError::Timeout)
    }

    /// Teardown is in progress. The caller should stop retrying.
    pub fn is_aborted(&self) -> bool {
        matches!(self, SpeakerError::Aborted)
    }
}

pub type Result<T> = std::result::Result<T, SpeakerError>;
