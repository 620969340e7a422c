use macro_engine::ValidationError;
use thiserror::Error;

/// Error types for macro recording
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The session was asked to stop or capture while idle
    #[error("Recorder is not recording")]
    NotRecording,

    #[error("Recorder is already recording")]
    AlreadyRecording,

    /// Nothing convertible was captured
    #[error("No actions were recorded")]
    NothingRecorded,

    /// The converted draft failed macro validation
    #[error("Recorded macro is invalid: {0}")]
    Validation(#[from] ValidationError),

    /// Error when serializing or deserializing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for recorder operations
pub type Result<T> = std::result::Result<T, RecorderError>;
