use thiserror::Error;

/// Errors that can occur in tributary-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("capture setup failed: {0}")]
    CaptureSetup(String),

    #[error("failed to apply change {sequence_id}: {message}")]
    Apply { sequence_id: u64, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid log table descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("relation '{0}' is not under change capture")]
    NotCaptured(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error aborts the current replicate/report invocation
    /// rather than failing a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::CaptureSetup(_) | Error::NotCaptured(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
