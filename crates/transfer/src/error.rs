//! Transfer error types.

use crate::types::Phase;

/// Errors produced by the transfer engine and its collaborators.
///
/// `ObjectSource` and `MultipartSink` implementations report their failures
/// as [`TransferError::SourceRead`] and [`TransferError::DestinationUpload`]
/// respectively.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("source read failed: {0}")]
    SourceRead(String),

    #[error("staging write failed: {0}")]
    StagingWrite(String),

    #[error("staging read failed: {0}")]
    StagingRead(String),

    #[error("destination upload failed: {0}")]
    DestinationUpload(String),

    #[error("size mismatch: staged {expected} bytes, destination reports {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch: staged {expected}, destination reports {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl TransferError {
    /// Returns `true` for failures worth retrying at the chunk/part level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::SourceRead(_) | TransferError::DestinationUpload(_)
        )
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Configuration(_) => "ConfigurationError",
            TransferError::SourceRead(_) => "SourceReadError",
            TransferError::StagingWrite(_) => "StagingWriteError",
            TransferError::StagingRead(_) => "StagingReadError",
            TransferError::DestinationUpload(_) => "DestinationUploadError",
            TransferError::SizeMismatch { .. } => "SizeMismatchError",
            TransferError::DigestMismatch { .. } => "DigestMismatchError",
            TransferError::Unexpected(_) => "UnexpectedError",
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        TransferError::Unexpected(format!("worker task failed: {e}"))
    }
}

/// Terminal failure of a transfer job: the phase that failed and why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{phase} phase failed: {error}")]
pub struct JobError {
    pub phase: Phase,
    #[source]
    pub error: TransferError,
}

impl JobError {
    pub fn new(phase: Phase, error: TransferError) -> Self {
        Self { phase, error }
    }
}
