use blobferry_transfer::TransferError;

/// Errors raised by the concrete backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("invalid part list: {0}")]
    InvalidParts(String),
}

impl BackendError {
    /// Wraps an I/O error with what was being attempted.
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| BackendError::Io { context, source }
    }

    /// Reports this error as a failed source read.
    pub fn into_source_error(self) -> TransferError {
        TransferError::SourceRead(self.to_string())
    }

    /// Reports this error as a failed destination operation.
    pub fn into_sink_error(self) -> TransferError {
        TransferError::DestinationUpload(self.to_string())
    }
}
