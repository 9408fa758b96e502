use parcel_types::{ErrorBody, ErrorCode};

/// Errors produced anywhere in a transfer.
///
/// `Transient` and `Integrity` are the only retryable kinds; everything else
/// ends the operation it affects.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("incomplete upload: received {received} of {expected} chunks")]
    IncompleteUpload { received: u32, expected: u32 },

    #[error("missing chunk {0}")]
    MissingChunk(u32),

    #[error("empty upload")]
    EmptyUpload,

    #[error("network error: {0}")]
    Transient(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer hung: no progress after {polls} polls")]
    Hung { polls: u32 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the failed attempt may be repeated with the same payload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Integrity(_))
    }

    /// Wire code for this error. Client-only kinds report as internal.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Integrity(_) => ErrorCode::Integrity,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::IncompleteUpload { .. } => ErrorCode::IncompleteUpload,
            Self::MissingChunk(_) => ErrorCode::MissingChunk,
            Self::EmptyUpload => ErrorCode::EmptyUpload,
            Self::Transient(_)
            | Self::Cancelled
            | Self::Hung { .. }
            | Self::Internal(_)
            | Self::Io(_) => ErrorCode::Internal,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let (chunk_index, received, expected) = match self {
            Self::IncompleteUpload { received, expected } => (None, Some(*received), Some(*expected)),
            Self::MissingChunk(index) => (Some(*index), None, None),
            _ => (None, None, None),
        };
        ErrorBody {
            error: self.code(),
            message: self.detail(),
            chunk_index,
            received,
            expected,
        }
    }

    /// Message without the kind prefix; `from_body` puts the prefix back.
    fn detail(&self) -> String {
        match self {
            Self::Validation(m)
            | Self::Integrity(m)
            | Self::NotFound(m)
            | Self::Transient(m)
            | Self::Internal(m) => m.clone(),
            _ => self.to_string(),
        }
    }

    /// Rebuild an error from a server error body.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.error {
            ErrorCode::Validation => Self::Validation(body.message),
            ErrorCode::Integrity => Self::Integrity(body.message),
            ErrorCode::NotFound => Self::NotFound(body.message),
            ErrorCode::IncompleteUpload => Self::IncompleteUpload {
                received: body.received.unwrap_or_default(),
                expected: body.expected.unwrap_or_default(),
            },
            ErrorCode::MissingChunk => Self::MissingChunk(body.chunk_index.unwrap_or_default()),
            ErrorCode::EmptyUpload => Self::EmptyUpload,
            ErrorCode::Internal => Self::Internal(body.message),
        }
    }
}
