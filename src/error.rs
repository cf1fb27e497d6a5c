use thiserror::Error;

/// Classification of a failure reported by a remote collaborator
/// (object storage or the metadata registration endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection refused/reset, DNS failure, broken pipe.
    Network,
    /// Request or connect timeout.
    Timeout,
    /// The service asked us to slow down.
    Throttled,
    /// 5xx from the service.
    Server,
    /// Credentials rejected or access denied.
    Permission,
    /// Storage quota or object size limit exceeded.
    Quota,
    /// The multipart upload (or object) no longer exists.
    NotFound,
    /// The service disagrees with the parts we submitted.
    InvalidPart,
    /// Any other non-retryable rejection.
    Rejected,
}

impl RemoteErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Network
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::Throttled
                | RemoteErrorKind::Server
        )
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            RemoteErrorKind::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            RemoteErrorKind::Network
        } else if let Some(status) = err.status() {
            RemoteErrorKind::from_status(status.as_u16())
        } else {
            RemoteErrorKind::Rejected
        };
        Self::new(kind, err.to_string())
    }
}

impl RemoteErrorKind {
    /// Maps an HTTP status code onto a failure class.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => RemoteErrorKind::Permission,
            404 => RemoteErrorKind::NotFound,
            408 => RemoteErrorKind::Timeout,
            413 | 507 => RemoteErrorKind::Quota,
            429 | 503 => RemoteErrorKind::Throttled,
            500..=599 => RemoteErrorKind::Server,
            _ => RemoteErrorKind::Rejected,
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Multipart initialization failed: {0}")]
    Initialization(RemoteError),

    #[error("Chunk {part_number} failed after {attempts} attempts: {source}")]
    ChunkUpload {
        part_number: u32,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("Completion rejected, local ledger disagrees with storage: {0}")]
    CompletionMismatch(String),

    #[error("Upload cannot be recovered and must restart: {0}")]
    UnrecoverableUpload(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Object uploaded but registration failed: {0}")]
    Finalization(RemoteError),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Invalid chunk transition for part {part_number}: {from} -> {to}")]
    InvalidTransition {
        part_number: u32,
        from: String,
        to: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Source file does not match the persisted upload: {0}")]
    SourceMismatch(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Ledger persistence error: {0}")]
    Persistence(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl From<sqlx::Error> for UploadError {
    fn from(err: sqlx::Error) -> Self {
        UploadError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::Persistence(err.to_string())
    }
}

/// What the user should be told, grouped by the corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Permission,
    Quota,
    Network,
    Timeout,
    Integrity,
    Other,
}

impl FailureCategory {
    pub fn user_message(self) -> &'static str {
        match self {
            FailureCategory::Permission => {
                "You do not have permission to upload here. Please contact support."
            }
            FailureCategory::Quota => {
                "Storage quota exceeded. Free some space or contact support."
            }
            FailureCategory::Network => {
                "Network connection lost. Check your connection and resume the upload."
            }
            FailureCategory::Timeout => {
                "The server took too long to respond. Wait a moment and retry."
            }
            FailureCategory::Integrity => {
                "The file could not be processed. Please re-select it and upload again."
            }
            FailureCategory::Other => "The upload failed. Please try again.",
        }
    }
}

impl From<RemoteErrorKind> for FailureCategory {
    fn from(kind: RemoteErrorKind) -> Self {
        match kind {
            RemoteErrorKind::Permission => FailureCategory::Permission,
            RemoteErrorKind::Quota => FailureCategory::Quota,
            RemoteErrorKind::Network | RemoteErrorKind::Server => FailureCategory::Network,
            RemoteErrorKind::Timeout | RemoteErrorKind::Throttled => FailureCategory::Timeout,
            RemoteErrorKind::NotFound | RemoteErrorKind::InvalidPart => FailureCategory::Integrity,
            RemoteErrorKind::Rejected => FailureCategory::Other,
        }
    }
}

impl UploadError {
    pub fn category(&self) -> FailureCategory {
        match self {
            UploadError::Initialization(e)
            | UploadError::Finalization(e)
            | UploadError::Remote(e)
            | UploadError::ChunkUpload { source: e, .. } => e.kind.into(),
            UploadError::CompletionMismatch(_)
            | UploadError::UnrecoverableUpload(_)
            | UploadError::Decryption(_)
            | UploadError::SourceMismatch(_) => FailureCategory::Integrity,
            _ => FailureCategory::Other,
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.category().user_message()
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
