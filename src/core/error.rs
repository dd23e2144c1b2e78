use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid card: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version contention on {family}: gave up after {attempts} attempts")]
    Contention { family: String, attempts: u32 },

    #[error("Registry invariant violated: {0}")]
    Conflict(String),

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: String,
        message: String,
        transient: bool,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Artifact decode failed: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Invalid version: {0} (must be valid semver: e.g., 1.0.0)")]
    InvalidVersion(#[from] semver::Error),

    #[error("Tracking store error: {0}")]
    Tracking(#[from] rusqlite::Error),
}

impl RegistryError {
    /// Storage failure that a retry might clear
    pub fn transient(path: impl Into<String>, message: impl Into<String>) -> Self {
        RegistryError::Storage {
            path: path.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Storage failure that retrying will not fix
    pub fn storage(path: impl Into<String>, message: impl Into<String>) -> Self {
        RegistryError::Storage {
            path: path.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Attach the family and version a failed payload write was for
    ///
    /// Storage and I/O failures become `Storage` errors whose message names
    /// both; other errors pass through unchanged.
    pub fn for_version(self, family: &str, version: &semver::Version, path: &str) -> Self {
        match self {
            RegistryError::Storage {
                path,
                message,
                transient,
            } => RegistryError::Storage {
                path,
                message: format!("{} v{}: {}", family, version, message),
                transient,
            },
            err @ RegistryError::Io(_) => RegistryError::Storage {
                path: path.to_string(),
                message: format!("{} v{}: {}", family, version, err),
                transient: err.is_retryable(),
            },
            other => other,
        }
    }

    /// Whether an internal retry loop may try the operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Storage { transient, .. } => *transient,
            RegistryError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            RegistryError::Tracking(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether a caller may retry the whole operation with its own backoff
    pub fn is_caller_retryable(&self) -> bool {
        matches!(self, RegistryError::Contention { .. }) || self.is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
