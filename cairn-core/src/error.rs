use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Etcd error: {0}")]
    Etcd(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Optimistic update of {key} gave up after {attempts} conflicting attempts")]
    Conflict { key: String, attempts: usize },

    #[error("Lost the lease for task {0}")]
    LeaseLost(String),

    #[error("Insufficient replicas: need {required}, found {found}")]
    InsufficientReplicas { required: usize, found: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<etcd_client::Error> for CairnError {
    fn from(err: etcd_client::Error) -> Self {
        CairnError::Etcd(err.to_string())
    }
}

impl From<redis::RedisError> for CairnError {
    fn from(err: redis::RedisError) -> Self {
        CairnError::Redis(err.to_string())
    }
}

impl From<reqwest::Error> for CairnError {
    fn from(err: reqwest::Error) -> Self {
        CairnError::Http(err.to_string())
    }
}

impl CairnError {
    /// Errors worth retrying locally: store connectivity and version races.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CairnError::Etcd(_) | CairnError::Redis(_) | CairnError::Http(_) | CairnError::Io(_)
        )
    }
}
