//! Error types for service replication.

use thiserror::Error;

/// Errors that can occur while replicating services between clusters.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Resource version conflict on update.
    #[error("Conflict updating {kind}/{name}: {cause}")]
    Conflict {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Error cause.
        cause: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The source cluster exposes a resource representation this tool cannot replicate.
    #[error("Unsupported cluster representation: {0}")]
    UnsupportedRepresentation(String),

    /// Watch stream error.
    #[error("Watch error: {0}")]
    Watch(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A cluster call made while applying a pair failed.
    #[error("{action}: {source}")]
    Apply {
        /// What was being attempted.
        action: String,
        /// Underlying failure.
        #[source]
        source: Box<SyncError>,
    },
}

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether the error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFound { .. } => true,
            SyncError::Kube(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    /// Whether the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Conflict { .. } => true,
            SyncError::Kube(kube::Error::Api(err)) => err.code == 409 && err.reason == "Conflict",
            _ => false,
        }
    }

    /// Whether a create failed because the object is already there.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            SyncError::Kube(kube::Error::Api(err)) if err.code == 409 && err.reason == "AlreadyExists"
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}
