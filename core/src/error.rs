use crate::types::{FaultType, GroupId};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Argument must not be empty: {0}")]
    NullArgument(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Argument out of range: {0}")]
    ArgumentOutOfRange(&'static str),

    #[error("Key already exists")]
    DuplicateKey,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Provider is faulted ({0:?})")]
    Faulted(FaultType),

    #[error("Provider is not readable")]
    NotReadable,

    #[error("Provider is not writable")]
    NotWritable,

    #[error("Replica is not primary")]
    NotPrimary,

    #[error("Non-retryable replication error: {0}")]
    NonRetryable(String),

    #[error("Object is closed")]
    Closed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Short stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NullArgument(_) => "null_argument",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::ArgumentOutOfRange(_) => "argument_out_of_range",
            StoreError::DuplicateKey => "duplicate_key",
            StoreError::KeyNotFound => "key_not_found",
            StoreError::Timeout => "timeout",
            StoreError::Cancelled => "cancelled",
            StoreError::ResourceExhausted(_) => "resource_exhausted",
            StoreError::Faulted(_) => "faulted",
            StoreError::NotReadable => "not_readable",
            StoreError::NotWritable => "not_writable",
            StoreError::NotPrimary => "not_primary",
            StoreError::NonRetryable(_) => "non_retryable",
            StoreError::Closed => "closed",
            StoreError::Storage(_) => "storage",
            StoreError::Serialization(_) => "serialization",
            StoreError::Io(_) => "io",
        }
    }

    /// Errors caused by the caller's arguments, including duplicate and
    /// missing keys.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            StoreError::NullArgument(_)
                | StoreError::InvalidArgument(_)
                | StoreError::ArgumentOutOfRange(_)
                | StoreError::DuplicateKey
                | StoreError::KeyNotFound
        )
    }

    /// Errors that `try_*` variants report as `false` and that make a bulk
    /// operation roll its group back.
    pub fn is_recoverable(&self) -> bool {
        self.is_argument_error() || matches!(self, StoreError::Timeout | StoreError::Cancelled)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors reported by the replication collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("transient replication failure: {0}")]
    Transient(String),

    #[error("replica is not primary")]
    NotPrimary,

    #[error("replicator is closed")]
    Closed,

    #[error("invalid atomic group {0}")]
    InvalidAtomicGroup(GroupId),

    #[error("replication cancelled")]
    Cancelled,
}

impl ReplicationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplicationError::Transient(_))
    }
}

impl From<ReplicationError> for StoreError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::Cancelled => StoreError::Cancelled,
            other => StoreError::NonRetryable(other.to_string()),
        }
    }
}

/// Logs and panics. Used where continuing would corrupt replicated state.
#[track_caller]
pub fn invariant_violation(message: &str) -> ! {
    tracing::error!(message, "invariant violation");
    panic!("invariant violation: {message}");
}
