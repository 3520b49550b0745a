use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical czar error taxonomy used across crates.
///
/// Classification guidance:
/// - structural failures ([`CzarError::ChunkMap`], [`CzarError::AttemptsExhausted`]) fail the query
/// - transient failures ([`CzarError::Transport`], [`CzarError::SqlConnection`]) are retried up
///   to a bounded count before being escalated
/// - [`CzarError::ResultTooLarge`] is resource exhaustion and is never retried
/// - [`CzarError::Cancelled`] is reported separately from failures
#[derive(Debug, Error)]
pub enum CzarError {
    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Chunk map construction or verification failed.
    ///
    /// Examples:
    /// - a chunk without an assigned shared-scan worker
    /// - a chunk discovered on a worker but missing from the final map
    #[error("chunk map error: {0}")]
    ChunkMap(String),

    /// No valid family/chunk map is available yet for routing.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Dispatch bookkeeping failures (unknown job, bad state, poisoned lock).
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Worker communication failures; the affected UberJob is re-batched.
    #[error("transport error: {0}")]
    Transport(String),

    /// Result database connection failure; retried with reconnects.
    #[error("sql connection error: {0}")]
    SqlConnection(String),

    /// Result database statement failure.
    #[error("sql error: {0}")]
    SqlStatement(String),

    /// Row batch decode or merge-table shape failures.
    #[error("merge error: {0}")]
    Merge(String),

    /// Accumulated result bytes exceeded the configured cap.
    #[error("result too large: {size} bytes exceeds limit of {limit} bytes")]
    ResultTooLarge {
        /// Bytes that would have been accumulated with the rejected batch.
        size: u64,
        /// Configured maximum result table size.
        limit: u64,
    },

    /// A job was resolved more times than allowed.
    #[error("attempts exhausted: {0}")]
    AttemptsExhausted(String),

    /// The query was cancelled by the user or by the czar.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Valid request for a shape the core does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error class driving retry/abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Query-level failure; not retried.
    Fatal,
    /// Retried automatically up to a bounded count.
    Transient,
    /// Merge size cap exceeded; not retried.
    ResourceExhausted,
    /// User or czar initiated cancellation.
    Cancelled,
}

impl CzarError {
    /// Classify this error for retry/abort handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            CzarError::Transport(_) | CzarError::SqlConnection(_) => ErrorClass::Transient,
            CzarError::ResultTooLarge { .. } => ErrorClass::ResourceExhausted,
            CzarError::Cancelled(_) => ErrorClass::Cancelled,
            _ => ErrorClass::Fatal,
        }
    }

    /// True for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Cloneable snapshot suitable for storing in query-scoped state.
    pub fn to_query_error(&self) -> QueryError {
        QueryError {
            class: self.class(),
            message: self.to_string(),
        }
    }
}

/// Query-scoped error object shared between the merge and dispatch paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// Error class.
    pub class: ErrorClass,
    /// Human-readable message.
    pub message: String,
}

/// Standard czar result alias.
pub type Result<T> = std::result::Result<T, CzarError>;
