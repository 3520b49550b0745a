//! Typed identifiers shared across chunk map, dispatch, and merge components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// First UberJob id handed out; keeps UberJob ids disjoint from per-query job ids.
pub const UBER_JOB_ID_OFFSET: u64 = 1_000_000_000;

/// Attempt multiplier used when packing a [`JobAttemptId`] into one integer.
pub const MAX_ATTEMPTS_PER_JOB: u32 = 1000;

/// Stable user query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QI={}", self.0)
    }
}

/// Identifier of the czar process issuing UberJobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CzarId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for CzarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job identifier, unique within one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk (shard partition) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(
    /// Raw numeric id value.
    pub i64,
);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UberJob identifier, globally unique within one czar process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UberJobId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for UberJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker identity as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One execution attempt of one job.
///
/// Rows merged into the result table are tagged with [`JobAttemptId::encode`] so that rows
/// from a superseded attempt can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobAttemptId {
    /// Job the attempt belongs to.
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl JobAttemptId {
    /// Build an attempt id.
    pub fn new(job_id: JobId, attempt: u32) -> Self {
        Self { job_id, attempt }
    }

    /// Pack into the integer stored in the merge table tag column.
    pub fn encode(&self) -> i64 {
        i64::from(self.job_id.0) * i64::from(MAX_ATTEMPTS_PER_JOB)
            + i64::from(self.attempt % MAX_ATTEMPTS_PER_JOB)
    }
}

impl fmt::Display for JobAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.attempt)
    }
}

/// Process-wide UberJob id source, injected into every executive.
#[derive(Debug)]
pub struct UberJobIdGenerator {
    next: AtomicU64,
}

impl UberJobIdGenerator {
    /// Start handing out ids at [`UBER_JOB_ID_OFFSET`].
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(UBER_JOB_ID_OFFSET),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> UberJobId {
        UberJobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for UberJobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_encoding_is_unique_per_job_and_attempt() {
        let a = JobAttemptId::new(JobId(7), 1).encode();
        let b = JobAttemptId::new(JobId(7), 2).encode();
        let c = JobAttemptId::new(JobId(8), 1).encode();
        assert_eq!(a, 7001);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn uber_job_ids_start_at_offset() {
        let ids = UberJobIdGenerator::new();
        assert_eq!(ids.next_id(), UberJobId(UBER_JOB_ID_OFFSET));
        assert_eq!(ids.next_id(), UberJobId(UBER_JOB_ID_OFFSET + 1));
    }
}
