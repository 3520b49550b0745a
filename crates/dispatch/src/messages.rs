//! Per-query diagnostics shown to the user alongside the query outcome.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use czar_common::{now_ms, ChunkId, QueryId};
use serde::{Deserialize, Serialize};

/// A chunk query failed on its worker.
pub const JOB_ERROR: i32 = 1;
/// No live worker holds the chunk.
pub const MISSING_CHUNK: i32 = 2;
/// The query was cancelled by the user.
pub const CANCELLED: i32 = 3;
/// Merging results failed.
pub const MERGE_FAILED: i32 = 4;
/// Jobs were handed to another UberJob.
pub const RETRY: i32 = 5;
/// The query stopped early because its row limit was satisfied.
pub const ROW_LIMIT: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub chunk_id: Option<ChunkId>,
    pub code: i32,
    pub severity: Severity,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Ordered message log per query.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Mutex<HashMap<QueryId, Vec<QueryMessage>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<QueryId, Vec<QueryMessage>>> {
        match self.messages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(
        &self,
        query_id: QueryId,
        chunk_id: Option<ChunkId>,
        code: i32,
        severity: Severity,
        message: impl Into<String>,
    ) {
        let entry = QueryMessage {
            chunk_id,
            code,
            severity,
            message: message.into(),
            timestamp_ms: now_ms().unwrap_or_default(),
        };
        self.guard().entry(query_id).or_default().push(entry);
    }

    pub fn messages(&self, query_id: QueryId) -> Vec<QueryMessage> {
        self.guard().get(&query_id).cloned().unwrap_or_default()
    }

    pub fn errors(&self, query_id: QueryId) -> Vec<QueryMessage> {
        self.messages(query_id)
            .into_iter()
            .filter(|m| m.severity == Severity::Error)
            .collect()
    }

    pub fn remove(&self, query_id: QueryId) -> Vec<QueryMessage> {
        self.guard().remove(&query_id).unwrap_or_default()
    }
}
