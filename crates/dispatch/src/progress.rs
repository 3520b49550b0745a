//! Unfinished-job counts over time, per query.
//!
//! A sample is appended only when the count changes. Untracking a query moves its history to
//! a bounded archive, oldest entries evicted first.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use czar_common::{CzarError, QueryId, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub timestamp_ms: u64,
    pub unfinished_jobs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProgress {
    pub query_id: QueryId,
    pub samples: Vec<ProgressSample>,
}

#[derive(Debug, Default)]
struct Histories {
    active: BTreeMap<QueryId, Vec<ProgressSample>>,
    archive: VecDeque<QueryProgress>,
}

#[derive(Debug)]
pub struct QueryProgressHistory {
    archive_limit: usize,
    inner: Mutex<Histories>,
}

impl QueryProgressHistory {
    pub fn new(archive_limit: usize) -> Self {
        Self {
            archive_limit,
            inner: Mutex::new(Histories::default()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Histories> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record `unfinished_jobs` at `timestamp_ms`. Returns false when the count did not change.
    pub fn record(&self, query_id: QueryId, timestamp_ms: u64, unfinished_jobs: usize) -> bool {
        let mut inner = self.guard();
        let samples = inner.active.entry(query_id).or_default();
        if samples.last().is_some_and(|s| s.unfinished_jobs == unfinished_jobs) {
            return false;
        }
        samples.push(ProgressSample {
            timestamp_ms,
            unfinished_jobs,
        });
        true
    }

    pub fn history(&self, query_id: QueryId) -> Option<Vec<ProgressSample>> {
        let inner = self.guard();
        if let Some(samples) = inner.active.get(&query_id) {
            return Some(samples.clone());
        }
        inner
            .archive
            .iter()
            .find(|p| p.query_id == query_id)
            .map(|p| p.samples.clone())
    }

    /// Stop tracking `query_id` and archive its history.
    pub fn untrack(&self, query_id: QueryId) -> bool {
        let mut inner = self.guard();
        let Some(samples) = inner.active.remove(&query_id) else {
            return false;
        };
        inner.archive.push_back(QueryProgress { query_id, samples });
        while inner.archive.len() > self.archive_limit {
            inner.archive.pop_front();
        }
        true
    }

    pub fn active_queries(&self) -> Vec<QueryId> {
        self.guard().active.keys().copied().collect()
    }

    /// Active and archived histories as JSON.
    pub fn to_json(&self) -> Result<String> {
        let inner = self.guard();
        let mut all = inner
            .active
            .iter()
            .map(|(query_id, samples)| QueryProgress {
                query_id: *query_id,
                samples: samples.clone(),
            })
            .collect::<Vec<_>>();
        all.extend(inner.archive.iter().cloned());
        serde_json::to_string(&all)
            .map_err(|e| CzarError::Dispatch(format!("progress history encode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_only_on_change() {
        let history = QueryProgressHistory::new(10);
        let q = QueryId(1);
        assert!(history.record(q, 100, 5));
        assert!(!history.record(q, 200, 5));
        assert!(history.record(q, 300, 3));
        assert!(history.record(q, 400, 0));
        let samples = history.history(q).expect("tracked");
        assert_eq!(
            samples.iter().map(|s| s.unfinished_jobs).collect::<Vec<_>>(),
            vec![5, 3, 0]
        );
        assert_eq!(samples[1].timestamp_ms, 300);
    }

    #[test]
    fn archive_is_bounded() {
        let history = QueryProgressHistory::new(2);
        for id in 1..=3 {
            history.record(QueryId(id), id * 10, 1);
            assert!(history.untrack(QueryId(id)));
        }
        assert!(!history.untrack(QueryId(3)));
        assert!(history.history(QueryId(1)).is_none());
        assert!(history.history(QueryId(2)).is_some());
        assert!(history.active_queries().is_empty());

        let json = history.to_json().expect("json");
        let parsed: Vec<QueryProgress> = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].query_id, QueryId(3));
    }
}
