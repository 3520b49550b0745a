//! Replication-system snapshot shapes.
//!
//! The registry reports chunk placement as
//! `{worker -> {db -> {table -> [[chunk_id, size_bytes], ...]}}}`.

use std::collections::{BTreeMap, BTreeSet};

use czar_common::{CzarError, Result, WorkerId};
use serde::{Deserialize, Serialize};

/// `{db -> {table -> [(chunk_id, size_bytes)]}}` for one worker.
pub type WorkerTables = BTreeMap<String, BTreeMap<String, Vec<(i64, i64)>>>;

/// Flattened chunk inventory of every worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkInventory {
    pub workers: BTreeMap<WorkerId, WorkerTables>,
}

/// One `(worker, db, table, chunk, size)` tuple of the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRow<'a> {
    pub worker_id: &'a WorkerId,
    pub db: &'a str,
    pub table: &'a str,
    pub chunk_id: i64,
    pub size_bytes: i64,
}

impl ChunkInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk replica.
    pub fn insert(
        &mut self,
        worker_id: impl Into<WorkerId>,
        db: &str,
        table: &str,
        chunk_id: i64,
        size_bytes: i64,
    ) {
        self.workers
            .entry(worker_id.into())
            .or_default()
            .entry(db.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .push((chunk_id, size_bytes));
    }

    /// Iterate every tuple, optionally restricted to a set of databases.
    pub fn rows<'a>(
        &'a self,
        dbs: Option<&'a BTreeSet<String>>,
    ) -> impl Iterator<Item = InventoryRow<'a>> + 'a {
        self.workers.iter().flat_map(move |(worker_id, by_db)| {
            by_db
                .iter()
                .filter(move |(db, _)| dbs.map_or(true, |set| set.contains(*db)))
                .flat_map(move |(db, by_table)| {
                    by_table.iter().flat_map(move |(table, chunks)| {
                        chunks.iter().map(move |(chunk_id, size_bytes)| InventoryRow {
                            worker_id,
                            db,
                            table,
                            chunk_id: *chunk_id,
                            size_bytes: *size_bytes,
                        })
                    })
                })
        })
    }

    /// Every database name mentioned by any worker.
    pub fn databases(&self) -> BTreeSet<String> {
        self.workers
            .values()
            .flat_map(|by_db| by_db.keys().cloned())
            .collect()
    }
}

/// Versioned inventory as returned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkInventorySnapshot {
    /// Replication update time; a map is rebuilt only for newer snapshots.
    pub update_time_ms: u64,
    pub workers: ChunkInventory,
}

impl ChunkInventorySnapshot {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| CzarError::InvalidConfig(format!("chunk inventory parse failed: {e}")))
    }
}

/// Database families: databases partitioned identically share one chunk map.
///
/// Databases that are not listed form a family of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyLayout {
    pub families: BTreeMap<String, BTreeSet<String>>,
}

impl FamilyLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_family(mut self, family: &str, dbs: &[&str]) -> Self {
        self.families.insert(
            family.to_string(),
            dbs.iter().map(|db| db.to_string()).collect(),
        );
        self
    }

    /// Family name for `db`.
    pub fn family_of(&self, db: &str) -> String {
        self.families
            .iter()
            .find(|(_, dbs)| dbs.contains(db))
            .map(|(family, _)| family.clone())
            .unwrap_or_else(|| db.to_string())
    }

    /// Resolve families for every database in `dbs`, including implicit ones.
    pub fn resolve(&self, dbs: &BTreeSet<String>) -> BTreeMap<String, BTreeSet<String>> {
        let mut out = self.families.clone();
        for db in dbs {
            let family = self.family_of(db);
            out.entry(family).or_default().insert(db.clone());
        }
        out
    }
}
