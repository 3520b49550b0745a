//! Immutable chunk-to-worker map for one database family.
//!
//! Build steps:
//! 1. index every `(worker, db, table, chunk, size)` tuple by chunk and by worker;
//! 2. sum table sizes into each chunk's total;
//! 3. order chunks largest first (ties by ascending chunk id);
//! 4. give each chunk to the holder with the smallest running shared-scan total;
//! 5. verify the result, rejecting the whole map on any structural violation.
//!
//! Worker references held by chunks are ids resolved through the map, never pointers.

use std::collections::{BTreeMap, BTreeSet};

use czar_common::{ChunkId, CzarError, Result, WorkerId};
use tracing::{debug, warn};

use crate::inventory::ChunkInventory;

/// One chunk and everything the czar needs to route it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    pub chunk_id: ChunkId,
    /// Sum of all table sizes of this chunk.
    pub total_bytes: i64,
    /// Size per `(db, table)`.
    pub table_sizes: BTreeMap<(String, String), i64>,
    /// Workers holding a replica.
    pub workers: BTreeSet<WorkerId>,
    /// Worker responsible for shared scans of this chunk.
    pub primary_scan_worker: Option<WorkerId>,
}

impl ChunkEntry {
    fn new(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            total_bytes: 0,
            table_sizes: BTreeMap::new(),
            workers: BTreeSet::new(),
            primary_scan_worker: None,
        }
    }
}

/// One worker's replicas and shared-scan assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEntry {
    pub worker_id: WorkerId,
    pub chunk_ids: BTreeSet<ChunkId>,
    pub shared_scan_chunks: BTreeSet<ChunkId>,
    /// Always the byte sum of `shared_scan_chunks`.
    pub shared_scan_total_bytes: i64,
}

impl WorkerEntry {
    fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            chunk_ids: BTreeSet::new(),
            shared_scan_chunks: BTreeSet::new(),
            shared_scan_total_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Chunk and worker index for one family. Read-only once built.
pub struct ChunkMap {
    chunks: BTreeMap<ChunkId, ChunkEntry>,
    workers: BTreeMap<WorkerId, WorkerEntry>,
}

impl ChunkMap {
    /// Build and verify a map from the given inventory, restricted to `dbs` when provided.
    pub fn build(inventory: &ChunkInventory, dbs: Option<&BTreeSet<String>>) -> Result<Self> {
        let mut map = ChunkMap::default();
        for row in inventory.rows(dbs) {
            map.index_replica(
                row.worker_id,
                row.db,
                row.table,
                ChunkId(row.chunk_id),
                row.size_bytes,
            );
        }
        for chunk in map.chunks.values_mut() {
            chunk.total_bytes = chunk.table_sizes.values().sum();
        }

        let mut order = map
            .chunks
            .values()
            .map(|c| (c.chunk_id, c.total_bytes))
            .collect::<Vec<_>>();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        for (chunk_id, bytes) in order {
            let candidates = map
                .chunks
                .get(&chunk_id)
                .map(|c| c.workers.clone())
                .unwrap_or_default();
            let assigned = assign_shared_scan(&mut map.workers, chunk_id, bytes, &candidates)?;
            if let Some(chunk) = map.chunks.get_mut(&chunk_id) {
                chunk.primary_scan_worker = Some(assigned);
            }
        }

        map.verify()?;
        debug!(
            chunks = map.chunks.len(),
            workers = map.workers.len(),
            operator = "ChunkMapBuild",
            "chunk map built"
        );
        Ok(map)
    }

    fn index_replica(
        &mut self,
        worker_id: &WorkerId,
        db: &str,
        table: &str,
        chunk_id: ChunkId,
        size_bytes: i64,
    ) {
        let chunk = self
            .chunks
            .entry(chunk_id)
            .or_insert_with(|| ChunkEntry::new(chunk_id));
        let key = (db.to_string(), table.to_string());
        match chunk.table_sizes.get(&key) {
            Some(existing) if *existing != size_bytes => {
                warn!(
                    chunk_id = %chunk_id,
                    db,
                    table,
                    worker_id = %worker_id,
                    kept = *existing,
                    reported = size_bytes,
                    operator = "ChunkMapBuild",
                    "chunk table size mismatch between replicas; keeping first value"
                );
            }
            Some(_) => {}
            None => {
                chunk.table_sizes.insert(key, size_bytes);
            }
        }
        chunk.workers.insert(worker_id.clone());
        self.workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerEntry::new(worker_id.clone()))
            .chunk_ids
            .insert(chunk_id);
    }

    /// Structural checks; any violation invalidates the whole map.
    pub fn verify(&self) -> Result<()> {
        for (chunk_id, chunk) in &self.chunks {
            let Some(primary) = &chunk.primary_scan_worker else {
                return Err(CzarError::ChunkMap(format!(
                    "chunk {chunk_id} has no shared scan worker"
                )));
            };
            if !chunk.workers.contains(primary) {
                return Err(CzarError::ChunkMap(format!(
                    "chunk {chunk_id} scan worker {primary} does not hold the chunk"
                )));
            }
            let in_scan_set = self
                .workers
                .get(primary)
                .is_some_and(|w| w.shared_scan_chunks.contains(chunk_id));
            if !in_scan_set {
                return Err(CzarError::ChunkMap(format!(
                    "chunk {chunk_id} missing from shared scan set of worker {primary}"
                )));
            }
        }
        for worker in self.workers.values() {
            if let Some(orphan) = worker
                .chunk_ids
                .iter()
                .find(|id| !self.chunks.contains_key(*id))
            {
                return Err(CzarError::ChunkMap(format!(
                    "chunk {orphan} reported by worker {} is missing from the chunk map",
                    worker.worker_id
                )));
            }
            let mut expected = 0_i64;
            for id in &worker.shared_scan_chunks {
                let chunk = self.chunks.get(id).ok_or_else(|| {
                    CzarError::ChunkMap(format!(
                        "worker {} scans unknown chunk {id}",
                        worker.worker_id
                    ))
                })?;
                if chunk.primary_scan_worker.as_ref() != Some(&worker.worker_id) {
                    return Err(CzarError::ChunkMap(format!(
                        "chunk {id} scanned by both {} and {:?}",
                        worker.worker_id, chunk.primary_scan_worker
                    )));
                }
                expected += chunk.total_bytes;
            }
            if expected != worker.shared_scan_total_bytes {
                return Err(CzarError::ChunkMap(format!(
                    "worker {} shared scan total {} != {}",
                    worker.worker_id, worker.shared_scan_total_bytes, expected
                )));
            }
        }
        Ok(())
    }

    pub fn chunk(&self, chunk_id: ChunkId) -> Option<&ChunkEntry> {
        self.chunks.get(&chunk_id)
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<&WorkerEntry> {
        self.workers.get(worker_id)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ChunkEntry> {
        self.chunks.values()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.values()
    }

    pub fn primary_scan_worker(&self, chunk_id: ChunkId) -> Option<&WorkerId> {
        self.chunks
            .get(&chunk_id)
            .and_then(|c| c.primary_scan_worker.as_ref())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Give `chunk_id` to the candidate with the smallest shared-scan total (ties by worker id).
fn assign_shared_scan(
    workers: &mut BTreeMap<WorkerId, WorkerEntry>,
    chunk_id: ChunkId,
    bytes: i64,
    candidates: &BTreeSet<WorkerId>,
) -> Result<WorkerId> {
    let chosen = candidates
        .iter()
        .filter_map(|id| workers.get(id).map(|w| (w.shared_scan_total_bytes, id)))
        .min_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(b.1)))
        .map(|(_, id)| id.clone())
        .ok_or_else(|| CzarError::ChunkMap(format!("chunk {chunk_id} has no holding worker")))?;
    let worker = workers
        .get_mut(&chosen)
        .ok_or_else(|| CzarError::ChunkMap(format!("worker {chosen} vanished during build")))?;
    worker.shared_scan_chunks.insert(chunk_id);
    worker.shared_scan_total_bytes += bytes;
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(rows: &[(&str, &str, &str, i64, i64)]) -> ChunkInventory {
        let mut inv = ChunkInventory::new();
        for (w, db, table, chunk, size) in rows {
            inv.insert(*w, db, table, *chunk, *size);
        }
        inv
    }

    #[test]
    fn every_chunk_gets_exactly_one_holding_scan_worker() {
        let inv = inventory(&[
            ("w1", "db", "Object", 1, 100),
            ("w2", "db", "Object", 1, 100),
            ("w2", "db", "Object", 2, 50),
            ("w3", "db", "Object", 2, 50),
            ("w3", "db", "Object", 3, 10),
            ("w1", "db", "Source", 3, 5),
        ]);
        let map = ChunkMap::build(&inv, None).expect("build");
        assert_eq!(map.len(), 3);
        for chunk in map.chunks() {
            let primary = chunk.primary_scan_worker.as_ref().expect("assigned");
            assert!(chunk.workers.contains(primary));
            let scanning = map
                .workers()
                .filter(|w| w.shared_scan_chunks.contains(&chunk.chunk_id))
                .count();
            assert_eq!(scanning, 1);
        }
        assert_eq!(map.chunk(ChunkId(3)).expect("chunk 3").total_bytes, 15);
    }

    #[test]
    fn largest_chunks_are_spread_across_holders() {
        let inv = inventory(&[
            ("w1", "db", "t", 1, 1000),
            ("w2", "db", "t", 1, 1000),
            ("w1", "db", "t", 2, 900),
            ("w2", "db", "t", 2, 900),
            ("w1", "db", "t", 3, 10),
            ("w2", "db", "t", 3, 10),
        ]);
        let map = ChunkMap::build(&inv, None).expect("build");
        assert_eq!(map.primary_scan_worker(ChunkId(1)), Some(&WorkerId::from("w1")));
        assert_eq!(map.primary_scan_worker(ChunkId(2)), Some(&WorkerId::from("w2")));
        assert_eq!(map.primary_scan_worker(ChunkId(3)), Some(&WorkerId::from("w2")));
        let w1 = map.worker(&WorkerId::from("w1")).expect("w1");
        let w2 = map.worker(&WorkerId::from("w2")).expect("w2");
        assert_eq!(w1.shared_scan_total_bytes, 1000);
        assert_eq!(w2.shared_scan_total_bytes, 910);
    }

    #[test]
    fn assignment_only_grows_the_chosen_worker() {
        let mut workers = BTreeMap::new();
        for (id, load) in [("a", 30_i64), ("b", 10), ("c", 20)] {
            let mut w = WorkerEntry::new(WorkerId::from(id));
            w.shared_scan_total_bytes = load;
            workers.insert(WorkerId::from(id), w);
        }
        let before = workers.clone();
        let candidates = BTreeSet::from([WorkerId::from("a"), WorkerId::from("b")]);
        let chosen = assign_shared_scan(&mut workers, ChunkId(9), 7, &candidates).expect("assign");
        assert_eq!(chosen, WorkerId::from("b"));
        for (id, w) in &workers {
            if *id == chosen {
                assert_eq!(w.shared_scan_total_bytes, before[id].shared_scan_total_bytes + 7);
                assert!(w.shared_scan_chunks.contains(&ChunkId(9)));
            } else {
                assert_eq!(w, &before[id]);
            }
        }
    }

    #[test]
    fn size_mismatch_keeps_first_value() {
        let inv = inventory(&[("w1", "db", "t", 5, 100), ("w2", "db", "t", 5, 999)]);
        let map = ChunkMap::build(&inv, None).expect("soft inconsistency is not fatal");
        let chunk = map.chunk(ChunkId(5)).expect("chunk");
        assert_eq!(chunk.total_bytes, 100);
        assert_eq!(chunk.workers.len(), 2);
    }

    #[test]
    fn equal_sizes_assign_deterministically() {
        let inv = inventory(&[
            ("w1", "db", "t", 7, 10),
            ("w2", "db", "t", 7, 10),
            ("w1", "db", "t", 8, 10),
            ("w2", "db", "t", 8, 10),
        ]);
        let a = ChunkMap::build(&inv, None).expect("a");
        let b = ChunkMap::build(&inv, None).expect("b");
        assert_eq!(a, b);
        assert_eq!(a.primary_scan_worker(ChunkId(7)), Some(&WorkerId::from("w1")));
        assert_eq!(a.primary_scan_worker(ChunkId(8)), Some(&WorkerId::from("w2")));
    }

    #[test]
    fn verify_rejects_orphan_chunk() {
        let inv = inventory(&[("w1", "db", "t", 1, 10)]);
        let mut map = ChunkMap::build(&inv, None).expect("build");
        map.workers
            .get_mut(&WorkerId::from("w1"))
            .expect("w1")
            .chunk_ids
            .insert(ChunkId(404));
        assert!(matches!(map.verify(), Err(CzarError::ChunkMap(_))));
    }

    #[test]
    fn verify_rejects_scan_total_drift() {
        let inv = inventory(&[("w1", "db", "t", 1, 10)]);
        let mut map = ChunkMap::build(&inv, None).expect("build");
        map.workers
            .get_mut(&WorkerId::from("w1"))
            .expect("w1")
            .shared_scan_total_bytes = 11;
        assert!(matches!(map.verify(), Err(CzarError::ChunkMap(_))));
    }
}
