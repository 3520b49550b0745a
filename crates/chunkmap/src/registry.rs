//! Registry service boundary.
//!
//! The registry reports chunk placement, worker contacts and database families. The czar only
//! reads from it; [`JsonDirRegistry`] serves snapshots exported to a directory and
//! [`InMemoryRegistry`] is driven programmatically.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use czar_common::{CzarError, Result};
use serde::de::DeserializeOwned;

use crate::contacts::WorkerContactSnapshot;
use crate::inventory::{ChunkInventorySnapshot, FamilyLayout};

/// Read-only access to the replication registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch_chunk_inventory(&self) -> Result<ChunkInventorySnapshot>;

    async fn fetch_worker_contacts(&self) -> Result<WorkerContactSnapshot>;

    async fn fetch_family_layout(&self) -> Result<FamilyLayout>;
}

/// Registry backed by `chunks.json`, `workers.json` and an optional `families.json`.
#[derive(Debug, Clone)]
pub struct JsonDirRegistry {
    dir: PathBuf,
}

impl JsonDirRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<T> {
        let path = self.dir.join(file);
        let raw = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&raw).map_err(|e| {
            CzarError::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl RegistryClient for JsonDirRegistry {
    async fn fetch_chunk_inventory(&self) -> Result<ChunkInventorySnapshot> {
        self.read_json("chunks.json").await
    }

    async fn fetch_worker_contacts(&self) -> Result<WorkerContactSnapshot> {
        self.read_json("workers.json").await
    }

    async fn fetch_family_layout(&self) -> Result<FamilyLayout> {
        if !tokio::fs::try_exists(self.dir.join("families.json")).await? {
            return Ok(FamilyLayout::default());
        }
        self.read_json("families.json").await
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    inventory: ChunkInventorySnapshot,
    contacts: WorkerContactSnapshot,
    layout: FamilyLayout,
    fail_inventory: bool,
}

/// Registry whose snapshots are set directly.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<InMemoryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut InMemoryState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn set_inventory(&self, inventory: ChunkInventorySnapshot) {
        self.with_state(|s| s.inventory = inventory);
    }

    pub fn set_contacts(&self, contacts: WorkerContactSnapshot) {
        self.with_state(|s| s.contacts = contacts);
    }

    pub fn set_layout(&self, layout: FamilyLayout) {
        self.with_state(|s| s.layout = layout);
    }

    /// Make inventory reads fail, as an unreachable registry would.
    pub fn fail_inventory(&self, fail: bool) {
        self.with_state(|s| s.fail_inventory = fail);
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn fetch_chunk_inventory(&self) -> Result<ChunkInventorySnapshot> {
        self.with_state(|s| {
            if s.fail_inventory {
                Err(CzarError::NotReady("registry unavailable".to_string()))
            } else {
                Ok(s.inventory.clone())
            }
        })
    }

    async fn fetch_worker_contacts(&self) -> Result<WorkerContactSnapshot> {
        Ok(self.with_state(|s| s.contacts.clone()))
    }

    async fn fetch_family_layout(&self) -> Result<FamilyLayout> {
        Ok(self.with_state(|s| s.layout.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use czar_common::WorkerId;

    #[tokio::test]
    async fn json_dir_registry_reads_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("chunks.json"),
            r#"{"update_time_ms": 3, "workers": {"w1": {"db": {"t": [[1, 10]]}}}}"#,
        )
        .expect("chunks");
        std::fs::write(
            dir.path().join("workers.json"),
            r#"{"w1": {"host": "h", "port": 1, "last_update_time_ms": 2}}"#,
        )
        .expect("workers");

        let registry = JsonDirRegistry::new(dir.path());
        let inv = registry.fetch_chunk_inventory().await.expect("inventory");
        assert_eq!(inv.update_time_ms, 3);
        let contacts = registry.fetch_worker_contacts().await.expect("contacts");
        assert_eq!(contacts.workers[&WorkerId::from("w1")].host, "h");
        let layout = registry.fetch_family_layout().await.expect("layout");
        assert!(layout.families.is_empty());
    }

    #[tokio::test]
    async fn json_dir_registry_reports_bad_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("chunks.json"), "{").expect("chunks");
        let registry = JsonDirRegistry::new(dir.path());
        let err = registry.fetch_chunk_inventory().await.expect_err("bad json");
        assert!(matches!(err, CzarError::InvalidConfig(_)));
    }
}
