//! Per-family chunk maps published through a copy-on-write handle.
//!
//! A [`FamilyMap`] is built wholesale from a registry snapshot and never mutated afterwards.
//! [`FamilyMapHandle`] swaps the current map under a short-held lock; readers clone the
//! `Arc` and keep a consistent view for as long as they need it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use czar_common::{CzarError, MetricsRegistry, Result};
use tracing::{info, warn};

use crate::chunk_map::ChunkMap;
use crate::inventory::{ChunkInventorySnapshot, FamilyLayout};
use crate::registry::RegistryClient;

#[derive(Debug, Clone, Default)]
/// One chunk map per database family, stamped with the snapshot time it was built from.
pub struct FamilyMap {
    update_time_ms: u64,
    families: BTreeMap<String, Arc<ChunkMap>>,
    db_to_family: BTreeMap<String, String>,
}

impl FamilyMap {
    /// Build every family's chunk map; any family failing verification fails the whole build.
    pub fn build(snapshot: &ChunkInventorySnapshot, layout: &FamilyLayout) -> Result<Self> {
        let resolved = layout.resolve(&snapshot.workers.databases());
        let mut families = BTreeMap::new();
        let mut db_to_family = BTreeMap::new();
        for (family, dbs) in resolved {
            let map = ChunkMap::build(&snapshot.workers, Some(&dbs)).map_err(|e| {
                CzarError::ChunkMap(format!("family '{family}': {e}"))
            })?;
            for db in &dbs {
                db_to_family.insert(db.clone(), family.clone());
            }
            families.insert(family, Arc::new(map));
        }
        Ok(Self {
            update_time_ms: snapshot.update_time_ms,
            families,
            db_to_family,
        })
    }

    pub fn update_time_ms(&self) -> u64 {
        self.update_time_ms
    }

    pub fn chunk_map(&self, family: &str) -> Option<Arc<ChunkMap>> {
        self.families.get(family).cloned()
    }

    pub fn family_of_db(&self, db: &str) -> Option<&str> {
        self.db_to_family.get(db).map(String::as_str)
    }

    pub fn chunk_map_for_db(&self, db: &str) -> Option<Arc<ChunkMap>> {
        self.family_of_db(db).and_then(|family| self.chunk_map(family))
    }

    pub fn families(&self) -> impl Iterator<Item = (&String, &Arc<ChunkMap>)> {
        self.families.iter()
    }
}

#[derive(Debug, Default)]
/// Shared pointer to the current [`FamilyMap`].
pub struct FamilyMapHandle {
    current: Mutex<Option<Arc<FamilyMap>>>,
}

impl FamilyMapHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current map, if one has been installed.
    pub fn current(&self) -> Option<Arc<FamilyMap>> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Chunk map for `db`, or [`CzarError::NotReady`] when no map can route it yet.
    pub fn chunk_map_for_db(&self, db: &str) -> Result<Arc<ChunkMap>> {
        let map = self
            .current()
            .ok_or_else(|| CzarError::NotReady("no family map has been built yet".to_string()))?;
        map.chunk_map_for_db(db)
            .ok_or_else(|| CzarError::NotReady(format!("no chunk map for database '{db}'")))
    }

    /// Install `map` if it is newer than the current one. Returns whether it was installed.
    pub fn install(&self, map: FamilyMap) -> bool {
        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let newer = guard
            .as_ref()
            .map_or(true, |cur| map.update_time_ms > cur.update_time_ms);
        if newer {
            *guard = Some(Arc::new(map));
        }
        newer
    }

    /// Read a snapshot from the registry and rebuild when it is newer than the current map.
    ///
    /// On any failure the current map stays in effect.
    pub async fn refresh(
        &self,
        registry: &dyn RegistryClient,
        metrics: &MetricsRegistry,
    ) -> Result<bool> {
        let snapshot = registry.fetch_chunk_inventory().await?;
        if let Some(cur) = self.current() {
            if snapshot.update_time_ms <= cur.update_time_ms() {
                return Ok(false);
            }
        }
        let layout = registry.fetch_family_layout().await?;
        let built = match FamilyMap::build(&snapshot, &layout) {
            Ok(map) => map,
            Err(e) => {
                metrics.inc_chunk_map_builds("rejected");
                return Err(e);
            }
        };
        metrics.inc_chunk_map_builds("ok");
        let families = built.families.len();
        let installed = self.install(built);
        if installed {
            info!(
                update_time_ms = snapshot.update_time_ms,
                families,
                operator = "FamilyMapRefresh",
                "installed new family map"
            );
        }
        Ok(installed)
    }

    /// Retry [`Self::refresh`] with a fixed backoff until a map is available.
    pub async fn wait_until_ready(
        &self,
        registry: &dyn RegistryClient,
        metrics: &MetricsRegistry,
        retry: Duration,
    ) -> Arc<FamilyMap> {
        loop {
            if let Err(e) = self.refresh(registry, metrics).await {
                warn!(
                    error = %e,
                    retry_ms = retry.as_millis() as u64,
                    operator = "FamilyMapRefresh",
                    "family map build failed; retrying"
                );
            }
            if let Some(map) = self.current() {
                return map;
            }
            tokio::time::sleep(retry).await;
        }
    }
}
