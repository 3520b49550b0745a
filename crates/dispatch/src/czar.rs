//! The czar service object.
//!
//! One [`Czar`] per process owns the shared services (configuration, metrics, family map,
//! worker contacts, transport, result database, message store, progress history, UberJob ids)
//! and hands them to every query's [`Executive`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use czar_chunkmap::{FamilyMap, FamilyMapHandle, RegistryClient, WorkerContactMap};
use czar_common::{
    now_ms, CzarConfig, CzarError, MetricsRegistry, QueryId, Result, UberJobIdGenerator, WorkerId,
};
use czar_merge::{InfileMerger, InfileMergerConfig, MergeSpec, SqlConnection};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executive::{Executive, ExecutiveContext, QueryOutcome};
use crate::job::ChunkQuerySpec;
use crate::messages::MessageStore;
use crate::progress::QueryProgressHistory;
use crate::transport::WorkerTransport;

/// Planned user query: the chunk queries and how to merge their results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query_id: QueryId,
    /// Database whose family chunk map routes the chunks.
    pub dominant_db: String,
    #[serde(default)]
    pub interactive: bool,
    pub chunks: Vec<ChunkQuerySpec>,
    #[serde(default)]
    pub merge: MergeSpec,
}

pub struct Czar {
    config: Arc<CzarConfig>,
    metrics: MetricsRegistry,
    family_map: Arc<FamilyMapHandle>,
    contacts: Arc<RwLock<WorkerContactMap>>,
    registry: Arc<dyn RegistryClient>,
    transport: Arc<dyn WorkerTransport>,
    result_db: Arc<dyn SqlConnection>,
    messages: Arc<MessageStore>,
    progress: Arc<QueryProgressHistory>,
    uber_job_ids: Arc<UberJobIdGenerator>,
    executives: Mutex<HashMap<QueryId, Arc<Executive>>>,
}

impl std::fmt::Debug for Czar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Czar")
            .field("czar_id", &self.config.czar_id)
            .finish_non_exhaustive()
    }
}

impl Czar {
    pub fn new(
        config: CzarConfig,
        registry: Arc<dyn RegistryClient>,
        transport: Arc<dyn WorkerTransport>,
        result_db: Arc<dyn SqlConnection>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let contacts = WorkerContactMap::new(config.worker_dead_after_ms);
        let progress = QueryProgressHistory::new(config.progress_archive_limit);
        Ok(Arc::new(Self {
            config: Arc::new(config),
            metrics: MetricsRegistry::new(),
            family_map: Arc::new(FamilyMapHandle::new()),
            contacts: Arc::new(RwLock::new(contacts)),
            registry,
            transport,
            result_db,
            messages: Arc::new(MessageStore::new()),
            progress: Arc::new(progress),
            uber_job_ids: Arc::new(UberJobIdGenerator::new()),
            executives: Mutex::new(HashMap::new()),
        }))
    }

    fn executives(&self) -> MutexGuard<'_, HashMap<QueryId, Arc<Executive>>> {
        match self.executives.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> &CzarConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn family_map(&self) -> &Arc<FamilyMapHandle> {
        &self.family_map
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    pub fn progress(&self) -> &Arc<QueryProgressHistory> {
        &self.progress
    }

    pub fn result_db(&self) -> &Arc<dyn SqlConnection> {
        &self.result_db
    }

    /// Block until a family map is built and load the first worker contacts.
    pub async fn wait_until_ready(&self) -> Arc<FamilyMap> {
        let retry = Duration::from_millis(self.config.chunk_map_retry_ms);
        let map = self
            .family_map
            .wait_until_ready(self.registry.as_ref(), &self.metrics, retry)
            .await;
        if let Err(e) = self.poll_workers_once().await {
            warn!(error = %e, operator = "Czar", "initial worker contact poll failed");
        }
        map
    }

    pub async fn refresh_chunk_map(&self) -> Result<bool> {
        self.family_map
            .refresh(self.registry.as_ref(), &self.metrics)
            .await
    }

    /// Apply the registry's worker contacts and kill UberJobs on workers that died.
    pub async fn poll_workers_once(&self) -> Result<Vec<WorkerId>> {
        let snapshot = self.registry.fetch_worker_contacts().await?;
        let now = now_ms()?;
        let dead = self.contacts.write().await.apply_snapshot(&snapshot, now);
        if dead.is_empty() {
            return Ok(dead);
        }
        let executives = self.executives().values().cloned().collect::<Vec<_>>();
        for worker_id in &dead {
            self.metrics.inc_dead_workers(worker_id.as_str());
            for exec in &executives {
                exec.kill_uber_jobs_on_worker(worker_id);
            }
        }
        Ok(dead)
    }

    /// Create the query's executive and start dispatching its chunk queries.
    pub async fn submit(&self, plan: QueryPlan) -> Result<Arc<Executive>> {
        if self.executives().contains_key(&plan.query_id) {
            return Err(CzarError::Dispatch(format!(
                "{} was already submitted",
                plan.query_id
            )));
        }
        let merger = Arc::new(InfileMerger::new(
            plan.query_id,
            plan.merge.clone(),
            InfileMergerConfig::from_czar_config(&self.config),
            Arc::clone(&self.result_db),
            self.metrics.clone(),
        ));
        let exec = Executive::new(
            plan.query_id,
            plan.dominant_db.clone(),
            self.executive_context(),
            merger,
        );
        for chunk in plan.chunks {
            exec.add_job(chunk)?;
        }
        self.executives().insert(plan.query_id, Arc::clone(&exec));
        info!(
            query_id = %plan.query_id,
            db = %plan.dominant_db,
            interactive = plan.interactive,
            jobs = exec.jobs().len(),
            operator = "Czar",
            "query submitted"
        );
        exec.set_all_jobs_created();
        exec.start();
        exec.build_and_send_uber_jobs().await;
        Ok(exec)
    }

    fn executive_context(&self) -> ExecutiveContext {
        ExecutiveContext {
            config: Arc::clone(&self.config),
            family_map: Arc::clone(&self.family_map),
            contacts: Arc::clone(&self.contacts),
            transport: Arc::clone(&self.transport),
            metrics: self.metrics.clone(),
            messages: Arc::clone(&self.messages),
            progress: Arc::clone(&self.progress),
            uber_job_ids: Arc::clone(&self.uber_job_ids),
        }
    }

    pub fn executive(&self, query_id: QueryId) -> Option<Arc<Executive>> {
        self.executives().get(&query_id).cloned()
    }

    pub fn cancel(&self, query_id: QueryId) -> bool {
        self.executive(query_id).is_some_and(|exec| exec.cancel())
    }

    pub async fn join(&self, query_id: QueryId) -> Result<QueryOutcome> {
        let exec = self
            .executive(query_id)
            .ok_or_else(|| CzarError::Dispatch(format!("unknown query {query_id}")))?;
        Ok(exec.join().await)
    }

    /// Drop a finished query's tables and forget it.
    pub async fn discard(&self, query_id: QueryId) -> Result<()> {
        let exec = self
            .executive(query_id)
            .ok_or_else(|| CzarError::Dispatch(format!("unknown query {query_id}")))?;
        exec.discard().await?;
        self.executives().remove(&query_id);
        self.messages.remove(query_id);
        Ok(())
    }

    /// Periodic chunk map refresh and worker liveness poll.
    pub fn spawn_background(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.registry_poll_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(czar) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = czar.refresh_chunk_map().await {
                    warn!(error = %e, operator = "Czar", "chunk map refresh failed");
                }
                if let Err(e) = czar.poll_workers_once().await {
                    warn!(error = %e, operator = "Czar", "worker contact poll failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use czar_chunkmap::{
        ChunkInventory, ChunkInventorySnapshot, InMemoryRegistry, WorkerContact,
        WorkerContactSnapshot,
    };
    use czar_common::ChunkId;
    use czar_merge::SqliteConnection;

    use crate::transport::{ChunkRequest, ChunkRunner, InProcessTransport};
    use arrow::record_batch::RecordBatch;

    struct NoRows;

    impl ChunkRunner for NoRows {
        fn run_chunk(
            &self,
            _worker_id: &WorkerId,
            _chunk: &ChunkRequest,
        ) -> Result<Vec<RecordBatch>> {
            Ok(Vec::new())
        }
    }

    fn contact(ts: u64) -> WorkerContact {
        WorkerContact {
            host: "127.0.0.1".to_string(),
            management_host: String::new(),
            port: 5012,
            last_update_time_ms: ts,
        }
    }

    fn czar() -> (Arc<Czar>, Arc<InMemoryRegistry>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut inventory = ChunkInventory::new();
        inventory.insert("w1", "LSST", "Object", 1, 10);
        registry.set_inventory(ChunkInventorySnapshot {
            update_time_ms: 1,
            workers: inventory,
        });
        let now = now_ms().expect("clock");
        registry.set_contacts(WorkerContactSnapshot::default().with_worker("w1", contact(now)));
        let czar = Czar::new(
            CzarConfig::default(),
            Arc::clone(&registry) as Arc<dyn RegistryClient>,
            Arc::new(InProcessTransport::new(Arc::new(NoRows))),
            Arc::new(SqliteConnection::open_in_memory().expect("sqlite")),
        )
        .expect("czar");
        (czar, registry)
    }

    fn plan(query_id: u64) -> QueryPlan {
        QueryPlan {
            query_id: QueryId(query_id),
            dominant_db: "LSST".to_string(),
            interactive: true,
            chunks: vec![ChunkQuerySpec {
                chunk_id: ChunkId(1),
                db_name: "LSST".to_string(),
                sql_text: "SELECT * FROM Object_1".to_string(),
            }],
            merge: MergeSpec::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_submit_is_rejected() {
        let (czar, _registry) = czar();
        czar.wait_until_ready().await;
        czar.submit(plan(1)).await.expect("submit");
        assert!(czar.submit(plan(1)).await.is_err());
        assert!(czar.join(QueryId(1)).await.expect("join").is_success());
        czar.discard(QueryId(1)).await.expect("discard");
        assert!(czar.executive(QueryId(1)).is_none());
    }

    #[tokio::test]
    async fn vanished_worker_is_reported_dead() {
        let (czar, registry) = czar();
        czar.wait_until_ready().await;
        assert!(czar.poll_workers_once().await.expect("poll").is_empty());
        registry.set_contacts(WorkerContactSnapshot::default());
        let dead = czar.poll_workers_once().await.expect("poll");
        assert_eq!(dead, vec![WorkerId::from("w1")]);
    }

    #[test]
    fn plan_parses_with_defaults() {
        let raw = r#"{
            "query_id": 42,
            "dominant_db": "LSST",
            "chunks": [{"chunk_id": 7, "db_name": "LSST", "sql_text": "SELECT 1"}]
        }"#;
        let plan: QueryPlan = serde_json::from_str(raw).expect("plan");
        assert_eq!(plan.query_id, QueryId(42));
        assert!(!plan.interactive);
        assert!(!plan.merge.needs_post_processing());
    }
}
