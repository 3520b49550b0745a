#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use czar_chunkmap::{
    ChunkInventory, ChunkInventorySnapshot, InMemoryRegistry, RegistryClient, WorkerContact,
    WorkerContactMap, WorkerContactSnapshot,
};
use czar_common::{
    now_ms, ChunkId, CzarConfig, CzarError, QueryId, Result, UberJobIdGenerator, WorkerId,
};
use czar_dispatch::{
    ChunkQuerySpec, ChunkRequest, ChunkRunner, Czar, Executive, ExecutiveContext,
    InProcessTransport, QueryPlan,
};
use czar_merge::{
    InfileMerger, InfileMergerConfig, MergeSpec, SqlConnection, SqlValue, SqliteConnection,
};
use tokio::sync::RwLock;

pub const DB: &str = "LSST";

/// Worker-side runner producing `rows_per_chunk` rows `(chunk, seq, label)` for every chunk.
///
/// Rows only depend on the chunk, so a chunk re-run on another worker yields the same rows.
pub struct ChunkRows {
    pub rows_per_chunk: i64,
    pub fail_chunks: BTreeSet<i64>,
}

impl ChunkRows {
    pub fn new(rows_per_chunk: i64) -> Self {
        Self {
            rows_per_chunk,
            fail_chunks: BTreeSet::new(),
        }
    }

    pub fn failing(mut self, chunk: i64) -> Self {
        self.fail_chunks.insert(chunk);
        self
    }
}

impl ChunkRunner for ChunkRows {
    fn run_chunk(&self, _worker_id: &WorkerId, chunk: &ChunkRequest) -> Result<Vec<RecordBatch>> {
        if self.fail_chunks.contains(&chunk.chunk_id.0) {
            return Err(CzarError::SqlStatement(format!(
                "Table 'Object_{}' doesn't exist",
                chunk.chunk_id
            )));
        }
        Ok(vec![chunk_batch(chunk.chunk_id.0, self.rows_per_chunk)])
    }
}

pub fn chunk_batch(chunk: i64, rows: i64) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("chunk", DataType::Int64, false),
        Field::new("seq", DataType::Int64, false),
        Field::new("label", DataType::Utf8, false),
    ]));
    let seqs = (0..rows).collect::<Vec<_>>();
    let labels = seqs
        .iter()
        .map(|s| format!("c{chunk}-{s}"))
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![chunk; rows as usize])),
            Arc::new(Int64Array::from(seqs)),
            Arc::new(StringArray::from(labels)),
        ],
    )
    .expect("chunk batch")
}

/// Rows a query over `chunks` must return, sorted.
pub fn expected_rows(chunks: &[i64], rows_per_chunk: i64) -> Vec<(i64, i64, String)> {
    let mut rows = chunks
        .iter()
        .flat_map(|&c| (0..rows_per_chunk).map(move |s| (c, s, format!("c{c}-{s}"))))
        .collect::<Vec<_>>();
    rows.sort_unstable();
    rows
}

pub fn test_config(uber_job_max_chunks: usize) -> CzarConfig {
    CzarConfig {
        uber_job_max_chunks,
        rebuild_interval_ms: 50,
        sql_reconnect_sleep_ms: 10,
        chunk_map_retry_ms: 20,
        ..CzarConfig::default()
    }
}

/// Inventory where each worker holds the listed chunks of `LSST.Object`.
pub fn inventory(placement: &[(&str, &[i64])]) -> ChunkInventorySnapshot {
    let mut workers = ChunkInventory::new();
    for (worker, chunks) in placement {
        for &chunk in chunks.iter() {
            workers.insert(*worker, DB, "Object", chunk, 1000 + chunk);
        }
    }
    ChunkInventorySnapshot {
        update_time_ms: 1,
        workers,
    }
}

/// Contacts refreshed now for every listed worker.
pub fn fresh_contacts(workers: &[&str]) -> WorkerContactSnapshot {
    let now = now_ms().expect("clock");
    workers
        .iter()
        .enumerate()
        .fold(WorkerContactSnapshot::default(), |snap, (i, id)| {
            snap.with_worker(
                id,
                WorkerContact {
                    host: format!("10.0.0.{}", i + 1),
                    management_host: format!("10.0.0.{}", i + 1),
                    port: 5012,
                    last_update_time_ms: now,
                },
            )
        })
}

pub struct Fixture {
    pub czar: Arc<Czar>,
    pub registry: Arc<InMemoryRegistry>,
    pub transport: Arc<InProcessTransport>,
    pub db: Arc<SqliteConnection>,
}

/// Czar over an in-memory registry, in-process workers and an in-memory result database.
pub async fn fixture(
    placement: &[(&str, &[i64])],
    alive: &[&str],
    config: CzarConfig,
    runner: ChunkRows,
) -> Fixture {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.set_inventory(inventory(placement));
    registry.set_contacts(fresh_contacts(alive));
    let transport = Arc::new(InProcessTransport::new(Arc::new(runner)));
    let db = Arc::new(SqliteConnection::open_in_memory().expect("sqlite"));
    let czar = Czar::new(
        config,
        Arc::clone(&registry) as Arc<dyn RegistryClient>,
        Arc::clone(&transport) as _,
        Arc::clone(&db) as Arc<dyn SqlConnection>,
    )
    .expect("czar");
    czar.wait_until_ready().await;
    Fixture {
        czar,
        registry,
        transport,
        db,
    }
}

/// Executive for `plan` sharing the fixture's family map, transport and result database,
/// with its jobs created but nothing dispatched yet.
pub async fn standalone_executive(fx: &Fixture, plan: QueryPlan) -> Arc<Executive> {
    let config = fx.czar.config().clone();
    let mut contacts = WorkerContactMap::new(config.worker_dead_after_ms);
    let snapshot = fx
        .registry
        .fetch_worker_contacts()
        .await
        .expect("worker contacts");
    contacts.apply_snapshot(&snapshot, now_ms().expect("clock"));
    let merger = Arc::new(InfileMerger::new(
        plan.query_id,
        plan.merge.clone(),
        InfileMergerConfig::from_czar_config(&config),
        Arc::clone(&fx.db) as Arc<dyn SqlConnection>,
        fx.czar.metrics().clone(),
    ));
    let ctx = ExecutiveContext {
        config: Arc::new(config),
        family_map: Arc::clone(fx.czar.family_map()),
        contacts: Arc::new(RwLock::new(contacts)),
        transport: Arc::clone(&fx.transport) as _,
        metrics: fx.czar.metrics().clone(),
        messages: Arc::clone(fx.czar.messages()),
        progress: Arc::clone(fx.czar.progress()),
        uber_job_ids: Arc::new(UberJobIdGenerator::new()),
    };
    let exec = Executive::new(plan.query_id, plan.dominant_db, ctx, merger);
    for chunk in plan.chunks {
        exec.add_job(chunk).expect("add job");
    }
    exec.set_all_jobs_created();
    exec
}

pub fn plan(query_id: u64, chunks: &[i64], merge: MergeSpec) -> QueryPlan {
    QueryPlan {
        query_id: QueryId(query_id),
        dominant_db: DB.to_string(),
        interactive: true,
        chunks: chunks
            .iter()
            .map(|&c| ChunkQuerySpec {
                chunk_id: ChunkId(c),
                db_name: DB.to_string(),
                sql_text: format!("SELECT chunk, seq, label FROM Object_{c}"),
            })
            .collect(),
        merge,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Run `sql` and decode `(chunk, seq, label)` rows, sorted.
pub fn select_rows(db: &SqliteConnection, sql: &str) -> Vec<(i64, i64, String)> {
    let mut rows = db
        .run_query(sql)
        .expect("result query")
        .rows
        .into_iter()
        .map(|row| match row.as_slice() {
            [SqlValue::Integer(c), SqlValue::Integer(s), SqlValue::Text(l)] => (*c, *s, l.clone()),
            other => panic!("unexpected row {other:?}"),
        })
        .collect::<Vec<_>>();
    rows.sort_unstable();
    rows
}

/// Chunk ids per sent UberJob for `worker`, in send order.
pub fn sent_chunks(transport: &InProcessTransport, worker: &str) -> Vec<Vec<i64>> {
    transport
        .sent_requests()
        .into_iter()
        .filter(|r| r.worker_id.as_str() == worker)
        .map(|r| r.chunks.iter().map(|c| c.chunk_id.0).collect())
        .collect()
}
