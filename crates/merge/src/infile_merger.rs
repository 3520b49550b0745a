//! Concurrent bounded merge of worker results into one per-query table.
//!
//! Many UberJob response handlers call [`InfileMerger::merge`] at the same time. Each call:
//! 1. skips empty batches and anything arriving after cancellation, row-limit satisfaction
//!    or a recorded query error;
//! 2. decodes the batch into a [`VirtualFile`] tagged with its job attempt;
//! 3. holds the attempt's read lock so an [`InfileMerger::invalidate_attempt`] purge for the
//!    same attempt cannot interleave with the insert;
//! 4. charges the bytes against the result-size cap before touching the table;
//! 5. inserts the rows under the storage-engine insert semaphore, reconnecting on connection
//!    failures;
//! 6. updates stats and metrics.
//!
//! [`InfileMerger::finalize`] runs once all jobs are terminal and turns the merge table into
//! the result table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arrow_schema::SchemaRef;
use czar_common::{
    CzarConfig, CzarError, JobAttemptId, MergeEngine, MetricsRegistry, QueryError, QueryId,
    Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::sql::{quote_ident, SqlConnection};
use crate::virtual_file::{create_table_sql, VirtualFile, ATTEMPT_COLUMN};

/// Post-processing to apply to the merged rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// Select list run over the merge table, e.g. `"k, SUM(n) AS n"`. Empty selects the
    /// worker columns unchanged.
    #[serde(default)]
    pub select_list: String,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    /// `LIMIT` applied by the final aggregation.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Stop merging once this many rows have arrived. Only meaningful for plain `LIMIT`
    /// queries without aggregation.
    #[serde(default)]
    pub row_limit: Option<u64>,
}

impl MergeSpec {
    /// True when the merge table must be aggregated into a separate result table.
    pub fn needs_post_processing(&self) -> bool {
        !self.select_list.trim().is_empty() || self.group_by.is_some() || self.limit.is_some()
    }
}

/// Merge limits, normally taken from [`CzarConfig`].
#[derive(Debug, Clone)]
pub struct InfileMergerConfig {
    pub max_result_table_size_bytes: u64,
    pub engine: MergeEngine,
    pub max_concurrent_merges: usize,
    pub max_sql_reconnects: u32,
    pub sql_reconnect_sleep: Duration,
    pub insert_rows_per_statement: usize,
}

impl InfileMergerConfig {
    pub fn from_czar_config(config: &CzarConfig) -> Self {
        Self {
            max_result_table_size_bytes: config.max_result_table_size_bytes,
            engine: config.merge_engine,
            max_concurrent_merges: config.max_concurrent_merges,
            max_sql_reconnects: config.max_sql_reconnects,
            sql_reconnect_sleep: Duration::from_millis(config.sql_reconnect_sleep_ms),
            insert_rows_per_statement: config.insert_rows_per_statement,
        }
    }
}

impl Default for InfileMergerConfig {
    fn default() -> Self {
        Self::from_czar_config(&CzarConfig::default())
    }
}

/// Why a batch was not merged. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSkip {
    Empty,
    Cancelled,
    RowLimitReached,
    InvalidAttempt,
    QueryFailed,
}

impl MergeSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeSkip::Empty => "empty",
            MergeSkip::Cancelled => "cancelled",
            MergeSkip::RowLimitReached => "row_limit",
            MergeSkip::InvalidAttempt => "invalid_attempt",
            MergeSkip::QueryFailed => "query_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { rows: u64, bytes: u64 },
    Skipped(MergeSkip),
}

/// Running counters of one merger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Every batch handed to [`InfileMerger::merge`], whatever its outcome.
    pub batches_received: u64,
    pub bytes_received: u64,
    pub batches_merged: u64,
    pub batches_skipped: u64,
    pub batches_failed: u64,
    pub rows_merged: u64,
    pub bytes_merged: u64,
    pub rows_purged: u64,
    /// Rows currently in the merge table: merged minus purged. The row limit counts these.
    pub live_rows: u64,
}

#[derive(Debug, Default)]
struct TableState {
    schema: Option<SchemaRef>,
    created: bool,
    result_columns: Vec<String>,
    finalized: bool,
}

/// Per-query merge engine.
pub struct InfileMerger {
    query_id: QueryId,
    config: InfileMergerConfig,
    spec: MergeSpec,
    conn: Arc<dyn SqlConnection>,
    metrics: MetricsRegistry,
    target_table: String,
    merge_table: String,
    cancelled: AtomicBool,
    limit_reached: AtomicBool,
    /// Bytes of completed jobs.
    total_result_size: AtomicU64,
    /// Bytes of attempts still running, dropped on invalidation.
    per_attempt_result_size: Mutex<HashMap<JobAttemptId, u64>>,
    attempt_locks: Mutex<HashMap<JobAttemptId, Arc<RwLock<()>>>>,
    invalid_attempts: Mutex<HashSet<JobAttemptId>>,
    table: tokio::sync::Mutex<TableState>,
    insert_permits: Arc<Semaphore>,
    error: Mutex<Option<QueryError>>,
    stats: Mutex<MergeStats>,
}

impl std::fmt::Debug for InfileMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfileMerger")
            .field("query_id", &self.query_id)
            .field("target_table", &self.target_table)
            .field("merge_table", &self.merge_table)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl InfileMerger {
    pub fn new(
        query_id: QueryId,
        spec: MergeSpec,
        config: InfileMergerConfig,
        conn: Arc<dyn SqlConnection>,
        metrics: MetricsRegistry,
    ) -> Self {
        let target_table = format!("result_{}", query_id.0);
        let merge_table = if spec.needs_post_processing() {
            format!("{target_table}_m")
        } else {
            target_table.clone()
        };
        let permits = config.engine.insert_permits(config.max_concurrent_merges);
        Self {
            query_id,
            spec,
            conn,
            metrics,
            target_table,
            merge_table,
            cancelled: AtomicBool::new(false),
            limit_reached: AtomicBool::new(false),
            total_result_size: AtomicU64::new(0),
            per_attempt_result_size: Mutex::new(HashMap::new()),
            attempt_locks: Mutex::new(HashMap::new()),
            invalid_attempts: Mutex::new(HashSet::new()),
            table: tokio::sync::Mutex::new(TableState::default()),
            insert_permits: Arc::new(Semaphore::new(permits)),
            error: Mutex::new(None),
            stats: Mutex::new(MergeStats::default()),
            config,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn spec(&self) -> &MergeSpec {
        &self.spec
    }

    pub fn result_table_name(&self) -> &str {
        &self.target_table
    }

    pub fn merge_table_name(&self) -> &str {
        &self.merge_table
    }

    /// Merge one row batch of `job_attempt`. `byte_size` is the size the worker reported.
    pub async fn merge(
        &self,
        job_attempt: JobAttemptId,
        ipc_bytes: &[u8],
        byte_size: u64,
    ) -> Result<MergeOutcome> {
        {
            let mut stats = lock(&self.stats);
            stats.batches_received += 1;
            stats.bytes_received += byte_size;
        }
        let outcome = self.merge_batch(job_attempt, ipc_bytes, byte_size).await;
        if outcome.is_err() {
            lock(&self.stats).batches_failed += 1;
            self.metrics.inc_merge_failures(self.query_id.0);
        }
        outcome
    }

    async fn merge_batch(
        &self,
        job_attempt: JobAttemptId,
        ipc_bytes: &[u8],
        byte_size: u64,
    ) -> Result<MergeOutcome> {
        if let Some(reason) = self.skip_reason() {
            return Ok(self.skipped(reason));
        }
        if ipc_bytes.is_empty() {
            return Ok(self.skipped(MergeSkip::Empty));
        }
        let file = match VirtualFile::from_ipc(job_attempt, ipc_bytes) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(self.skipped(MergeSkip::Empty)),
            Err(e) => return Err(self.fail(e)),
        };

        let attempt_lock = self.attempt_lock(job_attempt);
        let _attempt_guard = attempt_lock.read_owned().await;
        if lock(&self.invalid_attempts).contains(&job_attempt) {
            debug!(
                query_id = %self.query_id,
                job_attempt = %job_attempt,
                operator = "InfileMerger",
                "dropping rows of invalidated attempt"
            );
            return Ok(self.skipped(MergeSkip::InvalidAttempt));
        }

        self.charge_result_size(job_attempt, byte_size)
            .map_err(|e| self.fail(e))?;

        if let Err(e) = self.ensure_table(&file).await {
            return Err(self.fail(e));
        }
        let statements = file
            .insert_statements(
                &self.merge_table,
                self.conn.as_ref(),
                self.config.insert_rows_per_statement,
            )
            .map_err(|e| self.fail(e))?;

        let started = Instant::now();
        let permit = Arc::clone(&self.insert_permits)
            .acquire_owned()
            .await
            .map_err(|_| self.fail(CzarError::Merge("insert semaphore closed".to_string())))?;
        // A squash while waiting for the permit stops the insert.
        if self.cancelled.load(Ordering::SeqCst) {
            drop(permit);
            self.release_result_size(job_attempt, byte_size);
            return Ok(self.skipped(MergeSkip::Cancelled));
        }
        let statements = Arc::new(statements);
        let inserted = self
            .with_reconnect("insert", move |conn| conn.run_statements(&statements))
            .await;
        drop(permit);
        if let Err(e) = inserted {
            return Err(self.fail(e));
        }

        let rows = file.num_rows() as u64;
        let secs = started.elapsed().as_secs_f64();
        let live_rows = {
            let mut stats = lock(&self.stats);
            stats.batches_merged += 1;
            stats.rows_merged += rows;
            stats.bytes_merged += byte_size;
            stats.live_rows += rows;
            stats.live_rows
        };
        self.metrics
            .record_merge(self.query_id.0, byte_size, rows, secs);
        if let Some(limit) = self.spec.row_limit {
            if live_rows >= limit && !self.limit_reached.swap(true, Ordering::SeqCst) {
                info!(
                    query_id = %self.query_id,
                    rows = live_rows,
                    limit,
                    operator = "InfileMerger",
                    "row limit satisfied"
                );
            }
        }
        debug!(
            query_id = %self.query_id,
            job_attempt = %job_attempt,
            rows,
            bytes = byte_size,
            operator = "InfileMerger",
            "merged batch"
        );
        Ok(MergeOutcome::Merged {
            rows,
            bytes: byte_size,
        })
    }

    /// Purge every row merged under `job_attempt` and refuse later batches for it.
    pub async fn invalidate_attempt(&self, job_attempt: JobAttemptId) -> Result<u64> {
        lock(&self.invalid_attempts).insert(job_attempt);
        let attempt_lock = self.attempt_lock(job_attempt);
        let _exclusive = attempt_lock.write_owned().await;
        lock(&self.per_attempt_result_size).remove(&job_attempt);

        let created = self.table.lock().await.created;
        if !created {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            quote_ident(&self.merge_table),
            quote_ident(ATTEMPT_COLUMN),
            job_attempt.encode()
        );
        let purged = self
            .with_reconnect("purge", move |conn| conn.execute(&sql))
            .await
            .map_err(|e| self.fail(e))?;
        {
            let mut stats = lock(&self.stats);
            stats.rows_purged += purged;
            stats.live_rows = stats.live_rows.saturating_sub(purged);
        }
        if purged > 0 {
            info!(
                query_id = %self.query_id,
                job_attempt = %job_attempt,
                rows = purged,
                operator = "InfileMerger",
                "purged rows of invalidated attempt"
            );
        }
        Ok(purged)
    }

    /// Move the bytes of a finished attempt into the query total.
    pub fn mark_job_complete(&self, job_attempt: JobAttemptId) {
        if let Some(bytes) = lock(&self.per_attempt_result_size).remove(&job_attempt) {
            self.total_result_size.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    /// Bytes accounted against the result-size cap.
    pub fn result_size(&self) -> u64 {
        let running: u64 = lock(&self.per_attempt_result_size).values().sum();
        self.total_result_size.load(Ordering::SeqCst) + running
    }

    /// Stop merging. Batches arriving afterwards are drained without being inserted.
    pub fn squash(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!(query_id = %self.query_id, operator = "InfileMerger", "merger squashed");
        }
    }

    pub fn is_squashed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached.load(Ordering::SeqCst)
    }

    /// First error recorded for this query.
    pub fn error(&self) -> Option<QueryError> {
        lock(&self.error).clone()
    }

    pub fn stats(&self) -> MergeStats {
        *lock(&self.stats)
    }

    /// Build the result table. Returns its row count, or `-1` when no counting was needed.
    pub async fn finalize(&self) -> Result<i64> {
        if let Some(err) = self.error() {
            return Err(CzarError::Merge(format!(
                "cannot finalize failed query: {}",
                err.message
            )));
        }
        let mut table = self.table.lock().await;
        if table.finalized {
            return Err(CzarError::Merge(format!(
                "{} already finalized",
                self.query_id
            )));
        }
        if !table.created {
            let ddl = match &table.schema {
                Some(schema) => create_table_sql(schema, &self.merge_table)?,
                None => format!(
                    "CREATE TABLE IF NOT EXISTS {} ({} INTEGER NOT NULL)",
                    quote_ident(&self.merge_table),
                    quote_ident(ATTEMPT_COLUMN)
                ),
            };
            self.with_reconnect("create", move |conn| conn.execute(&ddl))
                .await
                .map_err(|e| self.fail(e))?;
            table.created = true;
        }

        let started = Instant::now();
        let rows = if self.spec.needs_post_processing() {
            let merge_columns = user_columns(table.schema.as_ref());
            let sql = self.aggregation_sql(&merge_columns);
            let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&self.target_table));
            let merge_table = self.merge_table.clone();
            let target_table = self.target_table.clone();
            self.with_reconnect("aggregate", move |conn| {
                conn.drop_table(&target_table)?;
                conn.execute(&sql)?;
                let count = conn.run_query(&count_sql)?.scalar_i64().ok_or_else(|| {
                    CzarError::SqlStatement("row count query returned no value".to_string())
                })?;
                conn.drop_table(&merge_table)?;
                Ok(count)
            })
            .await
            .map_err(|e| self.fail(e))?
        } else {
            -1
        };

        let probe = format!("SELECT * FROM {} LIMIT 0", quote_ident(&self.target_table));
        let columns = self
            .with_reconnect("describe", move |conn| conn.run_query(&probe))
            .await
            .map_err(|e| self.fail(e))?
            .columns;
        table.result_columns = columns
            .into_iter()
            .filter(|c| c != ATTEMPT_COLUMN)
            .collect();
        table.finalized = true;

        info!(
            query_id = %self.query_id,
            rows,
            table = %self.target_table,
            elapsed_ms = started.elapsed().as_millis() as u64,
            operator = "InfileMerger",
            "finalized result table"
        );
        Ok(rows)
    }

    /// SQL the caller runs to read the final rows. The attempt tag column is never exposed.
    pub async fn result_query(&self) -> String {
        let table = self.table.lock().await;
        let columns = if table.finalized {
            table.result_columns.clone()
        } else {
            user_columns(table.schema.as_ref())
        };
        let target = quote_ident(&self.target_table);
        if columns.is_empty() {
            return format!("SELECT NULL AS {} FROM {target} WHERE 0", quote_ident("empty"));
        }
        let list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT {list} FROM {target}");
        if let Some(order_by) = &self.spec.order_by {
            sql.push_str(&format!(" ORDER BY {order_by}"));
        }
        if !self.spec.needs_post_processing() {
            if let Some(limit) = self.spec.row_limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }
        sql
    }

    /// Drop the merge and result tables.
    pub async fn discard(&self) -> Result<()> {
        self.squash();
        let tables = if self.merge_table == self.target_table {
            vec![self.target_table.clone()]
        } else {
            vec![self.merge_table.clone(), self.target_table.clone()]
        };
        self.with_reconnect("drop", move |conn| {
            for table in tables.iter() {
                conn.drop_table(table)?;
            }
            Ok(())
        })
        .await
    }

    fn aggregation_sql(&self, merge_columns: &[String]) -> String {
        let select = if self.spec.select_list.trim().is_empty() {
            if merge_columns.is_empty() {
                "*".to_string()
            } else {
                merge_columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        } else {
            self.spec.select_list.clone()
        };
        let mut sql = format!(
            "CREATE TABLE {} AS SELECT {select} FROM {}",
            quote_ident(&self.target_table),
            quote_ident(&self.merge_table)
        );
        if let Some(group_by) = &self.spec.group_by {
            sql.push_str(&format!(" GROUP BY {group_by}"));
        }
        if let Some(order_by) = &self.spec.order_by {
            sql.push_str(&format!(" ORDER BY {order_by}"));
        }
        if let Some(limit) = self.spec.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    fn skip_reason(&self) -> Option<MergeSkip> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some(MergeSkip::Cancelled)
        } else if self.limit_reached.load(Ordering::SeqCst) {
            Some(MergeSkip::RowLimitReached)
        } else if lock(&self.error).is_some() {
            Some(MergeSkip::QueryFailed)
        } else {
            None
        }
    }

    fn skipped(&self, reason: MergeSkip) -> MergeOutcome {
        lock(&self.stats).batches_skipped += 1;
        self.metrics
            .inc_merge_skipped(self.query_id.0, reason.as_str());
        MergeOutcome::Skipped(reason)
    }

    /// Record `e` as the query error (first one wins) and hand it back.
    fn fail(&self, e: CzarError) -> CzarError {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            error!(
                query_id = %self.query_id,
                error = %e,
                operator = "InfileMerger",
                "merge failed"
            );
            *slot = Some(e.to_query_error());
        }
        e
    }

    fn attempt_lock(&self, job_attempt: JobAttemptId) -> Arc<RwLock<()>> {
        Arc::clone(lock(&self.attempt_locks).entry(job_attempt).or_default())
    }

    fn charge_result_size(&self, job_attempt: JobAttemptId, byte_size: u64) -> Result<()> {
        let mut running = lock(&self.per_attempt_result_size);
        let total = self.total_result_size.load(Ordering::SeqCst)
            + running.values().sum::<u64>()
            + byte_size;
        let limit = self.config.max_result_table_size_bytes;
        if total > limit {
            return Err(CzarError::ResultTooLarge { size: total, limit });
        }
        *running.entry(job_attempt).or_insert(0) += byte_size;
        Ok(())
    }

    fn release_result_size(&self, job_attempt: JobAttemptId, byte_size: u64) {
        if let Some(bytes) = lock(&self.per_attempt_result_size).get_mut(&job_attempt) {
            *bytes = bytes.saturating_sub(byte_size);
        }
    }

    /// Create the merge table from the first batch and reject batches of another shape.
    async fn ensure_table(&self, file: &VirtualFile) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.finalized {
            return Err(CzarError::Merge(format!(
                "{} received rows after finalize",
                self.query_id
            )));
        }
        match &table.schema {
            Some(schema) if !file.same_shape(schema) => {
                return Err(CzarError::Merge(format!(
                    "row batch of {} does not match merge table columns",
                    file.job_attempt
                )));
            }
            Some(_) => {}
            None => table.schema = Some(Arc::clone(&file.schema)),
        }
        if !table.created {
            let ddl = file.create_table_sql(&self.merge_table)?;
            self.with_reconnect("create", move |conn| conn.execute(&ddl))
                .await?;
            table.created = true;
        }
        Ok(())
    }

    /// Run `op` on the blocking pool, reconnecting after connection-level failures.
    async fn with_reconnect<T, F>(&self, what: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn SqlConnection) -> Result<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut reconnects = 0u32;
        loop {
            let conn = Arc::clone(&self.conn);
            let attempt = Arc::clone(&op);
            let outcome = tokio::task::spawn_blocking(move || attempt(conn.as_ref()))
                .await
                .map_err(|e| CzarError::Merge(format!("{what} task failed: {e}")))?;
            match outcome {
                Err(CzarError::SqlConnection(msg))
                    if reconnects < self.config.max_sql_reconnects =>
                {
                    reconnects += 1;
                    warn!(
                        query_id = %self.query_id,
                        what,
                        reconnects,
                        error = %msg,
                        operator = "InfileMerger",
                        "result database connection failed; reconnecting"
                    );
                    tokio::time::sleep(self.config.sql_reconnect_sleep).await;
                    let conn = Arc::clone(&self.conn);
                    let reconnected = tokio::task::spawn_blocking(move || conn.reconnect())
                        .await
                        .map_err(|e| CzarError::Merge(format!("reconnect task failed: {e}")))?;
                    if let Err(e) = reconnected {
                        warn!(
                            query_id = %self.query_id,
                            error = %e,
                            operator = "InfileMerger",
                            "reconnect failed"
                        );
                    }
                }
                other => return other,
            }
        }
    }
}

fn user_columns(schema: Option<&SchemaRef>) -> Vec<String> {
    schema
        .map(|s| s.fields().iter().map(|f| f.name().clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{SqlRows, SqlValue};
    use crate::sqlite::SqliteConnection;
    use crate::virtual_file::encode_record_batches_ipc;
    use arrow::array::{Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use czar_common::{ErrorClass, JobId};
    use std::sync::atomic::AtomicU32;

    fn ipc(ids: &[i64], names: &[&str]) -> Vec<u8> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(names.to_vec())),
            ],
        )
        .expect("batch");
        encode_record_batches_ipc(&[batch]).expect("ipc")
    }

    fn config() -> InfileMergerConfig {
        InfileMergerConfig {
            max_result_table_size_bytes: 1_000,
            sql_reconnect_sleep: Duration::from_millis(1),
            ..InfileMergerConfig::default()
        }
    }

    fn merger(spec: MergeSpec, conn: Arc<dyn SqlConnection>) -> InfileMerger {
        InfileMerger::new(QueryId(7), spec, config(), conn, MetricsRegistry::new())
    }

    fn attempt(job: u32, n: u32) -> JobAttemptId {
        JobAttemptId::new(JobId(job), n)
    }

    fn query(conn: &dyn SqlConnection, sql: &str) -> SqlRows {
        conn.run_query(sql).expect("query")
    }

    #[tokio::test]
    async fn merges_batches_without_post_processing() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let m = merger(MergeSpec::default(), Arc::clone(&conn));
        assert_eq!(m.merge_table_name(), m.result_table_name());

        let out = m.merge(attempt(1, 1), &ipc(&[1, 2], &["a", "b"]), 10).await;
        assert_eq!(out.expect("merge"), MergeOutcome::Merged { rows: 2, bytes: 10 });
        m.merge(attempt(2, 1), &ipc(&[3], &["c"]), 5)
            .await
            .expect("merge");
        assert_eq!(
            m.merge(attempt(3, 1), &[], 0).await.expect("empty"),
            MergeOutcome::Skipped(MergeSkip::Empty)
        );

        assert_eq!(m.finalize().await.expect("finalize"), -1);
        let sql = m.result_query().await;
        assert!(!sql.contains(ATTEMPT_COLUMN));
        let rows = query(conn.as_ref(), &format!("{sql} ORDER BY 1"));
        assert_eq!(rows.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(rows.rows.len(), 3);
        assert_eq!(m.stats().rows_merged, 3);
    }

    #[tokio::test]
    async fn aggregates_into_result_table_and_drops_merge_table() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let spec = MergeSpec {
            select_list: "name, SUM(id) AS total".to_string(),
            group_by: Some("name".to_string()),
            order_by: Some("name".to_string()),
            ..MergeSpec::default()
        };
        let m = merger(spec, Arc::clone(&conn));
        m.merge(attempt(1, 1), &ipc(&[1, 2], &["a", "b"]), 10)
            .await
            .expect("merge");
        m.merge(attempt(2, 1), &ipc(&[5], &["a"]), 10)
            .await
            .expect("merge");

        assert_eq!(m.finalize().await.expect("finalize"), 2);
        let rows = query(conn.as_ref(), &m.result_query().await);
        assert_eq!(rows.columns, vec!["name".to_string(), "total".to_string()]);
        assert_eq!(
            rows.rows[0],
            vec![SqlValue::Text("a".to_string()), SqlValue::Integer(6)]
        );
        assert!(conn.run_query("SELECT * FROM result_7_m").is_err());
        assert!(m.finalize().await.is_err());
    }

    #[tokio::test]
    async fn size_cap_fails_before_inserting_crossing_batch() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let m = merger(MergeSpec::default(), Arc::clone(&conn));
        m.merge(attempt(1, 1), &ipc(&[1], &["a"]), 600)
            .await
            .expect("first");
        m.mark_job_complete(attempt(1, 1));
        let err = m
            .merge(attempt(2, 1), &ipc(&[2], &["b"]), 401)
            .await
            .expect_err("cap");
        assert!(matches!(err, CzarError::ResultTooLarge { size: 1001, limit: 1000 }));
        assert_eq!(
            m.error().map(|e| e.class),
            Some(ErrorClass::ResourceExhausted)
        );
        let rows = query(conn.as_ref(), "SELECT COUNT(*) FROM result_7");
        assert_eq!(rows.scalar_i64(), Some(1));
        assert_eq!(
            m.merge(attempt(3, 1), &ipc(&[3], &["c"]), 1)
                .await
                .expect("after failure"),
            MergeOutcome::Skipped(MergeSkip::QueryFailed)
        );
        assert!(m.finalize().await.is_err());
    }

    #[tokio::test]
    async fn invalidated_attempt_rows_are_purged_and_refused() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let m = merger(MergeSpec::default(), Arc::clone(&conn));
        m.merge(attempt(1, 1), &ipc(&[1, 2], &["a", "b"]), 100)
            .await
            .expect("merge");
        m.merge(attempt(2, 1), &ipc(&[3], &["c"]), 100)
            .await
            .expect("merge");

        assert_eq!(m.invalidate_attempt(attempt(1, 1)).await.expect("purge"), 2);
        assert_eq!(m.result_size(), 100);
        assert_eq!(
            m.merge(attempt(1, 1), &ipc(&[1], &["a"]), 100)
                .await
                .expect("stale"),
            MergeOutcome::Skipped(MergeSkip::InvalidAttempt)
        );
        m.merge(attempt(1, 2), &ipc(&[1, 2], &["a", "b"]), 100)
            .await
            .expect("retry");
        let rows = query(conn.as_ref(), "SELECT COUNT(*) FROM result_7");
        assert_eq!(rows.scalar_i64(), Some(3));
    }

    #[tokio::test]
    async fn squash_and_row_limit_stop_merging() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let spec = MergeSpec {
            row_limit: Some(2),
            ..MergeSpec::default()
        };
        let m = merger(spec, Arc::clone(&conn));
        m.merge(attempt(1, 1), &ipc(&[1, 2], &["a", "b"]), 10)
            .await
            .expect("merge");
        assert!(m.limit_reached());
        assert_eq!(
            m.merge(attempt(2, 1), &ipc(&[3], &["c"]), 10)
                .await
                .expect("drained"),
            MergeOutcome::Skipped(MergeSkip::RowLimitReached)
        );
        assert!(m.result_query().await.ends_with("LIMIT 2"));

        let other = merger(MergeSpec::default(), conn);
        other.squash();
        assert_eq!(
            other
                .merge(attempt(1, 1), &ipc(&[1], &["a"]), 10)
                .await
                .expect("squashed"),
            MergeOutcome::Skipped(MergeSkip::Cancelled)
        );
    }

    #[tokio::test]
    async fn mismatched_batch_shape_fails_query() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let m = merger(MergeSpec::default(), conn);
        m.merge(attempt(1, 1), &ipc(&[1], &["a"]), 1)
            .await
            .expect("merge");
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let other = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))])
            .expect("batch");
        let bytes = encode_record_batches_ipc(&[other]).expect("ipc");
        assert!(matches!(
            m.merge(attempt(2, 1), &bytes, 1).await,
            Err(CzarError::Merge(_))
        ));

        let stats = m.stats();
        assert_eq!(stats.batches_received, 2);
        assert_eq!(stats.batches_merged, 1);
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.bytes_received, 2);
        assert_eq!(stats.bytes_merged, 1);
        assert!(m
            .metrics
            .render_prometheus()
            .contains("czar_merge_failures_total{query_id=\"7\"} 1"));
    }

    #[tokio::test]
    async fn purged_rows_do_not_count_toward_row_limit() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let spec = MergeSpec {
            row_limit: Some(2),
            ..MergeSpec::default()
        };
        let m = merger(spec, Arc::clone(&conn));
        m.merge(attempt(1, 1), &ipc(&[1], &["a"]), 10)
            .await
            .expect("merge");
        assert_eq!(m.invalidate_attempt(attempt(1, 1)).await.expect("purge"), 1);
        m.merge(attempt(1, 2), &ipc(&[1], &["a"]), 10)
            .await
            .expect("retry");

        assert!(!m.limit_reached());
        let stats = m.stats();
        assert_eq!(stats.rows_merged, 2);
        assert_eq!(stats.rows_purged, 1);
        assert_eq!(stats.live_rows, 1);

        assert_eq!(
            m.merge(attempt(2, 1), &ipc(&[2], &["b"]), 10)
                .await
                .expect("second job"),
            MergeOutcome::Merged { rows: 1, bytes: 10 }
        );
        assert!(m.limit_reached());
        let rows = query(conn.as_ref(), "SELECT COUNT(*) FROM result_7");
        assert_eq!(rows.scalar_i64(), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalidate_racing_merges_leaves_no_stale_rows() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let m = Arc::new(merger(MergeSpec::default(), Arc::clone(&conn)));
        let stale = attempt(1, 1);

        let mut tasks = Vec::new();
        for i in 0..8i64 {
            let m = Arc::clone(&m);
            tasks.push(tokio::spawn(async move {
                m.merge(stale, &ipc(&[i], &["s"]), 1).await.map(|_| ())
            }));
        }
        let purge = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.invalidate_attempt(stale).await.map(|_| ()) })
        };
        let keep = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.merge(attempt(2, 1), &ipc(&[100], &["k"]), 1).await })
        };
        for task in tasks {
            task.await.expect("merge task").expect("merge");
        }
        purge.await.expect("purge task").expect("purge");
        assert!(matches!(
            keep.await.expect("keep task").expect("merge"),
            MergeOutcome::Merged { rows: 1, .. }
        ));

        let stale_rows = query(
            conn.as_ref(),
            &format!(
                "SELECT COUNT(*) FROM result_7 WHERE {} = {}",
                quote_ident(ATTEMPT_COLUMN),
                stale.encode()
            ),
        );
        assert_eq!(stale_rows.scalar_i64(), Some(0));
        let total = query(conn.as_ref(), "SELECT COUNT(*) FROM result_7");
        assert_eq!(total.scalar_i64(), Some(1));
        assert_eq!(m.stats().live_rows, 1);
        assert_eq!(
            m.merge(stale, &ipc(&[9], &["s"]), 1).await.expect("stale"),
            MergeOutcome::Skipped(MergeSkip::InvalidAttempt)
        );
    }

    /// Connection that fails the first `failures` statements with a connection error.
    struct FlakyConnection {
        inner: SqliteConnection,
        failures: AtomicU32,
        reconnects: AtomicU32,
    }

    impl SqlConnection for FlakyConnection {
        fn run_query(&self, sql: &str) -> Result<SqlRows> {
            self.inner.run_query(sql)
        }

        fn execute(&self, sql: &str) -> Result<u64> {
            self.inner.execute(sql)
        }

        fn run_statements(&self, statements: &[String]) -> Result<u64> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CzarError::SqlConnection("server has gone away".to_string()));
            }
            self.inner.run_statements(statements)
        }

        fn escape_string(&self, raw: &str) -> String {
            self.inner.escape_string(raw)
        }

        fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyConnection> {
        Arc::new(FlakyConnection {
            inner: SqliteConnection::open_in_memory().expect("open"),
            failures: AtomicU32::new(failures),
            reconnects: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn connection_failures_are_retried_with_reconnect() {
        let conn = flaky(2);
        let m = merger(MergeSpec::default(), conn.clone());
        m.merge(attempt(1, 1), &ipc(&[1], &["a"]), 1)
            .await
            .expect("merged after reconnects");
        assert_eq!(conn.reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_reconnects_fail_the_query() {
        let conn = flaky(10);
        let m = merger(MergeSpec::default(), conn.clone());
        let err = m
            .merge(attempt(1, 1), &ipc(&[1], &["a"]), 1)
            .await
            .expect_err("gives up");
        assert!(matches!(err, CzarError::SqlConnection(_)));
        assert_eq!(conn.reconnects.load(Ordering::SeqCst), 3);
        assert!(m.error().is_some());
    }

    #[tokio::test]
    async fn concurrent_merges_all_land() {
        let conn: Arc<dyn SqlConnection> =
            Arc::new(SqliteConnection::open_in_memory().expect("open"));
        let m = Arc::new(merger(MergeSpec::default(), Arc::clone(&conn)));
        let mut handles = Vec::new();
        for job in 0..8u32 {
            let m = Arc::clone(&m);
            handles.push(tokio::spawn(async move {
                let id = i64::from(job);
                m.merge(attempt(job, 1), &ipc(&[id], &["x"]), 10).await
            }));
        }
        for h in handles {
            h.await.expect("join").expect("merge");
        }
        let rows = query(conn.as_ref(), "SELECT COUNT(*) FROM result_7");
        assert_eq!(rows.scalar_i64(), Some(8));
    }
}
