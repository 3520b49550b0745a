//! Per-query dispatch.
//!
//! The executive owns every [`Job`] of one user query. It batches unassigned jobs into
//! [`UberJob`]s per worker, reads the workers' response streams into the query's
//! [`InfileMerger`], reassigns jobs of failed UberJobs and decides the final outcome.
//!
//! Locking: `state` guards the job and UberJob tables and is never held across an await or
//! while calling into the merger. `build_lock` serializes [`Executive::build_and_send_uber_jobs`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use czar_chunkmap::{ChunkMap, FamilyMapHandle, WorkerContactMap};
use czar_common::{
    now_ms, ChunkId, CzarConfig, CzarError, ErrorClass, JobAttemptId, JobId, MetricsRegistry,
    QueryError, QueryId, Result, UberJobId, UberJobIdGenerator, WorkerId,
};
use czar_merge::InfileMerger;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::entity::JobEntity;
use crate::job::{ChunkQuerySpec, Job, JobStatus};
use crate::messages::{self, MessageStore, Severity};
use crate::progress::QueryProgressHistory;
use crate::transport::{WorkerResponse, WorkerTransport};
use crate::uber_job::{stopped, UberJob, UberJobSignal};

/// Shared services an executive is constructed with.
#[derive(Clone)]
pub struct ExecutiveContext {
    pub config: Arc<CzarConfig>,
    pub family_map: Arc<FamilyMapHandle>,
    pub contacts: Arc<RwLock<WorkerContactMap>>,
    pub transport: Arc<dyn WorkerTransport>,
    pub metrics: MetricsRegistry,
    pub messages: Arc<MessageStore>,
    pub progress: Arc<QueryProgressHistory>,
    pub uber_job_ids: Arc<UberJobIdGenerator>,
}

/// Final state of a query as returned by [`Executive::join`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueryOutcome {
    /// Result table is ready. `rows` is `-1` when the row count was not computed.
    Success { rows: i64 },
    Error(QueryError),
    Cancelled,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Success { .. } => "success",
            QueryOutcome::Error(_) => "error",
            QueryOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UberJobSummary {
    pub uber_job_id: UberJobId,
    pub worker_id: WorkerId,
    pub chunk_ids: Vec<ChunkId>,
    pub status: JobStatus,
}

#[derive(Debug, Default)]
struct DispatchState {
    jobs: BTreeMap<JobId, Arc<Job>>,
    uber_jobs: BTreeMap<UberJobId, Arc<UberJob>>,
    /// Ordered by chunk so batches hold ascending chunk ranges.
    unassigned: BTreeSet<(ChunkId, JobId)>,
}

/// How an UberJob's response loop ended.
enum StreamEnd {
    Finished,
    Stopped(UberJobSignal),
    Broken(CzarError),
    QueryFailed,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Executive {
    query_id: QueryId,
    dominant_db: String,
    ctx: ExecutiveContext,
    merger: Arc<InfileMerger>,
    state: Mutex<DispatchState>,
    build_lock: tokio::sync::Mutex<()>,
    all_jobs_created: AtomicBool,
    cancelled: AtomicBool,
    limit_squashed: AtomicBool,
    error: Mutex<Option<QueryError>>,
    in_flight: AtomicUsize,
    changed: Notify,
    rebuild_tx: mpsc::UnboundedSender<()>,
    rebuild_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    outcome: tokio::sync::Mutex<Option<QueryOutcome>>,
}

impl std::fmt::Debug for Executive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executive")
            .field("query_id", &self.query_id)
            .field("dominant_db", &self.dominant_db)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Counts one running UberJob task; wakes `join` when it ends.
struct InFlight<'a>(&'a Executive);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0
            .ctx
            .metrics
            .add_uber_jobs_in_flight(self.0.query_id.0, -1);
        self.0.changed.notify_waiters();
    }
}

impl Executive {
    pub fn new(
        query_id: QueryId,
        dominant_db: impl Into<String>,
        ctx: ExecutiveContext,
        merger: Arc<InfileMerger>,
    ) -> Arc<Self> {
        let (rebuild_tx, rebuild_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            query_id,
            dominant_db: dominant_db.into(),
            ctx,
            merger,
            state: Mutex::new(DispatchState::default()),
            build_lock: tokio::sync::Mutex::new(()),
            all_jobs_created: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            limit_squashed: AtomicBool::new(false),
            error: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            changed: Notify::new(),
            rebuild_tx,
            rebuild_rx: Mutex::new(Some(rebuild_rx)),
            outcome: tokio::sync::Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        lock(&self.state)
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn dominant_db(&self) -> &str {
        &self.dominant_db
    }

    pub fn merger(&self) -> &Arc<InfileMerger> {
        &self.merger
    }

    /// Register the job for one chunk query.
    pub fn add_job(&self, spec: ChunkQuerySpec) -> Result<Arc<Job>> {
        if self.all_jobs_created.load(Ordering::SeqCst) {
            return Err(CzarError::Dispatch(format!(
                "{} no longer accepts jobs",
                self.query_id
            )));
        }
        let job = {
            let mut state = self.state();
            let job_id = JobId(state.jobs.len() as u32);
            let job = Arc::new(Job::new(self.query_id, job_id, spec));
            state.jobs.insert(job_id, Arc::clone(&job));
            state.unassigned.insert((job.chunk_id(), job_id));
            job
        };
        if self.is_stopped() {
            job.cancel();
        }
        debug!(
            query_id = %self.query_id,
            job_id = %job.job_id(),
            chunk_id = %job.chunk_id(),
            operator = "Executive",
            "job added"
        );
        Ok(job)
    }

    /// No more jobs will be added. Enables batching.
    pub fn set_all_jobs_created(&self) {
        if !self.all_jobs_created.swap(true, Ordering::SeqCst) {
            self.record_progress();
            self.request_rebuild();
            self.changed.notify_waiters();
        }
    }

    pub fn all_jobs_created(&self) -> bool {
        self.all_jobs_created.load(Ordering::SeqCst)
    }

    /// Spawn the task that re-runs batching on request and on the rebuild timer.
    ///
    /// The task only holds a weak reference and ends with the query.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(mut rx) = lock(&self.rebuild_rx).take() else {
            return false;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let query_id = self.query_id;
        let period = Duration::from_millis(self.ctx.config.rebuild_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                    _ = tick.tick() => {}
                }
                let Some(exec) = weak.upgrade() else {
                    break;
                };
                if exec.all_jobs_created() && exec.is_done() {
                    break;
                }
                exec.build_and_send_uber_jobs().await;
            }
            debug!(query_id = %query_id, operator = "Executive", "dispatch driver stopped");
        });
        true
    }

    pub fn request_rebuild(&self) {
        let _ = self.rebuild_tx.send(());
    }

    /// Batch every unassigned job into UberJobs and send them. Returns the number sent.
    pub async fn build_and_send_uber_jobs(self: &Arc<Self>) -> usize {
        if !self.all_jobs_created() || self.is_stopped() {
            return 0;
        }
        let _build = self.build_lock.lock().await;
        if self.is_stopped() {
            return 0;
        }
        // Dispatch waits for the first family map. Once one is installed, a database it
        // cannot route leaves every job missing so attempts run out.
        let Some(family_map) = self.ctx.family_map.current() else {
            warn!(
                query_id = %self.query_id,
                db = %self.dominant_db,
                operator = "Executive",
                "cannot batch jobs before a family map is built"
            );
            return 0;
        };
        let chunk_map = family_map.chunk_map_for_db(&self.dominant_db);
        if chunk_map.is_none() {
            warn!(
                query_id = %self.query_id,
                db = %self.dominant_db,
                operator = "Executive",
                "no chunk map routes the query's database"
            );
        }

        let pending = {
            let state = self.state();
            state
                .unassigned
                .iter()
                .filter_map(|(_, job_id)| state.jobs.get(job_id).cloned())
                .collect::<Vec<_>>()
        };
        if pending.is_empty() {
            return 0;
        }

        let mut resolved = Vec::with_capacity(pending.len());
        {
            let contacts = self.ctx.contacts.read().await;
            for job in pending {
                if job.status().is_terminal() {
                    self.state()
                        .unassigned
                        .remove(&(job.chunk_id(), job.job_id()));
                    continue;
                }
                let attempt = match job.increment_attempt(self.ctx.config.max_job_attempts) {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        job.set_status_with_message(JobStatus::CompleteError, Some(&e.to_string()));
                        self.ctx.messages.add(
                            self.query_id,
                            Some(job.chunk_id()),
                            messages::JOB_ERROR,
                            Severity::Error,
                            e.to_string(),
                        );
                        self.fail_query(&e);
                        return 0;
                    }
                };
                if attempt > 1 {
                    self.ctx.metrics.inc_job_retries(self.query_id.0);
                }
                let target = chunk_map
                    .as_deref()
                    .and_then(|map| resolve_worker(map, job.chunk_id(), &contacts));
                match target {
                    Some(worker_id) => resolved.push((worker_id, job)),
                    None => {
                        warn!(
                            query_id = %self.query_id,
                            job_id = %job.job_id(),
                            chunk_id = %job.chunk_id(),
                            attempt,
                            operator = "Executive",
                            "no live worker holds chunk"
                        );
                        self.ctx.metrics.inc_missing_chunks(self.query_id.0);
                        self.ctx.messages.add(
                            self.query_id,
                            Some(job.chunk_id()),
                            messages::MISSING_CHUNK,
                            Severity::Info,
                            match &chunk_map {
                                Some(_) => format!(
                                    "chunk {} has no live worker (attempt {attempt})",
                                    job.chunk_id()
                                ),
                                None => format!(
                                    "database '{}' has no chunk map (attempt {attempt})",
                                    self.dominant_db
                                ),
                            },
                        );
                    }
                }
            }
        }

        let mut sent = 0;
        for (worker_id, batches) in batch_by_worker(resolved, self.ctx.config.uber_job_max_chunks) {
            for jobs in batches {
                let uber_job_id = self.ctx.uber_job_ids.next_id();
                let mut assigned = Vec::with_capacity(jobs.len());
                for job in jobs {
                    match job.assign(uber_job_id, &worker_id) {
                        Ok(()) => assigned.push(job),
                        Err(e) => warn!(
                            query_id = %self.query_id,
                            job_id = %job.job_id(),
                            error = %e,
                            operator = "Executive",
                            "skipping job during batching"
                        ),
                    }
                }
                if assigned.is_empty() {
                    continue;
                }
                let uber_job = Arc::new(UberJob::new(
                    self.query_id,
                    uber_job_id,
                    self.ctx.config.czar_id,
                    worker_id.clone(),
                    assigned,
                ));
                {
                    let mut state = self.state();
                    // Checked under the state lock so a concurrent cancel sees this UberJob.
                    if self.is_stopped() {
                        drop(state);
                        for job in uber_job.jobs() {
                            job.cancel();
                        }
                        return sent;
                    }
                    for job in uber_job.jobs() {
                        state.unassigned.remove(&(job.chunk_id(), job.job_id()));
                    }
                    state.uber_jobs.insert(uber_job_id, Arc::clone(&uber_job));
                }
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.ctx.metrics.add_uber_jobs_in_flight(self.query_id.0, 1);
                info!(
                    query_id = %self.query_id,
                    uber_job_id = %uber_job_id,
                    worker_id = %worker_id,
                    jobs = uber_job.jobs().len(),
                    operator = "Executive",
                    "dispatching uber job"
                );
                let exec = Arc::clone(self);
                tokio::spawn(async move {
                    exec.run_uber_job(uber_job).await;
                });
                sent += 1;
            }
        }
        sent
    }

    async fn run_uber_job(self: Arc<Self>, uber_job: Arc<UberJob>) {
        let _in_flight = InFlight(&self);
        let mut signal = uber_job.subscribe();

        let contact = self
            .ctx
            .contacts
            .read()
            .await
            .contact(uber_job.worker_id())
            .cloned();
        let Some(contact) = contact else {
            self.release_uber_job(&uber_job, "worker has no live contact")
                .await;
            return;
        };
        match uber_job.signal() {
            UberJobSignal::Running => {}
            UberJobSignal::Cancelled => return,
            UberJobSignal::WorkerDead => {
                self.release_uber_job(&uber_job, "worker died before dispatch")
                    .await;
                return;
            }
        }

        let mut stream = match self
            .ctx
            .transport
            .send_uber_job(&contact, uber_job.request())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    query_id = %self.query_id,
                    uber_job_id = %uber_job.uber_job_id(),
                    worker_id = %uber_job.worker_id(),
                    error = %e,
                    operator = "Executive",
                    "uber job dispatch failed"
                );
                self.mark_worker_dead(uber_job.worker_id()).await;
                self.release_uber_job(&uber_job, &e.to_string()).await;
                return;
            }
        };
        self.ctx
            .metrics
            .inc_uber_jobs_dispatched(uber_job.worker_id().as_str());
        uber_job.set_status(JobStatus::Executing);
        for job in uber_job.jobs() {
            if job.status() == JobStatus::Dispatched {
                job.set_status(JobStatus::Executing);
            }
        }

        let end = loop {
            let item = tokio::select! {
                biased;
                raised = stopped(&mut signal) => break StreamEnd::Stopped(raised),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(response)) => {
                    if self.handle_response(&uber_job, response).await.is_err() {
                        break StreamEnd::QueryFailed;
                    }
                }
                Some(Err(e)) => break StreamEnd::Broken(e),
                None => break StreamEnd::Finished,
            }
        };
        drop(stream);

        match end {
            StreamEnd::Stopped(UberJobSignal::WorkerDead) => {
                self.release_uber_job(&uber_job, "worker died").await;
            }
            StreamEnd::Stopped(_) => {
                uber_job.cancel();
            }
            StreamEnd::QueryFailed => {
                if !uber_job.status().is_terminal() {
                    uber_job.mark_complete(false);
                }
            }
            StreamEnd::Broken(e) => {
                warn!(
                    query_id = %self.query_id,
                    uber_job_id = %uber_job.uber_job_id(),
                    worker_id = %uber_job.worker_id(),
                    error = %e,
                    operator = "Executive",
                    "response stream broke"
                );
                self.mark_worker_dead(uber_job.worker_id()).await;
                self.release_uber_job(&uber_job, &e.to_string()).await;
            }
            StreamEnd::Finished => {
                if uber_job.unfinished_jobs().is_empty() {
                    let success = uber_job
                        .jobs()
                        .iter()
                        .all(|j| j.status() == JobStatus::CompleteSuccess);
                    uber_job.mark_complete(success);
                    debug!(
                        query_id = %self.query_id,
                        uber_job_id = %uber_job.uber_job_id(),
                        success,
                        operator = "Executive",
                        "uber job finished"
                    );
                } else if self.is_stopped() {
                    uber_job.cancel();
                } else {
                    self.release_uber_job(&uber_job, "response stream ended early")
                        .await;
                }
            }
        }
    }

    /// Apply one worker response. `Err` means the query failed.
    async fn handle_response(&self, uber_job: &UberJob, response: WorkerResponse) -> Result<()> {
        let Some(job) = uber_job.job(response.job_id()) else {
            warn!(
                query_id = %self.query_id,
                uber_job_id = %uber_job.uber_job_id(),
                job_id = %response.job_id(),
                operator = "Executive",
                "response for a job outside this uber job"
            );
            return Ok(());
        };
        let attempt = JobAttemptId::new(job.job_id(), response.attempt());
        if attempt != job.current_attempt() || job.status().is_terminal() {
            debug!(
                query_id = %self.query_id,
                job_attempt = %attempt,
                status = %job.status(),
                operator = "Executive",
                "ignoring response of stale attempt"
            );
            return Ok(());
        }

        match response {
            WorkerResponse::Rows {
                ipc_payload,
                byte_size,
                ..
            } => {
                if let Err(e) = self.merger.merge(attempt, &ipc_payload, byte_size).await {
                    job.set_status_with_message(JobStatus::CompleteError, Some(&e.to_string()));
                    self.ctx.messages.add(
                        self.query_id,
                        Some(job.chunk_id()),
                        messages::MERGE_FAILED,
                        Severity::Error,
                        e.to_string(),
                    );
                    self.fail_query(&e);
                    return Err(e);
                }
                if self.merger.limit_reached() {
                    self.limit_squash();
                }
            }
            WorkerResponse::ChunkComplete { .. } => {
                if job.set_status(JobStatus::CompleteSuccess) {
                    self.merger.mark_job_complete(attempt);
                    self.job_finished();
                }
            }
            WorkerResponse::ChunkError { code, message, .. } => {
                let text = format!(
                    "chunk {} failed on worker {}: [{code}] {message}",
                    job.chunk_id(),
                    uber_job.worker_id()
                );
                job.set_status_with_message(JobStatus::CompleteError, Some(&text));
                self.ctx.messages.add(
                    self.query_id,
                    Some(job.chunk_id()),
                    messages::JOB_ERROR,
                    Severity::Error,
                    text.clone(),
                );
                let err = CzarError::Dispatch(text);
                self.fail_query(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Hand the unfinished jobs of a failed UberJob back for re-batching.
    async fn release_uber_job(&self, uber_job: &UberJob, reason: &str) {
        if !uber_job.status().is_terminal() {
            uber_job.mark_complete(false);
        }
        let unfinished = uber_job.unfinished_jobs();
        if self.is_stopped() {
            for job in &unfinished {
                job.cancel();
            }
            self.state().uber_jobs.remove(&uber_job.uber_job_id());
            self.changed.notify_waiters();
            return;
        }

        let mut released = Vec::with_capacity(unfinished.len());
        for job in unfinished {
            if let Err(e) = self.merger.invalidate_attempt(job.current_attempt()).await {
                self.ctx.messages.add(
                    self.query_id,
                    Some(job.chunk_id()),
                    messages::MERGE_FAILED,
                    Severity::Error,
                    e.to_string(),
                );
                self.fail_query(&e);
            }
            if job.unassign() {
                released.push(job);
            }
        }
        {
            let mut state = self.state();
            state.uber_jobs.remove(&uber_job.uber_job_id());
            for job in &released {
                state.unassigned.insert((job.chunk_id(), job.job_id()));
            }
        }
        warn!(
            query_id = %self.query_id,
            uber_job_id = %uber_job.uber_job_id(),
            worker_id = %uber_job.worker_id(),
            jobs = released.len(),
            reason,
            operator = "Executive",
            "uber job failed; jobs returned for reassignment"
        );
        self.ctx.messages.add(
            self.query_id,
            None,
            messages::RETRY,
            Severity::Info,
            format!(
                "uber job {} on worker {} failed ({reason}); {} jobs reassigned",
                uber_job.uber_job_id(),
                uber_job.worker_id(),
                released.len()
            ),
        );
        self.request_rebuild();
        self.changed.notify_waiters();
    }

    async fn mark_worker_dead(&self, worker_id: &WorkerId) {
        if self.ctx.contacts.write().await.mark_dead(worker_id) {
            self.ctx.metrics.inc_dead_workers(worker_id.as_str());
        }
    }

    /// Signal every live UberJob on `worker_id` that its worker is gone.
    pub fn kill_uber_jobs_on_worker(&self, worker_id: &WorkerId) -> usize {
        let uber_jobs = self
            .state()
            .uber_jobs
            .values()
            .filter(|uj| uj.worker_id() == worker_id && !uj.status().is_terminal())
            .cloned()
            .collect::<Vec<_>>();
        let killed = uber_jobs.iter().filter(|uj| uj.kill()).count();
        if killed > 0 {
            info!(
                query_id = %self.query_id,
                worker_id = %worker_id,
                uber_jobs = killed,
                operator = "Executive",
                "killed uber jobs of dead worker"
            );
        }
        killed
    }

    /// Cancel the query. Running UberJobs drain without merging.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(query_id = %self.query_id, operator = "Executive", "query cancelled");
        self.ctx.messages.add(
            self.query_id,
            None,
            messages::CANCELLED,
            Severity::Info,
            "query cancelled",
        );
        self.stop_dispatch();
        true
    }

    pub fn squash(&self) -> bool {
        self.cancel()
    }

    /// Stop early because the row limit is satisfied. The query still succeeds.
    pub fn limit_squash(&self) -> bool {
        if self.limit_squashed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(
            query_id = %self.query_id,
            operator = "Executive",
            "row limit satisfied; squashing remaining jobs"
        );
        self.ctx.messages.add(
            self.query_id,
            None,
            messages::ROW_LIMIT,
            Severity::Info,
            "row limit satisfied",
        );
        self.stop_dispatch();
        true
    }

    fn fail_query(&self, err: &CzarError) {
        {
            let mut slot = lock(&self.error);
            if slot.is_some() {
                return;
            }
            *slot = Some(err.to_query_error());
        }
        error!(
            query_id = %self.query_id,
            error = %err,
            operator = "Executive",
            "query failed"
        );
        self.stop_dispatch();
    }

    fn stop_dispatch(&self) {
        self.merger.squash();
        let entities = self.entities();
        for entity in entities.iter().filter(|e| !e.get_status().is_terminal()) {
            entity.cancel();
        }
        self.record_progress();
        self.changed.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancelled, squashed by the row limit, or failed.
    pub fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.limit_squashed.load(Ordering::SeqCst)
            || lock(&self.error).is_some()
    }

    pub fn error(&self) -> Option<QueryError> {
        lock(&self.error).clone()
    }

    fn job_finished(&self) {
        self.record_progress();
        self.changed.notify_waiters();
    }

    fn record_progress(&self) {
        let unfinished = self.unfinished_jobs();
        self.ctx
            .progress
            .record(self.query_id, now_ms().unwrap_or_default(), unfinished);
    }

    fn is_done(&self) -> bool {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if self.is_stopped() {
            return true;
        }
        self.all_jobs_created() && self.unfinished_jobs() == 0
    }

    /// Wait until every job is terminal and no UberJob is running, then finalize.
    ///
    /// The outcome is computed once; later calls return the same value.
    pub async fn join(&self) -> QueryOutcome {
        let mut outcome = self.outcome.lock().await;
        if let Some(done) = outcome.as_ref() {
            return done.clone();
        }
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                break;
            }
            notified.await;
        }
        let result = self.conclude().await;
        *outcome = Some(result.clone());
        result
    }

    async fn conclude(&self) -> QueryOutcome {
        let failed_job = self
            .jobs()
            .into_iter()
            .find(|j| j.status() == JobStatus::CompleteError);
        let outcome = if let Some(err) = self.error().or_else(|| self.merger.error()) {
            QueryOutcome::Error(err)
        } else if self.is_cancelled() {
            QueryOutcome::Cancelled
        } else if let Some(job) = failed_job {
            QueryOutcome::Error(QueryError {
                class: ErrorClass::Fatal,
                message: job.message(),
            })
        } else {
            match self.merger.finalize().await {
                Ok(rows) => QueryOutcome::Success { rows },
                Err(e) => {
                    self.ctx.messages.add(
                        self.query_id,
                        None,
                        messages::MERGE_FAILED,
                        Severity::Error,
                        e.to_string(),
                    );
                    self.fail_query(&e);
                    QueryOutcome::Error(e.to_query_error())
                }
            }
        };
        self.ctx.metrics.inc_query_outcome(outcome.as_str());
        self.record_progress();
        self.ctx.progress.untrack(self.query_id);
        info!(
            query_id = %self.query_id,
            outcome = outcome.as_str(),
            operator = "Executive",
            "query finished"
        );
        outcome
    }

    /// Drop the query's tables. Refused while UberJobs are still running.
    pub async fn discard(&self) -> Result<()> {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            return Err(CzarError::Dispatch(format!(
                "{} still has {in_flight} uber jobs in flight",
                self.query_id
            )));
        }
        self.merger.discard().await
    }

    pub fn result_table_name(&self) -> &str {
        self.merger.result_table_name()
    }

    pub async fn result_query(&self) -> String {
        self.merger.result_query().await
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.state().jobs.values().cloned().collect()
    }

    pub fn entities(&self) -> Vec<JobEntity> {
        let state = self.state();
        state
            .uber_jobs
            .values()
            .cloned()
            .map(JobEntity::UberJob)
            .chain(state.jobs.values().cloned().map(JobEntity::Job))
            .collect()
    }

    pub fn unfinished_jobs(&self) -> usize {
        self.state()
            .jobs
            .values()
            .filter(|j| !j.status().is_terminal())
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// UberJobs currently known to this query, failed ones excluded.
    pub fn uber_job_summaries(&self) -> Vec<UberJobSummary> {
        self.state()
            .uber_jobs
            .values()
            .map(|uj| UberJobSummary {
                uber_job_id: uj.uber_job_id(),
                worker_id: uj.worker_id().clone(),
                chunk_ids: uj.jobs().iter().map(|j| j.chunk_id()).collect(),
                status: uj.status(),
            })
            .collect()
    }
}

/// Live worker for `chunk_id`: the primary scan worker, else the first live replica holder.
pub fn resolve_worker(
    chunk_map: &ChunkMap,
    chunk_id: ChunkId,
    contacts: &WorkerContactMap,
) -> Option<WorkerId> {
    let entry = chunk_map.chunk(chunk_id)?;
    if let Some(primary) = &entry.primary_scan_worker {
        if contacts.is_alive(primary) {
            return Some(primary.clone());
        }
    }
    entry
        .workers
        .iter()
        .find(|worker_id| contacts.is_alive(worker_id))
        .cloned()
}

/// Group items per worker into batches of at most `max_per_batch`, keeping input order.
pub fn batch_by_worker<T>(
    items: Vec<(WorkerId, T)>,
    max_per_batch: usize,
) -> BTreeMap<WorkerId, Vec<Vec<T>>> {
    let max_per_batch = max_per_batch.max(1);
    let mut out: BTreeMap<WorkerId, Vec<Vec<T>>> = BTreeMap::new();
    for (worker_id, item) in items {
        let batches = out.entry(worker_id).or_default();
        match batches.last_mut() {
            Some(last) if last.len() < max_per_batch => last.push(item),
            _ => batches.push(vec![item]),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use czar_chunkmap::{ChunkInventory, WorkerContact, WorkerContactSnapshot};

    #[test]
    fn batches_are_bounded_and_cover_every_item_once() {
        for (n, k) in [(1usize, 1usize), (3, 2), (10, 3), (10, 10), (7, 20)] {
            let items = (0..n)
                .map(|i| (WorkerId::from(if i % 4 == 0 { "w2" } else { "w1" }), i))
                .collect::<Vec<_>>();
            let per_worker = items.iter().fold(BTreeMap::new(), |mut acc, (w, _)| {
                *acc.entry(w.clone()).or_insert(0usize) += 1;
                acc
            });
            let batches = batch_by_worker(items, k);
            let mut seen = Vec::new();
            for (worker_id, worker_batches) in &batches {
                let count = per_worker[worker_id];
                assert_eq!(worker_batches.len(), count.div_ceil(k));
                for batch in worker_batches {
                    assert!(!batch.is_empty() && batch.len() <= k);
                    seen.extend(batch.iter().copied());
                }
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn batches_keep_ascending_order() {
        let items = vec![
            (WorkerId::from("w1"), 1),
            (WorkerId::from("w1"), 2),
            (WorkerId::from("w1"), 3),
        ];
        let batches = batch_by_worker(items, 2);
        assert_eq!(batches[&WorkerId::from("w1")], vec![vec![1, 2], vec![3]]);
    }

    fn contact(ts: u64) -> WorkerContact {
        WorkerContact {
            host: "localhost".to_string(),
            management_host: String::new(),
            port: 5000,
            last_update_time_ms: ts,
        }
    }

    #[test]
    fn resolves_primary_then_falls_back_to_live_replica() {
        let mut inventory = ChunkInventory::new();
        inventory.insert("w1", "db", "Object", 1, 100);
        inventory.insert("w2", "db", "Object", 1, 100);
        inventory.insert("w2", "db", "Object", 2, 50);
        let map = ChunkMap::build(&inventory, None).expect("build");
        let primary = map.primary_scan_worker(ChunkId(1)).cloned().expect("primary");
        let other = if primary == WorkerId::from("w1") {
            WorkerId::from("w2")
        } else {
            WorkerId::from("w1")
        };

        let mut contacts = WorkerContactMap::new(1_000);
        contacts.apply_snapshot(
            &WorkerContactSnapshot::default()
                .with_worker("w1", contact(1_000))
                .with_worker("w2", contact(1_000)),
            1_500,
        );
        assert_eq!(resolve_worker(&map, ChunkId(1), &contacts), Some(primary.clone()));

        contacts.mark_dead(&primary);
        assert_eq!(resolve_worker(&map, ChunkId(1), &contacts), Some(other.clone()));

        contacts.mark_dead(&other);
        assert_eq!(resolve_worker(&map, ChunkId(1), &contacts), None);
        assert_eq!(resolve_worker(&map, ChunkId(99), &contacts), None);
    }
}
