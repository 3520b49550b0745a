//! Czar/worker wire contract and transports.
//!
//! The czar sends one [`UberJobRequest`] per UberJob to the worker's contact endpoint and reads
//! back a stream of [`WorkerResponse`]s: row batches (Arrow IPC) per chunk, each chunk ending
//! with [`WorkerResponse::ChunkComplete`] or [`WorkerResponse::ChunkError`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use czar_chunkmap::WorkerContact;
use czar_common::{ChunkId, CzarError, CzarId, JobId, QueryId, Result, UberJobId, WorkerId};
use czar_merge::encode_record_batches_ipc;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Error code reported by workers when a chunk query fails.
pub const CHUNK_QUERY_FAILED: i32 = 1;

/// One chunk query inside an UberJob payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub job_id: JobId,
    pub attempt: u32,
    pub chunk_id: ChunkId,
    pub db_name: String,
    pub sql_text: String,
}

/// Payload sent to a worker for one UberJob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UberJobRequest {
    pub query_id: QueryId,
    pub uber_job_id: UberJobId,
    pub czar_id: CzarId,
    pub worker_id: WorkerId,
    pub chunks: Vec<ChunkRequest>,
}

/// One message of a worker's response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    Rows {
        job_id: JobId,
        attempt: u32,
        ipc_payload: Vec<u8>,
        row_count: u64,
        byte_size: u64,
    },
    ChunkComplete {
        job_id: JobId,
        attempt: u32,
    },
    ChunkError {
        job_id: JobId,
        attempt: u32,
        code: i32,
        message: String,
    },
}

impl WorkerResponse {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerResponse::Rows { job_id, .. }
            | WorkerResponse::ChunkComplete { job_id, .. }
            | WorkerResponse::ChunkError { job_id, .. } => *job_id,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            WorkerResponse::Rows { attempt, .. }
            | WorkerResponse::ChunkComplete { attempt, .. }
            | WorkerResponse::ChunkError { attempt, .. } => *attempt,
        }
    }
}

/// Response stream of one UberJob. An `Err` item means the connection to the worker broke.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<WorkerResponse>> + Send>>;

#[async_trait]
/// Sends UberJobs to workers.
pub trait WorkerTransport: Send + Sync {
    async fn send_uber_job(
        &self,
        contact: &WorkerContact,
        request: UberJobRequest,
    ) -> Result<ResponseStream>;
}

/// Worker-side execution of one chunk query.
pub trait ChunkRunner: Send + Sync {
    fn run_chunk(&self, worker_id: &WorkerId, chunk: &ChunkRequest) -> Result<Vec<RecordBatch>>;
}

/// Run every chunk of `request` and produce the worker's response sequence.
pub fn run_uber_job_locally(
    runner: &dyn ChunkRunner,
    request: &UberJobRequest,
) -> Vec<WorkerResponse> {
    let mut out = Vec::with_capacity(request.chunks.len() * 2);
    for chunk in &request.chunks {
        let outcome = runner.run_chunk(&request.worker_id, chunk).and_then(|batches| {
            let row_count = batches.iter().map(|b| b.num_rows() as u64).sum::<u64>();
            let ipc_payload = encode_record_batches_ipc(&batches)?;
            Ok((row_count, ipc_payload))
        });
        match outcome {
            Ok((row_count, ipc_payload)) => {
                if row_count > 0 {
                    out.push(WorkerResponse::Rows {
                        job_id: chunk.job_id,
                        attempt: chunk.attempt,
                        byte_size: ipc_payload.len() as u64,
                        ipc_payload,
                        row_count,
                    });
                }
                out.push(WorkerResponse::ChunkComplete {
                    job_id: chunk.job_id,
                    attempt: chunk.attempt,
                });
            }
            Err(e) => {
                warn!(
                    worker_id = %request.worker_id,
                    chunk_id = %chunk.chunk_id,
                    error = %e,
                    operator = "WorkerChunkRunner",
                    "chunk query failed"
                );
                out.push(WorkerResponse::ChunkError {
                    job_id: chunk.job_id,
                    attempt: chunk.attempt,
                    code: CHUNK_QUERY_FAILED,
                    message: e.to_string(),
                });
            }
        }
    }
    out
}

/// Simulated failure of one in-process worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFault {
    /// Sending the UberJob fails.
    Unreachable,
    /// The first row batch arrives, then the connection breaks.
    DropAfterFirstBatch,
    /// The first row batch arrives, then the worker goes silent.
    HangAfterFirstBatch,
    /// The worker accepts the UberJob and never answers.
    Hang,
}

/// Transport that executes UberJobs in-process through a [`ChunkRunner`].
pub struct InProcessTransport {
    runner: Arc<dyn ChunkRunner>,
    faults: Mutex<HashMap<WorkerId, WorkerFault>>,
    sent: Mutex<Vec<UberJobRequest>>,
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport").finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl InProcessTransport {
    pub fn new(runner: Arc<dyn ChunkRunner>) -> Self {
        Self {
            runner,
            faults: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fault(&self, worker_id: &WorkerId, fault: Option<WorkerFault>) {
        let mut faults = lock(&self.faults);
        match fault {
            Some(fault) => faults.insert(worker_id.clone(), fault),
            None => faults.remove(worker_id),
        };
    }

    /// Every request sent so far, in send order.
    pub fn sent_requests(&self) -> Vec<UberJobRequest> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl WorkerTransport for InProcessTransport {
    async fn send_uber_job(
        &self,
        _contact: &WorkerContact,
        request: UberJobRequest,
    ) -> Result<ResponseStream> {
        let fault = lock(&self.faults).get(&request.worker_id).copied();
        lock(&self.sent).push(request.clone());
        debug!(
            query_id = %request.query_id,
            uber_job_id = %request.uber_job_id,
            worker_id = %request.worker_id,
            chunks = request.chunks.len(),
            operator = "InProcessTransport",
            "uber job sent"
        );
        if fault == Some(WorkerFault::Unreachable) {
            return Err(CzarError::Transport(format!(
                "worker {} unreachable",
                request.worker_id
            )));
        }
        if fault == Some(WorkerFault::Hang) {
            return Ok(Box::pin(stream::pending::<Result<WorkerResponse>>()));
        }

        let runner = Arc::clone(&self.runner);
        let responses = tokio::task::spawn_blocking(move || {
            run_uber_job_locally(runner.as_ref(), &request)
        })
        .await
        .map_err(|e| CzarError::Transport(format!("worker task failed: {e}")))?;

        let mut items = responses.into_iter().map(Ok).collect::<Vec<_>>();
        match fault {
            Some(WorkerFault::DropAfterFirstBatch) | Some(WorkerFault::HangAfterFirstBatch) => {
                let first_rows = items
                    .iter()
                    .position(|r| matches!(r, Ok(WorkerResponse::Rows { .. })))
                    .map_or(0, |i| i + 1);
                items.truncate(first_rows);
                if fault == Some(WorkerFault::DropAfterFirstBatch) {
                    items.push(Err(CzarError::Transport("connection reset by worker".to_string())));
                    Ok(Box::pin(stream::iter(items)))
                } else {
                    Ok(Box::pin(stream::iter(items).chain(stream::pending())))
                }
            }
            _ => Ok(Box::pin(stream::iter(items))),
        }
    }
}
