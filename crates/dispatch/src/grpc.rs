//! gRPC glue for the czar/worker wire contract.
//!
//! RPC schema source: `proto/czar_worker.proto`.
//!
//! - [`GrpcWorkerTransport`] is the czar side: one cached client per worker endpoint.
//! - [`WorkerGrpcService`] is a worker-side adapter serving `RunUberJob` from a
//!   [`ChunkRunner`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use czar_chunkmap::WorkerContact;
use czar_common::{ChunkId, CzarError, CzarId, JobId, QueryId, UberJobId, WorkerId};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_stream::{self as stream, Stream};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::transport::{
    run_uber_job_locally, ChunkRequest, ChunkRunner, ResponseStream, UberJobRequest,
    WorkerResponse, WorkerTransport,
};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("czar.worker.v1");
}

pub use v1::worker_service_client::WorkerServiceClient;
pub use v1::worker_service_server::{WorkerService, WorkerServiceServer};

fn proto_request(req: &UberJobRequest) -> v1::UberJobRequest {
    v1::UberJobRequest {
        query_id: req.query_id.0,
        uber_job_id: req.uber_job_id.0,
        czar_id: req.czar_id.0,
        worker_id: req.worker_id.to_string(),
        chunks: req
            .chunks
            .iter()
            .map(|c| v1::ChunkQuery {
                job_id: c.job_id.0,
                attempt: c.attempt,
                chunk_id: c.chunk_id.0,
                db_name: c.db_name.clone(),
                sql_text: c.sql_text.clone(),
            })
            .collect(),
    }
}

fn core_request(req: v1::UberJobRequest) -> UberJobRequest {
    UberJobRequest {
        query_id: QueryId(req.query_id),
        uber_job_id: UberJobId(req.uber_job_id),
        czar_id: CzarId(req.czar_id),
        worker_id: WorkerId::from(req.worker_id),
        chunks: req
            .chunks
            .into_iter()
            .map(|c| ChunkRequest {
                job_id: JobId(c.job_id),
                attempt: c.attempt,
                chunk_id: ChunkId(c.chunk_id),
                db_name: c.db_name,
                sql_text: c.sql_text,
            })
            .collect(),
    }
}

fn proto_response(resp: WorkerResponse) -> v1::WorkerResponse {
    use v1::worker_response::Body;
    let body = match resp {
        WorkerResponse::Rows {
            job_id,
            attempt,
            ipc_payload,
            row_count,
            byte_size,
        } => Body::Rows(v1::RowBatch {
            job_id: job_id.0,
            attempt,
            ipc_payload,
            row_count,
            byte_size,
        }),
        WorkerResponse::ChunkComplete { job_id, attempt } => Body::Complete(v1::ChunkComplete {
            job_id: job_id.0,
            attempt,
        }),
        WorkerResponse::ChunkError {
            job_id,
            attempt,
            code,
            message,
        } => Body::Error(v1::ChunkError {
            job_id: job_id.0,
            attempt,
            error_code: code,
            error_message: message,
        }),
    };
    v1::WorkerResponse { body: Some(body) }
}

fn core_response(resp: v1::WorkerResponse) -> Result<WorkerResponse, CzarError> {
    use v1::worker_response::Body;
    match resp.body {
        Some(Body::Rows(b)) => Ok(WorkerResponse::Rows {
            job_id: JobId(b.job_id),
            attempt: b.attempt,
            ipc_payload: b.ipc_payload,
            row_count: b.row_count,
            byte_size: b.byte_size,
        }),
        Some(Body::Complete(c)) => Ok(WorkerResponse::ChunkComplete {
            job_id: JobId(c.job_id),
            attempt: c.attempt,
        }),
        Some(Body::Error(e)) => Ok(WorkerResponse::ChunkError {
            job_id: JobId(e.job_id),
            attempt: e.attempt,
            code: e.error_code,
            message: e.error_message,
        }),
        None => Err(CzarError::Transport(
            "worker response without body".to_string(),
        )),
    }
}

/// Czar-side transport over gRPC.
#[derive(Debug, Default)]
pub struct GrpcWorkerTransport {
    clients: Mutex<HashMap<String, WorkerServiceClient<Channel>>>,
}

impl GrpcWorkerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, endpoint: &str) -> Result<WorkerServiceClient<Channel>, CzarError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }
        let client = WorkerServiceClient::connect(format!("http://{endpoint}"))
            .await
            .map_err(|e| CzarError::Transport(format!("connect to {endpoint} failed: {e}")))?;
        debug!(endpoint, operator = "GrpcWorkerTransport", "connected to worker");
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl WorkerTransport for GrpcWorkerTransport {
    async fn send_uber_job(
        &self,
        contact: &WorkerContact,
        request: UberJobRequest,
    ) -> Result<ResponseStream, CzarError> {
        let endpoint = contact.endpoint();
        let mut client = self.client(&endpoint).await?;
        let response = match client.run_uber_job(proto_request(&request)).await {
            Ok(response) => response,
            Err(status) => {
                self.clients.lock().await.remove(&endpoint);
                warn!(
                    endpoint = %endpoint,
                    uber_job_id = %request.uber_job_id,
                    status = %status,
                    operator = "GrpcWorkerTransport",
                    "RunUberJob rejected"
                );
                return Err(CzarError::Transport(format!(
                    "RunUberJob on {endpoint} failed: {status}"
                )));
            }
        };
        let stream = response.into_inner().map(|item| match item {
            Ok(msg) => core_response(msg),
            Err(status) => Err(CzarError::Transport(format!(
                "worker stream failed: {status}"
            ))),
        });
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
/// Worker-side `WorkerService` running chunk queries through a [`ChunkRunner`].
pub struct WorkerGrpcService {
    runner: Arc<dyn ChunkRunner>,
}

impl WorkerGrpcService {
    pub fn new(runner: Arc<dyn ChunkRunner>) -> Self {
        Self { runner }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerGrpcService {
    type RunUberJobStream =
        std::pin::Pin<Box<dyn Stream<Item = Result<v1::WorkerResponse, Status>> + Send>>;

    async fn run_uber_job(
        &self,
        request: Request<v1::UberJobRequest>,
    ) -> Result<Response<Self::RunUberJobStream>, Status> {
        let req = core_request(request.into_inner());
        if req.chunks.is_empty() {
            return Err(Status::invalid_argument("uber job has no chunks"));
        }
        let runner = Arc::clone(&self.runner);
        let out = tokio::task::spawn_blocking(move || run_uber_job_locally(runner.as_ref(), &req))
            .await
            .map_err(|e| to_status(CzarError::Dispatch(format!("worker task failed: {e}"))))?
            .into_iter()
            .map(|r| Ok(proto_response(r)))
            .collect::<Vec<_>>();
        Ok(Response::new(Box::pin(stream::iter(out))))
    }
}

fn to_status(err: CzarError) -> Status {
    match err {
        CzarError::InvalidConfig(msg) => Status::invalid_argument(msg),
        CzarError::NotReady(msg) => Status::unavailable(msg),
        CzarError::Transport(msg) | CzarError::SqlConnection(msg) => Status::unavailable(msg),
        CzarError::Cancelled(msg) => Status::cancelled(msg),
        CzarError::Unsupported(msg) => Status::unimplemented(msg),
        CzarError::ResultTooLarge { size, limit } => {
            Status::resource_exhausted(format!("result size {size} exceeds {limit}"))
        }
        other => Status::internal(other.to_string()),
    }
}
