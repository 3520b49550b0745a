//! Query dispatch for the czar.
//!
//! Architecture role:
//! - [`Executive`] owns one query's [`Job`]s, batches them per worker into [`UberJob`]s,
//!   streams worker results into the query's merger and decides the outcome
//! - [`Czar`] is the process-wide service object holding the shared maps, transport,
//!   result database and diagnostics
//! - [`WorkerTransport`] abstracts the czar/worker wire contract
//!
//! Feature flags:
//! - `grpc`: tonic transport and worker service adapter in [`grpc`].

pub mod czar;
pub mod entity;
pub mod executive;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod job;
pub mod messages;
pub mod progress;
pub mod transport;
pub mod uber_job;

pub use czar::{Czar, QueryPlan};
pub use entity::JobEntity;
pub use executive::{
    batch_by_worker, resolve_worker, Executive, ExecutiveContext, QueryOutcome, UberJobSummary,
};
pub use job::{ChunkQuerySpec, Job, JobStatus};
pub use messages::{MessageStore, QueryMessage, Severity};
pub use progress::{ProgressSample, QueryProgress, QueryProgressHistory};
pub use transport::{
    run_uber_job_locally, ChunkRequest, ChunkRunner, InProcessTransport, ResponseStream,
    UberJobRequest, WorkerFault, WorkerResponse, WorkerTransport,
};
pub use uber_job::{UberJob, UberJobSignal};
