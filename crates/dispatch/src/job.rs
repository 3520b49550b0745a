//! Chunk-level jobs and their lifecycle.
//!
//! State machine:
//! `Pending -> Dispatched -> Executing -> {CompleteSuccess | CompleteError}`, with `Cancelled`
//! reachable from every non-terminal state. Once a job is terminal every further status change
//! is rejected and logged.

use std::sync::{Mutex, MutexGuard};

use czar_common::{
    ChunkId, CzarError, JobAttemptId, JobId, QueryId, Result, UberJobId, WorkerId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Job/UberJob status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Dispatched,
    Executing,
    CompleteSuccess,
    CompleteError,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::CompleteSuccess | JobStatus::CompleteError | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Executing => "EXECUTING",
            JobStatus::CompleteSuccess => "COMPLETE_SUCCESS",
            JobStatus::CompleteError => "COMPLETE_ERROR",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk sub-query produced by query planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkQuerySpec {
    pub chunk_id: ChunkId,
    pub db_name: String,
    pub sql_text: String,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    attempt_count: u32,
    uber_job_id: Option<UberJobId>,
    worker_id: Option<WorkerId>,
    message: String,
}

/// One chunk query of a user query. Owned by the query's executive.
#[derive(Debug)]
pub struct Job {
    query_id: QueryId,
    job_id: JobId,
    spec: ChunkQuerySpec,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(query_id: QueryId, job_id: JobId, spec: ChunkQuerySpec) -> Self {
        Self {
            query_id,
            job_id,
            spec,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                attempt_count: 0,
                uber_job_id: None,
                worker_id: None,
                message: String::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.spec.chunk_id
    }

    pub fn spec(&self) -> &ChunkQuerySpec {
        &self.spec
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn attempt_count(&self) -> u32 {
        self.state().attempt_count
    }

    /// Attempt id of the latest resolve.
    pub fn current_attempt(&self) -> JobAttemptId {
        JobAttemptId::new(self.job_id, self.attempt_count())
    }

    pub fn uber_job_id(&self) -> Option<UberJobId> {
        self.state().uber_job_id
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.state().worker_id.clone()
    }

    pub fn message(&self) -> String {
        self.state().message.clone()
    }

    /// Move to `status` unless the job is already terminal. Returns whether it moved.
    pub fn set_status(&self, status: JobStatus) -> bool {
        self.set_status_with_message(status, None)
    }

    pub fn set_status_with_message(&self, status: JobStatus, message: Option<&str>) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            if state.status != status {
                warn!(
                    query_id = %self.query_id,
                    job_id = %self.job_id,
                    current = %state.status,
                    rejected = %status,
                    operator = "Job",
                    "rejected status change of terminal job"
                );
            }
            return false;
        }
        debug!(
            query_id = %self.query_id,
            job_id = %self.job_id,
            from = %state.status,
            to = %status,
            operator = "Job",
            "job status change"
        );
        state.status = status;
        if let Some(message) = message {
            state.message = message.to_string();
        }
        true
    }

    pub fn cancel(&self) -> bool {
        self.set_status(JobStatus::Cancelled)
    }

    /// Count a new resolve of this job. Fails once `max_attempts` is exceeded.
    pub fn increment_attempt(&self, max_attempts: u32) -> Result<u32> {
        let mut state = self.state();
        state.attempt_count += 1;
        if state.attempt_count > max_attempts {
            return Err(CzarError::AttemptsExhausted(format!(
                "{} job {} chunk {} exceeded {max_attempts} attempts",
                self.query_id, self.job_id, self.spec.chunk_id
            )));
        }
        Ok(state.attempt_count)
    }

    /// Attach to an UberJob. Fails for terminal jobs and jobs already attached elsewhere.
    pub fn assign(&self, uber_job_id: UberJobId, worker_id: &WorkerId) -> Result<()> {
        let mut state = self.state();
        if state.status.is_terminal() {
            return Err(CzarError::Dispatch(format!(
                "job {} is {} and cannot be assigned",
                self.job_id, state.status
            )));
        }
        if let Some(current) = state.uber_job_id {
            return Err(CzarError::Dispatch(format!(
                "job {} already belongs to uber job {current}",
                self.job_id
            )));
        }
        state.uber_job_id = Some(uber_job_id);
        state.worker_id = Some(worker_id.clone());
        state.status = JobStatus::Dispatched;
        Ok(())
    }

    /// Detach from its UberJob so the job can be re-batched. Terminal jobs keep their status.
    pub fn unassign(&self) -> bool {
        let mut state = self.state();
        state.uber_job_id = None;
        state.worker_id = None;
        if state.status.is_terminal() {
            return false;
        }
        state.status = JobStatus::Pending;
        true
    }
}
