//! A batch of chunk jobs routed to one worker.

use std::sync::{Arc, Mutex, MutexGuard};

use czar_common::{CzarId, JobId, QueryId, UberJobId, WorkerId};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::job::{Job, JobStatus};
use crate::transport::{ChunkRequest, UberJobRequest};

/// Stop signal observed by the task reading an UberJob's responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UberJobSignal {
    Running,
    /// The query was cancelled or squashed. Jobs are already `Cancelled`.
    Cancelled,
    /// The worker was found dead. Jobs must be reassigned.
    WorkerDead,
}

/// Jobs sent to one worker in a single request.
#[derive(Debug)]
pub struct UberJob {
    query_id: QueryId,
    uber_job_id: UberJobId,
    czar_id: CzarId,
    worker_id: WorkerId,
    jobs: Vec<Arc<Job>>,
    status: Mutex<JobStatus>,
    signal: watch::Sender<UberJobSignal>,
}

impl UberJob {
    pub fn new(
        query_id: QueryId,
        uber_job_id: UberJobId,
        czar_id: CzarId,
        worker_id: WorkerId,
        jobs: Vec<Arc<Job>>,
    ) -> Self {
        let (signal, _) = watch::channel(UberJobSignal::Running);
        Self {
            query_id,
            uber_job_id,
            czar_id,
            worker_id,
            jobs,
            status: Mutex::new(JobStatus::Dispatched),
            signal,
        }
    }

    fn status_guard(&self) -> MutexGuard<'_, JobStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn uber_job_id(&self) -> UberJobId {
        self.uber_job_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.job_id()).collect()
    }

    pub fn job(&self, job_id: JobId) -> Option<&Arc<Job>> {
        self.jobs.iter().find(|j| j.job_id() == job_id)
    }

    /// Wire payload carrying each job's current attempt.
    pub fn request(&self) -> UberJobRequest {
        UberJobRequest {
            query_id: self.query_id,
            uber_job_id: self.uber_job_id,
            czar_id: self.czar_id,
            worker_id: self.worker_id.clone(),
            chunks: self
                .jobs
                .iter()
                .map(|job| ChunkRequest {
                    job_id: job.job_id(),
                    attempt: job.attempt_count(),
                    chunk_id: job.chunk_id(),
                    db_name: job.spec().db_name.clone(),
                    sql_text: job.spec().sql_text.clone(),
                })
                .collect(),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status_guard()
    }

    /// Same terminal guard as [`Job::set_status`].
    pub fn set_status(&self, status: JobStatus) -> bool {
        let mut current = self.status_guard();
        if current.is_terminal() {
            if *current != status {
                warn!(
                    query_id = %self.query_id,
                    uber_job_id = %self.uber_job_id,
                    current = %*current,
                    rejected = %status,
                    operator = "UberJob",
                    "rejected status change of terminal uber job"
                );
            }
            return false;
        }
        *current = status;
        true
    }

    /// Stop reading responses and cancel every unfinished job.
    pub fn cancel(&self) -> bool {
        self.raise(UberJobSignal::Cancelled);
        for job in &self.jobs {
            if !job.status().is_terminal() {
                job.cancel();
            }
        }
        if self.status().is_terminal() {
            return false;
        }
        self.set_status(JobStatus::Cancelled)
    }

    /// The worker died; the response reader hands the jobs back for reassignment.
    pub fn kill(&self) -> bool {
        self.raise(UberJobSignal::WorkerDead)
    }

    fn raise(&self, signal: UberJobSignal) -> bool {
        let raised = self.signal.send_if_modified(|current| {
            if *current == UberJobSignal::Running {
                *current = signal;
                true
            } else {
                false
            }
        });
        if raised {
            debug!(
                query_id = %self.query_id,
                uber_job_id = %self.uber_job_id,
                worker_id = %self.worker_id,
                signal = ?signal,
                operator = "UberJob",
                "uber job signalled"
            );
        }
        raised
    }

    pub fn signal(&self) -> UberJobSignal {
        *self.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UberJobSignal> {
        self.signal.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == UberJobSignal::Cancelled
    }

    /// Jobs that have not reached a terminal state.
    pub fn unfinished_jobs(&self) -> Vec<Arc<Job>> {
        self.jobs
            .iter()
            .filter(|j| !j.status().is_terminal())
            .cloned()
            .collect()
    }

    pub fn mark_complete(&self, success: bool) -> bool {
        self.set_status(if success {
            JobStatus::CompleteSuccess
        } else {
            JobStatus::CompleteError
        })
    }
}

/// Resolves once `rx` leaves [`UberJobSignal::Running`].
pub(crate) async fn stopped(rx: &mut watch::Receiver<UberJobSignal>) -> UberJobSignal {
    match rx.wait_for(|s| *s != UberJobSignal::Running).await {
        Ok(signal) => *signal,
        Err(_) => UberJobSignal::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ChunkQuerySpec;
    use czar_common::ChunkId;

    fn uber_job(chunks: &[i64]) -> UberJob {
        let jobs = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Arc::new(Job::new(
                    QueryId(7),
                    JobId(i as u32),
                    ChunkQuerySpec {
                        chunk_id: ChunkId(*c),
                        db_name: "LSST".to_string(),
                        sql_text: format!("SELECT * FROM Object_{c}"),
                    },
                ))
            })
            .collect::<Vec<_>>();
        for job in &jobs {
            job.increment_attempt(3).expect("attempt");
        }
        UberJob::new(
            QueryId(7),
            UberJobId(1_000_000_001),
            CzarId(1),
            WorkerId::from("w1"),
            jobs,
        )
    }

    #[test]
    fn request_carries_current_attempts() {
        let uj = uber_job(&[10, 11]);
        uj.jobs()[1].increment_attempt(3).expect("attempt");
        let req = uj.request();
        assert_eq!(req.chunks.len(), 2);
        assert_eq!(req.chunks[0].attempt, 1);
        assert_eq!(req.chunks[1].attempt, 2);
        assert_eq!(req.chunks[1].chunk_id, ChunkId(11));
        assert_eq!(req.worker_id, WorkerId::from("w1"));
    }

    #[tokio::test]
    async fn cancel_signals_reader_and_cancels_jobs() {
        let uj = uber_job(&[10, 11]);
        uj.jobs()[0].set_status(JobStatus::CompleteSuccess);
        let mut rx = uj.subscribe();
        assert!(uj.cancel());
        assert_eq!(stopped(&mut rx).await, UberJobSignal::Cancelled);
        assert_eq!(uj.jobs()[0].status(), JobStatus::CompleteSuccess);
        assert_eq!(uj.jobs()[1].status(), JobStatus::Cancelled);
        assert!(uj.unfinished_jobs().is_empty());
        // A later kill does not override the cancel.
        assert!(!uj.kill());
        assert!(uj.is_cancelled());
    }

    #[test]
    fn kill_leaves_jobs_for_reassignment() {
        let uj = uber_job(&[10]);
        assert!(uj.kill());
        assert_eq!(uj.signal(), UberJobSignal::WorkerDead);
        assert_eq!(uj.unfinished_jobs().len(), 1);
    }
}
