use std::sync::Arc;

use czar_common::QueryId;

use crate::job::{Job, JobStatus};
use crate::uber_job::UberJob;

/// Either kind of dispatchable unit, with the capabilities the executive needs from both.
#[derive(Debug, Clone)]
pub enum JobEntity {
    Job(Arc<Job>),
    UberJob(Arc<UberJob>),
}

impl JobEntity {
    pub fn get_query_id(&self) -> QueryId {
        match self {
            JobEntity::Job(job) => job.query_id(),
            JobEntity::UberJob(uj) => uj.query_id(),
        }
    }

    pub fn get_status(&self) -> JobStatus {
        match self {
            JobEntity::Job(job) => job.status(),
            JobEntity::UberJob(uj) => uj.status(),
        }
    }

    pub fn cancel(&self) -> bool {
        match self {
            JobEntity::Job(job) => job.cancel(),
            JobEntity::UberJob(uj) => uj.cancel(),
        }
    }

    pub fn mark_complete(&self, success: bool) -> bool {
        match self {
            JobEntity::Job(job) => job.set_status(if success {
                JobStatus::CompleteSuccess
            } else {
                JobStatus::CompleteError
            }),
            JobEntity::UberJob(uj) => uj.mark_complete(success),
        }
    }
}
