use thiserror::Error;

use super::model::JobStatus;
use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{job_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job '{job_id}' is {status} and can no longer be cancelled")]
    NotCancellable { job_id: String, status: JobStatus },

    #[error("Job '{job_id}' is {status}; item results are only accepted while processing")]
    NotProcessing { job_id: String, status: JobStatus },

    #[error("Job '{job_id}' would account for {attempted} items but only {total} exist")]
    CounterOverflow {
        job_id: String,
        total: u64,
        attempted: u64,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
