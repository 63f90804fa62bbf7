use jobhost_core::{JobId, JobStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("environment setup failed: {0}")]
    Materialization(String),

    #[error("failed to launch entrypoint: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("job supervisor lost: {0}")]
    SupervisorLost(String),

    #[error("failed to dispatch supervisor: {0}")]
    Dispatch(String),
}

impl JobError {
    /// Errors that may be returned synchronously from the public API.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateJob(_)
                | Self::NotFound(_)
                | Self::InvalidInput(_)
                | Self::InvalidEnvironment(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
