use sha_domain::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Domain(#[from] sha_domain::DomainError),

    #[error(transparent)]
    Store(#[from] sha_store::StoreError),

    #[error(transparent)]
    Graph(#[from] sha_graph::GraphError),

    #[error("job {0} not found")]
    JobNotFound(sha_domain::JobId),

    #[error("step {seq} of job {job_id} not found")]
    StepNotFound { job_id: sha_domain::JobId, seq: u32 },
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::Domain(e) => e.kind(),
            TrackerError::Store(e) => e.kind(),
            TrackerError::Graph(_) => ErrorKind::InvariantViolation,
            TrackerError::JobNotFound(_) | TrackerError::StepNotFound { .. } => ErrorKind::NotFound,
        }
    }
}
