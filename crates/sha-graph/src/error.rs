use sha_domain::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("job '{job_id}' declares parent '{parent_job_id}' which is not in the given set")]
    DanglingParent { job_id: JobId, parent_job_id: JobId },

    #[error("cycle detected in job parent-chain graph")]
    CycleDetected,

    #[error("multiple errors")]
    Multiple(Vec<GraphError>),
}
