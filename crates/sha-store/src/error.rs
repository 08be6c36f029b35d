use sha_domain::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("enrollment not found: {0}")]
    EnrollmentNotFound(String),

    #[error("device mapping not found for volume: {0}")]
    DeviceMappingNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::JobNotFound(_)
            | StoreError::EnrollmentNotFound(_)
            | StoreError::DeviceMappingNotFound(_) => ErrorKind::NotFound,
            StoreError::Serialization(_) | StoreError::Internal(_) => ErrorKind::Internal,
        }
    }
}
