use sha_domain::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Tracker(#[from] sha_tracker::TrackerError),

    #[error(transparent)]
    Volume(#[from] sha_volume::VolumeError),

    #[error("job was cancelled")]
    Cancelled,

    #[error("unknown job kind: {0}")]
    UnknownKind(String),

    #[error("rollback failed after workflow error: {0}")]
    RollbackFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Tracker(e) => e.kind(),
            OrchestratorError::Volume(e) => e.kind(),
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::UnknownKind(_) => ErrorKind::Validation,
            OrchestratorError::RollbackFailed(_) => ErrorKind::InvariantViolation,
            OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// A short, operator-actionable hint — the original technical message is
    /// logged but never returned verbatim to end users.
    pub fn user_hint(&self, context: &str) -> String {
        match self {
            OrchestratorError::Volume(sha_volume::VolumeError::DeviceCorrelationTimeout { volume_id, .. }) => {
                format!("{context} failed at volume attach — try again, or detach stale volume {volume_id}")
            }
            OrchestratorError::Cancelled => format!("{context} was cancelled"),
            _ => format!("{context} failed"),
        }
    }
}
