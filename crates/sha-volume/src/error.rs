use sha_domain::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume {0} is already attached elsewhere")]
    AttachConflict(String),

    #[error("device correlation timed out waiting for volume {volume_id} to appear (waited {waited_ms}ms)")]
    DeviceCorrelationTimeout { volume_id: String, waited_ms: u64 },

    #[error("device detach timed out waiting for volume {volume_id} to disappear (waited {waited_ms}ms)")]
    DeviceDetachTimeout { volume_id: String, waited_ms: u64 },

    #[error("upstream CloudStack error: {0}")]
    UpstreamCloudStackError(String),

    #[error("upstream CloudStack error (transient): {0}")]
    UpstreamCloudStackTransient(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Store(#[from] sha_store::StoreError),
}

impl VolumeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VolumeError::VolumeNotFound(_) => ErrorKind::NotFound,
            VolumeError::AttachConflict(_) => ErrorKind::Conflict,
            // A kernel/CloudStack view divergence, not a transient blip — the
            // caller should not blindly retry, but surface it for reconciliation.
            VolumeError::DeviceCorrelationTimeout { .. } | VolumeError::DeviceDetachTimeout { .. } => {
                ErrorKind::InvariantViolation
            }
            VolumeError::UpstreamCloudStackError(_) => ErrorKind::UpstreamPermanent,
            VolumeError::UpstreamCloudStackTransient(_) => ErrorKind::UpstreamTransient,
            VolumeError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            VolumeError::Store(e) => e.kind(),
        }
    }
}
