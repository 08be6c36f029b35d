use sha_domain::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("pairing code not found or already used")]
    InvalidPairingCode,

    #[error("pairing code expired")]
    PairingCodeExpired,

    #[error("enrollment not found: {0}")]
    EnrollmentNotFound(uuid::Uuid),

    #[error("enrollment {0} is in state {1:?}, expected {2:?}")]
    WrongState(uuid::Uuid, sha_domain::EnrollmentStatus, sha_domain::EnrollmentStatus),

    #[error("challenge signature did not verify")]
    SignatureInvalid,

    #[error("malformed public key or signature: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] sha_store::StoreError),
}

impl EnrollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnrollError::InvalidPairingCode | EnrollError::PairingCodeExpired => ErrorKind::Validation,
            EnrollError::EnrollmentNotFound(_) => ErrorKind::NotFound,
            EnrollError::WrongState(..) => ErrorKind::Conflict,
            EnrollError::SignatureInvalid => ErrorKind::Authorization,
            EnrollError::Malformed(_) => ErrorKind::Validation,
            EnrollError::Store(e) => e.kind(),
        }
    }
}
