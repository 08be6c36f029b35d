use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha_domain::ErrorKind;

/// The Control API's single error type. Every crate boundary's own error
/// wraps in here with `#[from]`; this is the only place an HTTP status is
/// decided, mirroring the layering convention used throughout this
/// codebase — `kind()` drives the mapping so a new error variant upstream
/// only needs its own `kind()` arm, never a matching arm here.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Tracker(#[from] sha_tracker::TrackerError),

    #[error(transparent)]
    Volume(#[from] sha_volume::VolumeError),

    #[error(transparent)]
    Store(#[from] sha_store::StoreError),

    #[error(transparent)]
    Enroll(#[from] sha_enroll::EnrollError),

    #[error(transparent)]
    Orchestrator(#[from] sha_orchestrator::OrchestratorError),

    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Tracker(e) => e.kind(),
            ApiError::Volume(e) => e.kind(),
            ApiError::Store(e) => e.kind(),
            ApiError::Enroll(e) => e.kind(),
            ApiError::Orchestrator(e) => e.kind(),
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::Unauthorized => ErrorKind::Authorization,
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::UpstreamTransient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UpstreamPermanent => StatusCode::BAD_GATEWAY,
            ErrorKind::InvariantViolation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // The technical message is logged by the caller via `tracing`;
        // what crosses the wire is the sanitized Display text — never a
        // verbatim backtrace or internal identifier.
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
