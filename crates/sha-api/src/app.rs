use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

/// Wires every Control API route onto `state`. `/health` and `/ready` are
/// reachable without a bearer token so a liveness/readiness prober never
/// needs a credential. The SNA-facing enrollment handshake and the byte
/// mover's progress pushes are also unauthenticated here — an unenrolled SNA
/// has nothing to present a bearer token with, and the pairing code plus the
/// later signed challenge are what stand in for a credential on that path.
pub fn build_app(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/enroll", post(handlers::post_enroll))
        .route("/verify", post(handlers::post_verify))
        .route("/result/:id", get(handlers::get_enrollment_result))
        .route("/progress/:job_id/update", post(handlers::post_progress_update));

    let authenticated = Router::new()
        .route("/replicate", post(handlers::post_replicate))
        .route("/backup/start", post(handlers::post_backup_start))
        .route("/backup/restore", post(handlers::post_backup_restore))
        .route("/backup/mount", post(handlers::post_backup_mount))
        .route("/backup/mount/:id", delete(handlers::delete_backup_mount))
        .route("/failover/unified", post(handlers::post_failover_unified))
        .route("/failover/rollback", post(handlers::post_failover_rollback))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/progress", get(handlers::get_progress))
        .route("/vm-contexts", get(handlers::list_vm_contexts))
        .route("/vm-contexts/:id/recent-jobs", get(handlers::vm_context_recent_jobs))
        .route("/status", get(handlers::status))
        .route("/admin/pairing-code", post(handlers::post_pairing_code))
        .route("/admin/approve", post(handlers::post_approve))
        .route("/admin/reject", post(handlers::post_reject))
        .route("/admin/revoke", post(handlers::post_revoke))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token));

    public
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sha_enroll::EnrollmentBroker;
    use sha_orchestrator::InMemorySnaClient;
    use sha_store::InMemoryStore;
    use sha_tracker::Tracker;
    use sha_volume::{ExportPublisher, NullExportServerSignal, VolumeDaemon};
    use tower::util::ServiceExt;

    use super::*;

    const TEST_TOKEN: &str = "test-token";

    fn test_app() -> Router {
        let store: Arc<dyn sha_store::StateStore> = Arc::new(InMemoryStore::new());
        let tracker = Arc::new(Tracker::new(store.clone()));
        let volume_daemon = Arc::new(VolumeDaemon::new(
            store.clone(),
            Arc::new(sha_volume::InMemoryUpstreamClient::default()),
            Arc::new(sha_volume::SimulatedObserver::default()),
        ));
        let publisher = Arc::new(ExportPublisher::new(store.clone(), Arc::new(NullExportServerSignal)));
        let sna: Arc<dyn sha_orchestrator::SnaClient> = Arc::new(InMemorySnaClient::default());
        let enroll = Arc::new(EnrollmentBroker::new(store.clone()));

        build_app(AppState {
            store,
            tracker,
            volume_daemon,
            publisher,
            sna,
            enroll,
            auth_token: Arc::new(TEST_TOKEN.to_string()),
        })
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {}", TEST_TOKEN))
    }

    #[tokio::test]
    async fn health_requires_no_token() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_without_token_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_with_wrong_token_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .header("Authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_with_valid_token_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/status")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_nonexistent_job_returns_404() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(Request::builder().uri(format!("/jobs/{}", uuid::Uuid::new_v4())))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn vm_contexts_empty_list_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/vm-contexts")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn replicate_with_incomplete_incremental_body_returns_400() {
        let app = test_app();
        let body = serde_json::json!({
            "source_vm": "vm-1",
            "vm_context_id": "ctx-1",
            "hub_vm_id": "hub-1",
            "replication_type": "incremental",
            "disks": [{"disk_id": "d1", "size_bytes": 1024, "offering_id": "o1", "zone_id": "z1"}],
        });
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method("POST")
                        .uri("/replicate")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
