use std::sync::Arc;

use sha_enroll::EnrollmentBroker;
use sha_orchestrator::{SnaClient, WorkflowCtx};
use sha_store::StateStore;
use sha_tracker::Tracker;
use sha_volume::{ExportPublisher, VolumeDaemon};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub tracker: Arc<Tracker>,
    pub volume_daemon: Arc<VolumeDaemon>,
    pub publisher: Arc<ExportPublisher>,
    pub sna: Arc<dyn SnaClient>,
    pub enroll: Arc<EnrollmentBroker>,
    pub auth_token: Arc<String>,
}

impl AppState {
    /// Builds the context a `WorkflowSpec` needs, borrowing the same
    /// component instances this state holds — there is exactly one of each
    /// per process.
    pub fn workflow_ctx(&self) -> WorkflowCtx {
        WorkflowCtx::new(
            self.tracker.clone(),
            self.volume_daemon.clone(),
            self.publisher.clone(),
            self.sna.clone(),
        )
    }
}
