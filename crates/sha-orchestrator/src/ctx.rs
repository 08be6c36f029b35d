use std::sync::Arc;

use sha_tracker::Tracker;
use sha_volume::{ExportPublisher, VolumeDaemon};

use crate::sna_client::SnaClient;

/// Everything a workflow specialization needs to drive the other
/// components. Held by value (all fields `Arc`) so a workflow task can be
/// spawned and outlive the request that started it.
#[derive(Clone)]
pub struct WorkflowCtx {
    pub tracker: Arc<Tracker>,
    pub volume_daemon: Arc<VolumeDaemon>,
    pub publisher: Arc<ExportPublisher>,
    pub sna: Arc<dyn SnaClient>,
}

impl WorkflowCtx {
    pub fn new(
        tracker: Arc<Tracker>,
        volume_daemon: Arc<VolumeDaemon>,
        publisher: Arc<ExportPublisher>,
        sna: Arc<dyn SnaClient>,
    ) -> Self {
        WorkflowCtx { tracker, volume_daemon, publisher, sna }
    }
}
