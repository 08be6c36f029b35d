use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha_domain::JobId;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetExport {
    pub disk_id: String,
    pub export_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTransferRequest {
    pub job_id: JobId,
    pub source_vm_path: String,
    pub target_exports: Vec<TargetExport>,
    pub previous_change_id: Option<String>,
}

/// The orchestrator's sole view of the SNA's control surface. A production
/// implementation issues HTTPS/JSON calls over the enrolled tunnel; the
/// byte-mover and block-export server binaries it ultimately drives are out
/// of scope here.
#[async_trait]
pub trait SnaClient: Send + Sync + 'static {
    async fn start_backup(&self, req: StartTransferRequest) -> Result<(), OrchestratorError>;
    async fn start_replicate(&self, req: StartTransferRequest) -> Result<(), OrchestratorError>;
    async fn stop_mover(&self, job_id: JobId) -> Result<(), OrchestratorError>;
    async fn enable_cbt(&self, vm_path: &str) -> Result<(), OrchestratorError>;
    /// Powers the source VM off ahead of a live cutover. The SNA issues this
    /// against the source hypervisor on our behalf.
    async fn power_off_source(&self, vm_path: &str) -> Result<(), OrchestratorError>;
    async fn power_on_source(&self, vm_path: &str) -> Result<(), OrchestratorError>;
}

/// In-memory `SnaClient` used by every test and the local developer loop.
#[derive(Default)]
pub struct InMemorySnaClient {
    calls: std::sync::Mutex<Vec<String>>,
}

impl InMemorySnaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnaClient for InMemorySnaClient {
    async fn start_backup(&self, req: StartTransferRequest) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push(format!("start_backup:{}", req.job_id));
        Ok(())
    }

    async fn start_replicate(&self, req: StartTransferRequest) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push(format!("start_replicate:{}", req.job_id));
        Ok(())
    }

    async fn stop_mover(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push(format!("stop_mover:{job_id}"));
        Ok(())
    }

    async fn enable_cbt(&self, vm_path: &str) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push(format!("enable_cbt:{vm_path}"));
        Ok(())
    }

    async fn power_off_source(&self, vm_path: &str) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push(format!("power_off_source:{vm_path}"));
        Ok(())
    }

    async fn power_on_source(&self, vm_path: &str) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push(format!("power_on_source:{vm_path}"));
        Ok(())
    }
}
