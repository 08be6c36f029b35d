use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha_domain::{
    DeviceMapping, DeviceMappingState, OperationMode, SnapshotInfo, VmContextId, VolumeId,
    VolumeOperation, VolumeOperationStatus, VolumeOperationType,
};
use sha_store::StateStore;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::VolumeError;
use crate::observer::{DeviceEventKind, DeviceObserver};
use crate::upstream::{CreateVolumeRequest, UpstreamClient};

/// Default window to wait for the Observer to correlate an attach/detach.
pub const DEFAULT_CORRELATION_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct VolumeStatus {
    pub volume_id: VolumeId,
    pub mapping: Option<DeviceMapping>,
    pub last_operation: Option<VolumeOperation>,
}

/// Single-writer arbiter for all volume lifecycle operations.
///
/// Operations on the same `volume_id` are totally ordered via a per-volume
/// async mutex; operations on distinct volumes proceed concurrently. This
/// mirrors the driver-dispatch pattern of routing every mutating call
/// through one narrow trait boundary, but adds the per-key serialization
/// the CloudStack upstream does not itself guarantee.
pub struct VolumeDaemon {
    store: Arc<dyn StateStore>,
    upstream: Arc<dyn UpstreamClient>,
    observer: Arc<dyn DeviceObserver>,
    locks: RwLock<HashMap<VolumeId, Arc<AsyncMutex<()>>>>,
    correlation_window: Duration,
}

impl VolumeDaemon {
    pub fn new(
        store: Arc<dyn StateStore>,
        upstream: Arc<dyn UpstreamClient>,
        observer: Arc<dyn DeviceObserver>,
    ) -> Self {
        VolumeDaemon {
            store,
            upstream,
            observer,
            locks: RwLock::new(HashMap::new()),
            correlation_window: DEFAULT_CORRELATION_WINDOW,
        }
    }

    pub fn with_correlation_window(mut self, window: Duration) -> Self {
        self.correlation_window = window;
        self
    }

    async fn lock_for(&self, volume_id: &VolumeId) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().await.get(volume_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(volume_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn record_operation(
        &self,
        op_type: VolumeOperationType,
        volume_id: VolumeId,
        vm_id: Option<String>,
        request: serde_json::Value,
    ) -> Result<VolumeOperation, VolumeError> {
        let mut op = VolumeOperation::new(op_type, volume_id, vm_id, request, Utc::now());
        op.status = VolumeOperationStatus::Executing;
        op.started_at = Some(Utc::now());
        self.store.create_volume_operation(&op).await?;
        Ok(op)
    }

    async fn finish_operation(
        &self,
        mut op: VolumeOperation,
        status: VolumeOperationStatus,
        response: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), VolumeError> {
        op.status = status;
        op.response = response;
        op.error = error;
        op.finished_at = Some(Utc::now());
        self.store.update_volume_operation(&op).await?;
        Ok(())
    }

    /// `Create(name, size, offering, zone, metadata?) → volume_id`
    pub async fn create(
        &self,
        name: &str,
        size_bytes: u64,
        offering_id: &str,
        zone_id: &str,
    ) -> Result<VolumeId, VolumeError> {
        let upstream_vol = self
            .upstream
            .create_volume(CreateVolumeRequest {
                name: name.to_string(),
                size_bytes,
                offering_id: offering_id.to_string(),
                zone_id: zone_id.to_string(),
            })
            .await?;
        info!(volume_id = %upstream_vol.id, "volume created upstream");
        Ok(VolumeId::new(upstream_vol.id))
    }

    /// `Attach(volume_id, vm_id) → device_path`
    ///
    /// Completes only after the Observer reports a matching `added` event —
    /// see invariant 2.
    pub async fn attach(
        &self,
        volume_id: &VolumeId,
        vm_context_id: &VmContextId,
        vm_id: &str,
        size_bytes: u64,
    ) -> Result<String, VolumeError> {
        let lock = self.lock_for(volume_id).await;
        let _guard = lock.lock().await;

        let pre_snapshot = self.observer.snapshot().await;
        let known_tokens: std::collections::HashSet<String> =
            pre_snapshot.iter().map(|d| d.controller_token.clone()).collect();

        let op = self
            .record_operation(
                VolumeOperationType::Attach,
                volume_id.clone(),
                Some(vm_id.to_string()),
                serde_json::json!({ "vm_id": vm_id }),
            )
            .await?;

        if let Err(e) = self.upstream.attach_volume(volume_id.as_str(), vm_id).await {
            self.finish_operation(op, VolumeOperationStatus::Failed, None, Some(e.to_string())).await?;
            return Err(e);
        }

        let size_bytes_i = size_bytes;
        let predicate = move |event: &crate::observer::DeviceEvent| {
            event.kind == DeviceEventKind::Added
                && event.device.size_bytes.abs_diff(size_bytes_i) <= 512
                && !known_tokens.contains(&event.device.controller_token)
        };

        let matched = self.observer.wait_for(&predicate, self.correlation_window).await;

        let Some(event) = matched else {
            // Roll back the CloudStack-side attach — the kernel never confirmed it.
            let _ = self.upstream.detach_volume(volume_id.as_str()).await;
            let err = VolumeError::DeviceCorrelationTimeout {
                volume_id: volume_id.to_string(),
                waited_ms: self.correlation_window.as_millis() as u64,
            };
            self.finish_operation(op, VolumeOperationStatus::Failed, None, Some(err.to_string())).await?;
            return Err(err);
        };

        let now = Utc::now();
        let mapping = DeviceMapping {
            vm_context_id: vm_context_id.clone(),
            volume_uuid: volume_id.clone(),
            vm_id: Some(vm_id.to_string()),
            mode: OperationMode::Normal,
            device_index: None,
            device_path: Some(event.device.device_path.clone()),
            cloudstack_state: Some("Ready".into()),
            state: DeviceMappingState::Attached,
            size_bytes,
            last_sync_at: None,
            last_change_id: None,
            snapshot: None,
            device_alias: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_device_mapping(&mapping).await?;

        self.finish_operation(
            op,
            VolumeOperationStatus::Completed,
            Some(serde_json::json!({ "device_path": event.device.device_path })),
            None,
        )
        .await?;

        Ok(event.device.device_path)
    }

    /// `Detach(volume_id) → ()`
    pub async fn detach(&self, volume_id: &VolumeId) -> Result<(), VolumeError> {
        let lock = self.lock_for(volume_id).await;
        let _guard = lock.lock().await;

        let mut mapping = self
            .store
            .get_device_mapping(volume_id)
            .await?
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;

        let op = self
            .record_operation(VolumeOperationType::Detach, volume_id.clone(), mapping.vm_id.clone(), serde_json::json!({}))
            .await?;

        if let Err(e) = self.upstream.detach_volume(volume_id.as_str()).await {
            self.finish_operation(op, VolumeOperationStatus::Failed, None, Some(e.to_string())).await?;
            return Err(e);
        }

        let device_path = mapping.device_path.clone();
        let predicate = move |event: &crate::observer::DeviceEvent| {
            event.kind == DeviceEventKind::Removed && Some(&event.device.device_path) == device_path.as_ref()
        };
        let matched = self.observer.wait_for(&predicate, self.correlation_window).await;

        if matched.is_none() {
            mapping.state = DeviceMappingState::Stale;
            mapping.updated_at = Utc::now();
            self.store.upsert_device_mapping(&mapping).await?;
            let err = VolumeError::DeviceDetachTimeout {
                volume_id: volume_id.to_string(),
                waited_ms: self.correlation_window.as_millis() as u64,
            };
            self.finish_operation(op, VolumeOperationStatus::Failed, None, Some(err.to_string())).await?;
            warn!(volume_id = %volume_id, "detach correlation timed out, mapping marked stale");
            return Err(err);
        }

        mapping.state = DeviceMappingState::Detached;
        mapping.device_path = None;
        mapping.updated_at = Utc::now();
        self.store.upsert_device_mapping(&mapping).await?;
        self.finish_operation(op, VolumeOperationStatus::Completed, None, None).await?;
        Ok(())
    }

    /// `Delete(volume_id) → ()`
    pub async fn delete(&self, volume_id: &VolumeId) -> Result<(), VolumeError> {
        let lock = self.lock_for(volume_id).await;
        let _guard = lock.lock().await;

        let op = self
            .record_operation(VolumeOperationType::Delete, volume_id.clone(), None, serde_json::json!({}))
            .await?;
        match self.upstream.delete_volume(volume_id.as_str()).await {
            Ok(()) => {
                self.store.delete_device_mapping(volume_id).await?;
                self.finish_operation(op, VolumeOperationStatus::Completed, None, None).await
            }
            Err(e) => {
                self.finish_operation(op, VolumeOperationStatus::Failed, None, Some(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// `Cleanup(test_vm_id, volume_id, host_vm_id, delete_vm?, force?) → ()`
    ///
    /// Used by failover-test rollback: detaches the volume from the throwaway
    /// test VM and reattaches it (conceptually) to its original host, or force-
    /// deletes the mapping if the test VM itself never surfaced a clean detach.
    pub async fn cleanup(
        &self,
        volume_id: &VolumeId,
        force: bool,
    ) -> Result<(), VolumeError> {
        match self.detach(volume_id).await {
            Ok(()) => Ok(()),
            Err(_) if force => {
                let mut mapping = self.store.get_device_mapping(volume_id).await?;
                if let Some(m) = mapping.as_mut() {
                    m.state = DeviceMappingState::Detached;
                    m.device_path = None;
                    m.updated_at = Utc::now();
                    self.store.upsert_device_mapping(m).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Records the CBT change-id from a just-completed transfer so the next
    /// incremental replicate knows where to resume.
    pub async fn record_change_id(&self, volume_id: &VolumeId, change_id: &str) -> Result<(), VolumeError> {
        let mut mapping = self
            .store
            .get_device_mapping(volume_id)
            .await?
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        mapping.last_change_id = Some(change_id.to_string());
        mapping.last_sync_at = Some(Utc::now());
        mapping.updated_at = Utc::now();
        self.store.upsert_device_mapping(&mapping).await?;
        Ok(())
    }

    /// `StatusOf(volume_id) → VolumeStatus`
    pub async fn status_of(&self, volume_id: &VolumeId) -> Result<VolumeStatus, VolumeError> {
        let mapping = self.store.get_device_mapping(volume_id).await?;
        let ops = self.store.list_volume_operations(volume_id).await?;
        let last_operation = ops.into_iter().max_by_key(|op| op.created_at);
        Ok(VolumeStatus { volume_id: volume_id.clone(), mapping, last_operation })
    }

    /// `TrackSnapshot(volume_id, snapshot_id, status)`
    pub async fn track_snapshot(&self, volume_id: &VolumeId, snapshot_id: &str, status: &str) -> Result<(), VolumeError> {
        let mut mapping = self
            .store
            .get_device_mapping(volume_id)
            .await?
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        mapping.snapshot = Some(SnapshotInfo {
            snapshot_id: snapshot_id.to_string(),
            taken_at: Utc::now(),
            status: status.to_string(),
        });
        mapping.updated_at = Utc::now();
        self.store.upsert_device_mapping(&mapping).await?;
        Ok(())
    }

    /// `UpdateSnapshot(volume_id, snapshot_id, status)`
    pub async fn update_snapshot(&self, volume_id: &VolumeId, status: &str) -> Result<(), VolumeError> {
        let mut mapping = self
            .store
            .get_device_mapping(volume_id)
            .await?
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        if let Some(snap) = mapping.snapshot.as_mut() {
            snap.status = status.to_string();
        }
        mapping.updated_at = Utc::now();
        self.store.upsert_device_mapping(&mapping).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{DeviceInfo, SimulatedObserver};
    use crate::upstream::InMemoryUpstreamClient;
    use sha_store::InMemoryStore;

    fn daemon() -> (Arc<VolumeDaemon>, Arc<SimulatedObserver>) {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let upstream: Arc<dyn UpstreamClient> = Arc::new(InMemoryUpstreamClient::new());
        let observer = Arc::new(SimulatedObserver::new());
        let daemon = Arc::new(
            VolumeDaemon::new(store, upstream, observer.clone())
                .with_correlation_window(Duration::from_millis(200)),
        );
        (daemon, observer)
    }

    #[tokio::test]
    async fn attach_completes_when_observer_confirms() {
        let (daemon, observer) = daemon();
        let volume_id = daemon.create("vm01-disk0", 1 << 30, "offering-1", "zone-1").await.unwrap();
        let vm_context = VmContextId::new("vm01");

        let daemon2 = daemon.clone();
        let volume_id2 = volume_id.clone();
        let attach_fut = tokio::spawn(async move {
            daemon2.attach(&volume_id2, &vm_context, "vm-123", 1 << 30).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        observer.simulate_attach(DeviceInfo {
            name: "vdb".into(),
            device_path: "/dev/vdb".into(),
            size_bytes: 1 << 30,
            controller_token: "ctrl-1".into(),
        });

        let device_path = attach_fut.await.unwrap().unwrap();
        assert_eq!(device_path, "/dev/vdb");
    }

    #[tokio::test]
    async fn attach_times_out_and_rolls_back() {
        let (daemon, _observer) = daemon();
        let volume_id = daemon.create("vm02-disk0", 1 << 30, "offering-1", "zone-1").await.unwrap();
        let vm_context = VmContextId::new("vm02");

        let err = daemon.attach(&volume_id, &vm_context, "vm-456", 1 << 30).await.unwrap_err();
        assert!(matches!(err, VolumeError::DeviceCorrelationTimeout { .. }));

        let status = daemon.status_of(&volume_id).await.unwrap();
        assert!(status.mapping.is_none());
    }

    #[tokio::test]
    async fn detach_marks_stale_on_missing_removal() {
        let (daemon, observer) = daemon();
        let volume_id = daemon.create("vm03-disk0", 1 << 30, "offering-1", "zone-1").await.unwrap();
        let vm_context = VmContextId::new("vm03");

        let daemon2 = daemon.clone();
        let volume_id2 = volume_id.clone();
        let attach_fut = tokio::spawn(async move {
            daemon2.attach(&volume_id2, &vm_context, "vm-789", 1 << 30).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        observer.simulate_attach(DeviceInfo {
            name: "vdc".into(),
            device_path: "/dev/vdc".into(),
            size_bytes: 1 << 30,
            controller_token: "ctrl-2".into(),
        });
        attach_fut.await.unwrap().unwrap();

        // No simulate_detach call — the removal never arrives.
        let err = daemon.detach(&volume_id).await.unwrap_err();
        assert!(matches!(err, VolumeError::DeviceDetachTimeout { .. }));

        let status = daemon.status_of(&volume_id).await.unwrap();
        assert_eq!(status.mapping.unwrap().state, DeviceMappingState::Stale);
    }
}
