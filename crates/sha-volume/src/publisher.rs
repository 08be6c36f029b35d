use std::sync::Arc;

use sha_domain::{Export, ExportStatus, VolumeId};
use sha_store::StateStore;
use tracing::{info, warn};

use crate::error::VolumeError;

/// The publisher's sole collaborator outside persisted state — the block-export
/// server itself is out of scope here, so this trait is the narrow boundary
/// the publisher pushes invalidations across.
#[async_trait::async_trait]
pub trait ExportServerSignal: Send + Sync + 'static {
    /// Tells the export server to drop any cached device binding for `export_name`
    /// so the next client renegotiates against the path currently on disk.
    async fn invalidate(&self, export_name: &str) -> Result<(), VolumeError>;
}

/// Export server signal that never performs I/O — used in tests and wherever
/// the external server is reached through some other out-of-process channel.
#[derive(Default)]
pub struct NullExportServerSignal;

#[async_trait::async_trait]
impl ExportServerSignal for NullExportServerSignal {
    async fn invalidate(&self, _export_name: &str) -> Result<(), VolumeError> {
        Ok(())
    }
}

/// Maintains the set of published exports and keeps each export's device
/// binding in sync with the authoritative DeviceMapping.
pub struct ExportPublisher {
    store: Arc<dyn StateStore>,
    signal: Arc<dyn ExportServerSignal>,
}

impl ExportPublisher {
    pub fn new(store: Arc<dyn StateStore>, signal: Arc<dyn ExportServerSignal>) -> Self {
        ExportPublisher { store, signal }
    }

    /// Publishes (or re-publishes) an export for a volume that is currently attached.
    pub async fn publish(&self, volume_id: &VolumeId, export_name: &str, port: u16) -> Result<Export, VolumeError> {
        let mapping = self
            .store
            .get_device_mapping(volume_id)
            .await?
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        let device_path = mapping
            .device_path
            .clone()
            .ok_or_else(|| VolumeError::InvariantViolation(format!("volume {volume_id} has no device path to export")))?;

        let existing = self.store.get_export(export_name).await?;
        let export = Export {
            id: existing.map(|e| e.id).unwrap_or_else(sha_domain::ExportId::new),
            volume_uuid: volume_id.clone(),
            export_name: export_name.to_string(),
            device_path,
            port,
            status: ExportStatus::Active,
            metadata: serde_json::json!({}),
        };
        self.store.upsert_export(&export).await?;
        self.signal.invalidate(export_name).await?;
        Ok(export)
    }

    /// Stale-mapping flush: run whenever a device path may have rebound (detach
    /// and reattach cycle, failover rollback). Idempotent — safe to call on
    /// every reconfiguration, not only when a rebind is suspected.
    ///
    /// 1. re-reads the export configuration from persisted state;
    /// 2. for each live export whose DeviceMapping path changed, rewrites the
    ///    backing device pointer;
    /// 3. signals the export server to drop cached bindings so the next client
    ///    connection renegotiates against the fresh path.
    pub async fn flush_stale_mappings(&self) -> Result<usize, VolumeError> {
        let exports = self.store.list_exports().await?;
        let mut rewritten = 0usize;

        for export in exports {
            if export.status != ExportStatus::Active {
                continue;
            }
            let Some(mapping) = self.store.get_device_mapping(&export.volume_uuid).await? else {
                warn!(export = %export.export_name, volume_id = %export.volume_uuid, "export references a volume with no mapping");
                continue;
            };
            let Some(current_path) = mapping.device_path.clone() else {
                continue;
            };
            if current_path == export.device_path {
                continue;
            }

            let mut updated = export.clone();
            updated.device_path = current_path;
            self.store.upsert_export(&updated).await?;
            self.signal.invalidate(&updated.export_name).await?;
            rewritten += 1;
            info!(export = %updated.export_name, "rewrote stale device binding");
        }

        Ok(rewritten)
    }

    /// Marks an export failed without deleting its row — kept for audit, as
    /// the DeviceMapping is when it goes `stale`.
    pub async fn mark_failed(&self, export_name: &str) -> Result<(), VolumeError> {
        let Some(mut export) = self.store.get_export(export_name).await? else {
            return Ok(());
        };
        export.status = ExportStatus::Failed;
        self.store.upsert_export(&export).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha_domain::{DeviceMapping, DeviceMappingState, OperationMode, VmContextId};
    use sha_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSignal {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ExportServerSignal for CountingSignal {
        async fn invalidate(&self, _export_name: &str) -> Result<(), VolumeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn mapping(volume_id: VolumeId, device_path: &str) -> DeviceMapping {
        let now = chrono::Utc::now();
        DeviceMapping {
            vm_context_id: VmContextId::new("vm01"),
            volume_uuid: volume_id,
            vm_id: Some("vm-123".into()),
            mode: OperationMode::Normal,
            device_index: None,
            device_path: Some(device_path.to_string()),
            cloudstack_state: Some("Ready".into()),
            state: DeviceMappingState::Attached,
            size_bytes: 1 << 30,
            last_sync_at: None,
            last_change_id: None,
            snapshot: None,
            device_alias: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn publish_then_flush_rewrites_rebound_path() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let signal = Arc::new(CountingSignal::default());
        let publisher = ExportPublisher::new(store.clone(), signal.clone());

        let volume_id = VolumeId::new("vol-1");
        store.upsert_device_mapping(&mapping(volume_id.clone(), "/dev/vdb")).await.unwrap();
        publisher.publish(&volume_id, "vm01-disk0", 10809).await.unwrap();

        // Simulate a detach/reattach cycle that rebinds the device path.
        store.upsert_device_mapping(&mapping(volume_id.clone(), "/dev/vdc")).await.unwrap();

        let rewritten = publisher.flush_stale_mappings().await.unwrap();
        assert_eq!(rewritten, 1);

        let export = store.get_export("vm01-disk0").await.unwrap().unwrap();
        assert_eq!(export.device_path, "/dev/vdc");
        assert_eq!(signal.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flush_is_idempotent_when_nothing_changed() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let signal = Arc::new(CountingSignal::default());
        let publisher = ExportPublisher::new(store.clone(), signal.clone());

        let volume_id = VolumeId::new("vol-2");
        store.upsert_device_mapping(&mapping(volume_id.clone(), "/dev/vdb")).await.unwrap();
        publisher.publish(&volume_id, "vm02-disk0", 10809).await.unwrap();

        let rewritten = publisher.flush_stale_mappings().await.unwrap();
        assert_eq!(rewritten, 0);
    }
}
