use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha_domain::{JobId, JobKind, VmContextId};

use crate::ctx::WorkflowCtx;
use crate::error::OrchestratorError;
use crate::retry::with_upstream_retry;
use crate::sna_client::{StartTransferRequest, TargetExport};

const EXPORT_BASE_PORT: u16 = 10809;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    pub disk_id: String,
    pub size_bytes: u64,
    pub offering_id: String,
    pub zone_id: String,
    pub previous_change_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreparedDisk {
    disk_id: String,
    volume_id: String,
    device_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportedDisk {
    disk_id: String,
    volume_id: String,
    export_name: String,
}

/// The per-kind specialization of the shared PLAN → ... → DONE/FAILED
/// skeleton (§4.7). `prepare_volumes`/`export` return whatever JSON blob
/// the later stages need — the engine only threads it through, it never
/// interprets it.
#[async_trait]
pub trait WorkflowSpec: Send + Sync {
    fn kind(&self) -> JobKind;
    fn operation_label(&self) -> String;
    /// The VM context this run belongs to, recorded on the job's metadata so
    /// the Control API can answer `GET /vm-contexts/{id}/recent-jobs` without
    /// a dedicated join table.
    fn vm_context_id(&self) -> &str;
    async fn prepare_volumes(&self, ctx: &WorkflowCtx) -> Result<serde_json::Value, OrchestratorError>;
    async fn export(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value) -> Result<serde_json::Value, OrchestratorError>;
    async fn start_mover(&self, ctx: &WorkflowCtx, job_id: JobId, exported: &serde_json::Value) -> Result<(), OrchestratorError>;
    async fn finalize(&self, ctx: &WorkflowCtx, exported: &serde_json::Value) -> Result<(), OrchestratorError>;
    /// Runs both on the DONE path's final CLEANUP stage and, with
    /// `rollback = true`, on the FAIL → ROLLBACK path.
    async fn cleanup(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value, rollback: bool) -> Result<(), OrchestratorError>;
}

async fn prepare_disks(
    ctx: &WorkflowCtx,
    vm_context_id: &VmContextId,
    vm_id: &str,
    disks: &[DiskSpec],
) -> Result<Vec<PreparedDisk>, OrchestratorError> {
    let mut prepared = Vec::with_capacity(disks.len());
    for disk in disks {
        let name = format!("{}-{}", vm_context_id.as_str(), disk.disk_id);
        let offering_id = disk.offering_id.clone();
        let zone_id = disk.zone_id.clone();
        let size_bytes = disk.size_bytes;
        let volume_id = with_upstream_retry(|| {
            let name = name.clone();
            let offering_id = offering_id.clone();
            let zone_id = zone_id.clone();
            async move {
                ctx.volume_daemon
                    .create(&name, size_bytes, &offering_id, &zone_id)
                    .await
                    .map_err(OrchestratorError::from)
            }
        })
        .await?;

        let device_path = ctx.volume_daemon.attach(&volume_id, vm_context_id, vm_id, disk.size_bytes).await?;
        prepared.push(PreparedDisk { disk_id: disk.disk_id.clone(), volume_id: volume_id.as_str().to_string(), device_path });
    }
    Ok(prepared)
}

async fn export_disks(
    ctx: &WorkflowCtx,
    prepared: &[PreparedDisk],
    export_prefix: &str,
) -> Result<Vec<ExportedDisk>, OrchestratorError> {
    let mut exported = Vec::with_capacity(prepared.len());
    for (index, disk) in prepared.iter().enumerate() {
        let export_name = format!("{export_prefix}-{}", disk.disk_id);
        let volume_id = sha_domain::VolumeId::new(disk.volume_id.clone());
        ctx.publisher.publish(&volume_id, &export_name, EXPORT_BASE_PORT + index as u16).await?;
        exported.push(ExportedDisk { disk_id: disk.disk_id.clone(), volume_id: disk.volume_id.clone(), export_name });
    }
    Ok(exported)
}

async fn detach_all(ctx: &WorkflowCtx, prepared: &[PreparedDisk]) {
    for disk in prepared {
        let volume_id = sha_domain::VolumeId::new(disk.volume_id.clone());
        let _ = ctx.volume_daemon.cleanup(&volume_id, true).await;
    }
}

/// Full disk-level replication of a VMware VM into a CloudStack volume per
/// disk, attached to the Hub for the byte-mover to write through.
pub struct ReplicateSpec {
    pub source_vm_path: String,
    pub vm_context_id: VmContextId,
    pub hub_vm_id: String,
    pub disks: Vec<DiskSpec>,
}

#[async_trait]
impl WorkflowSpec for ReplicateSpec {
    fn kind(&self) -> JobKind {
        JobKind::Replicate
    }

    fn operation_label(&self) -> String {
        format!("replicate {}", self.source_vm_path)
    }

    fn vm_context_id(&self) -> &str {
        self.vm_context_id.as_str()
    }

    async fn prepare_volumes(&self, ctx: &WorkflowCtx) -> Result<serde_json::Value, OrchestratorError> {
        let prepared = prepare_disks(ctx, &self.vm_context_id, &self.hub_vm_id, &self.disks).await?;
        Ok(serde_json::to_value(prepared).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn export(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value) -> Result<serde_json::Value, OrchestratorError> {
        let prepared: Vec<PreparedDisk> =
            serde_json::from_value(prepared.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let exported = export_disks(ctx, &prepared, &self.vm_context_id.as_str().to_string()).await?;
        Ok(serde_json::to_value(exported).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn start_mover(&self, ctx: &WorkflowCtx, job_id: JobId, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let exported: Vec<ExportedDisk> =
            serde_json::from_value(exported.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let previous_change_id = self.disks.first().and_then(|d| d.previous_change_id.clone());
        ctx.sna
            .start_replicate(StartTransferRequest {
                job_id,
                source_vm_path: self.source_vm_path.clone(),
                target_exports: exported
                    .iter()
                    .map(|e| TargetExport { disk_id: e.disk_id.clone(), export_name: e.export_name.clone() })
                    .collect(),
                previous_change_id,
            })
            .await
    }

    async fn finalize(&self, ctx: &WorkflowCtx, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let exported: Vec<ExportedDisk> =
            serde_json::from_value(exported.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        for disk in &exported {
            let volume_id = sha_domain::VolumeId::new(disk.volume_id.clone());
            // A production SNA reports the post-transfer CBT change-id in its
            // completion callback; until that wiring exists this records a
            // placeholder so the DeviceMapping field is exercised end to end.
            ctx.volume_daemon.record_change_id(&volume_id, &format!("ct-{}", disk.disk_id)).await?;
        }
        Ok(())
    }

    async fn cleanup(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value, rollback: bool) -> Result<(), OrchestratorError> {
        if !rollback {
            return Ok(());
        }
        let prepared: Vec<PreparedDisk> =
            serde_json::from_value(prepared.clone()).unwrap_or_default();
        detach_all(ctx, &prepared).await;
        Ok(())
    }
}

/// Identical through EXPORT; START_MOVER targets a local file-backed export
/// instead of a CloudStack volume, and FINALIZE records backup metadata
/// rather than a CBT change-id.
pub struct BackupSpec {
    pub source_vm_path: String,
    pub vm_context_id: VmContextId,
    pub hub_vm_id: String,
    pub disks: Vec<DiskSpec>,
}

#[async_trait]
impl WorkflowSpec for BackupSpec {
    fn kind(&self) -> JobKind {
        JobKind::Backup
    }

    fn operation_label(&self) -> String {
        format!("backup {}", self.source_vm_path)
    }

    fn vm_context_id(&self) -> &str {
        self.vm_context_id.as_str()
    }

    async fn prepare_volumes(&self, ctx: &WorkflowCtx) -> Result<serde_json::Value, OrchestratorError> {
        let prepared = prepare_disks(ctx, &self.vm_context_id, &self.hub_vm_id, &self.disks).await?;
        Ok(serde_json::to_value(prepared).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn export(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value) -> Result<serde_json::Value, OrchestratorError> {
        let prepared: Vec<PreparedDisk> =
            serde_json::from_value(prepared.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let exported = export_disks(ctx, &prepared, &format!("{}-backup", self.vm_context_id.as_str())).await?;
        Ok(serde_json::to_value(exported).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn start_mover(&self, ctx: &WorkflowCtx, job_id: JobId, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let exported: Vec<ExportedDisk> =
            serde_json::from_value(exported.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        ctx.sna
            .start_backup(StartTransferRequest {
                job_id,
                source_vm_path: self.source_vm_path.clone(),
                target_exports: exported
                    .iter()
                    .map(|e| TargetExport { disk_id: e.disk_id.clone(), export_name: e.export_name.clone() })
                    .collect(),
                previous_change_id: None,
            })
            .await
    }

    async fn finalize(&self, ctx: &WorkflowCtx, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let exported: Vec<ExportedDisk> =
            serde_json::from_value(exported.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        ctx.tracker
            .log(
                None,
                None,
                sha_domain::LogLevel::Info,
                "backup finalized",
                json!({ "disk_count": exported.len() }),
            )
            .await;
        Ok(())
    }

    async fn cleanup(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value, rollback: bool) -> Result<(), OrchestratorError> {
        if !rollback {
            return Ok(());
        }
        let prepared: Vec<PreparedDisk> = serde_json::from_value(prepared.clone()).unwrap_or_default();
        detach_all(ctx, &prepared).await;
        Ok(())
    }
}

/// Attaches existing replicated volumes to a newly created test VM without
/// powering off the source. Rollback detaches the test-only resources and
/// returns the volumes to the Hub.
pub struct FailoverTestSpec {
    pub vm_context_id: VmContextId,
    pub test_vm_id: String,
    pub hub_vm_id: String,
    pub volume_ids: Vec<String>,
}

#[async_trait]
impl WorkflowSpec for FailoverTestSpec {
    fn kind(&self) -> JobKind {
        JobKind::FailoverTest
    }

    fn operation_label(&self) -> String {
        format!("failover test {}", self.vm_context_id.as_str())
    }

    fn vm_context_id(&self) -> &str {
        self.vm_context_id.as_str()
    }

    async fn prepare_volumes(&self, ctx: &WorkflowCtx) -> Result<serde_json::Value, OrchestratorError> {
        let mut prepared = Vec::with_capacity(self.volume_ids.len());
        for volume_id in &self.volume_ids {
            let vid = sha_domain::VolumeId::new(volume_id.clone());
            ctx.volume_daemon.detach(&vid).await?;
            let status = ctx.volume_daemon.status_of(&vid).await?;
            let size_bytes = status.mapping.as_ref().map(|m| m.size_bytes).unwrap_or(0);
            let device_path = ctx.volume_daemon.attach(&vid, &self.vm_context_id, &self.test_vm_id, size_bytes).await?;
            prepared.push(PreparedDisk { disk_id: volume_id.clone(), volume_id: volume_id.clone(), device_path });
        }
        Ok(serde_json::to_value(prepared).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn export(&self, _ctx: &WorkflowCtx, prepared: &serde_json::Value) -> Result<serde_json::Value, OrchestratorError> {
        // A failover test reads the volumes directly from the test VM — no
        // export is published.
        Ok(prepared.clone())
    }

    async fn start_mover(&self, _ctx: &WorkflowCtx, _job_id: JobId, _exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn finalize(&self, _ctx: &WorkflowCtx, _exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn cleanup(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value, rollback: bool) -> Result<(), OrchestratorError> {
        if !rollback {
            return Ok(());
        }
        let prepared: Vec<PreparedDisk> = serde_json::from_value(prepared.clone()).unwrap_or_default();
        for disk in &prepared {
            let volume_id = sha_domain::VolumeId::new(disk.volume_id.clone());
            let _ = ctx.volume_daemon.cleanup(&volume_id, true).await;
            let status = ctx.volume_daemon.status_of(&volume_id).await?;
            let size_bytes = status.mapping.as_ref().map(|m| m.size_bytes).unwrap_or(0);
            ctx.volume_daemon.attach(&volume_id, &self.vm_context_id, &self.hub_vm_id, size_bytes).await?;
        }
        Ok(())
    }
}

/// Cuts an already-replicating VM over to production: runs one last
/// incremental against the replicated volumes while they're still attached
/// to the Hub, then moves them to the target VM. Rollback re-attaches the
/// volumes to the Hub and, if the source was powered off, powers it back on.
pub struct FailoverLiveSpec {
    pub source_vm_path: String,
    pub vm_context_id: VmContextId,
    pub target_vm_id: String,
    pub hub_vm_id: String,
    pub volume_ids: Vec<String>,
    pub power_off_source: bool,
}

#[async_trait]
impl WorkflowSpec for FailoverLiveSpec {
    fn kind(&self) -> JobKind {
        JobKind::FailoverLive
    }

    fn operation_label(&self) -> String {
        format!("failover (live) {}", self.source_vm_path)
    }

    fn vm_context_id(&self) -> &str {
        self.vm_context_id.as_str()
    }

    async fn prepare_volumes(&self, ctx: &WorkflowCtx) -> Result<serde_json::Value, OrchestratorError> {
        if self.power_off_source {
            ctx.sna.power_off_source(&self.source_vm_path).await?;
        }
        let mut prepared = Vec::with_capacity(self.volume_ids.len());
        for volume_id in &self.volume_ids {
            let vid = sha_domain::VolumeId::new(volume_id.clone());
            let status = ctx.volume_daemon.status_of(&vid).await?;
            let device_path = status.mapping.as_ref().and_then(|m| m.device_path.clone()).unwrap_or_default();
            prepared.push(PreparedDisk { disk_id: volume_id.clone(), volume_id: volume_id.clone(), device_path });
        }
        Ok(serde_json::to_value(prepared).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn export(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value) -> Result<serde_json::Value, OrchestratorError> {
        let prepared: Vec<PreparedDisk> =
            serde_json::from_value(prepared.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        // Re-publish (idempotent) rather than assume the standing replication
        // export is still live under the name we expect.
        let exported = export_disks(ctx, &prepared, &format!("{}-cutover", self.vm_context_id.as_str())).await?;
        Ok(serde_json::to_value(exported).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn start_mover(&self, ctx: &WorkflowCtx, job_id: JobId, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let exported: Vec<ExportedDisk> =
            serde_json::from_value(exported.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let mut previous_change_id = None;
        for disk in &exported {
            let vid = sha_domain::VolumeId::new(disk.volume_id.clone());
            let status = ctx.volume_daemon.status_of(&vid).await?;
            previous_change_id = status.mapping.as_ref().and_then(|m| m.last_change_id.clone());
        }
        ctx.sna
            .start_replicate(StartTransferRequest {
                job_id,
                source_vm_path: self.source_vm_path.clone(),
                target_exports: exported
                    .iter()
                    .map(|e| TargetExport { disk_id: e.disk_id.clone(), export_name: e.export_name.clone() })
                    .collect(),
                previous_change_id,
            })
            .await
    }

    async fn finalize(&self, ctx: &WorkflowCtx, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let exported: Vec<ExportedDisk> =
            serde_json::from_value(exported.clone()).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        for disk in &exported {
            let vid = sha_domain::VolumeId::new(disk.volume_id.clone());
            ctx.volume_daemon.record_change_id(&vid, &format!("ct-{}", disk.disk_id)).await?;
            ctx.volume_daemon.detach(&vid).await?;
            let status = ctx.volume_daemon.status_of(&vid).await?;
            let size_bytes = status.mapping.as_ref().map(|m| m.size_bytes).unwrap_or(0);
            ctx.volume_daemon.attach(&vid, &self.vm_context_id, &self.target_vm_id, size_bytes).await?;
        }
        // The reattach above rebinds each volume's device path, which leaves
        // the "-cutover" export published in the EXPORT stage stale.
        ctx.publisher.flush_stale_mappings().await?;
        Ok(())
    }

    async fn cleanup(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value, rollback: bool) -> Result<(), OrchestratorError> {
        if !rollback {
            return Ok(());
        }
        let prepared: Vec<PreparedDisk> = serde_json::from_value(prepared.clone()).unwrap_or_default();
        for disk in &prepared {
            let volume_id = sha_domain::VolumeId::new(disk.volume_id.clone());
            let _ = ctx.volume_daemon.cleanup(&volume_id, true).await;
            let status = ctx.volume_daemon.status_of(&volume_id).await?;
            let size_bytes = status.mapping.as_ref().map(|m| m.size_bytes).unwrap_or(0);
            ctx.volume_daemon.attach(&volume_id, &self.vm_context_id, &self.hub_vm_id, size_bytes).await?;
        }
        if self.power_off_source {
            ctx.sna.power_on_source(&self.source_vm_path).await?;
        }
        Ok(())
    }
}

/// Mounts a completed backup read-only under a restore VM so its file-browse
/// API can serve individual files. Unlike the other workflows this never
/// touches the byte-mover — START_MOVER/FINALIZE are no-ops; the interesting
/// work is the attach itself and recording the mount's expiry.
pub struct RestoreSpec {
    pub vm_context_id: VmContextId,
    pub restore_vm_id: String,
    pub volume_ids: Vec<String>,
    pub ttl_seconds: i64,
}

#[async_trait]
impl WorkflowSpec for RestoreSpec {
    fn kind(&self) -> JobKind {
        JobKind::Restore
    }

    fn operation_label(&self) -> String {
        format!("restore {}", self.vm_context_id.as_str())
    }

    fn vm_context_id(&self) -> &str {
        self.vm_context_id.as_str()
    }

    async fn prepare_volumes(&self, ctx: &WorkflowCtx) -> Result<serde_json::Value, OrchestratorError> {
        let mut prepared = Vec::with_capacity(self.volume_ids.len());
        for volume_id in &self.volume_ids {
            let vid = sha_domain::VolumeId::new(volume_id.clone());
            let status = ctx.volume_daemon.status_of(&vid).await?;
            let size_bytes = status.mapping.as_ref().map(|m| m.size_bytes).unwrap_or(0);
            let device_path = ctx.volume_daemon.attach(&vid, &self.vm_context_id, &self.restore_vm_id, size_bytes).await?;
            prepared.push(PreparedDisk { disk_id: volume_id.clone(), volume_id: volume_id.clone(), device_path });
        }
        Ok(serde_json::to_value(prepared).map_err(|e| OrchestratorError::Internal(e.to_string()))?)
    }

    async fn export(&self, _ctx: &WorkflowCtx, prepared: &serde_json::Value) -> Result<serde_json::Value, OrchestratorError> {
        Ok(prepared.clone())
    }

    async fn start_mover(&self, _ctx: &WorkflowCtx, _job_id: JobId, _exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn finalize(&self, ctx: &WorkflowCtx, exported: &serde_json::Value) -> Result<(), OrchestratorError> {
        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(self.ttl_seconds);
        // Reaping expired mounts is a Control API admin-loop concern — see
        // the mount registry it reads this log line's attrs back out of.
        ctx.tracker
            .log(
                None,
                None,
                sha_domain::LogLevel::Info,
                "restore mount ready",
                json!({ "restore_vm_id": self.restore_vm_id, "expires_at": expires_at.to_rfc3339(), "mount": exported }),
            )
            .await;
        Ok(())
    }

    async fn cleanup(&self, ctx: &WorkflowCtx, prepared: &serde_json::Value, rollback: bool) -> Result<(), OrchestratorError> {
        if !rollback {
            return Ok(());
        }
        let prepared: Vec<PreparedDisk> = serde_json::from_value(prepared.clone()).unwrap_or_default();
        detach_all(ctx, &prepared).await;
        Ok(())
    }
}
