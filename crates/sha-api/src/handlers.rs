use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sha_domain::{DeviceMappingState, JobId, JobKind, JobStatus, ProgressRecord, ProgressStatus, VmContextId};
use sha_enroll::PairingCode;
use sha_orchestrator::{
    BackupSpec, DiskSpec, FailoverLiveSpec, FailoverTestSpec, ReplicateSpec, RestoreSpec,
};
use tracing::error;

use crate::error::ApiError;
use crate::state::AppState;

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_str(raw).map_err(|_| ApiError::bad_request(format!("invalid job id: {raw}")))
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_jobs(1).await?;
    Ok(StatusCode::OK)
}

// ── Replicate / Backup ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationType {
    Initial,
    Incremental,
}

#[derive(Debug, Deserialize)]
pub struct DiskBody {
    pub disk_id: String,
    pub size_bytes: u64,
    pub offering_id: String,
    pub zone_id: String,
    pub previous_change_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplicateBody {
    pub source_vm: String,
    pub vm_context_id: String,
    pub hub_vm_id: String,
    pub replication_type: ReplicationType,
    pub disks: Vec<DiskBody>,
    pub owner: Option<String>,
}

fn disk_specs(disks: Vec<DiskBody>) -> Vec<DiskSpec> {
    disks
        .into_iter()
        .map(|d| DiskSpec {
            disk_id: d.disk_id,
            size_bytes: d.size_bytes,
            offering_id: d.offering_id,
            zone_id: d.zone_id,
            previous_change_id: d.previous_change_id,
        })
        .collect()
}

pub async fn post_replicate(
    State(state): State<AppState>,
    Json(body): Json<ReplicateBody>,
) -> Result<Json<Value>, ApiError> {
    if matches!(body.replication_type, ReplicationType::Incremental)
        && body.disks.iter().any(|d| d.previous_change_id.is_none())
    {
        return Err(ApiError::bad_request(
            "incremental replicate requires previous_change_id on every disk",
        ));
    }

    let spec = ReplicateSpec {
        source_vm_path: body.source_vm,
        vm_context_id: VmContextId::new(body.vm_context_id),
        hub_vm_id: body.hub_vm_id,
        disks: disk_specs(body.disks),
    };
    spawn_workflow(&state, spec, body.owner).await
}

#[derive(Debug, Deserialize)]
pub struct BackupStartBody {
    pub source_vm: String,
    pub vm_context_id: String,
    pub hub_vm_id: String,
    pub disks: Vec<DiskBody>,
    pub owner: Option<String>,
}

pub async fn post_backup_start(
    State(state): State<AppState>,
    Json(body): Json<BackupStartBody>,
) -> Result<Json<Value>, ApiError> {
    let spec = BackupSpec {
        source_vm_path: body.source_vm,
        vm_context_id: VmContextId::new(body.vm_context_id),
        hub_vm_id: body.hub_vm_id,
        disks: disk_specs(body.disks),
    };
    spawn_workflow(&state, spec, body.owner).await
}

#[derive(Debug, Deserialize)]
pub struct BackupMountBody {
    pub vm_context_id: String,
    pub restore_vm_id: String,
    pub volume_ids: Vec<String>,
    pub ttl_seconds: i64,
    pub owner: Option<String>,
}

pub async fn post_backup_mount(
    State(state): State<AppState>,
    Json(body): Json<BackupMountBody>,
) -> Result<Json<Value>, ApiError> {
    if body.ttl_seconds <= 0 {
        return Err(ApiError::bad_request("ttl_seconds must be positive for a mount"));
    }
    let spec = RestoreSpec {
        vm_context_id: VmContextId::new(body.vm_context_id),
        restore_vm_id: body.restore_vm_id,
        volume_ids: body.volume_ids,
        ttl_seconds: body.ttl_seconds,
    };
    spawn_workflow(&state, spec, body.owner).await
}

#[derive(Debug, Deserialize)]
pub struct BackupRestoreBody {
    pub vm_context_id: String,
    pub restore_vm_id: String,
    pub volume_ids: Vec<String>,
    pub owner: Option<String>,
}

pub async fn post_backup_restore(
    State(state): State<AppState>,
    Json(body): Json<BackupRestoreBody>,
) -> Result<Json<Value>, ApiError> {
    // A full restore is a mount with no expiry — the distinction from
    // `/backup/mount` is in intent (production volume vs. a scratch
    // file-browse mount), not in the underlying orchestration.
    let spec = RestoreSpec {
        vm_context_id: VmContextId::new(body.vm_context_id),
        restore_vm_id: body.restore_vm_id,
        volume_ids: body.volume_ids,
        ttl_seconds: 0,
    };
    spawn_workflow(&state, spec, body.owner).await
}

pub async fn delete_backup_mount(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let changed = state.tracker.cancel_job(job_id).await?;
    Ok(Json(json!({ "job_id": job_id, "cancelled": changed })))
}

// ── Failover ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverType {
    Test,
    Live,
}

#[derive(Debug, Deserialize)]
pub struct FailoverUnifiedBody {
    pub context_id: String,
    #[allow(dead_code)]
    pub vmware_vm_id: Option<String>,
    #[allow(dead_code)]
    pub vm_name: Option<String>,
    pub failover_type: FailoverType,
    pub hub_vm_id: String,
    pub target_vm_id: String,
    pub volume_ids: Vec<String>,
    pub source_vm_path: Option<String>,
    pub power_off_source: Option<bool>,
    #[allow(dead_code)]
    pub perform_final_sync: Option<bool>,
    #[allow(dead_code)]
    pub network_strategy: Option<String>,
    pub owner: Option<String>,
}

pub async fn post_failover_unified(
    State(state): State<AppState>,
    Json(body): Json<FailoverUnifiedBody>,
) -> Result<Json<Value>, ApiError> {
    match body.failover_type {
        FailoverType::Test => {
            let spec = FailoverTestSpec {
                vm_context_id: VmContextId::new(body.context_id),
                test_vm_id: body.target_vm_id,
                hub_vm_id: body.hub_vm_id,
                volume_ids: body.volume_ids,
            };
            spawn_workflow(&state, spec, body.owner).await
        }
        FailoverType::Live => {
            let source_vm_path = body
                .source_vm_path
                .ok_or_else(|| ApiError::bad_request("source_vm_path is required for a live failover"))?;
            let spec = FailoverLiveSpec {
                source_vm_path,
                vm_context_id: VmContextId::new(body.context_id),
                target_vm_id: body.target_vm_id,
                hub_vm_id: body.hub_vm_id,
                volume_ids: body.volume_ids,
                power_off_source: body.power_off_source.unwrap_or(false),
            };
            spawn_workflow(&state, spec, body.owner).await
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FailoverRollbackBody {
    pub context_id: String,
    pub failover_type: FailoverType,
    pub hub_vm_id: String,
    pub cutover_vm_id: String,
    pub volume_ids: Vec<String>,
    pub source_vm_path: Option<String>,
    pub power_on_source: Option<bool>,
    #[allow(dead_code)]
    pub force_cleanup: Option<bool>,
    pub owner: Option<String>,
}

/// Runs a failover spec's compensating `cleanup(rollback = true)` on demand,
/// the same path the orchestrator engine takes on a FAIL transition —
/// except triggered by an operator instead of a failed stage. Recorded as
/// its own `Rollback`-kind job for the audit trail.
pub async fn post_failover_rollback(
    State(state): State<AppState>,
    Json(body): Json<FailoverRollbackBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = state.workflow_ctx();
    let vm_context_id = VmContextId::new(body.context_id.clone());
    let operation = format!("rollback failover {}", body.context_id);
    let handle = state
        .tracker
        .start_job(
            None,
            JobKind::Rollback,
            operation,
            body.owner.clone(),
            json!({ "vm_context_id": body.context_id }),
        )
        .await?;

    let prepared: Vec<Value> = body
        .volume_ids
        .iter()
        .map(|v| json!({ "disk_id": v, "volume_id": v, "device_path": "" }))
        .collect();
    let prepared = Value::Array(prepared);

    let result = match body.failover_type {
        FailoverType::Test => {
            let spec = FailoverTestSpec {
                vm_context_id,
                test_vm_id: body.cutover_vm_id,
                hub_vm_id: body.hub_vm_id,
                volume_ids: body.volume_ids,
            };
            sha_orchestrator::WorkflowSpec::cleanup(&spec, &ctx, &prepared, true).await
        }
        FailoverType::Live => {
            let source_vm_path = body.source_vm_path.unwrap_or_default();
            let spec = FailoverLiveSpec {
                source_vm_path,
                vm_context_id,
                target_vm_id: body.cutover_vm_id,
                hub_vm_id: body.hub_vm_id,
                volume_ids: body.volume_ids,
                power_off_source: body.power_on_source.unwrap_or(false),
            };
            sha_orchestrator::WorkflowSpec::cleanup(&spec, &ctx, &prepared, true).await
        }
    };

    match result {
        Ok(()) => {
            state.tracker.finish_job(handle, JobStatus::Completed, None).await?;
            Ok(Json(json!({ "job_id": handle.job_id })))
        }
        Err(e) => {
            error!(job_id = %handle.job_id, error = %e, "failover rollback failed");
            state
                .tracker
                .finish_job(handle, JobStatus::Failed, Some(e.to_string()))
                .await?;
            Err(ApiError::from(e))
        }
    }
}

/// Starts a job record, spawns the rest of the workflow detached, and hands
/// the caller the job id right away — a multi-minute replication or backup
/// run has no business holding an HTTP request open.
async fn spawn_workflow<S>(
    state: &AppState,
    spec: S,
    owner: Option<String>,
) -> Result<Json<Value>, ApiError>
where
    S: sha_orchestrator::WorkflowSpec + 'static,
{
    let ctx = state.workflow_ctx();
    let handle = sha_orchestrator::start(&ctx, &spec, None, owner).await?;
    let job_id = handle.job_id;

    tokio::spawn(async move {
        if let Err(e) = sha_orchestrator::run_from(&ctx, &spec, handle).await {
            error!(job_id = %job_id, error = %e, "workflow run failed to complete");
        }
    });

    Ok(Json(json!({ "job_id": job_id })))
}

// ── Jobs & VM contexts ────────────────────────────────────────────────────────

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let summary = state.tracker.summarize(job_id).await?;
    Ok(Json(json!(summary)))
}

fn vm_context_of(job: &sha_domain::Job) -> Option<String> {
    job.metadata.get("vm_context_id").and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub async fn list_vm_contexts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut contexts = state.store.list_vm_contexts().await?;
    contexts.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    Ok(Json(json!(contexts)))
}

#[derive(Debug, Deserialize)]
pub struct RecentJobsQuery {
    pub limit: Option<u32>,
}

pub async fn vm_context_recent_jobs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RecentJobsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(20);
    let jobs = state.store.list_jobs(limit.max(1000)).await?;
    let matching: Vec<_> = jobs
        .into_iter()
        .filter(|j| vm_context_of(j).as_deref() == Some(id.as_str()))
        .take(limit as usize)
        .collect();
    Ok(Json(json!(matching)))
}

// ── Progress Ingress ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProgressUpdateBody {
    pub stage: String,
    pub status: Option<ProgressStatus>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub throughput_bps: Option<u64>,
    pub percent: Option<u8>,
    pub disk_id: Option<String>,
    pub sync_type: Option<String>,
    pub error_message: Option<String>,
}

pub async fn post_progress_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProgressUpdateBody>,
) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&id)?;
    // Unknown job_id auto-initializes a tracking record rather than 404ing —
    // the byte-mover's first update can race the job row's own creation.
    let record = ProgressRecord {
        job_id,
        disk_id: body.disk_id,
        stage: body.stage,
        status: body.status.unwrap_or(ProgressStatus::InProgress),
        bytes_transferred: body.bytes_transferred,
        total_bytes: body.total_bytes,
        throughput_bps: body.throughput_bps,
        percent: body.percent,
        sync_type: body.sync_type,
        error_message: body.error_message,
        server_receipt_time: chrono::Utc::now(),
    };
    state.store.upsert_progress(&record).await?;
    Ok(StatusCode::OK)
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let records = state.store.list_progress(&job_id).await?;

    let total_bytes: u64 = records.iter().filter_map(|r| r.total_bytes).sum();
    let bytes_transferred: u64 = records.iter().map(|r| r.bytes_transferred).sum();
    let aggregate_percent = if total_bytes > 0 {
        Some(((bytes_transferred as f64 / total_bytes as f64) * 100.0).round() as u8)
    } else {
        None
    };

    Ok(Json(json!({
        "job_id": job_id,
        "disks": records,
        "bytes_transferred": bytes_transferred,
        "total_bytes": total_bytes,
        "percent": aggregate_percent,
    })))
}

// ── Admin: enrollment ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PairingCodeBody {
    pub valid_for_seconds: i64,
}

pub async fn post_pairing_code(
    State(state): State<AppState>,
    Json(body): Json<PairingCodeBody>,
) -> Result<Json<Value>, ApiError> {
    let PairingCode { code, expires_at } = state.enroll.generate_pairing_code(body.valid_for_seconds).await?;
    Ok(Json(json!({ "pairing_code": code, "expires_at": expires_at })))
}

#[derive(Debug, Deserialize)]
pub struct EnrollBody {
    pub pairing_code: String,
    pub sna_public_key: String,
    pub sna_name: String,
    pub sna_version: String,
    pub sna_fingerprint: String,
    pub source_ip: Option<String>,
}

pub async fn post_enroll(
    State(state): State<AppState>,
    Json(body): Json<EnrollBody>,
) -> Result<Json<Value>, ApiError> {
    let (enrollment_id, nonce) = state
        .enroll
        .enroll(
            &body.pairing_code,
            &body.sna_public_key,
            &body.sna_name,
            &body.sna_version,
            &body.sna_fingerprint,
            body.source_ip,
        )
        .await?;
    Ok(Json(json!({ "enrollment_id": enrollment_id, "challenge_nonce": nonce })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub enrollment_id: uuid::Uuid,
    pub signature: String,
}

pub async fn post_verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyBody>,
) -> Result<StatusCode, ApiError> {
    state
        .enroll
        .verify(sha_domain::EnrollmentId(body.enrollment_id), &body.signature)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn get_enrollment_result(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<Value>, ApiError> {
    let enrollment = state.enroll.result(sha_domain::EnrollmentId(id)).await?;
    Ok(Json(json!(enrollment)))
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub enrollment_id: uuid::Uuid,
    pub approver: String,
}

pub async fn post_approve(
    State(state): State<AppState>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<Value>, ApiError> {
    let connection = state
        .enroll
        .approve(sha_domain::EnrollmentId(body.enrollment_id), &body.approver)
        .await?;
    Ok(Json(json!(connection)))
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub enrollment_id: uuid::Uuid,
    pub approver: String,
    pub reason: String,
}

pub async fn post_reject(
    State(state): State<AppState>,
    Json(body): Json<RejectBody>,
) -> Result<StatusCode, ApiError> {
    state
        .enroll
        .reject(sha_domain::EnrollmentId(body.enrollment_id), &body.approver, &body.reason)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub enrollment_id: uuid::Uuid,
    pub revoked_by: String,
}

pub async fn post_revoke(
    State(state): State<AppState>,
    Json(body): Json<RevokeBody>,
) -> Result<StatusCode, ApiError> {
    state
        .enroll
        .revoke(sha_domain::EnrollmentId(body.enrollment_id), &body.revoked_by)
        .await?;
    Ok(StatusCode::OK)
}

// ── Status ────────────────────────────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let jobs = state.store.list_jobs(10_000).await?;

    let mut by_status: HashMap<String, usize> = HashMap::new();
    for job in &jobs {
        *by_status.entry(job.status.to_string()).or_default() += 1;
    }
    let last_activity = jobs
        .iter()
        .filter_map(|j| j.completed_at.or(j.started_at))
        .max();

    let mappings = state.store.list_device_mappings().await?;
    let stale_device_mappings =
        mappings.iter().filter(|m| m.state == DeviceMappingState::Stale).count();

    Ok(Json(json!({
        "job_count": jobs.len(),
        "by_status": by_status,
        "last_activity": last_activity,
        "stale_device_mappings": stale_device_mappings,
    })))
}

pub async fn not_found() -> impl IntoResponse {
    ApiError::bad_request("no such route").into_response()
}
