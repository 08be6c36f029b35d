use async_trait::async_trait;
use chrono::Utc;
use sha_domain::{
    ActiveConnection, AuditEvent, DeviceMapping, EnrollmentId, Export, Enrollment, Job, JobId,
    JobStatus, LogEvent, ProgressRecord, Step, VmContext, VmContextId, VolumeId, VolumeOperation,
    VolumeOperationId,
};

use crate::error::StoreError;
use crate::views::{runtime_seconds, step_completion_percent, ActiveJobRow, JobProgressRow};

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // ── Jobs ──────────────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn list_child_jobs(&self, parent: &JobId) -> Result<Vec<Job>, StoreError>;
    /// Jobs currently `pending` or `running` — the crash-recovery sweep's input.
    async fn list_open_jobs(&self) -> Result<Vec<Job>, StoreError>;
    /// Most recently created jobs, newest first, capped at `limit` — backs the
    /// Control API's job listing and VM-context recent-jobs views.
    async fn list_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError>;

    // ── Steps ─────────────────────────────────────────────────────────────────

    async fn create_step(&self, step: &Step) -> Result<(), StoreError>;
    async fn update_step(&self, step: &Step) -> Result<(), StoreError>;
    async fn list_steps(&self, job_id: &JobId) -> Result<Vec<Step>, StoreError>;

    // ── Logs ──────────────────────────────────────────────────────────────────

    async fn append_log(&self, log: &LogEvent) -> Result<(), StoreError>;
    async fn list_logs(&self, job_id: &JobId, limit: u32) -> Result<Vec<LogEvent>, StoreError>;

    // ── Volume operations ────────────────────────────────────────────────────

    async fn create_volume_operation(&self, op: &VolumeOperation) -> Result<(), StoreError>;
    async fn update_volume_operation(&self, op: &VolumeOperation) -> Result<(), StoreError>;
    async fn get_volume_operation(&self, id: &VolumeOperationId) -> Result<Option<VolumeOperation>, StoreError>;
    async fn list_volume_operations(&self, volume_id: &VolumeId) -> Result<Vec<VolumeOperation>, StoreError>;

    // ── Device mappings ──────────────────────────────────────────────────────

    async fn upsert_device_mapping(&self, mapping: &DeviceMapping) -> Result<(), StoreError>;
    async fn get_device_mapping(&self, volume_id: &VolumeId) -> Result<Option<DeviceMapping>, StoreError>;
    async fn list_device_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError>;
    async fn delete_device_mapping(&self, volume_id: &VolumeId) -> Result<(), StoreError>;

    // ── Exports ───────────────────────────────────────────────────────────────

    async fn upsert_export(&self, export: &Export) -> Result<(), StoreError>;
    async fn get_export(&self, name: &str) -> Result<Option<Export>, StoreError>;
    async fn list_exports(&self) -> Result<Vec<Export>, StoreError>;

    // ── Enrollment & tunnel broker ───────────────────────────────────────────

    async fn create_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;
    async fn update_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;
    async fn get_enrollment(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, StoreError>;
    async fn find_enrollment_by_pairing_code(&self, code: &str) -> Result<Option<Enrollment>, StoreError>;

    async fn upsert_active_connection(&self, conn: &ActiveConnection) -> Result<(), StoreError>;
    async fn get_active_connection(&self, enrollment_id: &EnrollmentId) -> Result<Option<ActiveConnection>, StoreError>;
    async fn list_active_connections(&self) -> Result<Vec<ActiveConnection>, StoreError>;

    // ── VM contexts ───────────────────────────────────────────────────────────

    async fn upsert_vm_context(&self, context: &VmContext) -> Result<(), StoreError>;
    async fn get_vm_context(&self, id: &VmContextId) -> Result<Option<VmContext>, StoreError>;
    async fn list_vm_contexts(&self) -> Result<Vec<VmContext>, StoreError>;

    // ── Progress ──────────────────────────────────────────────────────────────

    async fn upsert_progress(&self, record: &ProgressRecord) -> Result<(), StoreError>;
    async fn list_progress(&self, job_id: &JobId) -> Result<Vec<ProgressRecord>, StoreError>;

    // ── Audit events ──────────────────────────────────────────────────────────

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
    async fn list_events(&self, job_id: Option<&JobId>, limit: u32) -> Result<Vec<AuditEvent>, StoreError>;

    // ── Read-only views ───────────────────────────────────────────────────────
    //
    // Default implementations compose the methods above so a new backend gets
    // them for free; override only if the backend can answer more cheaply
    // (e.g. with a real SQL view).

    async fn job_progress_view(&self, job_id: &JobId) -> Result<Option<JobProgressRow>, StoreError> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(None);
        };
        let steps = self.list_steps(job_id).await?;
        let total = steps.len() as u32;
        let completed = steps.iter().filter(|s| s.status == sha_domain::StepStatus::Completed).count() as u32;
        let failed = steps.iter().filter(|s| s.status == sha_domain::StepStatus::Failed).count() as u32;
        let skipped = steps.iter().filter(|s| s.status == sha_domain::StepStatus::Skipped).count() as u32;
        Ok(Some(JobProgressRow {
            job_id: job.id,
            status: job.status,
            total_steps: total,
            completed_steps: completed,
            failed_steps: failed,
            step_completion_percent: step_completion_percent(total, completed, skipped),
        }))
    }

    async fn active_jobs_view(&self) -> Result<Vec<ActiveJobRow>, StoreError> {
        let jobs = self.list_open_jobs().await?;
        let now = Utc::now();
        let mut rows = Vec::with_capacity(jobs.len());
        for job in jobs {
            let steps = self.list_steps(&job.id).await?;
            let last_step_started_at = steps.iter().map(|s| s.started_at).max();
            rows.push(ActiveJobRow {
                job_id: job.id,
                kind: job.kind,
                status: job.status,
                parent_job_id: job.parent_job_id,
                started_at: job.started_at,
                runtime_seconds: runtime_seconds(job.started_at, now),
                last_step_started_at,
            });
        }
        Ok(rows)
    }
}

/// `true` if `status` is a state `list_open_jobs` should return.
pub fn is_open(status: JobStatus) -> bool {
    matches!(status, JobStatus::Pending | JobStatus::Running)
}
