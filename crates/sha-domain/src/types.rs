use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EnrollmentId, ExportId, JobId, VmContextId, VolumeId, VolumeOperationId};

// ── Job ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Replicate,
    Backup,
    FailoverTest,
    FailoverLive,
    Rollback,
    Restore,
    Enroll,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Replicate => "replicate",
            JobKind::Backup => "backup",
            JobKind::FailoverTest => "failover_test",
            JobKind::FailoverLive => "failover_live",
            JobKind::Rollback => "rollback",
            JobKind::Restore => "restore",
            JobKind::Enroll => "enroll",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of a Job.
///
/// Transitions: Pending → Running → {Completed, Failed, Cancelled}.
/// Once in a terminal state a Job never re-opens — see `Job::mark_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub parent_job_id: Option<JobId>,
    pub kind: JobKind,
    pub operation: String,
    pub status: JobStatus,
    /// Manually-set integer progress, independent of step completion ratio.
    pub percent: Option<u8>,
    pub owner: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        parent_job_id: Option<JobId>,
        kind: JobKind,
        operation: impl Into<String>,
        owner: Option<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Job {
            id: JobId::new(),
            parent_job_id,
            kind,
            operation: operation.into(),
            status: JobStatus::Running,
            percent: None,
            owner,
            metadata,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            cancelled_at: None,
            error: None,
        }
    }

    /// Transition to a terminal state. Returns `false` if the job was already terminal.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        debug_assert!(status.is_terminal(), "finish() requires a terminal status");
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        if status == JobStatus::Cancelled {
            self.cancelled_at = Some(now);
        }
        true
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        self.finish(JobStatus::Cancelled, None, now)
    }
}

// ── VmContext ─────────────────────────────────────────────────────────────────

/// Lifecycle state of the VM a Job operates on, independent of the Job's own
/// status. A VM context outlives any single Job — it is what `ready_for_failover`
/// describes in the recovery invariant (§4.1) and what a failover/rollback
/// cycle moves between `busy` and `failed_over`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmContextStatus {
    /// Created, no workflow has completed against it yet.
    Initializing,
    /// No workflow is running; accepts replicate/backup/failover/restore work.
    ReadyForFailover,
    /// A workflow currently holds this context.
    Busy,
    /// A live failover completed — the target VM is now production.
    FailedOver,
}

impl std::fmt::Display for VmContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmContextStatus::Initializing => "initializing",
            VmContextStatus::ReadyForFailover => "ready_for_failover",
            VmContextStatus::Busy => "busy",
            VmContextStatus::FailedOver => "failed_over",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmContext {
    pub id: VmContextId,
    pub status: VmContextStatus,
    pub last_job_id: Option<JobId>,
    pub last_job_kind: Option<JobKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmContext {
    pub fn new(id: VmContextId, now: DateTime<Utc>) -> Self {
        VmContext { id, status: VmContextStatus::Initializing, last_job_id: None, last_job_kind: None, created_at: now, updated_at: now }
    }

    /// A Job claimed this context — it stays `busy` until that Job finishes.
    pub fn start_job(&mut self, job_id: JobId, kind: JobKind, now: DateTime<Utc>) {
        self.status = VmContextStatus::Busy;
        self.last_job_id = Some(job_id);
        self.last_job_kind = Some(kind);
        self.updated_at = now;
    }

    /// A Job against this context reached a terminal state. `FailoverLive`
    /// completing successfully is the one transition that leaves the context
    /// somewhere other than ready for new work; every other terminal outcome
    /// — success, failure, cancellation, or forced recovery — returns it to
    /// `ready_for_failover` so the next operation isn't blocked on this one.
    pub fn finish_job(&mut self, kind: JobKind, status: JobStatus, now: DateTime<Utc>) {
        self.status = match status {
            JobStatus::Completed if kind == JobKind::FailoverLive => VmContextStatus::FailedOver,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => VmContextStatus::ReadyForFailover,
            JobStatus::Pending | JobStatus::Running => VmContextStatus::Busy,
        };
        self.updated_at = now;
    }
}

// ── Step ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub job_id: JobId,
    /// Monotonically increasing within `job_id`, starting at 1.
    pub seq: u32,
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl Step {
    pub fn new(job_id: JobId, seq: u32, name: impl Into<String>, metadata: serde_json::Value, now: DateTime<Utc>) -> Self {
        Step {
            job_id,
            seq,
            name: name.into(),
            status: StepStatus::Running,
            started_at: now,
            finished_at: None,
            error: None,
            metadata,
        }
    }

    /// Returns `false` (no-op) if the step was already terminal.
    pub fn finish(&mut self, status: StepStatus, error: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        true
    }
}

// ── LogEvent ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: uuid::Uuid,
    pub job_id: Option<JobId>,
    pub step_seq: Option<u32>,
    pub level: LogLevel,
    pub message: String,
    pub attrs: serde_json::Value,
    pub at: DateTime<Utc>,
}

// ── VolumeOperation ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeOperationType {
    Create,
    Attach,
    Detach,
    Delete,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeOperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl VolumeOperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VolumeOperationStatus::Completed | VolumeOperationStatus::Failed | VolumeOperationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeOperation {
    pub id: VolumeOperationId,
    pub op_type: VolumeOperationType,
    pub status: VolumeOperationStatus,
    pub volume_id: VolumeId,
    pub vm_id: Option<String>,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl VolumeOperation {
    pub fn new(op_type: VolumeOperationType, volume_id: VolumeId, vm_id: Option<String>, request: serde_json::Value, now: DateTime<Utc>) -> Self {
        VolumeOperation {
            id: VolumeOperationId::new(),
            op_type,
            status: VolumeOperationStatus::Pending,
            volume_id,
            vm_id,
            request,
            response: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

// ── DeviceMapping ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Normal,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMappingState {
    /// A device has been observed and correlated; `device_path` is live.
    Attached,
    /// The matching removal event was observed; the mapping is kept for audit.
    Detached,
    /// The Volume Daemon could not confirm detach within the window; operator
    /// attention required before the volume is touched again.
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub taken_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub vm_context_id: VmContextId,
    pub volume_uuid: VolumeId,
    pub vm_id: Option<String>,
    pub mode: OperationMode,
    pub device_index: Option<i32>,
    pub device_path: Option<String>,
    pub cloudstack_state: Option<String>,
    pub state: DeviceMappingState,
    pub size_bytes: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// CBT change-id from the most recent completed transfer, so the next
    /// incremental replicate knows where to resume.
    pub last_change_id: Option<String>,
    pub snapshot: Option<SnapshotInfo>,
    /// A stable name independent of kernel enumeration order, used by the
    /// Export Publisher so an export name never needs to change.
    pub device_alias: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Export ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub id: ExportId,
    pub volume_uuid: VolumeId,
    pub export_name: String,
    pub device_path: String,
    pub port: u16,
    pub status: ExportStatus,
    pub metadata: serde_json::Value,
}

// ── Enrollment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// Pairing code issued by an operator, not yet presented by an SNA.
    Issued,
    PendingVerification,
    AwaitingApproval,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub pairing_code: String,
    /// Base64-encoded Ed25519 public key presented by the SNA at `Enroll` time.
    pub sna_public_key: String,
    pub sna_name: String,
    pub sna_version: String,
    pub sna_fingerprint: String,
    pub source_ip: Option<String>,
    /// Base64-encoded 32-byte challenge nonce generated at `Enroll` time.
    pub challenge_nonce: String,
    pub status: EnrollmentStatus,
    pub approver: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
}

// ── ActiveConnection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveConnectionStatus {
    Connected,
    Disconnected,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub enrollment_id: EnrollmentId,
    pub ssh_principal: String,
    pub status: ActiveConnectionStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
}

// ── ProgressRecord ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::InProgress)
    }
}

/// Per-`(job_id, disk_id)` progress state. `disk_id = None` is the whole-job
/// aggregate row for single-disk jobs (see sha-tracker's fan-in logic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: JobId,
    pub disk_id: Option<String>,
    pub stage: String,
    pub status: ProgressStatus,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub throughput_bps: Option<u64>,
    pub percent: Option<u8>,
    pub sync_type: Option<String>,
    pub error_message: Option<String>,
    pub server_receipt_time: DateTime<Utc>,
}

// ── AuditEvent ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AuditEvent {
    JobStarted {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        job_id: JobId,
        kind: JobKind,
    },
    JobCompleted {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        job_id: JobId,
        status: JobStatus,
    },
    DeviceCorrelationFailed {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        volume_id: VolumeId,
        message: String,
    },
    ExportRebound {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        export_name: String,
        new_device_path: String,
    },
    EnrollmentCreated {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        enrollment_id: EnrollmentId,
    },
    ChallengeVerified {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        enrollment_id: EnrollmentId,
    },
    EnrollmentApproved {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        enrollment_id: EnrollmentId,
        approver: String,
    },
    EnrollmentRejected {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        enrollment_id: EnrollmentId,
        approver: String,
        reason: String,
    },
    ConnectionEstablished {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        enrollment_id: EnrollmentId,
    },
    ConnectionRevoked {
        id: uuid::Uuid,
        at: DateTime<Utc>,
        enrollment_id: EnrollmentId,
        by: String,
    },
}

impl AuditEvent {
    /// Job this event pertains to, if any — used for store-side filtering.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            AuditEvent::JobStarted { job_id, .. } => Some(job_id),
            AuditEvent::JobCompleted { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn enrollment_id(&self) -> Option<&EnrollmentId> {
        match self {
            AuditEvent::EnrollmentCreated { enrollment_id, .. } => Some(enrollment_id),
            AuditEvent::ChallengeVerified { enrollment_id, .. } => Some(enrollment_id),
            AuditEvent::EnrollmentApproved { enrollment_id, .. } => Some(enrollment_id),
            AuditEvent::EnrollmentRejected { enrollment_id, .. } => Some(enrollment_id),
            AuditEvent::ConnectionEstablished { enrollment_id, .. } => Some(enrollment_id),
            AuditEvent::ConnectionRevoked { enrollment_id, .. } => Some(enrollment_id),
            _ => None,
        }
    }
}

/// Progress-aggregate view returned by `Summarize` (sha-tracker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub running_steps: u32,
    pub skipped_steps: u32,
    pub step_completion: f64,
    pub manual_completion: Option<u8>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub runtime_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: Job,
    pub steps: Vec<Step>,
    pub progress: ProgressInfo,
}
