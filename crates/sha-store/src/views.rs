use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha_domain::{JobId, JobKind, JobStatus};

/// Read-only view matching the `job_progress` view named in the external
/// interfaces: per-job totals and rounded step-completion percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressRow {
    pub job_id: JobId,
    pub status: JobStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub step_completion_percent: u32,
}

/// Read-only view matching the `active_jobs` view: jobs still pending or
/// running, with their parent chain and elapsed runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJobRow {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub parent_job_id: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub runtime_seconds: Option<i64>,
    pub last_step_started_at: Option<DateTime<Utc>>,
}

pub(crate) fn step_completion_percent(total: u32, completed: u32, skipped: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (((completed + skipped) as f64 / total as f64) * 100.0).round() as u32
}

pub(crate) fn runtime_seconds(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    started_at.map(|s| (now - s).num_seconds())
}
