use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha_domain::{
    ErrorKind, Job, JobId, JobKind, JobStatus, JobSummary, LogEvent, LogLevel, ProgressInfo,
    Step, StepStatus, VmContext, VmContextId,
};
use sha_store::StateStore;
use tracing::{info, warn};

use crate::error::TrackerError;

/// Carries a job id through downstream calls. Passed explicitly down the
/// call chain rather than resolved from a process-global table — see the
/// correlation note on the tracker contract.
#[derive(Debug, Clone, Copy)]
pub struct JobHandle {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Copy)]
pub struct StepHandle {
    pub job_id: JobId,
    pub seq: u32,
}

/// Default staleness threshold past which a `running` job is presumed
/// abandoned by a crashed process.
pub const DEFAULT_RECOVERY_THRESHOLD_MINUTES: i64 = 30;

/// Job & Step Tracker. One instance per process, backing every orchestrator
/// and the Control API's job-facing endpoints.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn StateStore>,
}

impl Tracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Tracker { store }
    }

    /// Allocates a job id, persists it `running`, and returns a handle.
    ///
    /// If `parent` is set, the prospective parent chain is validated for
    /// cycles before anything is persisted (§4.1.1).
    pub async fn start_job(
        &self,
        parent: Option<JobId>,
        kind: JobKind,
        operation: impl Into<String>,
        owner: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<JobHandle, TrackerError> {
        let now = Utc::now();
        let job = Job::new(parent, kind, operation, owner, metadata, now);

        if let Some(parent_id) = parent {
            let mut chain = self.ancestor_chain(parent_id).await?;
            chain.push(job.clone());
            sha_graph::validate(&chain)?;
        }

        self.store.create_job(&job).await?;
        info!(job_id = %job.id, kind = %job.kind, "job started");

        if let Some(vm_context_id) = vm_context_id_of(&job) {
            self.claim_vm_context(&vm_context_id, job.id, job.kind, now).await?;
        }

        Ok(JobHandle { job_id: job.id })
    }

    /// Marks the VM context `busy` for the duration of this Job, creating it
    /// on first use.
    async fn claim_vm_context(
        &self,
        id: &VmContextId,
        job_id: JobId,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        let mut context = self.store.get_vm_context(id).await?.unwrap_or_else(|| VmContext::new(id.clone(), now));
        context.start_job(job_id, kind, now);
        self.store.upsert_vm_context(&context).await?;
        Ok(())
    }

    /// Returns the VM context driving `job` back to a state that permits new
    /// work (§4.1's recovery invariant) — or, for a completed live failover,
    /// to `failed_over`.
    async fn release_vm_context(&self, job: &Job, now: DateTime<Utc>) -> Result<(), TrackerError> {
        let Some(vm_context_id) = vm_context_id_of(job) else { return Ok(()) };
        let Some(mut context) = self.store.get_vm_context(&vm_context_id).await? else { return Ok(()) };
        context.finish_job(job.kind, job.status, now);
        self.store.upsert_vm_context(&context).await?;
        Ok(())
    }

    /// Walks `parent_job_id` pointers up from `start`, collecting every job
    /// visited. Returns an error if a link in the chain is missing.
    async fn ancestor_chain(&self, start: JobId) -> Result<Vec<Job>, TrackerError> {
        let mut chain = Vec::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let job = self.store.get_job(&id).await?.ok_or(TrackerError::JobNotFound(id))?;
            cursor = job.parent_job_id;
            chain.push(job);
            if chain.len() > 256 {
                // Defensive cap: a well-formed forest never gets this deep;
                // a corrupt one would otherwise loop forever if `validate`
                // weren't already guarding against the cycle it implies.
                break;
            }
        }
        Ok(chain)
    }

    /// Allocates `seq = max(seq) + 1` for `job_id` and persists the step `running`.
    pub async fn start_step(
        &self,
        job_id: JobId,
        name: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<StepHandle, TrackerError> {
        let existing = self.store.list_steps(&job_id).await?;
        let seq = existing.iter().map(|s| s.seq).max().unwrap_or(0) + 1;
        let step = Step::new(job_id, seq, name, metadata, Utc::now());
        self.store.create_step(&step).await?;
        Ok(StepHandle { job_id, seq })
    }

    /// Terminal transition for a step. Errors if the step was already terminal.
    pub async fn finish_step(
        &self,
        handle: StepHandle,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<(), TrackerError> {
        let mut steps = self.store.list_steps(&handle.job_id).await?;
        let step = steps
            .iter_mut()
            .find(|s| s.seq == handle.seq)
            .ok_or(TrackerError::StepNotFound { job_id: handle.job_id, seq: handle.seq })?;
        if !step.finish(status, error, Utc::now()) {
            return Err(sha_domain::DomainError::StepAlreadyTerminal { job_id: handle.job_id, seq: handle.seq }.into());
        }
        self.store.update_step(step).await?;
        Ok(())
    }

    /// Terminal transition for a job. Errors if the job was already terminal
    /// or if any of its steps are still `running`.
    pub async fn finish_job(
        &self,
        handle: JobHandle,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), TrackerError> {
        let mut job = self
            .store
            .get_job(&handle.job_id)
            .await?
            .ok_or(TrackerError::JobNotFound(handle.job_id))?;

        let steps = self.store.list_steps(&handle.job_id).await?;
        if steps.iter().any(|s| s.status == StepStatus::Running) {
            return Err(sha_domain::DomainError::StepsStillRunning(handle.job_id).into());
        }

        let now = Utc::now();
        if !job.finish(status, error, now) {
            return Err(sha_domain::DomainError::JobAlreadyTerminal(handle.job_id).into());
        }
        self.store.update_job(&job).await?;
        self.store
            .append_event(&sha_domain::AuditEvent::JobCompleted {
                id: uuid::Uuid::new_v4(),
                at: now,
                job_id: job.id,
                status: job.status,
            })
            .await?;
        self.release_vm_context(&job, now).await?;
        Ok(())
    }

    /// Marks a job cancelled. Unlike `finish_job`, this does not require steps
    /// to have stopped running — in-flight steps are allowed to complete; it
    /// is the orchestrator's job to stop starting new ones once it observes
    /// the cancellation. Returns `false` if the job was already terminal.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, TrackerError> {
        let mut job = self.store.get_job(&job_id).await?.ok_or(TrackerError::JobNotFound(job_id))?;
        let changed = job.cancel(Utc::now());
        if changed {
            self.store.update_job(&job).await?;
        }
        Ok(changed)
    }

    /// Best-effort: a logging failure must never fail the calling workflow.
    pub async fn log(
        &self,
        job_id: Option<JobId>,
        step_seq: Option<u32>,
        level: LogLevel,
        message: impl Into<String>,
        attrs: serde_json::Value,
    ) {
        let event = LogEvent {
            id: uuid::Uuid::new_v4(),
            job_id,
            step_seq,
            level,
            message: message.into(),
            attrs,
            at: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&event).await {
            warn!(error = %e, "failed to persist log event");
        }
    }

    pub async fn summarize(&self, job_id: JobId) -> Result<JobSummary, TrackerError> {
        let job = self.store.get_job(&job_id).await?.ok_or(TrackerError::JobNotFound(job_id))?;
        let steps = self.store.list_steps(&job_id).await?;
        let logs = self.store.list_logs(&job_id, 1).await?;

        let total_steps = steps.len() as u32;
        let completed_steps = steps.iter().filter(|s| s.status == StepStatus::Completed).count() as u32;
        let failed_steps = steps.iter().filter(|s| s.status == StepStatus::Failed).count() as u32;
        let running_steps = steps.iter().filter(|s| s.status == StepStatus::Running).count() as u32;
        let skipped_steps = steps.iter().filter(|s| s.status == StepStatus::Skipped).count() as u32;
        let step_completion = if total_steps > 0 {
            (completed_steps + skipped_steps) as f64 / total_steps as f64 * 100.0
        } else {
            0.0
        };

        let last_activity = last_activity_of(&job, &steps, logs.last());
        let runtime_seconds = job.started_at.map(|s| (Utc::now() - s).num_seconds());

        let progress = ProgressInfo {
            total_steps,
            completed_steps,
            failed_steps,
            running_steps,
            skipped_steps,
            step_completion,
            manual_completion: job.percent,
            started_at: job.started_at,
            last_activity,
            runtime_seconds,
        };

        Ok(JobSummary { job, steps, progress })
    }

    /// Crash-recovery sweep: any `running` job whose last activity predates
    /// `threshold` is force-failed with reason `"startup recovery"`, along
    /// with any of its steps still `running`. Returns the number of jobs
    /// recovered.
    pub async fn recover_stale_jobs(&self, threshold: Duration) -> Result<usize, TrackerError> {
        let now = Utc::now();
        let open = self.store.list_open_jobs().await?;
        let mut recovered = 0;

        for mut job in open {
            if job.status != JobStatus::Running {
                continue;
            }
            let steps = self.store.list_steps(&job.id).await?;
            let logs = self.store.list_logs(&job.id, 1).await?;
            let last_activity = last_activity_of(&job, &steps, logs.last()).unwrap_or(job.created_at);
            if now - last_activity < threshold {
                continue;
            }

            for mut step in steps {
                if step.status == StepStatus::Running {
                    step.finish(StepStatus::Failed, Some("startup recovery".into()), now);
                    self.store.update_step(&step).await?;
                }
            }
            job.finish(JobStatus::Failed, Some("startup recovery".into()), now);
            self.store.update_job(&job).await?;
            self.release_vm_context(&job, now).await?;
            warn!(job_id = %job.id, "recovered stale job on startup");
            recovered += 1;
        }

        Ok(recovered)
    }
}

fn vm_context_id_of(job: &Job) -> Option<VmContextId> {
    job.metadata.get("vm_context_id").and_then(|v| v.as_str()).map(VmContextId::new)
}

fn last_activity_of(job: &Job, steps: &[Step], last_log: Option<&LogEvent>) -> Option<DateTime<Utc>> {
    let mut latest = job.started_at;
    for step in steps {
        latest = max_opt(latest, Some(step.started_at));
        latest = max_opt(latest, step.finished_at);
    }
    if let Some(log) = last_log {
        latest = max_opt(latest, Some(log.at));
    }
    latest
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha_store::InMemoryStore;

    fn tracker() -> Tracker {
        Tracker::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn start_and_finish_job() {
        let t = tracker();
        let handle = t.start_job(None, JobKind::Replicate, "replicate vm01", None, serde_json::json!({})).await.unwrap();
        t.finish_job(handle, JobStatus::Completed, None).await.unwrap();

        let summary = t.summarize(handle.job_id).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn finish_job_rejects_double_finish() {
        let t = tracker();
        let handle = t.start_job(None, JobKind::Backup, "backup vm01", None, serde_json::json!({})).await.unwrap();
        t.finish_job(handle, JobStatus::Completed, None).await.unwrap();

        let err = t.finish_job(handle, JobStatus::Failed, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn finish_job_rejects_running_steps() {
        let t = tracker();
        let job = t.start_job(None, JobKind::Replicate, "replicate vm01", None, serde_json::json!({})).await.unwrap();
        t.start_step(job.job_id, "transfer disk 0", serde_json::json!({})).await.unwrap();

        let err = t.finish_job(job, JobStatus::Completed, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[tokio::test]
    async fn step_sequence_increments() {
        let t = tracker();
        let job = t.start_job(None, JobKind::Replicate, "replicate vm01", None, serde_json::json!({})).await.unwrap();
        let s1 = t.start_step(job.job_id, "a", serde_json::json!({})).await.unwrap();
        let s2 = t.start_step(job.job_id, "b", serde_json::json!({})).await.unwrap();
        assert_eq!(s1.seq, 1);
        assert_eq!(s2.seq, 2);
    }

    #[tokio::test]
    async fn cyclic_parent_chain_rejected() {
        let t = tracker();
        let job = t.start_job(None, JobKind::Replicate, "replicate vm01", None, serde_json::json!({})).await.unwrap();

        // A job cannot declare itself as its own parent's ancestor — simulate
        // by pointing a "parent" at a job that doesn't exist yet (dangling),
        // which the ancestor walk must reject before persisting anything.
        let bogus_parent = JobId::new();
        let err = t
            .start_job(Some(bogus_parent), JobKind::Rollback, "rollback", None, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::JobNotFound(id) if id == bogus_parent));
        let _ = job;
    }

    #[tokio::test]
    async fn cancel_job_marks_cancelled_without_waiting_for_steps() {
        let t = tracker();
        let job = t.start_job(None, JobKind::FailoverLive, "failover vm01", None, serde_json::json!({})).await.unwrap();
        t.start_step(job.job_id, "attach volume", serde_json::json!({})).await.unwrap();

        let changed = t.cancel_job(job.job_id).await.unwrap();
        assert!(changed);

        let summary = t.summarize(job.job_id).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Cancelled);

        let changed_again = t.cancel_job(job.job_id).await.unwrap();
        assert!(!changed_again, "cancelling an already-terminal job is a no-op");
    }

    #[tokio::test]
    async fn recover_stale_jobs_force_fails() {
        let t = tracker();
        let handle = t
            .start_job(
                None,
                JobKind::Replicate,
                "replicate vm01",
                None,
                serde_json::json!({ "vm_context_id": "vm01" }),
            )
            .await
            .unwrap();
        t.start_step(handle.job_id, "transfer", serde_json::json!({})).await.unwrap();

        let context = t.store.get_vm_context(&sha_domain::VmContextId::new("vm01")).await.unwrap().unwrap();
        assert_eq!(context.status, sha_domain::VmContextStatus::Busy);

        // Force the job's clock back by mutating the store directly through
        // a fresh Tracker would require backdating `started_at`; instead
        // call recover with a zero threshold so "now - started_at" always exceeds it.
        let recovered = t.recover_stale_jobs(Duration::seconds(-1)).await.unwrap();
        assert_eq!(recovered, 1);

        let summary = t.summarize(handle.job_id).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Failed);
        assert_eq!(summary.job.error.as_deref(), Some("startup recovery"));
        assert!(summary.steps.iter().all(|s| s.status != StepStatus::Running));

        let context = t.store.get_vm_context(&sha_domain::VmContextId::new("vm01")).await.unwrap().unwrap();
        assert_eq!(context.status, sha_domain::VmContextStatus::ReadyForFailover);
    }

    #[tokio::test]
    async fn finish_job_returns_vm_context_to_ready_on_success() {
        let t = tracker();
        let handle = t
            .start_job(
                None,
                JobKind::Backup,
                "backup vm02",
                None,
                serde_json::json!({ "vm_context_id": "vm02" }),
            )
            .await
            .unwrap();
        t.finish_job(handle, JobStatus::Completed, None).await.unwrap();

        let context = t.store.get_vm_context(&sha_domain::VmContextId::new("vm02")).await.unwrap().unwrap();
        assert_eq!(context.status, sha_domain::VmContextStatus::ReadyForFailover);
        assert_eq!(context.last_job_id, Some(handle.job_id));
    }

    #[tokio::test]
    async fn finish_job_marks_vm_context_failed_over_after_live_failover() {
        let t = tracker();
        let handle = t
            .start_job(
                None,
                JobKind::FailoverLive,
                "failover vm03",
                None,
                serde_json::json!({ "vm_context_id": "vm03" }),
            )
            .await
            .unwrap();
        t.finish_job(handle, JobStatus::Completed, None).await.unwrap();

        let context = t.store.get_vm_context(&sha_domain::VmContextId::new("vm03")).await.unwrap().unwrap();
        assert_eq!(context.status, sha_domain::VmContextStatus::FailedOver);
    }
}
