use sha_domain::{ErrorKind, JobId, JobStatus, StepStatus};
use sha_tracker::JobHandle;
use tracing::{error, info, warn};

use crate::ctx::WorkflowCtx;
use crate::error::OrchestratorError;
use crate::report::{Stage, WorkflowReport};
use crate::spec::WorkflowSpec;

const INTENDED_STAGES: [Stage; 7] = [
    Stage::Plan,
    Stage::PrepareVolumes,
    Stage::Export,
    Stage::StartMover,
    Stage::StreamProgress,
    Stage::Finalize,
    Stage::Cleanup,
];

/// Allocates the job record without driving any stage — split out of `run`
/// so a caller that needs the job id before the workflow finishes (the
/// Control API, handing back `{job_id}` while the run continues in a
/// spawned task) isn't forced to wait on the whole thing.
pub async fn start(
    ctx: &WorkflowCtx,
    spec: &dyn WorkflowSpec,
    parent: Option<JobId>,
    owner: Option<String>,
) -> Result<JobHandle, OrchestratorError> {
    Ok(ctx
        .tracker
        .start_job(
            parent,
            spec.kind(),
            spec.operation_label(),
            owner,
            serde_json::json!({ "vm_context_id": spec.vm_context_id() }),
        )
        .await?)
}

/// Drives one workflow run through the shared skeleton (§4.7), dispatching
/// to `spec` for the kind-specific PREPARE_VOLUMES/EXPORT/START_MOVER/
/// FINALIZE/CLEANUP behavior.
///
/// Never returns `Err` for a workflow-level failure — those land in the
/// returned report so a caller or test can assert on the run's shape
/// without re-deriving it from log lines. Only a failure of the Tracker
/// itself (the thing doing the reporting) surfaces as `Err`.
pub async fn run(
    ctx: &WorkflowCtx,
    spec: &dyn WorkflowSpec,
    parent: Option<JobId>,
    owner: Option<String>,
) -> Result<WorkflowReport, OrchestratorError> {
    let handle = start(ctx, spec, parent, owner).await?;
    run_from(ctx, spec, handle).await
}

/// The rest of `run`, starting from an already-allocated job handle.
pub async fn run_from(
    ctx: &WorkflowCtx,
    spec: &dyn WorkflowSpec,
    handle: JobHandle,
) -> Result<WorkflowReport, OrchestratorError> {
    let job_id = handle.job_id;
    let mut report = WorkflowReport::new(job_id, INTENDED_STAGES.to_vec());
    report.record(Stage::Plan, None);

    let prepared = serde_json::Value::Null;
    let prepared = match run_stage(ctx, job_id, Stage::PrepareVolumes, spec.prepare_volumes(ctx)).await {
        Ok(value) => {
            report.record(Stage::PrepareVolumes, None);
            value
        }
        Err(e) => {
            report.record(Stage::PrepareVolumes, Some(e.to_string()));
            run_rollback(ctx, spec, handle, &mut report, prepared, e).await?;
            return Ok(report);
        }
    };

    if cancelled(ctx, job_id).await? {
        run_rollback(ctx, spec, handle, &mut report, prepared, OrchestratorError::Cancelled).await?;
        return Ok(report);
    }

    let exported = match run_stage(ctx, job_id, Stage::Export, spec.export(ctx, &prepared)).await {
        Ok(value) => {
            report.record(Stage::Export, None);
            value
        }
        Err(e) => {
            report.record(Stage::Export, Some(e.to_string()));
            run_rollback(ctx, spec, handle, &mut report, prepared, e).await?;
            return Ok(report);
        }
    };

    if cancelled(ctx, job_id).await? {
        run_rollback(ctx, spec, handle, &mut report, prepared, OrchestratorError::Cancelled).await?;
        return Ok(report);
    }

    if let Err(e) = run_stage(ctx, job_id, Stage::StartMover, spec.start_mover(ctx, job_id, &exported)).await {
        report.record(Stage::StartMover, Some(e.to_string()));
        run_rollback(ctx, spec, handle, &mut report, prepared, e).await?;
        return Ok(report);
    }
    report.record(Stage::StartMover, None);

    // Progress itself arrives out of band through the Progress Ingress,
    // updating the ProgressRecord directly — this stage just marks that the
    // transfer is underway so the job summary reflects it.
    run_stage(ctx, job_id, Stage::StreamProgress, async { Ok(()) }).await?;
    report.record(Stage::StreamProgress, None);

    if let Err(e) = run_stage(ctx, job_id, Stage::Finalize, spec.finalize(ctx, &exported)).await {
        report.record(Stage::Finalize, Some(e.to_string()));
        run_rollback(ctx, spec, handle, &mut report, prepared, e).await?;
        return Ok(report);
    }
    report.record(Stage::Finalize, None);

    match run_stage(ctx, job_id, Stage::Cleanup, spec.cleanup(ctx, &prepared, false)).await {
        Ok(()) => report.record(Stage::Cleanup, None),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "non-fatal cleanup error on success path");
            report.record(Stage::Cleanup, Some(e.to_string()));
        }
    }

    ctx.tracker.finish_job(handle, JobStatus::Completed, None).await?;
    info!(job_id = %job_id, "workflow completed");
    Ok(report)
}

async fn run_stage<T>(
    ctx: &WorkflowCtx,
    job_id: JobId,
    stage: Stage,
    body: impl std::future::Future<Output = Result<T, OrchestratorError>>,
) -> Result<T, OrchestratorError> {
    let step = ctx.tracker.start_step(job_id, stage.step_name(), serde_json::json!({})).await?;
    match body.await {
        Ok(value) => {
            ctx.tracker.finish_step(step, StepStatus::Completed, None).await?;
            Ok(value)
        }
        Err(e) => {
            ctx.tracker.finish_step(step, StepStatus::Failed, Some(e.to_string())).await?;
            Err(e)
        }
    }
}

async fn cancelled(ctx: &WorkflowCtx, job_id: JobId) -> Result<bool, OrchestratorError> {
    let summary = ctx.tracker.summarize(job_id).await?;
    Ok(summary.job.status == JobStatus::Cancelled)
}

/// FAIL → ROLLBACK → FAILED. Runs the workflow's compensating cleanup, records
/// the stage outcome, and always finishes the job terminal — a rollback
/// that itself errors still leaves the job in a terminal state, flagged for
/// operator attention via the sanitized hint on the report.
async fn run_rollback(
    ctx: &WorkflowCtx,
    spec: &dyn WorkflowSpec,
    handle: JobHandle,
    report: &mut WorkflowReport,
    prepared: serde_json::Value,
    cause: OrchestratorError,
) -> Result<(), OrchestratorError> {
    report.rolled_back = true;
    let hint = cause.user_hint(&format!("{} job", spec.kind()));
    report.fatal_error = Some(hint.clone());

    let step = ctx.tracker.start_step(handle.job_id, Stage::Rollback.step_name(), serde_json::json!({})).await?;
    match spec.cleanup(ctx, &prepared, true).await {
        Ok(()) => {
            ctx.tracker.finish_step(step, StepStatus::Completed, None).await?;
            report.record(Stage::Rollback, None);
        }
        Err(e) => {
            error!(job_id = %handle.job_id, error = %e, "rollback cleanup failed");
            ctx.tracker.finish_step(step, StepStatus::Failed, Some(e.to_string())).await?;
            report.record(Stage::Rollback, Some(e.to_string()));
        }
    }

    let status = if matches!(cause, OrchestratorError::Cancelled) { JobStatus::Cancelled } else { JobStatus::Failed };
    ctx.tracker.finish_job(handle, status, Some(hint)).await?;
    Ok(())
}

/// Whether the orchestrator's retry policy (§4.7) would have retried this
/// error kind — used by callers deciding whether to resubmit automatically.
pub fn is_retryable(err: &OrchestratorError) -> bool {
    err.kind() == ErrorKind::UpstreamTransient
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sha_domain::VmContextId;
    use sha_store::InMemoryStore;
    use sha_tracker::Tracker;
    use sha_volume::{
        DeviceInfo, ExportPublisher, InMemoryUpstreamClient, NullExportServerSignal,
        SimulatedObserver, VolumeDaemon,
    };

    use crate::sna_client::InMemorySnaClient;
    use crate::spec::{DiskSpec, ReplicateSpec};

    fn test_ctx() -> (WorkflowCtx, std::sync::Arc<SimulatedObserver>, std::sync::Arc<dyn sha_store::StateStore>) {
        let store: std::sync::Arc<dyn sha_store::StateStore> = std::sync::Arc::new(InMemoryStore::new());
        let upstream: std::sync::Arc<dyn sha_volume::UpstreamClient> =
            std::sync::Arc::new(InMemoryUpstreamClient::new());
        let observer = std::sync::Arc::new(SimulatedObserver::new());
        let volume_daemon = std::sync::Arc::new(
            VolumeDaemon::new(store.clone(), upstream, observer.clone())
                .with_correlation_window(Duration::from_millis(200)),
        );
        let publisher = std::sync::Arc::new(ExportPublisher::new(store.clone(), std::sync::Arc::new(NullExportServerSignal)));
        let tracker = std::sync::Arc::new(Tracker::new(store.clone()));
        let sna: std::sync::Arc<dyn crate::sna_client::SnaClient> = std::sync::Arc::new(InMemorySnaClient::new());
        (WorkflowCtx::new(tracker, volume_daemon, publisher, sna), observer, store)
    }

    fn one_disk() -> Vec<DiskSpec> {
        vec![DiskSpec {
            disk_id: "disk0".into(),
            size_bytes: 1 << 30,
            offering_id: "offering-1".into(),
            zone_id: "zone-1".into(),
            previous_change_id: None,
        }]
    }

    #[tokio::test]
    async fn replicate_workflow_completes_and_reports_every_stage() {
        let (ctx, observer, store) = test_ctx();
        let vm_context_id = VmContextId::new("web01");
        let spec = ReplicateSpec {
            source_vm_path: "/dc/vm/web01".into(),
            vm_context_id: vm_context_id.clone(),
            hub_vm_id: "hub-vm-1".into(),
            disks: one_disk(),
        };

        let ctx2 = ctx.clone();
        let run_fut = tokio::spawn(async move { run(&ctx2, &spec, None, None).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        observer.simulate_attach(DeviceInfo {
            name: "vdb".into(),
            device_path: "/dev/vdb".into(),
            size_bytes: 1 << 30,
            controller_token: "ctrl-1".into(),
        });

        let report = run_fut.await.unwrap().unwrap();
        assert!(!report.rolled_back);
        assert!(report.fatal_error.is_none());
        assert_eq!(report.outcomes.len(), INTENDED_STAGES.len());
        assert!(report.outcomes.iter().all(|o| o.error.is_none()));

        let summary = ctx.tracker.summarize(report.job_id).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Completed);

        let context = store.get_vm_context(&vm_context_id).await.unwrap().unwrap();
        assert_eq!(context.status, sha_domain::VmContextStatus::ReadyForFailover);
    }

    #[tokio::test]
    async fn replicate_workflow_rolls_back_when_attach_never_correlates() {
        let (ctx, _observer, store) = test_ctx();
        let vm_context_id = VmContextId::new("web02");
        let spec = ReplicateSpec {
            source_vm_path: "/dc/vm/web02".into(),
            vm_context_id: vm_context_id.clone(),
            hub_vm_id: "hub-vm-2".into(),
            disks: one_disk(),
        };

        // No simulate_attach call — the correlation window expires and the
        // engine must roll back instead of advancing past PREPARE_VOLUMES.
        let report = run(&ctx, &spec, None, None).await.unwrap();

        assert!(report.rolled_back);
        assert!(report.fatal_error.is_some());
        let prepare_outcome = report.outcomes.iter().find(|o| o.stage == Stage::PrepareVolumes).unwrap();
        assert!(prepare_outcome.error.is_some());
        assert!(report.outcomes.iter().any(|o| o.stage == Stage::Rollback));
        assert!(!report.outcomes.iter().any(|o| o.stage == Stage::Export));

        let summary = ctx.tracker.summarize(report.job_id).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Failed);

        let context = store.get_vm_context(&vm_context_id).await.unwrap().unwrap();
        assert_eq!(context.status, sha_domain::VmContextStatus::ReadyForFailover);
    }
}
