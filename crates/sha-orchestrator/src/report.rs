use serde::{Deserialize, Serialize};
use sha_domain::JobId;

/// One stage of the shared workflow skeleton (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    PrepareVolumes,
    Export,
    StartMover,
    StreamProgress,
    Finalize,
    Cleanup,
    Rollback,
}

impl Stage {
    pub fn step_name(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::PrepareVolumes => "prepare_volumes",
            Stage::Export => "export",
            Stage::StartMover => "start_mover",
            Stage::StreamProgress => "stream_progress",
            Stage::Finalize => "finalize",
            Stage::Cleanup => "cleanup",
            Stage::Rollback => "rollback",
        }
    }
}

/// One ran-or-skipped stage, recorded for the run's summary report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub ran: bool,
    pub error: Option<String>,
}

/// Summary of one workflow run — named by analogy with the audit-trail
/// style used elsewhere in this codebase — so an operator or automated test
/// can assert on the shape of a run without re-deriving it from log lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub job_id: JobId,
    pub intended_stages: Vec<Stage>,
    pub outcomes: Vec<StageOutcome>,
    pub rolled_back: bool,
    pub fatal_error: Option<String>,
}

impl WorkflowReport {
    pub fn new(job_id: JobId, intended_stages: Vec<Stage>) -> Self {
        WorkflowReport { job_id, intended_stages, outcomes: Vec::new(), rolled_back: false, fatal_error: None }
    }

    pub fn record(&mut self, stage: Stage, error: Option<String>) {
        self.outcomes.push(StageOutcome { stage, ran: true, error });
    }
}
