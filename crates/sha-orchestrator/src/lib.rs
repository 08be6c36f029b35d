pub mod ctx;
pub mod engine;
pub mod error;
pub mod report;
pub mod retry;
pub mod sna_client;
pub mod spec;

pub use ctx::WorkflowCtx;
pub use engine::{is_retryable, run, run_from, start};
pub use error::OrchestratorError;
pub use report::{Stage, StageOutcome, WorkflowReport};
pub use sna_client::{InMemorySnaClient, SnaClient, StartTransferRequest, TargetExport};
pub use spec::{
    BackupSpec, DiskSpec, FailoverLiveSpec, FailoverTestSpec, ReplicateSpec, RestoreSpec,
    WorkflowSpec,
};
