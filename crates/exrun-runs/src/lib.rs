//! Run lifecycle for exrun: registry and log fanout, admission over the
//! browser profile, the run state machine and the run-resource service.

pub mod admission;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod store;
pub mod workflows;

#[cfg(test)]
pub(crate) mod test_support;

pub use admission::{AdmissionController, AdmissionPermit};
pub use model::{FinishPolicy, IsolationMode, RunSnapshot, RunStatus, RunStatusFilter, RunSummary};
pub use orchestrator::{OrchestratorConfig, RunOrchestrator, RunRequest, StopError};
pub use service::{
    next_run_id, CreateRunRequest, RunDefaults, RunService, RunServiceError, BUSY_MESSAGE,
};
pub use store::{RunLogSink, RunStore, RunSubscription, StoreError};
pub use workflows::{workflow_meta, workflow_name, WorkflowError, WorkflowLibrary, WorkflowListing};
