//! Run-resource contract consumed by the gateway.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

use exrun_core::current_unix_timestamp_ms;

use crate::admission::AdmissionController;
use crate::model::{FinishPolicy, RunSnapshot, RunStatus, RunStatusFilter, RunSummary};
use crate::orchestrator::{RunOrchestrator, RunRequest, StopError};
use crate::store::{RunStore, RunSubscription, StoreError};
use crate::workflows::{workflow_name, WorkflowLibrary, WorkflowListing};

pub const BUSY_MESSAGE: &str = "Runner busy: another run is using the shared profile. Set PROFILE_MODE=per-run to allow concurrent runs.";
const RUN_ID_PREFIX: &str = "run";

static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates ids of the form `run-<unix_ms>-<counter>`.
pub fn next_run_id() -> String {
    let counter = RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!(
        "{RUN_ID_PREFIX}-{}-{counter:04}",
        current_unix_timestamp_ms()
    )
}

/// Process-wide defaults applied when a create request omits a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDefaults {
    pub finish_policy: FinishPolicy,
    pub timeout_ms: u64,
    pub idle_ms: u64,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            finish_policy: FinishPolicy::Timeout,
            timeout_ms: 120_000,
            idle_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(default)]
    pub workflow: Option<Value>,
    #[serde(default)]
    pub workflow_file: Option<String>,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub finish_policy: Option<String>,
    #[serde(default)]
    pub idle_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Busy(String),
    #[error("run '{0}' not found")]
    NotFound(String),
    #[error("run '{run_id}' is {status}, not running")]
    NotRunning { run_id: String, status: RunStatus },
    #[error("run '{0}' has no browser session yet")]
    RuntimeNotReady(String),
}

impl RunServiceError {
    /// Stable machine-readable code for API envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Busy(_) => "busy",
            Self::NotFound(_) => "not_found",
            Self::NotRunning { .. } => "not_running",
            Self::RuntimeNotReady(_) => "runtime_not_ready",
        }
    }
}

impl From<StopError> for RunServiceError {
    fn from(error: StopError) -> Self {
        match error {
            StopError::NotFound(run_id) => Self::NotFound(run_id),
            StopError::NotRunning { run_id, status } => Self::NotRunning { run_id, status },
            StopError::RuntimeNotReady(run_id) => Self::RuntimeNotReady(run_id),
        }
    }
}

impl From<StoreError> for RunServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(run_id) => Self::NotFound(run_id),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

pub struct RunService {
    store: Arc<RunStore>,
    admission: Arc<AdmissionController>,
    orchestrator: Arc<RunOrchestrator>,
    workflows: WorkflowLibrary,
    defaults: RunDefaults,
}

impl RunService {
    pub fn new(
        store: Arc<RunStore>,
        admission: Arc<AdmissionController>,
        orchestrator: Arc<RunOrchestrator>,
        workflows: WorkflowLibrary,
        defaults: RunDefaults,
    ) -> Self {
        Self {
            store,
            admission,
            orchestrator,
            workflows,
            defaults,
        }
    }

    pub fn defaults(&self) -> RunDefaults {
        self.defaults
    }

    pub fn workflows(&self) -> &WorkflowLibrary {
        &self.workflows
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Takes admission, validates the request and spawns the run.
    ///
    /// Admission is checked first so a busy runner answers `Busy` whatever the
    /// request holds. No record is created when the request is refused, and
    /// a refused request releases its permit on drop.
    pub async fn create(&self, request: CreateRunRequest) -> Result<String, RunServiceError> {
        let permit = self
            .admission
            .try_acquire()
            .ok_or_else(|| RunServiceError::Busy(BUSY_MESSAGE.to_string()))?;
        let workflow = self.resolve_workflow(&request).await?;
        let variables = match request.variables {
            None | Some(Value::Null) => json!({}),
            Some(Value::Object(fields)) => Value::Object(fields),
            Some(_) => {
                return Err(RunServiceError::InvalidInput(
                    "variables must be a JSON object".to_string(),
                ))
            }
        };
        let finish_policy = match request.finish_policy.as_deref() {
            None => self.defaults.finish_policy,
            Some(raw) if raw.trim().is_empty() => self.defaults.finish_policy,
            Some(raw) => FinishPolicy::parse(raw).ok_or_else(|| {
                RunServiceError::InvalidInput(format!(
                    "finishPolicy must be one of triggered, idle, timeout (got '{raw}')"
                ))
            })?,
        };
        let timeout_ms = request.timeout_ms.unwrap_or(self.defaults.timeout_ms);
        if timeout_ms == 0 {
            return Err(RunServiceError::InvalidInput(
                "timeoutMs must be greater than 0".to_string(),
            ));
        }
        let idle_ms = request.idle_ms.unwrap_or(self.defaults.idle_ms);

        let run_id = next_run_id();
        self.store.create(&run_id, &workflow_name(&workflow))?;
        self.orchestrator.register(&run_id);
        tracing::info!(
            run_id = %run_id,
            finish_policy = finish_policy.as_str(),
            timeout_ms,
            idle_ms,
            "run admitted"
        );
        let run = RunRequest {
            run_id: run_id.clone(),
            workflow,
            variables,
            finish_policy,
            timeout: Duration::from_millis(timeout_ms),
            idle: Duration::from_millis(idle_ms),
        };
        tokio::spawn(Arc::clone(&self.orchestrator).execute(run, permit));
        Ok(run_id)
    }

    async fn resolve_workflow(&self, request: &CreateRunRequest) -> Result<Value, RunServiceError> {
        match &request.workflow {
            Some(Value::Object(definition)) => return Ok(Value::Object(definition.clone())),
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(RunServiceError::InvalidInput(
                    "workflow must be a JSON object".to_string(),
                ))
            }
        }
        match request.workflow_file.as_deref().map(str::trim) {
            Some(file_ref) if !file_ref.is_empty() => {
                let workflow = self
                    .workflows
                    .resolve_blocking(file_ref)
                    .await
                    .map_err(|error| RunServiceError::InvalidInput(error.to_string()))?;
                if !workflow.is_object() {
                    return Err(RunServiceError::InvalidInput(
                        "workflow must be a JSON object".to_string(),
                    ));
                }
                Ok(workflow)
            }
            _ => Err(RunServiceError::InvalidInput(
                "Missing workflow or workflowFile".to_string(),
            )),
        }
    }

    pub fn get(&self, run_id: &str) -> Result<RunSnapshot, RunServiceError> {
        self.store
            .get(run_id)
            .ok_or_else(|| RunServiceError::NotFound(run_id.to_string()))
    }

    pub fn list(&self, filter: Option<RunStatusFilter>) -> Vec<RunSummary> {
        self.store.list(filter)
    }

    pub fn subscribe(&self, run_id: &str) -> Result<RunSubscription, RunServiceError> {
        Ok(self.store.subscribe(run_id)?)
    }

    pub async fn stop(&self, run_id: &str) -> Result<(), RunServiceError> {
        Ok(self.orchestrator.stop(run_id).await?)
    }

    /// Revision feed that changes whenever a run is created or changes status.
    pub fn watch_runs(&self) -> watch::Receiver<u64> {
        self.store.watch()
    }

    pub fn list_workflows(&self) -> Vec<WorkflowListing> {
        self.workflows.list()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;

    use exrun_browser::{ScriptedBrowserHost, TRIGGERED_MESSAGE};
    use exrun_core::LogKind;

    use super::{next_run_id, CreateRunRequest, RunServiceError, BUSY_MESSAGE};
    use crate::model::{IsolationMode, RunStatus, RunStatusFilter};
    use crate::test_support::{wait_for_session, wait_for_terminal, Harness};

    fn triggered(workflow: serde_json::Value) -> CreateRunRequest {
        CreateRunRequest {
            workflow: Some(workflow),
            finish_policy: Some("triggered".to_string()),
            ..CreateRunRequest::default()
        }
    }

    #[test]
    fn unit_run_ids_are_unique_and_prefixed() {
        let ids = (0..50).map(|_| next_run_id()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 50);
        assert!(ids.iter().all(|id| id.starts_with("run-")));
    }

    #[test]
    fn unit_create_request_accepts_camel_case_body() {
        let request: CreateRunRequest = serde_json::from_value(json!({
            "workflowFile": "demo.json",
            "variables": {"a": 1},
            "timeoutMs": 5000,
            "finishPolicy": "idle",
            "idleMs": 1500
        }))
        .expect("parse");
        assert_eq!(request.workflow_file.as_deref(), Some("demo.json"));
        assert_eq!(request.timeout_ms, Some(5_000));
        assert_eq!(request.idle_ms, Some(1_500));
    }

    #[tokio::test]
    async fn functional_create_rejects_invalid_input_without_creating_records() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::Shared);
        let service = harness.service();
        let cases = [
            (CreateRunRequest::default(), "Missing workflow or workflowFile"),
            (
                CreateRunRequest {
                    workflow_file: Some("missing.json".to_string()),
                    ..CreateRunRequest::default()
                },
                "workflowFile not found",
            ),
            (
                CreateRunRequest {
                    workflow_file: Some("../escape.json".to_string()),
                    ..CreateRunRequest::default()
                },
                "Invalid workflow file",
            ),
            (
                CreateRunRequest {
                    workflow: Some(json!({"name": "x"})),
                    finish_policy: Some("eventually".to_string()),
                    ..CreateRunRequest::default()
                },
                "finishPolicy must be one of triggered, idle, timeout (got 'eventually')",
            ),
        ];
        for (request, message) in cases {
            assert_eq!(
                service.create(request).await,
                Err(RunServiceError::InvalidInput(message.to_string()))
            );
        }
        assert!(service.list(None).is_empty());
        assert!(!harness.admission.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn functional_triggered_run_without_id_succeeds_with_one_trigger_info() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::Shared);
        let service = harness.service();
        let run_id = service
            .create(triggered(json!({"name": "No Id Workflow"})))
            .await
            .expect("create");
        assert_eq!(
            wait_for_terminal(&harness.store, &run_id).await,
            RunStatus::Succeeded
        );
        let snapshot = service.get(&run_id).expect("snapshot");
        assert_eq!(snapshot.summary.workflow_name, "No Id Workflow");
        let triggered_infos = snapshot
            .log
            .iter()
            .filter(|entry| entry.kind == LogKind::Info && entry.text == TRIGGERED_MESSAGE)
            .count();
        assert_eq!(triggered_infos, 1);
        let script = &harness.host.last_session().expect("session").trigger_evaluations()[0];
        assert!(script.expression.contains("\"id\":\"runner-"));
    }

    #[tokio::test(start_paused = true)]
    async fn functional_shared_mode_refuses_second_run_until_first_is_terminal() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::Shared);
        let service = harness.service();
        let first = service
            .create(CreateRunRequest {
                workflow: Some(json!({"name": "long"})),
                timeout_ms: Some(30_000),
                ..CreateRunRequest::default()
            })
            .await
            .expect("first");
        wait_for_session(&harness.orchestrator, &first).await;
        assert_eq!(service.get(&first).expect("first").summary.status, RunStatus::Running);

        assert_eq!(
            service.create(triggered(json!({"name": "second"}))).await,
            Err(RunServiceError::Busy(BUSY_MESSAGE.to_string()))
        );
        assert_eq!(
            service.create(CreateRunRequest::default()).await,
            Err(RunServiceError::Busy(BUSY_MESSAGE.to_string()))
        );
        assert_eq!(
            service
                .create(CreateRunRequest {
                    workflow_file: Some("missing.json".to_string()),
                    ..CreateRunRequest::default()
                })
                .await,
            Err(RunServiceError::Busy(BUSY_MESSAGE.to_string()))
        );
        assert_eq!(service.list(None).len(), 1);
        assert!(harness.admission.is_busy());

        assert_eq!(wait_for_terminal(&harness.store, &first).await, RunStatus::Succeeded);
        let second = service
            .create(triggered(json!({"name": "second"})))
            .await
            .expect("admitted after terminal");
        assert_eq!(wait_for_terminal(&harness.store, &second).await, RunStatus::Succeeded);
        let listed = service
            .list(None)
            .into_iter()
            .map(|summary| summary.id)
            .collect::<Vec<_>>();
        assert_eq!(listed, vec![second, first]);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_per_run_mode_admits_concurrent_runs() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::PerRun);
        let service = harness.service();
        let first = service
            .create(CreateRunRequest {
                workflow: Some(json!({"name": "a"})),
                timeout_ms: Some(10_000),
                ..CreateRunRequest::default()
            })
            .await
            .expect("first");
        let second = service
            .create(CreateRunRequest {
                workflow: Some(json!({"name": "b"})),
                timeout_ms: Some(10_000),
                ..CreateRunRequest::default()
            })
            .await
            .expect("second");
        wait_for_session(&harness.orchestrator, &first).await;
        wait_for_session(&harness.orchestrator, &second).await;
        assert_eq!(service.list(RunStatusFilter::parse("running")).len(), 2);
        wait_for_terminal(&harness.store, &first).await;
        wait_for_terminal(&harness.store, &second).await;
    }

    #[tokio::test(start_paused = true)]
    async fn integration_stop_through_service_and_subscription_sees_every_marker() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::Shared);
        let service = harness.service();
        let run_id = service
            .create(CreateRunRequest {
                workflow: Some(json!({"name": "stoppable"})),
                timeout_ms: Some(600_000),
                ..CreateRunRequest::default()
            })
            .await
            .expect("create");
        wait_for_session(&harness.orchestrator, &run_id).await;
        let subscription = service.subscribe(&run_id).expect("subscribe");
        service.stop(&run_id).await.expect("stop");
        assert!(matches!(
            service.stop(&run_id).await,
            Err(RunServiceError::NotRunning { .. })
        ));

        let entries = tokio::time::timeout(Duration::from_secs(30), async {
            use futures_util::StreamExt;
            subscription.into_stream().collect::<Vec<_>>().await
        })
        .await
        .expect("subscription ends");
        let snapshot = service.get(&run_id).expect("snapshot");
        assert_eq!(snapshot.summary.status, RunStatus::Stopped);
        assert_eq!(entries, snapshot.log);
        assert_eq!(entries.last().map(|entry| entry.text.as_str()), Some("Run stopped"));
    }

    #[tokio::test]
    async fn unit_unknown_run_is_not_found_everywhere() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::Shared);
        let service = harness.service();
        assert_eq!(
            service.get("nope").map(|_| ()),
            Err(RunServiceError::NotFound("nope".to_string()))
        );
        assert!(matches!(service.subscribe("nope"), Err(RunServiceError::NotFound(_))));
        assert_eq!(
            service.stop("nope").await,
            Err(RunServiceError::NotFound("nope".to_string()))
        );
        assert_eq!(RunServiceError::NotFound("nope".to_string()).code(), "not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn functional_workflow_file_runs_use_library_definition() {
        let harness = Harness::new(ScriptedBrowserHost::new(), IsolationMode::Shared);
        std::fs::write(
            harness.workflows_dir.join("daily.json"),
            r#"{"id":"fixed-id","name":"Daily Report","drawflow":{"nodes":[]}}"#,
        )
        .expect("workflow");
        let service = harness.service();
        assert_eq!(service.list_workflows().len(), 1);
        let run_id = service
            .create(CreateRunRequest {
                workflow_file: Some("daily.json".to_string()),
                finish_policy: Some("triggered".to_string()),
                ..CreateRunRequest::default()
            })
            .await
            .expect("create");
        wait_for_terminal(&harness.store, &run_id).await;
        let summary = service.get(&run_id).expect("snapshot").summary;
        assert_eq!(summary.workflow_name, "Daily Report");
        let script = &harness.host.last_session().expect("session").trigger_evaluations()[0];
        assert!(script.expression.contains("\"id\":\"fixed-id\""));
    }
}
