//! Run state machine: launch, locate, trigger, finish policy, teardown.
//!
//! Every stage error is caught here and turned into a terminal status plus a
//! log marker. The stop path cancels the run's token, marks it `stopping` and
//! force-closes the session; the token is what distinguishes a stopped run
//! from one whose session failed.
//!
//! The terminal status is decided under the runtimes lock before teardown
//! closes the session. `stop` cancels under the same lock, so a stop either
//! lands before that decision or is refused as `NotRunning`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use exrun_browser::{
    close_welcome_pages, session_log_entries, ActivityMonitor, BrowserSession, ExtensionLocator,
    IdleOutcome, LocatorConfig, SessionEvent, SessionLauncher, TriggerDispatcher, TriggerOptions,
};
use exrun_core::{CooperativeCancellationToken, LogEntry, LogKind, LogSink};

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::model::{FinishPolicy, IsolationMode, RunStatus};
use crate::store::{lock_unpoisoned, RunLogSink, RunStore, StoreError};
use crate::workflows::{workflow_meta, workflow_name};

pub const LAUNCHING_MESSAGE: &str = "Launching Chromium and loading extension...";
pub const STOP_REQUESTED_MESSAGE: &str = "Stopping by user request";
const BRIDGE_OPENED_MESSAGE: &str = "Bridge page opened";
const SESSION_LOST_MESSAGE: &str = "Browser session closed before the run finished";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub build_dir: PathBuf,
    pub headless: bool,
    /// Regular web page opened next to the extension pages, when set.
    pub bridge_url: Option<String>,
    pub persist_run_profile: bool,
    pub locator: LocatorConfig,
    pub trigger: TriggerOptions,
    pub forwarder_drain_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            headless: false,
            bridge_url: None,
            persist_run_profile: false,
            locator: LocatorConfig::default(),
            trigger: TriggerOptions::default(),
            forwarder_drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Inputs of one admitted run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub run_id: String,
    pub workflow: Value,
    pub variables: Value,
    pub finish_policy: FinishPolicy,
    pub timeout: Duration,
    pub idle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("run '{0}' not found")]
    NotFound(String),
    #[error("run '{run_id}' is {status}, not running")]
    NotRunning { run_id: String, status: RunStatus },
    #[error("run '{0}' has no browser session yet")]
    RuntimeNotReady(String),
}

struct RunRuntime {
    session: Option<Arc<dyn BrowserSession>>,
    cancel: CooperativeCancellationToken,
    /// Terminal status decided before teardown; set once the run is closing.
    closing: Option<RunStatus>,
}

#[derive(Default)]
struct LiveSession {
    session: Option<Arc<dyn BrowserSession>>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct RunOrchestrator {
    store: Arc<RunStore>,
    admission: Arc<AdmissionController>,
    launcher: SessionLauncher,
    locator: ExtensionLocator,
    dispatcher: TriggerDispatcher,
    monitor: ActivityMonitor,
    config: OrchestratorConfig,
    runtimes: Mutex<HashMap<String, RunRuntime>>,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<RunStore>,
        admission: Arc<AdmissionController>,
        launcher: SessionLauncher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            admission,
            launcher,
            locator: ExtensionLocator::new(config.locator),
            dispatcher: TriggerDispatcher::new(config.trigger),
            monitor: ActivityMonitor::new(),
            config,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registers the runtime handle for an admitted run; idempotent.
    pub fn register(&self, run_id: &str) -> CooperativeCancellationToken {
        lock_unpoisoned(&self.runtimes)
            .entry(run_id.to_string())
            .or_insert_with(|| RunRuntime {
                session: None,
                cancel: CooperativeCancellationToken::new(),
                closing: None,
            })
            .cancel
            .clone()
    }

    fn attach_session(&self, run_id: &str, session: Arc<dyn BrowserSession>) {
        if let Some(runtime) = lock_unpoisoned(&self.runtimes).get_mut(run_id) {
            runtime.session = Some(session);
        }
    }

    /// Fixes the terminal status and detaches the session from `stop`.
    fn begin_closing(
        &self,
        run_id: &str,
        cancel: &CooperativeCancellationToken,
        result: &Result<(), String>,
    ) -> RunStatus {
        let mut runtimes = lock_unpoisoned(&self.runtimes);
        let status = match (cancel.is_cancelled(), result) {
            (true, _) => RunStatus::Stopped,
            (false, Ok(())) => RunStatus::Succeeded,
            (false, Err(_)) => RunStatus::Failed,
        };
        if let Some(runtime) = runtimes.get_mut(run_id) {
            runtime.session = None;
            runtime.closing = Some(status);
        }
        status
    }

    fn unregister(&self, run_id: &str) {
        lock_unpoisoned(&self.runtimes).remove(run_id);
    }

    /// True once the run's browser session is reachable by `stop`.
    pub fn session_attached(&self, run_id: &str) -> bool {
        lock_unpoisoned(&self.runtimes)
            .get(run_id)
            .is_some_and(|runtime| runtime.session.is_some())
    }

    pub fn active_runs(&self) -> usize {
        lock_unpoisoned(&self.runtimes).len()
    }

    /// Drives one run to a terminal status. The permit is released before the
    /// terminal status becomes visible.
    pub async fn execute(self: Arc<Self>, request: RunRequest, permit: AdmissionPermit) {
        let run_id = request.run_id.clone();
        let cancel = self.register(&run_id);
        let sink = self.store.sink(&run_id);
        let profile_dir = self.admission.profile_dir(&run_id);

        let mut live = LiveSession::default();
        let result = match self.store.transition(&run_id, RunStatus::Running) {
            Ok(_) => {
                sink.emit(LogEntry::info(LAUNCHING_MESSAGE));
                self.run_stages(&request, &profile_dir, &cancel, &sink, &mut live)
                    .await
            }
            Err(error) => Err(error.to_string()),
        };

        let status = self.begin_closing(&run_id, &cancel, &result);
        self.teardown(&run_id, &profile_dir, live).await;
        permit.release();
        self.record_outcome(&run_id, status, result);
        self.unregister(&run_id);
    }

    async fn run_stages(
        &self,
        request: &RunRequest,
        profile_dir: &Path,
        cancel: &CooperativeCancellationToken,
        sink: &RunLogSink,
        live: &mut LiveSession,
    ) -> Result<(), String> {
        let launched = self
            .launcher
            .launch(&self.config.build_dir, profile_dir, self.config.headless)
            .await
            .map_err(|error| error.to_string())?;
        let session = launched.session;
        live.forwarder = Some(spawn_log_forwarder(session.as_ref(), sink.clone()));
        live.session = Some(Arc::clone(&session));
        self.attach_session(&request.run_id, Arc::clone(&session));

        if let Some(bridge_url) = &self.config.bridge_url {
            match session.open_page(bridge_url).await {
                Ok(_) => sink.emit(LogEntry::info(BRIDGE_OPENED_MESSAGE)),
                Err(error) => sink.emit(LogEntry::warn(format!(
                    "Bridge page failed to open: {error}"
                ))),
            }
        }

        let extension_id = self
            .locator
            .resolve(session.as_ref(), profile_dir, &launched.manifest, sink)
            .await
            .map_err(|error| error.to_string())?;
        close_welcome_pages(session.as_ref(), &extension_id).await;

        sink.emit(
            LogEntry::new(LogKind::Meta, workflow_name(&request.workflow))
                .with_data(workflow_meta(&request.workflow)),
        );

        match self
            .dispatcher
            .trigger(
                session.as_ref(),
                &extension_id,
                &request.workflow,
                &request.variables,
                sink,
            )
            .await
        {
            Ok(_) => {}
            Err(error) if !error.is_fatal() => sink.emit(LogEntry::error(error.to_string())),
            Err(error) => return Err(error.to_string()),
        }

        self.apply_finish_policy(request, session.as_ref(), cancel, sink)
            .await
    }

    async fn apply_finish_policy(
        &self,
        request: &RunRequest,
        session: &dyn BrowserSession,
        cancel: &CooperativeCancellationToken,
        sink: &RunLogSink,
    ) -> Result<(), String> {
        match request.finish_policy {
            FinishPolicy::Triggered => Ok(()),
            FinishPolicy::Idle => {
                match self
                    .monitor
                    .wait_for_idle(session, request.idle, request.timeout, cancel)
                    .await
                {
                    IdleOutcome::Idle => {
                        sink.emit(LogEntry::info(format!(
                            "Network idle for {}ms",
                            request.idle.as_millis()
                        )));
                        Ok(())
                    }
                    IdleOutcome::TimedOut => {
                        sink.emit(LogEntry::warn(format!(
                            "Idle wait timed out after {}ms",
                            request.timeout.as_millis()
                        )));
                        Ok(())
                    }
                    IdleOutcome::Interrupted => interrupted(cancel),
                }
            }
            FinishPolicy::Timeout => {
                let mut events = session.subscribe();
                if session.is_closed() {
                    return interrupted(cancel);
                }
                let closed = async move {
                    loop {
                        match events.recv().await {
                            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => break,
                            Ok(_) | Err(RecvError::Lagged(_)) => {}
                        }
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(request.timeout) => Ok(()),
                    _ = cancel.cancelled() => interrupted(cancel),
                    _ = closed => interrupted(cancel),
                }
            }
        }
    }

    async fn teardown(&self, run_id: &str, profile_dir: &Path, live: LiveSession) {
        if let Some(session) = live.session {
            if let Err(error) = session.close().await {
                tracing::warn!(run_id, %error, "failed to close browser session");
            }
        }
        if let Some(mut forwarder) = live.forwarder {
            let drained =
                tokio::time::timeout(self.config.forwarder_drain_timeout, &mut forwarder).await;
            if drained.is_err() {
                forwarder.abort();
            }
        }
        if self.admission.mode() == IsolationMode::PerRun && !self.config.persist_run_profile {
            match tokio::fs::remove_dir_all(profile_dir).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => tracing::warn!(
                    run_id,
                    profile_dir = %profile_dir.display(),
                    %error,
                    "failed to remove run profile"
                ),
            }
        }
    }

    fn record_outcome(&self, run_id: &str, status: RunStatus, result: Result<(), String>) {
        let recorded = match (status, result) {
            (RunStatus::Stopped, _) => self.store.finish(
                run_id,
                RunStatus::Stopped,
                None,
                vec![
                    LogEntry::warn("Run stopped by user"),
                    LogEntry::new(LogKind::End, "Run stopped"),
                ],
            ),
            (_, Ok(())) => self.store.finish(
                run_id,
                RunStatus::Succeeded,
                None,
                vec![LogEntry::new(LogKind::End, "Run finished")],
            ),
            (_, Err(message)) => self.store.finish(
                run_id,
                RunStatus::Failed,
                Some(message.clone()),
                vec![LogEntry::error(message)],
            ),
        };
        if let Err(error) = recorded {
            tracing::warn!(run_id, %error, "failed to record terminal run status");
        }
    }

    /// Stops a running run by cancelling it and force-closing its session.
    pub async fn stop(&self, run_id: &str) -> Result<(), StopError> {
        let status = self
            .store
            .status(run_id)
            .ok_or_else(|| StopError::NotFound(run_id.to_string()))?;
        if status != RunStatus::Running {
            return Err(StopError::NotRunning {
                run_id: run_id.to_string(),
                status,
            });
        }
        let session = {
            let runtimes = lock_unpoisoned(&self.runtimes);
            let runtime = runtimes
                .get(run_id)
                .ok_or_else(|| StopError::RuntimeNotReady(run_id.to_string()))?;
            if let Some(status) = runtime.closing {
                return Err(StopError::NotRunning {
                    run_id: run_id.to_string(),
                    status,
                });
            }
            let session = runtime
                .session
                .clone()
                .ok_or_else(|| StopError::RuntimeNotReady(run_id.to_string()))?;
            self.store
                .transition_with_entry(
                    run_id,
                    RunStatus::Running,
                    RunStatus::Stopping,
                    LogEntry::warn(STOP_REQUESTED_MESSAGE),
                )
                .map_err(|error| match error {
                    StoreError::InvalidTransition { from, .. } => StopError::NotRunning {
                        run_id: run_id.to_string(),
                        status: from,
                    },
                    _ => StopError::NotFound(run_id.to_string()),
                })?;
            runtime.cancel.cancel();
            session
        };

        if let Err(error) = session.close().await {
            tracing::warn!(run_id, %error, "forced session close failed");
        }
        Ok(())
    }
}

fn interrupted(cancel: &CooperativeCancellationToken) -> Result<(), String> {
    if cancel.is_cancelled() {
        Ok(())
    } else {
        Err(SESSION_LOST_MESSAGE.to_string())
    }
}

fn spawn_log_forwarder(session: &dyn BrowserSession, sink: RunLogSink) -> JoinHandle<()> {
    let mut entries = Box::pin(session_log_entries(session.subscribe()));
    tokio::spawn(async move {
        while let Some(entry) = entries.next().await {
            sink.emit(entry);
        }
    })
}
