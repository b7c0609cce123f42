use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use exrun_browser::{LocatorConfig, ScriptedBrowserHost, SessionLauncher};

use crate::admission::AdmissionController;
use crate::model::{IsolationMode, RunStatus};
use crate::orchestrator::{OrchestratorConfig, RunOrchestrator};
use crate::service::{RunDefaults, RunService};
use crate::store::RunStore;
use crate::workflows::WorkflowLibrary;

pub(crate) fn write_build_manifest(build_dir: &Path) {
    std::fs::create_dir_all(build_dir).expect("build dir");
    std::fs::write(
        build_dir.join("manifest.json"),
        r#"{"name":"Flow Runner","version":"1.0.0","manifest_version":3}"#,
    )
    .expect("manifest");
}

pub(crate) struct Harness {
    _temp: TempDir,
    pub build_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub host: Arc<ScriptedBrowserHost>,
    pub store: Arc<RunStore>,
    pub admission: Arc<AdmissionController>,
    pub orchestrator: Arc<RunOrchestrator>,
}

impl Harness {
    pub fn new(host: ScriptedBrowserHost, mode: IsolationMode) -> Self {
        Self::with_config(host, mode, |_| {})
    }

    pub fn with_config(
        host: ScriptedBrowserHost,
        mode: IsolationMode,
        configure: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("runner");
        let build_dir = temp.path().join("build");
        let workflows_dir = root.join("workflows");
        write_build_manifest(&build_dir);
        std::fs::create_dir_all(&workflows_dir).expect("workflows dir");

        let host = Arc::new(host);
        let store = Arc::new(RunStore::new());
        let admission = Arc::new(AdmissionController::new(mode, &root));
        let mut config = OrchestratorConfig::new(&build_dir);
        config.headless = true;
        config.locator = LocatorConfig {
            protocol_timeout: Duration::from_secs(1),
            profile_timeout: Duration::from_secs(1),
            ..LocatorConfig::default()
        };
        configure(&mut config);
        let orchestrator = Arc::new(RunOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&admission),
            SessionLauncher::new(host.clone()),
            config,
        ));
        Self {
            _temp: temp,
            build_dir,
            workflows_dir,
            host,
            store,
            admission,
            orchestrator,
        }
    }

    pub fn service(&self) -> RunService {
        RunService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.admission),
            Arc::clone(&self.orchestrator),
            WorkflowLibrary::new(&self.workflows_dir),
            RunDefaults::default(),
        )
    }
}

pub(crate) async fn wait_for_session(orchestrator: &RunOrchestrator, run_id: &str) {
    while !orchestrator.session_attached(run_id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn wait_for_terminal(store: &RunStore, run_id: &str) -> RunStatus {
    loop {
        if let Some(status) = store.status(run_id).filter(|status| status.is_terminal()) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
