use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use exrun_browser::{extension_manifest_path, ChromiumHost, ChromiumHostConfig, SessionLauncher};
use exrun_gateway::{run_gateway_server, RunGatewayServerConfig, BRIDGE_PAGE_ENDPOINT};
use exrun_runs::{
    AdmissionController, IsolationMode, OrchestratorConfig, RunDefaults, RunOrchestrator,
    RunService, RunStore, WorkflowLibrary,
};

use crate::Cli;

const BANNER_RULE: &str = "[runner] ==============================================";

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Routes unexpected panics through tracing before the default hook runs.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("[runner] uncaught panic: {info}");
        default_hook(info);
    }));
}

pub fn render_options_line(cli: &Cli) -> String {
    format!(
        "OPEN_BRIDGE={} HEADLESS={} PROFILE_MODE={} PERSIST_RUN_PROFILE={} FINISH_POLICY={} IDLE_MS={} RUN_TIMEOUT_MS={} NO_SANDBOX={}",
        cli.open_bridge,
        cli.headless,
        IsolationMode::from(cli.profile_mode).as_str(),
        cli.persist_run_profile,
        exrun_runs::FinishPolicy::from(cli.finish_policy).as_str(),
        cli.idle_ms,
        cli.run_timeout_ms,
        cli.no_sandbox,
    )
}

pub fn render_startup_banner(cli: &Cli, started_at: DateTime<Utc>, build_ready: bool) -> Vec<String> {
    vec![
        BANNER_RULE.to_string(),
        format!(
            "[runner] started at: {}",
            started_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
        format!(
            "[runner] exrun: v{} | platform: {} {}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        ),
        format!("[runner] chromium: {}", cli.chromium_path.display()),
        format!("[runner] port: {}", cli.port),
        format!("[runner] runnerRoot: {}", cli.runner_root.display()),
        format!("[runner] workflowsDir: {}", cli.resolved_workflows_dir().display()),
        format!("[runner] buildDir: {}", cli.resolved_build_dir().display()),
        format!("[runner] options: {}", render_options_line(cli)),
        format!(
            "[runner] build/manifest.json: {}",
            if build_ready { "found" } else { "missing" }
        ),
        format!("[runner] health: http://localhost:{}/health", cli.port),
        BANNER_RULE.to_string(),
    ]
}

pub fn build_orchestrator_config(cli: &Cli) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(cli.resolved_build_dir());
    config.headless = cli.headless;
    config.persist_run_profile = cli.persist_run_profile;
    config.bridge_url = cli
        .open_bridge
        .then(|| format!("http://localhost:{}{BRIDGE_PAGE_ENDPOINT}", cli.port));
    config
}

/// Wires store, admission, orchestrator and workflow library into a service.
pub fn build_run_service(cli: &Cli) -> Arc<RunService> {
    let host = Arc::new(ChromiumHost::new(ChromiumHostConfig {
        executable: cli.chromium_path.clone(),
        ..ChromiumHostConfig::default()
    }));
    let store = Arc::new(RunStore::new());
    let admission = Arc::new(AdmissionController::new(
        cli.profile_mode.into(),
        &cli.runner_root,
    ));
    let launcher = SessionLauncher::new(host).with_no_sandbox(cli.no_sandbox);
    let orchestrator = Arc::new(RunOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&admission),
        launcher,
        build_orchestrator_config(cli),
    ));
    Arc::new(RunService::new(
        store,
        admission,
        orchestrator,
        WorkflowLibrary::new(cli.resolved_workflows_dir()),
        RunDefaults {
            finish_policy: cli.finish_policy.into(),
            timeout_ms: cli.run_timeout_ms,
            idle_ms: cli.idle_ms,
        },
    ))
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub async fn run_runner(cli: Cli) -> Result<()> {
    let started_at = Utc::now();
    ensure_dir(&cli.runner_root)?;
    ensure_dir(&cli.resolved_workflows_dir())?;

    let build_dir = cli.resolved_build_dir();
    let build_ready = extension_manifest_path(&build_dir).is_file();
    for line in render_startup_banner(&cli, started_at, build_ready) {
        if line.starts_with("[runner] build/manifest.json") && !build_ready {
            tracing::warn!("{line}");
        } else {
            tracing::info!("{line}");
        }
    }

    let service = build_run_service(&cli);
    run_gateway_server(RunGatewayServerConfig::new(cli.bind_addr(), build_dir), service).await
}
