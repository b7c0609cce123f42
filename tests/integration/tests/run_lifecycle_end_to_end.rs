use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;

use exrun_browser::{
    BrowserError, LocatorConfig, ScriptedBrowserHost, SessionEvent, SessionLauncher,
    TRIGGERED_MESSAGE,
};
use exrun_gateway::{build_run_api_router, RunGatewayState};
use exrun_runs::{
    AdmissionController, IsolationMode, OrchestratorConfig, RunDefaults, RunOrchestrator,
    RunService, RunStore, WorkflowLibrary,
};

const PROFILE_EXTENSION_ID: &str = "ponmlkjihgfedcbaponmlkjihgfedcba";

struct RunnerFixture {
    _temp: TempDir,
    root: PathBuf,
    workflows_dir: PathBuf,
    host: Arc<ScriptedBrowserHost>,
    addr: SocketAddr,
    server: tokio::task::JoinHandle<()>,
}

impl RunnerFixture {
    async fn start(host: ScriptedBrowserHost, mode: IsolationMode) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("runner");
        let build_dir = temp.path().join("build");
        let workflows_dir = root.join("workflows");
        std::fs::create_dir_all(&build_dir).expect("build dir");
        std::fs::create_dir_all(&workflows_dir).expect("workflows dir");
        std::fs::write(
            build_dir.join("manifest.json"),
            r#"{"name":"Flow Runner","version":"1.0.0","manifest_version":3}"#,
        )
        .expect("manifest");

        let host = Arc::new(host);
        let store = Arc::new(RunStore::new());
        let admission = Arc::new(AdmissionController::new(mode, &root));
        let mut config = OrchestratorConfig::new(&build_dir);
        config.headless = true;
        config.locator = LocatorConfig {
            protocol_timeout: Duration::from_millis(400),
            profile_timeout: Duration::from_secs(2),
            ..LocatorConfig::default()
        };
        let orchestrator = Arc::new(RunOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&admission),
            SessionLauncher::new(host.clone()),
            config,
        ));
        let service = Arc::new(RunService::new(
            store,
            admission,
            orchestrator,
            WorkflowLibrary::new(&workflows_dir),
            RunDefaults::default(),
        ));
        let state = Arc::new(RunGatewayState::new(service, 0, &build_dir));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral listener");
        let addr = listener.local_addr().expect("listener addr");
        let app = build_run_api_router(state);
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            _temp: temp,
            root,
            workflows_dir,
            host,
            addr,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn create_run(&self, client: &reqwest::Client, body: Value) -> String {
        let response = client
            .post(self.url("/api/runs"))
            .json(&body)
            .send()
            .await
            .expect("create run");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body = response.json::<Value>().await.expect("json");
        body["data"]["runId"].as_str().expect("runId").to_string()
    }

    async fn snapshot(&self, client: &reqwest::Client, run_id: &str) -> Value {
        let body = client
            .get(self.url(&format!("/api/runs/{run_id}")))
            .send()
            .await
            .expect("get run")
            .json::<Value>()
            .await
            .expect("json");
        body["data"].clone()
    }

    async fn stream_until_end(&self, client: &reqwest::Client, run_id: &str) -> Vec<Value> {
        let response = client
            .get(self.url(&format!("/api/runs/{run_id}/stream")))
            .send()
            .await
            .expect("stream");
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut entries = Vec::new();
        let collect = async {
            while let Some(Ok(chunk)) = body.next().await {
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(index) = buffer.find("\n\n") {
                    let frame = buffer[..index].to_string();
                    buffer.drain(..index + 2);
                    for line in frame.lines() {
                        if let Some(data) = line.strip_prefix("data:") {
                            if let Ok(entry) = serde_json::from_str::<Value>(data.trim_start()) {
                                entries.push(entry);
                            }
                        }
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), collect)
            .await
            .expect("stream ends after the final marker");
        entries
    }
}

impl Drop for RunnerFixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn write_profile_extension(profile_dir: &Path, id: &str) {
    let version_dir = profile_dir
        .join("Default")
        .join("Extensions")
        .join(id)
        .join("1.0.0_0");
    std::fs::create_dir_all(&version_dir).expect("profile extension dir");
    std::fs::write(
        version_dir.join("manifest.json"),
        r#"{"name":"Flow Runner","version":"1.0.0"}"#,
    )
    .expect("profile manifest");
}

fn texts_of<'a>(entries: &'a [Value], kind: &str) -> Vec<&'a str> {
    entries
        .iter()
        .filter(|entry| entry["type"] == kind)
        .filter_map(|entry| entry["text"].as_str())
        .collect()
}

#[tokio::test]
async fn integration_workflow_file_run_streams_state_feed_until_finished() {
    let fixture = RunnerFixture::start(ScriptedBrowserHost::new(), IsolationMode::PerRun).await;
    std::fs::write(
        fixture.workflows_dir.join("checkout.json"),
        json!({
            "id": "wf-checkout",
            "name": "Checkout",
            "drawflow": {"nodes": [
                {"id": "a", "label": "trigger"},
                {"id": "b", "label": "click-element", "data": {"description": "Press buy"}}
            ]}
        })
        .to_string(),
    )
    .expect("workflow");
    let client = reqwest::Client::new();
    let run_id = fixture
        .create_run(
            &client,
            json!({"workflowFile": "checkout.json", "timeoutMs": 1500, "variables": {"qty": 2}}),
        )
        .await;

    let emitter = {
        let host = Arc::clone(&fixture.host);
        tokio::spawn(async move {
            let session = loop {
                if let Some(session) = host.last_session() {
                    break session;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            tokio::time::sleep(Duration::from_millis(300)).await;
            session.emit(SessionEvent::Console {
                page_id: "page-1".to_string(),
                text: r#"[RUNNER:STATE]{"status":"running","currentBlockIds":["b"],"currentBlock":{"id":"b"}}"#
                    .to_string(),
            });
            session.emit(SessionEvent::Console {
                page_id: "page-1".to_string(),
                text: "plain console output".to_string(),
            });
        })
    };

    let entries = fixture.stream_until_end(&client, &run_id).await;
    emitter.await.expect("emitter");

    assert_eq!(texts_of(&entries, "info").first(), Some(&"Launching Chromium and loading extension..."));
    assert_eq!(
        texts_of(&entries, "info")
            .iter()
            .filter(|text| **text == TRIGGERED_MESSAGE)
            .count(),
        1
    );
    let meta = entries
        .iter()
        .find(|entry| entry["type"] == "meta")
        .expect("meta entry");
    assert_eq!(meta["text"], "Checkout");
    assert_eq!(meta["data"]["nodes"][1]["label"], "Press buy");
    let state = entries
        .iter()
        .find(|entry| entry["type"] == "state")
        .expect("state entry");
    assert_eq!(state["text"], "running");
    assert_eq!(state["data"]["currentBlockIds"], json!(["b"]));
    assert!(texts_of(&entries, "console").contains(&"plain console output"));
    assert_eq!(entries.last().map(|entry| entry["text"].clone()), Some(json!("Run finished")));

    let snapshot = fixture.snapshot(&client, &run_id).await;
    assert_eq!(snapshot["status"], "succeeded");
    assert_eq!(snapshot["workflowName"], "Checkout");
    assert!(snapshot["endedAt"].as_str().is_some());
    assert_eq!(snapshot["log"].as_array().expect("log").len(), entries.len());

    let trigger = fixture.host.last_session().expect("session").trigger_evaluations();
    assert_eq!(trigger.len(), 1);
    assert!(trigger[0].expression.contains("\"id\":\"wf-checkout\""));
    assert!(trigger[0].expression.contains("\"qty\":2"));
}

#[tokio::test]
async fn integration_profile_scan_fallback_resolves_extension_id() {
    let host = ScriptedBrowserHost::new().with_targets(Vec::new());
    let fixture = RunnerFixture::start(host, IsolationMode::Shared).await;
    write_profile_extension(&fixture.root.join(".profile"), PROFILE_EXTENSION_ID);
    let client = reqwest::Client::new();
    let run_id = fixture
        .create_run(
            &client,
            json!({"workflow": {"name": "Fallback"}, "finishPolicy": "triggered"}),
        )
        .await;
    let entries = fixture.stream_until_end(&client, &run_id).await;

    assert!(texts_of(&entries, "warn")
        .iter()
        .any(|text| text.starts_with("CDP detect failed")));
    assert!(texts_of(&entries, "info")
        .contains(&format!("Extension ID (FS): {PROFILE_EXTENSION_ID}").as_str()));
    assert_eq!(fixture.snapshot(&client, &run_id).await["status"], "succeeded");
}

#[tokio::test]
async fn integration_rejected_trigger_is_logged_but_run_completes() {
    let host = ScriptedBrowserHost::new().with_trigger_result(json!({"error": "Workflow disabled"}));
    let fixture = RunnerFixture::start(host, IsolationMode::Shared).await;
    let client = reqwest::Client::new();
    let run_id = fixture
        .create_run(
            &client,
            json!({"workflow": {"name": "Disabled"}, "finishPolicy": "triggered"}),
        )
        .await;
    let entries = fixture.stream_until_end(&client, &run_id).await;
    assert!(texts_of(&entries, "error").contains(&"Trigger error: Workflow disabled"));
    assert_eq!(fixture.snapshot(&client, &run_id).await["status"], "succeeded");
}

#[tokio::test]
async fn integration_launch_failure_fails_run_and_frees_shared_profile() {
    let host = ScriptedBrowserHost::new()
        .with_launch_error(BrowserError::Launch("chromium executable not found".to_string()));
    let fixture = RunnerFixture::start(host, IsolationMode::Shared).await;
    let client = reqwest::Client::new();
    let run_id = fixture
        .create_run(&client, json!({"workflow": {"name": "Broken"}}))
        .await;
    let entries = fixture.stream_until_end(&client, &run_id).await;

    let snapshot = fixture.snapshot(&client, &run_id).await;
    assert_eq!(snapshot["status"], "failed");
    assert_eq!(
        snapshot["error"],
        "failed to launch browser: chromium executable not found"
    );
    assert_eq!(entries.last().map(|entry| entry["type"].clone()), Some(json!("error")));

    let second = fixture
        .create_run(&client, json!({"workflow": {"name": "Retry"}}))
        .await;
    assert_ne!(second, run_id);
}
