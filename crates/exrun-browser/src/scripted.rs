//! In-process browser host with scripted behaviour.
//!
//! Drives the run stages without a real browser: sessions report a
//! configurable target list, answer the readiness and trigger evaluations, and
//! let callers inject [`SessionEvent`]s.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

use crate::error::BrowserError;
use crate::host::{
    BrowserHost, BrowserSession, LaunchOptions, PageId, PageInfo, SessionEvent, TargetInfo,
};
use crate::trigger::{DOCUMENT_READY_PROBE, EXECUTE_MESSAGE_NAME, RUNTIME_READY_PROBE};

pub const SCRIPTED_EXTENSION_ID: &str = "abcdefghijklmnopabcdefghijklmnop";

#[derive(Debug, Clone)]
struct SessionScript {
    targets: Vec<TargetInfo>,
    initial_pages: Vec<String>,
    runtime_ready: bool,
    trigger_result: Value,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            targets: vec![extension_worker_target(SCRIPTED_EXTENSION_ID)],
            initial_pages: vec!["about:blank".to_string()],
            runtime_ready: true,
            trigger_result: Value::Bool(true),
        }
    }
}

/// Service-worker target as reported for a loaded MV3 extension.
pub fn extension_worker_target(extension_id: &str) -> TargetInfo {
    TargetInfo {
        target_id: format!("worker-{extension_id}"),
        kind: "service_worker".to_string(),
        url: format!("chrome-extension://{extension_id}/background.js"),
    }
}

#[derive(Default)]
struct HostState {
    launches: Vec<LaunchOptions>,
    sessions: Vec<Arc<ScriptedSession>>,
}

/// Host whose sessions follow a fixed script.
#[derive(Clone, Default)]
pub struct ScriptedBrowserHost {
    script: SessionScript,
    launch_error: Option<BrowserError>,
    launch_gate: Option<Arc<Notify>>,
    state: Arc<Mutex<HostState>>,
}

impl ScriptedBrowserHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(mut self, targets: Vec<TargetInfo>) -> Self {
        self.script.targets = targets;
        self
    }

    pub fn with_initial_pages(mut self, urls: Vec<String>) -> Self {
        self.script.initial_pages = urls;
        self
    }

    pub fn with_runtime_ready(mut self, ready: bool) -> Self {
        self.script.runtime_ready = ready;
        self
    }

    /// Value the trigger script evaluates to (`true`, `false` or `{error}`).
    pub fn with_trigger_result(mut self, result: Value) -> Self {
        self.script.trigger_result = result;
        self
    }

    pub fn with_launch_error(mut self, error: BrowserError) -> Self {
        self.launch_error = Some(error);
        self
    }

    /// Holds every launch until the gate is notified.
    pub fn with_launch_gate(mut self, gate: Arc<Notify>) -> Self {
        self.launch_gate = Some(gate);
        self
    }

    pub fn launches(&self) -> Vec<LaunchOptions> {
        lock_unpoisoned(&self.state).launches.clone()
    }

    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        lock_unpoisoned(&self.state).sessions.clone()
    }

    pub fn last_session(&self) -> Option<Arc<ScriptedSession>> {
        lock_unpoisoned(&self.state).sessions.last().cloned()
    }
}

#[async_trait]
impl BrowserHost for ScriptedBrowserHost {
    async fn launch(&self, options: LaunchOptions) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        lock_unpoisoned(&self.state).launches.push(options.clone());
        if let Some(gate) = &self.launch_gate {
            gate.notified().await;
        }
        if let Some(error) = &self.launch_error {
            return Err(error.clone());
        }
        if !Path::new(&options.profile_dir).exists() {
            return Err(BrowserError::Launch(format!(
                "profile directory {} does not exist",
                options.profile_dir.display()
            )));
        }
        let session = ScriptedSession::from_script(self.script.clone());
        lock_unpoisoned(&self.state).sessions.push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvaluation {
    pub page_id: PageId,
    pub expression: String,
}

/// Session created by [`ScriptedBrowserHost`].
pub struct ScriptedSession {
    script: SessionScript,
    events: broadcast::Sender<SessionEvent>,
    pages: Mutex<Vec<PageInfo>>,
    evaluations: Mutex<Vec<RecordedEvaluation>>,
    next_page: AtomicU64,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl ScriptedSession {
    pub fn new() -> Arc<Self> {
        Self::from_script(SessionScript::default())
    }

    fn from_script(script: SessionScript) -> Arc<Self> {
        let (events, _) = broadcast::channel(1_024);
        let session = Self {
            events,
            pages: Mutex::new(Vec::new()),
            evaluations: Mutex::new(Vec::new()),
            next_page: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            script,
        };
        for url in session.script.initial_pages.clone() {
            session.add_page(&url);
        }
        Arc::new(session)
    }

    /// Injects an event as if the browser had produced it.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn add_page(&self, url: &str) -> PageId {
        let page_id = format!("page-{}", self.next_page.fetch_add(1, Ordering::Relaxed) + 1);
        lock_unpoisoned(&self.pages).push(PageInfo {
            page_id: page_id.clone(),
            url: url.to_string(),
        });
        self.emit(SessionEvent::PageOpened {
            page_id: page_id.clone(),
            url: url.to_string(),
        });
        page_id
    }

    pub fn open_page_urls(&self) -> Vec<String> {
        lock_unpoisoned(&self.pages)
            .iter()
            .map(|page| page.url.clone())
            .collect()
    }

    pub fn evaluations(&self) -> Vec<RecordedEvaluation> {
        lock_unpoisoned(&self.evaluations).clone()
    }

    /// Evaluations that sent the workflow execute message.
    pub fn trigger_evaluations(&self) -> Vec<RecordedEvaluation> {
        self.evaluations()
            .into_iter()
            .filter(|evaluation| evaluation.expression.contains(EXECUTE_MESSAGE_NAME))
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &str) -> Result<(), BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::SessionFault(format!(
                "{operation}: session closed"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, BrowserError> {
        self.ensure_open("list_targets")?;
        let mut targets = self.script.targets.clone();
        targets.extend(lock_unpoisoned(&self.pages).iter().map(|page| TargetInfo {
            target_id: page.page_id.clone(),
            kind: "page".to_string(),
            url: page.url.clone(),
        }));
        Ok(targets)
    }

    async fn pages(&self) -> Result<Vec<PageInfo>, BrowserError> {
        self.ensure_open("pages")?;
        Ok(lock_unpoisoned(&self.pages).clone())
    }

    async fn open_page(&self, url: &str) -> Result<PageId, BrowserError> {
        self.ensure_open("open_page")?;
        let page_id = self.add_page(url);
        self.emit(SessionEvent::Navigated {
            page_id: page_id.clone(),
            url: url.to_string(),
        });
        Ok(page_id)
    }

    async fn evaluate(
        &self,
        page_id: &str,
        expression: &str,
        _await_promise: bool,
    ) -> Result<Value, BrowserError> {
        self.ensure_open("evaluate")?;
        lock_unpoisoned(&self.evaluations).push(RecordedEvaluation {
            page_id: page_id.to_string(),
            expression: expression.to_string(),
        });
        if expression == DOCUMENT_READY_PROBE {
            return Ok(json!("complete"));
        }
        if expression == RUNTIME_READY_PROBE {
            return Ok(Value::Bool(self.script.runtime_ready));
        }
        if expression.contains(EXECUTE_MESSAGE_NAME) {
            return Ok(self.script.trigger_result.clone());
        }
        Ok(Value::Null)
    }

    async fn close_page(&self, page_id: &str) -> Result<(), BrowserError> {
        self.ensure_open("close_page")?;
        lock_unpoisoned(&self.pages).retain(|page| page.page_id != page_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
