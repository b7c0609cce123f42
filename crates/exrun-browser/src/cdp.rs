//! Chromium host driven over the Chrome DevTools Protocol.
//!
//! The browser is started with `--remote-debugging-port=0`; the chosen port and
//! browser endpoint path are read back from the `DevToolsActivePort` file the
//! browser writes into its profile directory. Pages are attached in flat
//! session mode so every page's Network/Runtime/Page events arrive on the one
//! browser WebSocket and are republished as [`SessionEvent`]s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::BrowserError;
use crate::host::{
    BrowserHost, BrowserSession, LaunchOptions, PageId, PageInfo, SessionEvent, TargetInfo,
};

const DEVTOOLS_ACTIVE_PORT_FILE: &str = "DevToolsActivePort";
const DEVTOOLS_POLL_INTERVAL_MS: u64 = 100;
const SESSION_EVENT_CAPACITY: usize = 1_024;
const BROWSER_CLOSE_GRACE_MS: u64 = 2_000;
const PAGE_TARGET_KIND: &str = "page";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Process and protocol settings for [`ChromiumHost`].
pub struct ChromiumHostConfig {
    pub executable: PathBuf,
    pub startup_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for ChromiumHostConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("chromium"),
            startup_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumHost {
    config: ChromiumHostConfig,
}

impl ChromiumHost {
    pub fn new(config: ChromiumHostConfig) -> Self {
        Self { config }
    }

    async fn launch_session(&self, options: LaunchOptions) -> Result<Arc<CdpBrowserSession>> {
        let port_file = options.profile_dir.join(DEVTOOLS_ACTIVE_PORT_FILE);
        match tokio::fs::remove_file(&port_file).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to clear {}", port_file.display()));
            }
        }

        let mut command = Command::new(&self.config.executable);
        command
            .args(chromium_command_args(&options))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn browser '{}'",
                self.config.executable.display()
            )
        })?;

        let endpoint =
            match wait_for_devtools_endpoint(&port_file, &mut child, self.config.startup_timeout)
                .await
            {
                Ok(endpoint) => endpoint,
                Err(error) => {
                    let _ = child.kill().await;
                    return Err(error);
                }
            };
        tracing::debug!(endpoint = %endpoint, "connecting to devtools endpoint");

        let (connection, inbound) =
            match CdpConnection::connect(&endpoint, self.config.command_timeout).await {
                Ok(connected) => connected,
                Err(error) => {
                    let _ = child.kill().await;
                    return Err(error);
                }
            };
        CdpBrowserSession::start(connection, inbound, Some(child)).await
    }
}

#[async_trait]
impl BrowserHost for ChromiumHost {
    async fn launch(&self, options: LaunchOptions) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let session = self
            .launch_session(options)
            .await
            .map_err(|error| BrowserError::Launch(format!("{error:#}")))?;
        Ok(session)
    }
}

/// Builds the browser command line for one persistent context.
pub fn chromium_command_args(options: &LaunchOptions) -> Vec<String> {
    let mut args = vec![
        format!("--user-data-dir={}", options.profile_dir.display()),
        "--remote-debugging-port=0".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    args.extend(options.args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

async fn wait_for_devtools_endpoint(
    port_file: &Path,
    child: &mut Child,
    timeout: Duration,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(port_file).await {
            if let Some(endpoint) = parse_devtools_active_port(&contents) {
                return Ok(endpoint);
            }
        }
        if let Some(status) = child
            .try_wait()
            .context("failed to poll browser process")?
        {
            bail!("browser exited before exposing a devtools endpoint: {status}");
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "browser did not expose a devtools endpoint within {}ms",
                timeout.as_millis()
            );
        }
        tokio::time::sleep(Duration::from_millis(DEVTOOLS_POLL_INTERVAL_MS)).await;
    }
}

/// Parses `DevToolsActivePort` contents (port line, then browser path line).
pub fn parse_devtools_active_port(contents: &str) -> Option<String> {
    let mut lines = contents.lines().map(str::trim).filter(|line| !line.is_empty());
    let port = lines.next()?.parse::<u16>().ok()?;
    let path = lines.next()?;
    if !path.starts_with('/') {
        return None;
    }
    Some(format!("ws://127.0.0.1:{port}{path}"))
}

#[derive(Debug, Clone, PartialEq)]
struct CdpEvent {
    method: String,
    params: Value,
    session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum CdpCallError {
    Remote(String),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
enum CdpMessage {
    Response {
        id: u64,
        result: Result<Value, CdpCallError>,
    },
    Event(CdpEvent),
}

#[derive(Debug)]
enum CdpInbound {
    Event(CdpEvent),
    Disconnected,
}

fn parse_cdp_message(raw: &str) -> Option<CdpMessage> {
    let value = serde_json::from_str::<Value>(raw).ok()?;
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let result = match value.get("error") {
            Some(error) => Err(CdpCallError::Remote(
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown protocol error")
                    .to_string(),
            )),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Some(CdpMessage::Response { id, result });
    }
    let method = value.get("method").and_then(Value::as_str)?.to_string();
    Some(CdpMessage::Event(CdpEvent {
        method,
        params: value.get("params").cloned().unwrap_or(Value::Null),
        session_id: value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string),
    }))
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CdpCallError>>>>>;

struct CdpConnection {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    pending: PendingCalls,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    command_timeout: Duration,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CdpConnection {
    async fn connect(
        endpoint: &str,
        command_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CdpInbound>)> {
        let (stream, _response) = connect_async(endpoint)
            .await
            .with_context(|| format!("failed to connect devtools websocket {endpoint}"))?;
        let (mut sink, mut source) = stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<CdpInbound>();
        let pending: PendingCalls = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let text = match message {
                        Ok(WsMessage::Text(text)) => text,
                        Ok(WsMessage::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    match parse_cdp_message(text.as_str()) {
                        Some(CdpMessage::Response { id, result }) => {
                            let waiter = lock_unpoisoned(&pending).remove(&id);
                            if let Some(waiter) = waiter {
                                let _ = waiter.send(result);
                            }
                        }
                        Some(CdpMessage::Event(event)) => {
                            let _ = inbound_tx.send(CdpInbound::Event(event));
                        }
                        None => tracing::debug!("ignoring unparsable devtools message"),
                    }
                }
                closed.store(true, Ordering::SeqCst);
                let waiters = lock_unpoisoned(&pending)
                    .drain()
                    .map(|(_, waiter)| waiter)
                    .collect::<Vec<_>>();
                for waiter in waiters {
                    let _ = waiter.send(Err(CdpCallError::Disconnected));
                }
                let _ = inbound_tx.send(CdpInbound::Disconnected);
            })
        };

        let connection = Arc::new(Self {
            outgoing: outgoing_tx,
            pending,
            next_id: AtomicU64::new(0),
            closed,
            command_timeout,
            io_tasks: Mutex::new(vec![writer, reader]),
        });
        Ok((connection, inbound_rx))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::SessionFault(format!(
                "{method}: devtools connection closed"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut frame = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            frame["sessionId"] = Value::String(session_id.to_string());
        }

        let (tx, rx) = oneshot::channel();
        lock_unpoisoned(&self.pending).insert(id, tx);
        if self.is_closed()
            || self
                .outgoing
                .send(WsMessage::Text(frame.to_string().into()))
                .is_err()
        {
            lock_unpoisoned(&self.pending).remove(&id);
            return Err(BrowserError::SessionFault(format!(
                "{method}: devtools connection closed"
            )));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(CdpCallError::Remote(message)))) => {
                Err(BrowserError::Protocol(format!("{method}: {message}")))
            }
            Ok(Ok(Err(CdpCallError::Disconnected))) | Ok(Err(_)) => Err(
                BrowserError::SessionFault(format!("{method}: devtools connection closed")),
            ),
            Err(_) => {
                lock_unpoisoned(&self.pending).remove(&id);
                Err(BrowserError::Protocol(format!(
                    "{method}: no response within {}ms",
                    self.command_timeout.as_millis()
                )))
            }
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in lock_unpoisoned(&self.io_tasks).drain(..) {
            task.abort();
        }
        let waiters = lock_unpoisoned(&self.pending)
            .drain()
            .map(|(_, waiter)| waiter)
            .collect::<Vec<_>>();
        for waiter in waiters {
            let _ = waiter.send(Err(CdpCallError::Disconnected));
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        for task in lock_unpoisoned(&self.io_tasks).drain(..) {
            task.abort();
        }
    }
}

#[derive(Default)]
struct TargetSessions {
    attach_lock: tokio::sync::Mutex<()>,
    by_target: Mutex<HashMap<String, String>>,
    by_session: Mutex<HashMap<String, String>>,
}

impl TargetSessions {
    fn page_for_session(&self, session_id: &str) -> Option<PageId> {
        lock_unpoisoned(&self.by_session).get(session_id).cloned()
    }

    fn forget_target(&self, target_id: &str) {
        if let Some(session_id) = lock_unpoisoned(&self.by_target).remove(target_id) {
            lock_unpoisoned(&self.by_session).remove(&session_id);
        }
    }

    /// Attaches to `target_id` once and enables the domains the session observes.
    async fn ensure_attached(
        &self,
        connection: &CdpConnection,
        target_id: &str,
    ) -> Result<String, BrowserError> {
        let _guard = self.attach_lock.lock().await;
        if let Some(existing) = lock_unpoisoned(&self.by_target).get(target_id).cloned() {
            return Ok(existing);
        }
        let attached = connection
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrowserError::Protocol("Target.attachToTarget returned no sessionId".to_string())
            })?
            .to_string();
        lock_unpoisoned(&self.by_target).insert(target_id.to_string(), session_id.clone());
        lock_unpoisoned(&self.by_session).insert(session_id.clone(), target_id.to_string());
        for domain in ["Runtime.enable", "Network.enable", "Page.enable"] {
            connection
                .call(domain, json!({}), Some(session_id.as_str()))
                .await?;
        }
        Ok(session_id)
    }
}

/// Live browser context backed by one devtools connection.
pub struct CdpBrowserSession {
    connection: Arc<CdpConnection>,
    events: broadcast::Sender<SessionEvent>,
    targets: Arc<TargetSessions>,
    child: tokio::sync::Mutex<Option<Child>>,
    closed: AtomicBool,
    closed_announced: Arc<AtomicBool>,
}

impl CdpBrowserSession {
    async fn start(
        connection: Arc<CdpConnection>,
        inbound: mpsc::UnboundedReceiver<CdpInbound>,
        child: Option<Child>,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let targets = Arc::new(TargetSessions::default());
        let closed_announced = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_event_pump(
            connection.clone(),
            targets.clone(),
            events.clone(),
            inbound,
            closed_announced.clone(),
        ));
        connection
            .call(
                "Target.setDiscoverTargets",
                json!({ "discover": true }),
                None,
            )
            .await
            .context("failed to enable target discovery")?;
        Ok(Arc::new(Self {
            connection,
            events,
            targets,
            child: tokio::sync::Mutex::new(child),
            closed: AtomicBool::new(false),
            closed_announced,
        }))
    }

    fn announce_closed(&self) {
        if !self.closed_announced.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Closed);
        }
    }
}

#[async_trait]
impl BrowserSession for CdpBrowserSession {
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, BrowserError> {
        let result = self
            .connection
            .call("Target.getTargets", json!({}), None)
            .await?;
        Ok(result
            .get("targetInfos")
            .and_then(Value::as_array)
            .map(|infos| infos.iter().filter_map(parse_target_info).collect())
            .unwrap_or_default())
    }

    async fn pages(&self) -> Result<Vec<PageInfo>, BrowserError> {
        Ok(self
            .list_targets()
            .await?
            .into_iter()
            .filter(|target| target.kind == PAGE_TARGET_KIND)
            .map(|target| PageInfo {
                page_id: target.target_id,
                url: target.url,
            })
            .collect())
    }

    async fn open_page(&self, url: &str) -> Result<PageId, BrowserError> {
        let created = self
            .connection
            .call("Target.createTarget", json!({ "url": url }), None)
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrowserError::Protocol("Target.createTarget returned no targetId".to_string())
            })?
            .to_string();
        self.targets
            .ensure_attached(&self.connection, &target_id)
            .await?;
        Ok(target_id)
    }

    async fn evaluate(
        &self,
        page_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<Value, BrowserError> {
        let session_id = self
            .targets
            .ensure_attached(&self.connection, page_id)
            .await?;
        let evaluated = self
            .connection
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": await_promise,
                }),
                Some(session_id.as_str()),
            )
            .await?;
        if let Some(details) = evaluated.get("exceptionDetails") {
            return Err(BrowserError::Evaluation(exception_text(details)));
        }
        Ok(evaluated
            .get("result")
            .and_then(|result| result.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn close_page(&self, page_id: &str) -> Result<(), BrowserError> {
        self.connection
            .call("Target.closeTarget", json!({ "targetId": page_id }), None)
            .await?;
        self.targets.forget_target(page_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = tokio::time::timeout(
            Duration::from_millis(BROWSER_CLOSE_GRACE_MS),
            self.connection.call("Browser.close", json!({}), None),
        )
        .await;
        self.connection.shutdown();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ =
                tokio::time::timeout(Duration::from_millis(BROWSER_CLOSE_GRACE_MS), child.wait())
                    .await;
        }
        self.announce_closed();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.is_closed()
    }
}

async fn run_event_pump(
    connection: Arc<CdpConnection>,
    targets: Arc<TargetSessions>,
    events: broadcast::Sender<SessionEvent>,
    mut inbound: mpsc::UnboundedReceiver<CdpInbound>,
    closed_announced: Arc<AtomicBool>,
) {
    let mut request_urls = HashMap::<String, String>::new();
    while let Some(message) = inbound.recv().await {
        let event = match message {
            CdpInbound::Event(event) => event,
            CdpInbound::Disconnected => break,
        };
        match event.method.as_str() {
            "Target.targetCreated" => {
                let Some(info) = event.params.get("targetInfo").and_then(parse_target_info)
                else {
                    continue;
                };
                if info.kind != PAGE_TARGET_KIND {
                    continue;
                }
                let connection = connection.clone();
                let targets = targets.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match targets.ensure_attached(&connection, &info.target_id).await {
                        Ok(_) => {
                            let _ = events.send(SessionEvent::PageOpened {
                                page_id: info.target_id,
                                url: info.url,
                            });
                        }
                        Err(error) => {
                            tracing::debug!(target_id = %info.target_id, %error, "page attach failed");
                        }
                    }
                });
            }
            "Target.targetDestroyed" => {
                if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                    targets.forget_target(target_id);
                }
            }
            _ => {
                let Some(page_id) = event
                    .session_id
                    .as_deref()
                    .and_then(|session_id| targets.page_for_session(session_id))
                else {
                    continue;
                };
                if let Some(mapped) =
                    map_page_event(&page_id, &event.method, &event.params, &mut request_urls)
                {
                    let _ = events.send(mapped);
                }
            }
        }
    }
    if !closed_announced.swap(true, Ordering::SeqCst) {
        let _ = events.send(SessionEvent::Closed);
    }
}

fn parse_target_info(value: &Value) -> Option<TargetInfo> {
    Some(TargetInfo {
        target_id: value.get("targetId")?.as_str()?.to_string(),
        kind: value.get("type")?.as_str()?.to_string(),
        url: value
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn map_page_event(
    page_id: &str,
    method: &str,
    params: &Value,
    request_urls: &mut HashMap<String, String>,
) -> Option<SessionEvent> {
    let request_id = || {
        params
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match method {
        "Network.requestWillBeSent" => {
            let request_id = request_id()?;
            if params.get("redirectResponse").is_some() {
                return None;
            }
            let url = params
                .get("request")
                .and_then(|request| request.get("url"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            request_urls.insert(request_id.clone(), url.clone());
            Some(SessionEvent::RequestStarted {
                page_id: page_id.to_string(),
                request_id,
                url,
            })
        }
        "Network.loadingFinished" => {
            let request_id = request_id()?;
            request_urls.remove(&request_id)?;
            Some(SessionEvent::RequestFinished {
                page_id: page_id.to_string(),
                request_id,
            })
        }
        "Network.loadingFailed" => {
            let request_id = request_id()?;
            let url = request_urls.remove(&request_id)?;
            Some(SessionEvent::RequestFailed {
                page_id: page_id.to_string(),
                request_id,
                url,
                error_text: params
                    .get("errorText")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string(),
            })
        }
        "Runtime.consoleAPICalled" => {
            let text = params
                .get("args")
                .and_then(Value::as_array)
                .map(|args| {
                    args.iter()
                        .map(console_argument_text)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            Some(SessionEvent::Console {
                page_id: page_id.to_string(),
                text,
            })
        }
        "Runtime.exceptionThrown" => Some(SessionEvent::PageError {
            page_id: page_id.to_string(),
            text: params
                .get("exceptionDetails")
                .map(exception_text)
                .unwrap_or_default(),
        }),
        "Page.frameNavigated" => {
            let frame = params.get("frame")?;
            if frame.get("parentId").is_some() {
                return None;
            }
            Some(SessionEvent::Navigated {
                page_id: page_id.to_string(),
                url: frame
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        _ => None,
    }
}

fn console_argument_text(argument: &Value) -> String {
    match argument.get("value") {
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
        None => argument
            .get("description")
            .or_else(|| argument.get("unserializableValue"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn exception_text(details: &Value) -> String {
    details
        .get("exception")
        .and_then(|exception| exception.get("description"))
        .and_then(Value::as_str)
        .or_else(|| details.get("text").and_then(Value::as_str))
        .unwrap_or("uncaught exception")
        .to_string()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
