//! One-shot workflow dispatch through the extension's execute page.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use exrun_core::{current_unix_timestamp_ms, LogEntry, LogSink};

use crate::error::BrowserError;
use crate::host::{BrowserSession, PageId};
use crate::state_feed::STATE_FEED_PREFIX;

pub const EXECUTE_PAGE: &str = "execute.html";
pub const EXECUTE_MESSAGE_NAME: &str = "background--workflow:execute";
pub const DOCUMENT_READY_PROBE: &str = "document.readyState";
pub const RUNTIME_READY_PROBE: &str =
    "!!(globalThis.chrome && globalThis.chrome.runtime && globalThis.chrome.runtime.id)";
pub const TRIGGERED_MESSAGE: &str = "Triggered workflow via extension page";
const SYNTHETIC_ID_PREFIX: &str = "runner-";

const TRIGGER_SCRIPT_TEMPLATE: &str = r#"(() => {
  const payload = __PAYLOAD__;
  const observe = __OBSERVE__;
  const prefix = __PREFIX__;
  const wf = payload.wf;
  const message = {
    name: __MESSAGE__,
    data: Object.assign({}, wf, { options: { checkParams: false, data: { variables: payload.vars } } }),
  };
  const emit = (states) => {
    if (!states) return;
    const list = Array.isArray(states) ? states : Object.values(states);
    const item = list.find((entry) => entry && entry.workflowId === wf.id);
    if (!item) return;
    const state = item.state || {};
    const blocks = Array.isArray(state.currentBlock) ? state.currentBlock : [];
    console.log(prefix + JSON.stringify({
      status: state.status || '',
      currentBlockIds: blocks.map((block) => block && block.id).filter((id) => id != null).map(String),
      currentBlock: blocks[0] || null,
    }));
  };
  try {
    const chromeApi = globalThis.chrome;
    if (chromeApi && chromeApi.runtime && chromeApi.runtime.sendMessage) {
      chromeApi.runtime.sendMessage(message, () => void chromeApi.runtime.lastError);
      if (observe && chromeApi.storage && chromeApi.storage.local) {
        chromeApi.storage.local.get('workflowStates', (items) => emit(items && items.workflowStates));
        chromeApi.storage.local.onChanged.addListener((changes) => {
          if (changes && changes.workflowStates) emit(changes.workflowStates.newValue);
        });
      }
      return true;
    }
    const browserApi = globalThis.browser;
    if (browserApi && browserApi.runtime && browserApi.runtime.sendMessage) {
      Promise.resolve(browserApi.runtime.sendMessage(message)).catch(() => {});
      if (observe && browserApi.storage && browserApi.storage.local) {
        browserApi.storage.local.get('workflowStates')
          .then((items) => emit(items && items.workflowStates))
          .catch(() => {});
        browserApi.storage.local.onChanged.addListener((changes) => {
          if (changes && changes.workflowStates) emit(changes.workflowStates.newValue);
        });
      }
      return true;
    }
    return false;
  } catch (error) {
    return { error: String(error && error.message ? error.message : error) };
  }
})()"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOptions {
    pub page_load_timeout: Duration,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub observe_state: bool,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            observe_state: true,
        }
    }
}

/// What the extension page reported back for the execute message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Dispatched,
    MessagingUnavailable,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerReport {
    pub page_id: PageId,
    pub workflow_id: String,
    pub outcome: TriggerOutcome,
}

/// Returns the workflow id to observe and the `{wf, vars}` payload for the
/// trigger script. A synthetic `runner-<ms>` id is assigned when absent.
pub fn prepare_workflow(
    workflow: &Value,
    variables: &Value,
    now_ms: u64,
) -> Result<(String, Value), BrowserError> {
    let Some(definition) = workflow.as_object() else {
        return Err(BrowserError::Dispatch(
            "workflow definition must be a JSON object".to_string(),
        ));
    };
    let mut definition = definition.clone();
    let workflow_id = match definition.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            let id = format!("{SYNTHETIC_ID_PREFIX}{now_ms}");
            definition.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    };
    let variables = if variables.is_null() {
        json!({})
    } else {
        variables.clone()
    };
    Ok((
        workflow_id,
        json!({ "wf": Value::Object(definition), "vars": variables }),
    ))
}

pub fn build_trigger_script(payload: &Value, observe_state: bool) -> String {
    TRIGGER_SCRIPT_TEMPLATE
        .replace("__PAYLOAD__", &payload.to_string())
        .replace("__OBSERVE__", if observe_state { "true" } else { "false" })
        .replace("__PREFIX__", &Value::from(STATE_FEED_PREFIX).to_string())
        .replace("__MESSAGE__", &Value::from(EXECUTE_MESSAGE_NAME).to_string())
}

pub fn classify_trigger_result(result: &Value) -> TriggerOutcome {
    match result {
        Value::Bool(true) => TriggerOutcome::Dispatched,
        Value::Object(fields) => TriggerOutcome::Rejected(
            fields
                .get("error")
                .map(|error| match error {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| Value::Object(fields.clone()).to_string()),
        ),
        _ => TriggerOutcome::MessagingUnavailable,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerDispatcher {
    options: TriggerOptions,
}

impl TriggerDispatcher {
    pub fn new(options: TriggerOptions) -> Self {
        Self { options }
    }

    /// Opens the execute page and sends exactly one execute message.
    ///
    /// Page-load and readiness problems are logged as warnings; only a lost
    /// session is returned as a fatal error. Evaluation failures surface as
    /// [`BrowserError::Dispatch`].
    pub async fn trigger(
        &self,
        session: &dyn BrowserSession,
        extension_id: &str,
        workflow: &Value,
        variables: &Value,
        sink: &dyn LogSink,
    ) -> Result<TriggerReport, BrowserError> {
        let (workflow_id, payload) =
            prepare_workflow(workflow, variables, current_unix_timestamp_ms())?;
        let url = format!("chrome-extension://{extension_id}/{EXECUTE_PAGE}");
        let page_id = session.open_page(&url).await.map_err(into_dispatch_error)?;

        if !self
            .poll_until(session, &page_id, DOCUMENT_READY_PROBE, self.options.page_load_timeout, |value| {
                matches!(value.as_str(), Some("interactive" | "complete"))
            })
            .await?
        {
            sink.emit(LogEntry::warn(format!(
                "Extension page load warning: {url} not ready after {}ms",
                self.options.page_load_timeout.as_millis()
            )));
        }
        if !self
            .poll_until(session, &page_id, RUNTIME_READY_PROBE, self.options.readiness_timeout, |value| {
                value.as_bool() == Some(true)
            })
            .await?
        {
            sink.emit(LogEntry::warn(format!(
                "Extension messaging API not ready after {}ms",
                self.options.readiness_timeout.as_millis()
            )));
        }

        let script = build_trigger_script(&payload, self.options.observe_state);
        let result = session
            .evaluate(&page_id, &script, false)
            .await
            .map_err(into_dispatch_error)?;
        let outcome = classify_trigger_result(&result);
        match &outcome {
            TriggerOutcome::Dispatched => sink.emit(LogEntry::info(TRIGGERED_MESSAGE)),
            TriggerOutcome::MessagingUnavailable => sink.emit(LogEntry::error(
                "Trigger error: no compatible extension messaging API",
            )),
            TriggerOutcome::Rejected(message) => {
                sink.emit(LogEntry::error(format!("Trigger error: {message}")))
            }
        }
        tracing::debug!(workflow_id = %workflow_id, outcome = ?outcome, "workflow trigger evaluated");
        Ok(TriggerReport {
            page_id,
            workflow_id,
            outcome,
        })
    }

    /// Polls `probe` until `accept` holds or `timeout` elapses. Evaluation
    /// errors while the page is still loading count as "not yet".
    async fn poll_until(
        &self,
        session: &dyn BrowserSession,
        page_id: &str,
        probe: &str,
        timeout: Duration,
        accept: impl Fn(&Value) -> bool,
    ) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            match session.evaluate(page_id, probe, false).await {
                Ok(value) if accept(&value) => return Ok(true),
                Ok(_) | Err(BrowserError::Evaluation(_)) | Err(BrowserError::Protocol(_)) => {}
                Err(error) => return Err(error),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }
}

fn into_dispatch_error(error: BrowserError) -> BrowserError {
    match error {
        BrowserError::SessionFault(_) | BrowserError::Dispatch(_) => error,
        other => BrowserError::Dispatch(other.to_string()),
    }
}
