//! Side-channel adapter: turns raw session events into run log entries.
//!
//! The extension's workflow engine is opaque; the only view into it is the
//! state hook installed by the trigger dispatcher, which prints
//! `[RUNNER:STATE]<json>` lines to the page console. This module is the one
//! place that format is interpreted.

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};

use exrun_core::{LogEntry, LogKind};

use crate::host::SessionEvent;

pub const STATE_FEED_PREFIX: &str = "[RUNNER:STATE]";

/// Snapshot of the extension's workflow state as published by the state hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStateUpdate {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_block_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_block: Option<Value>,
}

impl WorkflowStateUpdate {
    pub fn status_label(&self) -> &str {
        self.status.as_deref().unwrap_or("unknown")
    }
}

/// Returns `None` for ordinary console text, `Some(Err)` for a prefixed line
/// whose payload is not a valid state object.
pub fn parse_state_line(text: &str) -> Option<Result<WorkflowStateUpdate, serde_json::Error>> {
    let payload = text.trim_start().strip_prefix(STATE_FEED_PREFIX)?;
    Some(serde_json::from_str(payload.trim()))
}

/// Maps one session event to its log entry, if it has one.
pub fn session_log_entry(event: &SessionEvent) -> Option<LogEntry> {
    match event {
        SessionEvent::Console { text, .. } => Some(match parse_state_line(text) {
            Some(Ok(update)) => {
                let data = serde_json::to_value(&update).unwrap_or(Value::Null);
                LogEntry::new(LogKind::State, update.status_label()).with_data(data)
            }
            Some(Err(error)) => LogEntry::new(
                LogKind::Trace,
                format!("Malformed state feed line: {error}"),
            )
            .with_data(json!({ "line": text })),
            None => LogEntry::new(LogKind::Console, text.clone()),
        }),
        SessionEvent::Navigated { url, .. } => Some(LogEntry::new(LogKind::Navigation, url.clone())),
        SessionEvent::PageError { text, .. } => Some(LogEntry::warn(format!("Page error: {text}"))),
        SessionEvent::RequestFailed {
            url, error_text, ..
        } => Some(LogEntry::new(
            LogKind::Trace,
            format!("Request failed: {url} ({error_text})"),
        )),
        SessionEvent::PageOpened { .. }
        | SessionEvent::RequestStarted { .. }
        | SessionEvent::RequestFinished { .. }
        | SessionEvent::Closed => None,
    }
}

/// Lazy stream of log entries for every loggable session event. Ends when the
/// session closes.
pub fn session_log_entries(
    events: broadcast::Receiver<SessionEvent>,
) -> impl Stream<Item = LogEntry> + Send + 'static {
    stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return None,
                Ok(event) => {
                    if let Some(entry) = session_log_entry(&event) {
                        return Some((entry, events));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    let entry = LogEntry::new(
                        LogKind::Trace,
                        format!("Dropped {skipped} browser events"),
                    );
                    return Some((entry, events));
                }
            }
        }
    })
}
