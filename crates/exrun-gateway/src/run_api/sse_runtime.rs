//! Server-sent event loops for run logs and the run list.
//!
//! Each loop owns an unbounded sender feeding the SSE body and returns as
//! soon as the client goes away or its source is exhausted.

use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use exrun_core::LogEntry;
use exrun_runs::{RunService, RunStatusFilter, RunSubscription};

fn ping_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Serializes `payload` into a `data:` frame; false once the client is gone.
fn send_json<T: Serialize>(sender: &mpsc::UnboundedSender<Event>, payload: &T) -> bool {
    match serde_json::to_string(payload) {
        Ok(data) => sender.send(Event::default().data(data)).is_ok(),
        Err(error) => {
            tracing::warn!(%error, "failed to serialize sse payload");
            !sender.is_closed()
        }
    }
}

/// Streams backlog then live entries, interleaving pings, until the
/// terminal marker has been delivered.
pub(super) async fn run_log_stream_loop(
    mut subscription: RunSubscription,
    sender: mpsc::UnboundedSender<Event>,
    ping_interval: Duration,
) {
    let mut ping = ping_timer(ping_interval);
    loop {
        tokio::select! {
            entry = subscription.next() => match entry {
                Some(entry) => {
                    if !send_json(&sender, &entry) {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if !send_json(&sender, &LogEntry::ping()) {
                    break;
                }
            }
            _ = sender.closed() => break,
        }
    }
    tracing::debug!(run_id = subscription.run_id(), "run log stream closed");
}

/// Sends an `{items}` snapshot now and after every run-list change.
pub(super) async fn run_list_stream_loop(
    service: Arc<RunService>,
    filter: Option<RunStatusFilter>,
    sender: mpsc::UnboundedSender<Event>,
    ping_interval: Duration,
) {
    let mut revisions = service.watch_runs();
    let mut ping = ping_timer(ping_interval);
    loop {
        if !send_json(&sender, &json!({ "items": service.list(filter) })) {
            return;
        }
        loop {
            tokio::select! {
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                _ = ping.tick() => {
                    if !send_json(&sender, &LogEntry::ping()) {
                        return;
                    }
                }
                _ = sender.closed() => return,
            }
        }
    }
}
