//! In-memory run registry with per-run log fanout.
//!
//! All mutation goes through a std mutex that is never held across an await,
//! so appending an entry and delivering it to subscribers is atomic with
//! respect to `subscribe`: a new subscriber sees every entry exactly once,
//! either in its backlog or on its live channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use exrun_core::{now_rfc3339, LogEntry, LogKind, LogSink};

use crate::model::{RunSnapshot, RunStatus, RunStatusFilter, RunSummary};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("run '{0}' not found")]
    NotFound(String),
    #[error("run '{0}' already exists")]
    Duplicate(String),
    #[error("run '{run_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
}

#[derive(Debug)]
struct RunRecord {
    summary: RunSummary,
    sequence: u64,
    log: Vec<LogEntry>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<LogEntry>)>,
}

impl RunRecord {
    /// Appends and fans out; subscribers whose receiver is gone are dropped.
    fn push(&mut self, entry: LogEntry) {
        self.subscribers
            .retain(|(_, sender)| sender.send(entry.clone()).is_ok());
        self.log.push(entry);
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    runs: HashMap<String, RunRecord>,
    next_sequence: u64,
    next_subscriber: u64,
}

#[derive(Debug)]
pub struct RunStore {
    inner: Mutex<StoreInner>,
    revision: watch::Sender<u64>,
}

impl Default for RunStore {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(StoreInner::default()),
            revision,
        }
    }
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        lock_unpoisoned(&self.inner)
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    pub fn create(&self, run_id: &str, workflow_name: &str) -> Result<RunSummary, StoreError> {
        let summary = {
            let mut inner = self.lock();
            if inner.runs.contains_key(run_id) {
                return Err(StoreError::Duplicate(run_id.to_string()));
            }
            inner.next_sequence += 1;
            let summary = RunSummary {
                id: run_id.to_string(),
                status: RunStatus::Queued,
                created_at: now_rfc3339(),
                ended_at: None,
                error: None,
                workflow_name: workflow_name.to_string(),
            };
            let record = RunRecord {
                summary: summary.clone(),
                sequence: inner.next_sequence,
                log: Vec::new(),
                subscribers: Vec::new(),
            };
            inner.runs.insert(run_id.to_string(), record);
            summary
        };
        self.bump_revision();
        Ok(summary)
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.lock().runs.contains_key(run_id)
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.lock().runs.get(run_id).map(|record| record.summary.status)
    }

    pub fn summary(&self, run_id: &str) -> Option<RunSummary> {
        self.lock()
            .runs
            .get(run_id)
            .map(|record| record.summary.clone())
    }

    pub fn get(&self, run_id: &str) -> Option<RunSnapshot> {
        self.lock().runs.get(run_id).map(|record| RunSnapshot {
            summary: record.summary.clone(),
            log: record.log.clone(),
        })
    }

    /// Returns summaries newest first.
    pub fn list(&self, filter: Option<RunStatusFilter>) -> Vec<RunSummary> {
        let inner = self.lock();
        let mut records = inner
            .runs
            .values()
            .filter(|record| filter.map_or(true, |filter| filter.matches(record.summary.status)))
            .collect::<Vec<_>>();
        records.sort_by(|left, right| right.sequence.cmp(&left.sequence));
        records
            .into_iter()
            .map(|record| record.summary.clone())
            .collect()
    }

    /// The single append entry point for run logs. Returns false, dropping the
    /// entry, for unknown runs and for runs past their terminal marker.
    pub fn append(&self, run_id: &str, entry: LogEntry) -> bool {
        {
            let mut inner = self.lock();
            let Some(record) = inner.runs.get_mut(run_id) else {
                return false;
            };
            if record.summary.status.is_terminal() {
                return false;
            }
            record.push(entry.clone());
        }
        echo_entry(run_id, &entry);
        true
    }

    /// Moves a run to the non-terminal status `next` and returns the previous
    /// status. Terminal statuses are only recorded through [`Self::finish`].
    pub fn transition(&self, run_id: &str, next: RunStatus) -> Result<RunStatus, StoreError> {
        let previous = {
            let mut inner = self.lock();
            let record = inner
                .runs
                .get_mut(run_id)
                .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
            let previous = record.summary.status;
            if next.is_terminal() || !previous.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: previous,
                    to: next,
                });
            }
            record.summary.status = next;
            previous
        };
        tracing::debug!(run_id, from = previous.as_str(), to = next.as_str(), "run status changed");
        self.bump_revision();
        Ok(previous)
    }

    /// Moves a run from `expected` to `next` and appends `entry`, under one
    /// lock. Fails without logging when the run is no longer in `expected`.
    pub fn transition_with_entry(
        &self,
        run_id: &str,
        expected: RunStatus,
        next: RunStatus,
        entry: LogEntry,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let record = inner
                .runs
                .get_mut(run_id)
                .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
            let previous = record.summary.status;
            if previous != expected || next.is_terminal() || !previous.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: previous,
                    to: next,
                });
            }
            record.summary.status = next;
            record.push(entry.clone());
        }
        echo_entry(run_id, &entry);
        tracing::debug!(run_id, from = expected.as_str(), to = next.as_str(), "run status changed");
        self.bump_revision();
        Ok(())
    }

    /// Records a terminal status, appends the final markers and ends every
    /// live subscription, all under one lock.
    pub fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
        markers: Vec<LogEntry>,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let record = inner
                .runs
                .get_mut(run_id)
                .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
            let previous = record.summary.status;
            if !status.is_terminal() || !previous.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: previous,
                    to: status,
                });
            }
            record.summary.status = status;
            record.summary.ended_at = Some(now_rfc3339());
            record.summary.error = error;
            for marker in &markers {
                record.push(marker.clone());
            }
            record.subscribers.clear();
        }
        for marker in &markers {
            echo_entry(run_id, marker);
        }
        tracing::debug!(run_id, status = status.as_str(), "run finished");
        self.bump_revision();
        Ok(())
    }

    /// Subscribes to a run's log: the full backlog first, then the live tail.
    /// Subscriptions to terminal runs replay the backlog and end.
    pub fn subscribe(self: &Arc<Self>, run_id: &str) -> Result<RunSubscription, StoreError> {
        let mut inner = self.lock();
        inner.next_subscriber += 1;
        let subscriber_id = inner.next_subscriber;
        let record = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let backlog = record.log.iter().cloned().collect::<VecDeque<_>>();
        let receiver = if record.summary.status.is_terminal() {
            None
        } else {
            let (sender, receiver) = mpsc::unbounded_channel();
            record.subscribers.push((subscriber_id, sender));
            Some(receiver)
        };
        Ok(RunSubscription {
            run_id: run_id.to_string(),
            subscriber_id,
            backlog,
            receiver,
            store: Arc::downgrade(self),
        })
    }

    fn unsubscribe(&self, run_id: &str, subscriber_id: u64) {
        if let Some(record) = self.lock().runs.get_mut(run_id) {
            record.subscribers.retain(|(id, _)| *id != subscriber_id);
        }
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.lock()
            .runs
            .get(run_id)
            .map_or(0, |record| record.subscribers.len())
    }

    /// Revision counter bumped on every create and status change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn sink(self: &Arc<Self>, run_id: &str) -> RunLogSink {
        RunLogSink {
            store: Arc::clone(self),
            run_id: run_id.to_string(),
        }
    }
}

/// Live view of one run's log. Unsubscribes on drop.
#[derive(Debug)]
pub struct RunSubscription {
    run_id: String,
    subscriber_id: u64,
    backlog: VecDeque<LogEntry>,
    receiver: Option<mpsc::UnboundedReceiver<LogEntry>>,
    store: Weak<RunStore>,
}

impl RunSubscription {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next entry in append order; `None` once the run has finished.
    pub async fn next(&mut self) -> Option<LogEntry> {
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry);
        }
        self.receiver.as_mut()?.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = LogEntry> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            let entry = subscription.next().await?;
            Some((entry, subscription))
        })
    }
}

impl Drop for RunSubscription {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            if let Some(store) = self.store.upgrade() {
                store.unsubscribe(&self.run_id, self.subscriber_id);
            }
        }
    }
}

/// [`LogSink`] bound to one run of a store.
#[derive(Debug, Clone)]
pub struct RunLogSink {
    store: Arc<RunStore>,
    run_id: String,
}

impl LogSink for RunLogSink {
    fn emit(&self, entry: LogEntry) {
        self.store.append(&self.run_id, entry);
    }
}

fn echo_entry(run_id: &str, entry: &LogEntry) {
    let kind = entry.kind.as_str();
    match entry.kind {
        LogKind::Ping => {}
        LogKind::Error => tracing::error!(run_id, kind, "{}", entry.text),
        LogKind::Warn => tracing::warn!(run_id, kind, "{}", entry.text),
        LogKind::Trace | LogKind::Console => tracing::debug!(run_id, kind, "{}", entry.text),
        _ => tracing::info!(run_id, kind, "{}", entry.text),
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;

    use exrun_core::{LogEntry, LogKind, LogSink};

    use super::{RunStore, StoreError};
    use crate::model::{RunStatus, RunStatusFilter};

    #[test]
    fn unit_list_is_newest_first_and_filters_by_status() {
        let store = RunStore::new();
        store.create("a", "first").expect("create a");
        store.create("b", "second").expect("create b");
        store.create("c", "third").expect("create c");
        store.transition("b", RunStatus::Running).expect("running");
        let ids = store
            .list(None)
            .into_iter()
            .map(|summary| summary.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "b", "a"]);
        let running = store.list(RunStatusFilter::parse("running"));
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "b");
        assert_eq!(
            store.create("a", "dup"),
            Err(StoreError::Duplicate("a".to_string()))
        );
    }

    #[test]
    fn unit_terminal_status_is_closed_to_further_changes() {
        let store = RunStore::new();
        store.create("r", "wf").expect("create");
        store.transition("r", RunStatus::Running).expect("running");
        store
            .finish("r", RunStatus::Succeeded, None, vec![LogEntry::new(LogKind::End, "Run finished")])
            .expect("finish");
        assert!(matches!(
            store.transition("r", RunStatus::Running),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(store
            .finish("r", RunStatus::Failed, Some("late".to_string()), Vec::new())
            .is_err());
        let snapshot = store.get("r").expect("snapshot");
        assert_eq!(snapshot.summary.status, RunStatus::Succeeded);
        assert!(snapshot.summary.ended_at.is_some());
        assert!(snapshot.summary.error.is_none());
    }

    #[tokio::test]
    async fn functional_subscription_replays_backlog_then_tails_without_gaps() {
        let store = Arc::new(RunStore::new());
        store.create("r", "wf").expect("create");
        store.transition("r", RunStatus::Running).expect("running");
        let sink = store.sink("r");
        for index in 0..3 {
            sink.emit(LogEntry::info(format!("early-{index}")));
        }
        let mut subscription = store.subscribe("r").expect("subscribe");
        for index in 0..3 {
            sink.emit(LogEntry::info(format!("late-{index}")));
        }
        store
            .finish("r", RunStatus::Succeeded, None, vec![LogEntry::new(LogKind::End, "Run finished")])
            .expect("finish");

        let mut texts = Vec::new();
        while let Some(entry) = subscription.next().await {
            texts.push(entry.text);
        }
        assert_eq!(
            texts,
            vec!["early-0", "early-1", "early-2", "late-0", "late-1", "late-2", "Run finished"]
        );
    }

    #[tokio::test]
    async fn functional_concurrent_appends_reach_every_subscriber_exactly_once() {
        let store = Arc::new(RunStore::new());
        store.create("r", "wf").expect("create");
        store.transition("r", RunStatus::Running).expect("running");
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for index in 0..200 {
                    store.append("r", LogEntry::info(index.to_string()));
                    if index % 17 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        let mut subscriptions = Vec::new();
        for _ in 0..5 {
            subscriptions.push(store.subscribe("r").expect("subscribe"));
            tokio::task::yield_now().await;
        }
        writer.await.expect("writer");
        store
            .finish("r", RunStatus::Succeeded, None, vec![LogEntry::new(LogKind::End, "done")])
            .expect("finish");

        let expected = (0..200)
            .map(|index| index.to_string())
            .chain(std::iter::once("done".to_string()))
            .collect::<Vec<_>>();
        for subscription in subscriptions {
            let texts = subscription
                .into_stream()
                .map(|entry| entry.text)
                .collect::<Vec<_>>()
                .await;
            assert_eq!(texts, expected);
        }
    }

    #[tokio::test]
    async fn regression_dropped_subscriber_is_removed_without_affecting_others() {
        let store = Arc::new(RunStore::new());
        store.create("r", "wf").expect("create");
        let mut kept = store.subscribe("r").expect("kept");
        let dropped = store.subscribe("r").expect("dropped");
        assert_eq!(store.subscriber_count("r"), 2);
        drop(dropped);
        assert_eq!(store.subscriber_count("r"), 1);
        store.append("r", LogEntry::warn("still delivered"));
        assert!(matches!(
            store.transition("r", RunStatus::Failed),
            Err(StoreError::InvalidTransition { .. })
        ));
        store
            .finish("r", RunStatus::Failed, Some("boom".to_string()), vec![LogEntry::error("boom")])
            .expect("finish");
        assert_eq!(store.subscriber_count("r"), 0);
        assert_eq!(kept.next().await.map(|entry| entry.text).as_deref(), Some("still delivered"));
        assert_eq!(kept.next().await.map(|entry| entry.text).as_deref(), Some("boom"));
        assert!(kept.next().await.is_none());
    }

    #[tokio::test]
    async fn unit_subscribe_to_terminal_run_replays_and_ends() {
        let store = Arc::new(RunStore::new());
        store.create("r", "wf").expect("create");
        store.append("r", LogEntry::info("one"));
        store
            .finish("r", RunStatus::Failed, Some("boom".to_string()), vec![LogEntry::error("boom")])
            .expect("finish from queued");
        let texts = store
            .subscribe("r")
            .expect("subscribe")
            .into_stream()
            .map(|entry| entry.text)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(texts, vec!["one", "boom"]);
        assert!(matches!(store.subscribe("missing"), Err(StoreError::NotFound(_))));
        assert!(!store.append("missing", LogEntry::info("dropped")));
    }

    #[tokio::test]
    async fn regression_entries_after_terminal_marker_are_dropped() {
        let store = Arc::new(RunStore::new());
        store.create("r", "wf").expect("create");
        store.transition("r", RunStatus::Running).expect("running");
        let early = store.subscribe("r").expect("early subscribe");
        store
            .finish("r", RunStatus::Succeeded, None, vec![LogEntry::new(LogKind::End, "Run finished")])
            .expect("finish");
        assert!(!store.append("r", LogEntry::warn("late warning")));
        let late = store.subscribe("r").expect("late subscribe");

        let early = early.into_stream().map(|entry| entry.text).collect::<Vec<_>>().await;
        let late = late.into_stream().map(|entry| entry.text).collect::<Vec<_>>().await;
        assert_eq!(early, vec!["Run finished"]);
        assert_eq!(late, early);
    }

    #[tokio::test]
    async fn unit_transition_with_entry_requires_expected_status() {
        let store = Arc::new(RunStore::new());
        store.create("r", "wf").expect("create");
        assert!(matches!(
            store.transition_with_entry("r", RunStatus::Running, RunStatus::Stopping, LogEntry::warn("stop")),
            Err(StoreError::InvalidTransition { from: RunStatus::Queued, .. })
        ));
        store.transition("r", RunStatus::Running).expect("running");
        let mut subscription = store.subscribe("r").expect("subscribe");
        store
            .transition_with_entry("r", RunStatus::Running, RunStatus::Stopping, LogEntry::warn("stop"))
            .expect("stopping");
        assert_eq!(store.status("r"), Some(RunStatus::Stopping));
        assert_eq!(subscription.next().await.map(|entry| entry.text).as_deref(), Some("stop"));

        store
            .finish("r", RunStatus::Stopped, None, vec![LogEntry::new(LogKind::End, "Run stopped")])
            .expect("finish");
        assert!(matches!(
            store.transition_with_entry("r", RunStatus::Running, RunStatus::Stopping, LogEntry::warn("again")),
            Err(StoreError::InvalidTransition { from: RunStatus::Stopped, .. })
        ));
        assert_eq!(
            store.get("r").expect("snapshot").log.iter().map(|entry| entry.text.as_str()).collect::<Vec<_>>(),
            vec!["stop", "Run stopped"]
        );
        assert!(matches!(
            store.transition_with_entry("missing", RunStatus::Running, RunStatus::Stopping, LogEntry::warn("x")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn functional_watch_revision_moves_on_create_and_status_change() {
        let store = RunStore::new();
        let mut revisions = store.watch();
        let initial = *revisions.borrow_and_update();
        store.create("r", "wf").expect("create");
        revisions.changed().await.expect("changed");
        let after_create = *revisions.borrow_and_update();
        assert!(after_create > initial);
        store.append("r", LogEntry::info("no revision for log lines"));
        assert!(!revisions.has_changed().expect("sender alive"));
        store.transition("r", RunStatus::Running).expect("running");
        assert!(revisions.has_changed().expect("sender alive"));
    }
}
