//! Network-quiescence detection across every page of a session.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};

use exrun_core::CooperativeCancellationToken;

use crate::host::{BrowserSession, SessionEvent};

pub const ACTIVITY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How a wait for idle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// No request in flight and no activity for the idle threshold.
    Idle,
    /// The max wait elapsed before the session went quiet.
    TimedOut,
    /// The session closed or the run was cancelled.
    Interrupted,
}

impl IdleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::TimedOut => "timed_out",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug)]
struct ActivityTracker {
    in_flight: usize,
    last_activity: Instant,
}

impl ActivityTracker {
    fn new(now: Instant) -> Self {
        Self {
            in_flight: 0,
            last_activity: now,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn observe(&mut self, event: &SessionEvent, now: Instant) {
        match event {
            SessionEvent::RequestStarted { .. } => {
                self.in_flight = self.in_flight.saturating_add(1);
            }
            SessionEvent::RequestFinished { .. } | SessionEvent::RequestFailed { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            SessionEvent::PageOpened { .. }
            | SessionEvent::Console { .. }
            | SessionEvent::PageError { .. }
            | SessionEvent::Navigated { .. } => {}
            SessionEvent::Closed => return,
        }
        self.touch(now);
    }

    fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        self.in_flight == 0 && now.saturating_duration_since(self.last_activity) >= threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityMonitor {
    poll_interval: Duration,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self {
            poll_interval: ACTIVITY_POLL_INTERVAL,
        }
    }
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Waits until the session has been quiet for `idle_threshold`, bounded by
    /// `max_wait`. Never fails; the outcome says why the wait ended.
    pub async fn wait_for_idle(
        &self,
        session: &dyn BrowserSession,
        idle_threshold: Duration,
        max_wait: Duration,
        cancel: &CooperativeCancellationToken,
    ) -> IdleOutcome {
        let mut events = session.subscribe();
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut tracker = ActivityTracker::new(started);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break IdleOutcome::Interrupted,
                received = events.recv() => match received {
                    Ok(SessionEvent::Closed) | Err(RecvError::Closed) => {
                        break IdleOutcome::Interrupted;
                    }
                    Ok(event) => tracker.observe(&event, Instant::now()),
                    Err(RecvError::Lagged(_)) => tracker.touch(Instant::now()),
                },
                _ = poll.tick() => {
                    let now = Instant::now();
                    if session.is_closed() {
                        break IdleOutcome::Interrupted;
                    }
                    if tracker.is_idle(now, idle_threshold) {
                        break IdleOutcome::Idle;
                    }
                    if now >= deadline {
                        break IdleOutcome::TimedOut;
                    }
                }
            }
        };
        tracing::debug!(
            outcome = outcome.as_str(),
            in_flight = tracker.in_flight,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "activity wait finished"
        );
        outcome
    }
}
