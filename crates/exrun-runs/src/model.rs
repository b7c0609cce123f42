use serde::{Deserialize, Serialize};

use exrun_core::LogEntry;

/// Enumerates the lifecycle states of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Record exists; the run task has not started.
    Queued,
    /// Browser stages or the finish policy are in progress.
    Running,
    /// A stop was requested and the session is being torn down.
    Stopping,
    Succeeded,
    Failed,
    Stopped,
}

impl RunStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true when the run cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Stopping)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Stopped)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumerates list filters accepted by the run query APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatusFilter {
    Exact(RunStatus),
    /// Matches `queued`, `running` and `stopping`.
    Active,
    /// Matches any terminal run.
    Terminal,
}

impl RunStatusFilter {
    /// Parses a filter token such as `running`, `active` or `terminal`.
    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "stopping" => RunStatus::Stopping,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            "stopped" => RunStatus::Stopped,
            "active" => return Some(Self::Active),
            "terminal" => return Some(Self::Terminal),
            _ => return None,
        };
        Some(Self::Exact(status))
    }

    pub fn matches(self, status: RunStatus) -> bool {
        match self {
            Self::Exact(expected) => status == expected,
            Self::Active => !status.is_terminal(),
            Self::Terminal => status.is_terminal(),
        }
    }
}

/// Rule deciding when a run's session is considered complete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishPolicy {
    /// Finish right after the workflow was dispatched.
    Triggered,
    /// Finish once the session's network has been quiet for the idle window.
    Idle,
    /// Keep the session open for the full run timeout.
    #[default]
    Timeout,
}

impl FinishPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "triggered" => Some(Self::Triggered),
            "idle" => Some(Self::Idle),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Idle => "idle",
            Self::Timeout => "timeout",
        }
    }
}

/// Whether concurrent runs share one browser profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum IsolationMode {
    #[default]
    #[serde(rename = "shared")]
    Shared,
    #[serde(rename = "per-run")]
    PerRun,
}

impl IsolationMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "per-run" | "per_run" => Some(Self::PerRun),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::PerRun => "per-run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub status: RunStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub workflow_name: String,
}

/// Summary plus the full log, as returned by `get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub log: Vec<LogEntry>,
}
