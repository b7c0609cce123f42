use clap::ValueEnum;

use exrun_runs::{FinishPolicy, IsolationMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliProfileMode {
    Shared,
    #[value(name = "per-run")]
    PerRun,
}

impl From<CliProfileMode> for IsolationMode {
    fn from(value: CliProfileMode) -> Self {
        match value {
            CliProfileMode::Shared => IsolationMode::Shared,
            CliProfileMode::PerRun => IsolationMode::PerRun,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliFinishPolicy {
    Triggered,
    Idle,
    Timeout,
}

impl From<CliFinishPolicy> for FinishPolicy {
    fn from(value: CliFinishPolicy) -> Self {
        match value {
            CliFinishPolicy::Triggered => FinishPolicy::Triggered,
            CliFinishPolicy::Idle => FinishPolicy::Idle,
            CliFinishPolicy::Timeout => FinishPolicy::Timeout,
        }
    }
}
