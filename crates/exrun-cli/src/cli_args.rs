use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::{CliFinishPolicy, CliProfileMode};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "exrun",
    about = "Local run orchestrator for browser-extension workflows",
    version
)]
pub struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0", help = "Listen address")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3100, help = "Listen port")]
    pub port: u16,

    #[arg(
        long = "runner-root",
        env = "RUNNER_ROOT",
        default_value = ".",
        help = "Runner root holding .env files, workflows and browser profiles"
    )]
    pub runner_root: PathBuf,

    #[arg(
        long = "workflows-dir",
        env = "WORKFLOWS_DIR",
        help = "Workflow definition directory (defaults to <runner-root>/workflows)"
    )]
    pub workflows_dir: Option<PathBuf>,

    #[arg(
        long = "build-dir",
        env = "BUILD_DIR",
        help = "Built extension directory (defaults to <runner-root>/../build)"
    )]
    pub build_dir: Option<PathBuf>,

    #[arg(
        long = "open-bridge",
        env = "OPEN_BRIDGE",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        help = "Open the local bridge page as a regular tab in every run"
    )]
    pub open_bridge: bool,

    #[arg(
        long,
        env = "HEADLESS",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        help = "Run Chromium headless"
    )]
    pub headless: bool,

    #[arg(
        long = "profile-mode",
        env = "PROFILE_MODE",
        value_enum,
        default_value_t = CliProfileMode::Shared,
        help = "Browser profile isolation: shared (one run at a time) or per-run"
    )]
    pub profile_mode: CliProfileMode,

    #[arg(
        long = "persist-run-profile",
        env = "PERSIST_RUN_PROFILE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        help = "Keep per-run profile directories after the run ends"
    )]
    pub persist_run_profile: bool,

    #[arg(
        long = "finish-policy",
        env = "FINISH_POLICY",
        value_enum,
        default_value_t = CliFinishPolicy::Timeout,
        help = "Default finish policy for runs that do not set one"
    )]
    pub finish_policy: CliFinishPolicy,

    #[arg(
        long = "idle-ms",
        env = "IDLE_MS",
        default_value_t = 3_000,
        value_parser = parse_positive_u64,
        help = "Default network-idle threshold in milliseconds"
    )]
    pub idle_ms: u64,

    #[arg(
        long = "run-timeout-ms",
        env = "RUN_TIMEOUT_MS",
        default_value_t = 120_000,
        value_parser = parse_positive_u64,
        help = "Default run timeout in milliseconds"
    )]
    pub run_timeout_ms: u64,

    #[arg(
        long = "no-sandbox",
        env = "NO_SANDBOX",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        help = "Pass --no-sandbox to Chromium (needed when running as root in containers)"
    )]
    pub no_sandbox: bool,

    #[arg(
        long = "chromium-path",
        env = "CHROMIUM_PATH",
        default_value = "chromium",
        help = "Chromium executable"
    )]
    pub chromium_path: PathBuf,
}

impl Cli {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn resolved_workflows_dir(&self) -> PathBuf {
        self.workflows_dir
            .clone()
            .unwrap_or_else(|| self.runner_root.join("workflows"))
    }

    pub fn resolved_build_dir(&self) -> PathBuf {
        self.build_dir
            .clone()
            .unwrap_or_else(|| self.runner_root.join("..").join("build"))
    }
}
