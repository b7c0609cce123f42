//! Process entry helpers for the `exrun` binary: arguments, `.env`
//! loading, tracing setup, the startup banner and service wiring.

mod bootstrap;
mod cli_args;
mod cli_types;
pub mod env_file;

pub use bootstrap::{
    build_orchestrator_config, build_run_service, init_tracing, install_panic_hook,
    render_options_line, render_startup_banner, run_runner,
};
pub use cli_args::Cli;
pub use cli_types::{CliFinishPolicy, CliProfileMode};
