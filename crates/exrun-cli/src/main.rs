use anyhow::{Context, Result};
use clap::Parser;

use exrun_cli::env_file::parse_cli_with_env_files;
use exrun_cli::{init_tracing, install_panic_hook, run_runner, Cli};

fn main() -> Result<()> {
    let (cli, applied) = parse_cli_with_env_files(Cli::parse)?;
    init_tracing();
    install_panic_hook();
    if !applied.is_empty() {
        tracing::debug!(keys = ?applied, "loaded runner env files");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run_runner(cli))
}
