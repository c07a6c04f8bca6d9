mod apps;
mod cli;
mod commands;
mod compose;
mod config;
mod constants;
mod context;
mod desired;
mod error;
mod exec;
mod health;
mod pipeline;
mod probe;
mod reconcile;
mod report;
mod ssh;
mod stage;
mod state;
mod sync;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use crate::cli::{Cli, LogFormat};

fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,deployctl=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_format) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }
    match commands::dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
