use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod channel;
mod cli;
mod commands;
mod config;
mod engine;
mod error;
mod executor;
mod inspect;
mod orchestrator;
mod plan;
mod report;
#[cfg(test)]
mod testing;
mod util;
mod wallet;

use cli::{Command, RootArgs};
use config::WalletConfig;

/// Environment variable holding a tracing filter directive.
const LOG_ENV: &str = "TDE_WALLET_LOG";

fn main() -> ExitCode {
    let args = RootArgs::parse();
    match dispatch(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(commands::EXIT_FATAL)
        }
    }
}

fn dispatch(args: RootArgs) -> Result<ExitCode> {
    let config_path = config::resolve_config_path(args.config.as_deref())?;
    match args.command {
        Command::Init(init) => {
            init_tracing(&config::default_config().log_level);
            commands::run_init(&config_path, init)
        }
        Command::Targets(targets) => commands::run_targets(&load(&config_path)?, targets),
        Command::TestConnections(check) => {
            commands::run_test_connections(load(&config_path)?, check)
        }
        Command::Status(status) => commands::run_status(load(&config_path)?, status),
        Command::Plan(plan) => commands::run_plan(load(&config_path)?, plan.request),
        Command::Run(run) => commands::run_workflow(load(&config_path)?, run),
    }
}

fn load(path: &Path) -> Result<WalletConfig> {
    let config = config::load_config(path)?;
    init_tracing(&config.log_level);
    for (engine, count) in config.targets_by_engine() {
        tracing::info!(engine = engine.as_str(), count, "configured targets");
    }
    Ok(config)
}

/// Log to stderr, filtered by `TDE_WALLET_LOG` or else the config level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
