//! CLI argument parsing for keystore workflows.
//!
//! The CLI stays thin: it loads config, builds a request and hands it to the
//! orchestrator. Lifecycle policy lives in the library modules.
use crate::plan::Operation;
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root CLI entrypoint for keystore lifecycle workflows.
#[derive(Parser, Debug)]
#[command(
    name = "tdew",
    version,
    about = "Keystore lifecycle orchestrator for database TDE",
    after_help = "Commands:\n  init --config <file>                 Write a config stub\n  targets                              List configured targets\n  test-connections                     Inspect every target once\n  status --target <name>               Show the observed keystore state\n  plan --target <name> --operation <op>  Dry run: inspect and print the plan\n  run --target <name> --operation <op>   Run a workflow and print its result\n\nExit codes: 0 success, 3 partial failure, 2 fatal.\n\nExamples:\n  tdew init --config ./tdew.json\n  tdew status --target primary --keys\n  tdew run --target primary --operation setup\n  tdew run --target primary --operation update --param new_secret_ref=env:NEXT_PW --param rotation_tag=2026q4\n  tdew run --request ./remove.json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Config file (defaults to $TDE_WALLET_CONFIG, then the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Targets(TargetsArgs),
    TestConnections(TestConnectionsArgs),
    Status(StatusArgs),
    Plan(PlanArgs),
    Run(RunArgs),
}

/// Init command inputs.
#[derive(Parser, Debug)]
#[command(about = "Write a config stub with one example target")]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List configured targets")]
pub struct TargetsArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Connect to every target and classify its keystore once")]
pub struct TestConnectionsArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Show a target's observed keystore state")]
pub struct StatusArgs {
    /// Target name from the config
    #[arg(long, value_name = "NAME")]
    pub target: String,

    /// Also list master keys
    #[arg(long)]
    pub keys: bool,
}

/// Request inputs shared by `plan` and `run`.
#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Target name from the config
    #[arg(long, value_name = "NAME", required_unless_present = "request")]
    pub target: Option<String>,

    /// Lifecycle operation (setup, create, setup_hsm, update, update_secret, remove)
    #[arg(long, value_name = "OP", required_unless_present = "request")]
    pub operation: Option<Operation>,

    /// Operation parameter, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Allow `remove` from a failed or unclassified keystore
    #[arg(long)]
    pub force: bool,

    /// JSON request file instead of the flags above
    #[arg(long, value_name = "FILE", conflicts_with_all = ["target", "operation", "params", "force"])]
    pub request: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Inspect a target and print the plan without executing it")]
pub struct PlanArgs {
    #[command(flatten)]
    pub request: RequestArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Run a lifecycle workflow and print its JSON result")]
pub struct RunArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Stop before the next step once this many seconds have passed
    #[arg(long, value_name = "SECS")]
    pub max_duration: Option<u64>,
}

/// Parse repeated `--param key=value` flags; later keys win.
pub fn parse_params(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--param expects KEY=VALUE, got {pair:?}"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("--param has an empty key: {pair:?}"));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}
