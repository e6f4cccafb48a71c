//! Command handlers behind the CLI.
//!
//! Each handler returns the process exit code; anything that stops a command
//! before the orchestrator produces a result is an `anyhow` error.
use crate::channel::ProcessConnector;
use crate::cli::{InitArgs, RequestArgs, RunArgs, StatusArgs, TargetsArgs, TestConnectionsArgs};
use crate::config::{self, WalletConfig};
use crate::orchestrator::{CancelToken, WorkflowOrchestrator, WorkflowRequest};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Exit code for failures outside a workflow result.
pub const EXIT_FATAL: u8 = 2;

pub fn run_init(config_path: &Path, args: InitArgs) -> Result<ExitCode> {
    config::write_config(config_path, &config::default_config(), args.force)?;
    println!("wrote {}", config_path.display());
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct TargetSummary<'a> {
    name: &'a str,
    db_type: &'static str,
    host: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a str>,
}

pub fn run_targets(config: &WalletConfig, args: TargetsArgs) -> Result<ExitCode> {
    let summaries: Vec<TargetSummary<'_>> = config
        .targets
        .iter()
        .map(|(name, profile)| TargetSummary {
            name,
            db_type: profile.db_type.as_str(),
            host: &profile.host,
            port: profile.port,
            service: profile.service.as_deref(),
        })
        .collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(ExitCode::SUCCESS);
    }
    for summary in &summaries {
        println!(
            "{}\t{}\t{}:{}\t{}",
            summary.name,
            summary.db_type,
            summary.host,
            summary.port,
            summary.service.unwrap_or("-")
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct ConnectionCheck {
    target: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run_test_connections(config: WalletConfig, args: TestConnectionsArgs) -> Result<ExitCode> {
    let names: Vec<String> = config.targets.keys().cloned().collect();
    let orchestrator = orchestrator(config);
    let checks: Vec<ConnectionCheck> = names
        .into_iter()
        .map(|name| match orchestrator.test_connection(&name) {
            Ok(state) => ConnectionCheck {
                target: name,
                ok: true,
                state: Some(state.as_str().to_string()),
                error: None,
            },
            Err(err) => ConnectionCheck {
                target: name,
                ok: false,
                state: None,
                error: Some(format!("{}: {err}", err.kind())),
            },
        })
        .collect();
    orchestrator.shutdown();

    let failed = checks.iter().filter(|check| !check.ok).count();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&checks)?);
    } else {
        for check in &checks {
            match (&check.state, &check.error) {
                (Some(state), _) => println!("{}: ok ({state})", check.target),
                (None, Some(error)) => println!("{}: failed ({error})", check.target),
                (None, None) => println!("{}: failed", check.target),
            }
        }
        println!(
            "{} reachable, {} failed, {} total",
            checks.len() - failed,
            failed,
            checks.len()
        );
    }
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FATAL)
    })
}

pub fn run_status(config: WalletConfig, args: StatusArgs) -> Result<ExitCode> {
    let orchestrator = orchestrator(config);
    let status = orchestrator.status(&args.target, args.keys);
    orchestrator.shutdown();
    let status = status.map_err(|err| anyhow!("{}: {err}", err.kind()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(ExitCode::SUCCESS)
}

pub fn run_plan(config: WalletConfig, args: RequestArgs) -> Result<ExitCode> {
    let request = build_request(args)?;
    let orchestrator = orchestrator(config);
    let plan = orchestrator.plan(&request);
    orchestrator.shutdown();
    let plan = plan.map_err(|err| anyhow!("{}: {err}", err.kind()))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(ExitCode::SUCCESS)
}

pub fn run_workflow(config: WalletConfig, args: RunArgs) -> Result<ExitCode> {
    let request = build_request(args.request)?;
    let orchestrator = orchestrator(config);
    let result = match args.max_duration {
        Some(secs) => {
            orchestrator.run_with_cancel(&request, &cancel_after(Duration::from_secs(secs)))
        }
        None => orchestrator.run(&request),
    };
    orchestrator.shutdown();
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(ExitCode::from(result.status.exit_code()))
}

/// Token that cancels itself once `limit` has passed.
fn cancel_after(limit: Duration) -> CancelToken {
    let token = CancelToken::default();
    let timer = token.clone();
    thread::spawn(move || {
        thread::sleep(limit);
        timer.cancel();
    });
    token
}

fn orchestrator(config: WalletConfig) -> WorkflowOrchestrator {
    let connector = ProcessConnector::new(config.failure_codes.clone());
    WorkflowOrchestrator::new(config, Arc::new(connector))
}

fn build_request(args: RequestArgs) -> Result<WorkflowRequest> {
    if let Some(path) = &args.request {
        let bytes = fs::read(path).with_context(|| format!("read request {}", path.display()))?;
        return serde_json::from_slice(&bytes)
            .with_context(|| format!("parse request JSON {}", path.display()));
    }
    let target = args
        .target
        .ok_or_else(|| anyhow!("--target is required without --request"))?;
    let operation = args
        .operation
        .ok_or_else(|| anyhow!("--operation is required without --request"))?;
    Ok(WorkflowRequest {
        target,
        operation,
        parameters: crate::cli::parse_params(&args.params)?,
        force: args.force,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Operation;
    use std::io::Write;

    fn flags(params: &[&str]) -> RequestArgs {
        RequestArgs {
            target: Some("primary".to_string()),
            operation: Some(Operation::Update),
            params: params.iter().map(|p| p.to_string()).collect(),
            force: false,
            request: None,
        }
    }

    #[test]
    fn request_from_flags() {
        let request = build_request(flags(&["new_secret_ref=env:NEXT"])).expect("request");
        assert_eq!(request.target, "primary");
        assert_eq!(request.parameters["new_secret_ref"], "env:NEXT");
    }

    #[test]
    fn time_limit_cancels_the_token() {
        let token = cancel_after(Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !token.is_cancelled() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(token.is_cancelled());
        assert!(!cancel_after(Duration::from_secs(60)).is_cancelled());
    }

    #[test]
    fn request_from_file_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("temp");
        write!(file, r#"{{"target":"primary","operation":"remove","force":true}}"#)
            .expect("write");
        let mut args = flags(&[]);
        args.request = Some(file.path().to_path_buf());
        let request = build_request(args).expect("request");
        assert_eq!(request.operation, Operation::Remove);
        assert!(request.force);

        let mut bad = tempfile::NamedTempFile::new().expect("temp");
        write!(bad, r#"{{"target":"primary","operation":"remove","dry":true}}"#).expect("write");
        let mut args = flags(&[]);
        args.request = Some(bad.path().to_path_buf());
        assert!(build_request(args).is_err());
    }
}
