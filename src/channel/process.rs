//! Channel that pipes scripts into a database client process.
//!
//! Each probe or command starts a fresh client (by default `sqlplus`), writes
//! the session preamble, the script and the epilogue on stdin, and collects
//! stdout/stderr until the client exits or the call deadline passes.
use super::secrets;
use super::{AdminChannel, AdminScript, Connector};
use crate::config::TargetProfile;
use crate::engine::{Dialect, FailureCodes};
use crate::error::WalletError;
use crate::util::elapsed_ms;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Builds [`ProcessChannel`]s from target profiles.
pub struct ProcessConnector {
    failure_codes: Option<FailureCodes>,
}

impl ProcessConnector {
    /// `failure_codes` overrides the engine defaults when present.
    pub fn new(failure_codes: Option<FailureCodes>) -> Self {
        Self { failure_codes }
    }
}

impl Connector for ProcessConnector {
    fn connect(
        &self,
        target: &str,
        profile: &TargetProfile,
    ) -> Result<Arc<dyn AdminChannel>, WalletError> {
        let dialect = profile.db_type.dialect()?;
        let client = profile
            .client
            .as_deref()
            .unwrap_or_else(|| dialect.default_client());
        let argv = shell_words::split(client).map_err(|err| WalletError::Configuration {
            reason: format!("target {target}: parse client command {client:?}: {err}"),
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(WalletError::Configuration {
                reason: format!("target {target}: client command is empty"),
            });
        };
        let program = which::which(program).map_err(|err| WalletError::Connection {
            reason: format!("client {program} not found: {err}"),
        })?;
        Ok(Arc::new(ProcessChannel {
            target: target.to_string(),
            program,
            args: args.to_vec(),
            dialect,
            preamble: dialect.session_preamble(profile),
            failure_codes: self
                .failure_codes
                .clone()
                .unwrap_or_else(|| dialect.default_failure_codes()),
        }))
    }
}

/// One target's client invocation.
pub struct ProcessChannel {
    target: String,
    program: PathBuf,
    args: Vec<String>,
    dialect: Dialect,
    preamble: String,
    failure_codes: FailureCodes,
}

struct ClientOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl ProcessChannel {
    fn run(&self, script: &AdminScript, timeout: Duration) -> Result<String, WalletError> {
        let session = format!(
            "{}\n{}\n{}\n",
            self.preamble,
            script.text,
            self.dialect.session_epilogue()
        );
        let expanded = secrets::expand(&session)?;
        let start = Instant::now();
        let output = self.spawn_and_wait(&expanded.text, timeout)?;
        let stdout = secrets::redact(&output.stdout, &expanded.secrets);
        tracing::debug!(
            target_name = self.target.as_str(),
            purpose = ?script.purpose,
            elapsed_ms = elapsed_ms(start.elapsed()),
            success = output.success,
            "client call complete"
        );
        if output.success {
            return Ok(stdout);
        }
        let stderr = secrets::redact(&output.stderr, &expanded.secrets);
        Err(self.failure_codes.classify(&format!("{stdout}\n{stderr}")))
    }

    fn spawn_and_wait(&self, input: &str, timeout: Duration) -> Result<ClientOutput, WalletError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| WalletError::Connection {
                reason: format!("spawn client {}: {err}", self.program.display()),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // Detached: a client that never reads its input must not hold up the
        // deadline, and one that exits early closes the pipe on the writer.
        feed(child.stdin.take(), input.as_bytes().to_vec());

        let status = match wait_with_deadline(&mut child, timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WalletError::TransientDatabase {
                    reason: format!("client call timed out after {}ms", timeout.as_millis()),
                });
            }
        };
        Ok(ClientOutput {
            success: status.success(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

impl AdminChannel for ProcessChannel {
    fn inspect(&self, probe: &AdminScript, timeout: Duration) -> Result<String, WalletError> {
        self.run(probe, timeout)
    }

    fn execute(&self, command: &AdminScript, timeout: Duration) -> Result<String, WalletError> {
        self.run(command, timeout)
    }
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> Result<Option<std::process::ExitStatus>, WalletError> {
    let start = Instant::now();
    loop {
        let polled = child.try_wait().map_err(|err| WalletError::Connection {
            reason: format!("check client status: {err}"),
        })?;
        if let Some(status) = polled {
            return Ok(Some(status));
        }
        if start.elapsed() > timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn feed<W: Write + Send + 'static>(pipe: Option<W>, input: Vec<u8>) {
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let _ = pipe.write_all(&input);
        });
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
