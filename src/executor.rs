//! Single-step execution.
//!
//! A step is never trusted to have worked: the executor inspects the target
//! before dispatching, skips work whose effect is already observed, and
//! re-inspects afterwards to confirm the expected post-state.
use crate::channel::AdminChannel;
use crate::config::RetryConfig;
use crate::engine::Dialect;
use crate::error::{ErrorKind, WalletError};
use crate::inspect::WalletStateInspector;
use crate::plan::{CommandName, WorkflowStep};
use crate::util::{elapsed_ms, now_epoch_ms, truncate_string};
use crate::wallet::WalletState;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

const MAX_DETAIL_BYTES: usize = 2_000;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    PreconditionMismatch,
    Failed,
    VerificationFailed,
    Cancelled,
}

impl StepStatus {
    /// Whether the plan may continue past this step.
    pub fn is_ok(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Skipped => "skipped",
            StepStatus::PreconditionMismatch => "precondition_mismatch",
            StepStatus::Failed => "failed",
            StepStatus::VerificationFailed => "verification_failed",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub ordinal: usize,
    pub command_name: CommandName,
    pub outcome: StepStatus,
    pub detail: String,
    /// Dispatch attempts; zero when no command was sent.
    pub attempts: u32,
    pub started_at_epoch_ms: u128,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_state: Option<WalletState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip)]
    pub error: Option<WalletError>,
}

impl StepOutcome {
    fn new(step: &WorkflowStep, started_at_epoch_ms: u128) -> Self {
        Self {
            ordinal: step.ordinal,
            command_name: step.command.name,
            outcome: StepStatus::Success,
            detail: String::new(),
            attempts: 0,
            started_at_epoch_ms,
            elapsed_ms: 0,
            observed_state: None,
            error_kind: None,
            error: None,
        }
    }

    /// Record a step the workflow never started because it was cancelled.
    pub fn cancelled(step: &WorkflowStep) -> Self {
        let error = WalletError::Cancelled {
            command: step.command.name.to_string(),
        };
        let mut outcome = Self::new(step, now_epoch_ms());
        outcome.outcome = StepStatus::Cancelled;
        outcome.detail = error.to_string();
        outcome.error_kind = Some(error.kind());
        outcome.error = Some(error);
        outcome
    }

    fn fail(mut self, status: StepStatus, error: WalletError) -> Self {
        self.outcome = status;
        self.detail = truncate_string(&error.to_string(), MAX_DETAIL_BYTES);
        self.error_kind = Some(error.kind());
        self.error = Some(error);
        self
    }
}

/// Bounded exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based), capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        let initial_ms = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
    }

    /// Call `op` until it succeeds, fails for a non-retryable reason, or the
    /// attempt ceiling is reached. Returns the last result and the attempt count.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, WalletError>,
    ) -> (Result<T, WalletError>, u32) {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff_for_attempt(attempt);
                    tracing::warn!(
                        label,
                        attempt,
                        delay_ms = elapsed_ms(delay),
                        error = %err,
                        "retrying after transient failure"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                result => return (result, attempt),
            }
        }
    }
}

/// Runs one [`WorkflowStep`] against one channel.
pub struct StepExecutor<'a> {
    dialect: Dialect,
    inspector: &'a WalletStateInspector,
    retry: RetryPolicy,
    step_timeout: Duration,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        dialect: Dialect,
        inspector: &'a WalletStateInspector,
        retry: RetryPolicy,
        step_timeout: Duration,
    ) -> Self {
        Self {
            dialect,
            inspector,
            retry,
            step_timeout,
        }
    }

    /// Inspect with retry. Under `force` an unclassifiable target counts as `Error`.
    pub fn observe(&self, channel: &dyn AdminChannel, force: bool) -> Result<WalletState, WalletError> {
        let (observed, _) = self
            .retry
            .run("inspect", || self.inspector.inspect(channel));
        match observed {
            Err(WalletError::UnknownState { status }) if force => {
                tracing::warn!(status = status.as_str(), "treating unclassified keystore as error");
                Ok(WalletState::Error)
            }
            other => other,
        }
    }

    pub fn execute(
        &self,
        channel: &dyn AdminChannel,
        step: &WorkflowStep,
        force: bool,
    ) -> StepOutcome {
        let start = Instant::now();
        let mut outcome = self.run_step(channel, step, force, StepOutcome::new(step, now_epoch_ms()));
        outcome.elapsed_ms = elapsed_ms(start.elapsed());
        tracing::info!(
            ordinal = step.ordinal,
            command = step.command.name.as_str(),
            outcome = outcome.outcome.as_str(),
            attempts = outcome.attempts,
            elapsed_ms = outcome.elapsed_ms,
            "step finished"
        );
        outcome
    }

    fn run_step(
        &self,
        channel: &dyn AdminChannel,
        step: &WorkflowStep,
        force: bool,
        mut outcome: StepOutcome,
    ) -> StepOutcome {
        let observed = match self.observe(channel, force) {
            Ok(state) => state,
            Err(err) => return outcome.fail(StepStatus::Failed, err),
        };
        outcome.observed_state = Some(observed);

        if step.idempotent && step.settled_states.contains(&observed) {
            outcome.outcome = StepStatus::Skipped;
            outcome.detail = format!("target already {observed}; no command sent");
            return outcome;
        }
        if observed != step.expected_pre && !force {
            return outcome.fail(
                StepStatus::PreconditionMismatch,
                WalletError::PreconditionMismatch {
                    expected: vec![step.expected_pre],
                    observed,
                },
            );
        }

        let script = match self.dialect.render(&step.command) {
            Ok(script) => script,
            Err(err) => return outcome.fail(StepStatus::Failed, err),
        };
        let (dispatched, attempts) = self.retry.run(step.command.name.as_str(), || {
            channel.execute(&script, self.step_timeout)
        });
        outcome.attempts = attempts;
        if let Err(err) = dispatched {
            return outcome.fail(StepStatus::Failed, err);
        }

        let verified = self.observe(channel, false);
        outcome.observed_state = verified.as_ref().ok().copied();
        match verified {
            Ok(state) if state == step.expected_post => {
                outcome.detail = format!("{observed} -> {state}");
                outcome
            }
            Ok(state) => outcome.fail(
                StepStatus::VerificationFailed,
                WalletError::VerificationFailed {
                    command: step.command.name.to_string(),
                    expected: step.expected_post,
                    observed: Some(state),
                },
            ),
            Err(err) => {
                tracing::warn!(error = %err, "post-step inspection failed");
                outcome.fail(
                    StepStatus::VerificationFailed,
                    WalletError::VerificationFailed {
                        command: step.command.name.to_string(),
                        expected: step.expected_post,
                        observed: None,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3_000),
            multiplier: 2,
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(3_000));
        assert_eq!(policy.backoff_for_attempt(40), Duration::from_millis(3_000));
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2,
        }
    }

    #[test]
    fn transient_failures_are_retried_up_to_the_ceiling() {
        let mut calls = 0;
        let (result, attempts) = quick(3).run("test", || -> Result<(), WalletError> {
            calls += 1;
            Err(WalletError::TransientDatabase {
                reason: "ORA-00054".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn credential_failures_are_not_retried() {
        let mut calls = 0;
        let (result, attempts) = quick(3).run("test", || -> Result<(), WalletError> {
            calls += 1;
            Err(WalletError::Credential {
                reason: "ORA-01017".to_string(),
            })
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::CredentialError);
        assert_eq!((attempts, calls), (1, 1));
    }

    #[test]
    fn recovery_stops_retrying() {
        let mut calls = 0;
        let (result, attempts) = quick(5).run("test", || {
            calls += 1;
            if calls < 2 {
                Err(WalletError::Connection {
                    reason: "ORA-12541".to_string(),
                })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn outcome_json_uses_stable_names() {
        let outcome = StepOutcome {
            ordinal: 1,
            command_name: CommandName::OpenHsm,
            outcome: StepStatus::VerificationFailed,
            detail: "x".to_string(),
            attempts: 1,
            started_at_epoch_ms: 1,
            elapsed_ms: 2,
            observed_state: Some(WalletState::Closed),
            error_kind: Some(ErrorKind::VerificationFailed),
            error: None,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["command_name"], "OpenHSM");
        assert_eq!(value["outcome"], "verification_failed");
        assert_eq!(value["observed_state"], "closed");
        assert_eq!(value["error_kind"], "verification_failed");
        assert!(value.get("error").is_none());
    }
}
