//! Workflow results.
//!
//! The reporter always inspects the target one more time instead of trusting
//! the last step, so `after_state` is what the target says, not what the plan
//! hoped for.
use crate::channel::AdminChannel;
use crate::error::{ErrorKind, WalletError};
use crate::executor::{RetryPolicy, StepOutcome, StepStatus};
use crate::inspect::WalletStateInspector;
use crate::plan::Operation;
use crate::util::now_epoch_ms;
use crate::wallet::{check_key_invariant, KeystoreDescriptor, KeystoreKind, MasterKeyEntry, WalletState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Success,
    PartialFailure,
    Fatal,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Success => "success",
            WorkflowStatus::PartialFailure => "partial_failure",
            WorkflowStatus::Fatal => "fatal",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkflowStatus::Success => 0,
            WorkflowStatus::Fatal => 2,
            WorkflowStatus::PartialFailure => 3,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&WalletError> for ErrorInfo {
    fn from(err: &WalletError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowResult {
    pub target: String,
    pub operation: Operation,
    pub status: WorkflowStatus,
    pub before_state: Option<WalletState>,
    pub after_state: Option<WalletState>,
    pub steps: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<KeystoreDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_keys: Option<Vec<MasterKeyEntry>>,
    pub started_at_epoch_ms: u128,
    pub finished_at_epoch_ms: u128,
}

/// Everything the orchestrator learned while running a plan.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub operation: Operation,
    pub params: BTreeMap<String, String>,
    pub before_state: Option<WalletState>,
    /// Goal of the built plan; `None` when no plan was built.
    pub goal: Option<WalletState>,
    pub steps: Vec<StepOutcome>,
    /// Failure that stopped the workflow before its first step.
    pub rejection: Option<WalletError>,
    pub started_at_epoch_ms: u128,
}

pub struct ReconciliationReporter<'a> {
    inspector: &'a WalletStateInspector,
    retry: RetryPolicy,
}

impl<'a> ReconciliationReporter<'a> {
    pub fn new(inspector: &'a WalletStateInspector, retry: RetryPolicy) -> Self {
        Self { inspector, retry }
    }

    /// Re-inspect the target and turn `outcome` into a result.
    pub fn summarize(
        &self,
        target: &str,
        channel: &dyn AdminChannel,
        outcome: PlanOutcome,
    ) -> WorkflowResult {
        let (after, _) = self
            .retry
            .run("final inspect", || self.inspector.inspect(channel));
        let after_state = after.as_ref().ok().copied();
        if let Err(err) = &after {
            tracing::warn!(target_name = target, error = %err, "final inspection failed");
        }

        let keys_open = matches!(
            after_state,
            Some(WalletState::AutoLoginLocal | WalletState::AutoLoginHsm)
        );
        let listed = keys_open.then(|| self.inspector.inspect_keys(channel));
        let mut key_problem = None;
        if outcome.operation.checks_master_keys() && keys_open {
            key_problem = match &listed {
                Some(Ok(keys)) => check_key_invariant(keys, false).err(),
                Some(Err(err)) => Some(format!("master keys could not be listed: {err}")),
                None => None,
            };
        }
        let master_keys = listed.and_then(Result::ok);

        let mut result = fold(target, outcome, after_state, key_problem);
        result.master_keys = master_keys;
        if result.error.is_none() {
            if let Err(err) = &after {
                if result.status != WorkflowStatus::Success {
                    result.error = Some(ErrorInfo::from(err));
                }
            }
        }
        result.remediation_hint = remediation(&result);
        result
    }

    /// Result for a request that failed before any channel was available.
    pub fn rejected(target: &str, outcome: PlanOutcome) -> WorkflowResult {
        let mut result = fold(target, outcome, None, None);
        result.remediation_hint = remediation(&result);
        result
    }
}

fn fold(
    target: &str,
    outcome: PlanOutcome,
    after_state: Option<WalletState>,
    key_problem: Option<String>,
) -> WorkflowResult {
    let failed_step = outcome.steps.iter().find(|step| !step.outcome.is_ok());
    let any_success = outcome
        .steps
        .iter()
        .any(|step| step.outcome == StepStatus::Success);
    let all_ok = outcome.steps.iter().all(|step| step.outcome.is_ok());
    let mismatch = matches!(
        outcome.rejection,
        Some(WalletError::PreconditionMismatch { .. })
    ) || failed_step.is_some_and(|step| step.outcome == StepStatus::PreconditionMismatch);
    let reached_goal = outcome.goal.is_some() && after_state == outcome.goal;

    let status = if outcome
        .rejection
        .as_ref()
        .is_some_and(|err| err.kind() != ErrorKind::PreconditionMismatch)
    {
        WorkflowStatus::Fatal
    } else if mismatch {
        WorkflowStatus::PartialFailure
    } else if all_ok && reached_goal && key_problem.is_none() {
        WorkflowStatus::Success
    } else if any_success {
        WorkflowStatus::PartialFailure
    } else {
        WorkflowStatus::Fatal
    };

    let mut error = outcome
        .rejection
        .as_ref()
        .or_else(|| failed_step.and_then(|step| step.error.as_ref()))
        .map(ErrorInfo::from);
    if error.is_none() && status != WorkflowStatus::Success {
        error = Some(match (&key_problem, after_state) {
            (Some(problem), _) => ErrorInfo {
                kind: ErrorKind::VerificationFailed,
                message: problem.clone(),
            },
            (None, after) => ErrorInfo {
                kind: ErrorKind::VerificationFailed,
                message: format!(
                    "target ended in {} instead of {}",
                    after.map_or("an unclassified state", |state| state.as_str()),
                    outcome.goal.map_or("the goal state", |state| state.as_str())
                ),
            },
        });
    }

    WorkflowResult {
        target: target.to_string(),
        operation: outcome.operation,
        status,
        before_state: outcome.before_state,
        after_state,
        keystore: after_state.and_then(|state| {
            descriptor(
                target,
                outcome.operation,
                state,
                &outcome.params,
                status == WorkflowStatus::Success,
            )
        }),
        steps: outcome.steps,
        remediation_hint: None,
        error,
        master_keys: None,
        started_at_epoch_ms: outcome.started_at_epoch_ms,
        finished_at_epoch_ms: now_epoch_ms(),
    }
}

/// Describe the keystore the target owns in `state`, if any.
fn descriptor(
    target: &str,
    operation: Operation,
    state: WalletState,
    params: &BTreeMap<String, String>,
    succeeded: bool,
) -> Option<KeystoreDescriptor> {
    let kind = match state {
        WalletState::Absent | WalletState::Error => return None,
        WalletState::AutoLoginHsm | WalletState::PartiallyMigrated => KeystoreKind::Hsm,
        WalletState::Closed | WalletState::OpenNoAutoLogin | WalletState::AutoLoginLocal => {
            KeystoreKind::Local
        }
    };
    let credential_key = match (kind, operation, succeeded) {
        (KeystoreKind::Local, Operation::Update, true) => "new_secret_ref",
        (KeystoreKind::Hsm, Operation::UpdateSecret, true) => "new_secret_ref",
        (KeystoreKind::Local, _, _) => "password_ref",
        (KeystoreKind::Hsm, _, _) => "hsm_secret_ref",
    };
    Some(KeystoreDescriptor {
        target: target.to_string(),
        kind,
        location: params.get("keystore_location").cloned(),
        credential_ref: params.get(credential_key).cloned(),
    })
}

fn remediation(result: &WorkflowResult) -> Option<String> {
    if result.status == WorkflowStatus::Success {
        return None;
    }
    let hint = result
        .error
        .as_ref()
        .map_or("inspect the target with `tdew status` and rerun the operation", |error| {
            error.kind.remediation_hint()
        });
    Some(hint.to_string())
}
