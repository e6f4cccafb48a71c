//! Operation planning.
//!
//! [`build`] turns a requested operation and the freshly observed keystore
//! state into an ordered, chain-checked list of steps. Planning is pure: it
//! never touches a target, so `tdew plan` and `tdew run` share it verbatim.
//!
//! Plans always carry the operation's full canonical route. Steps whose
//! effect is already observed are skipped at execution time rather than
//! dropped here, so a plan reads the same whether it starts fresh or resumes.
use crate::channel::is_reference;
use crate::error::WalletError;
use crate::wallet::{KeystoreKind, WalletState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Request parameters understood by at least one operation.
pub const KNOWN_PARAMS: [&str; 5] = [
    "keystore_location",
    "password_ref",
    "hsm_secret_ref",
    "new_secret_ref",
    "rotation_tag",
];

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Setup,
    Create,
    SetupHsm,
    Update,
    UpdateSecret,
    Remove,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Setup,
        Operation::Create,
        Operation::SetupHsm,
        Operation::Update,
        Operation::UpdateSecret,
        Operation::Remove,
    ];

    /// Return the stable string identifier used in requests and results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Setup => "setup",
            Operation::Create => "create",
            Operation::SetupHsm => "setup_hsm",
            Operation::Update => "update",
            Operation::UpdateSecret => "update_secret",
            Operation::Remove => "remove",
        }
    }

    /// Rotation operations keep the keystore in place and replace its secret and key.
    pub fn is_rotation(&self) -> bool {
        matches!(self, Operation::Update | Operation::UpdateSecret)
    }

    /// Operations whose success also requires a clean master key listing.
    pub fn checks_master_keys(&self) -> bool {
        matches!(
            self,
            Operation::Update | Operation::UpdateSecret | Operation::SetupHsm
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|operation| operation.as_str() == value)
            .ok_or_else(|| {
                let names: Vec<&str> = Operation::ALL.iter().map(Operation::as_str).collect();
                format!("unknown operation {value:?} (expected one of {})", names.join(", "))
            })
    }
}

/// The fixed catalog of lifecycle commands.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    CreateKeystore,
    SetMasterKey,
    OpenKeystore,
    OpenForAutoLogin,
    CloseLocal,
    #[serde(rename = "ConfigureHSM")]
    ConfigureHsm,
    #[serde(rename = "OpenHSM")]
    OpenHsm,
    MigrateMasterKey,
    VerifyActiveKey,
    RotateKeystorePassword,
    RotateHsmSecret,
    ActivateNewKey,
    RetireOldKey,
    RemoveKeystore,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::CreateKeystore => "CreateKeystore",
            CommandName::SetMasterKey => "SetMasterKey",
            CommandName::OpenKeystore => "OpenKeystore",
            CommandName::OpenForAutoLogin => "OpenForAutoLogin",
            CommandName::CloseLocal => "CloseLocal",
            CommandName::ConfigureHsm => "ConfigureHSM",
            CommandName::OpenHsm => "OpenHSM",
            CommandName::MigrateMasterKey => "MigrateMasterKey",
            CommandName::VerifyActiveKey => "VerifyActiveKey",
            CommandName::RotateKeystorePassword => "RotateKeystorePassword",
            CommandName::RotateHsmSecret => "RotateHsmSecret",
            CommandName::ActivateNewKey => "ActivateNewKey",
            CommandName::RetireOldKey => "RetireOldKey",
            CommandName::RemoveKeystore => "RemoveKeystore",
        }
    }

    /// Whether re-running the command once its effect is observed is a no-op.
    ///
    /// Rotation commands change the target without changing its state, so
    /// their effect cannot be observed and they are never skipped.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            CommandName::VerifyActiveKey
                | CommandName::RotateKeystorePassword
                | CommandName::RotateHsmSecret
                | CommandName::ActivateNewKey
                | CommandName::RetireOldKey
        )
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog command plus the arguments its dialect rendering needs.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    pub name: CommandName,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStep {
    /// 1-based position in the plan.
    pub ordinal: usize,
    pub command: StepCommand,
    pub expected_pre: WalletState,
    pub expected_post: WalletState,
    pub idempotent: bool,
    /// Observed states in which this step's work is already done.
    pub settled_states: Vec<WalletState>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OperationPlan {
    pub operation: Operation,
    pub observed: WalletState,
    pub goal: WalletState,
    pub force: bool,
    pub steps: Vec<WorkflowStep>,
}

impl OperationPlan {
    /// Check the pre/post chain, every edge, and the plan's anchor.
    pub fn validate(&self) -> Result<(), String> {
        for pair in self.steps.windows(2) {
            if pair[0].expected_post != pair[1].expected_pre {
                return Err(format!(
                    "step {} ends in {} but step {} starts from {}",
                    pair[0].ordinal, pair[0].expected_post, pair[1].ordinal, pair[1].expected_pre
                ));
            }
        }
        for step in &self.steps {
            if !step.expected_pre.can_transition_to(step.expected_post) {
                return Err(format!(
                    "step {} {} moves {} -> {}, which is not a legal transition",
                    step.ordinal, step.command.name, step.expected_pre, step.expected_post
                ));
            }
        }
        if let Some(last) = self.steps.last() {
            if last.expected_post != self.goal {
                return Err(format!(
                    "plan ends in {} but the goal is {}",
                    last.expected_post, self.goal
                ));
            }
        }
        // The observed state must be a step's starting point, or already past
        // every step before that point.
        let anchored = self.steps.is_empty()
            || self.steps.iter().enumerate().any(|(index, step)| {
                self.steps[..index]
                    .iter()
                    .all(|earlier| earlier.settled_states.contains(&self.observed))
                    && (step.expected_pre == self.observed
                        || step.settled_states.contains(&self.observed))
            });
        if !anchored {
            return Err(format!(
                "observed state {} is not on the {} route",
                self.observed, self.operation
            ));
        }
        Ok(())
    }
}

/// One route entry before arguments and ordinals are attached.
struct RouteStep {
    name: CommandName,
    pre: WalletState,
    post: WalletState,
    args: &'static [&'static str],
}

const fn route_step(
    name: CommandName,
    pre: WalletState,
    post: WalletState,
    args: &'static [&'static str],
) -> RouteStep {
    RouteStep {
        name,
        pre,
        post,
        args,
    }
}

/// States a rotation may start from.
const ROTATION_STATES: [WalletState; 2] = [WalletState::AutoLoginLocal, WalletState::AutoLoginHsm];

fn route(operation: Operation, observed: WalletState) -> Vec<RouteStep> {
    use CommandName::*;
    use WalletState::*;
    match operation {
        Operation::Setup => vec![
            route_step(CreateKeystore, Absent, Closed, &["keystore_location", "password_ref"]),
            route_step(SetMasterKey, Closed, OpenNoAutoLogin, &["password_ref"]),
            route_step(
                OpenForAutoLogin,
                OpenNoAutoLogin,
                AutoLoginLocal,
                &["keystore_location", "password_ref"],
            ),
        ],
        Operation::Create => vec![
            route_step(OpenKeystore, Closed, OpenNoAutoLogin, &["password_ref"]),
            route_step(
                OpenForAutoLogin,
                OpenNoAutoLogin,
                AutoLoginLocal,
                &["keystore_location", "password_ref"],
            ),
        ],
        Operation::SetupHsm => vec![
            route_step(CloseLocal, AutoLoginLocal, Closed, &[]),
            route_step(ConfigureHsm, Closed, Closed, &[]),
            route_step(OpenHsm, Closed, PartiallyMigrated, &["hsm_secret_ref"]),
            route_step(
                MigrateMasterKey,
                PartiallyMigrated,
                AutoLoginHsm,
                &["hsm_secret_ref", "password_ref", "keystore_location"],
            ),
        ],
        Operation::Update | Operation::UpdateSecret => {
            let rotate = if operation == Operation::Update {
                route_step(
                    RotateKeystorePassword,
                    observed,
                    observed,
                    &["new_secret_ref", "password_ref", "rotation_tag", "keystore_location"],
                )
            } else {
                route_step(
                    RotateHsmSecret,
                    observed,
                    observed,
                    &["new_secret_ref", "rotation_tag", "keystore_location"],
                )
            };
            vec![
                route_step(VerifyActiveKey, observed, observed, &[]),
                rotate,
                route_step(
                    ActivateNewKey,
                    observed,
                    observed,
                    &["rotation_tag", "activation_secret_ref", "keystore_kind"],
                ),
                route_step(
                    RetireOldKey,
                    observed,
                    observed,
                    &["rotation_tag", "activation_secret_ref", "keystore_kind"],
                ),
            ]
        }
        Operation::Remove if observed == Absent => Vec::new(),
        Operation::Remove => vec![route_step(
            RemoveKeystore,
            observed,
            Absent,
            &["keystore_location"],
        )],
    }
}

fn goal(operation: Operation, observed: WalletState) -> WalletState {
    match operation {
        Operation::Setup | Operation::Create => WalletState::AutoLoginLocal,
        Operation::SetupHsm => WalletState::AutoLoginHsm,
        Operation::Update | Operation::UpdateSecret => observed,
        Operation::Remove => WalletState::Absent,
    }
}

fn required_params(operation: Operation, observed: WalletState) -> Vec<&'static str> {
    let mut required = match operation {
        Operation::Setup | Operation::Create => vec!["keystore_location", "password_ref"],
        Operation::SetupHsm => vec!["hsm_secret_ref", "keystore_location", "password_ref"],
        Operation::Update => vec!["new_secret_ref", "password_ref", "keystore_location"],
        Operation::UpdateSecret => vec!["new_secret_ref", "keystore_location"],
        Operation::Remove => Vec::new(),
    };
    match (operation, observed) {
        (Operation::Update, WalletState::AutoLoginHsm) => required.push("hsm_secret_ref"),
        (Operation::UpdateSecret, WalletState::AutoLoginLocal) => required.push("password_ref"),
        _ => {}
    }
    if operation.is_rotation() {
        required.push("rotation_tag");
    }
    required
}

/// Secret that unlocks the keystore once the rotation step has run.
fn activation_secret(
    operation: Operation,
    kind: KeystoreKind,
    params: &BTreeMap<String, String>,
) -> Option<String> {
    let key = match (operation, kind) {
        (Operation::Update, KeystoreKind::Local) => "new_secret_ref",
        (Operation::Update, KeystoreKind::Hsm) => "hsm_secret_ref",
        (Operation::UpdateSecret, KeystoreKind::Local) => "password_ref",
        (Operation::UpdateSecret, KeystoreKind::Hsm) => "new_secret_ref",
        _ => return None,
    };
    params.get(key).cloned()
}

/// Plan `operation` from the `observed` state.
///
/// `force` is honored for `remove` only: it permits planning from `Error`.
pub fn build(
    operation: Operation,
    observed: WalletState,
    params: &BTreeMap<String, String>,
    force: bool,
) -> Result<OperationPlan, WalletError> {
    let force = force && operation == Operation::Remove;
    if observed == WalletState::Error && !force {
        return Err(WalletError::UnsupportedTransition {
            operation,
            observed,
        });
    }

    let steps = route(operation, observed);
    let on_route = steps.is_empty()
        || steps
            .iter()
            .any(|step| step.pre == observed || step.post == observed);
    let accepted = if operation.is_rotation() {
        ROTATION_STATES.contains(&observed)
    } else {
        on_route
    };
    if !accepted {
        if operation.is_rotation() {
            return Err(WalletError::PreconditionMismatch {
                expected: ROTATION_STATES.to_vec(),
                observed,
            });
        }
        return Err(WalletError::UnsupportedTransition {
            operation,
            observed,
        });
    }

    validate_params(operation, observed, params)?;

    let kind = if observed == WalletState::AutoLoginHsm {
        KeystoreKind::Hsm
    } else {
        KeystoreKind::Local
    };
    let mut available = params.clone();
    available.insert("keystore_kind".to_string(), kind.as_str().to_string());
    if let Some(secret) = activation_secret(operation, kind, params) {
        available.insert("activation_secret_ref".to_string(), secret);
    }

    let posts: Vec<WalletState> = steps.iter().map(|step| step.post).collect();
    let workflow_steps = steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mut settled: Vec<WalletState> = Vec::new();
            for post in &posts[index..] {
                if *post != step.pre && !settled.contains(post) {
                    settled.push(*post);
                }
            }
            let args = step
                .args
                .iter()
                .filter_map(|key| {
                    available
                        .get(*key)
                        .map(|value| (key.to_string(), value.clone()))
                })
                .collect();
            WorkflowStep {
                ordinal: index + 1,
                command: StepCommand {
                    name: step.name,
                    args,
                },
                expected_pre: step.pre,
                expected_post: step.post,
                idempotent: step.name.is_idempotent(),
                settled_states: settled,
            }
        })
        .collect();

    let plan = OperationPlan {
        operation,
        observed,
        goal: goal(operation, observed),
        force,
        steps: workflow_steps,
    };
    plan.validate()
        .map_err(|_| WalletError::UnsupportedTransition {
            operation,
            observed,
        })?;
    Ok(plan)
}

fn validate_params(
    operation: Operation,
    observed: WalletState,
    params: &BTreeMap<String, String>,
) -> Result<(), WalletError> {
    for key in params.keys() {
        if !KNOWN_PARAMS.contains(&key.as_str()) {
            return Err(WalletError::InvalidRequest {
                reason: format!("unrecognized parameter {key}"),
            });
        }
    }
    for key in required_params(operation, observed) {
        let present = params.get(key).is_some_and(|value| !value.trim().is_empty());
        if !present {
            let hint = if key == "rotation_tag" {
                " (unique per rotation; reuse it to resume an interrupted one)"
            } else {
                ""
            };
            return Err(WalletError::InvalidRequest {
                reason: format!("{operation} from {observed} requires parameter {key}{hint}"),
            });
        }
    }
    for (key, value) in params {
        if key.ends_with("_ref") && !is_reference(value) {
            return Err(WalletError::InvalidRequest {
                reason: format!("{key} must be a secret reference like env:NAME, not a literal"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "plan_tests.rs"]
mod tests;
