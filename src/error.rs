//! Error taxonomy for keystore workflows.
//!
//! Every failure the orchestrator can meet is a value of [`WalletError`]; none of
//! them cross the orchestrator boundary as a panic or an `anyhow` chain. The
//! serialized [`ErrorKind`] is what callers use to decide whether a retry is safe.
use crate::engine::DatabaseType;
use crate::plan::Operation;
use crate::wallet::{display_states, WalletState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    /// The target could not be reached or the client could not be started.
    #[error("target unreachable: {reason}")]
    Connection { reason: String },

    /// Lock contention, timeout, or another condition worth retrying.
    #[error("transient database failure: {reason}")]
    TransientDatabase { reason: String },

    /// The target or the key-management platform rejected a credential.
    #[error("credential rejected: {reason}")]
    Credential { reason: String },

    #[error("observed state {observed} does not match expected {}", display_states(.expected))]
    PreconditionMismatch {
        expected: Vec<WalletState>,
        observed: WalletState,
    },

    #[error("{command} reported success but target is {}, expected {expected}", observed_label(.observed))]
    VerificationFailed {
        command: String,
        expected: WalletState,
        observed: Option<WalletState>,
    },

    #[error("no legal path from {observed} for operation {operation}")]
    UnsupportedTransition {
        operation: Operation,
        observed: WalletState,
    },

    #[error("unrecognized keystore status: {status}")]
    UnknownState { status: String },

    #[error("keystore management for {engine} targets is not implemented")]
    NotImplemented { engine: DatabaseType },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// The command ran and failed for a reason that retrying will not fix.
    #[error("command rejected by target: {reason}")]
    CommandRejected { reason: String },

    #[error("workflow cancelled before {command}")]
    Cancelled { command: String },
}

fn observed_label(observed: &Option<WalletState>) -> String {
    observed
        .map(|state| state.as_str().to_string())
        .unwrap_or_else(|| "unclassified".to_string())
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Connection { .. } => ErrorKind::ConnectionError,
            WalletError::TransientDatabase { .. } => ErrorKind::TransientDatabaseError,
            WalletError::Credential { .. } => ErrorKind::CredentialError,
            WalletError::PreconditionMismatch { .. } => ErrorKind::PreconditionMismatch,
            WalletError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            WalletError::UnsupportedTransition { .. } => ErrorKind::UnsupportedTransition,
            WalletError::UnknownState { .. } => ErrorKind::UnknownState,
            WalletError::NotImplemented { .. } => ErrorKind::NotImplemented,
            WalletError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            WalletError::Configuration { .. } => ErrorKind::ConfigurationError,
            WalletError::CommandRejected { .. } => ErrorKind::CommandRejected,
            WalletError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Whether the executor may retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::Connection { .. } | WalletError::TransientDatabase { .. }
        )
    }
}

/// Stable error identifiers used in JSON results.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    TransientDatabaseError,
    CredentialError,
    PreconditionMismatch,
    VerificationFailed,
    UnsupportedTransition,
    UnknownState,
    NotImplemented,
    InvalidRequest,
    ConfigurationError,
    CommandRejected,
    Cancelled,
}

impl ErrorKind {
    /// Return the stable string identifier used in JSON artifacts.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::TransientDatabaseError => "transient_database_error",
            ErrorKind::CredentialError => "credential_error",
            ErrorKind::PreconditionMismatch => "precondition_mismatch",
            ErrorKind::VerificationFailed => "verification_failed",
            ErrorKind::UnsupportedTransition => "unsupported_transition",
            ErrorKind::UnknownState => "unknown_state",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::CommandRejected => "command_rejected",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Operator guidance attached to results that did not succeed.
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => {
                "target was unreachable; check connectivity and rerun the same operation"
            }
            ErrorKind::TransientDatabaseError => {
                "target stayed busy past the retry ceiling; rerun the same operation once it settles"
            }
            ErrorKind::CredentialError => {
                "credential was rejected; fix the referenced secret before retrying"
            }
            ErrorKind::PreconditionMismatch => {
                "target is not in the state this operation starts from; inspect it with `tdew status` and choose a matching operation"
            }
            ErrorKind::VerificationFailed => {
                "command reported success but the keystore did not reach the expected state; re-inspect the target manually before any retry"
            }
            ErrorKind::UnsupportedTransition => {
                "no legal path from the observed state; run the prerequisite operation first, or `remove` with force to reset a failed keystore"
            }
            ErrorKind::UnknownState => {
                "keystore status could not be classified; inspect the target manually or extend the status rules"
            }
            ErrorKind::NotImplemented => {
                "this database engine has no keystore dialect; manage its keys out of band"
            }
            ErrorKind::InvalidRequest => "fix the request parameters and retry",
            ErrorKind::ConfigurationError => "fix the target configuration and retry",
            ErrorKind::CommandRejected => {
                "target rejected the command; review the detail and the database alert log"
            }
            ErrorKind::Cancelled => {
                "workflow was cancelled; rerun the same operation to resume from the observed state"
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
