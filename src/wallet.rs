//! Canonical keystore model shared by planning, execution, and reporting.
//!
//! These types mirror the JSON the tool emits so results stay machine-readable
//! and engine-neutral.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical keystore state of a target, independent of the database engine.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WalletState {
    Absent,
    Closed,
    OpenNoAutoLogin,
    AutoLoginLocal,
    #[serde(rename = "auto_login_hsm")]
    AutoLoginHsm,
    PartiallyMigrated,
    Error,
}

impl WalletState {
    #[cfg(test)]
    pub const ALL: [WalletState; 7] = [
        WalletState::Absent,
        WalletState::Closed,
        WalletState::OpenNoAutoLogin,
        WalletState::AutoLoginLocal,
        WalletState::AutoLoginHsm,
        WalletState::PartiallyMigrated,
        WalletState::Error,
    ];

    /// Return the stable string identifier used in JSON artifacts.
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletState::Absent => "absent",
            WalletState::Closed => "closed",
            WalletState::OpenNoAutoLogin => "open_no_auto_login",
            WalletState::AutoLoginLocal => "auto_login_local",
            WalletState::AutoLoginHsm => "auto_login_hsm",
            WalletState::PartiallyMigrated => "partially_migrated",
            WalletState::Error => "error",
        }
    }

    /// Whether a planned step may move a target from `self` to `next`.
    ///
    /// `Error` is never a planned destination; it is only ever observed.
    /// Leaving `Error` is limited to `Absent`, which the builder only plans
    /// for a forced removal.
    pub fn can_transition_to(self, next: WalletState) -> bool {
        use WalletState::*;
        match (self, next) {
            (_, Error) => false,
            (Absent, Absent) => false,
            (_, Absent) => true,
            (Absent, Closed) => true,
            (Closed, Closed | OpenNoAutoLogin | PartiallyMigrated) => true,
            (OpenNoAutoLogin, AutoLoginLocal) => true,
            (AutoLoginLocal, AutoLoginLocal | Closed) => true,
            (PartiallyMigrated, AutoLoginHsm) => true,
            (AutoLoginHsm, AutoLoginHsm) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a state list as `a|b|c` for messages.
pub fn display_states(states: &[WalletState]) -> String {
    states
        .iter()
        .map(WalletState::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

/// Where the master key material for a keystore lives.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeystoreKind {
    Local,
    Hsm,
}

impl KeystoreKind {
    /// Return the stable string identifier used in JSON artifacts.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeystoreKind::Local => "local",
            KeystoreKind::Hsm => "hsm",
        }
    }
}

impl fmt::Display for KeystoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The keystore a target owns after a workflow.
///
/// `credential_ref` is an opaque handle understood by the key-management
/// platform; the secret itself never enters this struct.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct KeystoreDescriptor {
    pub target: String,
    pub kind: KeystoreKind,
    pub location: Option<String>,
    pub credential_ref: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Inactive,
    Pending,
}

/// One master encryption key as listed by the target.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct MasterKeyEntry {
    pub key_id: String,
    pub keystore: KeystoreKind,
    pub status: KeyStatus,
    /// Creation time exactly as the engine reports it.
    pub created_at: String,
}

/// Check the active-key invariant over a target's key listing.
///
/// Exactly one key must be active. Outside a rotation window no key may be
/// pending; inside one, a single pending key is tolerated. Inactive keys are
/// retired history and are not bounded.
pub fn check_key_invariant(keys: &[MasterKeyEntry], rotation_window: bool) -> Result<(), String> {
    let active = keys
        .iter()
        .filter(|key| key.status == KeyStatus::Active)
        .count();
    let pending = keys
        .iter()
        .filter(|key| key.status == KeyStatus::Pending)
        .count();
    if active != 1 {
        return Err(format!("expected exactly one active master key, found {active}"));
    }
    let pending_limit = usize::from(rotation_window);
    if pending > pending_limit {
        return Err(format!(
            "found {pending} pending master keys (at most {pending_limit} allowed)"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, status: KeyStatus) -> MasterKeyEntry {
        MasterKeyEntry {
            key_id: id.to_string(),
            keystore: KeystoreKind::Local,
            status,
            created_at: "2026-01-01T00:00:00".to_string(),
        }
    }

    #[test]
    fn error_is_left_only_towards_absent() {
        for next in WalletState::ALL {
            let allowed = WalletState::Error.can_transition_to(next);
            assert_eq!(allowed, next == WalletState::Absent, "error -> {next}");
        }
    }

    #[test]
    fn nothing_plans_into_error() {
        for state in WalletState::ALL {
            assert!(!state.can_transition_to(WalletState::Error));
        }
    }

    #[test]
    fn key_invariant_accepts_retired_history() {
        let keys = vec![
            key("a", KeyStatus::Inactive),
            key("b", KeyStatus::Inactive),
            key("c", KeyStatus::Active),
        ];
        assert!(check_key_invariant(&keys, false).is_ok());
    }

    #[test]
    fn key_invariant_rejects_two_active_keys() {
        let keys = vec![key("a", KeyStatus::Active), key("b", KeyStatus::Active)];
        let err = check_key_invariant(&keys, true).unwrap_err();
        assert!(err.contains("found 2"));
    }

    #[test]
    fn pending_key_only_tolerated_during_rotation() {
        let keys = vec![key("a", KeyStatus::Active), key("b", KeyStatus::Pending)];
        assert!(check_key_invariant(&keys, true).is_ok());
        assert!(check_key_invariant(&keys, false).is_err());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&WalletState::AutoLoginHsm).unwrap();
        assert_eq!(json, "\"auto_login_hsm\"");
        let parsed: WalletState = serde_json::from_str("\"open_no_auto_login\"").unwrap();
        assert_eq!(parsed, WalletState::OpenNoAutoLogin);
    }
}
