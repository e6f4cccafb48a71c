//! Simulated Oracle targets for unit tests.
//!
//! A [`SimulatedTarget`] answers the Oracle status and key probes from an
//! in-memory keystore and applies catalog commands by name, so workflows can
//! run end to end without a database. The keystore password and rotation tags
//! are read back from the rendered script's placeholders. Failures, lies, lost
//! replies and delays are injected per command.
use crate::channel::{AdminChannel, AdminScript, Connector, ScriptPurpose};
use crate::config::{KeystoreDefaults, RetryConfig, TargetProfile, WalletConfig, CONFIG_SCHEMA_VERSION};
use crate::engine::DatabaseType;
use crate::error::WalletError;
use crate::orchestrator::CancelToken;
use crate::plan::CommandName;
use crate::wallet::{KeyStatus, KeystoreKind, MasterKeyEntry, WalletState};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Keystore password reference every simulated profile starts with.
pub const SIM_PASSWORD_REF: &str = "env:TDEW_SIM_PW";

pub fn oracle_profile() -> TargetProfile {
    TargetProfile {
        db_type: DatabaseType::Oracle,
        host: "sim".to_string(),
        port: 1521,
        service: Some("SIM".to_string()),
        username: None,
        credentials_ref: None,
        client: None,
        keystore: KeystoreDefaults {
            location: Some("/u01/wallet".to_string()),
            password_ref: Some(SIM_PASSWORD_REF.to_string()),
            hsm_secret_ref: None,
        },
    }
}

/// Config with the given Oracle targets and millisecond backoff.
pub fn sim_config(targets: &[&str]) -> WalletConfig {
    WalletConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        log_level: "info".to_string(),
        connection_timeout_secs: 5,
        step_timeout_secs: 5,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2,
        },
        status_rules: None,
        failure_codes: None,
        targets: targets
            .iter()
            .map(|name| (name.to_string(), oracle_profile()))
            .collect(),
    }
}

fn status_text(state: WalletState) -> &'static str {
    match state {
        WalletState::Absent => "FILE:NOT_AVAILABLE:UNKNOWN",
        WalletState::Closed => "FILE:CLOSED:UNKNOWN",
        WalletState::OpenNoAutoLogin => "FILE:OPEN:PASSWORD",
        WalletState::AutoLoginLocal => "FILE:OPEN:AUTOLOGIN",
        WalletState::AutoLoginHsm => "FILE:OPEN:AUTOLOGIN\nHSM:OPEN:HSM",
        WalletState::PartiallyMigrated => "FILE:CLOSED:UNKNOWN\nHSM:OPEN_NO_MASTER_KEY:HSM",
        WalletState::Error => "FILE:UNDEFINED:UNKNOWN",
    }
}

/// Secret references in script order.
fn secret_refs(script: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\{secret(?:@[0-9]+)?:([^{}\s]+)\}").expect("placeholder regex is valid")
    });
    re.captures_iter(script)
        .filter_map(|caps| caps.get(1).map(|reference| reference.as_str().to_string()))
        .collect()
}

fn rotation_tag(script: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"TAG = '([^']*)'").expect("tag regex is valid"));
    re.captures(script)
        .and_then(|caps| caps.get(1))
        .map(|tag| tag.as_str().to_string())
}

fn wrong_password() -> WalletError {
    WalletError::Credential {
        reason: "ORA-28353: failed to open wallet".to_string(),
    }
}

#[derive(Default)]
struct Keystore {
    state: Option<WalletState>,
    keys: Vec<MasterKeyEntry>,
    minted: u32,
    /// Reference whose value currently opens the keystore.
    password: Option<String>,
    /// Rotation tag and the key created under it.
    tags: Vec<(String, String)>,
    raw_status: Option<String>,
    executed: Vec<CommandName>,
    windows: Vec<(Instant, Instant)>,
    command_failures: HashMap<CommandName, VecDeque<WalletError>>,
    inspect_failures: VecDeque<WalletError>,
    lies: HashMap<CommandName, WalletState>,
    lost_replies: HashMap<CommandName, usize>,
    command_delay: Duration,
    cancel_after: Option<(usize, CancelToken)>,
    closes: usize,
}

impl Keystore {
    fn state(&self) -> WalletState {
        self.state.unwrap_or(WalletState::Absent)
    }

    fn mint_key(&mut self, keystore: KeystoreKind) -> String {
        self.minted += 1;
        let key_id = format!("SIMKEY{:04}", self.minted);
        self.keys.push(MasterKeyEntry {
            key_id: key_id.clone(),
            keystore,
            status: KeyStatus::Pending,
            created_at: format!("2026-01-01T00:00:{:02}", self.minted % 60),
        });
        self.activate(&key_id);
        key_id
    }

    fn activate(&mut self, key_id: &str) {
        for key in &mut self.keys {
            if key.key_id == key_id {
                key.status = KeyStatus::Active;
            } else if key.status == KeyStatus::Active {
                key.status = KeyStatus::Inactive;
            }
        }
    }

    /// Old password to new; a keystore already on the new one is left alone.
    fn rotate_password(&mut self, refs: &[String]) -> Result<(), WalletError> {
        let (Some(old), Some(new)) = (refs.first(), refs.get(1)) else {
            return Err(WalletError::CommandRejected {
                reason: "ORA-00900: invalid SQL statement".to_string(),
            });
        };
        if self.password.as_ref() == Some(old) {
            self.password = Some(new.clone());
            Ok(())
        } else if self.password.as_ref() == Some(new) {
            Ok(())
        } else {
            Err(wrong_password())
        }
    }

    /// Create and activate the key for the script's tag unless it exists.
    fn activate_tagged(&mut self, script: &str, refs: &[String]) -> Result<(), WalletError> {
        if self.state() == WalletState::AutoLoginLocal && refs.first() != self.password.as_ref() {
            return Err(wrong_password());
        }
        let tag = rotation_tag(script).ok_or_else(|| WalletError::CommandRejected {
            reason: "ORA-00900: invalid SQL statement".to_string(),
        })?;
        let tagged = self
            .tags
            .iter()
            .find(|(existing, _)| *existing == tag)
            .map(|(_, key_id)| key_id.clone());
        let Some(key_id) = tagged else {
            let kind = self.active_kind();
            let key_id = self.mint_key(kind);
            self.tags.push((tag, key_id));
            return Ok(());
        };
        let status = self
            .keys
            .iter()
            .find(|key| key.key_id == key_id)
            .map(|key| key.status);
        match status {
            Some(KeyStatus::Active) => Ok(()),
            Some(KeyStatus::Pending) => {
                self.activate(&key_id);
                Ok(())
            }
            _ => Err(WalletError::CommandRejected {
                reason: "ORA-20403: rotation tag belongs to an earlier rotation".to_string(),
            }),
        }
    }

    fn active_kind(&self) -> KeystoreKind {
        if self.state() == WalletState::AutoLoginHsm {
            KeystoreKind::Hsm
        } else {
            KeystoreKind::Local
        }
    }

    /// Apply `command`, or reject it the way the database would.
    fn apply(&mut self, command: CommandName, script: &str) -> Result<(), WalletError> {
        use WalletState::*;
        let state = self.state();
        let refs = secret_refs(script);
        let next = match (command, state) {
            (CommandName::CreateKeystore, Absent) => {
                self.password = refs.first().cloned();
                Closed
            }
            (CommandName::SetMasterKey, Closed) => {
                self.mint_key(KeystoreKind::Local);
                OpenNoAutoLogin
            }
            (CommandName::OpenKeystore, Closed) => OpenNoAutoLogin,
            (CommandName::OpenForAutoLogin, OpenNoAutoLogin) => AutoLoginLocal,
            (CommandName::CloseLocal, AutoLoginLocal) => Closed,
            (CommandName::ConfigureHsm, Closed) => Closed,
            (CommandName::OpenHsm, Closed) => PartiallyMigrated,
            (CommandName::MigrateMasterKey, PartiallyMigrated) => {
                self.mint_key(KeystoreKind::Hsm);
                AutoLoginHsm
            }
            (CommandName::VerifyActiveKey, AutoLoginLocal | AutoLoginHsm) => {
                if !self.keys.iter().any(|key| key.status == KeyStatus::Active) {
                    return Err(WalletError::CommandRejected {
                        reason: "ORA-20401: no active master key".to_string(),
                    });
                }
                state
            }
            (CommandName::RotateKeystorePassword, AutoLoginLocal | AutoLoginHsm) => {
                self.rotate_password(&refs)?;
                state
            }
            (
                CommandName::RotateHsmSecret | CommandName::RetireOldKey,
                AutoLoginLocal | AutoLoginHsm,
            ) => state,
            (CommandName::ActivateNewKey, AutoLoginLocal | AutoLoginHsm) => {
                self.activate_tagged(script, &refs)?;
                state
            }
            (CommandName::RemoveKeystore, _) => {
                self.keys.clear();
                self.tags.clear();
                self.password = None;
                self.raw_status = None;
                Absent
            }
            (command, state) => {
                return Err(WalletError::CommandRejected {
                    reason: format!("ORA-46600: {command} is not valid while keystore is {state}"),
                })
            }
        };
        self.state = Some(next);
        Ok(())
    }
}

/// In-memory stand-in for one Oracle database's keystore.
#[derive(Clone, Default)]
pub struct SimulatedTarget {
    inner: Arc<Mutex<Keystore>>,
}

impl SimulatedTarget {
    pub fn new(state: WalletState) -> Self {
        let target = Self::default();
        {
            let mut keystore = target.lock();
            keystore.state = Some(state);
            if state != WalletState::Absent {
                keystore.password = Some(SIM_PASSWORD_REF.to_string());
            }
        }
        target
    }

    /// Target in `state` with a single active key, as left by a finished setup.
    pub fn provisioned(state: WalletState) -> Self {
        let target = Self::new(state);
        let mut keystore = target.lock();
        let kind = keystore.active_kind();
        keystore.mint_key(kind);
        drop(keystore);
        target
    }

    fn lock(&self) -> MutexGuard<'_, Keystore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WalletState {
        self.lock().state()
    }

    pub fn keys(&self) -> Vec<MasterKeyEntry> {
        self.lock().keys.clone()
    }

    /// Reference whose value currently opens the keystore.
    pub fn password_ref(&self) -> Option<String> {
        self.lock().password.clone()
    }

    pub fn set_password_ref(&self, reference: &str) {
        self.lock().password = Some(reference.to_string());
    }

    pub fn push_key(&self, key: MasterKeyEntry) {
        self.lock().keys.push(key);
    }

    /// Report `raw` from the status probe instead of the modeled state.
    pub fn set_raw_status(&self, raw: Option<&str>) {
        self.lock().raw_status = raw.map(str::to_string);
    }

    pub fn fail_command(&self, command: CommandName, error: WalletError, times: usize) {
        let mut keystore = self.lock();
        let queue = keystore.command_failures.entry(command).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_inspections(&self, error: WalletError, times: usize) {
        self.lock()
            .inspect_failures
            .extend(std::iter::repeat(error).take(times));
    }

    /// Make `command` report success but leave the target in `state`.
    pub fn lie_about(&self, command: CommandName, state: WalletState) {
        self.lock().lies.insert(command, state);
    }

    /// Apply `command` but report a timeout instead of its reply, `times` times.
    pub fn lose_reply(&self, command: CommandName, times: usize) {
        *self.lock().lost_replies.entry(command).or_default() += times;
    }

    pub fn set_command_delay(&self, delay: Duration) {
        self.lock().command_delay = delay;
    }

    /// Cancel `token` once `count` commands have been applied.
    pub fn cancel_after(&self, count: usize, token: CancelToken) {
        self.lock().cancel_after = Some((count, token));
    }

    /// Commands that reached the target, including failed attempts.
    pub fn executed(&self) -> Vec<CommandName> {
        self.lock().executed.clone()
    }

    pub fn command_count(&self) -> usize {
        self.lock().executed.len()
    }

    /// Start and end of every command execution.
    pub fn windows(&self) -> Vec<(Instant, Instant)> {
        self.lock().windows.clone()
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    fn key_listing(&self) -> String {
        self.lock()
            .keys
            .iter()
            .map(|key| {
                let keystore = match key.keystore {
                    KeystoreKind::Local => "SOFTWARE KEYSTORE",
                    KeystoreKind::Hsm => "HSM",
                };
                let status = match key.status {
                    KeyStatus::Active => "ACTIVE",
                    KeyStatus::Inactive => "INACTIVE",
                    KeyStatus::Pending => "PENDING",
                };
                format!("{}|{keystore}|{status}|{}", key.key_id, key.created_at)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct SimChannel {
    target: SimulatedTarget,
}

impl AdminChannel for SimChannel {
    fn inspect(&self, probe: &AdminScript, _timeout: Duration) -> Result<String, WalletError> {
        let mut keystore = self.target.lock();
        if let Some(err) = keystore.inspect_failures.pop_front() {
            return Err(err);
        }
        match probe.purpose {
            ScriptPurpose::StatusProbe => Ok(keystore
                .raw_status
                .clone()
                .unwrap_or_else(|| status_text(keystore.state()).to_string())),
            ScriptPurpose::KeyProbe => {
                drop(keystore);
                Ok(self.target.key_listing())
            }
            ScriptPurpose::Command(name) => Err(WalletError::CommandRejected {
                reason: format!("{name} sent as a probe"),
            }),
        }
    }

    fn execute(&self, command: &AdminScript, _timeout: Duration) -> Result<String, WalletError> {
        let ScriptPurpose::Command(name) = command.purpose else {
            return Err(WalletError::CommandRejected {
                reason: "probe sent as a command".to_string(),
            });
        };
        let delay = self.target.lock().command_delay;
        let start = Instant::now();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut keystore = self.target.lock();
        keystore.executed.push(name);
        keystore.windows.push((start, Instant::now()));
        let injected = keystore
            .command_failures
            .get_mut(&name)
            .and_then(VecDeque::pop_front);
        if let Some(err) = injected {
            return Err(err);
        }
        if let Some(state) = keystore.lies.get(&name).copied() {
            keystore.state = Some(state);
        } else {
            keystore.apply(name, &command.text)?;
        }
        if let Some((count, token)) = &keystore.cancel_after {
            if keystore.executed.len() >= *count {
                token.cancel();
            }
        }
        if let Some(lost) = keystore.lost_replies.get_mut(&name).filter(|lost| **lost > 0) {
            *lost -= 1;
            return Err(WalletError::TransientDatabase {
                reason: "client call timed out after 5000ms".to_string(),
            });
        }
        Ok(String::new())
    }

    fn close(&self) {
        self.target.lock().closes += 1;
    }
}

/// Connector over a fixed set of simulated targets.
#[derive(Default)]
pub struct SimConnector {
    targets: BTreeMap<String, SimulatedTarget>,
    connects: AtomicUsize,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, name: &str, target: SimulatedTarget) -> Self {
        self.targets.insert(name.to_string(), target);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for SimConnector {
    fn connect(
        &self,
        target: &str,
        _profile: &TargetProfile,
    ) -> Result<Arc<dyn AdminChannel>, WalletError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let sim = self
            .targets
            .get(target)
            .cloned()
            .ok_or_else(|| WalletError::Connection {
                reason: format!("no simulated target named {target}"),
            })?;
        Ok(Arc::new(SimChannel { target: sim }))
    }
}
