//! Orchestrator configuration.
//!
//! A single JSON file names the targets and carries the policy knobs the
//! workflow reads: timeouts, retry bounds, status rules and failure codes.
//! Everything except `targets` has a default so a stub stays short.
use crate::channel::is_reference;
use crate::engine::{DatabaseType, FailureCodes};
use crate::error::WalletError;
use crate::inspect::StatusRule;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_ENV: &str = "TDE_WALLET_CONFIG";
const MAX_ATTEMPT_CEILING: u32 = 10;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WalletConfig {
    pub schema_version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Replaces the engine's status rules when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_rules: Option<Vec<StatusRule>>,
    /// Replaces the engine's failure code lists when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_codes: Option<FailureCodes>,
    pub targets: BTreeMap<String, TargetProfile>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// How to reach one target and where its keystore lives by default.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TargetProfile {
    pub db_type: DatabaseType,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
    /// Client command line; the engine default is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default)]
    pub keystore: KeystoreDefaults,
}

/// Keystore parameters merged under every request for the target.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeystoreDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm_secret_ref: Option<String>,
}

impl KeystoreDefaults {
    /// Defaults as request parameters, keyed the way operations expect them.
    pub fn as_params(&self) -> BTreeMap<String, String> {
        [
            ("keystore_location", &self.location),
            ("password_ref", &self.password_ref),
            ("hsm_secret_ref", &self.hsm_secret_ref),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|value| (key.to_string(), value.clone())))
        .collect()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_port() -> u16 {
    1521
}

impl WalletConfig {
    /// Look up a configured target.
    pub fn target(&self, name: &str) -> Result<&TargetProfile, WalletError> {
        self.targets
            .get(name)
            .ok_or_else(|| WalletError::Configuration {
                reason: format!("target {name:?} is not configured"),
            })
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Count configured targets per engine, for the startup log line.
    pub fn targets_by_engine(&self) -> BTreeMap<DatabaseType, usize> {
        let mut counts = BTreeMap::new();
        for profile in self.targets.values() {
            *counts.entry(profile.db_type).or_insert(0) += 1;
        }
        counts
    }
}

/// Build the config written by `tdew init`.
pub fn default_config() -> WalletConfig {
    let profile = TargetProfile {
        db_type: DatabaseType::Oracle,
        host: "db.example.internal".to_string(),
        port: default_port(),
        service: Some("ORCLPDB1".to_string()),
        username: Some("c##tde_admin".to_string()),
        credentials_ref: Some("env:TDEW_ADMIN_PASSWORD".to_string()),
        client: None,
        keystore: KeystoreDefaults {
            location: Some("/u01/app/oracle/admin/ORCL/wallet/tde".to_string()),
            password_ref: Some("env:TDEW_KEYSTORE_PASSWORD".to_string()),
            hsm_secret_ref: None,
        },
    };
    WalletConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        log_level: default_log_level(),
        connection_timeout_secs: default_connection_timeout_secs(),
        step_timeout_secs: default_step_timeout_secs(),
        retry: RetryConfig::default(),
        status_rules: None,
        failure_codes: None,
        targets: BTreeMap::from([("primary".to_string(), profile)]),
    }
}

/// Pick the config path: explicit flag, then `TDE_WALLET_CONFIG`, then the
/// user config directory.
pub fn resolve_config_path(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let base = dirs::config_dir()
        .ok_or_else(|| anyhow!("no config directory; pass --config or set {CONFIG_ENV}"))?;
    Ok(base.join("tde-wallet").join("config.json"))
}

/// Load and validate the config at `path`.
pub fn load_config(path: &Path) -> Result<WalletConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: WalletConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    validate_config(&config).with_context(|| format!("validate config {}", path.display()))?;
    Ok(config)
}

/// Persist a config in a stable JSON format, refusing to clobber unless `force`.
pub fn write_config(path: &Path, config: &WalletConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Validate schema version, bounds, rule patterns and secret references.
pub fn validate_config(config: &WalletConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    if config.targets.is_empty() {
        return Err(anyhow!("config must define at least one target"));
    }
    if config.connection_timeout_secs == 0 || config.step_timeout_secs == 0 {
        return Err(anyhow!("timeouts must be positive"));
    }
    let retry = &config.retry;
    if retry.max_attempts == 0 || retry.max_attempts > MAX_ATTEMPT_CEILING {
        return Err(anyhow!(
            "retry.max_attempts must be between 1 and {MAX_ATTEMPT_CEILING}"
        ));
    }
    if retry.multiplier == 0 {
        return Err(anyhow!("retry.multiplier must be at least 1"));
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        return Err(anyhow!(
            "retry.initial_backoff_ms exceeds retry.max_backoff_ms"
        ));
    }
    for rule in config.status_rules.iter().flatten() {
        Regex::new(&rule.pattern)
            .with_context(|| format!("compile status rule {:?}", rule.pattern))?;
    }
    for (name, profile) in &config.targets {
        validate_target(name, profile)?;
    }
    Ok(())
}

fn validate_target(name: &str, profile: &TargetProfile) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("target names must be non-empty"));
    }
    if profile.host.trim().is_empty() {
        return Err(anyhow!("target {name}: host must be non-empty"));
    }
    if profile.port == 0 {
        return Err(anyhow!("target {name}: port must be positive"));
    }
    if profile.username.is_some() != profile.credentials_ref.is_some() {
        return Err(anyhow!(
            "target {name}: username and credentials_ref must be set together"
        ));
    }
    let references = [
        ("credentials_ref", &profile.credentials_ref),
        ("keystore.password_ref", &profile.keystore.password_ref),
        ("keystore.hsm_secret_ref", &profile.keystore.hsm_secret_ref),
    ];
    for (field, value) in references {
        if let Some(value) = value {
            if !is_reference(value) {
                return Err(anyhow!(
                    "target {name}: {field} must be a secret reference like env:NAME"
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
