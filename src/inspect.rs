//! Keystore state inspection.
//!
//! The inspector runs the engine's read-only status probe, normalizes the rows
//! and walks an ordered rule list; the first matching rule decides the state.
//! Output that matches no rule is reported as unknown rather than guessed.
use crate::channel::AdminChannel;
use crate::engine::Dialect;
use crate::error::WalletError;
use crate::wallet::{MasterKeyEntry, WalletState};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pattern over the normalized status string and the state it denotes.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatusRule {
    pub pattern: String,
    pub state: WalletState,
}

pub struct WalletStateInspector {
    dialect: Dialect,
    rules: Vec<(Regex, WalletState)>,
    timeout: Duration,
}

impl WalletStateInspector {
    /// Compile `rules` in order. Configured rules replace the engine defaults
    /// wholesale.
    pub fn new(
        dialect: Dialect,
        rules: Option<&[StatusRule]>,
        timeout: Duration,
    ) -> Result<Self, WalletError> {
        let defaults;
        let rules = match rules {
            Some(rules) => rules,
            None => {
                defaults = dialect.default_status_rules();
                defaults.as_slice()
            }
        };
        let compiled = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|regex| (regex, rule.state))
                    .map_err(|err| WalletError::Configuration {
                        reason: format!("status rule {:?}: {err}", rule.pattern),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dialect,
            rules: compiled,
            timeout,
        })
    }

    /// Probe `channel` and classify the result.
    pub fn inspect(&self, channel: &dyn AdminChannel) -> Result<WalletState, WalletError> {
        let raw = channel.inspect(&self.dialect.status_probe(), self.timeout)?;
        self.classify(&raw)
    }

    /// Classify raw probe output.
    pub fn classify(&self, raw: &str) -> Result<WalletState, WalletError> {
        let normalized = self.dialect.normalize_status(raw);
        if normalized.is_empty() {
            return Err(WalletError::UnknownState {
                status: "status probe returned no rows".to_string(),
            });
        }
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(&normalized))
            .map(|(_, state)| *state)
            .ok_or(WalletError::UnknownState { status: normalized })
    }

    /// List master keys through the engine key probe.
    pub fn inspect_keys(
        &self,
        channel: &dyn AdminChannel,
    ) -> Result<Vec<MasterKeyEntry>, WalletError> {
        let raw = channel.inspect(&self.dialect.key_probe(), self.timeout)?;
        self.dialect.parse_keys(&raw)
    }
}
