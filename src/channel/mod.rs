//! Administrative channels to database targets.
//!
//! A channel runs rendered probes and commands against one target and returns
//! raw output. How the session is opened and authenticated is the channel's
//! business; the orchestrator only sees text or a classified [`WalletError`].
mod process;
mod secrets;

pub use process::ProcessConnector;
pub use secrets::{is_reference, quote_literal};

use crate::config::TargetProfile;
use crate::error::WalletError;
use crate::plan::CommandName;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What a script is for, so channels and logs can tell probes from commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPurpose {
    StatusProbe,
    KeyProbe,
    Command(CommandName),
}

/// Engine-specific script text plus its purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminScript {
    pub purpose: ScriptPurpose,
    pub text: String,
}

impl AdminScript {
    pub fn status_probe(text: &str) -> Self {
        Self {
            purpose: ScriptPurpose::StatusProbe,
            text: text.to_string(),
        }
    }

    pub fn key_probe(text: &str) -> Self {
        Self {
            purpose: ScriptPurpose::KeyProbe,
            text: text.to_string(),
        }
    }

    pub fn command(name: CommandName, text: String) -> Self {
        Self {
            purpose: ScriptPurpose::Command(name),
            text,
        }
    }
}

/// A live administrative session to one target.
pub trait AdminChannel: Send + Sync {
    /// Run a read-only probe.
    fn inspect(&self, probe: &AdminScript, timeout: Duration) -> Result<String, WalletError>;

    /// Run a state-changing command.
    fn execute(&self, command: &AdminScript, timeout: Duration) -> Result<String, WalletError>;

    /// Release the session. Called once, from [`ChannelRegistry::close_all`].
    fn close(&self) {}
}

/// Opens channels for configured targets.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        target: &str,
        profile: &TargetProfile,
    ) -> Result<Arc<dyn AdminChannel>, WalletError>;
}

/// Per-process cache of open channels keyed by target name.
///
/// Entries are created on first use and released only by [`close_all`].
///
/// [`close_all`]: ChannelRegistry::close_all
pub struct ChannelRegistry {
    connector: Arc<dyn Connector>,
    channels: Mutex<BTreeMap<String, Arc<dyn AdminChannel>>>,
}

impl ChannelRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the cached channel for `target`, connecting on first use.
    pub fn get_or_connect(
        &self,
        target: &str,
        profile: &TargetProfile,
    ) -> Result<Arc<dyn AdminChannel>, WalletError> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(target) {
            return Ok(Arc::clone(channel));
        }
        let channel = self.connector.connect(target, profile)?;
        channels.insert(target.to_string(), Arc::clone(&channel));
        tracing::debug!(target_name = target, "channel opened");
        Ok(channel)
    }

    /// Close and forget every cached channel.
    pub fn close_all(&self) -> usize {
        let drained = std::mem::take(
            &mut *self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = drained.len();
        for (target, channel) in drained {
            channel.close();
            tracing::debug!(target_name = target.as_str(), "channel closed");
        }
        count
    }
}
