//! Database engines and their keystore dialects.
//!
//! Engines form a closed set. Only engines with a [`Dialect`] can have their
//! keystores managed; the rest yield an explicit `NotImplemented` error the
//! moment a workflow resolves its target, before any channel is opened.
mod oracle;

use crate::channel::AdminScript;
use crate::config::TargetProfile;
use crate::error::WalletError;
use crate::inspect::StatusRule;
use crate::plan::StepCommand;
use crate::wallet::MasterKeyEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Database engines a target profile may name.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DatabaseType {
    #[serde(rename = "oracle")]
    Oracle,
    #[serde(rename = "sqlserver")]
    SqlServer,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "postgresql")]
    PostgreSql,
}

impl DatabaseType {
    /// Return the stable string identifier used in config and JSON artifacts.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Oracle => "oracle",
            DatabaseType::SqlServer => "sqlserver",
            DatabaseType::MySql => "mysql",
            DatabaseType::PostgreSql => "postgresql",
        }
    }

    /// Resolve the keystore dialect for this engine.
    pub fn dialect(self) -> Result<Dialect, WalletError> {
        match self {
            DatabaseType::Oracle => Ok(Dialect::Oracle),
            DatabaseType::SqlServer | DatabaseType::MySql | DatabaseType::PostgreSql => {
                Err(WalletError::NotImplemented { engine: self })
            }
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-specific rendering of probes and lifecycle commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Oracle,
}

impl Dialect {
    /// Client command used when a target profile does not name one.
    pub fn default_client(&self) -> &'static str {
        match self {
            Dialect::Oracle => oracle::DEFAULT_CLIENT,
        }
    }

    /// Statements sent ahead of every script on a fresh client session.
    pub fn session_preamble(&self, profile: &TargetProfile) -> String {
        match self {
            Dialect::Oracle => oracle::session_preamble(profile),
        }
    }

    /// Statement that ends a client session once the script has run.
    pub fn session_epilogue(&self) -> &'static str {
        match self {
            Dialect::Oracle => oracle::SESSION_EPILOGUE,
        }
    }

    /// Read-only query whose output the inspector classifies.
    pub fn status_probe(&self) -> AdminScript {
        match self {
            Dialect::Oracle => AdminScript::status_probe(oracle::STATUS_PROBE),
        }
    }

    /// Read-only query listing master keys.
    pub fn key_probe(&self) -> AdminScript {
        match self {
            Dialect::Oracle => AdminScript::key_probe(oracle::KEY_PROBE),
        }
    }

    /// Render a catalog command into engine syntax.
    ///
    /// Secrets stay as `{secret:REF}` placeholders; the channel resolves them.
    pub fn render(&self, command: &StepCommand) -> Result<AdminScript, WalletError> {
        match self {
            Dialect::Oracle => oracle::render(command),
        }
    }

    /// Reduce raw probe output to the canonical row string the status rules match.
    pub fn normalize_status(&self, raw: &str) -> String {
        match self {
            Dialect::Oracle => oracle::normalize_status(raw),
        }
    }

    pub fn parse_keys(&self, raw: &str) -> Result<Vec<MasterKeyEntry>, WalletError> {
        match self {
            Dialect::Oracle => oracle::parse_keys(raw),
        }
    }

    pub fn default_status_rules(&self) -> Vec<StatusRule> {
        match self {
            Dialect::Oracle => oracle::default_status_rules(),
        }
    }

    pub fn default_failure_codes(&self) -> FailureCodes {
        match self {
            Dialect::Oracle => oracle::default_failure_codes(),
        }
    }
}

/// Engine error codes that decide how a failed command is classified.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct FailureCodes {
    #[serde(default)]
    pub credential: Vec<String>,
    #[serde(default)]
    pub transient: Vec<String>,
    #[serde(default)]
    pub connection: Vec<String>,
}

fn error_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:ORA|TNS|SP2)-\d{4,5}\b").expect("error code regex is valid")
    })
}

impl FailureCodes {
    /// Classify the output of a failed command.
    ///
    /// The first recognized code wins; output with no recognized code is a
    /// plain rejection and is not retried.
    pub fn classify(&self, output: &str) -> WalletError {
        let reason = first_error_line(output);
        for found in error_code_regex().find_iter(output) {
            let code = found.as_str();
            if self.credential.iter().any(|c| c == code) {
                return WalletError::Credential { reason };
            }
            if self.transient.iter().any(|c| c == code) {
                return WalletError::TransientDatabase { reason };
            }
            if self.connection.iter().any(|c| c == code) {
                return WalletError::Connection { reason };
            }
        }
        WalletError::CommandRejected { reason }
    }
}

fn first_error_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|line| error_code_regex().is_match(line))
        .or_else(|| output.lines().map(str::trim).find(|line| !line.is_empty()))
        .unwrap_or("command failed without output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn only_oracle_has_a_dialect() {
        assert_eq!(DatabaseType::Oracle.dialect(), Ok(Dialect::Oracle));
        for engine in [
            DatabaseType::SqlServer,
            DatabaseType::MySql,
            DatabaseType::PostgreSql,
        ] {
            let err = engine.dialect().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotImplemented);
        }
    }

    #[test]
    fn classify_uses_first_known_code() {
        let codes = Dialect::Oracle.default_failure_codes();
        let err = codes.classify("ERROR at line 1:\nORA-00054: resource busy\n");
        assert_eq!(err.kind(), ErrorKind::TransientDatabaseError);
        let err = codes.classify("ORA-01017: invalid username/password; logon denied");
        assert_eq!(err.kind(), ErrorKind::CredentialError);
        let err = codes.classify("ORA-12541: TNS:no listener");
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn unknown_codes_are_rejections() {
        let codes = Dialect::Oracle.default_failure_codes();
        let err = codes.classify("ORA-46658: keystore not open in the container");
        assert_eq!(
            err,
            WalletError::CommandRejected {
                reason: "ORA-46658: keystore not open in the container".to_string()
            }
        );
    }

    #[test]
    fn engine_names_round_trip_through_config_spelling() {
        let parsed: DatabaseType = serde_json::from_str("\"sqlserver\"").unwrap();
        assert_eq!(parsed, DatabaseType::SqlServer);
        assert_eq!(parsed.to_string(), "sqlserver");
    }
}
