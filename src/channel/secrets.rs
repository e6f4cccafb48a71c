//! Secret references and placeholder expansion.
//!
//! Scripts carry `{secret:SCHEME:HANDLE}` placeholders until the moment they are
//! written to a client. Supported schemes are `env:NAME` and `file:PATH`.
//!
//! A placeholder that sits inside N levels of single-quoted SQL literals is
//! written `{secret@N:SCHEME:HANDLE}`; its value has every `'` repeated 2^N
//! times on expansion. [`quote_literal`] maintains the depth when it wraps text.
use crate::error::WalletError;
use regex::{Captures, Regex};
use std::env;
use std::fs;
use std::sync::OnceLock;

const REDACTED: &str = "********";

/// Deepest literal nesting a placeholder may sit in.
const MAX_DEPTH: u32 = 8;

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_+-]*:\S+$").expect("reference regex is valid")
    })
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{secret(?:@([0-9]{1,2}))?:([a-z][a-z0-9_+-]*:[^{}\s]+)\}")
            .expect("placeholder regex is valid")
    })
}

/// Whether `value` has the `scheme:handle` shape of a secret reference.
pub fn is_reference(value: &str) -> bool {
    reference_regex().is_match(value)
}

/// Wrap `text` in a single-quoted SQL literal.
///
/// Quotes in the text are doubled and every secret placeholder moves one
/// literal level deeper, so its value is escaped to match on expansion.
pub fn quote_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(text) {
        let (Some(whole), Some(reference)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()].replace('\'', "''"));
        out.push_str(&format!(
            "{{secret@{}:{}}}",
            depth(&caps) + 1,
            reference.as_str()
        ));
        last = whole.end();
    }
    out.push_str(&text[last..].replace('\'', "''"));
    out.push('\'');
    out
}

fn depth(caps: &Captures<'_>) -> u32 {
    caps.get(1)
        .and_then(|depth| depth.as_str().parse().ok())
        .unwrap_or(0)
}

/// Resolve one reference to its secret value.
pub(super) fn resolve(reference: &str) -> Result<String, WalletError> {
    let Some((scheme, handle)) = reference.split_once(':') else {
        return Err(WalletError::Credential {
            reason: format!("malformed secret reference {reference:?}"),
        });
    };
    let value = match scheme {
        "env" => env::var(handle).map_err(|_| WalletError::Credential {
            reason: format!("secret reference {reference} is not set"),
        })?,
        "file" => fs::read_to_string(handle)
            .map_err(|err| WalletError::Credential {
                reason: format!("read secret reference {reference}: {err}"),
            })?
            .trim_end_matches(['\r', '\n'])
            .to_string(),
        other => {
            return Err(WalletError::Credential {
                reason: format!("unsupported secret scheme {other:?} in {reference}"),
            })
        }
    };
    if value.is_empty() {
        return Err(WalletError::Credential {
            reason: format!("secret reference {reference} resolved to an empty value"),
        });
    }
    // Secrets are sent as quoted identifiers on a line-oriented client.
    if value.contains('"') || value.chars().any(char::is_control) {
        return Err(WalletError::Credential {
            reason: format!(
                "secret reference {reference} contains a double quote or control character"
            ),
        });
    }
    Ok(value)
}

/// Script text with every placeholder replaced, plus the values it now contains.
#[derive(Debug)]
pub(super) struct Expanded {
    pub text: String,
    pub secrets: Vec<String>,
}

/// Replace every secret placeholder in `text`, escaping values by depth.
pub(super) fn expand(text: &str) -> Result<Expanded, WalletError> {
    let mut out = String::with_capacity(text.len());
    let mut secrets = Vec::new();
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(text) {
        let (Some(whole), Some(reference)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let depth = depth(&caps);
        if depth > MAX_DEPTH {
            return Err(WalletError::InvalidRequest {
                reason: format!("secret placeholder nested {depth} literals deep"),
            });
        }
        let value = resolve(reference.as_str())?;
        let escaped = value.replace('\'', &"'".repeat(1 << depth));
        out.push_str(&text[last..whole.start()]);
        out.push_str(&escaped);
        last = whole.end();
        for form in [value, escaped] {
            if !secrets.contains(&form) {
                secrets.push(form);
            }
        }
    }
    out.push_str(&text[last..]);
    Ok(Expanded { text: out, secrets })
}

/// Mask every resolved secret value that appears in client output.
pub(super) fn redact(output: &str, secrets: &[String]) -> String {
    let mut redacted = output.to_string();
    // Longest first so a secret that contains another is masked whole.
    let mut ordered: Vec<&String> = secrets.iter().collect();
    ordered.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
    for secret in ordered {
        redacted = redacted.replace(secret.as_str(), REDACTED);
    }
    redacted
}
