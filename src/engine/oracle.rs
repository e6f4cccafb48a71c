//! Oracle keystore dialect (`ADMINISTER KEY MANAGEMENT` through SQL*Plus).
use super::FailureCodes;
use crate::channel::{quote_literal, AdminScript};
use crate::config::TargetProfile;
use crate::error::WalletError;
use crate::inspect::StatusRule;
use crate::plan::{CommandName, StepCommand};
use crate::wallet::{KeyStatus, KeystoreKind, MasterKeyEntry, WalletState};

pub(super) const DEFAULT_CLIENT: &str = "sqlplus -S -L /nolog";

pub(super) const SESSION_EPILOGUE: &str = "EXIT";

pub(super) const STATUS_PROBE: &str =
    "SELECT WRL_TYPE || ':' || STATUS || ':' || WALLET_TYPE FROM V$ENCRYPTION_WALLET;";

pub(super) const KEY_PROBE: &str = "SELECT KEY_ID || '|' || KEYSTORE_TYPE || '|' ||
  CASE WHEN ACTIVATION_TIME IS NULL THEN 'PENDING'
       WHEN ACTIVATION_TIME = MAX(ACTIVATION_TIME) OVER () THEN 'ACTIVE'
       ELSE 'INACTIVE' END || '|' ||
  TO_CHAR(CREATION_TIME, 'YYYY-MM-DD\"T\"HH24:MI:SS')
FROM V$ENCRYPTION_KEYS ORDER BY CREATION_TIME;";

/// ORA-28354: keystore is already open.
const ALREADY_OPEN: u32 = 28354;
/// ORA-28365: keystore is not open.
const NOT_OPEN: u32 = 28365;
/// ORA-29283: invalid file operation (file already gone).
const FILE_MISSING: u32 = 29283;
/// ORA-28353: failed to open wallet.
const WALLET_OPEN_FAILED: u32 = 28353;
/// ORA-46627: keystore password mismatch.
const PASSWORD_MISMATCH: u32 = 46627;
/// ORA-46630: keystore cannot be created at the specified location.
const AUTO_LOGIN_EXISTS: u32 = 46630;

const HSM_CLIENT: &str = "HSM_PASSWORD";
const KEYSTORE_DIRECTORY: &str = "TDEW_KEYSTORE_DIR";

pub(super) fn session_preamble(profile: &TargetProfile) -> String {
    let mut lines = vec![
        "WHENEVER SQLERROR EXIT FAILURE".to_string(),
        "WHENEVER OSERROR EXIT FAILURE".to_string(),
        "SET HEADING OFF FEEDBACK OFF PAGESIZE 0 LINESIZE 400 TRIMSPOOL ON VERIFY OFF ECHO OFF"
            .to_string(),
        "SET DEFINE OFF".to_string(),
    ];
    let service = profile.service.as_deref().unwrap_or("ORCL");
    let connect = match (&profile.username, &profile.credentials_ref) {
        (Some(user), Some(reference)) => format!(
            "CONNECT {user}/\"{}\"@//{}:{}/{service} AS SYSKM",
            secret(reference),
            profile.host,
            profile.port
        ),
        _ => "CONNECT / AS SYSKM".to_string(),
    };
    lines.push(connect);
    lines.join("\n")
}

pub(super) fn render(command: &StepCommand) -> Result<AdminScript, WalletError> {
    let statements = match command.name {
        CommandName::CreateKeystore => vec![format!(
            "ADMINISTER KEY MANAGEMENT CREATE KEYSTORE {} IDENTIFIED BY \"{}\";",
            literal(arg(command, "keystore_location")?),
            secret(arg(command, "password_ref")?)
        )],
        CommandName::SetMasterKey => {
            let password = secret(arg(command, "password_ref")?);
            vec![
                open_password_keystore(&password),
                format!(
                    "ADMINISTER KEY MANAGEMENT SET KEY USING TAG 'tdew-initial' IDENTIFIED BY \"{password}\" WITH BACKUP USING 'tdew-initial';"
                ),
            ]
        }
        CommandName::OpenKeystore => vec![open_password_keystore(&secret(arg(
            command,
            "password_ref",
        )?))],
        CommandName::OpenForAutoLogin => {
            let password = secret(arg(command, "password_ref")?);
            vec![
                format!(
                    "ADMINISTER KEY MANAGEMENT CREATE AUTO_LOGIN KEYSTORE FROM KEYSTORE {} IDENTIFIED BY \"{password}\";",
                    literal(arg(command, "keystore_location")?)
                ),
                // The auto-login keystore takes over on the next access.
                format!("ADMINISTER KEY MANAGEMENT SET KEYSTORE CLOSE IDENTIFIED BY \"{password}\";"),
            ]
        }
        CommandName::CloseLocal => vec!["ADMINISTER KEY MANAGEMENT SET KEYSTORE CLOSE;".to_string()],
        CommandName::ConfigureHsm => vec![
            "ALTER SYSTEM SET TDE_CONFIGURATION = 'KEYSTORE_CONFIGURATION=HSM|FILE' SCOPE = BOTH;"
                .to_string(),
        ],
        CommandName::OpenHsm => vec![tolerating(
            &format!(
                "ADMINISTER KEY MANAGEMENT SET KEYSTORE OPEN IDENTIFIED BY \"{}\"",
                secret(arg(command, "hsm_secret_ref")?)
            ),
            &[ALREADY_OPEN],
        )],
        CommandName::MigrateMasterKey => {
            let hsm_secret = secret(arg(command, "hsm_secret_ref")?);
            vec![
                format!(
                    "ADMINISTER KEY MANAGEMENT SET ENCRYPTION KEY IDENTIFIED BY \"{hsm_secret}\" MIGRATE USING \"{}\" WITH BACKUP;",
                    secret(arg(command, "password_ref")?)
                ),
                format!(
                    "ADMINISTER KEY MANAGEMENT ADD SECRET {} FOR CLIENT '{HSM_CLIENT}' TO AUTO_LOGIN KEYSTORE {};",
                    quote_literal(&hsm_secret),
                    literal(arg(command, "keystore_location")?)
                ),
            ]
        }
        CommandName::VerifyActiveKey => vec![plsql(
            "  active_keys NUMBER;",
            "  SELECT COUNT(*) INTO active_keys FROM V$ENCRYPTION_KEYS WHERE ACTIVATION_TIME IS NOT NULL;
  IF active_keys = 0 THEN
    RAISE_APPLICATION_ERROR(-20401, 'no active master key');
  END IF;",
        )],
        // Rotation commands check their own progress so a rerun with the same
        // rotation tag converges instead of failing or minting another key.
        CommandName::RotateKeystorePassword => {
            let old_password = secret(arg(command, "password_ref")?);
            let new_password = secret(arg(command, "new_secret_ref")?);
            let tag = literal(arg(command, "rotation_tag")?);
            vec![
                // A keystore that rejects the old password must already accept
                // the new one.
                guarded_block(
                    &format!(
                        "EXECUTE IMMEDIATE {};",
                        quote_literal(&format!(
                            "ADMINISTER KEY MANAGEMENT ALTER KEYSTORE PASSWORD FORCE KEYSTORE IDENTIFIED BY \"{old_password}\" SET \"{new_password}\" WITH BACKUP USING {tag}"
                        ))
                    ),
                    &[WALLET_OPEN_FAILED, PASSWORD_MISMATCH],
                    Some(&format!(
                        "EXECUTE IMMEDIATE {};",
                        quote_literal(&format!(
                            "ADMINISTER KEY MANAGEMENT BACKUP KEYSTORE USING {tag} FORCE KEYSTORE IDENTIFIED BY \"{new_password}\""
                        ))
                    )),
                ),
                tolerating(
                    &format!(
                        "ADMINISTER KEY MANAGEMENT CREATE AUTO_LOGIN KEYSTORE FROM KEYSTORE {} IDENTIFIED BY \"{new_password}\"",
                        literal(arg(command, "keystore_location")?)
                    ),
                    &[AUTO_LOGIN_EXISTS],
                ),
            ]
        }
        CommandName::RotateHsmSecret => vec![format!(
            "ADMINISTER KEY MANAGEMENT UPDATE SECRET {} FOR CLIENT '{HSM_CLIENT}' USING TAG {} TO AUTO_LOGIN KEYSTORE {};",
            quote_literal(&secret(arg(command, "new_secret_ref")?)),
            literal(arg(command, "rotation_tag")?),
            literal(arg(command, "keystore_location")?)
        )],
        CommandName::ActivateNewKey => {
            let tag = arg(command, "rotation_tag")?;
            let activation = secret(arg(command, "activation_secret_ref")?);
            let backup = backup_clause(command, tag);
            let create = quote_literal(&format!(
                "ADMINISTER KEY MANAGEMENT CREATE KEY USING TAG {} FORCE KEYSTORE IDENTIFIED BY \"{activation}\"{backup}",
                literal(tag)
            ));
            let use_key = format!(
                "{} || new_key || {}",
                quote_literal("ADMINISTER KEY MANAGEMENT USE KEY '"),
                quote_literal(&format!(
                    "' FORCE KEYSTORE IDENTIFIED BY \"{activation}\"{backup}"
                ))
            );
            vec![plsql(
                "  tagged NUMBER;
  new_key VARCHAR2(200);
  activated V$ENCRYPTION_KEYS.ACTIVATION_TIME%TYPE;
  newest V$ENCRYPTION_KEYS.ACTIVATION_TIME%TYPE;",
                &format!(
                    "  SELECT COUNT(*) INTO tagged FROM V$ENCRYPTION_KEYS WHERE TAG = {tag};
  IF tagged = 0 THEN
    EXECUTE IMMEDIATE {create};
  END IF;
  SELECT KEY_ID, ACTIVATION_TIME INTO new_key, activated FROM V$ENCRYPTION_KEYS WHERE TAG = {tag} AND ROWNUM = 1;
  SELECT MAX(ACTIVATION_TIME) INTO newest FROM V$ENCRYPTION_KEYS;
  IF activated IS NULL THEN
    EXECUTE IMMEDIATE {use_key};
  ELSIF activated < newest THEN
    RAISE_APPLICATION_ERROR(-20403, 'rotation tag belongs to an earlier rotation');
  END IF;",
                    tag = literal(tag)
                ),
            )]
        }
        CommandName::RetireOldKey => {
            let tag = arg(command, "rotation_tag")?;
            match keystore_kind(command) {
                KeystoreKind::Local => vec![format!(
                    "ADMINISTER KEY MANAGEMENT BACKUP KEYSTORE USING {} FORCE KEYSTORE IDENTIFIED BY \"{}\";",
                    literal(&format!("{tag}-retired")),
                    secret(arg(command, "activation_secret_ref")?)
                )],
                // Retired HSM keys stay on the key-management platform; confirm
                // that the tagged key is the one now in use.
                KeystoreKind::Hsm => vec![plsql(
                    "  newest VARCHAR2(200);",
                    &format!(
                        "  SELECT TAG INTO newest FROM (SELECT TAG FROM V$ENCRYPTION_KEYS ORDER BY ACTIVATION_TIME DESC NULLS LAST) WHERE ROWNUM = 1;
  IF newest IS NULL OR newest != {} THEN
    RAISE_APPLICATION_ERROR(-20402, 'rotated key is not the active key');
  END IF;",
                        literal(tag)
                    ),
                )],
            }
        }
        CommandName::RemoveKeystore => {
            let mut statements = vec![tolerating(
                "ADMINISTER KEY MANAGEMENT SET KEYSTORE CLOSE",
                &[NOT_OPEN],
            )];
            if let Some(location) = command.args.get("keystore_location") {
                statements.push(format!(
                    "CREATE OR REPLACE DIRECTORY {KEYSTORE_DIRECTORY} AS {};",
                    literal(location)
                ));
                for file in ["cwallet.sso", "ewallet.p12"] {
                    statements.push(tolerating_block(
                        &format!("UTL_FILE.FREMOVE('{KEYSTORE_DIRECTORY}', '{file}');"),
                        &[FILE_MISSING],
                    ));
                }
                statements.push(format!("DROP DIRECTORY {KEYSTORE_DIRECTORY};"));
            }
            statements
                .push("ALTER SYSTEM RESET TDE_CONFIGURATION SCOPE = SPFILE;".to_string());
            statements
        }
    };
    Ok(AdminScript::command(command.name, statements.join("\n")))
}

fn arg<'a>(command: &'a StepCommand, key: &str) -> Result<&'a str, WalletError> {
    command
        .args
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| WalletError::InvalidRequest {
            reason: format!("{} requires parameter {key}", command.name),
        })
}

fn keystore_kind(command: &StepCommand) -> KeystoreKind {
    match command.args.get("keystore_kind").map(String::as_str) {
        Some("hsm") => KeystoreKind::Hsm,
        _ => KeystoreKind::Local,
    }
}

fn backup_clause(command: &StepCommand, tag: &str) -> String {
    match keystore_kind(command) {
        KeystoreKind::Local => format!(" WITH BACKUP USING {}", literal(tag)),
        KeystoreKind::Hsm => String::new(),
    }
}

fn secret(reference: &str) -> String {
    format!("{{secret:{reference}}}")
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn open_password_keystore(password: &str) -> String {
    tolerating(
        &format!("ADMINISTER KEY MANAGEMENT SET KEYSTORE OPEN IDENTIFIED BY \"{password}\""),
        &[ALREADY_OPEN],
    )
}

/// Anonymous PL/SQL block terminated for SQL*Plus.
fn plsql(declarations: &str, body: &str) -> String {
    format!("DECLARE\n{declarations}\nBEGIN\n{body}\nEND;\n/")
}

/// Wrap a statement so the listed ORA codes count as success.
fn tolerating(statement: &str, codes: &[u32]) -> String {
    tolerating_block(
        &format!("EXECUTE IMMEDIATE {};", quote_literal(statement)),
        codes,
    )
}

fn tolerating_block(body: &str, codes: &[u32]) -> String {
    guarded_block(body, codes, None)
}

/// Run `body`; the listed ORA codes run `recovery` instead of failing.
fn guarded_block(body: &str, codes: &[u32], recovery: Option<&str>) -> String {
    let condition = codes
        .iter()
        .map(|code| format!("SQLCODE != -{code}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let mut lines = vec![
        "BEGIN".to_string(),
        format!("  {body}"),
        "EXCEPTION".to_string(),
        "  WHEN OTHERS THEN".to_string(),
        format!("    IF {condition} THEN"),
        "      RAISE;".to_string(),
        "    END IF;".to_string(),
    ];
    if let Some(recovery) = recovery {
        lines.push(format!("    {recovery}"));
    }
    lines.push("END;".to_string());
    lines.push("/".to_string());
    lines.join("\n")
}

/// Rows become `WRL_TYPE:STATUS:WALLET_TYPE`, uppercased, sorted, `;`-joined.
pub(super) fn normalize_status(raw: &str) -> String {
    let mut rows: Vec<String> = raw
        .lines()
        .map(|line| line.trim().to_ascii_uppercase())
        .filter(|line| line.matches(':').count() == 2 && !line.contains(' '))
        .collect();
    rows.sort();
    rows.dedup();
    rows.join(";")
}

pub(super) fn default_status_rules() -> Vec<StatusRule> {
    [
        (r"(^|;)[A-Z]+:UNDEFINED:[A-Z_]+($|;)", WalletState::Error),
        (
            r"^FILE:OPEN:(LOCAL_)?AUTOLOGIN;HSM:OPEN:HSM$",
            WalletState::AutoLoginHsm,
        ),
        (
            r"^FILE:[A-Z_]+:[A-Z_]+;HSM:[A-Z_]+:[A-Z_]+$",
            WalletState::PartiallyMigrated,
        ),
        (r"^FILE:NOT_AVAILABLE:[A-Z_]+$", WalletState::Absent),
        (
            r"^FILE:(CLOSED|OPEN_NO_MASTER_KEY):[A-Z_]+$",
            WalletState::Closed,
        ),
        (r"^FILE:OPEN:PASSWORD$", WalletState::OpenNoAutoLogin),
        (
            r"^FILE:OPEN:(LOCAL_)?AUTOLOGIN$",
            WalletState::AutoLoginLocal,
        ),
    ]
    .into_iter()
    .map(|(pattern, state)| StatusRule {
        pattern: pattern.to_string(),
        state,
    })
    .collect()
}

pub(super) fn default_failure_codes() -> FailureCodes {
    let codes = |list: &[&str]| -> Vec<String> { list.iter().map(|code| code.to_string()).collect() };
    FailureCodes {
        credential: codes(&["ORA-01017", "ORA-01031", "ORA-28353", "ORA-28417"]),
        transient: codes(&["ORA-00051", "ORA-00054", "ORA-00060", "ORA-04021", "ORA-12170"]),
        connection: codes(&[
            "ORA-03113",
            "ORA-03114",
            "ORA-12514",
            "ORA-12537",
            "ORA-12541",
            "ORA-12543",
            "SP2-0640",
        ]),
    }
}

/// Parse `KEY_ID|KEYSTORE_TYPE|STATUS|CREATED` rows from the key probe.
pub(super) fn parse_keys(raw: &str) -> Result<Vec<MasterKeyEntry>, WalletError> {
    let mut keys = Vec::new();
    let mut unparsed = Vec::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        let [key_id, keystore, status, created_at] = fields.as_slice() else {
            unparsed.push(line);
            continue;
        };
        let status = match status.to_ascii_uppercase().as_str() {
            "ACTIVE" => KeyStatus::Active,
            "INACTIVE" => KeyStatus::Inactive,
            "PENDING" => KeyStatus::Pending,
            _ => {
                return Err(WalletError::UnknownState {
                    status: format!("master key {key_id} has status {status}"),
                })
            }
        };
        let keystore = if keystore.to_ascii_uppercase().contains("HSM") {
            KeystoreKind::Hsm
        } else {
            KeystoreKind::Local
        };
        keys.push(MasterKeyEntry {
            key_id: key_id.to_string(),
            keystore,
            status,
            created_at: created_at.to_string(),
        });
    }
    if keys.is_empty() && !unparsed.is_empty() {
        return Err(WalletError::UnknownState {
            status: format!("unrecognized key listing: {}", unparsed.join(" / ")),
        });
    }
    Ok(keys)
}
