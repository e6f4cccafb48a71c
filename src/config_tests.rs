use super::*;
use tempfile::tempdir;

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directory");
    }
    std::fs::write(path, contents.as_bytes()).expect("write file");
}

const MINIMAL: &str = r#"{
  "schema_version": 1,
  "targets": {
    "prod": {
      "db_type": "oracle",
      "host": "db1",
      "keystore": { "location": "/u01/wallet", "password_ref": "env:TDE_PW" }
    }
  }
}"#;

#[test]
fn minimal_config_takes_defaults() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    write_file(&path, MINIMAL);

    let config = load_config(&path).expect("load config");
    assert_eq!(config.step_timeout_secs, 300);
    assert_eq!(config.retry, RetryConfig::default());
    let profile = config.target("prod").expect("target");
    assert_eq!(profile.port, 1521);
    assert_eq!(
        profile.keystore.as_params().get("password_ref").map(String::as_str),
        Some("env:TDE_PW")
    );
    assert!(!profile.keystore.as_params().contains_key("hsm_secret_ref"));
}

#[test]
fn unknown_target_is_a_configuration_error() {
    let config = default_config();
    let err = config.target("missing").unwrap_err();
    assert!(matches!(err, WalletError::Configuration { .. }));
}

#[test]
fn stub_round_trips_through_init() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("config.json");
    write_config(&path, &default_config(), false).expect("write stub");
    let loaded = load_config(&path).expect("load stub");
    assert_eq!(loaded, default_config());

    let err = write_config(&path, &default_config(), false).unwrap_err();
    assert!(err.to_string().contains("already exists"));
    write_config(&path, &default_config(), true).expect("overwrite with force");
}

#[test]
fn raw_secrets_are_rejected() {
    let mut config = default_config();
    if let Some(profile) = config.targets.get_mut("primary") {
        profile.keystore.password_ref = Some("hunter2".to_string());
    }
    let err = validate_config(&config).unwrap_err();
    assert!(err.to_string().contains("keystore.password_ref"));
}

#[test]
fn attempt_ceiling_is_bounded() {
    let mut config = default_config();
    config.retry.max_attempts = 0;
    assert!(validate_config(&config).is_err());
    config.retry.max_attempts = 11;
    assert!(validate_config(&config).is_err());
    config.retry.max_attempts = 10;
    assert!(validate_config(&config).is_ok());
}

#[test]
fn bad_status_rule_pattern_is_rejected() {
    let mut config = default_config();
    config.status_rules = Some(vec![StatusRule {
        pattern: "FILE:(OPEN".to_string(),
        state: crate::wallet::WalletState::Closed,
    }]);
    let err = validate_config(&config).unwrap_err();
    assert!(format!("{err:#}").contains("compile status rule"));
}

#[test]
fn unknown_fields_fail_to_parse() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.json");
    write_file(&path, &MINIMAL.replace("\"host\"", "\"hostname\""));
    let err = load_config(&path).unwrap_err();
    assert!(format!("{err:#}").contains("parse config JSON"));
}

#[test]
fn explicit_flag_wins_path_resolution() {
    let flag = Path::new("/etc/tdew.json");
    assert_eq!(resolve_config_path(Some(flag)).expect("resolve"), flag);
}

#[test]
fn engines_are_counted_for_startup_logging() {
    let mut config = default_config();
    let mut mysql = config.targets["primary"].clone();
    mysql.db_type = DatabaseType::MySql;
    config.targets.insert("reporting".to_string(), mysql);
    let counts = config.targets_by_engine();
    assert_eq!(counts.get(&DatabaseType::Oracle), Some(&1));
    assert_eq!(counts.get(&DatabaseType::MySql), Some(&1));
}
