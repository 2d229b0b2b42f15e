use std::io::Write;

use strata_core::config::AppConfig;
use strata_core::types::NodeErrorKind;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_parallel_nodes = 6
default_role_limit = 2
event_capacity = 512

[engine.role_instance_limits]
implementation = 3
security_audit = 1

[workspace]
root = "/tmp/strata-sessions"
workflows_dir = "/tmp/strata-workflows"

[vcs]
enabled = true
repo_dir = "/tmp/repo"

[session]
env = { CI = "1" }

[commands]
test_design = "make test-design NODE={nodeId}"
implementation = "make impl ITEM={workItemId}"

[failure_kinds]
test_design = "TEST_FAILURE"
implementation = "BUILD_FAILURE"

[log]
log_dir = "/tmp/strata-logs"

[journal]
path = "/tmp/strata-journal.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel_nodes, 6);
    assert_eq!(config.engine.event_capacity, 512);
    let concurrency = config.concurrency();
    assert_eq!(concurrency.limit_for("implementation"), 3);
    assert_eq!(concurrency.limit_for("security_audit"), 1);
    assert_eq!(concurrency.limit_for("code_review"), 2);

    assert_eq!(config.workspace_root().to_str(), Some("/tmp/strata-sessions"));
    assert_eq!(config.workflows_dir().to_str(), Some("/tmp/strata-workflows"));
    assert!(config.vcs.enabled);
    assert_eq!(config.session.env.get("CI").map(String::as_str), Some("1"));
    assert_eq!(config.commands.len(), 2);
    assert_eq!(config.failure_kinds.get("test_design"), Some(&NodeErrorKind::TestFailure));

    assert_eq!(config.log_dir().unwrap().to_str(), Some("/tmp/strata-logs"));
    assert_eq!(config.journal_path().unwrap().to_str(), Some("/tmp/strata-journal.db"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STRATA_TEST_REPO_DIR", "/srv/checkout");

    let toml_content = r#"
[vcs]
enabled = true
repo_dir = "${STRATA_TEST_REPO_DIR}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.vcs.repo_dir, "/srv/checkout");

    std::env::remove_var("STRATA_TEST_REPO_DIR");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel_nodes, 4);
    assert_eq!(config.engine.default_role_limit, 1);
    assert_eq!(config.engine.event_capacity, 256);
    assert!(!config.vcs.enabled);
    assert!(config.commands.is_empty());
    assert!(config.log_dir().is_none());
    assert!(config.journal_path().is_none());
}

#[test]
fn test_zero_limits_are_clamped() {
    let config = AppConfig::from_toml_str(
        r#"
[engine]
max_parallel_nodes = 0
[engine.role_instance_limits]
implementation = 0
"#,
    )
    .expect("parse config");

    let concurrency = config.concurrency();
    assert_eq!(concurrency.max_parallel_nodes, 1);
    assert_eq!(concurrency.limit_for("implementation"), 1);
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/strata.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_disabled_sections_turn_features_off() {
    let config = AppConfig::from_toml_str(
        r#"
[log]
enabled = false

[journal]
enabled = false
"#,
    )
    .expect("parse config");
    assert!(config.log_dir().is_none());
    assert!(config.journal_path().is_none());
}
