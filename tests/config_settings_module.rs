use std::fs;
use taskrelay::config::{load_settings, ConfigError, Settings};

#[test]
fn partial_yaml_fills_defaults_and_resolves_queue_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    let state_root = temp.path().join("state");
    fs::write(
        &path,
        format!(
            r#"
state_root: {}
bridge:
  poll_interval_ms: 25
confirmation:
  always_confirm: true
  destructive_markers: [wipe]
budget:
  token_budget: 5000
"#,
            state_root.display()
        ),
    )
    .expect("write config");

    let settings = load_settings(&path).expect("load settings");
    assert_eq!(settings.bridge.poll_interval_ms, 25);
    assert_eq!(settings.bridge.default_timeout_ms, Settings::default().bridge.default_timeout_ms);
    assert!(settings.confirmation.always_confirm);
    assert_eq!(settings.confirmation.destructive_markers, vec!["wipe"]);
    assert_eq!(settings.confirmation.ttl_ms, 600_000);
    assert_eq!(settings.budget.token_budget, 5000);
    assert_eq!(settings.queue_root(), state_root.join("bridge"));
}

#[test]
fn invalid_values_are_rejected_with_field_names() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    fs::write(
        &path,
        format!(
            "state_root: {}\nbridge:\n  poll_interval_ms: 0\n",
            temp.path().display()
        ),
    )
    .expect("write config");

    let err = load_settings(&path).expect_err("zero poll interval");
    assert!(matches!(err, ConfigError::Settings(_)));
    assert!(err.to_string().contains("bridge.poll_interval_ms"));
}

#[test]
fn malformed_yaml_reports_the_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    fs::write(&path, "bridge: [unclosed").expect("write config");

    let err = load_settings(&path).expect_err("bad yaml");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("config.yaml"));

    let missing = load_settings(&temp.path().join("absent.yaml")).expect_err("missing file");
    assert!(matches!(missing, ConfigError::Read { .. }));
}
