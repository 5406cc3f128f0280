use std::io::Write;

use tasker_deploy::config::{ConfigManager, ConfigurationError, DeployConfig};
use tempfile::NamedTempFile;
use uuid::Uuid;

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_apply_without_a_file() {
    let manager = ConfigManager::load_from_file_with_env(None, "test").unwrap();
    let config = manager.config();

    assert_eq!(manager.environment(), "test");
    assert!(manager.config_file().is_none());
    assert_eq!(config.database.max_connections, 20);
    assert_eq!(config.graph_cache.freshness_window_ms, 5_000);
    assert_eq!(config.graph_cache.invalidated_tree_ttl().num_seconds(), 60);
    assert_eq!(config.pipeline.estimate_sample_size, 5);
    assert!(!config.admission.save_rejected_by_freeze);
}

#[test]
fn file_values_override_defaults() {
    let file = toml_file(
        r#"
[admission]
save_rejected_by_freeze = true

[graph_cache]
freshness_window_ms = 250

[interrupts]
cascade_retry_attempts = 5

[approvals]
execution_url_base = "https://cd.example.com/"
"#,
    );

    let manager = ConfigManager::load_from_file_with_env(Some(file.path()), "test").unwrap();
    let config = manager.config();

    assert_eq!(manager.config_file(), Some(file.path()));
    assert!(config.admission.save_rejected_by_freeze);
    assert_eq!(config.graph_cache.freshness_window().num_milliseconds(), 250);
    assert_eq!(config.interrupts.cascade_retry_attempts, 5);
    // Untouched sections keep their defaults
    assert_eq!(config.database.max_connections, 20);

    let execution = Uuid::nil();
    assert_eq!(
        config.approvals.execution_url("app-1", execution),
        format!("https://cd.example.com/#/app/app-1/deployments/{execution}/details")
    );
}

#[test]
fn invalid_values_are_rejected() {
    for contents in [
        "[database]\nmax_connections = 0\n",
        "[database]\nmax_connections = 2\nmin_connections = 5\n",
        "[pipeline]\nestimate_sample_size = 0\n",
        "[interrupts]\ncascade_channel_capacity = 0\n",
    ] {
        let file = toml_file(contents);
        let err = ConfigManager::load_from_file_with_env(Some(file.path()), "test").unwrap_err();
        assert!(
            matches!(err, ConfigurationError::InvalidValue { .. }),
            "accepted {contents:?}: {err}"
        );
    }
}

#[test]
fn prebuilt_configs_are_validated() {
    let mut config = DeployConfig::default();
    config.events.channel_capacity = 0;
    let err = ConfigManager::from_config(config).unwrap_err();
    assert!(err.to_string().contains("events.channel_capacity"));
}

#[test]
fn bundled_config_file_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/deploy.toml");
    let manager = ConfigManager::load_from_file_with_env(Some(&path), "test").unwrap();
    assert_eq!(manager.config(), &DeployConfig::default());
}
