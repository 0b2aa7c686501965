#![allow(clippy::field_reassign_with_default)]
//! Config load/save round-trips against isolated temp directories.
//!
//! Fields that `apply_env_overrides` can touch (token, host, port, secret,
//! workspace) are not asserted here so the suite is stable on machines that
//! export `DUOCAST_*` variables.

use duocast::config::{Config, CoordinatorConfig, TimersConfig};
use std::fs;
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn coordinator_defaults_give_a_twelve_second_window() {
    let coordinator = CoordinatorConfig::default();
    assert_eq!(coordinator.wait_window_secs, 12);
    assert!(coordinator.stale_snapshot_secs > coordinator.wait_window_secs);
}

#[test]
fn timer_defaults_poll_every_second() {
    let timers = TimersConfig::default();
    assert_eq!(timers.poll_interval_ms, 1000);
    assert_eq!(timers.max_concurrent, 4);
}

#[test]
fn default_config_validates() {
    assert!(Config::default().validate().is_ok());
}

// ─────────────────────────────────────────────────────────────────────────────
// First run and reload
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_run_writes_config_and_creates_workspace() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("duocast");

    let config = Config::load_or_init_at(&dir).await.unwrap();

    assert_eq!(config.config_path, dir.join("config.toml"));
    assert!(config.config_path.exists(), "config.toml should be created");
    let contents = fs::read_to_string(&config.config_path).unwrap();
    assert!(contents.contains("[coordinator]"));
    assert!(contents.contains("wait_window_secs = 12"));
}

#[cfg(unix)]
#[tokio::test]
async fn first_run_restricts_config_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let config = Config::load_or_init_at(tmp.path()).await.unwrap();
    let mode = fs::metadata(&config.config_path)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o077, 0, "config should not be group/world accessible");
}

#[tokio::test]
async fn saved_changes_survive_reload() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::load_or_init_at(tmp.path()).await.unwrap();

    config.coordinator.wait_window_secs = 20;
    config.timers.max_concurrent = 8;
    config.composer.live_template = "{name} went live: {title}".into();
    config.save().await.unwrap();

    let reloaded = Config::load_or_init_at(tmp.path()).await.unwrap();
    assert_eq!(reloaded.coordinator.wait_window_secs, 20);
    assert_eq!(reloaded.timers.max_concurrent, 8);
    assert_eq!(reloaded.composer.live_template, "{name} went live: {title}");
}

#[tokio::test]
async fn save_leaves_no_temp_or_backup_files() {
    let tmp = TempDir::new().unwrap();
    let config = Config::load_or_init_at(tmp.path()).await.unwrap();
    config.save().await.unwrap();
    config.save().await.unwrap();

    let leftovers: Vec<String> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp-") || name.ends_with(".bak"))
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
}

#[tokio::test]
async fn hand_edited_partial_config_loads_with_defaults() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("config.toml"),
        "[coordinator]\nwait_window_secs = 30\n",
    )
    .unwrap();

    let config = Config::load_or_init_at(tmp.path()).await.unwrap();
    assert_eq!(config.coordinator.wait_window_secs, 30);
    assert_eq!(config.timers.poll_interval_ms, 1000);
    assert_eq!(config.composer.offline_template, "{name} is now offline.");
}

#[tokio::test]
async fn invalid_config_is_rejected_on_load() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("config.toml"),
        "[coordinator]\nwait_window_secs = 0\n",
    )
    .unwrap();

    let err = Config::load_or_init_at(tmp.path()).await.unwrap_err();
    assert!(err.to_string().contains("wait_window_secs"));
}

#[tokio::test]
async fn malformed_toml_reports_parse_failure() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("config.toml"), "[coordinator\n").unwrap();

    let err = Config::load_or_init_at(tmp.path()).await.unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}

#[tokio::test]
async fn state_db_lives_under_the_workspace() {
    let tmp = TempDir::new().unwrap();
    let config = Config::load_or_init_at(tmp.path()).await.unwrap();
    assert!(config.state_db_path().starts_with(&config.workspace_dir));
    assert_eq!(
        config.state_db_path().file_name().unwrap(),
        "duocast.db"
    );
}
