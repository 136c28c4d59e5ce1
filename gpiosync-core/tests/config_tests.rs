//! Config error-message, validation, atomic-write-safety, and init integration tests.

use std::fs;

use gpiosync_core::{
    config::{self, AgentConfig, GpioBackend},
    types::PinId,
    ConfigError,
};
use rstest::rstest;
use tempfile::TempDir;

fn device() -> AgentConfig {
    let mut cfg = AgentConfig::new("esp32_02");
    cfg.pins = vec![PinId(2)];
    cfg
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let home = TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ConfigNotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
    assert!(err.to_string().contains("gpiosync init"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = TempDir::new().expect("tempdir");
    let root = config::agent_root_at(home.path());
    fs::create_dir_all(&root).expect("mkdir");
    fs::write(
        root.join("config.yaml"),
        b": : corrupt : yaml : !!!\n  - broken: [unclosed",
    )
    .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_rejects_semantically_invalid_config() {
    let home = TempDir::new().expect("tempdir");
    let root = config::agent_root_at(home.path());
    fs::create_dir_all(&root).expect("mkdir");
    fs::write(
        root.join("config.yaml"),
        "version: 1\ndevice_id: esp32_02\npins: [34]\n",
    )
    .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    assert!(err.to_string().contains("pin 34"));
}

// ---------------------------------------------------------------------------
// 2. Validation table
// ---------------------------------------------------------------------------

#[rstest]
#[case::empty_device_id(|c: &mut AgentConfig| c.device_id.clear())]
#[case::slash_in_device_id(|c: &mut AgentConfig| c.device_id = "a/b".into())]
#[case::wildcard_in_device_id(|c: &mut AgentConfig| c.device_id = "dev+".into())]
#[case::hash_in_device_id(|c: &mut AgentConfig| c.device_id = "dev#".into())]
#[case::zero_heartbeat(|c: &mut AgentConfig| c.heartbeat_interval_ms = 0)]
#[case::heartbeat_past_a_day(|c: &mut AgentConfig| c.heartbeat_interval_ms = config::MAX_HEARTBEAT_INTERVAL_MS + 1)]
#[case::overflowing_heartbeat(|c: &mut AgentConfig| c.heartbeat_interval_ms = u64::MAX)]
#[case::empty_namespace(|c: &mut AgentConfig| c.storage.namespace.clear())]
#[case::flash_pin(|c: &mut AgentConfig| c.pins.push(PinId(6)))]
#[case::enabled_link_without_host(|c: &mut AgentConfig| c.local.enabled = true)]
fn validation_rejects(#[case] mutate: fn(&mut AgentConfig)) {
    let mut cfg = device();
    mutate(&mut cfg);
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn heartbeat_bound_is_inclusive() {
    let mut cfg = device();
    cfg.heartbeat_interval_ms = config::MAX_HEARTBEAT_INTERVAL_MS;
    cfg.validate().expect("one day is allowed");
}

#[test]
fn load_rejects_overflowing_heartbeat() {
    let home = TempDir::new().expect("tempdir");
    let path = config::config_path_at(home.path());
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(
        &path,
        "version: 1\ndevice_id: esp32_02\nheartbeat_interval_ms: 18446744073709551615\n",
    )
    .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(err.to_string().contains("heartbeat_interval_ms"), "got: {err}");
}

#[test]
fn validation_accepts_custom_output_set() {
    let mut cfg = device();
    cfg.gpio.valid_outputs = [PinId(17), PinId(27)].into_iter().collect();
    cfg.pins = vec![PinId(17), PinId(27)];
    cfg.gpio.backend = GpioBackend::Simulated;
    cfg.validate().expect("valid");
}

// ---------------------------------------------------------------------------
// 3. Atomic write safety + init
// ---------------------------------------------------------------------------

#[test]
fn save_cleans_up_tmp_file_and_roundtrips() {
    let home = TempDir::new().expect("tempdir");
    let mut cfg = device();
    cfg.cloud.enabled = true;
    cfg.cloud.host = "broker.example.com".into();
    cfg.cloud.ca_file = Some("/etc/gpiosync/ca.pem".into());

    config::save_at(home.path(), &cfg).expect("save");

    let path = config::config_path_at(home.path());
    assert!(!path.with_file_name("config.yaml.tmp").exists());
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, cfg);
}

#[cfg(unix)]
#[test]
fn save_sets_owner_only_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let home = TempDir::new().expect("tempdir");
    config::save_at(home.path(), &device()).expect("save");
    let mode = fs::metadata(config::config_path_at(home.path()))
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("tempdir");
    let first = config::init_at(home.path(), device()).expect("init");

    let other = AgentConfig::new("esp32_99");
    let second = config::init_at(home.path(), other).expect("init again");
    assert_eq!(second.device_id, first.device_id);
    assert_eq!(second.pins, vec![PinId(2)]);
}

#[test]
fn init_rejects_invalid_config_without_writing() {
    let home = TempDir::new().expect("tempdir");
    let err = config::init_at(home.path(), AgentConfig::new("")).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert!(!config::config_path_at(home.path()).exists());
}
