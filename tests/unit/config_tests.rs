//! Unit tests for configuration parsing, defaults, and validation.

use forkbench::{AppError, GlobalConfig};

#[test]
fn empty_toml_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("parse empty config");
    assert_eq!(config.data_dir.to_string_lossy(), ".forkbench");
    assert_eq!(config.fork.binary, "anvil");
    assert_eq!(config.fork.port_range_start, 8600);
    assert_eq!(config.fork.port_range_end, 8699);
    assert_eq!(config.fork.ready_attempts, 30);
    assert_eq!(config.fork.ready_interval_ms, 500);
    assert_eq!(config.fork.grace_period_ms, 5000);
    assert_eq!(config.snapshots.keep_last, 50);
    assert_eq!(config.checkpoints.interval, 5);
    assert_eq!(config.checkpoints.max_checkpoints, 3);
    assert!(config.networks.is_empty());
}

#[test]
fn full_toml_parses() {
    let raw = r#"
        data_dir = "/tmp/bench"

        [fork]
        binary = "anvil-nightly"
        extra_args = ["--silent"]
        port_range_start = 9000
        port_range_end = 9010

        [snapshots]
        keep_last = 10

        [checkpoints]
        interval = 3
        max_checkpoints = 2

        [networks.mainnet]
        upstream_url = "https://rpc.example.org"
        chain_id = 1
        default_block = 19000000
    "#;
    let config = GlobalConfig::from_toml_str(raw).expect("parse full config");
    assert_eq!(config.fork.binary, "anvil-nightly");
    assert_eq!(config.fork.extra_args, vec!["--silent".to_owned()]);
    assert_eq!(config.checkpoints.interval, 3);

    let net = config.network("mainnet").expect("mainnet configured");
    assert_eq!(net.chain_id, 1);
    assert_eq!(net.default_block, Some(19_000_000));
}

#[test]
fn inverted_port_range_is_rejected() {
    let raw = "[fork]\nport_range_start = 9010\nport_range_end = 9000\n";
    let result = GlobalConfig::from_toml_str(raw);
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_checkpoint_interval_is_rejected() {
    let raw = "[checkpoints]\ninterval = 0\n";
    let result = GlobalConfig::from_toml_str(raw);
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_max_checkpoints_is_rejected() {
    let raw = "[checkpoints]\nmax_checkpoints = 0\n";
    let result = GlobalConfig::from_toml_str(raw);
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_ready_attempts_is_rejected() {
    let raw = "[fork]\nready_attempts = 0\n";
    let result = GlobalConfig::from_toml_str(raw);
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn unknown_network_lookup_is_a_validation_error() {
    let config = GlobalConfig::from_toml_str("").expect("parse");
    let result = config.network("sepolia");
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let result = GlobalConfig::from_toml_str("data_dir = [not toml");
    assert!(matches!(result, Err(AppError::Config(_))));
}
