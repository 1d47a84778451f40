//! Configuration loading from files and environment overlays

use std::io::Write;

use strata_core::{FailoverConfig, ReconfigurationConfig, StrataConfig};

// =============================================================================
// File formats
// =============================================================================

#[test]
fn toml_file_overrides_selected_fields() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "fm_message_retry_interval_ms = 12000\nsort_upgrade_domain_names_as_numbers = false"
    )
    .unwrap();

    let config = FailoverConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.fm_message_retry_interval_ms, 12_000);
    assert!(!config.sort_upgrade_domain_names_as_numbers);
    assert_eq!(config.store_retry_interval_ms, 1_000);
    assert!(config.validate().is_ok());
}

#[test]
fn json_file_is_detected_by_extension() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, r#"{{"fabric_upgrade_upgrade_retry_interval_ms": 750}}"#).unwrap();

    let config = ReconfigurationConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.fabric_upgrade_upgrade_retry_interval_ms, 750);
    assert_eq!(config.fabric_upgrade_download_retry_interval_ms, 5_000);
}

#[test]
fn unsupported_extension_is_rejected() {
    let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    assert!(FailoverConfig::load_from_file(file.path()).is_err());
}

// =============================================================================
// Layering
// =============================================================================

#[test]
fn file_then_env_layering() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "periodic_state_scan_interval_ms = 1000").unwrap();

    let mut config = FailoverConfig::default();
    let from_file = FailoverConfig::load_from_file(file.path()).unwrap();
    config.merge_with(&from_file);
    config
        .merge_with_vars(vec![(
            "STRATA_FM_PERIODIC_STATE_SCAN_INTERVAL_MS".to_string(),
            "2000".to_string(),
        )])
        .unwrap();

    assert_eq!(config.periodic_state_scan_interval_ms, 2_000);
}

#[test]
fn ra_prefix_does_not_leak_into_fm() {
    let mut config = FailoverConfig::default();
    config
        .merge_with_vars(vec![(
            "STRATA_RA_FABRIC_UPGRADE_DOWNLOAD_RETRY_INTERVAL_MS".to_string(),
            "1".to_string(),
        )])
        .unwrap();
    assert_eq!(config, FailoverConfig::default());
}
