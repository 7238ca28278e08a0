//! Layered configuration loading: defaults, TOML file, environment

use moca_core::{Address, ONE_MOCA};
use moca_node::{LogFormat, NodeError, ProtocolConfig};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_file_then_environment_layering() {
    let treasury = Address::from_label("ops-treasury");
    let file = write_config(&format!(
        r#"
[addresses]
treasury = "{}"

[voting]
start_epoch = 42
delegate_registration_fee = "250000000000000000000"

[logging]
level = "moca_voting=debug"
format = "json"
"#,
        treasury.to_hex()
    ));

    let from_file = ProtocolConfig::load(Some(file.path())).unwrap();
    assert_eq!(from_file.addresses.treasury, treasury);
    assert_eq!(from_file.voting.start_epoch, 42);
    assert_eq!(from_file.voting.delegate_registration_fee, 250 * ONE_MOCA);
    assert_eq!(from_file.voting.unclaimed_delay_epochs, ProtocolConfig::default().voting.unclaimed_delay_epochs);
    assert_eq!(from_file.logging.format, LogFormat::Json);

    std::env::set_var("MOCA__VOTING__UNCLAIMED_DELAY_EPOCHS", "9");
    let layered = ProtocolConfig::load(Some(file.path()));
    std::env::remove_var("MOCA__VOTING__UNCLAIMED_DELAY_EPOCHS");

    let layered = layered.unwrap();
    assert_eq!(layered.voting.unclaimed_delay_epochs, 9);
    assert_eq!(layered.voting.start_epoch, 42);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("moca.toml");
    assert!(matches!(ProtocolConfig::load(Some(&missing)), Err(NodeError::Config(_))));
}

#[test]
fn test_invalid_values_are_rejected_after_merge() {
    let file = write_config(
        r#"
[escrow]
max_penalty_pct = 20000
"#,
    );
    assert!(ProtocolConfig::load(Some(file.path())).is_err());
}
