//! Protocol configuration
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `MOCA__SECTION__KEY` environment variables
//!    (`MOCA__VOTING__UNCLAIMED_DELAY_EPOCHS=4`)

use crate::error::{NodeError, NodeResult};
use config::{Config, Environment, File, FileFormat};
use moca_core::AddressBook;
use moca_escrow::EscrowParams;
use moca_voting::VotingParams;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete protocol configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Treasury and vault addresses
    #[serde(default)]
    pub addresses: AddressBook,

    /// Escrow parameters
    #[serde(default)]
    pub escrow: EscrowParams,

    /// Settlement parameters
    #[serde(default)]
    pub voting: VotingParams,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: LogFormat::default() }
    }
}

impl ProtocolConfig {
    /// Layer `path` (if any) and the environment over the defaults
    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("MOCA")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let config: ProtocolConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> NodeResult<Self> {
        let config: ProtocolConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> NodeResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> NodeResult<()> {
        self.escrow.validate()?;
        self.voting.validate()?;

        let named = [
            ("treasury", &self.addresses.treasury),
            ("escrow_vault", &self.addresses.escrow_vault),
            ("voting_vault", &self.addresses.voting_vault),
        ];
        for (name, address) in named {
            if address.is_zero() {
                return Err(NodeError::InvalidConfig(format!("addresses.{} is the zero address", name)));
            }
        }
        if self.addresses.escrow_vault == self.addresses.voting_vault {
            return Err(NodeError::InvalidConfig("escrow and voting vaults must differ".into()));
        }
        if self.logging.level.trim().is_empty() {
            return Err(NodeError::InvalidConfig("logging.level is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moca_core::{Address, ONE_MOCA};

    #[test]
    fn test_default_config_is_valid() {
        ProtocolConfig::default().validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip_keeps_large_amounts() {
        let config = ProtocolConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[voting]"));
        assert!(rendered.contains("100000000000000000000"));

        let parsed = ProtocolConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.voting.delegate_registration_fee, 100 * ONE_MOCA);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed = ProtocolConfig::from_toml(
            r#"
            [escrow]
            max_penalty_pct = 2500

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.escrow.max_penalty_pct, 2_500);
        assert_eq!(parsed.logging.format, LogFormat::Json);
        assert_eq!(parsed.voting, VotingParams::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = ProtocolConfig::default();
        config.voting.max_delegate_fee_pct = 20_000;
        assert!(matches!(config.validate(), Err(NodeError::Protocol(_))));

        let mut config = ProtocolConfig::default();
        config.addresses.treasury = Address::ZERO;
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }
}
