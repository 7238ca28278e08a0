//! Node-level errors

use moca_core::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("toml encoding: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("state encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("telemetry: {0}")]
    Telemetry(String),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;
