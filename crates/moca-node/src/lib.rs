//! # Moca Node
//!
//! Hosts the escrow and settlement components behind a single
//! transactional facade.
//!
//! - `protocol` - `Protocol`, the atomic entry points and state root
//! - `config` - layered configuration
//! - `telemetry` - tracing subscriber setup

pub mod config;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use config::{LogFormat, LoggingConfig, ProtocolConfig};
pub use error::{NodeError, NodeResult};
pub use protocol::{Component, Protocol, ProtocolState};
