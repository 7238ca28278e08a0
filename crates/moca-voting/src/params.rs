//! Settlement parameters

use moca_core::{ProtocolError, Result, ONE_MOCA, PRECISION_BASE};
use serde::{Deserialize, Serialize};

fn default_max_delegate_fee_pct() -> u128 {
    5_000
}

fn default_fee_increase_delay_epochs() -> u64 {
    2
}

fn default_unclaimed_delay_epochs() -> u64 {
    6
}

fn default_delegate_registration_fee() -> u128 {
    100 * ONE_MOCA
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingParams {
    /// Highest fee a delegate may charge, in basis points
    #[serde(default = "default_max_delegate_fee_pct", with = "moca_core::amount")]
    pub max_delegate_fee_pct: u128,

    /// Epochs before a fee increase takes effect
    #[serde(default = "default_fee_increase_delay_epochs")]
    pub fee_increase_delay_epochs: u64,

    /// Epochs after which unclaimed rewards and subsidies may be swept
    #[serde(default = "default_unclaimed_delay_epochs")]
    pub unclaimed_delay_epochs: u64,

    /// Native MOCA paid to register as a delegate
    #[serde(default = "default_delegate_registration_fee", with = "moca_core::amount")]
    pub delegate_registration_fee: u128,

    /// First epoch settled by this controller; earlier epochs count as finalized
    #[serde(default)]
    pub start_epoch: u64,
}

impl Default for VotingParams {
    fn default() -> Self {
        Self {
            max_delegate_fee_pct: default_max_delegate_fee_pct(),
            fee_increase_delay_epochs: default_fee_increase_delay_epochs(),
            unclaimed_delay_epochs: default_unclaimed_delay_epochs(),
            delegate_registration_fee: default_delegate_registration_fee(),
            start_epoch: 0,
        }
    }
}

impl VotingParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_delegate_fee_pct > PRECISION_BASE {
            return Err(ProtocolError::PercentageTooHigh {
                value: self.max_delegate_fee_pct,
                max: PRECISION_BASE,
            });
        }
        if self.unclaimed_delay_epochs == 0 {
            return Err(ProtocolError::InvalidInput("unclaimed_delay_epochs must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        VotingParams::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_fee_above_100_percent() {
        let params = VotingParams { max_delegate_fee_pct: 10_001, ..Default::default() };
        assert!(matches!(params.validate(), Err(ProtocolError::PercentageTooHigh { .. })));
    }
}
