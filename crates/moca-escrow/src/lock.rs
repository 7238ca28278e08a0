//! Lock positions

use moca_core::{Address, LockId, Result, VeBalance};
use serde::{Deserialize, Serialize};

/// A single escrowed position
///
/// The lock is the source of truth for its own voting power: the current
/// [`VeBalance`] is always `VeBalance::from_lock(total_amount, expiry)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: LockId,

    /// Only the owner may modify or withdraw
    pub owner: Address,

    /// Voting power accrues to this delegate instead of the owner
    pub delegate: Option<Address>,

    /// Native MOCA principal
    pub moca_amount: u128,

    /// esMOCA principal
    pub es_moca_amount: u128,

    /// Week-aligned unlock time
    pub expiry: u64,

    /// Creation timestamp, anchors the early-redemption penalty curve
    pub created_at: u64,

    pub is_withdrawn: bool,
}

impl Lock {
    pub fn total_amount(&self) -> u128 {
        self.moca_amount + self.es_moca_amount
    }

    pub fn ve_balance(&self) -> Result<VeBalance> {
        VeBalance::from_lock(self.total_amount(), self.expiry)
    }

    /// Voting power at `timestamp`
    pub fn voting_power_at(&self, timestamp: u64) -> Result<u128> {
        if self.is_withdrawn {
            return Ok(0);
        }
        Ok(self.ve_balance()?.value_at(timestamp))
    }

    pub fn is_expired(&self, timestamp: u64) -> bool {
        timestamp >= self.expiry
    }
}
