//! # Epoch settlement state
//!
//! ```text
//!   Open ──deposit──► SubsidiesSet ──process all pools──► FullyProcessed
//!     │                                                        │
//!     └── (no active pools) ──────────────► Finalized ◄──finalize┘
//!                                              │
//!                          ┌───────────────────┴───────────────────┐
//!                   RewardsWithdrawn                      SubsidiesWithdrawn
//! ```
//!
//! Flags only ever go from `false` to `true`.

use serde::{Deserialize, Serialize};

/// Settlement phase derived from the epoch flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EpochPhase {
    Open,
    SubsidiesSet,
    FullyProcessed,
    Finalized,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochState {
    /// Votes cast across all pools
    pub total_votes: u128,

    /// Subsidy moved into the voting vault at deposit
    pub total_subsidies_deposited: u128,

    pub total_subsidies_allocated: u128,

    pub total_subsidies_claimed: u128,

    pub total_rewards_allocated: u128,

    /// Rewards paid out, delegate fees included
    pub total_rewards_claimed: u128,

    /// Active pools when subsidies were deposited
    pub active_pools_snapshot: u64,

    pub pools_processed: u64,

    pub is_subsidies_set: bool,

    pub is_fully_processed: bool,

    pub is_finalized: bool,

    /// Finalized by the global admin with zero allocations
    pub is_force_finalized: bool,

    pub is_rewards_withdrawn: bool,

    pub is_subsidies_withdrawn: bool,
}

impl EpochState {
    pub fn phase(&self) -> EpochPhase {
        if self.is_finalized {
            EpochPhase::Finalized
        } else if self.is_fully_processed {
            EpochPhase::FullyProcessed
        } else if self.is_subsidies_set {
            EpochPhase::SubsidiesSet
        } else {
            EpochPhase::Open
        }
    }

    /// Rewards still held for this epoch
    pub fn unclaimed_rewards(&self) -> u128 {
        self.total_rewards_allocated.saturating_sub(self.total_rewards_claimed)
    }

    /// Subsidies still held for this epoch, rounding dust included
    pub fn unclaimed_subsidies(&self) -> u128 {
        self.total_subsidies_deposited.saturating_sub(self.total_subsidies_claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_follows_flags() {
        let mut epoch = EpochState::default();
        assert_eq!(epoch.phase(), EpochPhase::Open);
        epoch.is_subsidies_set = true;
        assert_eq!(epoch.phase(), EpochPhase::SubsidiesSet);
        epoch.is_fully_processed = true;
        assert_eq!(epoch.phase(), EpochPhase::FullyProcessed);
        epoch.is_finalized = true;
        assert_eq!(epoch.phase(), EpochPhase::Finalized);
    }

    #[test]
    fn test_unclaimed_includes_dust() {
        let epoch = EpochState {
            total_subsidies_deposited: 10,
            total_subsidies_allocated: 9,
            total_subsidies_claimed: 9,
            ..Default::default()
        };
        assert_eq!(epoch.unclaimed_subsidies(), 1);
    }
}
