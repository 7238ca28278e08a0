//! Voting pools and their per-epoch counters

use moca_core::PoolId;
use serde::{Deserialize, Serialize};

/// A voting pool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Pool ID
    pub pool_id: PoolId,

    /// Inactive pools accept no new votes and are skipped by settlement
    pub is_active: bool,

    /// Votes received across all epochs
    pub total_votes: u128,

    /// Rewards allocated across all epochs
    pub total_rewards_allocated: u128,

    /// Subsidies allocated across all epochs
    pub total_subsidies_allocated: u128,

    /// Epoch in which the pool was created
    pub created_in_epoch: u64,
}

impl Pool {
    pub fn new(pool_id: PoolId, epoch: u64) -> Self {
        Self {
            pool_id,
            is_active: true,
            total_votes: 0,
            total_rewards_allocated: 0,
            total_subsidies_allocated: 0,
            created_in_epoch: epoch,
        }
    }
}

/// Counters for one pool in one epoch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEpoch {
    pub total_votes: u128,

    /// Reward supplied by the cron job, zero if the pool had no votes
    pub total_rewards_allocated: u128,

    /// `pool_votes * epoch_subsidy / epoch_votes`, floored
    pub total_subsidies_allocated: u128,

    pub is_processed: bool,
}
