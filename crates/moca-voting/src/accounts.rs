//! Per-epoch voter bookkeeping

use moca_core::{PoolId, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Votes one address cast in one epoch on one axis
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterAccount {
    pub votes_spent: u128,
    pub pool_votes: BTreeMap<PoolId, u128>,
}

impl VoterAccount {
    pub fn votes_in(&self, pool_id: &PoolId) -> u128 {
        self.pool_votes.get(pool_id).copied().unwrap_or(0)
    }
}

/// Claim marker for a single (epoch, account, pool)
///
/// Keeps "already claimed" apart from "entitled to nothing".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    #[default]
    Unclaimed,
    Claimed(u128),
}

impl ClaimStatus {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_))
    }
}

/// Reward split between one delegator and one delegate in one epoch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDelegateAccount {
    /// Pools already accounted for, zero-result pools included
    pub processed_pools: BTreeSet<PoolId>,

    /// Gross reward per processed pool
    pub pool_gross_rewards: BTreeMap<PoolId, u128>,

    pub total_gross_rewards: u128,

    pub total_delegate_fees: u128,

    pub total_net_rewards: u128,

    /// Net rewards paid to the delegator
    pub user_claimed: u128,

    /// Fees paid to the delegate
    pub delegate_claimed: u128,
}

impl UserDelegateAccount {
    pub fn user_claimable(&self) -> u128 {
        self.total_net_rewards.saturating_sub(self.user_claimed)
    }

    pub fn delegate_claimable(&self) -> u128 {
        self.total_delegate_fees.saturating_sub(self.delegate_claimed)
    }

    /// Record one pool's gross reward and its fee split
    pub fn book(&mut self, pool_id: PoolId, gross: u128, fee: u128) -> Result<()> {
        let net = gross.checked_sub(fee).ok_or(ProtocolError::ArithmeticUnderflow("delegate fee"))?;
        self.processed_pools.insert(pool_id);
        if gross > 0 {
            self.pool_gross_rewards.insert(pool_id, gross);
        }
        self.total_gross_rewards = self.total_gross_rewards.checked_add(gross).ok_or(ProtocolError::ArithmeticOverflow)?;
        self.total_delegate_fees = self.total_delegate_fees.checked_add(fee).ok_or(ProtocolError::ArithmeticOverflow)?;
        self.total_net_rewards = self.total_net_rewards.checked_add(net).ok_or(ProtocolError::ArithmeticOverflow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_status_default() {
        assert!(!ClaimStatus::default().is_claimed());
        assert!(ClaimStatus::Claimed(0).is_claimed());
    }

    #[test]
    fn test_book_tracks_split() {
        let mut account = UserDelegateAccount::default();
        account.book(PoolId(1), 100, 10).unwrap();
        account.book(PoolId(2), 0, 0).unwrap();

        assert!(account.processed_pools.contains(&PoolId(2)));
        assert!(!account.pool_gross_rewards.contains_key(&PoolId(2)));
        assert_eq!(account.user_claimable(), 90);
        assert_eq!(account.delegate_claimable(), 10);

        account.user_claimed = 90;
        assert_eq!(account.user_claimable(), 0);
        assert!(account.book(PoolId(3), 5, 6).is_err());
    }
}
