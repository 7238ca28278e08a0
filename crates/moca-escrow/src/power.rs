//! Voting-power queries consumed by the settlement pipeline
//!
//! Settlement never reads live balances; it reads the value an account had
//! at the end of an epoch, which cannot change once the epoch is over.

use moca_core::{AccountKind, Address, Result};

pub trait VotingPowerSource {
    /// Voting power of `account` on the given axis at the end of `epoch`
    fn balance_at_epoch_end(&self, account: &Address, epoch: u64, kind: AccountKind) -> Result<u128>;

    /// Part of `delegate`'s power at the end of `epoch` that came from `delegator`
    fn specific_delegated_balance_at_epoch_end(
        &self,
        delegator: &Address,
        delegate: &Address,
        epoch: u64,
    ) -> Result<u128>;
}

/// Votes already cast against an account's epoch-end power
///
/// Anything that lowers epoch-end power during an epoch must leave at
/// least this much on the axis it touches.
pub trait VoteCommitments {
    fn spent_votes(&self, epoch: u64, account: &Address, kind: AccountKind) -> u128;
}
