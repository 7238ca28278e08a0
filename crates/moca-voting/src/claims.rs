//! # Claims
//!
//! All claim paths open once an epoch is finalized and close when the
//! matching sweep runs. Each has a read-only preview with the same
//! arithmetic.
//!
//! ```text
//!   personal      = user_pool_votes * pool_rewards / pool_votes
//!   delegated     = delegate_pool_votes * pool_rewards / pool_votes
//!                   * user_delegated / delegate_total
//!   delegate fee  = delegated * fee_pct / PRECISION_BASE
//!   subsidy       = verifier_accrued * pool_subsidy / pool_accrued
//! ```
//!
//! Pools that pay nothing or were already claimed are skipped rather than
//! failing the batch. Delegation claims book into copies of the touched
//! accounts and write them back after the payout.

use crate::accounts::{ClaimStatus, UserDelegateAccount};
use crate::controller::{check_batch, VotingController};
use crate::epoch::EpochState;
use crate::payments::PaymentsController;
use moca_core::{
    mul_div, AccountKind, Address, Asset, Host, PoolId, ProtocolError, Result, TxContext, PRECISION_BASE,
};
use moca_escrow::VotingPowerSource;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// One pool's contribution to a delegation claim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Booking {
    pool_id: PoolId,
    gross: u128,
    fee: u128,
}

type DelegationKey = (u64, Address, Address);

/// Delegation accounts a claim has booked into, not yet written back
#[derive(Default)]
struct StagedDelegations {
    accounts: BTreeMap<DelegationKey, UserDelegateAccount>,
    /// Gross and fee booked per delegate
    booked: BTreeMap<Address, (u128, u128)>,
}

impl VotingController {
    // === Claims ===

    pub fn claim_personal_rewards(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        epoch: u64,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        self.guard.ensure_active()?;
        let owed = self.personal_rewards(epoch, &tx.caller, pool_ids)?;
        let total = owed.iter().try_fold(0u128, |acc, (_, r)| acc.checked_add(*r))
            .ok_or(ProtocolError::ArithmeticOverflow)?;
        if total == 0 {
            return Ok(0);
        }

        self.pay_rewards(host, epoch, &tx.caller, total)?;
        for (pool_id, reward) in owed {
            self.personal_claims.insert((epoch, tx.caller, pool_id), ClaimStatus::Claimed(reward));
        }
        info!(account = %tx.caller, epoch, amount = total, "personal rewards claimed");
        Ok(total)
    }

    /// Claim net rewards earned through each delegate in `delegates`
    ///
    /// `pool_ids[i]` lists the pools to account for `delegates[i]`.
    pub fn claim_rewards_from_delegates(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        power: &dyn VotingPowerSource,
        epoch: u64,
        delegates: &[Address],
        pool_ids: &[Vec<PoolId>],
    ) -> Result<u128> {
        self.guard.ensure_active()?;
        check_batch(delegates.len(), pool_ids.len())?;
        self.reward_claims_open(epoch)?;
        let delegator = tx.caller;

        let mut staged = StagedDelegations::default();
        let mut total: u128 = 0;
        for (delegate, pools) in delegates.iter().zip(pool_ids) {
            let account = self.stage_delegation(&mut staged, power, epoch, &delegator, delegate, pools)?;
            let claimable = account.user_claimable();
            account.user_claimed = account.total_net_rewards;
            total = total.checked_add(claimable).ok_or(ProtocolError::ArithmeticOverflow)?;
        }
        if total > 0 {
            self.pay_rewards(host, epoch, &delegator, total)?;
            info!(%delegator, epoch, amount = total, "delegated rewards claimed");
        }
        self.commit_delegations(staged);
        Ok(total)
    }

    /// Claim the fees the caller earned as delegate of each of `delegators`
    pub fn delegate_claim_fees(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        power: &dyn VotingPowerSource,
        epoch: u64,
        delegators: &[Address],
        pool_ids: &[Vec<PoolId>],
    ) -> Result<u128> {
        self.guard.ensure_active()?;
        check_batch(delegators.len(), pool_ids.len())?;
        self.reward_claims_open(epoch)?;
        let delegate = tx.caller;

        let mut staged = StagedDelegations::default();
        let mut total: u128 = 0;
        for (delegator, pools) in delegators.iter().zip(pool_ids) {
            let account = self.stage_delegation(&mut staged, power, epoch, delegator, &delegate, pools)?;
            let claimable = account.delegate_claimable();
            account.delegate_claimed = account.total_delegate_fees;
            total = total.checked_add(claimable).ok_or(ProtocolError::ArithmeticOverflow)?;
        }
        if total > 0 {
            self.pay_rewards(host, epoch, &delegate, total)?;
            info!(%delegate, epoch, amount = total, "delegate fees claimed");
        }
        self.commit_delegations(staged);
        Ok(total)
    }

    /// Claim `verifier`'s share of each pool's subsidy; the caller must be its asset address
    pub fn claim_subsidies(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        payments: &dyn PaymentsController,
        epoch: u64,
        verifier: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        self.guard.ensure_active()?;
        let owed = self.subsidies(payments, epoch, verifier, &tx.caller, pool_ids)?;
        let total = owed.iter().try_fold(0u128, |acc, (_, s)| acc.checked_add(*s))
            .ok_or(ProtocolError::ArithmeticOverflow)?;
        if total == 0 {
            return Ok(0);
        }

        let vault = host.addresses.voting_vault;
        host.assets.transfer(Asset::EsMoca, &vault, &tx.caller, total)?;
        for (pool_id, subsidy) in owed {
            self.subsidy_claims.insert((epoch, *verifier, pool_id), ClaimStatus::Claimed(subsidy));
        }
        if let Some(state) = self.epochs.get_mut(&epoch) {
            state.total_subsidies_claimed += total;
        }
        info!(%verifier, recipient = %tx.caller, epoch, amount = total, "subsidies claimed");
        Ok(total)
    }

    // === Previews ===

    pub fn view_claimable_personal_rewards(&self, epoch: u64, account: &Address, pool_ids: &[PoolId]) -> Result<u128> {
        sum(&self.personal_rewards(epoch, account, pool_ids)?)
    }

    pub fn view_claimable_delegation_rewards(
        &self,
        power: &dyn VotingPowerSource,
        epoch: u64,
        delegator: &Address,
        delegate: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        self.reward_claims_open(epoch)?;
        let account = self.delegation_account(epoch, delegator, delegate);
        let bookings = self.delegation_bookings(power, epoch, delegator, delegate, account, pool_ids)?;
        let pending = account.map(|a| a.user_claimable()).unwrap_or(0);
        bookings.iter().try_fold(pending, |acc, b| acc.checked_add(b.gross - b.fee))
            .ok_or(ProtocolError::ArithmeticOverflow)
    }

    pub fn view_claimable_delegate_fees(
        &self,
        power: &dyn VotingPowerSource,
        epoch: u64,
        delegate: &Address,
        delegator: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        self.reward_claims_open(epoch)?;
        let account = self.delegation_account(epoch, delegator, delegate);
        let bookings = self.delegation_bookings(power, epoch, delegator, delegate, account, pool_ids)?;
        let pending = account.map(|a| a.delegate_claimable()).unwrap_or(0);
        bookings.iter().try_fold(pending, |acc, b| acc.checked_add(b.fee))
            .ok_or(ProtocolError::ArithmeticOverflow)
    }

    pub fn view_claimable_subsidies(
        &self,
        payments: &dyn PaymentsController,
        epoch: u64,
        verifier: &Address,
        caller: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        sum(&self.subsidies(payments, epoch, verifier, caller, pool_ids)?)
    }

    // === Arithmetic ===

    fn reward_claims_open(&self, epoch: u64) -> Result<&EpochState> {
        let state = self.finalized(epoch)?;
        if state.is_rewards_withdrawn {
            return Err(ProtocolError::EpochPhase { epoch, reason: "unclaimed rewards already withdrawn" });
        }
        Ok(state)
    }

    fn finalized(&self, epoch: u64) -> Result<&EpochState> {
        match self.epochs.get(&epoch) {
            Some(state) if state.is_finalized => Ok(state),
            _ => Err(ProtocolError::EpochNotFinalized { epoch }),
        }
    }

    /// Distinct known pools from a batch, order preserved
    fn distinct_pools(&self, pool_ids: &[PoolId]) -> Result<Vec<PoolId>> {
        if pool_ids.is_empty() {
            return Err(ProtocolError::EmptyInput);
        }
        let mut seen = BTreeSet::new();
        let mut pools = Vec::with_capacity(pool_ids.len());
        for pool_id in pool_ids {
            if !self.pools.contains_key(pool_id) {
                return Err(ProtocolError::PoolNotFound(*pool_id));
            }
            if seen.insert(*pool_id) {
                pools.push(*pool_id);
            }
        }
        Ok(pools)
    }

    fn personal_rewards(&self, epoch: u64, account: &Address, pool_ids: &[PoolId]) -> Result<Vec<(PoolId, u128)>> {
        self.reward_claims_open(epoch)?;
        let pools = self.distinct_pools(pool_ids)?;
        let voter = self.voters.get(&(epoch, *account, AccountKind::Personal));

        let mut owed = Vec::new();
        for pool_id in pools {
            if self.personal_claim_status(epoch, account, &pool_id).is_claimed() {
                continue;
            }
            let user_votes = voter.map(|v| v.votes_in(&pool_id)).unwrap_or(0);
            let Some(pool_epoch) = self.pool_epochs.get(&(epoch, pool_id)) else {
                continue;
            };
            let reward = mul_div(user_votes, pool_epoch.total_rewards_allocated, pool_epoch.total_votes)?;
            if reward > 0 {
                owed.push((pool_id, reward));
            }
        }
        Ok(owed)
    }

    /// Pools of a delegation not yet booked in `account`, with their gross and fee
    fn delegation_bookings(
        &self,
        power: &dyn VotingPowerSource,
        epoch: u64,
        delegator: &Address,
        delegate: &Address,
        account: Option<&UserDelegateAccount>,
        pool_ids: &[PoolId],
    ) -> Result<Vec<Booking>> {
        let pools = self.distinct_pools(pool_ids)?;
        let user_balance = power.specific_delegated_balance_at_epoch_end(delegator, delegate, epoch)?;
        let delegate_balance = power.balance_at_epoch_end(delegate, epoch, AccountKind::Delegate)?;
        let fee_pct = self.delegates.historical_fee_pct(delegate, epoch);
        let delegate_votes = self.voters.get(&(epoch, *delegate, AccountKind::Delegate));

        let mut bookings = Vec::new();
        for pool_id in pools {
            if account.map(|a| a.processed_pools.contains(&pool_id)).unwrap_or(false) {
                continue;
            }
            let (pool_rewards, pool_votes) = self
                .pool_epochs
                .get(&(epoch, pool_id))
                .map(|p| (p.total_rewards_allocated, p.total_votes))
                .unwrap_or((0, 0));
            let votes = delegate_votes.map(|v| v.votes_in(&pool_id)).unwrap_or(0);
            let delegate_rewards = mul_div(votes, pool_rewards, pool_votes)?;
            let gross = mul_div(delegate_rewards, user_balance, delegate_balance)?;
            let fee = mul_div(gross, fee_pct, PRECISION_BASE)?;
            bookings.push(Booking { pool_id, gross, fee });
        }
        Ok(bookings)
    }

    /// Book the unprocessed pools of one delegation into its staged account
    fn stage_delegation<'s>(
        &self,
        staged: &'s mut StagedDelegations,
        power: &dyn VotingPowerSource,
        epoch: u64,
        delegator: &Address,
        delegate: &Address,
        pool_ids: &[PoolId],
    ) -> Result<&'s mut UserDelegateAccount> {
        let key = (epoch, *delegator, *delegate);
        let account = staged
            .accounts
            .entry(key)
            .or_insert_with(|| self.delegations.get(&key).cloned().unwrap_or_default());
        let bookings = self.delegation_bookings(power, epoch, delegator, delegate, Some(&*account), pool_ids)?;

        let (mut gross_total, mut fee_total) = staged.booked.get(delegate).copied().unwrap_or((0, 0));
        for booking in &bookings {
            account.book(booking.pool_id, booking.gross, booking.fee)?;
            gross_total = gross_total.saturating_add(booking.gross);
            fee_total = fee_total.saturating_add(booking.fee);
        }
        staged.booked.insert(*delegate, (gross_total, fee_total));
        Ok(account)
    }

    fn commit_delegations(&mut self, staged: StagedDelegations) {
        self.delegations.extend(staged.accounts);
        for (delegate, (gross, fee)) in staged.booked {
            if gross > 0 {
                self.delegates.record_booking(&delegate, gross, fee);
            }
        }
    }

    fn subsidies(
        &self,
        payments: &dyn PaymentsController,
        epoch: u64,
        verifier: &Address,
        caller: &Address,
        pool_ids: &[PoolId],
    ) -> Result<Vec<(PoolId, u128)>> {
        let state = self.finalized(epoch)?;
        if state.is_subsidies_withdrawn {
            return Err(ProtocolError::EpochPhase { epoch, reason: "unclaimed subsidies already withdrawn" });
        }
        let pools = self.distinct_pools(pool_ids)?;

        let mut owed = Vec::new();
        for pool_id in pools {
            if self.subsidy_claim_status(epoch, verifier, &pool_id).is_claimed() {
                continue;
            }
            let pool_subsidy = self
                .pool_epochs
                .get(&(epoch, pool_id))
                .map(|p| p.total_subsidies_allocated)
                .unwrap_or(0);
            if pool_subsidy == 0 {
                continue;
            }
            let (verifier_accrued, pool_accrued) =
                payments.verifier_and_pool_accrued_subsidies(epoch, pool_id, verifier, caller)?;
            let subsidy = mul_div(verifier_accrued, pool_subsidy, pool_accrued)?;
            if subsidy > 0 {
                owed.push((pool_id, subsidy));
            }
        }
        Ok(owed)
    }

    fn pay_rewards(&mut self, host: &mut Host<'_>, epoch: u64, recipient: &Address, amount: u128) -> Result<()> {
        let vault = host.addresses.voting_vault;
        host.assets.transfer(Asset::EsMoca, &vault, recipient, amount)?;
        if let Some(state) = self.epochs.get_mut(&epoch) {
            state.total_rewards_claimed += amount;
        }
        Ok(())
    }
}

fn sum(owed: &[(PoolId, u128)]) -> Result<u128> {
    owed.iter()
        .try_fold(0u128, |acc, (_, amount)| acc.checked_add(*amount))
        .ok_or(ProtocolError::ArithmeticOverflow)
}
