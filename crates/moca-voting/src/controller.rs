//! # Voting Controller
//!
//! Votes, pools and the per-epoch settlement pipeline.
//!
//! ## Settlement
//!
//! | Step | Caller | Precondition |
//! |------|--------|--------------|
//! | `deposit_epoch_subsidies` | asset manager | epoch ended, previous epoch finalized |
//! | `process_epoch_rewards_subsidies` | cron job | subsidies set, pool unprocessed |
//! | `finalize_epoch` | cron job | every snapshotted pool processed |
//! | `withdraw_unclaimed_*` | asset manager | finalized, sweep delay elapsed |
//!
//! Claims live in `claims.rs`.

use crate::accounts::{ClaimStatus, UserDelegateAccount, VoterAccount};
use crate::delegate::{Delegate, DelegateRegistry};
use crate::epoch::EpochState;
use crate::params::VotingParams;
use crate::pool::{Pool, PoolEpoch};
use moca_core::clock::{epoch_at, epoch_end, epoch_has_ended};
use moca_core::{
    mul_div, require_role, AccountKind, Address, Asset, Host, LifecycleGuard, LifecycleState, NativeDelivery, PoolId,
    ProtocolError, Result, Role, TxContext,
};
use moca_escrow::{FeeUpdate, VoteCommitments, VotingPowerSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Balances moved to treasury by an emergency exit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencySweep {
    pub es_moca: u128,
    pub moca: u128,
    pub wrapped_moca: u128,
}

/// Reject empty batches and mismatched parallel arrays
pub(crate) fn check_batch(left: usize, right: usize) -> Result<()> {
    if left == 0 {
        return Err(ProtocolError::EmptyInput);
    }
    if left != right {
        return Err(ProtocolError::LengthMismatch { left, right });
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingController {
    pub(crate) params: VotingParams,

    pub(crate) guard: LifecycleGuard,

    pub(crate) pools: BTreeMap<PoolId, Pool>,

    /// Last pool id handed out
    pub(crate) next_pool_id: u64,

    pub(crate) total_active_pools: u64,

    pub(crate) epochs: BTreeMap<u64, EpochState>,

    pub(crate) pool_epochs: BTreeMap<(u64, PoolId), PoolEpoch>,

    pub(crate) voters: BTreeMap<(u64, Address, AccountKind), VoterAccount>,

    pub(crate) delegates: DelegateRegistry,

    /// Keyed by (epoch, voter, pool)
    pub(crate) personal_claims: BTreeMap<(u64, Address, PoolId), ClaimStatus>,

    /// Keyed by (epoch, verifier, pool)
    pub(crate) subsidy_claims: BTreeMap<(u64, Address, PoolId), ClaimStatus>,

    /// Keyed by (epoch, delegator, delegate)
    pub(crate) delegations: BTreeMap<(u64, Address, Address), UserDelegateAccount>,
}

impl VotingController {
    pub fn new(params: VotingParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, ..Default::default() })
    }

    // === Voting ===

    /// Spend voting power on pools for the current epoch
    ///
    /// Available power is the caller's balance at the end of the current
    /// epoch minus what it already spent this epoch.
    pub fn vote(
        &mut self,
        tx: &TxContext,
        power: &dyn VotingPowerSource,
        pool_ids: &[PoolId],
        votes: &[u128],
        is_delegated: bool,
    ) -> Result<()> {
        self.guard.ensure_active()?;
        check_batch(pool_ids.len(), votes.len())?;
        let voter = tx.caller;
        if is_delegated && !self.delegates.is_registered(&voter) {
            return Err(ProtocolError::DelegateNotRegistered(voter));
        }
        let epoch = self.voting_epoch(tx.timestamp)?;
        let kind = AccountKind::from_delegated(is_delegated);

        let mut requested: u128 = 0;
        for (pool_id, amount) in pool_ids.iter().zip(votes) {
            if *amount == 0 {
                return Err(ProtocolError::ZeroAmount);
            }
            self.active_pool(pool_id)?;
            requested = requested.checked_add(*amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        }
        let total_power = power.balance_at_epoch_end(&voter, epoch, kind)?;
        let spent = self.voters.get(&(epoch, voter, kind)).map(|a| a.votes_spent).unwrap_or(0);
        let available = total_power.saturating_sub(spent);
        if requested > available {
            return Err(ProtocolError::InsufficientVotingPower { requested, available });
        }

        if is_delegated {
            self.delegates.snapshot_fee(&voter, epoch);
        }
        let account = self.voters.entry((epoch, voter, kind)).or_default();
        account.votes_spent += requested;
        for (pool_id, amount) in pool_ids.iter().zip(votes) {
            *account.pool_votes.entry(*pool_id).or_insert(0) += amount;
            self.pool_epochs.entry((epoch, *pool_id)).or_default().total_votes += amount;
            if let Some(pool) = self.pools.get_mut(pool_id) {
                pool.total_votes = pool.total_votes.saturating_add(*amount);
            }
        }
        self.epochs.entry(epoch).or_default().total_votes += requested;

        info!(%voter, epoch, votes = requested, delegated = is_delegated, "votes cast");
        Ok(())
    }

    /// Move votes already cast this epoch between pools
    ///
    /// The source pool may be inactive; the destination must be active.
    pub fn migrate_votes(
        &mut self,
        tx: &TxContext,
        src_pools: &[PoolId],
        dst_pools: &[PoolId],
        amounts: &[u128],
        is_delegated: bool,
    ) -> Result<()> {
        self.guard.ensure_active()?;
        check_batch(src_pools.len(), dst_pools.len())?;
        check_batch(src_pools.len(), amounts.len())?;
        let voter = tx.caller;
        if is_delegated && !self.delegates.is_registered(&voter) {
            return Err(ProtocolError::DelegateNotRegistered(voter));
        }
        let epoch = self.voting_epoch(tx.timestamp)?;
        let kind = AccountKind::from_delegated(is_delegated);

        let mut account = self.voters.get(&(epoch, voter, kind)).cloned().unwrap_or_default();
        for ((src, dst), amount) in src_pools.iter().zip(dst_pools).zip(amounts) {
            if *amount == 0 {
                return Err(ProtocolError::ZeroAmount);
            }
            if src == dst {
                return Err(ProtocolError::InvalidInput(format!("cannot migrate votes from {} to itself", src)));
            }
            if !self.pools.contains_key(src) {
                return Err(ProtocolError::PoolNotFound(*src));
            }
            self.active_pool(dst)?;
            let available = account.votes_in(src);
            if *amount > available {
                return Err(ProtocolError::InsufficientVotingPower { requested: *amount, available });
            }
            account.pool_votes.insert(*src, available - amount);
            *account.pool_votes.entry(*dst).or_insert(0) += amount;
        }

        for ((src, dst), amount) in src_pools.iter().zip(dst_pools).zip(amounts) {
            let src_epoch = self.pool_epochs.entry((epoch, *src)).or_default();
            src_epoch.total_votes = src_epoch.total_votes.saturating_sub(*amount);
            self.pool_epochs.entry((epoch, *dst)).or_default().total_votes += amount;
            if let Some(pool) = self.pools.get_mut(src) {
                pool.total_votes = pool.total_votes.saturating_sub(*amount);
            }
            if let Some(pool) = self.pools.get_mut(dst) {
                pool.total_votes = pool.total_votes.saturating_add(*amount);
            }
        }
        account.pool_votes.retain(|_, votes| *votes > 0);
        self.voters.insert((epoch, voter, kind), account);

        info!(%voter, epoch, moves = src_pools.len(), "votes migrated");
        Ok(())
    }

    // === Pools ===

    pub fn create_pools(&mut self, tx: &TxContext, host: &Host<'_>, count: u64) -> Result<Vec<PoolId>> {
        require_role(host.roles, Role::VotingControllerAdmin, &tx.caller)?;
        self.guard.ensure_active()?;
        if count == 0 {
            return Err(ProtocolError::ZeroAmount);
        }
        self.ensure_pool_window(tx.timestamp)?;

        let epoch = epoch_at(tx.timestamp);
        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            self.next_pool_id += 1;
            let pool_id = PoolId(self.next_pool_id);
            self.pools.insert(pool_id, Pool::new(pool_id, epoch));
            created.push(pool_id);
        }
        self.total_active_pools += count;

        info!(count, active = self.total_active_pools, "pools created");
        Ok(created)
    }

    pub fn remove_pools(&mut self, tx: &TxContext, host: &Host<'_>, pool_ids: &[PoolId]) -> Result<()> {
        require_role(host.roles, Role::VotingControllerAdmin, &tx.caller)?;
        self.guard.ensure_active()?;
        if pool_ids.is_empty() {
            return Err(ProtocolError::EmptyInput);
        }
        self.ensure_pool_window(tx.timestamp)?;
        let unique: BTreeSet<PoolId> = pool_ids.iter().copied().collect();
        if unique.len() != pool_ids.len() {
            return Err(ProtocolError::InvalidInput("duplicate pool id".into()));
        }
        for pool_id in &unique {
            self.active_pool(pool_id)?;
        }

        for pool_id in &unique {
            if let Some(pool) = self.pools.get_mut(pool_id) {
                pool.is_active = false;
            }
        }
        self.total_active_pools -= unique.len() as u64;

        info!(removed = unique.len(), active = self.total_active_pools, "pools removed");
        Ok(())
    }

    // === Settlement ===

    /// Open settlement for an ended epoch
    pub fn deposit_epoch_subsidies(&mut self, tx: &TxContext, host: &mut Host<'_>, epoch: u64, amount: u128) -> Result<()> {
        require_role(host.roles, Role::AssetManager, &tx.caller)?;
        self.guard.ensure_active()?;
        if epoch < self.params.start_epoch {
            return Err(ProtocolError::EpochPhase { epoch, reason: "before the controller start epoch" });
        }
        if !epoch_has_ended(epoch, tx.timestamp) {
            return Err(ProtocolError::EpochNotEnded { epoch, ends_at: epoch_end(epoch) });
        }
        if epoch > 0 && !self.is_epoch_finalized(epoch - 1) {
            return Err(ProtocolError::EpochNotFinalized { epoch: epoch - 1 });
        }
        let state = self.epochs.get(&epoch).cloned().unwrap_or_default();
        if state.is_subsidies_set {
            return Err(ProtocolError::EpochPhase { epoch, reason: "subsidies already deposited" });
        }

        let deposited = if amount > 0 && state.total_votes > 0 {
            let treasury = host.addresses.treasury;
            let vault = host.addresses.voting_vault;
            host.assets.transfer(Asset::EsMoca, &treasury, &vault, amount)?;
            amount
        } else {
            0
        };

        let active_pools = self.total_active_pools;
        let state = self.epochs.entry(epoch).or_default();
        state.total_subsidies_deposited = deposited;
        state.active_pools_snapshot = active_pools;
        state.is_subsidies_set = true;
        if active_pools == 0 {
            state.is_fully_processed = true;
            state.is_finalized = true;
            info!(epoch, "no active pools, epoch finalized at deposit");
        } else {
            info!(epoch, deposited, active_pools, "epoch subsidies deposited");
        }
        Ok(())
    }

    /// Allocate subsidies and record rewards for a batch of pools
    pub fn process_epoch_rewards_subsidies(
        &mut self,
        tx: &TxContext,
        host: &Host<'_>,
        epoch: u64,
        pool_ids: &[PoolId],
        rewards: &[u128],
    ) -> Result<()> {
        require_role(host.roles, Role::CronJob, &tx.caller)?;
        self.guard.ensure_active()?;
        check_batch(pool_ids.len(), rewards.len())?;
        let state = self.epochs.get(&epoch).cloned().unwrap_or_default();
        if !state.is_subsidies_set {
            return Err(ProtocolError::EpochPhase { epoch, reason: "subsidies not deposited" });
        }
        if state.is_fully_processed {
            return Err(ProtocolError::EpochPhase { epoch, reason: "already fully processed" });
        }

        let mut seen = BTreeSet::new();
        for pool_id in pool_ids {
            self.active_pool(pool_id)?;
            let processed = self.pool_epochs.get(&(epoch, *pool_id)).map(|p| p.is_processed).unwrap_or(false);
            if processed || !seen.insert(*pool_id) {
                return Err(ProtocolError::PoolAlreadyProcessed { epoch, pool: *pool_id });
            }
        }

        let mut rewards_total: u128 = 0;
        let mut subsidies_total: u128 = 0;
        let mut allocations = Vec::with_capacity(pool_ids.len());
        for (pool_id, reward) in pool_ids.iter().zip(rewards) {
            let pool_votes = self.pool_epochs.get(&(epoch, *pool_id)).map(|p| p.total_votes).unwrap_or(0);
            let subsidy = mul_div(pool_votes, state.total_subsidies_deposited, state.total_votes)?;
            let reward = if pool_votes > 0 { *reward } else { 0 };
            rewards_total = rewards_total.checked_add(reward).ok_or(ProtocolError::ArithmeticOverflow)?;
            subsidies_total = subsidies_total.checked_add(subsidy).ok_or(ProtocolError::ArithmeticOverflow)?;
            allocations.push((*pool_id, reward, subsidy));
        }
        let total_rewards_allocated = state
            .total_rewards_allocated
            .checked_add(rewards_total)
            .ok_or(ProtocolError::ArithmeticOverflow)?;

        for (pool_id, reward, subsidy) in allocations {
            let pool_epoch = self.pool_epochs.entry((epoch, pool_id)).or_default();
            pool_epoch.total_rewards_allocated = reward;
            pool_epoch.total_subsidies_allocated = subsidy;
            pool_epoch.is_processed = true;
            if let Some(pool) = self.pools.get_mut(&pool_id) {
                pool.total_rewards_allocated = pool.total_rewards_allocated.saturating_add(reward);
                pool.total_subsidies_allocated = pool.total_subsidies_allocated.saturating_add(subsidy);
            }
            debug!(epoch, %pool_id, reward, subsidy, "pool processed");
        }

        let state = self.epochs.entry(epoch).or_default();
        state.total_rewards_allocated = total_rewards_allocated;
        state.total_subsidies_allocated += subsidies_total;
        state.pools_processed += pool_ids.len() as u64;
        if state.pools_processed >= state.active_pools_snapshot {
            state.is_fully_processed = true;
            info!(epoch, pools = state.pools_processed, "epoch fully processed");
        }
        Ok(())
    }

    /// Fund the epoch's rewards and open claims
    pub fn finalize_epoch(&mut self, tx: &TxContext, host: &mut Host<'_>, epoch: u64) -> Result<()> {
        require_role(host.roles, Role::CronJob, &tx.caller)?;
        self.guard.ensure_active()?;
        let state = self.epochs.get(&epoch).cloned().unwrap_or_default();
        if state.is_finalized {
            return Err(ProtocolError::EpochPhase { epoch, reason: "already finalized" });
        }
        if !state.is_fully_processed {
            return Err(ProtocolError::EpochPhase { epoch, reason: "not fully processed" });
        }

        let treasury = host.addresses.treasury;
        let vault = host.addresses.voting_vault;
        host.assets.transfer(Asset::EsMoca, &treasury, &vault, state.total_rewards_allocated)?;
        if let Some(state) = self.epochs.get_mut(&epoch) {
            state.is_finalized = true;
        }

        info!(
            epoch,
            rewards = state.total_rewards_allocated,
            subsidies = state.total_subsidies_allocated,
            "epoch finalized"
        );
        Ok(())
    }

    /// Finalize an ended epoch with nothing to claim, refunding its subsidy
    pub fn force_finalize_epoch(&mut self, tx: &TxContext, host: &mut Host<'_>, epoch: u64) -> Result<()> {
        require_role(host.roles, Role::GlobalAdmin, &tx.caller)?;
        if !epoch_has_ended(epoch, tx.timestamp) {
            return Err(ProtocolError::EpochNotEnded { epoch, ends_at: epoch_end(epoch) });
        }
        let state = self.epochs.get(&epoch).cloned().unwrap_or_default();
        if state.is_finalized {
            return Err(ProtocolError::EpochPhase { epoch, reason: "already finalized" });
        }

        if state.total_subsidies_deposited > 0 {
            let vault = host.addresses.voting_vault;
            let treasury = host.addresses.treasury;
            host.assets.transfer(Asset::EsMoca, &vault, &treasury, state.total_subsidies_deposited)?;
        }
        for ((_, pool_id), pool_epoch) in self.pool_epochs.range_mut((epoch, PoolId(0))..=(epoch, PoolId(u64::MAX))) {
            if let Some(pool) = self.pools.get_mut(pool_id) {
                pool.total_rewards_allocated = pool.total_rewards_allocated.saturating_sub(pool_epoch.total_rewards_allocated);
                pool.total_subsidies_allocated =
                    pool.total_subsidies_allocated.saturating_sub(pool_epoch.total_subsidies_allocated);
            }
            pool_epoch.total_rewards_allocated = 0;
            pool_epoch.total_subsidies_allocated = 0;
        }

        let state = self.epochs.entry(epoch).or_default();
        state.total_subsidies_deposited = 0;
        state.total_subsidies_allocated = 0;
        state.total_rewards_allocated = 0;
        state.is_subsidies_set = true;
        state.is_fully_processed = true;
        state.is_finalized = true;
        state.is_force_finalized = true;

        warn!(epoch, caller = %tx.caller, "epoch force finalized");
        Ok(())
    }

    // === Delegates ===

    pub fn register_as_delegate(&mut self, tx: &TxContext, host: &mut Host<'_>, fee_pct: u128) -> Result<()> {
        self.guard.ensure_active()?;
        self.check_fee(fee_pct)?;
        let delegate = tx.caller;
        if self.delegates.is_registered(&delegate) {
            return Err(ProtocolError::DelegateAlreadyRegistered(delegate));
        }
        let fee = self.params.delegate_registration_fee;
        let vault = host.addresses.voting_vault;
        host.assets.transfer(Asset::Moca, &delegate, &vault, fee)?;
        self.delegates.register(delegate, fee_pct, fee)?;

        info!(%delegate, fee_pct, registration_fee = fee, "delegate registered");
        Ok(())
    }

    pub fn update_delegate_fee(&mut self, tx: &TxContext, fee_pct: u128) -> Result<FeeUpdate> {
        self.guard.ensure_active()?;
        self.check_fee(fee_pct)?;
        let epoch = epoch_at(tx.timestamp);
        let update = self
            .delegates
            .update_fee(&tx.caller, fee_pct, epoch, self.params.fee_increase_delay_epochs)?;
        info!(delegate = %tx.caller, fee_pct, ?update, "delegate fee updated");
        Ok(update)
    }

    pub fn unregister_as_delegate(&mut self, tx: &TxContext) -> Result<()> {
        self.guard.ensure_active()?;
        self.delegates.unregister(&tx.caller)?;
        info!(delegate = %tx.caller, "delegate unregistered");
        Ok(())
    }

    fn check_fee(&self, fee_pct: u128) -> Result<()> {
        if fee_pct > self.params.max_delegate_fee_pct {
            return Err(ProtocolError::PercentageTooHigh { value: fee_pct, max: self.params.max_delegate_fee_pct });
        }
        Ok(())
    }

    // === Sweeps ===

    /// Sweep rewards nobody claimed to treasury, closing reward claims for the epoch
    pub fn withdraw_unclaimed_rewards(&mut self, tx: &TxContext, host: &mut Host<'_>, epoch: u64) -> Result<u128> {
        let state = self.sweepable(tx, host, epoch)?;
        if state.is_rewards_withdrawn {
            return Err(ProtocolError::EpochPhase { epoch, reason: "rewards already withdrawn" });
        }
        let amount = state.unclaimed_rewards();
        let vault = host.addresses.voting_vault;
        let treasury = host.addresses.treasury;
        host.assets.transfer(Asset::EsMoca, &vault, &treasury, amount)?;
        if let Some(state) = self.epochs.get_mut(&epoch) {
            state.is_rewards_withdrawn = true;
        }
        info!(epoch, amount, "unclaimed rewards withdrawn");
        Ok(amount)
    }

    /// Sweep unclaimed subsidies and rounding dust to treasury
    pub fn withdraw_unclaimed_subsidies(&mut self, tx: &TxContext, host: &mut Host<'_>, epoch: u64) -> Result<u128> {
        let state = self.sweepable(tx, host, epoch)?;
        if state.is_subsidies_withdrawn {
            return Err(ProtocolError::EpochPhase { epoch, reason: "subsidies already withdrawn" });
        }
        let amount = state.unclaimed_subsidies();
        let vault = host.addresses.voting_vault;
        let treasury = host.addresses.treasury;
        host.assets.transfer(Asset::EsMoca, &vault, &treasury, amount)?;
        if let Some(state) = self.epochs.get_mut(&epoch) {
            state.is_subsidies_withdrawn = true;
        }
        info!(epoch, amount, "unclaimed subsidies withdrawn");
        Ok(amount)
    }

    fn sweepable(&self, tx: &TxContext, host: &Host<'_>, epoch: u64) -> Result<EpochState> {
        require_role(host.roles, Role::AssetManager, &tx.caller)?;
        self.guard.ensure_active()?;
        let state = self.epochs.get(&epoch).cloned().unwrap_or_default();
        if !state.is_finalized {
            return Err(ProtocolError::EpochNotFinalized { epoch });
        }
        let available_from = epoch.saturating_add(self.params.unclaimed_delay_epochs);
        if epoch_at(tx.timestamp) < available_from {
            return Err(ProtocolError::DelayNotElapsed { available_from });
        }
        Ok(state)
    }

    /// Send collected registration fees to treasury
    pub fn withdraw_registration_fees(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
    ) -> Result<(u128, Option<NativeDelivery>)> {
        require_role(host.roles, Role::AssetManager, &tx.caller)?;
        self.guard.ensure_active()?;
        let amount = self.delegates.unwithdrawn_registration_fees();
        if amount == 0 {
            return Ok((0, None));
        }
        let vault = host.addresses.voting_vault;
        let treasury = host.addresses.treasury;
        let delivery = host.assets.transfer_native_or_wrap(&vault, &treasury, amount)?;
        self.delegates.mark_registration_fees_withdrawn();
        info!(amount, ?delivery, "registration fees withdrawn");
        Ok((amount, Some(delivery)))
    }

    // === Admin / lifecycle ===

    pub fn update_params(&mut self, tx: &TxContext, host: &Host<'_>, params: VotingParams) -> Result<()> {
        require_role(host.roles, Role::VotingControllerAdmin, &tx.caller)?;
        params.validate()?;
        if params.start_epoch != self.params.start_epoch {
            return Err(ProtocolError::InvalidInput("start_epoch cannot change after genesis".into()));
        }
        info!(?params, "voting params updated");
        self.params = params;
        Ok(())
    }

    pub fn pause(&mut self, tx: &TxContext, host: &Host<'_>) -> Result<()> {
        self.guard.pause(host.roles, &tx.caller)
    }

    pub fn unpause(&mut self, tx: &TxContext, host: &Host<'_>) -> Result<()> {
        self.guard.unpause(host.roles, &tx.caller)
    }

    pub fn freeze(&mut self, tx: &TxContext, host: &Host<'_>) -> Result<()> {
        self.guard.freeze(host.roles, &tx.caller)
    }

    /// Move everything the voting vault holds to treasury
    pub fn emergency_exit(&mut self, tx: &TxContext, host: &mut Host<'_>) -> Result<EmergencySweep> {
        self.guard.ensure_emergency_exit(host.roles, &tx.caller)?;
        let vault = host.addresses.voting_vault;
        let treasury = host.addresses.treasury;
        let sweep = EmergencySweep {
            es_moca: host.assets.balance_of(Asset::EsMoca, &vault),
            moca: host.assets.balance_of(Asset::Moca, &vault),
            wrapped_moca: host.assets.balance_of(Asset::WrappedMoca, &vault),
        };
        host.assets.transfer(Asset::EsMoca, &vault, &treasury, sweep.es_moca)?;
        host.assets.transfer(Asset::Moca, &vault, &treasury, sweep.moca)?;
        host.assets.transfer(Asset::WrappedMoca, &vault, &treasury, sweep.wrapped_moca)?;
        warn!(caller = %tx.caller, es_moca = sweep.es_moca, moca = sweep.moca, "voting vault emergency exit");
        Ok(sweep)
    }

    // === Views ===

    pub fn params(&self) -> &VotingParams {
        &self.params
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.guard.state()
    }

    pub fn pool(&self, pool_id: &PoolId) -> Option<&Pool> {
        self.pools.get(pool_id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn total_active_pools(&self) -> u64 {
        self.total_active_pools
    }

    pub fn epoch(&self, epoch: u64) -> Option<&EpochState> {
        self.epochs.get(&epoch)
    }

    pub fn pool_epoch(&self, epoch: u64, pool_id: &PoolId) -> Option<&PoolEpoch> {
        self.pool_epochs.get(&(epoch, *pool_id))
    }

    pub fn voter(&self, epoch: u64, account: &Address, kind: AccountKind) -> Option<&VoterAccount> {
        self.voters.get(&(epoch, *account, kind))
    }

    pub fn delegate(&self, delegate: &Address) -> Option<&Delegate> {
        self.delegates.get(delegate)
    }

    pub fn is_registered_delegate(&self, delegate: &Address) -> bool {
        self.delegates.is_registered(delegate)
    }

    pub fn delegate_historical_fee_pct(&self, delegate: &Address, epoch: u64) -> u128 {
        self.delegates.historical_fee_pct(delegate, epoch)
    }

    pub fn delegation_account(&self, epoch: u64, delegator: &Address, delegate: &Address) -> Option<&UserDelegateAccount> {
        self.delegations.get(&(epoch, *delegator, *delegate))
    }

    pub fn personal_claim_status(&self, epoch: u64, account: &Address, pool_id: &PoolId) -> ClaimStatus {
        self.personal_claims.get(&(epoch, *account, *pool_id)).copied().unwrap_or_default()
    }

    pub fn subsidy_claim_status(&self, epoch: u64, verifier: &Address, pool_id: &PoolId) -> ClaimStatus {
        self.subsidy_claims.get(&(epoch, *verifier, *pool_id)).copied().unwrap_or_default()
    }

    /// Epochs before `start_epoch` count as finalized
    pub fn is_epoch_finalized(&self, epoch: u64) -> bool {
        epoch < self.params.start_epoch || self.epochs.get(&epoch).map(|e| e.is_finalized).unwrap_or(false)
    }

    // === Internals ===

    /// Epoch a vote cast at `now` counts towards, refusing epochs before the start epoch
    fn voting_epoch(&self, now: u64) -> Result<u64> {
        let epoch = epoch_at(now);
        if epoch < self.params.start_epoch {
            return Err(ProtocolError::EpochPhase { epoch, reason: "before the controller start epoch" });
        }
        Ok(epoch)
    }

    pub(crate) fn active_pool(&self, pool_id: &PoolId) -> Result<&Pool> {
        let pool = self.pools.get(pool_id).ok_or(ProtocolError::PoolNotFound(*pool_id))?;
        if !pool.is_active {
            return Err(ProtocolError::PoolInactive(*pool_id));
        }
        Ok(pool)
    }

    /// Pools may only change once the previous epoch is settled
    fn ensure_pool_window(&self, now: u64) -> Result<()> {
        let current = epoch_at(now);
        if current > 0 && !self.is_epoch_finalized(current - 1) {
            return Err(ProtocolError::EpochNotFinalized { epoch: current - 1 });
        }
        Ok(())
    }
}

impl VoteCommitments for VotingController {
    fn spent_votes(&self, epoch: u64, account: &Address, kind: AccountKind) -> u128 {
        self.voters.get(&(epoch, *account, kind)).map(|a| a.votes_spent).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{host, Env, EPOCH};
    use moca_core::clock::epoch_start;
    use moca_core::{AssetLedger, ONE_MOCA};
    use proptest::prelude::*;

    #[test]
    fn test_vote_within_power() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);

        env.vote(alice, &pools, &[30, 50], false).unwrap();
        assert_eq!(
            env.vote(alice, &pools[..1], &[21], false).unwrap_err(),
            ProtocolError::InsufficientVotingPower { requested: 21, available: 20 }
        );
        env.vote(alice, &pools[..1], &[20], false).unwrap();

        let account = env.voting.voter(EPOCH, &alice, AccountKind::Personal).unwrap();
        assert_eq!(account.votes_spent, 100);
        assert_eq!(account.votes_in(&pools[0]), 50);
        assert_eq!(env.voting.epoch(EPOCH).unwrap().total_votes, 100);
    }

    #[test]
    fn test_vote_rejects_bad_batches() {
        let mut env = Env::new();
        let pools = env.create_pools(1);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);

        assert_eq!(env.vote(alice, &[], &[], false).unwrap_err(), ProtocolError::EmptyInput);
        assert!(matches!(
            env.vote(alice, &pools, &[1, 2], false),
            Err(ProtocolError::LengthMismatch { .. })
        ));
        assert_eq!(env.vote(alice, &[PoolId(99)], &[1], false).unwrap_err(), ProtocolError::PoolNotFound(PoolId(99)));
        assert_eq!(
            env.vote(alice, &pools, &[1], true).unwrap_err(),
            ProtocolError::DelegateNotRegistered(alice)
        );
    }

    #[test]
    fn test_votes_before_start_epoch_rejected() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH - 1, AccountKind::Personal, 100);
        env.now = epoch_start(EPOCH - 1) + 3_600;

        let early = ProtocolError::EpochPhase { epoch: EPOCH - 1, reason: "before the controller start epoch" };
        assert_eq!(env.vote(alice, &pools[..1], &[10], false).unwrap_err(), early);
        let tx = TxContext::new(alice, env.now);
        assert_eq!(
            env.voting.migrate_votes(&tx, &pools[..1], &pools[1..], &[5], false).unwrap_err(),
            early
        );
        assert!(env.voting.voter(EPOCH - 1, &alice, AccountKind::Personal).is_none());
        assert!(env.voting.epoch(EPOCH - 1).is_none());
    }

    #[test]
    fn test_spent_votes_per_axis_and_epoch() {
        let mut env = Env::new();
        let pools = env.create_pools(1);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools, &[30], false).unwrap();

        assert_eq!(env.voting.spent_votes(EPOCH, &alice, AccountKind::Personal), 30);
        assert_eq!(env.voting.spent_votes(EPOCH, &alice, AccountKind::Delegate), 0);
        assert_eq!(env.voting.spent_votes(EPOCH + 1, &alice, AccountKind::Personal), 0);
    }

    #[test]
    fn test_migrate_votes_keeps_totals() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools[..1], &[60], false).unwrap();

        let tx = TxContext::new(alice, env.now);
        env.voting
            .migrate_votes(&tx, &pools[..1], &pools[1..], &[25], false)
            .unwrap();
        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[0]).unwrap().total_votes, 35);
        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[1]).unwrap().total_votes, 25);
        assert_eq!(env.voting.epoch(EPOCH).unwrap().total_votes, 60);
        assert_eq!(env.voting.voter(EPOCH, &alice, AccountKind::Personal).unwrap().votes_spent, 60);

        assert!(matches!(
            env.voting.migrate_votes(&tx, &pools[..1], &pools[1..], &[36], false),
            Err(ProtocolError::InsufficientVotingPower { .. })
        ));
    }

    #[test]
    fn test_migrate_to_inactive_pool_rejected() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools[..1], &[60], false).unwrap();
        env.remove_pools(&pools[1..]).unwrap();

        let tx = TxContext::new(alice, env.now);
        assert_eq!(
            env.voting.migrate_votes(&tx, &pools[..1], &pools[1..], &[10], false).unwrap_err(),
            ProtocolError::PoolInactive(pools[1])
        );
    }

    #[test]
    fn test_subsidy_split_exact() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools, &[30, 70], false).unwrap();

        env.end_epoch();
        env.deposit(EPOCH, 1_000).unwrap();
        env.process(EPOCH, &pools, &[0, 0]).unwrap();

        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[0]).unwrap().total_subsidies_allocated, 300);
        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[1]).unwrap().total_subsidies_allocated, 700);
        assert!(env.voting.epoch(EPOCH).unwrap().is_fully_processed);
    }

    #[test]
    fn test_subsidy_split_floors() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 3);
        env.vote(alice, &pools, &[1, 2], false).unwrap();

        env.end_epoch();
        env.deposit(EPOCH, 10).unwrap();
        env.process(EPOCH, &pools, &[0, 0]).unwrap();

        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[0]).unwrap().total_subsidies_allocated, 3);
        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[1]).unwrap().total_subsidies_allocated, 6);
        let state = env.voting.epoch(EPOCH).unwrap();
        assert_eq!(state.total_subsidies_allocated, 9);
        assert_eq!(state.unclaimed_subsidies(), 10);
    }

    #[test]
    fn test_phase_ordering_enforced() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools, &[40, 60], false).unwrap();

        assert!(matches!(env.deposit(EPOCH, 1_000), Err(ProtocolError::EpochNotEnded { .. })));
        env.end_epoch();
        assert!(matches!(env.process(EPOCH, &pools, &[1, 1]), Err(ProtocolError::EpochPhase { .. })));

        env.deposit(EPOCH, 1_000).unwrap();
        assert!(matches!(env.deposit(EPOCH, 1_000), Err(ProtocolError::EpochPhase { .. })));

        env.process(EPOCH, &pools[..1], &[500]).unwrap();
        assert!(matches!(env.finalize(EPOCH), Err(ProtocolError::EpochPhase { .. })));
        assert_eq!(
            env.process(EPOCH, &pools[..1], &[500]).unwrap_err(),
            ProtocolError::PoolAlreadyProcessed { epoch: EPOCH, pool: pools[0] }
        );

        env.process(EPOCH, &pools[1..], &[700]).unwrap();
        env.finalize(EPOCH).unwrap();
        assert!(matches!(env.finalize(EPOCH), Err(ProtocolError::EpochPhase { .. })));

        let vault = env.addresses.voting_vault;
        assert_eq!(env.assets.balance_of(Asset::EsMoca, &vault), 1_000 + 1_200);
    }

    #[test]
    fn test_reward_ignored_for_pool_without_votes() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools[..1], &[100], false).unwrap();

        env.end_epoch();
        env.deposit(EPOCH, 1_000).unwrap();
        env.process(EPOCH, &pools, &[500, 500]).unwrap();
        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[1]).unwrap().total_rewards_allocated, 0);
        assert_eq!(env.voting.epoch(EPOCH).unwrap().total_rewards_allocated, 500);
    }

    #[test]
    fn test_zero_active_pools_finalizes_at_deposit() {
        let mut env = Env::new();
        env.end_epoch();
        env.deposit(EPOCH, 1_000).unwrap();
        let state = env.voting.epoch(EPOCH).unwrap();
        assert!(state.is_finalized);
        assert_eq!(state.total_subsidies_deposited, 0);
    }

    #[test]
    fn test_deposit_requires_previous_epoch_finalized() {
        let mut env = Env::new();
        env.now = epoch_start(EPOCH + 2);
        assert_eq!(env.deposit(EPOCH + 1, 0).unwrap_err(), ProtocolError::EpochNotFinalized { epoch: EPOCH });
        env.deposit(EPOCH, 0).unwrap();
        env.deposit(EPOCH + 1, 0).unwrap();
    }

    #[test]
    fn test_pools_frozen_until_previous_epoch_finalized() {
        let mut env = Env::new();
        let pools = env.create_pools(1);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools, &[100], false).unwrap();
        env.end_epoch();

        assert_eq!(env.try_create_pools(1).unwrap_err(), ProtocolError::EpochNotFinalized { epoch: EPOCH });
        assert!(env.remove_pools(&pools).is_err());

        env.deposit(EPOCH, 0).unwrap();
        env.process(EPOCH, &pools, &[0]).unwrap();
        env.finalize(EPOCH).unwrap();
        assert_eq!(env.try_create_pools(1).unwrap(), vec![PoolId(2)]);
    }

    #[test]
    fn test_force_finalize_refunds_subsidies() {
        let mut env = Env::new();
        let pools = env.create_pools(2);
        let alice = Address::from_label("alice");
        env.power.set(alice, EPOCH, AccountKind::Personal, 100);
        env.vote(alice, &pools, &[50, 50], false).unwrap();
        env.end_epoch();
        env.deposit(EPOCH, 1_000).unwrap();
        env.process(EPOCH, &pools[..1], &[300]).unwrap();

        let treasury_before = env.assets.balance_of(Asset::EsMoca, &env.addresses.treasury);
        let tx = TxContext::new(env.admin, env.now);
        {
            let mut host = host!(env);
            assert!(env.voting.force_finalize_epoch(&TxContext::new(env.cron, env.now), &mut host, EPOCH).is_err());
            env.voting.force_finalize_epoch(&tx, &mut host, EPOCH).unwrap();
        }
        let state = env.voting.epoch(EPOCH).unwrap();
        assert!(state.is_finalized && state.is_force_finalized);
        assert_eq!(state.total_rewards_allocated, 0);
        assert_eq!(env.voting.pool_epoch(EPOCH, &pools[0]).unwrap().total_subsidies_allocated, 0);
        assert_eq!(
            env.assets.balance_of(Asset::EsMoca, &env.addresses.treasury),
            treasury_before + 1_000
        );
    }

    #[test]
    fn test_delegate_fee_increase_deferred() {
        let mut env = Env::new();
        let pools = env.create_pools(1);
        let delegate = Address::from_label("delegate");
        env.register_delegate(delegate, 1_000);

        let tx = TxContext::new(delegate, env.now);
        let update = env.voting.update_delegate_fee(&tx, 2_000).unwrap();
        assert_eq!(update, FeeUpdate::Deferred { effective_epoch: EPOCH + 2 });

        env.power.set(delegate, EPOCH, AccountKind::Delegate, 10);
        env.vote(delegate, &pools, &[10], true).unwrap();
        assert_eq!(env.voting.delegate_historical_fee_pct(&delegate, EPOCH), 1_000);

        let fees = env.voting.delegate(&delegate).unwrap().fees;
        assert_eq!(fees.fee_at(EPOCH + 1), 1_000);
        assert_eq!(fees.fee_at(EPOCH + 2), 2_000);
    }

    #[test]
    fn test_delegate_fee_decrease_applies_this_epoch() {
        let mut env = Env::new();
        let pools = env.create_pools(1);
        let delegate = Address::from_label("delegate");
        env.register_delegate(delegate, 1_000);
        env.power.set(delegate, EPOCH, AccountKind::Delegate, 10);
        env.vote(delegate, &pools, &[5], true).unwrap();

        let tx = TxContext::new(delegate, env.now);
        assert_eq!(env.voting.update_delegate_fee(&tx, 400).unwrap(), FeeUpdate::Immediate);
        assert_eq!(env.voting.delegate_historical_fee_pct(&delegate, EPOCH), 400);
        assert!(matches!(
            env.voting.update_delegate_fee(&tx, 6_000),
            Err(ProtocolError::PercentageTooHigh { .. })
        ));
    }

    #[test]
    fn test_registration_fees_swept_to_treasury() {
        let mut env = Env::new();
        let delegate = Address::from_label("delegate");
        env.register_delegate(delegate, 1_000);
        let fee = env.voting.params().delegate_registration_fee;

        let tx = TxContext::new(delegate, env.now);
        {
            let mut host = host!(env);
            assert_eq!(
                env.voting.register_as_delegate(&tx, &mut host, 1_000).unwrap_err(),
                ProtocolError::DelegateAlreadyRegistered(delegate)
            );
        }
        let manager = TxContext::new(env.manager, env.now);
        let mut host = host!(env);
        let (amount, delivery) = env.voting.withdraw_registration_fees(&manager, &mut host).unwrap();
        assert_eq!(amount, fee);
        assert_eq!(delivery, Some(NativeDelivery::Native));
        assert_eq!(env.voting.withdraw_registration_fees(&manager, &mut host).unwrap(), (0, None));
        drop(host);
        assert_eq!(env.assets.balance_of(Asset::Moca, &env.addresses.treasury), fee);
    }

    #[test]
    fn test_unregistered_delegate_cannot_vote() {
        let mut env = Env::new();
        let pools = env.create_pools(1);
        let delegate = Address::from_label("delegate");
        env.register_delegate(delegate, 1_000);
        env.power.set(delegate, EPOCH, AccountKind::Delegate, 10);
        env.voting.unregister_as_delegate(&TxContext::new(delegate, env.now)).unwrap();

        assert_eq!(
            env.vote(delegate, &pools, &[1], true).unwrap_err(),
            ProtocolError::DelegateNotRegistered(delegate)
        );
    }

    #[test]
    fn test_emergency_exit_drains_vault() {
        let mut env = Env::new();
        let vault = env.addresses.voting_vault;
        env.assets.mint(Asset::EsMoca, &vault, 5 * ONE_MOCA).unwrap();
        let (monitor, admin, handler) = (env.monitor, env.admin, env.handler);

        let mut host = host!(env);
        env.voting.pause(&TxContext::new(monitor, 0), &host).unwrap();
        assert!(env.voting.emergency_exit(&TxContext::new(handler, 0), &mut host).is_err());
        env.voting.freeze(&TxContext::new(admin, 0), &host).unwrap();
        assert!(env.voting.unpause(&TxContext::new(admin, 0), &host).is_err());
        let sweep = env.voting.emergency_exit(&TxContext::new(handler, 0), &mut host).unwrap();
        assert_eq!(sweep.es_moca, 5 * ONE_MOCA);
        drop(host);
        assert_eq!(env.assets.balance_of(Asset::EsMoca, &vault), 0);
    }

    proptest! {
        #[test]
        fn prop_votes_conserved(
            ballots in prop::collection::vec((0usize..3, 0usize..4, 1u128..50), 1..30),
        ) {
            let mut env = Env::new();
            let pools = env.create_pools(4);
            let voters: Vec<Address> = (0..3).map(|i| Address::from_label(&format!("voter-{}", i))).collect();
            for voter in &voters {
                env.power.set(*voter, EPOCH, AccountKind::Personal, 200);
            }
            for (voter, pool, amount) in ballots {
                let _ = env.vote(voters[voter], &[pools[pool]], &[amount], false);
            }

            let pool_sum: u128 = pools
                .iter()
                .map(|p| env.voting.pool_epoch(EPOCH, p).map(|pe| pe.total_votes).unwrap_or(0))
                .sum();
            let total = env.voting.epoch(EPOCH).map(|e| e.total_votes).unwrap_or(0);
            prop_assert_eq!(pool_sum, total);
            for voter in &voters {
                let spent = env.voting.voter(EPOCH, voter, AccountKind::Personal).map(|a| a.votes_spent).unwrap_or(0);
                prop_assert!(spent <= 200);
            }
        }
    }
}
