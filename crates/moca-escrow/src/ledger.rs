//! # Escrow Ledger
//!
//! Locks MOCA and esMOCA for a week-aligned duration in exchange for
//! decaying voting power.
//!
//! ## Aggregates
//!
//! ```text
//!                      ┌──────────────┐
//!   lock (no delegate) │   personal   │──┐
//!                      └──────────────┘  │   ┌────────┐
//!                      ┌──────────────┐  ├──►│ global │
//!   lock ──delegate──► │ delegate     │──┘   └────────┘
//!                      │ + pair track │
//!                      └──────────────┘
//! ```
//!
//! Every mutation first rolls the global track forward to the current
//! week, then the tracks the lock feeds, so no account is ever ahead of
//! the global. Lock changes are applied as deltas between the old and the
//! new lock balance.
//!
//! Operations stage copies of the tracks and lock histories they touch,
//! move assets, and only then write the copies back. An error at any step
//! leaves the ledger as it was.

use crate::delegation::DelegationLedger;
use crate::lock::Lock;
use crate::power::{VoteCommitments, VotingPowerSource};
use crate::track::AggregateTrack;
use moca_core::checkpoint::{Checkpoint, CheckpointHistory};
use moca_core::clock::{epoch_at, is_week_aligned, week_start};
use moca_core::{
    mul_div, require_role, AccountKind, Address, Asset, Host, LifecycleGuard, LifecycleState, LockId,
    NativeDelivery, ProtocolError, Result, Role, TxContext, VeBalance, MAX_LOCK_DURATION, MIN_LOCK_DURATION,
    PRECISION_BASE, WEEK,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

fn default_max_penalty_pct() -> u128 {
    5_000
}

/// Escrow parameters, settable by the escrow admin
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowParams {
    /// Penalty on early redemption right after lock creation, in basis points
    #[serde(default = "default_max_penalty_pct", with = "moca_core::amount")]
    pub max_penalty_pct: u128,
}

impl Default for EscrowParams {
    fn default() -> Self {
        Self { max_penalty_pct: default_max_penalty_pct() }
    }
}

impl EscrowParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_penalty_pct > PRECISION_BASE {
            return Err(ProtocolError::PercentageTooHigh { value: self.max_penalty_pct, max: PRECISION_BASE });
        }
        Ok(())
    }
}

/// Principal returned by a withdrawal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub lock_id: LockId,
    pub owner: Address,
    pub moca_amount: u128,
    pub es_moca_amount: u128,
    /// How the MOCA part was delivered, `None` if there was none
    pub delivery: Option<NativeDelivery>,
}

/// Outcome of an early redemption
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub lock_id: LockId,
    pub asset: Asset,
    /// Principal removed from the lock
    pub amount: u128,
    /// Applied penalty in basis points
    pub penalty_pct: u128,
    /// Sent to treasury
    pub penalty: u128,
    /// Sent to the owner
    pub received: u128,
    pub delivery: Option<NativeDelivery>,
}

/// Change applied to every track a lock feeds
#[derive(Clone, Copy, Debug)]
enum Change {
    Add { ve: VeBalance, expiry: u64 },
    Sub { ve: VeBalance, expiry: u64 },
    Extend { added_bias: u128, slope: u128, old_expiry: u64, new_expiry: u64 },
}

fn apply_to(track: &mut AggregateTrack, week: u64, change: Change) -> Result<()> {
    track.roll_forward(week)?;
    match change {
        Change::Add { ve, expiry } => track.add(&ve, expiry),
        Change::Sub { ve, expiry } => track.sub(&ve, expiry),
        Change::Extend { added_bias, slope, old_expiry, new_expiry } => {
            track.extend(added_bias, slope, old_expiry, new_expiry)
        }
    }
}

/// Track a staged copy is written back to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum TrackKey {
    Personal(Address),
    Delegate(Address),
    Pair(Address, Address),
}

/// Tracks a lock feeds besides the global one
fn fed_tracks(owner: Address, delegate: Option<Address>) -> Vec<TrackKey> {
    match delegate {
        Some(delegate) => vec![TrackKey::Delegate(delegate), TrackKey::Pair(owner, delegate)],
        None => vec![TrackKey::Personal(owner)],
    }
}

/// Copies of everything one operation changes
#[derive(Debug, Default)]
struct Staged {
    global: Option<AggregateTrack>,
    /// Supply snapshots for weeks the global track crossed
    supply: Vec<(u64, u128)>,
    tracks: BTreeMap<TrackKey, AggregateTrack>,
    lock_history: BTreeMap<LockId, CheckpointHistory>,
}

/// Vote-escrow ledger
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowLedger {
    params: EscrowParams,

    guard: LifecycleGuard,

    locks: BTreeMap<LockId, Lock>,

    /// Per-lock balance history, one entry per week the lock changed
    lock_history: BTreeMap<LockId, CheckpointHistory>,

    owner_locks: BTreeMap<Address, BTreeSet<LockId>>,

    global: AggregateTrack,

    /// Global value at the start of each week the global track crossed
    total_supply_at: BTreeMap<u64, u128>,

    /// Personal (undelegated) accounts
    accounts: BTreeMap<Address, AggregateTrack>,

    delegation: DelegationLedger,

    total_locked_moca: u128,

    total_locked_es_moca: u128,

    lock_nonce: u64,
}

impl EscrowLedger {
    pub fn new(params: EscrowParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, ..Default::default() })
    }

    pub fn params(&self) -> &EscrowParams {
        &self.params
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.guard.state()
    }

    pub fn delegation(&self) -> &DelegationLedger {
        &self.delegation
    }

    // === Lock creation ===

    /// Lock the caller's own funds
    pub fn create_lock(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        moca_amount: u128,
        es_moca_amount: u128,
        expiry: u64,
        delegate: Option<Address>,
    ) -> Result<LockId> {
        self.open_lock(tx, host, tx.caller, moca_amount, es_moca_amount, expiry, delegate)
    }

    /// Lock funds held by the cron job on behalf of `owner`
    #[allow(clippy::too_many_arguments)]
    pub fn create_lock_for(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        owner: Address,
        moca_amount: u128,
        es_moca_amount: u128,
        expiry: u64,
        delegate: Option<Address>,
    ) -> Result<LockId> {
        require_role(host.roles, Role::CronJob, &tx.caller)?;
        if owner.is_zero() {
            return Err(ProtocolError::InvalidInput("lock owner is the zero address".into()));
        }
        self.open_lock(tx, host, owner, moca_amount, es_moca_amount, expiry, delegate)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_lock(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        owner: Address,
        moca_amount: u128,
        es_moca_amount: u128,
        expiry: u64,
        delegate: Option<Address>,
    ) -> Result<LockId> {
        self.guard.ensure_active()?;
        let now = tx.timestamp;
        let total = moca_amount.checked_add(es_moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        if total == 0 {
            return Err(ProtocolError::ZeroAmount);
        }
        if !is_week_aligned(expiry) {
            return Err(ProtocolError::NotWeekAligned(expiry));
        }
        let duration = expiry.saturating_sub(now);
        if !(MIN_LOCK_DURATION..=MAX_LOCK_DURATION).contains(&duration) {
            return Err(ProtocolError::InvalidLockDuration {
                duration,
                min: MIN_LOCK_DURATION,
                max: MAX_LOCK_DURATION,
            });
        }
        if let Some(delegate) = delegate {
            if delegate == owner {
                return Err(ProtocolError::InvalidInput("cannot delegate to the lock owner".into()));
            }
            if !self.delegation.is_registered(&delegate) {
                return Err(ProtocolError::DelegateNotRegistered(delegate));
            }
        }
        require_funds(host, &tx.caller, moca_amount, es_moca_amount)?;
        let locked_moca = self.total_locked_moca.checked_add(moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        let locked_es_moca =
            self.total_locked_es_moca.checked_add(es_moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;

        let mut salt = 0;
        let mut lock_id = LockId::derive(&owner, self.lock_nonce, now, salt);
        while self.locks.contains_key(&lock_id) {
            salt += 1;
            lock_id = LockId::derive(&owner, self.lock_nonce, now, salt);
        }

        let lock = Lock {
            lock_id,
            owner,
            delegate,
            moca_amount,
            es_moca_amount,
            expiry,
            created_at: now,
            is_withdrawn: false,
        };
        let ve = lock.ve_balance()?;
        let week = week_start(now);
        let mut staged = Staged::default();
        self.stage_change(&mut staged, owner, delegate, week, Change::Add { ve, expiry })?;
        self.stage_lock(&mut staged, lock_id, ve, week)?;

        let vault = host.addresses.escrow_vault;
        host.assets.transfer(Asset::Moca, &tx.caller, &vault, moca_amount)?;
        host.assets.transfer(Asset::EsMoca, &tx.caller, &vault, es_moca_amount)?;

        self.commit(staged);
        self.lock_nonce += 1;
        self.total_locked_moca = locked_moca;
        self.total_locked_es_moca = locked_es_moca;
        self.owner_locks.entry(owner).or_default().insert(lock_id);
        self.locks.insert(lock_id, lock);

        info!(
            %lock_id,
            %owner,
            moca = moca_amount,
            es_moca = es_moca_amount,
            expiry,
            delegated = delegate.is_some(),
            "lock created"
        );
        Ok(lock_id)
    }

    // === Lock modification ===

    pub fn increase_amount(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        lock_id: LockId,
        moca_amount: u128,
        es_moca_amount: u128,
    ) -> Result<()> {
        self.guard.ensure_active()?;
        let added = moca_amount.checked_add(es_moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        if added == 0 {
            return Err(ProtocolError::ZeroAmount);
        }
        let lock = self.live_lock(tx, lock_id)?.clone();
        require_funds(host, &tx.caller, moca_amount, es_moca_amount)?;
        let locked_moca = self.total_locked_moca.checked_add(moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        let locked_es_moca =
            self.total_locked_es_moca.checked_add(es_moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;

        let old_ve = lock.ve_balance()?;
        let mut updated = lock.clone();
        updated.moca_amount = updated.moca_amount.checked_add(moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        updated.es_moca_amount =
            updated.es_moca_amount.checked_add(es_moca_amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        let new_ve = updated.ve_balance()?;
        let delta = new_ve.sub(&old_ve)?;

        let week = week_start(tx.timestamp);
        let mut staged = Staged::default();
        self.stage_change(&mut staged, lock.owner, lock.delegate, week, Change::Add { ve: delta, expiry: lock.expiry })?;
        self.stage_lock(&mut staged, lock_id, new_ve, week)?;

        let vault = host.addresses.escrow_vault;
        host.assets.transfer(Asset::Moca, &tx.caller, &vault, moca_amount)?;
        host.assets.transfer(Asset::EsMoca, &tx.caller, &vault, es_moca_amount)?;

        self.commit(staged);
        self.total_locked_moca = locked_moca;
        self.total_locked_es_moca = locked_es_moca;
        self.locks.insert(lock_id, updated);

        info!(%lock_id, moca = moca_amount, es_moca = es_moca_amount, "lock amount increased");
        Ok(())
    }

    /// Push the expiry back by `extra_duration` (whole weeks)
    pub fn increase_duration(&mut self, tx: &TxContext, lock_id: LockId, extra_duration: u64) -> Result<()> {
        self.guard.ensure_active()?;
        if extra_duration == 0 {
            return Err(ProtocolError::ZeroAmount);
        }
        if !is_week_aligned(extra_duration) {
            return Err(ProtocolError::NotWeekAligned(extra_duration));
        }
        let lock = self.live_lock(tx, lock_id)?.clone();
        let new_expiry = lock.expiry.checked_add(extra_duration).ok_or(ProtocolError::ArithmeticOverflow)?;
        let remaining = new_expiry - tx.timestamp;
        if remaining > MAX_LOCK_DURATION {
            return Err(ProtocolError::InvalidLockDuration {
                duration: remaining,
                min: MIN_LOCK_DURATION,
                max: MAX_LOCK_DURATION,
            });
        }

        let old_ve = lock.ve_balance()?;
        let mut updated = lock.clone();
        updated.expiry = new_expiry;
        let new_ve = updated.ve_balance()?;
        let added_bias = new_ve
            .bias
            .checked_sub(old_ve.bias)
            .ok_or(ProtocolError::ArithmeticUnderflow("extended bias"))?;

        let week = week_start(tx.timestamp);
        let mut staged = Staged::default();
        self.stage_change(
            &mut staged,
            lock.owner,
            lock.delegate,
            week,
            Change::Extend { added_bias, slope: old_ve.slope, old_expiry: lock.expiry, new_expiry },
        )?;
        self.stage_lock(&mut staged, lock_id, new_ve, week)?;
        self.commit(staged);
        self.locks.insert(lock_id, updated);

        info!(%lock_id, old_expiry = lock.expiry, new_expiry, "lock duration increased");
        Ok(())
    }

    // === Exits ===

    /// Return the full principal of an expired lock
    pub fn withdraw(&mut self, tx: &TxContext, host: &mut Host<'_>, lock_id: LockId) -> Result<Withdrawal> {
        self.guard.ensure_active()?;
        let lock = self.owned_lock(tx, lock_id)?.clone();
        if tx.timestamp <= lock.expiry {
            return Err(ProtocolError::LockNotExpired(lock_id));
        }
        let ve = lock.ve_balance()?;
        if ve.value_at(tx.timestamp) != 0 {
            return Err(ProtocolError::Internal(format!("expired lock {} still has voting power", lock_id)));
        }

        let (locked_moca, locked_es_moca) = self.totals_without([&lock])?;
        let mut staged = Staged::default();
        self.stage_lock(&mut staged, lock_id, VeBalance::ZERO, week_start(tx.timestamp))?;

        let withdrawal = pay_out(host, &lock)?;

        self.commit(staged);
        self.total_locked_moca = locked_moca;
        self.total_locked_es_moca = locked_es_moca;
        self.mark_released(&lock_id);

        info!(
            %lock_id,
            owner = %lock.owner,
            moca = withdrawal.moca_amount,
            es_moca = withdrawal.es_moca_amount,
            "lock withdrawn"
        );
        Ok(withdrawal)
    }

    /// Exit part of a live lock before expiry, paying a time-scaled penalty
    ///
    /// The penalty shrinks linearly from `max_penalty_pct` at creation to
    /// zero at expiry. The axis the lock feeds must keep at least the votes
    /// it already cast this epoch.
    pub fn early_redemption(
        &mut self,
        tx: &TxContext,
        host: &mut Host<'_>,
        votes: &dyn VoteCommitments,
        lock_id: LockId,
        amount: u128,
        is_moca: bool,
    ) -> Result<Redemption> {
        self.guard.ensure_active()?;
        if amount == 0 {
            return Err(ProtocolError::ZeroAmount);
        }
        let lock = self.live_lock(tx, lock_id)?.clone();
        let (asset, principal) = if is_moca {
            (Asset::Moca, lock.moca_amount)
        } else {
            (Asset::EsMoca, lock.es_moca_amount)
        };
        if amount > principal {
            return Err(ProtocolError::InsufficientBalance { requested: amount, available: principal });
        }
        let locked = if is_moca { self.total_locked_moca } else { self.total_locked_es_moca };
        let locked = locked.checked_sub(amount).ok_or(ProtocolError::ArithmeticUnderflow("locked principal"))?;

        let penalty_pct = self.penalty_pct(&lock, tx.timestamp)?;
        let penalty = mul_div(amount, penalty_pct, PRECISION_BASE)?;
        let received = amount - penalty;

        let old_ve = lock.ve_balance()?;
        let mut updated = lock.clone();
        if is_moca {
            updated.moca_amount -= amount;
        } else {
            updated.es_moca_amount -= amount;
        }
        let new_ve = updated.ve_balance()?;
        let delta = old_ve.sub(&new_ve)?;

        let week = week_start(tx.timestamp);
        let mut staged = Staged::default();
        self.stage_change(&mut staged, lock.owner, lock.delegate, week, Change::Sub { ve: delta, expiry: lock.expiry })?;
        check_committed_votes(&staged, votes, &lock, tx.timestamp)?;
        let fully_redeemed = updated.total_amount() == 0;
        if fully_redeemed {
            updated.is_withdrawn = true;
            self.stage_lock(&mut staged, lock_id, VeBalance::ZERO, week)?;
        } else {
            self.stage_lock(&mut staged, lock_id, new_ve, week)?;
        }

        let vault = host.addresses.escrow_vault;
        let treasury = host.addresses.treasury;
        host.assets.transfer(asset, &vault, &treasury, penalty)?;
        let delivery = match asset {
            Asset::Moca if received > 0 => Some(host.assets.transfer_native_or_wrap(&vault, &lock.owner, received)?),
            _ => {
                host.assets.transfer(asset, &vault, &lock.owner, received)?;
                None
            }
        };

        self.commit(staged);
        if is_moca {
            self.total_locked_moca = locked;
        } else {
            self.total_locked_es_moca = locked;
        }
        self.locks.insert(lock_id, updated);

        info!(%lock_id, ?asset, amount, penalty_pct, penalty, fully_redeemed, "early redemption");
        Ok(Redemption { lock_id, asset, amount, penalty_pct, penalty, received, delivery })
    }

    /// Penalty in basis points for redeeming `lock` at `now`
    pub fn penalty_pct(&self, lock: &Lock, now: u64) -> Result<u128> {
        if now >= lock.expiry {
            return Ok(0);
        }
        let remaining = (lock.expiry - now) as u128;
        let full = lock.expiry.saturating_sub(lock.created_at) as u128;
        if full == 0 {
            return Ok(0);
        }
        mul_div(self.params.max_penalty_pct, remaining, full)
    }

    /// Bring the global track and every track of `account` up to the current week
    pub fn sync(&mut self, tx: &TxContext, account: Address) -> Result<()> {
        let week = week_start(tx.timestamp);
        let mut staged = Staged::default();
        self.stage_roll_global(&mut staged, week)?;

        let mut keys = Vec::new();
        if self.accounts.contains_key(&account) {
            keys.push(TrackKey::Personal(account));
        }
        if self.delegation.delegate_track(&account).is_some() {
            keys.push(TrackKey::Delegate(account));
        }
        keys.extend(self.delegation.delegates_of(&account).into_iter().map(|d| TrackKey::Pair(account, d)));
        for key in keys {
            self.stage_track(&mut staged, key).roll_forward(week)?;
        }
        self.commit(staged);
        Ok(())
    }

    // === Admin / lifecycle ===

    pub fn update_params(&mut self, tx: &TxContext, host: &Host<'_>, params: EscrowParams) -> Result<()> {
        require_role(host.roles, Role::EscrowAdmin, &tx.caller)?;
        params.validate()?;
        info!(max_penalty_pct = params.max_penalty_pct, "escrow params updated");
        self.params = params;
        Ok(())
    }

    /// Mirror a registration change made by the settlement controller
    pub fn set_delegate_registration(&mut self, delegate: Address, registered: bool) {
        debug!(%delegate, registered, "delegate registration mirrored");
        self.delegation.set_registered(delegate, registered);
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

    /// Return principal of the given locks to their owners, skipping aggregates
    pub fn emergency_exit(&mut self, tx: &TxContext, host: &mut Host<'_>, lock_ids: &[LockId]) -> Result<Vec<Withdrawal>> {
        self.guard.ensure_emergency_exit(host.roles, &tx.caller)?;
        if lock_ids.is_empty() {
            return Err(ProtocolError::EmptyInput);
        }
        let mut seen = BTreeSet::new();
        let mut exiting = Vec::with_capacity(lock_ids.len());
        for lock_id in lock_ids {
            let lock = self.locks.get(lock_id).ok_or(ProtocolError::LockNotFound(*lock_id))?;
            if lock.is_withdrawn || !seen.insert(*lock_id) {
                continue;
            }
            exiting.push(lock.clone());
        }
        let (locked_moca, locked_es_moca) = self.totals_without(&exiting)?;

        let mut released = Vec::with_capacity(exiting.len());
        for lock in &exiting {
            released.push(pay_out(host, lock)?);
        }

        self.total_locked_moca = locked_moca;
        self.total_locked_es_moca = locked_es_moca;
        for lock in &exiting {
            self.mark_released(&lock.lock_id);
        }
        warn!(caller = %tx.caller, locks = released.len(), "escrow emergency exit");
        Ok(released)
    }

    // === Views ===

    pub fn get_lock(&self, lock_id: &LockId) -> Option<&Lock> {
        self.locks.get(lock_id)
    }

    pub fn locks_of(&self, owner: &Address) -> Vec<&Lock> {
        self.owner_locks
            .get(owner)
            .map(|ids| ids.iter().filter_map(|id| self.locks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Historical voting power of a single lock
    pub fn lock_voting_power_at(&self, lock_id: &LockId, timestamp: u64) -> Result<u128> {
        let history = self.lock_history.get(lock_id).ok_or(ProtocolError::LockNotFound(*lock_id))?;
        Ok(history
            .latest_at_or_before(week_start(timestamp))
            .map(|cp| cp.ve.value_at(timestamp))
            .unwrap_or(0))
    }

    pub fn balance_of(&self, account: &Address, kind: AccountKind, now: u64) -> Result<u128> {
        self.balance_of_at(account, kind, now)
    }

    pub fn balance_of_at(&self, account: &Address, kind: AccountKind, timestamp: u64) -> Result<u128> {
        match self.account_track(account, kind) {
            Some(track) => track.value_at(timestamp),
            None => Ok(0),
        }
    }

    pub fn total_supply_at(&self, timestamp: u64) -> Result<u128> {
        self.global.value_at(timestamp)
    }

    pub fn total_supply_at_epoch_end(&self, epoch: u64) -> Result<u128> {
        self.global.value_at_epoch_end(epoch)
    }

    /// Snapshot taken when the global track crossed `week`
    pub fn total_supply_at_week(&self, week: u64) -> Option<u128> {
        self.total_supply_at.get(&week).copied()
    }

    /// Locked principal as `(moca, es_moca)`
    pub fn total_locked(&self) -> (u128, u128) {
        (self.total_locked_moca, self.total_locked_es_moca)
    }

    pub fn global_track(&self) -> &AggregateTrack {
        &self.global
    }

    pub fn account_track(&self, account: &Address, kind: AccountKind) -> Option<&AggregateTrack> {
        match kind {
            AccountKind::Personal => self.accounts.get(account),
            AccountKind::Delegate => self.delegation.delegate_track(account),
        }
    }

    // === Internals ===

    fn owned_lock(&self, tx: &TxContext, lock_id: LockId) -> Result<&Lock> {
        let lock = self.locks.get(&lock_id).ok_or(ProtocolError::LockNotFound(lock_id))?;
        if lock.owner != tx.caller {
            return Err(ProtocolError::NotLockOwner { caller: tx.caller, lock: lock_id });
        }
        if lock.is_withdrawn {
            return Err(ProtocolError::LockWithdrawn(lock_id));
        }
        Ok(lock)
    }

    /// Owned, not withdrawn and not expired
    fn live_lock(&self, tx: &TxContext, lock_id: LockId) -> Result<&Lock> {
        let lock = self.owned_lock(tx, lock_id)?;
        if lock.is_expired(tx.timestamp) {
            return Err(ProtocolError::LockExpired(lock_id));
        }
        Ok(lock)
    }

    fn track(&self, key: TrackKey) -> Option<&AggregateTrack> {
        match key {
            TrackKey::Personal(account) => self.accounts.get(&account),
            TrackKey::Delegate(delegate) => self.delegation.delegate_track(&delegate),
            TrackKey::Pair(delegator, delegate) => self.delegation.pair_track(&delegator, &delegate),
        }
    }

    fn stage_track<'s>(&self, staged: &'s mut Staged, key: TrackKey) -> &'s mut AggregateTrack {
        staged
            .tracks
            .entry(key)
            .or_insert_with(|| self.track(key).cloned().unwrap_or_default())
    }

    fn stage_roll_global(&self, staged: &mut Staged, week: u64) -> Result<()> {
        let global = staged.global.get_or_insert_with(|| self.global.clone());
        for cp in global.roll_forward(week)? {
            staged.supply.push((cp.week, cp.ve.value_at(cp.week)));
        }
        Ok(())
    }

    /// Stage `change` on the global track and every track the lock feeds
    fn stage_change(
        &self,
        staged: &mut Staged,
        owner: Address,
        delegate: Option<Address>,
        week: u64,
        change: Change,
    ) -> Result<()> {
        self.stage_roll_global(staged, week)?;
        let global = staged.global.get_or_insert_with(|| self.global.clone());
        apply_to(global, week, change)?;
        for key in fed_tracks(owner, delegate) {
            apply_to(self.stage_track(staged, key), week, change)?;
        }
        Ok(())
    }

    fn stage_lock(&self, staged: &mut Staged, lock_id: LockId, ve: VeBalance, week: u64) -> Result<()> {
        staged
            .lock_history
            .entry(lock_id)
            .or_insert_with(|| self.lock_history.get(&lock_id).cloned().unwrap_or_default())
            .record(Checkpoint { ve, week })
    }

    fn commit(&mut self, staged: Staged) {
        if let Some(global) = staged.global {
            self.global = global;
        }
        self.total_supply_at.extend(staged.supply);
        for (key, track) in staged.tracks {
            match key {
                TrackKey::Personal(account) => {
                    self.accounts.insert(account, track);
                }
                TrackKey::Delegate(delegate) => *self.delegation.delegate_track_mut(delegate) = track,
                TrackKey::Pair(delegator, delegate) => *self.delegation.pair_track_mut(delegator, delegate) = track,
            }
        }
        self.lock_history.extend(staged.lock_history);
    }

    /// Locked principal left once `locks` are paid out
    fn totals_without<'a>(&self, locks: impl IntoIterator<Item = &'a Lock>) -> Result<(u128, u128)> {
        let mut moca = self.total_locked_moca;
        let mut es_moca = self.total_locked_es_moca;
        for lock in locks {
            moca = moca.checked_sub(lock.moca_amount).ok_or(ProtocolError::ArithmeticUnderflow("locked moca"))?;
            es_moca = es_moca
                .checked_sub(lock.es_moca_amount)
                .ok_or(ProtocolError::ArithmeticUnderflow("locked esmoca"))?;
        }
        Ok((moca, es_moca))
    }

    fn mark_released(&mut self, lock_id: &LockId) {
        if let Some(stored) = self.locks.get_mut(lock_id) {
            stored.is_withdrawn = true;
        }
    }
}

/// Refuse a change that leaves the lock's voting axis below the votes it cast this epoch
fn check_committed_votes(staged: &Staged, votes: &dyn VoteCommitments, lock: &Lock, now: u64) -> Result<()> {
    let epoch = epoch_at(now);
    let (account, kind, key) = match lock.delegate {
        Some(delegate) => (delegate, AccountKind::Delegate, TrackKey::Delegate(delegate)),
        None => (lock.owner, AccountKind::Personal, TrackKey::Personal(lock.owner)),
    };
    let spent = votes.spent_votes(epoch, &account, kind);
    if spent == 0 {
        return Ok(());
    }
    let available = match staged.tracks.get(&key) {
        Some(track) => track.value_at_epoch_end(epoch)?,
        None => 0,
    };
    if available < spent {
        return Err(ProtocolError::InsufficientVotingPower { requested: spent, available });
    }
    Ok(())
}

/// Pay a lock's full principal back to its owner
fn pay_out(host: &mut Host<'_>, lock: &Lock) -> Result<Withdrawal> {
    let vault = host.addresses.escrow_vault;
    host.assets.transfer(Asset::EsMoca, &vault, &lock.owner, lock.es_moca_amount)?;
    let delivery = if lock.moca_amount > 0 {
        Some(host.assets.transfer_native_or_wrap(&vault, &lock.owner, lock.moca_amount)?)
    } else {
        None
    };
    Ok(Withdrawal {
        lock_id: lock.lock_id,
        owner: lock.owner,
        moca_amount: lock.moca_amount,
        es_moca_amount: lock.es_moca_amount,
        delivery,
    })
}

fn require_funds(host: &Host<'_>, payer: &Address, moca_amount: u128, es_moca_amount: u128) -> Result<()> {
    for (asset, amount) in [(Asset::Moca, moca_amount), (Asset::EsMoca, es_moca_amount)] {
        let available = host.assets.balance_of(asset, payer);
        if available < amount {
            return Err(ProtocolError::InsufficientBalance { requested: amount, available });
        }
    }
    Ok(())
}

impl VotingPowerSource for EscrowLedger {
    fn balance_at_epoch_end(&self, account: &Address, epoch: u64, kind: AccountKind) -> Result<u128> {
        match self.account_track(account, kind) {
            Some(track) => track.value_at_epoch_end(epoch),
            None => Ok(0),
        }
    }

    fn specific_delegated_balance_at_epoch_end(
        &self,
        delegator: &Address,
        delegate: &Address,
        epoch: u64,
    ) -> Result<u128> {
        match self.delegation.pair_track(delegator, delegate) {
            Some(track) => track.value_at_epoch_end(epoch),
            None => Ok(0),
        }
    }
}
