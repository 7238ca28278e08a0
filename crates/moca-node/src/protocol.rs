//! # Protocol facade
//!
//! One entry point per state transition, applied in place under the write
//! lock. Component operations validate and stage their own changes and
//! write them back only once nothing can fail, so an error leaves the
//! component as it was. Asset movements are journaled for the duration of
//! the call and undone if it fails. Cost follows what a call touches, not
//! the size of the state.
//!
//! ```text
//!   call ──► begin asset journal ──► component op(s) ──Ok──► commit journal
//!                                          │
//!                                         Err──► roll back journal
//! ```
//!
//! Calls that reach two components run the fallible one first and mirror
//! into the other only after it succeeded.

use crate::config::ProtocolConfig;
use crate::error::NodeResult;
use moca_core::{
    AccountKind, Address, AddressBook, Asset, AssetBook, AssetLedger, Host, LockId, NativeDelivery, PoolId, Result,
    RoleRegistry, TxContext,
};
use moca_escrow::{EscrowLedger, EscrowParams, FeeUpdate, Redemption, VotingPowerSource, Withdrawal};
use moca_voting::{EmergencySweep, PaymentsController, VotingController, VotingParams};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a transaction can change
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub escrow: EscrowLedger,
    pub voting: VotingController,
    pub assets: AssetBook,
}

/// Component targeted by a lifecycle call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Escrow,
    Voting,
}

pub struct Protocol {
    addresses: AddressBook,
    roles: Arc<RoleRegistry>,
    payments: Arc<dyn PaymentsController + Send + Sync>,
    state: RwLock<ProtocolState>,
}

impl Protocol {
    pub fn new(
        config: &ProtocolConfig,
        roles: Arc<RoleRegistry>,
        payments: Arc<dyn PaymentsController + Send + Sync>,
    ) -> NodeResult<Self> {
        config.validate()?;
        let state = ProtocolState {
            escrow: EscrowLedger::new(config.escrow.clone())?,
            voting: VotingController::new(config.voting.clone())?,
            assets: AssetBook::new(),
        };
        info!(start_epoch = config.voting.start_epoch, "protocol initialised");
        Ok(Self { addresses: config.addresses.clone(), roles, payments, state: RwLock::new(state) })
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    /// Credit genesis balances outside any transaction
    pub fn fund(&self, asset: Asset, to: &Address, amount: u128) -> Result<()> {
        self.state.write().assets.mint(asset, to, amount)
    }

    /// Make `account` refuse native transfers, forcing wrapped delivery
    pub fn reject_native(&self, account: Address) {
        self.state.write().assets.reject_native(account);
    }

    fn transact<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut EscrowLedger, &mut VotingController, &mut Host<'_>) -> Result<T>,
    {
        let mut state = self.state.write();
        let ProtocolState { escrow, voting, assets } = &mut *state;
        assets.begin();
        let result = {
            let mut host = Host { roles: self.roles.as_ref(), addresses: &self.addresses, assets: &mut *assets };
            f(escrow, voting, &mut host)
        };
        match result {
            Ok(value) => {
                assets.commit();
                Ok(value)
            }
            Err(e) => {
                assets.rollback();
                debug!(op, error = %e, code = e.code(), "transaction reverted");
                Err(e)
            }
        }
    }

    // === Escrow ===

    pub fn create_lock(
        &self,
        tx: TxContext,
        moca_amount: u128,
        es_moca_amount: u128,
        expiry: u64,
        delegate: Option<Address>,
    ) -> Result<LockId> {
        self.transact("create_lock", |escrow, _, host| {
            escrow.create_lock(&tx, host, moca_amount, es_moca_amount, expiry, delegate)
        })
    }

    pub fn create_lock_for(
        &self,
        tx: TxContext,
        owner: Address,
        moca_amount: u128,
        es_moca_amount: u128,
        expiry: u64,
        delegate: Option<Address>,
    ) -> Result<LockId> {
        self.transact("create_lock_for", |escrow, _, host| {
            escrow.create_lock_for(&tx, host, owner, moca_amount, es_moca_amount, expiry, delegate)
        })
    }

    pub fn increase_amount(&self, tx: TxContext, lock_id: LockId, moca_amount: u128, es_moca_amount: u128) -> Result<()> {
        self.transact("increase_amount", |escrow, _, host| {
            escrow.increase_amount(&tx, host, lock_id, moca_amount, es_moca_amount)
        })
    }

    pub fn increase_duration(&self, tx: TxContext, lock_id: LockId, extra_duration: u64) -> Result<()> {
        self.transact("increase_duration", |escrow, _, _| escrow.increase_duration(&tx, lock_id, extra_duration))
    }

    pub fn withdraw(&self, tx: TxContext, lock_id: LockId) -> Result<Withdrawal> {
        self.transact("withdraw", |escrow, _, host| escrow.withdraw(&tx, host, lock_id))
    }

    /// Redeem part of a lock early; votes already cast this epoch stay covered
    pub fn early_redemption(&self, tx: TxContext, lock_id: LockId, amount: u128, is_moca: bool) -> Result<Redemption> {
        self.transact("early_redemption", |escrow, voting, host| {
            escrow.early_redemption(&tx, host, &*voting, lock_id, amount, is_moca)
        })
    }

    pub fn sync(&self, tx: TxContext, account: Address) -> Result<()> {
        self.transact("sync", |escrow, _, _| escrow.sync(&tx, account))
    }

    pub fn update_escrow_params(&self, tx: TxContext, params: EscrowParams) -> Result<()> {
        self.transact("update_escrow_params", |escrow, _, host| escrow.update_params(&tx, host, params))
    }

    // === Voting ===

    pub fn vote(&self, tx: TxContext, pool_ids: &[PoolId], votes: &[u128], is_delegated: bool) -> Result<()> {
        self.transact("vote", |escrow, voting, _| voting.vote(&tx, &*escrow, pool_ids, votes, is_delegated))
    }

    pub fn migrate_votes(
        &self,
        tx: TxContext,
        src_pools: &[PoolId],
        dst_pools: &[PoolId],
        amounts: &[u128],
        is_delegated: bool,
    ) -> Result<()> {
        self.transact("migrate_votes", |_, voting, _| {
            voting.migrate_votes(&tx, src_pools, dst_pools, amounts, is_delegated)
        })
    }

    pub fn create_pools(&self, tx: TxContext, count: u64) -> Result<Vec<PoolId>> {
        self.transact("create_pools", |_, voting, host| voting.create_pools(&tx, host, count))
    }

    pub fn remove_pools(&self, tx: TxContext, pool_ids: &[PoolId]) -> Result<()> {
        self.transact("remove_pools", |_, voting, host| voting.remove_pools(&tx, host, pool_ids))
    }

    pub fn deposit_epoch_subsidies(&self, tx: TxContext, epoch: u64, amount: u128) -> Result<()> {
        self.transact("deposit_epoch_subsidies", |_, voting, host| {
            voting.deposit_epoch_subsidies(&tx, host, epoch, amount)
        })
    }

    pub fn process_epoch_rewards_subsidies(
        &self,
        tx: TxContext,
        epoch: u64,
        pool_ids: &[PoolId],
        rewards: &[u128],
    ) -> Result<()> {
        self.transact("process_epoch_rewards_subsidies", |_, voting, host| {
            voting.process_epoch_rewards_subsidies(&tx, host, epoch, pool_ids, rewards)
        })
    }

    pub fn finalize_epoch(&self, tx: TxContext, epoch: u64) -> Result<()> {
        self.transact("finalize_epoch", |_, voting, host| voting.finalize_epoch(&tx, host, epoch))
    }

    pub fn force_finalize_epoch(&self, tx: TxContext, epoch: u64) -> Result<()> {
        self.transact("force_finalize_epoch", |_, voting, host| voting.force_finalize_epoch(&tx, host, epoch))
    }

    // === Delegates ===

    /// Register the caller as delegate in both components
    pub fn register_as_delegate(&self, tx: TxContext, fee_pct: u128) -> Result<()> {
        self.transact("register_as_delegate", |escrow, voting, host| {
            voting.register_as_delegate(&tx, host, fee_pct)?;
            escrow.set_delegate_registration(tx.caller, true);
            Ok(())
        })
    }

    pub fn update_delegate_fee(&self, tx: TxContext, fee_pct: u128) -> Result<FeeUpdate> {
        self.transact("update_delegate_fee", |_, voting, _| voting.update_delegate_fee(&tx, fee_pct))
    }

    pub fn unregister_as_delegate(&self, tx: TxContext) -> Result<()> {
        self.transact("unregister_as_delegate", |escrow, voting, _| {
            voting.unregister_as_delegate(&tx)?;
            escrow.set_delegate_registration(tx.caller, false);
            Ok(())
        })
    }

    // === Claims ===

    pub fn claim_personal_rewards(&self, tx: TxContext, epoch: u64, pool_ids: &[PoolId]) -> Result<u128> {
        self.transact("claim_personal_rewards", |_, voting, host| {
            voting.claim_personal_rewards(&tx, host, epoch, pool_ids)
        })
    }

    pub fn claim_rewards_from_delegates(
        &self,
        tx: TxContext,
        epoch: u64,
        delegates: &[Address],
        pool_ids: &[Vec<PoolId>],
    ) -> Result<u128> {
        self.transact("claim_rewards_from_delegates", |escrow, voting, host| {
            voting.claim_rewards_from_delegates(&tx, host, &*escrow, epoch, delegates, pool_ids)
        })
    }

    pub fn delegate_claim_fees(
        &self,
        tx: TxContext,
        epoch: u64,
        delegators: &[Address],
        pool_ids: &[Vec<PoolId>],
    ) -> Result<u128> {
        self.transact("delegate_claim_fees", |escrow, voting, host| {
            voting.delegate_claim_fees(&tx, host, &*escrow, epoch, delegators, pool_ids)
        })
    }

    pub fn claim_subsidies(&self, tx: TxContext, epoch: u64, verifier: Address, pool_ids: &[PoolId]) -> Result<u128> {
        let payments = self.payments.as_ref();
        self.transact("claim_subsidies", |_, voting, host| {
            voting.claim_subsidies(&tx, host, payments, epoch, &verifier, pool_ids)
        })
    }

    // === Treasury ===

    pub fn withdraw_unclaimed_rewards(&self, tx: TxContext, epoch: u64) -> Result<u128> {
        self.transact("withdraw_unclaimed_rewards", |_, voting, host| {
            voting.withdraw_unclaimed_rewards(&tx, host, epoch)
        })
    }

    pub fn withdraw_unclaimed_subsidies(&self, tx: TxContext, epoch: u64) -> Result<u128> {
        self.transact("withdraw_unclaimed_subsidies", |_, voting, host| {
            voting.withdraw_unclaimed_subsidies(&tx, host, epoch)
        })
    }

    pub fn withdraw_registration_fees(&self, tx: TxContext) -> Result<(u128, Option<NativeDelivery>)> {
        self.transact("withdraw_registration_fees", |_, voting, host| voting.withdraw_registration_fees(&tx, host))
    }

    pub fn update_voting_params(&self, tx: TxContext, params: VotingParams) -> Result<()> {
        self.transact("update_voting_params", |_, voting, host| voting.update_params(&tx, host, params))
    }

    // === Lifecycle ===

    pub fn pause(&self, tx: TxContext, component: Component) -> Result<()> {
        self.transact("pause", |escrow, voting, host| match component {
            Component::Escrow => escrow.pause(&tx, host),
            Component::Voting => voting.pause(&tx, host),
        })
    }

    pub fn unpause(&self, tx: TxContext, component: Component) -> Result<()> {
        self.transact("unpause", |escrow, voting, host| match component {
            Component::Escrow => escrow.unpause(&tx, host),
            Component::Voting => voting.unpause(&tx, host),
        })
    }

    pub fn freeze(&self, tx: TxContext, component: Component) -> Result<()> {
        self.transact("freeze", |escrow, voting, host| match component {
            Component::Escrow => escrow.freeze(&tx, host),
            Component::Voting => voting.freeze(&tx, host),
        })
    }

    pub fn escrow_emergency_exit(&self, tx: TxContext, lock_ids: &[LockId]) -> Result<Vec<Withdrawal>> {
        self.transact("escrow_emergency_exit", |escrow, _, host| escrow.emergency_exit(&tx, host, lock_ids))
    }

    pub fn voting_emergency_exit(&self, tx: TxContext) -> Result<EmergencySweep> {
        self.transact("voting_emergency_exit", |_, voting, host| voting.emergency_exit(&tx, host))
    }

    // === Views ===

    /// Run a read-only query against committed state
    pub fn read<T>(&self, f: impl FnOnce(&ProtocolState) -> T) -> T {
        f(&self.state.read())
    }

    pub fn balance_of(&self, account: &Address, kind: AccountKind, timestamp: u64) -> Result<u128> {
        self.read(|s| s.escrow.balance_of_at(account, kind, timestamp))
    }

    pub fn balance_at_epoch_end(&self, account: &Address, epoch: u64, kind: AccountKind) -> Result<u128> {
        self.read(|s| s.escrow.balance_at_epoch_end(account, epoch, kind))
    }

    pub fn specific_delegated_balance_at_epoch_end(
        &self,
        delegator: &Address,
        delegate: &Address,
        epoch: u64,
    ) -> Result<u128> {
        self.read(|s| s.escrow.specific_delegated_balance_at_epoch_end(delegator, delegate, epoch))
    }

    pub fn asset_balance(&self, asset: Asset, owner: &Address) -> u128 {
        self.read(|s| s.assets.balance_of(asset, owner))
    }

    pub fn view_claimable_personal_rewards(&self, epoch: u64, account: &Address, pool_ids: &[PoolId]) -> Result<u128> {
        self.read(|s| s.voting.view_claimable_personal_rewards(epoch, account, pool_ids))
    }

    pub fn view_claimable_delegation_rewards(
        &self,
        epoch: u64,
        delegator: &Address,
        delegate: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        self.read(|s| s.voting.view_claimable_delegation_rewards(&s.escrow, epoch, delegator, delegate, pool_ids))
    }

    pub fn view_claimable_delegate_fees(
        &self,
        epoch: u64,
        delegate: &Address,
        delegator: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        self.read(|s| s.voting.view_claimable_delegate_fees(&s.escrow, epoch, delegate, delegator, pool_ids))
    }

    pub fn view_claimable_subsidies(
        &self,
        epoch: u64,
        verifier: &Address,
        caller: &Address,
        pool_ids: &[PoolId],
    ) -> Result<u128> {
        let payments = self.payments.as_ref();
        self.read(|s| s.voting.view_claimable_subsidies(payments, epoch, verifier, caller, pool_ids))
    }

    // === Persistence ===

    pub fn export_state(&self) -> NodeResult<Vec<u8>> {
        Ok(bincode::serialize(&*self.state.read())?)
    }

    pub fn import_state(&self, bytes: &[u8]) -> NodeResult<()> {
        let state: ProtocolState = bincode::deserialize(bytes)?;
        *self.state.write() = state;
        info!(bytes = bytes.len(), "state imported");
        Ok(())
    }

    /// BLAKE3 of the exported state
    pub fn state_root(&self) -> NodeResult<[u8; 32]> {
        let encoded = self.export_state()?;
        Ok(*blake3::hash(&encoded).as_bytes())
    }

    pub fn state_root_hex(&self) -> NodeResult<String> {
        self.state_root().map(hex::encode)
    }
}
