//! Shared fixtures for settlement tests

use crate::controller::VotingController;
use crate::params::VotingParams;
use moca_core::clock::{epoch_at, epoch_start};
use moca_core::{
    AccountKind, Address, AddressBook, Asset, AssetBook, PoolId, Result, Role, RoleRegistry, TxContext, ONE_MOCA,
};
use moca_escrow::VotingPowerSource;
use std::collections::BTreeMap;

pub const EPOCH: u64 = 1_400;

macro_rules! host {
    ($env:expr) => {
        moca_core::Host { roles: &$env.roles, addresses: &$env.addresses, assets: &mut $env.assets }
    };
}
pub(crate) use host;

/// Voting power fixed per (account, epoch)
#[derive(Default)]
pub struct FixedPower {
    balances: BTreeMap<(Address, u64, AccountKind), u128>,
    delegated: BTreeMap<(Address, Address, u64), u128>,
}

impl FixedPower {
    pub fn set(&mut self, account: Address, epoch: u64, kind: AccountKind, amount: u128) {
        self.balances.insert((account, epoch, kind), amount);
    }

    pub fn set_delegated(&mut self, delegator: Address, delegate: Address, epoch: u64, amount: u128) {
        self.delegated.insert((delegator, delegate, epoch), amount);
    }
}

impl VotingPowerSource for FixedPower {
    fn balance_at_epoch_end(&self, account: &Address, epoch: u64, kind: AccountKind) -> Result<u128> {
        Ok(self.balances.get(&(*account, epoch, kind)).copied().unwrap_or(0))
    }

    fn specific_delegated_balance_at_epoch_end(&self, delegator: &Address, delegate: &Address, epoch: u64) -> Result<u128> {
        Ok(self.delegated.get(&(*delegator, *delegate, epoch)).copied().unwrap_or(0))
    }
}

pub struct Env {
    pub roles: RoleRegistry,
    pub addresses: AddressBook,
    pub assets: AssetBook,
    pub voting: VotingController,
    pub power: FixedPower,
    pub now: u64,
    pub admin: Address,
    pub monitor: Address,
    pub cron: Address,
    pub manager: Address,
    pub handler: Address,
    pub pool_admin: Address,
}

impl Env {
    pub fn new() -> Self {
        let roles = RoleRegistry::new();
        let admin = Address::from_label("global-admin");
        let monitor = Address::from_label("monitor");
        let cron = Address::from_label("cron");
        let manager = Address::from_label("asset-manager");
        let handler = Address::from_label("exit-handler");
        let pool_admin = Address::from_label("voting-admin");
        roles.grant(Role::GlobalAdmin, admin);
        roles.grant(Role::Monitor, monitor);
        roles.grant(Role::CronJob, cron);
        roles.grant(Role::AssetManager, manager);
        roles.grant(Role::EmergencyExitHandler, handler);
        roles.grant(Role::VotingControllerAdmin, pool_admin);

        let addresses = AddressBook::default();
        let mut assets = AssetBook::new();
        assets
            .mint(Asset::EsMoca, &addresses.treasury, 1_000_000 * ONE_MOCA)
            .unwrap();

        let params = VotingParams { start_epoch: EPOCH, ..Default::default() };
        Self {
            roles,
            addresses,
            assets,
            voting: VotingController::new(params).unwrap(),
            power: FixedPower::default(),
            now: epoch_start(EPOCH) + 3_600,
            admin,
            monitor,
            cron,
            manager,
            handler,
            pool_admin,
        }
    }

    pub fn try_create_pools(&mut self, count: u64) -> Result<Vec<PoolId>> {
        let tx = TxContext::new(self.pool_admin, self.now);
        let host = host!(self);
        self.voting.create_pools(&tx, &host, count)
    }

    pub fn create_pools(&mut self, count: u64) -> Vec<PoolId> {
        self.try_create_pools(count).unwrap()
    }

    pub fn remove_pools(&mut self, pool_ids: &[PoolId]) -> Result<()> {
        let tx = TxContext::new(self.pool_admin, self.now);
        let host = host!(self);
        self.voting.remove_pools(&tx, &host, pool_ids)
    }

    pub fn vote(&mut self, voter: Address, pool_ids: &[PoolId], votes: &[u128], delegated: bool) -> Result<()> {
        let tx = TxContext::new(voter, self.now);
        self.voting.vote(&tx, &self.power, pool_ids, votes, delegated)
    }

    /// Jump to the start of the next epoch
    pub fn end_epoch(&mut self) {
        self.now = epoch_start(epoch_at(self.now) + 1);
    }

    pub fn deposit(&mut self, epoch: u64, amount: u128) -> Result<()> {
        let tx = TxContext::new(self.manager, self.now);
        let mut host = host!(self);
        self.voting.deposit_epoch_subsidies(&tx, &mut host, epoch, amount)
    }

    pub fn process(&mut self, epoch: u64, pool_ids: &[PoolId], rewards: &[u128]) -> Result<()> {
        let tx = TxContext::new(self.cron, self.now);
        let host = host!(self);
        self.voting.process_epoch_rewards_subsidies(&tx, &host, epoch, pool_ids, rewards)
    }

    pub fn finalize(&mut self, epoch: u64) -> Result<()> {
        let tx = TxContext::new(self.cron, self.now);
        let mut host = host!(self);
        self.voting.finalize_epoch(&tx, &mut host, epoch)
    }

    pub fn register_delegate(&mut self, delegate: Address, fee_pct: u128) {
        let fee = self.voting.params().delegate_registration_fee;
        self.assets.mint(Asset::Moca, &delegate, fee).unwrap();
        let tx = TxContext::new(delegate, self.now);
        let mut host = host!(self);
        self.voting.register_as_delegate(&tx, &mut host, fee_pct).unwrap();
    }

    /// Deposit, process every pool with `rewards` and finalize
    pub fn settle(&mut self, epoch: u64, subsidy: u128, pool_ids: &[PoolId], rewards: &[u128]) {
        self.deposit(epoch, subsidy).unwrap();
        self.process(epoch, pool_ids, rewards).unwrap();
        self.finalize(epoch).unwrap();
    }
}
