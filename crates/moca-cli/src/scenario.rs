//! Scripted transaction sequences for `moca simulate`
//!
//! A scenario names its actors by label, grants roles, funds balances and
//! then replays a list of steps against a fresh [`Protocol`]. Each step runs
//! at its own block time and may be marked as expected to revert.
//!
//! ```json
//! {
//!   "start_epoch": 100,
//!   "roles": [{ "role": "cron_job", "accounts": ["cron"] }],
//!   "funding": [{ "account": "alice", "asset": "moca", "amount": "1000000000000000000000" }],
//!   "steps": [
//!     { "caller": "alice", "epoch": 100, "offset": 3600,
//!       "action": { "op": "create_lock", "moca": "1000000000000000000000", "weeks": 52, "label": "a" } }
//!   ]
//! }
//! ```

use anyhow::{bail, Context};
use moca_core::clock::{epoch_start, week_start};
use moca_core::{AccountKind, Address, Asset, LockId, PoolId, Role, RoleRegistry, TxContext, WEEK};
use moca_node::{Component, Protocol, ProtocolConfig};
use moca_voting::StaticPayments;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Token amount accepted as a JSON number or a decimal string
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Amount(#[serde(with = "moca_core::amount")] pub u128);

#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Overrides `voting.start_epoch` of the loaded configuration
    #[serde(default)]
    pub start_epoch: Option<u64>,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
    #[serde(default)]
    pub funding: Vec<Funding>,
    /// Accounts that refuse native MOCA transfers
    #[serde(default)]
    pub reject_native: Vec<String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct RoleGrant {
    pub role: Role,
    pub accounts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Funding {
    pub account: String,
    pub asset: Asset,
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub caller: Option<String>,
    /// Absolute block time; takes precedence over `epoch`
    #[serde(default)]
    pub at: Option<u64>,
    /// Run at the start of this epoch plus `offset`
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub expect_error: bool,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    CreateLock {
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        moca: Amount,
        #[serde(default)]
        es_moca: Amount,
        #[serde(default)]
        expiry: Option<u64>,
        #[serde(default)]
        weeks: Option<u64>,
        #[serde(default)]
        delegate: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    IncreaseAmount {
        lock: String,
        #[serde(default)]
        moca: Amount,
        #[serde(default)]
        es_moca: Amount,
    },
    IncreaseDuration {
        lock: String,
        weeks: u64,
    },
    Withdraw {
        lock: String,
    },
    EarlyRedemption {
        lock: String,
        amount: Amount,
        #[serde(default)]
        is_moca: bool,
    },
    Sync {
        account: String,
    },
    RegisterDelegate {
        fee_pct: Amount,
    },
    UpdateDelegateFee {
        fee_pct: Amount,
    },
    UnregisterDelegate,
    CreatePools {
        count: u64,
    },
    RemovePools {
        pools: Vec<u64>,
    },
    Vote {
        pools: Vec<u64>,
        votes: Vec<Amount>,
        #[serde(default)]
        delegated: bool,
    },
    MigrateVotes {
        from: Vec<u64>,
        to: Vec<u64>,
        amounts: Vec<Amount>,
        #[serde(default)]
        delegated: bool,
    },
    /// Record a verifier accrual on the payments side
    Accrue {
        epoch: u64,
        pool: u64,
        verifier: String,
        amount: Amount,
    },
    DepositSubsidies {
        epoch: u64,
        amount: Amount,
    },
    ProcessPools {
        epoch: u64,
        pools: Vec<u64>,
        rewards: Vec<Amount>,
    },
    FinalizeEpoch {
        epoch: u64,
    },
    ForceFinalizeEpoch {
        epoch: u64,
    },
    ClaimPersonal {
        epoch: u64,
        pools: Vec<u64>,
    },
    ClaimFromDelegates {
        epoch: u64,
        delegates: Vec<String>,
        pools: Vec<Vec<u64>>,
    },
    ClaimDelegateFees {
        epoch: u64,
        delegators: Vec<String>,
        pools: Vec<Vec<u64>>,
    },
    ClaimSubsidies {
        epoch: u64,
        verifier: String,
        pools: Vec<u64>,
    },
    WithdrawUnclaimedRewards {
        epoch: u64,
    },
    WithdrawUnclaimedSubsidies {
        epoch: u64,
    },
    WithdrawRegistrationFees,
    Pause {
        component: Component,
    },
    Unpause {
        component: Component,
    },
    Freeze {
        component: Component,
    },
    EscrowEmergencyExit {
        locks: Vec<String>,
    },
    VotingEmergencyExit,
    /// Read-only: voting power of `account` at the step's block time
    Balance {
        account: String,
        #[serde(default)]
        delegated: bool,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateLock { .. } => "create_lock",
            Self::IncreaseAmount { .. } => "increase_amount",
            Self::IncreaseDuration { .. } => "increase_duration",
            Self::Withdraw { .. } => "withdraw",
            Self::EarlyRedemption { .. } => "early_redemption",
            Self::Sync { .. } => "sync",
            Self::RegisterDelegate { .. } => "register_delegate",
            Self::UpdateDelegateFee { .. } => "update_delegate_fee",
            Self::UnregisterDelegate => "unregister_delegate",
            Self::CreatePools { .. } => "create_pools",
            Self::RemovePools { .. } => "remove_pools",
            Self::Vote { .. } => "vote",
            Self::MigrateVotes { .. } => "migrate_votes",
            Self::Accrue { .. } => "accrue",
            Self::DepositSubsidies { .. } => "deposit_subsidies",
            Self::ProcessPools { .. } => "process_pools",
            Self::FinalizeEpoch { .. } => "finalize_epoch",
            Self::ForceFinalizeEpoch { .. } => "force_finalize_epoch",
            Self::ClaimPersonal { .. } => "claim_personal",
            Self::ClaimFromDelegates { .. } => "claim_from_delegates",
            Self::ClaimDelegateFees { .. } => "claim_delegate_fees",
            Self::ClaimSubsidies { .. } => "claim_subsidies",
            Self::WithdrawUnclaimedRewards { .. } => "withdraw_unclaimed_rewards",
            Self::WithdrawUnclaimedSubsidies { .. } => "withdraw_unclaimed_subsidies",
            Self::WithdrawRegistrationFees => "withdraw_registration_fees",
            Self::Pause { .. } => "pause",
            Self::Unpause { .. } => "unpause",
            Self::Freeze { .. } => "freeze",
            Self::EscrowEmergencyExit { .. } => "escrow_emergency_exit",
            Self::VotingEmergencyExit => "voting_emergency_exit",
            Self::Balance { .. } => "balance",
        }
    }
}

/// Result of one replayed step
#[derive(Debug)]
pub struct Outcome {
    pub index: usize,
    pub op: &'static str,
    pub timestamp: u64,
    /// Rendered return value, or the revert reason
    pub result: Result<String, String>,
}

/// Protocol instance driven by a scenario
pub struct Simulation {
    protocol: Protocol,
    payments: Arc<StaticPayments>,
    locks: BTreeMap<String, LockId>,
    now: u64,
}

impl Simulation {
    pub fn new(scenario: &Scenario, mut config: ProtocolConfig) -> anyhow::Result<Self> {
        if let Some(start_epoch) = scenario.start_epoch {
            config.voting.start_epoch = start_epoch;
        }
        let roles = Arc::new(RoleRegistry::new());
        let payments = Arc::new(StaticPayments::new());
        let protocol = Protocol::new(&config, roles.clone(), payments.clone())?;
        let mut sim = Self { protocol, payments, locks: BTreeMap::new(), now: epoch_start(config.voting.start_epoch) };

        for grant in &scenario.roles {
            for name in &grant.accounts {
                roles.grant(grant.role, sim.account(name)?);
            }
        }
        for funding in &scenario.funding {
            let to = sim.account(&funding.account)?;
            sim.protocol
                .fund(funding.asset, &to, funding.amount.0)
                .with_context(|| format!("funding {}", funding.account))?;
        }
        for name in &scenario.reject_native {
            let account = sim.account(name)?;
            sim.protocol.reject_native(account);
        }
        info!(roles = scenario.roles.len(), funded = scenario.funding.len(), "scenario initialised");
        Ok(sim)
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Resolve a label, a vault name or a `0x` address
    pub fn account(&self, name: &str) -> anyhow::Result<Address> {
        let book = self.protocol.addresses();
        Ok(match name {
            "treasury" => book.treasury,
            "escrow_vault" => book.escrow_vault,
            "voting_vault" => book.voting_vault,
            hex if hex.starts_with("0x") => Address::from_hex(hex).with_context(|| format!("bad address {hex}"))?,
            label => Address::from_label(label),
        })
    }

    fn accounts(&self, names: &[String]) -> anyhow::Result<Vec<Address>> {
        names.iter().map(|n| self.account(n)).collect()
    }

    fn lock(&self, label: &str) -> anyhow::Result<LockId> {
        self.locks.get(label).copied().with_context(|| format!("unknown lock label {label}"))
    }

    /// Replay every step, failing on the first one whose outcome contradicts `expect_error`
    pub fn run(&mut self, steps: &[Step]) -> anyhow::Result<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let outcome = self.step(index, step)?;
            match (&outcome.result, step.expect_error) {
                (Ok(value), true) => bail!("step {index} ({}) succeeded with {value}, expected a revert", outcome.op),
                (Err(reason), false) => bail!("step {index} ({}) reverted: {reason}", outcome.op),
                _ => {}
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn step(&mut self, index: usize, step: &Step) -> anyhow::Result<Outcome> {
        if let Some(at) = step.at {
            self.now = at + step.offset;
        } else if let Some(epoch) = step.epoch {
            self.now = epoch_start(epoch) + step.offset;
        }
        let caller = match &step.caller {
            Some(name) => self.account(name)?,
            None => Address::ZERO,
        };
        let tx = TxContext::new(caller, self.now);
        debug!(index, op = step.action.name(), caller = %caller, timestamp = self.now, "replaying step");

        let result = self.apply(tx, &step.action)?.map_err(|e| format!("{e} (code {})", e.code()));
        Ok(Outcome { index, op: step.action.name(), timestamp: self.now, result })
    }

    /// Outer error: malformed step. Inner error: protocol revert.
    fn apply(&mut self, tx: TxContext, action: &Action) -> anyhow::Result<moca_core::Result<String>> {
        let p = &self.protocol;
        let result: moca_core::Result<String> = match action {
            Action::CreateLock { owner, moca, es_moca, expiry, weeks, delegate, label } => {
                let expiry = match (expiry, weeks) {
                    (Some(expiry), _) => *expiry,
                    (None, Some(weeks)) => week_start(tx.timestamp) + weeks * WEEK,
                    (None, None) => bail!("create_lock needs `expiry` or `weeks`"),
                };
                let delegate = delegate.as_deref().map(|d| self.account(d)).transpose()?;
                let created = match owner {
                    Some(owner) => {
                        let owner = self.account(owner)?;
                        p.create_lock_for(tx, owner, moca.0, es_moca.0, expiry, delegate)
                    }
                    None => p.create_lock(tx, moca.0, es_moca.0, expiry, delegate),
                };
                created.map(|lock_id| {
                    if let Some(label) = label {
                        self.locks.insert(label.clone(), lock_id);
                    }
                    format!("lock {}", lock_id.to_hex())
                })
            }
            Action::IncreaseAmount { lock, moca, es_moca } => {
                p.increase_amount(tx, self.lock(lock)?, moca.0, es_moca.0).map(|()| "ok".into())
            }
            Action::IncreaseDuration { lock, weeks } => {
                p.increase_duration(tx, self.lock(lock)?, weeks * WEEK).map(|()| "ok".into())
            }
            Action::Withdraw { lock } => p
                .withdraw(tx, self.lock(lock)?)
                .map(|w| format!("moca {} es_moca {}", w.moca_amount, w.es_moca_amount)),
            Action::EarlyRedemption { lock, amount, is_moca } => p
                .early_redemption(tx, self.lock(lock)?, amount.0, *is_moca)
                .map(|r| format!("{:?} {} penalty {} ({} bps)", r.asset, r.amount, r.penalty, r.penalty_pct)),
            Action::Sync { account } => p.sync(tx, self.account(account)?).map(|()| "ok".into()),
            Action::RegisterDelegate { fee_pct } => p.register_as_delegate(tx, fee_pct.0).map(|()| "ok".into()),
            Action::UpdateDelegateFee { fee_pct } => p.update_delegate_fee(tx, fee_pct.0).map(|u| format!("{u:?}")),
            Action::UnregisterDelegate => p.unregister_as_delegate(tx).map(|()| "ok".into()),
            Action::CreatePools { count } => p.create_pools(tx, *count).map(|ids| format!("{ids:?}")),
            Action::RemovePools { pools } => p.remove_pools(tx, &pool_ids(pools)).map(|()| "ok".into()),
            Action::Vote { pools, votes, delegated } => {
                p.vote(tx, &pool_ids(pools), &amounts(votes), *delegated).map(|()| "ok".into())
            }
            Action::MigrateVotes { from, to, amounts: moved, delegated } => p
                .migrate_votes(tx, &pool_ids(from), &pool_ids(to), &amounts(moved), *delegated)
                .map(|()| "ok".into()),
            Action::Accrue { epoch, pool, verifier, amount } => {
                let verifier = self.account(verifier)?;
                self.payments.record_accrual(*epoch, PoolId(*pool), verifier, amount.0).map(|()| "ok".into())
            }
            Action::DepositSubsidies { epoch, amount } => {
                p.deposit_epoch_subsidies(tx, *epoch, amount.0).map(|()| "ok".into())
            }
            Action::ProcessPools { epoch, pools, rewards } => p
                .process_epoch_rewards_subsidies(tx, *epoch, &pool_ids(pools), &amounts(rewards))
                .map(|()| "ok".into()),
            Action::FinalizeEpoch { epoch } => p.finalize_epoch(tx, *epoch).map(|()| "ok".into()),
            Action::ForceFinalizeEpoch { epoch } => p.force_finalize_epoch(tx, *epoch).map(|()| "ok".into()),
            Action::ClaimPersonal { epoch, pools } => {
                p.claim_personal_rewards(tx, *epoch, &pool_ids(pools)).map(|v| v.to_string())
            }
            Action::ClaimFromDelegates { epoch, delegates, pools } => {
                let delegates = self.accounts(delegates)?;
                let pools: Vec<Vec<PoolId>> = pools.iter().map(|ids| pool_ids(ids)).collect();
                p.claim_rewards_from_delegates(tx, *epoch, &delegates, &pools).map(|v| v.to_string())
            }
            Action::ClaimDelegateFees { epoch, delegators, pools } => {
                let delegators = self.accounts(delegators)?;
                let pools: Vec<Vec<PoolId>> = pools.iter().map(|ids| pool_ids(ids)).collect();
                p.delegate_claim_fees(tx, *epoch, &delegators, &pools).map(|v| v.to_string())
            }
            Action::ClaimSubsidies { epoch, verifier, pools } => {
                let verifier = self.account(verifier)?;
                p.claim_subsidies(tx, *epoch, verifier, &pool_ids(pools)).map(|v| v.to_string())
            }
            Action::WithdrawUnclaimedRewards { epoch } => {
                p.withdraw_unclaimed_rewards(tx, *epoch).map(|v| v.to_string())
            }
            Action::WithdrawUnclaimedSubsidies { epoch } => {
                p.withdraw_unclaimed_subsidies(tx, *epoch).map(|v| v.to_string())
            }
            Action::WithdrawRegistrationFees => {
                p.withdraw_registration_fees(tx).map(|(amount, delivery)| format!("{amount} via {delivery:?}"))
            }
            Action::Pause { component } => p.pause(tx, *component).map(|()| "ok".into()),
            Action::Unpause { component } => p.unpause(tx, *component).map(|()| "ok".into()),
            Action::Freeze { component } => p.freeze(tx, *component).map(|()| "ok".into()),
            Action::EscrowEmergencyExit { locks } => {
                let ids = locks.iter().map(|l| self.lock(l)).collect::<anyhow::Result<Vec<_>>>()?;
                p.escrow_emergency_exit(tx, &ids).map(|exits| format!("{} locks returned", exits.len()))
            }
            Action::VotingEmergencyExit => p.voting_emergency_exit(tx).map(|s| {
                format!("es_moca {} moca {} wrapped {}", s.es_moca, s.moca, s.wrapped_moca)
            }),
            Action::Balance { account, delegated } => {
                let account = self.account(account)?;
                p.balance_of(&account, AccountKind::from_delegated(*delegated), tx.timestamp).map(|v| v.to_string())
            }
        };
        Ok(result)
    }
}

fn pool_ids(ids: &[u64]) -> Vec<PoolId> {
    ids.iter().copied().map(PoolId).collect()
}

fn amounts(values: &[Amount]) -> Vec<u128> {
    values.iter().map(|a| a.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use moca_core::ONE_MOCA;

    const EPOCH_SCENARIO: &str = include_str!("../scenarios/epoch.json");

    fn replay(source: &str) -> (Simulation, Vec<Outcome>) {
        let scenario: Scenario = serde_json::from_str(source).unwrap();
        let mut sim = Simulation::new(&scenario, ProtocolConfig::default()).unwrap();
        let outcomes = sim.run(&scenario.steps).unwrap();
        (sim, outcomes)
    }

    #[test]
    fn test_epoch_scenario_settles() {
        let (sim, outcomes) = replay(EPOCH_SCENARIO);
        assert_eq!(outcomes.len(), 18);
        assert!(outcomes.iter().filter(|o| o.result.is_err()).all(|o| o.op == "vote" || o.op == "withdraw"));

        let alice = sim.account("alice").unwrap();
        let bob = sim.account("bob").unwrap();
        let verifier = sim.account("verifier").unwrap();
        let protocol = sim.protocol();
        assert!(protocol.asset_balance(Asset::EsMoca, &alice) > 0);
        assert!(protocol.asset_balance(Asset::EsMoca, &bob) > 0);
        assert!(protocol.asset_balance(Asset::EsMoca, &verifier) > 0);
        // bob's principal stays locked, only his net rewards are liquid
        assert!(protocol.asset_balance(Asset::EsMoca, &bob) < ONE_MOCA * 1_000);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let (first, _) = replay(EPOCH_SCENARIO);
        let (second, _) = replay(EPOCH_SCENARIO);
        let root = first.protocol().state_root_hex().unwrap();
        assert_eq!(root.len(), 64);
        assert_eq!(root, second.protocol().state_root_hex().unwrap());
    }

    #[test]
    fn test_unexpected_revert_stops_the_run() {
        let source = r#"{
            "start_epoch": 100,
            "steps": [
                { "caller": "alice", "epoch": 100, "action": { "op": "withdraw_registration_fees" } },
                { "caller": "alice", "epoch": 100, "action": { "op": "create_pools", "count": 1 } }
            ]
        }"#;
        let scenario: Scenario = serde_json::from_str(source).unwrap();
        let mut sim = Simulation::new(&scenario, ProtocolConfig::default()).unwrap();
        let err = sim.run(&scenario.steps).unwrap_err();
        assert!(err.to_string().starts_with("step 0 (withdraw_registration_fees) reverted"));
    }

    #[test]
    fn test_unknown_lock_label_is_a_scenario_error() {
        let source = r#"{
            "steps": [{ "caller": "alice", "action": { "op": "withdraw", "lock": "missing" } }]
        }"#;
        let scenario: Scenario = serde_json::from_str(source).unwrap();
        let mut sim = Simulation::new(&scenario, ProtocolConfig::default()).unwrap();
        let err = sim.run(&scenario.steps).unwrap_err();
        assert!(err.to_string().contains("unknown lock label missing"));
    }

    #[test]
    fn test_vault_names_resolve_to_the_address_book() {
        let scenario: Scenario = serde_json::from_str(r#"{ "steps": [] }"#).unwrap();
        let sim = Simulation::new(&scenario, ProtocolConfig::default()).unwrap();
        assert_eq!(sim.account("treasury").unwrap(), sim.protocol().addresses().treasury);
        let carol = Address::from_label("carol");
        assert_eq!(sim.account(&carol.to_hex()).unwrap(), carol);
    }
}
