//! Role predicates and the address book
//!
//! Role management itself lives outside the protocol; components only ask
//! yes/no questions about a caller. [`RoleRegistry`] is the in-memory
//! implementation used by the node facade and tests.

use crate::error::{ProtocolError, Result};
use crate::types::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Protocol roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    GlobalAdmin,
    Monitor,
    CronJob,
    AssetManager,
    EmergencyExitHandler,
    EscrowAdmin,
    VotingControllerAdmin,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GlobalAdmin => "global_admin",
            Self::Monitor => "monitor",
            Self::CronJob => "cron_job",
            Self::AssetManager => "asset_manager",
            Self::EmergencyExitHandler => "emergency_exit_handler",
            Self::EscrowAdmin => "escrow_admin",
            Self::VotingControllerAdmin => "voting_controller_admin",
        }
    }
}

/// Role predicates consumed as guards
pub trait AccessController {
    fn has_role(&self, role: Role, account: &Address) -> bool;

    fn is_global_admin(&self, account: &Address) -> bool {
        self.has_role(Role::GlobalAdmin, account)
    }

    fn is_monitor(&self, account: &Address) -> bool {
        self.has_role(Role::Monitor, account)
    }

    fn is_cron_job(&self, account: &Address) -> bool {
        self.has_role(Role::CronJob, account)
    }

    fn is_asset_manager(&self, account: &Address) -> bool {
        self.has_role(Role::AssetManager, account)
    }

    fn is_emergency_exit_handler(&self, account: &Address) -> bool {
        self.has_role(Role::EmergencyExitHandler, account)
    }

    fn is_escrow_admin(&self, account: &Address) -> bool {
        self.has_role(Role::EscrowAdmin, account)
    }

    fn is_voting_controller_admin(&self, account: &Address) -> bool {
        self.has_role(Role::VotingControllerAdmin, account)
    }
}

/// Fail with `MissingRole` unless `account` holds `role`
pub fn require_role(roles: &dyn AccessController, role: Role, account: &Address) -> Result<()> {
    if roles.has_role(role, account) {
        Ok(())
    } else {
        Err(ProtocolError::MissingRole { caller: *account, role: role.name() })
    }
}

/// In-memory role table
#[derive(Default)]
pub struct RoleRegistry {
    members: RwLock<BTreeMap<Role, BTreeSet<Address>>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, role: Role, account: Address) {
        self.members.write().entry(role).or_default().insert(account);
    }

    pub fn revoke(&self, role: Role, account: &Address) -> bool {
        self.members
            .write()
            .get_mut(&role)
            .map(|set| set.remove(account))
            .unwrap_or(false)
    }

    pub fn members(&self, role: Role) -> Vec<Address> {
        self.members
            .read()
            .get(&role)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl AccessController for RoleRegistry {
    fn has_role(&self, role: Role, account: &Address) -> bool {
        self.members
            .read()
            .get(&role)
            .map(|set| set.contains(account))
            .unwrap_or(false)
    }
}

/// Well-known protocol addresses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    /// Receives penalties, sweeps and emergency exits; funds rewards and subsidies
    pub treasury: Address,
    /// Custody of locked principal
    pub escrow_vault: Address,
    /// Custody of epoch rewards, subsidies and registration fees
    pub voting_vault: Address,
}

impl Default for AddressBook {
    fn default() -> Self {
        Self {
            treasury: Address::from_label("moca/treasury"),
            escrow_vault: Address::from_label("moca/escrow-vault"),
            voting_vault: Address::from_label("moca/voting-vault"),
        }
    }
}
