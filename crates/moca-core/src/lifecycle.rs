//! Risk / lifecycle guard
//!
//! ```text
//!   Active ⇄ Paused ──► Frozen ──► emergency exit
//! ```
//!
//! Freezing is only reachable from Paused and is permanent. Emergency exit
//! is only allowed once Frozen, so draining funds always takes a visible
//! pause followed by a separate freeze.

use crate::access::{require_role, AccessController, Role};
use crate::error::{ProtocolError, Result};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Lifecycle state of a component
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Active,
    Paused,
    Frozen,
}

/// Per-component lockdown state machine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleGuard {
    state: LifecycleState,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn is_frozen(&self) -> bool {
        self.state == LifecycleState::Frozen
    }

    /// Gate for every state-mutating user entry point
    pub fn ensure_active(&self) -> Result<()> {
        match self.state {
            LifecycleState::Active => Ok(()),
            LifecycleState::Paused => Err(ProtocolError::Lifecycle("paused")),
            LifecycleState::Frozen => Err(ProtocolError::Lifecycle("frozen")),
        }
    }

    /// Active -> Paused (monitor)
    pub fn pause(&mut self, roles: &dyn AccessController, caller: &Address) -> Result<()> {
        require_role(roles, Role::Monitor, caller)?;
        if self.state != LifecycleState::Active {
            return Err(ProtocolError::Lifecycle("already paused"));
        }
        self.state = LifecycleState::Paused;
        warn!(%caller, "paused");
        Ok(())
    }

    /// Paused -> Active (global admin), impossible once frozen
    pub fn unpause(&mut self, roles: &dyn AccessController, caller: &Address) -> Result<()> {
        require_role(roles, Role::GlobalAdmin, caller)?;
        match self.state {
            LifecycleState::Paused => {
                self.state = LifecycleState::Active;
                info!(%caller, "unpaused");
                Ok(())
            }
            LifecycleState::Active => Err(ProtocolError::Lifecycle("not paused")),
            LifecycleState::Frozen => Err(ProtocolError::Lifecycle("frozen")),
        }
    }

    /// Paused -> Frozen (global admin)
    pub fn freeze(&mut self, roles: &dyn AccessController, caller: &Address) -> Result<()> {
        require_role(roles, Role::GlobalAdmin, caller)?;
        match self.state {
            LifecycleState::Paused => {
                self.state = LifecycleState::Frozen;
                warn!(%caller, "frozen");
                Ok(())
            }
            LifecycleState::Active => Err(ProtocolError::Lifecycle("must be paused before freezing")),
            LifecycleState::Frozen => Err(ProtocolError::Lifecycle("already frozen")),
        }
    }

    /// Gate for emergency exit (emergency exit handler, frozen only)
    pub fn ensure_emergency_exit(&self, roles: &dyn AccessController, caller: &Address) -> Result<()> {
        require_role(roles, Role::EmergencyExitHandler, caller)?;
        if self.state != LifecycleState::Frozen {
            return Err(ProtocolError::Lifecycle("emergency exit requires frozen state"));
        }
        Ok(())
    }
}
