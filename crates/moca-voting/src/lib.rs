//! # Moca Voting
//!
//! Epoch settlement on top of the escrow: voters spend epoch-end voting
//! power on pools, subsidies and rewards are allocated per pool once the
//! epoch ends, and claims open after finalization.
//!
//! ## Modules
//!
//! - `controller` - votes, pools, the settlement pipeline, sweeps, admin
//! - `claims` - personal, delegated, delegate-fee and subsidy claims
//! - `delegate` - delegate registry and frozen per-epoch fees
//! - `accounts` - voter, claim and delegator/delegate bookkeeping
//! - `epoch` / `pool` - per-epoch and per-pool settlement state
//! - `payments` - verifier accrual source for subsidy claims
//!
//! ## Epoch phases
//!
//! ```text
//!   Open ──deposit──► SubsidiesSet ──process all──► FullyProcessed ──finalize──► Finalized
//!     └───────────────────────── force_finalize ─────────────────────────────────┘
//! ```

pub mod accounts;
pub mod claims;
pub mod controller;
pub mod delegate;
pub mod epoch;
pub mod params;
pub mod payments;
pub mod pool;

#[cfg(test)]
mod testing;

pub use accounts::{ClaimStatus, UserDelegateAccount, VoterAccount};
pub use controller::{EmergencySweep, VotingController};
pub use delegate::{Delegate, DelegateRegistry};
pub use epoch::{EpochPhase, EpochState};
pub use params::VotingParams;
pub use payments::{PaymentsController, StaticPayments};
pub use pool::{Pool, PoolEpoch};
