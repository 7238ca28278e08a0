//! # Moca Escrow
//!
//! Voting-escrow engine: users lock MOCA or esMOCA until a week-aligned
//! expiry and receive voting power that decays linearly to zero.
//!
//! ## Modules
//!
//! - `lock` - lock positions
//! - `track` - aggregate + slope schedule + checkpoint history
//! - `ledger` - the escrow state machine
//! - `delegation` - delegate and delegator/delegate aggregates, fee schedule
//! - `power` - epoch-end voting power queries for settlement

pub mod delegation;
pub mod ledger;
pub mod lock;
pub mod power;
pub mod track;

pub use delegation::{DelegationLedger, FeeSchedule, FeeUpdate};
pub use ledger::{EscrowLedger, EscrowParams, Redemption, Withdrawal};
pub use lock::Lock;
pub use power::{VoteCommitments, VotingPowerSource};
pub use track::AggregateTrack;
