//! # Moca Core
//!
//! Shared primitives for the Moca vote-escrow protocol.
//!
//! - `clock` - pure timestamp to week/epoch mapping
//! - `ve_balance` - the `{bias, slope}` decaying-balance algebra
//! - `checkpoint` - weekly checkpoints and the lazy rollforward routine
//! - `access` - role predicates and the address book
//! - `assets` - transfer capability and the in-memory asset book
//! - `lifecycle` - pause / freeze / emergency-exit guard
//! - `amount` - serde helpers for `u128` amounts in config files
//!
//! ## Voting power over time
//!
//! ```text
//!   value
//!     │╲
//!     │  ╲        value(t) = bias - slope·t
//!     │    ╲
//!     │      ╲
//!     └────────●──────► t
//!            expiry
//! ```

pub mod access;
pub mod amount;
pub mod assets;
pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod types;
pub mod ve_balance;

pub use access::{require_role, AccessController, AddressBook, Role, RoleRegistry};
pub use assets::{Asset, AssetBook, AssetLedger, NativeDelivery};
pub use checkpoint::{project, roll_forward, Aggregate, Checkpoint, CheckpointHistory, RollForward, SlopeSchedule};
pub use error::{ErrorKind, ProtocolError, Result};
pub use lifecycle::{LifecycleGuard, LifecycleState};
pub use types::{AccountKind, Address, LockId, PoolId, TxContext};
pub use ve_balance::VeBalance;

/// Protocol constants
pub mod constants {
    /// One week in seconds
    pub const WEEK: u64 = 7 * 24 * 3600;

    /// Epoch length: two weeks
    pub const EPOCH_DURATION: u64 = 2 * WEEK;

    /// Shortest lock: four weeks
    pub const MIN_LOCK_DURATION: u64 = 4 * WEEK;

    /// Longest lock: 104 weeks
    pub const MAX_LOCK_DURATION: u64 = 104 * WEEK;

    /// Basis-point denominator for percentages
    pub const PRECISION_BASE: u128 = 10_000;

    /// One token in base units (18 decimals)
    pub const ONE_MOCA: u128 = 1_000_000_000_000_000_000;
}

pub use constants::*;

/// Collaborators a transaction may touch besides component state
pub struct Host<'a> {
    pub roles: &'a dyn AccessController,
    pub addresses: &'a AddressBook,
    pub assets: &'a mut dyn AssetLedger,
}

/// `numerator * value / denominator`, floored, zero when the denominator is zero
///
/// The intermediate product is carried in 256 bits, so only a quotient that
/// does not fit `u128` overflows.
pub fn mul_div(value: u128, numerator: u128, denominator: u128) -> Result<u128> {
    if denominator == 0 {
        return Ok(0);
    }
    if let Some(product) = value.checked_mul(numerator) {
        return Ok(product / denominator);
    }
    let (hi, lo) = wide_mul(value, numerator);
    if hi >= denominator {
        return Err(ProtocolError::ArithmeticOverflow);
    }
    let mut quotient: u128 = 0;
    let mut remainder = hi;
    for bit in (0..128).rev() {
        let carry = remainder >> 127;
        remainder = (remainder << 1) | ((lo >> bit) & 1);
        quotient <<= 1;
        if carry == 1 || remainder >= denominator {
            remainder = remainder.wrapping_sub(denominator);
            quotient |= 1;
        }
    }
    Ok(quotient)
}

/// Full 256-bit product as `(high, low)` halves
fn wide_mul(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = u64::MAX as u128;
    let (a1, a0) = (a >> 64, a & MASK);
    let (b1, b0) = (b >> 64, b & MASK);
    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;
    let mid = (p00 >> 64) + (p01 & MASK) + (p10 & MASK);
    let lo = (p00 & MASK) | (mid << 64);
    let hi = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
    (hi, lo)
}
