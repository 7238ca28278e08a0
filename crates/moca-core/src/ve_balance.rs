//! # VeBalance Algebra
//!
//! Decaying voting power is a line `value(t) = bias - slope * t`, clamped
//! at zero. A lock of `amount` expiring at `expiry` has
//!
//! ```text
//! slope = floor(amount / MAX_LOCK_DURATION)
//! bias  = slope * expiry
//! ```
//!
//! so its value reaches exactly zero at `expiry`. Sums of lines are lines,
//! which is what lets global and per-account aggregates be kept as a single
//! `{bias, slope}` pair.

use crate::constants::MAX_LOCK_DURATION;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Linear decaying balance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeBalance {
    pub bias: u128,
    pub slope: u128,
}

impl VeBalance {
    pub const ZERO: Self = Self { bias: 0, slope: 0 };

    pub fn new(bias: u128, slope: u128) -> Self {
        Self { bias, slope }
    }

    /// Voting power of `amount` locked until `expiry`
    ///
    /// Rounds down: a lock never receives more than the continuous value.
    pub fn from_lock(amount: u128, expiry: u64) -> Result<Self> {
        let slope = amount / MAX_LOCK_DURATION as u128;
        let bias = slope
            .checked_mul(expiry as u128)
            .ok_or(ProtocolError::ArithmeticOverflow)?;
        Ok(Self { bias, slope })
    }

    /// Component-wise sum
    pub fn add(&self, other: &VeBalance) -> Result<Self> {
        Ok(Self {
            bias: self.bias.checked_add(other.bias).ok_or(ProtocolError::ArithmeticOverflow)?,
            slope: self.slope.checked_add(other.slope).ok_or(ProtocolError::ArithmeticOverflow)?,
        })
    }

    /// Component-wise difference; `other` must be contained in `self`
    pub fn sub(&self, other: &VeBalance) -> Result<Self> {
        Ok(Self {
            bias: self
                .bias
                .checked_sub(other.bias)
                .ok_or(ProtocolError::ArithmeticUnderflow("ve bias"))?,
            slope: self
                .slope
                .checked_sub(other.slope)
                .ok_or(ProtocolError::ArithmeticUnderflow("ve slope"))?,
        })
    }

    /// Value at `timestamp`, zero once fully decayed
    pub fn value_at(&self, timestamp: u64) -> u128 {
        match self.slope.checked_mul(timestamp as u128) {
            Some(decay) if decay < self.bias => self.bias - decay,
            _ => 0,
        }
    }

    /// Remove a cohort of locks that all expire at `expiry`
    ///
    /// `expiring_slope` is the summed slope of the cohort; each of those
    /// locks contributed `slope * expiry` to the bias.
    pub fn subtract_expired(&self, expiring_slope: u128, expiry: u64) -> Result<Self> {
        if expiring_slope == 0 {
            return Ok(*self);
        }
        let expired = VeBalance {
            bias: expiring_slope
                .checked_mul(expiry as u128)
                .ok_or(ProtocolError::ArithmeticOverflow)?,
            slope: expiring_slope,
        };
        self.sub(&expired)
    }

    pub fn is_zero(&self) -> bool {
        self.bias == 0 && self.slope == 0
    }
}
