//! Delegate registry
//!
//! Tracks registration, the fee schedule and the per-epoch fee snapshot
//! settlement uses. The snapshot is taken the first time a delegate votes
//! in an epoch and is only ever lowered afterwards.

use moca_core::{Address, ProtocolError, Result};
use moca_escrow::{FeeSchedule, FeeUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegate {
    pub is_registered: bool,

    pub fees: FeeSchedule,

    /// Fees booked across all delegators and epochs
    pub total_fees_accrued: u128,

    /// Gross rewards booked on delegated votes
    pub total_rewards_captured: u128,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateRegistry {
    delegates: BTreeMap<Address, Delegate>,

    /// Fee percentage frozen per (delegate, epoch)
    historical_fee_pcts: BTreeMap<(Address, u64), u128>,

    registration_fees_collected: u128,

    registration_fees_withdrawn: u128,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, delegate: &Address) -> Option<&Delegate> {
        self.delegates.get(delegate)
    }

    pub fn is_registered(&self, delegate: &Address) -> bool {
        self.delegates.get(delegate).map(|d| d.is_registered).unwrap_or(false)
    }

    pub fn register(&mut self, delegate: Address, fee_pct: u128, registration_fee: u128) -> Result<()> {
        if self.is_registered(&delegate) {
            return Err(ProtocolError::DelegateAlreadyRegistered(delegate));
        }
        let collected = self
            .registration_fees_collected
            .checked_add(registration_fee)
            .ok_or(ProtocolError::ArithmeticOverflow)?;
        let entry = self.delegates.entry(delegate).or_default();
        entry.is_registered = true;
        entry.fees = FeeSchedule::new(fee_pct);
        self.registration_fees_collected = collected;
        Ok(())
    }

    pub fn unregister(&mut self, delegate: &Address) -> Result<()> {
        match self.delegates.get_mut(delegate) {
            Some(d) if d.is_registered => {
                d.is_registered = false;
                Ok(())
            }
            _ => Err(ProtocolError::DelegateNotRegistered(*delegate)),
        }
    }

    /// Change the fee; a decrease also lowers an already-taken snapshot for `epoch`
    pub fn update_fee(&mut self, delegate: &Address, fee_pct: u128, epoch: u64, delay_epochs: u64) -> Result<FeeUpdate> {
        let entry = match self.delegates.get_mut(delegate) {
            Some(d) if d.is_registered => d,
            _ => return Err(ProtocolError::DelegateNotRegistered(*delegate)),
        };
        let update = entry.fees.update(fee_pct, epoch, delay_epochs);
        if update == FeeUpdate::Immediate {
            if let Some(snapshot) = self.historical_fee_pcts.get_mut(&(*delegate, epoch)) {
                if fee_pct < *snapshot {
                    *snapshot = fee_pct;
                }
            }
        }
        Ok(update)
    }

    /// Freeze the fee for `epoch` if not already frozen, returning the frozen value
    pub fn snapshot_fee(&mut self, delegate: &Address, epoch: u64) -> u128 {
        let fee = self
            .delegates
            .get(delegate)
            .map(|d| d.fees.fee_at(epoch))
            .unwrap_or(0);
        *self.historical_fee_pcts.entry((*delegate, epoch)).or_insert(fee)
    }

    /// Frozen fee, zero if the delegate never voted in `epoch`
    pub fn historical_fee_pct(&self, delegate: &Address, epoch: u64) -> u128 {
        self.historical_fee_pcts.get(&(*delegate, epoch)).copied().unwrap_or(0)
    }

    /// Add to the lifetime totals; these are statistics and saturate
    pub fn record_booking(&mut self, delegate: &Address, gross: u128, fee: u128) {
        let entry = self.delegates.entry(*delegate).or_default();
        entry.total_rewards_captured = entry.total_rewards_captured.saturating_add(gross);
        entry.total_fees_accrued = entry.total_fees_accrued.saturating_add(fee);
    }

    pub fn unwithdrawn_registration_fees(&self) -> u128 {
        self.registration_fees_collected.saturating_sub(self.registration_fees_withdrawn)
    }

    pub fn mark_registration_fees_withdrawn(&mut self) -> u128 {
        let amount = self.unwithdrawn_registration_fees();
        self.registration_fees_withdrawn = self.registration_fees_collected;
        amount
    }
}
