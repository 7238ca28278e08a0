//! # Delegation Ledger
//!
//! The delegate axis of the escrow. A lock created with a delegate feeds
//! two tracks instead of its owner's personal one:
//!
//! - the delegate's aggregate, which the delegate votes with
//! - the (delegator, delegate) pair aggregate, which measures each
//!   delegator's share of the delegate's power when rewards are split
//!
//! Both use the same rollforward and checkpoint machinery as personal
//! accounts. The fee schedule delegates charge on delegated rewards is
//! also defined here.

use crate::track::AggregateTrack;
use moca_core::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationLedger {
    /// Mirror of the settlement controller's delegate registry
    registered: BTreeSet<Address>,
    delegates: BTreeMap<Address, AggregateTrack>,
    pairs: BTreeMap<(Address, Address), AggregateTrack>,
}

impl DelegationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, delegate: &Address) -> bool {
        self.registered.contains(delegate)
    }

    pub fn set_registered(&mut self, delegate: Address, registered: bool) {
        if registered {
            self.registered.insert(delegate);
        } else {
            self.registered.remove(&delegate);
        }
    }

    pub fn delegate_track(&self, delegate: &Address) -> Option<&AggregateTrack> {
        self.delegates.get(delegate)
    }

    pub fn delegate_track_mut(&mut self, delegate: Address) -> &mut AggregateTrack {
        self.delegates.entry(delegate).or_default()
    }

    pub fn pair_track(&self, delegator: &Address, delegate: &Address) -> Option<&AggregateTrack> {
        self.pairs.get(&(*delegator, *delegate))
    }

    pub fn pair_track_mut(&mut self, delegator: Address, delegate: Address) -> &mut AggregateTrack {
        self.pairs.entry((delegator, delegate)).or_default()
    }

    /// Delegates a delegator has pair tracks with
    pub fn delegates_of(&self, delegator: &Address) -> Vec<Address> {
        self.pairs
            .keys()
            .filter(|(owner, _)| owner == delegator)
            .map(|(_, delegate)| *delegate)
            .collect()
    }
}

/// How a fee update took effect
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeUpdate {
    /// Decrease, applies to the current epoch
    Immediate,
    /// Increase, applies from `effective_epoch`
    Deferred { effective_epoch: u64 },
}

/// Delegate fee percentage with deferred increases
///
/// Decreases apply at once. Increases wait a configurable number of
/// epochs, so a delegate cannot raise the fee on votes already cast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub current_fee_pct: u128,
    pub next_fee_pct: u128,
    /// Zero when no increase is pending
    pub next_fee_pct_epoch: u64,
}

impl FeeSchedule {
    pub fn new(fee_pct: u128) -> Self {
        Self { current_fee_pct: fee_pct, next_fee_pct: 0, next_fee_pct_epoch: 0 }
    }

    pub fn has_pending(&self) -> bool {
        self.next_fee_pct_epoch != 0
    }

    /// Fee applicable to votes cast in `epoch`
    pub fn fee_at(&self, epoch: u64) -> u128 {
        if self.has_pending() && epoch >= self.next_fee_pct_epoch {
            self.next_fee_pct
        } else {
            self.current_fee_pct
        }
    }

    /// Promote a pending increase once its epoch arrives
    pub fn settle(&mut self, epoch: u64) {
        if self.has_pending() && epoch >= self.next_fee_pct_epoch {
            self.current_fee_pct = self.next_fee_pct;
            self.next_fee_pct = 0;
            self.next_fee_pct_epoch = 0;
        }
    }

    pub fn update(&mut self, new_fee_pct: u128, current_epoch: u64, increase_delay_epochs: u64) -> FeeUpdate {
        self.settle(current_epoch);
        if new_fee_pct <= self.current_fee_pct {
            self.current_fee_pct = new_fee_pct;
            self.next_fee_pct = 0;
            self.next_fee_pct_epoch = 0;
            FeeUpdate::Immediate
        } else {
            let effective_epoch = current_epoch + increase_delay_epochs;
            self.next_fee_pct = new_fee_pct;
            self.next_fee_pct_epoch = effective_epoch;
            FeeUpdate::Deferred { effective_epoch }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_mirror() {
        let mut ledger = DelegationLedger::new();
        let delegate = Address::from_label("delegate");
        assert!(!ledger.is_registered(&delegate));
        ledger.set_registered(delegate, true);
        assert!(ledger.is_registered(&delegate));
        ledger.set_registered(delegate, false);
        assert!(!ledger.is_registered(&delegate));
    }

    #[test]
    fn test_fee_decrease_is_immediate() {
        let mut fees = FeeSchedule::new(1_000);
        assert_eq!(fees.update(500, 10, 2), FeeUpdate::Immediate);
        assert_eq!(fees.fee_at(10), 500);
    }

    #[test]
    fn test_fee_increase_is_deferred() {
        let mut fees = FeeSchedule::new(1_000);
        assert_eq!(fees.update(2_000, 10, 2), FeeUpdate::Deferred { effective_epoch: 12 });
        assert_eq!(fees.fee_at(10), 1_000);
        assert_eq!(fees.fee_at(11), 1_000);
        assert_eq!(fees.fee_at(12), 2_000);

        fees.settle(12);
        assert_eq!(fees.current_fee_pct, 2_000);
        assert!(!fees.has_pending());
    }

    #[test]
    fn test_decrease_cancels_pending_increase() {
        let mut fees = FeeSchedule::new(1_000);
        fees.update(3_000, 10, 2);
        fees.update(800, 11, 2);
        assert_eq!(fees.fee_at(20), 800);
        assert!(!fees.has_pending());
    }

    #[test]
    fn test_delegates_of() {
        let mut ledger = DelegationLedger::new();
        let alice = Address::from_label("alice");
        let d1 = Address::from_label("d1");
        let d2 = Address::from_label("d2");
        ledger.pair_track_mut(alice, d1);
        ledger.pair_track_mut(alice, d2);
        ledger.pair_track_mut(Address::from_label("bob"), d1);
        let mut ds = ledger.delegates_of(&alice);
        ds.sort();
        let mut expected = vec![d1, d2];
        expected.sort();
        assert_eq!(ds, expected);
    }
}
