//! Asset movement
//!
//! Components only need all-or-nothing transfers between addresses, plus
//! the native-asset delivery path: try a plain native transfer and, if the
//! recipient refuses it, wrap the amount and deliver the wrapped token.
//!
//! [`AssetBook::begin`] opens an undo journal holding the prior balance of
//! every entry touched until [`AssetBook::commit`] or
//! [`AssetBook::rollback`], so a multi-transfer transaction can be undone
//! without copying the book.

use crate::error::{ProtocolError, Result};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Asset classes handled by the protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    /// Native MOCA
    Moca,
    /// Escrowed MOCA, also the reward and subsidy currency
    EsMoca,
    /// Wrapped native MOCA, used when a native transfer bounces
    WrappedMoca,
}

/// How a native transfer reached its recipient
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeDelivery {
    Native,
    Wrapped,
}

/// Transfer capability consumed by protocol components
pub trait AssetLedger {
    fn balance_of(&self, asset: Asset, owner: &Address) -> u128;

    /// Move `amount` of `asset`; fails without side effects if `from` is short
    fn transfer(&mut self, asset: Asset, from: &Address, to: &Address, amount: u128) -> Result<()>;

    /// Deliver native MOCA, falling back to wrapped MOCA if refused
    fn transfer_native_or_wrap(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<NativeDelivery>;
}

/// In-memory balance book
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBook {
    balances: BTreeMap<(Asset, Address), u128>,
    /// Addresses whose native receive hook reverts
    native_rejecting: BTreeSet<Address>,
    /// Balances as they stood before the open transaction first touched them
    #[serde(skip)]
    undo: Option<BTreeMap<(Asset, Address), u128>>,
}

impl AssetBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start journaling balance changes
    pub fn begin(&mut self) {
        self.undo = Some(BTreeMap::new());
    }

    /// Keep every change since [`AssetBook::begin`]
    pub fn commit(&mut self) {
        self.undo = None;
    }

    /// Restore every balance touched since [`AssetBook::begin`]
    pub fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        let touched = undo.len();
        for (key, amount) in undo {
            if amount == 0 {
                self.balances.remove(&key);
            } else {
                self.balances.insert(key, amount);
            }
        }
        debug!(touched, "asset changes rolled back");
    }

    fn remember(&mut self, key: (Asset, Address)) {
        if let Some(undo) = &mut self.undo {
            let before = self.balances.get(&key).copied().unwrap_or(0);
            undo.entry(key).or_insert(before);
        }
    }

    /// Credit new units (genesis funding, tests)
    pub fn mint(&mut self, asset: Asset, to: &Address, amount: u128) -> Result<()> {
        self.remember((asset, *to));
        let entry = self.balances.entry((asset, *to)).or_insert(0);
        *entry = entry.checked_add(amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        Ok(())
    }

    /// Make `account` refuse plain native transfers
    pub fn reject_native(&mut self, account: Address) {
        self.native_rejecting.insert(account);
    }

    pub fn total_of(&self, asset: Asset) -> u128 {
        self.balances
            .iter()
            .filter(|((a, _), _)| *a == asset)
            .map(|(_, amount)| *amount)
            .sum()
    }

    fn debit(&mut self, asset: Asset, from: &Address, amount: u128) -> Result<()> {
        let available = self.balance_of(asset, from);
        if available < amount {
            return Err(ProtocolError::InsufficientBalance { requested: amount, available });
        }
        let remaining = available - amount;
        self.remember((asset, *from));
        if remaining == 0 {
            self.balances.remove(&(asset, *from));
        } else {
            self.balances.insert((asset, *from), remaining);
        }
        Ok(())
    }
}

impl AssetLedger for AssetBook {
    fn balance_of(&self, asset: Asset, owner: &Address) -> u128 {
        self.balances.get(&(asset, *owner)).copied().unwrap_or(0)
    }

    fn transfer(&mut self, asset: Asset, from: &Address, to: &Address, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        // Check the credit side first so a failure leaves both sides untouched
        self.balance_of(asset, to)
            .checked_add(amount)
            .ok_or(ProtocolError::ArithmeticOverflow)?;
        self.debit(asset, from, amount)?;
        self.mint(asset, to, amount)
    }

    fn transfer_native_or_wrap(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<NativeDelivery> {
        if self.native_rejecting.contains(to) {
            self.balance_of(Asset::WrappedMoca, to)
                .checked_add(amount)
                .ok_or(ProtocolError::ArithmeticOverflow)?;
            self.debit(Asset::Moca, from, amount)?;
            self.mint(Asset::WrappedMoca, to, amount)?;
            debug!(%to, amount, "native transfer refused, delivered wrapped");
            Ok(NativeDelivery::Wrapped)
        } else {
            self.transfer(Asset::Moca, from, to, amount)?;
            Ok(NativeDelivery::Native)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_moves_balance() {
        let mut book = AssetBook::new();
        let alice = Address::from_label("alice");
        let bob = Address::from_label("bob");
        book.mint(Asset::EsMoca, &alice, 100).unwrap();

        book.transfer(Asset::EsMoca, &alice, &bob, 40).unwrap();
        assert_eq!(book.balance_of(Asset::EsMoca, &alice), 60);
        assert_eq!(book.balance_of(Asset::EsMoca, &bob), 40);
        assert_eq!(book.total_of(Asset::EsMoca), 100);
    }

    #[test]
    fn test_insufficient_balance_leaves_state() {
        let mut book = AssetBook::new();
        let alice = Address::from_label("alice");
        let bob = Address::from_label("bob");
        book.mint(Asset::Moca, &alice, 10).unwrap();

        let before = book.clone();
        let err = book.transfer(Asset::Moca, &alice, &bob, 11).unwrap_err();
        assert!(matches!(err, ProtocolError::InsufficientBalance { requested: 11, available: 10 }));
        assert_eq!(book, before);
    }

    #[test]
    fn test_rollback_restores_touched_entries() {
        let mut book = AssetBook::new();
        let alice = Address::from_label("alice");
        let bob = Address::from_label("bob");
        let carol = Address::from_label("carol");
        book.mint(Asset::EsMoca, &alice, 100).unwrap();
        book.mint(Asset::Moca, &bob, 5).unwrap();
        let before = book.clone();

        book.begin();
        book.transfer(Asset::EsMoca, &alice, &bob, 100).unwrap();
        book.transfer(Asset::EsMoca, &bob, &carol, 60).unwrap();
        book.transfer(Asset::Moca, &bob, &alice, 5).unwrap();
        assert_eq!(book.balance_of(Asset::EsMoca, &carol), 60);
        book.rollback();

        assert_eq!(book, before);
        assert_eq!(book.balance_of(Asset::EsMoca, &alice), 100);
        assert_eq!(book.balance_of(Asset::EsMoca, &carol), 0);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let mut book = AssetBook::new();
        let alice = Address::from_label("alice");
        let bob = Address::from_label("bob");
        book.mint(Asset::Moca, &alice, 10).unwrap();

        book.begin();
        book.transfer(Asset::Moca, &alice, &bob, 4).unwrap();
        book.commit();
        book.rollback();
        assert_eq!(book.balance_of(Asset::Moca, &alice), 6);
        assert_eq!(book.balance_of(Asset::Moca, &bob), 4);
    }

    #[test]
    fn test_native_fallback_wraps() {
        let mut book = AssetBook::new();
        let vault = Address::from_label("vault");
        let contract = Address::from_label("contract");
        let user = Address::from_label("user");
        book.mint(Asset::Moca, &vault, 100).unwrap();
        book.reject_native(contract);

        assert_eq!(book.transfer_native_or_wrap(&vault, &user, 30).unwrap(), NativeDelivery::Native);
        assert_eq!(
            book.transfer_native_or_wrap(&vault, &contract, 50).unwrap(),
            NativeDelivery::Wrapped
        );
        assert_eq!(book.balance_of(Asset::Moca, &user), 30);
        assert_eq!(book.balance_of(Asset::WrappedMoca, &contract), 50);
        assert_eq!(book.balance_of(Asset::Moca, &vault), 20);
    }
}
