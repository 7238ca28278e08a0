//! Payments collaborator
//!
//! Verification fees are collected elsewhere; settlement only needs how
//! much subsidy-eligible spend a verifier accrued in a pool versus the
//! whole pool.

use moca_core::{Address, PoolId, ProtocolError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[cfg_attr(test, mockall::automock)]
pub trait PaymentsController {
    /// `(verifier_accrued, pool_accrued)` for `epoch` and `pool_id`
    ///
    /// Fails unless `caller` is the verifier's registered asset address.
    fn verifier_and_pool_accrued_subsidies(
        &self,
        epoch: u64,
        pool_id: PoolId,
        verifier: &Address,
        caller: &Address,
    ) -> Result<(u128, u128)>;
}

#[derive(Debug, Default)]
struct Accruals {
    verifier: BTreeMap<(u64, PoolId, Address), u128>,
    pool: BTreeMap<(u64, PoolId), u128>,
    asset_addresses: BTreeMap<Address, Address>,
}

/// In-memory accrual table
///
/// A verifier without an explicit asset address claims from its own address.
#[derive(Debug, Default)]
pub struct StaticPayments {
    inner: RwLock<Accruals>,
}

impl StaticPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accrual(&self, epoch: u64, pool_id: PoolId, verifier: Address, amount: u128) -> Result<()> {
        let mut inner = self.inner.write();
        let verifier_entry = inner.verifier.entry((epoch, pool_id, verifier)).or_insert(0);
        *verifier_entry = verifier_entry.checked_add(amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        let pool_entry = inner.pool.entry((epoch, pool_id)).or_insert(0);
        *pool_entry = pool_entry.checked_add(amount).ok_or(ProtocolError::ArithmeticOverflow)?;
        Ok(())
    }

    pub fn set_asset_address(&self, verifier: Address, asset_address: Address) {
        self.inner.write().asset_addresses.insert(verifier, asset_address);
    }
}

impl PaymentsController for StaticPayments {
    fn verifier_and_pool_accrued_subsidies(
        &self,
        epoch: u64,
        pool_id: PoolId,
        verifier: &Address,
        caller: &Address,
    ) -> Result<(u128, u128)> {
        let inner = self.inner.read();
        let asset_address = inner.asset_addresses.get(verifier).copied().unwrap_or(*verifier);
        if asset_address != *caller {
            return Err(ProtocolError::Unauthorized(format!(
                "{} is not the asset address of verifier {}",
                caller, verifier
            )));
        }
        let verifier_accrued = inner.verifier.get(&(epoch, pool_id, *verifier)).copied().unwrap_or(0);
        let pool_accrued = inner.pool.get(&(epoch, pool_id)).copied().unwrap_or(0);
        Ok((verifier_accrued, pool_accrued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accruals_sum_per_pool() {
        let payments = StaticPayments::new();
        let v1 = Address::from_label("v1");
        let v2 = Address::from_label("v2");
        payments.record_accrual(3, PoolId(1), v1, 40).unwrap();
        payments.record_accrual(3, PoolId(1), v2, 60).unwrap();

        assert_eq!(payments.verifier_and_pool_accrued_subsidies(3, PoolId(1), &v1, &v1).unwrap(), (40, 100));
        assert_eq!(payments.verifier_and_pool_accrued_subsidies(4, PoolId(1), &v1, &v1).unwrap(), (0, 0));
    }

    #[test]
    fn test_caller_must_be_asset_address() {
        let payments = StaticPayments::new();
        let verifier = Address::from_label("verifier");
        let wallet = Address::from_label("wallet");
        payments.set_asset_address(verifier, wallet);

        assert!(payments.verifier_and_pool_accrued_subsidies(1, PoolId(1), &verifier, &verifier).is_err());
        assert!(payments.verifier_and_pool_accrued_subsidies(1, PoolId(1), &verifier, &wallet).is_ok());
    }
}
