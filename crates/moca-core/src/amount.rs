//! Token amounts in human-readable formats
//!
//! TOML integers stop at `i64::MAX`, well below 100 MOCA in base units.
//! Human-readable encodings write amounts that fit as integers and larger
//! ones as decimal strings; binary encodings keep the native `u128`.
//!
//! ```ignore
//! #[serde(with = "moca_core::amount")]
//! pub delegate_registration_fee: u128,
//! ```

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serializer};
use std::fmt;

pub fn serialize<S>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if !serializer.is_human_readable() {
        return serializer.serialize_u128(*amount);
    }
    match i64::try_from(*amount) {
        Ok(small) => serializer.serialize_i64(small),
        Err(_) => serializer.serialize_str(&amount.to_string()),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        deserializer.deserialize_any(AmountVisitor)
    } else {
        u128::deserialize(deserializer)
    }
}

/// Parse a decimal amount, allowing `_` separators
pub fn parse(s: &str) -> Option<u128> {
    let digits: String = s.trim().chars().filter(|c| *c != '_').collect();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

struct AmountVisitor;

impl<'de> Visitor<'de> for AmountVisitor {
    type Value = u128;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
        Ok(v as u128)
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
        u128::try_from(v).map_err(|_| E::custom(format!("negative amount {}", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
        parse(v).ok_or_else(|| E::custom(format!("invalid amount {:?}", v)))
    }
}
