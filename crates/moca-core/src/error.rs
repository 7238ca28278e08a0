//! Error types for Moca protocol operations
//!
//! Every failed precondition aborts the whole transaction. Errors are
//! grouped into coarse [`ErrorKind`]s so callers can tell a bad request
//! from a request that is merely early.

use crate::types::{Address, LockId, PoolId};
use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Coarse classification of a rejection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    StateConflict,
    TemporalConstraint,
    Capacity,
    Fatal,
}

/// Errors that can occur while applying a protocol transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // === Input validation ===
    /// Zero amount where a positive amount is required
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    /// Parallel arrays differ in length
    #[error("Array length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    /// Empty batch
    #[error("Empty input array")]
    EmptyInput,

    /// Percentage above the allowed maximum
    #[error("Percentage {value} exceeds maximum {max}")]
    PercentageTooHigh { value: u128, max: u128 },

    /// Generic malformed request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // === Authorization ===
    /// Caller lacks a protocol role
    #[error("Caller {caller} lacks role {role}")]
    MissingRole { caller: Address, role: &'static str },

    /// Caller does not own the lock
    #[error("Caller {caller} does not own lock {lock}")]
    NotLockOwner { caller: Address, lock: LockId },

    /// Generic authorization failure (e.g. wrong verifier asset address)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // === State conflicts ===
    #[error("Lock not found: {0}")]
    LockNotFound(LockId),

    #[error("Lock already withdrawn: {0}")]
    LockWithdrawn(LockId),

    #[error("Pool not found: {0}")]
    PoolNotFound(PoolId),

    #[error("Pool is not active: {0}")]
    PoolInactive(PoolId),

    #[error("Pool {pool} already processed in epoch {epoch}")]
    PoolAlreadyProcessed { epoch: u64, pool: PoolId },

    #[error("Delegate not registered: {0}")]
    DelegateNotRegistered(Address),

    #[error("Delegate already registered: {0}")]
    DelegateAlreadyRegistered(Address),

    /// Epoch is not in the phase the operation requires
    #[error("Epoch {epoch}: {reason}")]
    EpochPhase { epoch: u64, reason: &'static str },

    /// Lifecycle guard blocks the operation
    #[error("Lifecycle: {0}")]
    Lifecycle(&'static str),

    // === Temporal constraints ===
    #[error("Timestamp {0} is not week-aligned")]
    NotWeekAligned(u64),

    #[error("Lock duration {duration}s outside [{min}, {max}]")]
    InvalidLockDuration { duration: u64, min: u64, max: u64 },

    #[error("Lock {0} has expired")]
    LockExpired(LockId),

    #[error("Lock {0} has not expired yet")]
    LockNotExpired(LockId),

    #[error("Epoch {epoch} has not ended (ends at {ends_at})")]
    EpochNotEnded { epoch: u64, ends_at: u64 },

    #[error("Epoch {epoch} not finalized")]
    EpochNotFinalized { epoch: u64 },

    #[error("Withdrawal delay not elapsed: available from epoch {available_from}")]
    DelayNotElapsed { available_from: u64 },

    // === Arithmetic / capacity ===
    #[error("Insufficient voting power: requested {requested}, available {available}")]
    InsufficientVotingPower { requested: u128, available: u128 },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u128, available: u128 },

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Arithmetic underflow: {0}")]
    ArithmeticUnderflow(&'static str),

    // === Fatal ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ZeroAmount
            | Self::LengthMismatch { .. }
            | Self::EmptyInput
            | Self::PercentageTooHigh { .. }
            | Self::InvalidInput(_) => ErrorKind::InvalidInput,

            Self::MissingRole { .. } | Self::NotLockOwner { .. } | Self::Unauthorized(_) => {
                ErrorKind::Unauthorized
            }

            Self::LockNotFound(_)
            | Self::LockWithdrawn(_)
            | Self::PoolNotFound(_)
            | Self::PoolInactive(_)
            | Self::PoolAlreadyProcessed { .. }
            | Self::DelegateNotRegistered(_)
            | Self::DelegateAlreadyRegistered(_)
            | Self::EpochPhase { .. }
            | Self::Lifecycle(_) => ErrorKind::StateConflict,

            Self::NotWeekAligned(_)
            | Self::InvalidLockDuration { .. }
            | Self::LockExpired(_)
            | Self::LockNotExpired(_)
            | Self::EpochNotEnded { .. }
            | Self::EpochNotFinalized { .. }
            | Self::DelayNotElapsed { .. } => ErrorKind::TemporalConstraint,

            Self::InsufficientVotingPower { .. }
            | Self::InsufficientBalance { .. }
            | Self::ArithmeticOverflow
            | Self::ArithmeticUnderflow(_) => ErrorKind::Capacity,

            Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Stable error code for API responses
    pub fn code(&self) -> u32 {
        match self.kind() {
            ErrorKind::InvalidInput => 1000,
            ErrorKind::Unauthorized => 2000,
            ErrorKind::StateConflict => 3000,
            ErrorKind::TemporalConstraint => 4000,
            ErrorKind::Capacity => 5000,
            ErrorKind::Fatal => 9999,
        }
    }

    /// Whether resubmitting the same call later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockNotExpired(_)
                | Self::EpochNotEnded { .. }
                | Self::EpochNotFinalized { .. }
                | Self::DelayNotElapsed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ProtocolError::ZeroAmount.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            ProtocolError::PoolAlreadyProcessed { epoch: 1, pool: PoolId(1) }.kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(ProtocolError::NotWeekAligned(5).kind(), ErrorKind::TemporalConstraint);
        assert_eq!(ProtocolError::ArithmeticOverflow.code(), 5000);
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InsufficientVotingPower { requested: 10, available: 4 };
        let msg = format!("{}", err);
        assert!(msg.contains("requested 10"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ProtocolError::EpochNotEnded { epoch: 3, ends_at: 100 }.is_retryable());
        assert!(!ProtocolError::ZeroAmount.is_retryable());
    }
}
