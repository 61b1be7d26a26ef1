//! Error types for the bridge engine

use crate::chain::ChainId;
use crate::state::{TransactionId, TransactionStatus};

use thiserror::Error;

/// Request errors the caller can fix and retry. Raised before any
/// transaction record exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Chain {0} is not configured")]
    UnknownChain(String),

    #[error("Chain {0} is not active")]
    ChainInactive(ChainId),

    #[error("Source and destination chain are both {0}")]
    SameChain(ChainId),

    #[error("Bridging from {source_chain} to {destination} is not supported")]
    UnsupportedDirection {
        source_chain: ChainId,
        destination: ChainId,
    },

    #[error("Amount {amount} is below the minimum of {min}")]
    AmountBelowMinimum { amount: u128, min: u128 },

    #[error("Amount {amount} is above the maximum of {max}")]
    AmountAboveMaximum { amount: u128, max: u128 },

    #[error("Fee {fee} exceeds amount {amount}")]
    FeeExceedsAmount { amount: u128, fee: u128 },

    #[error("Fee computation overflowed for amount {0}")]
    FeeOverflow(u128),

    #[error("Invalid amount {value:?}: {reason}")]
    InvalidAmount { value: String, reason: String },

    #[error("Missing {0}")]
    MissingField(&'static str),

    #[error("Validator {0} is not part of the validator set")]
    UnknownValidator(String),

    #[error("Signature is empty or not valid hex")]
    InvalidSignature,

    #[error("Idempotency key {key} was already used for a different request")]
    IdempotencyKeyConflict { key: String },

    #[error("Transaction {id} is {status} and does not accept attestations")]
    NotAwaitingAttestations {
        id: TransactionId,
        status: TransactionStatus,
    },
}

impl ValidationError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::UnknownChain(_) => "unknown_chain",
            ValidationError::ChainInactive(_) => "chain_inactive",
            ValidationError::SameChain(_) => "same_chain",
            ValidationError::UnsupportedDirection { .. } => "unsupported_direction",
            ValidationError::AmountBelowMinimum { .. } => "amount_below_minimum",
            ValidationError::AmountAboveMaximum { .. } => "amount_above_maximum",
            ValidationError::FeeExceedsAmount { .. } => "fee_exceeds_amount",
            ValidationError::FeeOverflow(_) => "fee_overflow",
            ValidationError::InvalidAmount { .. } => "invalid_amount",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::IdempotencyKeyConflict { .. } => "idempotency_key_conflict",
            ValidationError::UnknownValidator(_) => "unknown_validator",
            ValidationError::InvalidSignature => "invalid_signature",
            ValidationError::NotAwaitingAttestations { .. } => "not_awaiting_attestations",
        }
    }
}

/// Main error type for the bridge engine
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stale transition for {tx_id}: expected {expected}, found {actual}")]
    StaleTransition {
        tx_id: TransactionId,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Adapter failure on {leg} leg: {message}")]
    AdapterFailure { leg: String, message: String },

    #[error("Quorum timeout for {tx_id}: {collected} of {required} signatures")]
    QuorumTimeout {
        tx_id: TransactionId,
        collected: usize,
        required: usize,
    },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: TransactionId },

    #[error("Transaction with idempotency key {key} already exists")]
    DuplicateTransaction { key: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Lost a race on the transition guard; the caller should reload or ignore.
    pub fn is_stale(&self) -> bool {
        matches!(self, BridgeError::StaleTransition { .. })
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::StaleTransition { .. } | BridgeError::Database(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidStateTransition { .. }
                | BridgeError::Database(_)
                | BridgeError::Internal(_)
        )
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
