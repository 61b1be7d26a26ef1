//! Bridge transaction record and its state machine

use crate::chain::{BridgeDirection, FeeQuote};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle states.
///
/// ```text
/// INITIATED -> LOCKED -> VALIDATING -> COMPLETING -> COMPLETED
///     \__________\___________\_____________\------> FAILED -> REFUNDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    Locked,
    Validating,
    Completing,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 7] = [
        TransactionStatus::Initiated,
        TransactionStatus::Locked,
        TransactionStatus::Validating,
        TransactionStatus::Completing,
        TransactionStatus::Completed,
        TransactionStatus::Failed,
        TransactionStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "INITIATED",
            TransactionStatus::Locked => "LOCKED",
            TransactionStatus::Validating => "VALIDATING",
            TransactionStatus::Completing => "COMPLETING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Refunded => "REFUNDED",
        }
    }

    /// Edges of the state machine
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Initiated, Locked)
                | (Locked, Validating)
                | (Validating, Completing)
                | (Completing, Completed)
                | (Initiated | Locked | Validating | Completing, Failed)
                | (Failed, Refunded)
        )
    }

    /// No further transitions once reached. `FAILED` is not listed: it can
    /// still move to `REFUNDED`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Refunded
        )
    }

    /// Quorum has already been consumed or can no longer matter
    pub fn is_past_validation(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completing
                | TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::Refunded
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown transaction status {}", s))
    }
}

/// One validator attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    pub validator_address: String,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// The core aggregate: one cross-chain transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: TransactionId,
    pub direction: BridgeDirection,
    pub source_address: String,
    pub destination_address: String,
    pub amount: u128,
    pub fee: u128,
    pub net_amount: u128,
    pub status: TransactionStatus,
    /// Keyed by validator address; at most one entry per validator
    pub validator_signatures: BTreeMap<String, ValidatorSignature>,
    pub source_tx_hash: Option<String>,
    pub destination_tx_hash: Option<String>,
    pub refund_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub refund_attempts: u32,
    pub requires_manual_intervention: bool,
    pub idempotency_key: Option<String>,
}

impl BridgeTransaction {
    /// New `INITIATED` record with the fee split frozen in
    pub fn new(
        direction: BridgeDirection,
        source_address: impl Into<String>,
        destination_address: impl Into<String>,
        amount: u128,
        quote: FeeQuote,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::generate(),
            direction,
            source_address: source_address.into(),
            destination_address: destination_address.into(),
            amount,
            fee: quote.fee,
            net_amount: quote.net_amount,
            status: TransactionStatus::Initiated,
            validator_signatures: BTreeMap::new(),
            source_tx_hash: None,
            destination_tx_hash: None,
            refund_tx_hash: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            refund_attempts: 0,
            requires_manual_intervention: false,
            idempotency_key,
        }
    }

    /// Source funds were confirmed locked or burned
    pub fn source_locked(&self) -> bool {
        self.source_tx_hash.is_some()
    }

    /// Validators may attest once source funds are locked
    pub fn accepts_attestations(&self) -> bool {
        self.status != TransactionStatus::Initiated
            && !(self.status == TransactionStatus::Failed && !self.source_locked())
    }

    /// Refund is still owed for this record
    pub fn awaiting_refund(&self) -> bool {
        self.status == TransactionStatus::Failed
            && self.source_locked()
            && !self.requires_manual_intervention
    }

    pub fn signature_count(&self) -> usize {
        self.validator_signatures.len()
    }

    /// Keccak-256 digest over the transfer terms that validators sign
    pub fn attestation_digest(&self) -> String {
        let mut hasher = Keccak256::new();
        hasher.update(self.id.0.as_bytes());
        hasher.update(self.direction.source.as_str().as_bytes());
        hasher.update(self.direction.destination.as_str().as_bytes());
        hasher.update(self.source_address.as_bytes());
        hasher.update(self.destination_address.as_bytes());
        hasher.update(self.amount.to_be_bytes());
        hasher.update(self.net_amount.to_be_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
