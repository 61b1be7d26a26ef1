//! Chain adapter interface and per-direction routing
//!
//! Adapters perform the actual lock/burn, mint/release and refund operations
//! on each ledger. The engine only sees their receipts and failures.

use super::{BridgeDirection, ChainId};
use crate::config::{AdapterKind, Settings};
use crate::error::{BridgeError, BridgeResult};
use crate::state::TransactionId;

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// One leg of a transfer as handed to an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLeg {
    /// Adapters must treat repeated calls with the same id as the same operation
    pub transaction_id: TransactionId,
    pub direction: BridgeDirection,
    pub chain: ChainId,
    pub address: String,
    pub amount: u128,
}

/// Confirmed chain operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegReceipt {
    pub tx_hash: String,
}

/// Chain rejected or could not process a leg
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
    pub retryable: bool,
}

impl AdapterError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Chain operations for one bridge direction.
///
/// Each call resolves once the operation is final on its chain
/// (after the chain's required confirmations), or fails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Lock or burn the source funds
    async fn lock(&self, leg: &TransferLeg) -> Result<LegReceipt, AdapterError>;

    /// Mint or release the net amount on the destination chain
    async fn complete_transfer(&self, leg: &TransferLeg) -> Result<LegReceipt, AdapterError>;

    /// Return locked funds to the source address
    async fn refund(&self, leg: &TransferLeg) -> Result<LegReceipt, AdapterError>;
}

/// Maps each supported direction to its adapter
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<BridgeDirection, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, direction: BridgeDirection, adapter: Arc<dyn ChainAdapter>) {
        debug!("Registered adapter for {}", direction);
        self.adapters.insert(direction, adapter);
    }

    #[cfg(test)]
    pub fn with(mut self, direction: BridgeDirection, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.register(direction, adapter);
        self
    }

    pub fn get(&self, direction: &BridgeDirection) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(direction).cloned()
    }

    /// Build adapters for every configured route
    pub fn from_settings(settings: &Settings) -> BridgeResult<Self> {
        let mut registry = Self::new();
        for route in &settings.routes {
            let direction = BridgeDirection::new(route.source, route.destination);
            if registry.adapters.contains_key(&direction) {
                return Err(BridgeError::Config(format!(
                    "Route {} configured twice",
                    direction
                )));
            }
            let adapter: Arc<dyn ChainAdapter> = match route.adapter {
                AdapterKind::Simulated => Arc::new(SimulatedAdapter::new(Duration::from_millis(
                    route.simulated_latency_ms,
                ))),
            };
            info!("Route {} using {:?} adapter", direction, route.adapter);
            registry.register(direction, adapter);
        }
        Ok(registry)
    }
}

/// In-process adapter that confirms every leg after a fixed latency.
///
/// Used for local runs and for exercising failure paths: lock or completion
/// can be set to fail, and refunds can fail a given number of times first.
#[derive(Debug, Default)]
pub struct SimulatedAdapter {
    latency: Duration,
    fail_lock: bool,
    fail_completion: bool,
    transient_failures: AtomicU32,
    refund_failures: AtomicU32,
}

impl SimulatedAdapter {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn failing_lock(mut self) -> Self {
        self.fail_lock = true;
        self
    }

    #[cfg(test)]
    pub fn failing_completion(mut self) -> Self {
        self.fail_completion = true;
        self
    }

    /// Fail the next `count` lock or completion calls with a retryable error
    #[cfg(test)]
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` refunds
    #[cfg(test)]
    pub fn with_refund_failures(self, count: u32) -> Self {
        self.refund_failures.store(count, Ordering::SeqCst);
        self
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn receipt(kind: &str, leg: &TransferLeg) -> LegReceipt {
        let mut hasher = Keccak256::new();
        hasher.update(kind.as_bytes());
        hasher.update(leg.transaction_id.0.as_bytes());
        hasher.update(leg.chain.as_str().as_bytes());
        LegReceipt {
            tx_hash: format!("0x{}", hex::encode(hasher.finalize())),
        }
    }

    async fn settle(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ChainAdapter for SimulatedAdapter {
    async fn lock(&self, leg: &TransferLeg) -> Result<LegReceipt, AdapterError> {
        self.settle().await;
        if Self::take(&self.transient_failures) {
            return Err(AdapterError::transient("source chain unavailable"));
        }
        if self.fail_lock {
            return Err(AdapterError::rejected("source chain rejected lock"));
        }
        Ok(Self::receipt("lock", leg))
    }

    async fn complete_transfer(&self, leg: &TransferLeg) -> Result<LegReceipt, AdapterError> {
        self.settle().await;
        if Self::take(&self.transient_failures) {
            return Err(AdapterError::transient("destination chain unavailable"));
        }
        if self.fail_completion {
            return Err(AdapterError::rejected("destination chain rejected transfer"));
        }
        Ok(Self::receipt("complete", leg))
    }

    async fn refund(&self, leg: &TransferLeg) -> Result<LegReceipt, AdapterError> {
        self.settle().await;
        if Self::take(&self.refund_failures) {
            return Err(AdapterError::transient("refund not confirmed"));
        }
        Ok(Self::receipt("refund", leg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn leg() -> TransferLeg {
        TransferLeg {
            transaction_id: TransactionId(Uuid::new_v4()),
            direction: BridgeDirection::new(ChainId::Vrty, ChainId::Ethereum),
            chain: ChainId::Vrty,
            address: "vrty1sender".to_string(),
            amount: 1_000,
        }
    }

    #[tokio::test]
    async fn test_simulated_receipts_are_deterministic_per_leg() {
        let adapter = SimulatedAdapter::new(Duration::ZERO);
        let leg = leg();
        let a = adapter.lock(&leg).await.unwrap();
        let b = adapter.lock(&leg).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, adapter.refund(&leg).await.unwrap());
        assert_eq!(a.tx_hash.len(), 66);
    }

    #[tokio::test]
    async fn test_simulated_failure_scripting() {
        let adapter = SimulatedAdapter::new(Duration::ZERO)
            .failing_completion()
            .with_refund_failures(1);
        let leg = leg();

        assert!(adapter.lock(&leg).await.is_ok());
        let err = adapter.complete_transfer(&leg).await.unwrap_err();
        assert!(!err.retryable);
        assert!(adapter.refund(&leg).await.is_err());
        assert!(adapter.refund(&leg).await.is_ok());

        let frozen = SimulatedAdapter::new(Duration::ZERO).failing_lock();
        assert_eq!(
            frozen.lock(&leg).await.unwrap_err(),
            AdapterError::rejected("source chain rejected lock")
        );
    }

    #[tokio::test]
    async fn test_registry_lookup_by_direction() {
        let direction = BridgeDirection::new(ChainId::Vrty, ChainId::Ethereum);
        let registry = AdapterRegistry::new()
            .with(direction, Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        assert!(registry.get(&direction).is_some());
        assert!(registry
            .get(&BridgeDirection::new(ChainId::Ethereum, ChainId::Vrty))
            .is_none());
    }
}
