//! Bridge orchestrator: request validation, lifecycle supervision and
//! quorum signal routing

use super::lifecycle::{LifecycleEvent, LifecycleHandle, LifecyclePolicy, TransactionLifecycle};
use crate::chain::{
    compute_fee, units, AdapterRegistry, BridgeDirection, BridgeMode, ChainAdapter, ChainId,
    ChainRegistry,
};
use crate::config::{BridgeConfig, ValidatorsConfig};
use crate::error::{BridgeError, BridgeResult, ValidationError};
use crate::quorum::{QuorumCollector, QuorumReached, SubmissionOutcome};
use crate::state::{
    BridgeTransaction, TransactionId, TransactionStats, TransactionStatus, TransactionStore,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Client request to move funds between chains
#[derive(Debug, Clone, Deserialize)]
pub struct InitiateRequest {
    pub source_chain: String,
    pub destination_chain: String,
    pub source_address: String,
    pub destination_address: String,
    /// Token units, e.g. "500" or "12.5"
    pub amount: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Accepted transfer as returned to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiateReceipt {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub direction: BridgeDirection,
    pub mode: BridgeMode,
    pub amount: String,
    pub fee: String,
    pub net_amount: String,
    pub estimated_time_secs: u64,
    /// Digest validators are expected to sign
    pub attestation_digest: String,
}

/// Acknowledgment of a validator attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttestationAck {
    pub transaction_id: TransactionId,
    pub validator_address: String,
    pub already_signed: bool,
    pub signatures: usize,
    pub threshold: usize,
    pub quorum_reached: bool,
}

/// Cross-chain bridge orchestrator
pub struct BridgeOrchestrator {
    /// Chain descriptors and supported directions
    registry: Arc<ChainRegistry>,
    /// Adapter per direction
    adapters: AdapterRegistry,
    /// Transaction store
    store: Arc<TransactionStore>,
    /// Validator attestations
    collector: Arc<QuorumCollector>,
    /// Quorum signals, taken by `run`
    quorum_rx: Mutex<Option<mpsc::UnboundedReceiver<QuorumReached>>>,
    /// Running lifecycle tasks
    lifecycles: DashMap<TransactionId, LifecycleHandle>,
    policy: LifecyclePolicy,
    token_decimals: u32,
    min_amount: u128,
    max_amount: u128,
    cleanup_interval: Duration,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl BridgeOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: &BridgeConfig,
        validators: &ValidatorsConfig,
        registry: Arc<ChainRegistry>,
        adapters: AdapterRegistry,
        store: Arc<TransactionStore>,
    ) -> BridgeResult<Self> {
        let (min_amount, max_amount) = config.amount_bounds()?;
        let (signals, quorum_rx) = mpsc::unbounded_channel();
        let collector = Arc::new(QuorumCollector::new(
            validators.threshold,
            validators.addresses.iter().cloned(),
            store.clone(),
            signals,
        )?);

        for direction in registry.supported_directions() {
            if adapters.get(&direction).is_none() {
                warn!("Direction {} has no adapter and will be rejected", direction);
            }
        }

        Ok(Self {
            registry,
            adapters,
            store,
            collector,
            quorum_rx: Mutex::new(Some(quorum_rx)),
            lifecycles: DashMap::new(),
            policy: LifecyclePolicy::from_config(config, validators.threshold),
            token_decimals: config.token_decimals,
            min_amount,
            max_amount,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Validate a request, create the transaction and start its lifecycle.
    ///
    /// Validation failures are returned before any record exists. A request
    /// repeating a known idempotency key gets the existing receipt, unless its
    /// terms differ from the stored transaction.
    pub async fn initiate(&self, request: InitiateRequest) -> BridgeResult<InitiateReceipt> {
        match self.try_initiate(request).await {
            Err(BridgeError::Validation(e)) => {
                debug!("Rejected bridge request: {}", e);
                crate::metrics::record_rejection(e.kind());
                Err(e.into())
            }
            other => other,
        }
    }

    async fn try_initiate(&self, request: InitiateRequest) -> BridgeResult<InitiateReceipt> {
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                return self.replay(key, &existing, &request);
            }
        }

        let source: ChainId = request.source_chain.parse()?;
        let destination: ChainId = request.destination_chain.parse()?;
        if request.source_address.trim().is_empty() {
            return Err(ValidationError::MissingField("source_address").into());
        }
        if request.destination_address.trim().is_empty() {
            return Err(ValidationError::MissingField("destination_address").into());
        }

        let route = self.registry.resolve(source, destination)?;
        let adapter = self.adapters.get(&route.direction).ok_or(
            ValidationError::UnsupportedDirection {
                source_chain: source,
                destination,
            },
        )?;

        let amount = units::parse_amount(&request.amount, self.token_decimals)?;
        if amount < self.min_amount {
            return Err(ValidationError::AmountBelowMinimum {
                amount,
                min: self.min_amount,
            }
            .into());
        }
        if amount > self.max_amount {
            return Err(ValidationError::AmountAboveMaximum {
                amount,
                max: self.max_amount,
            }
            .into());
        }

        let quote = compute_fee(amount, &route.destination.fee_schedule)?;
        let tx = BridgeTransaction::new(
            route.direction,
            request.source_address.trim(),
            request.destination_address.trim(),
            amount,
            quote,
            request.idempotency_key.clone(),
        );

        let tx = match self.store.create(tx).await {
            Ok(tx) => tx,
            Err(BridgeError::DuplicateTransaction { key }) => {
                // A concurrent request with the same key won the insert
                let existing = self.store.find_by_idempotency_key(&key).await?.ok_or_else(|| {
                    BridgeError::Internal(format!("idempotency key {} has no record", key))
                })?;
                return self.replay(&key, &existing, &request);
            }
            Err(e) => return Err(e),
        };

        info!(
            tx_id = %tx.id,
            direction = %tx.direction,
            amount = %units::format_amount(tx.amount, self.token_decimals),
            fee = %units::format_amount(tx.fee, self.token_decimals),
            "Bridge transaction initiated"
        );
        crate::metrics::record_initiated(source.as_str(), destination.as_str());

        let receipt = self.receipt(&tx);
        self.start_lifecycle(tx, adapter);
        Ok(receipt)
    }

    /// Receipt for a repeated idempotency key, if the request matches the record
    fn replay(
        &self,
        key: &str,
        existing: &BridgeTransaction,
        request: &InitiateRequest,
    ) -> BridgeResult<InitiateReceipt> {
        let same_direction = matches!(
            (
                request.source_chain.parse::<ChainId>(),
                request.destination_chain.parse::<ChainId>(),
            ),
            (Ok(source), Ok(destination))
                if source == existing.direction.source
                    && destination == existing.direction.destination
        );
        let same_amount = units::parse_amount(&request.amount, self.token_decimals)
            .map_or(false, |amount| amount == existing.amount);

        if !same_direction
            || !same_amount
            || request.source_address.trim() != existing.source_address
            || request.destination_address.trim() != existing.destination_address
        {
            warn!("Idempotency key {} reused with different terms than {}", key, existing.id);
            return Err(ValidationError::IdempotencyKeyConflict {
                key: key.to_string(),
            }
            .into());
        }

        info!("Idempotent replay of {} for key {}", existing.id, key);
        Ok(self.receipt(existing))
    }

    /// Accept a validator attestation for a transaction
    pub async fn submit_attestation(
        &self,
        id: TransactionId,
        validator_address: &str,
        signature: Vec<u8>,
    ) -> BridgeResult<AttestationAck> {
        let tx = self.store.get(id).await?;
        if !tx.accepts_attestations() {
            crate::metrics::record_attestation("not_awaiting");
            return Err(ValidationError::NotAwaitingAttestations {
                id,
                status: tx.status,
            }
            .into());
        }

        let outcome = self
            .collector
            .submit(&tx, validator_address, signature)
            .await?;

        Ok(AttestationAck {
            transaction_id: id,
            validator_address: validator_address.to_string(),
            already_signed: matches!(outcome, SubmissionOutcome::AlreadySigned { .. }),
            signatures: outcome.signatures(),
            threshold: self.collector.threshold(),
            quorum_reached: outcome.quorum_reached(),
        })
    }

    /// Get a transaction
    pub async fn get(&self, id: TransactionId) -> BridgeResult<BridgeTransaction> {
        self.store.get(id).await
    }

    pub async fn stats(&self) -> BridgeResult<TransactionStats> {
        self.store.stats().await
    }

    pub async fn health_check(&self) -> BridgeResult<()> {
        self.store.health_check().await
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub fn token_decimals(&self) -> u32 {
        self.token_decimals
    }

    /// Lifecycles still running
    pub fn in_flight(&self) -> usize {
        self.lifecycles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Resume every unresolved transaction from the store
    pub async fn resume_pending(&self) -> BridgeResult<usize> {
        let pending = self.store.list_unresolved().await?;
        let mut resumed = 0;

        for tx in pending {
            match self.adapters.get(&tx.direction) {
                Some(adapter) => {
                    debug!("Resuming {} in {}", tx.id, tx.status);
                    self.start_lifecycle(tx, adapter);
                    resumed += 1;
                }
                None => {
                    error!(
                        "No adapter for {} - transaction {} left in {}",
                        tx.direction, tx.id, tx.status
                    );
                }
            }
        }

        info!("Resumed {} unresolved bridge transactions", resumed);
        Ok(resumed)
    }

    /// Main orchestration loop
    pub async fn run(&self) -> BridgeResult<()> {
        let mut quorum_rx = self
            .quorum_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| BridgeError::Internal("orchestrator is already running".to_string()))?;

        // Periodic cleanup
        let mut cleanup_interval = interval(self.cleanup_interval);

        info!("Bridge orchestrator started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                Some(signal) = quorum_rx.recv() => {
                    self.route_quorum(signal);
                }

                _ = cleanup_interval.tick() => {
                    self.cleanup();
                }
            }
        }

        info!("Bridge orchestrator stopped");
        Ok(())
    }

    /// Hand a quorum signal to the transaction's lifecycle
    fn route_quorum(&self, signal: QuorumReached) {
        let handle = self
            .lifecycles
            .get(&signal.transaction_id)
            .map(|h| h.value().clone());

        let delivered = handle
            .map(|h| {
                h.send(LifecycleEvent::QuorumReached {
                    signatures: signal.signatures,
                })
            })
            .unwrap_or(false);

        if !delivered {
            warn!(
                "Quorum for {} arrived with no running lifecycle",
                signal.transaction_id
            );
        }
    }

    /// Forget finished lifecycles and their attestation ledgers
    fn cleanup(&self) {
        self.lifecycles.retain(|_, handle| !handle.is_finished());

        let mut pruned = 0;
        for id in self.collector.tracked() {
            if !self.lifecycles.contains_key(&id) {
                self.collector.prune(id);
                pruned += 1;
            }
        }

        if pruned > 0 {
            debug!("Pruned {} attestation ledgers", pruned);
        }
    }

    fn start_lifecycle(&self, tx: BridgeTransaction, adapter: Arc<dyn ChainAdapter>) {
        let id = tx.id;
        let (handle, _task) =
            TransactionLifecycle::spawn(tx, self.store.clone(), adapter, self.policy.clone());
        self.lifecycles.insert(id, handle);
    }

    fn receipt(&self, tx: &BridgeTransaction) -> InitiateReceipt {
        let estimated_time_secs = [tx.direction.source, tx.direction.destination]
            .iter()
            .filter_map(|id| self.registry.get(*id))
            .map(|d| d.confirmation_time_secs())
            .sum();

        InitiateReceipt {
            transaction_id: tx.id,
            status: tx.status,
            direction: tx.direction,
            mode: tx.direction.mode(),
            amount: units::format_amount(tx.amount, self.token_decimals),
            fee: units::format_amount(tx.fee, self.token_decimals),
            net_amount: units::format_amount(tx.net_amount, self.token_decimals),
            estimated_time_secs,
            attestation_digest: tx.attestation_digest(),
        }
    }

    /// Stop the orchestrator
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Bridge orchestrator shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::adapter::MockChainAdapter;
    use crate::chain::adapter::SimulatedAdapter;
    use crate::chain::{AdapterError, ChainDescriptor, FeeSchedule, LegReceipt};
    use crate::events::BroadcastEventSink;
    use crate::state::MemoryRepository;

    const UNIT: u128 = 1_000_000_000_000_000_000;

    fn bridge_config() -> BridgeConfig {
        BridgeConfig {
            instance_id: "test".to_string(),
            token_decimals: 18,
            min_bridge_amount: "10".to_string(),
            max_bridge_amount: "10000000".to_string(),
            quorum_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 5,
            max_refund_attempts: 3,
            refund_retry_delay_ms: 5,
            cleanup_interval_secs: 1,
            event_buffer: 64,
        }
    }

    fn validators() -> ValidatorsConfig {
        ValidatorsConfig {
            threshold: 3,
            addresses: vec!["v1".into(), "v2".into(), "v3".into(), "v4".into()],
        }
    }

    fn descriptor(id: ChainId) -> ChainDescriptor {
        ChainDescriptor {
            id,
            native_asset_symbol: if id.is_native() { "VRTY" } else { "wVRTY" }.to_string(),
            confirmations_required: 6,
            block_time_secs: 5,
            fee_schedule: FeeSchedule {
                base_fee: 2 * UNIT,
                percentage_basis_points: 10,
                min_fee: 5 * UNIT,
                max_fee: 2_500 * UNIT,
            },
            is_active: id != ChainId::Bsc,
        }
    }

    fn orchestrator(adapter: Arc<dyn ChainAdapter>) -> (Arc<BridgeOrchestrator>, Arc<TransactionStore>) {
        let vrty_eth = BridgeDirection::new(ChainId::Vrty, ChainId::Ethereum);
        let vrty_bsc = BridgeDirection::new(ChainId::Vrty, ChainId::Bsc);
        let registry = ChainRegistry::new(
            vec![
                descriptor(ChainId::Vrty),
                descriptor(ChainId::Ethereum),
                descriptor(ChainId::Bsc),
            ],
            [vrty_eth, vrty_bsc],
        )
        .unwrap();
        let store = Arc::new(TransactionStore::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(BroadcastEventSink::new(64)),
        ));
        let orchestrator = BridgeOrchestrator::new(
            &bridge_config(),
            &validators(),
            Arc::new(registry),
            AdapterRegistry::new().with(vrty_eth, adapter),
            store.clone(),
        )
        .unwrap();
        (Arc::new(orchestrator), store)
    }

    fn request(amount: &str) -> InitiateRequest {
        InitiateRequest {
            source_chain: "vrty".to_string(),
            destination_chain: "ethereum".to_string(),
            source_address: "vrty1sender".to_string(),
            destination_address: "0xreceiver".to_string(),
            amount: amount.to_string(),
            idempotency_key: None,
        }
    }

    async fn wait_for(store: &TransactionStore, id: TransactionId, status: TransactionStatus) {
        for _ in 0..400 {
            if store.get(id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transaction {} never reached {}", id, status);
    }

    fn validation_error(err: BridgeError) -> ValidationError {
        match err {
            BridgeError::Validation(e) => e,
            other => panic!("expected a validation error, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_initiate_freezes_fee_split() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));

        let small = orchestrator.initiate(request("500")).await.unwrap();
        assert_eq!(small.status, TransactionStatus::Initiated);
        assert_eq!(small.fee, "5");
        assert_eq!(small.net_amount, "495");
        assert_eq!(small.mode, BridgeMode::LockAndMint);
        assert_eq!(small.estimated_time_secs, 60);

        let large = orchestrator.initiate(request("1000000")).await.unwrap();
        assert_eq!(large.fee, "1002");
        assert_eq!(large.net_amount, "998998");

        let tx = store.get(large.transaction_id).await.unwrap();
        assert_eq!(tx.fee + tx.net_amount, tx.amount);
        assert_eq!(tx.amount, 1_000_000 * UNIT);
    }

    #[tokio::test]
    async fn test_invalid_requests_create_nothing() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));

        let below = orchestrator.initiate(request("9.99")).await.unwrap_err();
        assert!(matches!(
            validation_error(below),
            ValidationError::AmountBelowMinimum { .. }
        ));

        let above = orchestrator.initiate(request("10000000.5")).await.unwrap_err();
        assert!(matches!(
            validation_error(above),
            ValidationError::AmountAboveMaximum { .. }
        ));

        let mut same = request("100");
        same.destination_chain = "vrty".to_string();
        assert_eq!(
            validation_error(orchestrator.initiate(same).await.unwrap_err()),
            ValidationError::SameChain(ChainId::Vrty)
        );

        let mut inactive = request("100");
        inactive.destination_chain = "bsc".to_string();
        assert_eq!(
            validation_error(orchestrator.initiate(inactive).await.unwrap_err()),
            ValidationError::ChainInactive(ChainId::Bsc)
        );

        let mut unknown = request("100");
        unknown.source_chain = "solana".to_string();
        assert!(matches!(
            validation_error(orchestrator.initiate(unknown).await.unwrap_err()),
            ValidationError::UnknownChain(_)
        ));

        let mut reverse = request("100");
        reverse.source_chain = "ethereum".to_string();
        reverse.destination_chain = "vrty".to_string();
        assert!(matches!(
            validation_error(orchestrator.initiate(reverse).await.unwrap_err()),
            ValidationError::UnsupportedDirection { .. }
        ));

        let mut blank = request("100");
        blank.destination_address = "  ".to_string();
        assert_eq!(
            validation_error(orchestrator.initiate(blank).await.unwrap_err()),
            ValidationError::MissingField("destination_address")
        );

        assert_eq!(store.stats().await.unwrap(), TransactionStats::default());
    }

    #[tokio::test]
    async fn test_amount_bounds_are_inclusive() {
        let (orchestrator, _) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        assert!(orchestrator.initiate(request("10")).await.is_ok());
        assert!(orchestrator.initiate(request("10000000")).await.is_ok());
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_existing_receipt() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        let mut req = request("500");
        req.idempotency_key = Some("client-42".to_string());

        let first = orchestrator.initiate(req.clone()).await.unwrap();
        let second = orchestrator.initiate(req).await.unwrap();
        assert_eq!(first.transaction_id, second.transaction_id);

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats.initiated + stats.locked + stats.validating,
            1,
            "duplicate request created a second record"
        );
    }

    #[tokio::test]
    async fn test_idempotency_key_with_different_terms_is_rejected() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        let mut req = request("500");
        req.idempotency_key = Some("client-7".to_string());
        let first = orchestrator.initiate(req.clone()).await.unwrap();

        let mut other_amount = req.clone();
        other_amount.amount = "600".to_string();
        let mut other_receiver = req.clone();
        other_receiver.destination_address = "0xsomeoneelse".to_string();
        let mut other_chain = req.clone();
        other_chain.destination_chain = "polygon".to_string();

        for conflicting in [other_amount, other_receiver, other_chain] {
            let err = orchestrator.initiate(conflicting).await.unwrap_err();
            assert!(
                matches!(
                    err,
                    BridgeError::Validation(ValidationError::IdempotencyKeyConflict { ref key })
                        if key == "client-7"
                ),
                "unexpected error: {}",
                err
            );
        }

        // Whitespace around addresses and an equivalent amount still replay
        let mut padded = req.clone();
        padded.source_address = format!("  {}  ", req.source_address);
        padded.amount = "500.0".to_string();
        let replay = orchestrator.initiate(padded).await.unwrap();
        assert_eq!(replay.transaction_id, first.transaction_id);

        let stored = store.get(first.transaction_id).await.unwrap();
        assert_eq!(stored.amount, units::parse_amount("500", 18).unwrap());
    }

    #[tokio::test]
    async fn test_end_to_end_quorum_completes_transfer() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        let runner = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run().await }
        });

        let receipt = orchestrator.initiate(request("500")).await.unwrap();
        let id = receipt.transaction_id;
        wait_for(&store, id, TransactionStatus::Validating).await;

        let v2 = orchestrator.submit_attestation(id, "v2", vec![2]).await.unwrap();
        let v1 = orchestrator.submit_attestation(id, "v1", vec![1]).await.unwrap();
        let again = orchestrator.submit_attestation(id, "v1", vec![9]).await.unwrap();
        assert!(!v2.quorum_reached && !v1.quorum_reached);
        assert!(again.already_signed);
        assert_eq!(again.signatures, 2);

        let v3 = orchestrator.submit_attestation(id, "v3", vec![3]).await.unwrap();
        assert!(v3.quorum_reached);

        wait_for(&store, id, TransactionStatus::Completed).await;

        // Late attestation is kept for audit but changes nothing else
        let late = orchestrator.submit_attestation(id, "v4", vec![4]).await.unwrap();
        assert!(!late.quorum_reached);
        let tx = store.get(id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.signature_count(), 4);

        orchestrator.stop().await;
        runner.abort();
    }

    #[tokio::test]
    async fn test_attestations_rejected_before_lock() {
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_lock()
            .returning(|_| Err(AdapterError::rejected("account frozen")));
        let (orchestrator, store) = orchestrator(Arc::new(adapter));

        let receipt = orchestrator.initiate(request("500")).await.unwrap();
        wait_for(&store, receipt.transaction_id, TransactionStatus::Failed).await;

        let err = orchestrator
            .submit_attestation(receipt.transaction_id, "v1", vec![1])
            .await
            .unwrap_err();
        assert!(matches!(
            validation_error(err),
            ValidationError::NotAwaitingAttestations { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_validator_is_rejected() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        let receipt = orchestrator.initiate(request("500")).await.unwrap();
        wait_for(&store, receipt.transaction_id, TransactionStatus::Validating).await;

        let err = orchestrator
            .submit_attestation(receipt.transaction_id, "mallory", vec![1])
            .await
            .unwrap_err();
        assert_eq!(
            validation_error(err),
            ValidationError::UnknownValidator("mallory".to_string())
        );
    }

    #[tokio::test]
    async fn test_completion_failure_refunds_source() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_lock().returning(|_| {
            Ok(LegReceipt {
                tx_hash: "0xlock".to_string(),
            })
        });
        adapter
            .expect_complete_transfer()
            .returning(|_| Err(AdapterError::rejected("bridge contract paused")));
        adapter.expect_refund().times(1).returning(|_| {
            Ok(LegReceipt {
                tx_hash: "0xrefund".to_string(),
            })
        });
        let (orchestrator, store) = orchestrator(Arc::new(adapter));
        let runner = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run().await }
        });

        let receipt = orchestrator.initiate(request("500")).await.unwrap();
        let id = receipt.transaction_id;
        wait_for(&store, id, TransactionStatus::Validating).await;
        for v in ["v1", "v2", "v3"] {
            orchestrator.submit_attestation(id, v, vec![7]).await.unwrap();
        }

        wait_for(&store, id, TransactionStatus::Refunded).await;
        let tx = store.get(id).await.unwrap();
        assert_eq!(tx.refund_tx_hash.as_deref(), Some("0xrefund"));
        assert!(tx.destination_tx_hash.is_none());

        runner.abort();
    }

    #[tokio::test]
    async fn test_concurrent_attestations_complete_once() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_lock().returning(|_| {
            Ok(LegReceipt {
                tx_hash: "0xlock".to_string(),
            })
        });
        adapter.expect_complete_transfer().times(1).returning(|_| {
            Ok(LegReceipt {
                tx_hash: "0xmint".to_string(),
            })
        });
        let (orchestrator, store) = orchestrator(Arc::new(adapter));
        let runner = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run().await }
        });

        let receipt = orchestrator.initiate(request("500")).await.unwrap();
        let id = receipt.transaction_id;
        wait_for(&store, id, TransactionStatus::Validating).await;

        let submissions: Vec<_> = ["v1", "v2", "v3", "v4"]
            .into_iter()
            .map(|v| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.submit_attestation(id, v, vec![1]).await })
            })
            .collect();
        let mut fired = 0;
        for submission in submissions {
            if submission.await.unwrap().unwrap().quorum_reached {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);

        wait_for(&store, id, TransactionStatus::Completed).await;
        runner.abort();
    }

    #[tokio::test]
    async fn test_resume_pending_drives_unresolved_records() {
        let (orchestrator, store) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        let direction = BridgeDirection::new(ChainId::Vrty, ChainId::Ethereum);
        let quote = compute_fee(500 * UNIT, &descriptor(ChainId::Ethereum).fee_schedule).unwrap();

        let stuck = store
            .create(BridgeTransaction::new(direction, "a", "b", 500 * UNIT, quote, None))
            .await
            .unwrap();
        store.mark_locked(stuck.id, "0xlock".to_string()).await.unwrap();
        store.begin_validation(stuck.id).await.unwrap();
        store.begin_completion(stuck.id).await.unwrap();

        let owed = store
            .create(BridgeTransaction::new(direction, "c", "d", 500 * UNIT, quote, None))
            .await
            .unwrap();
        store.mark_locked(owed.id, "0xlock".to_string()).await.unwrap();
        store
            .mark_failed(owed.id, TransactionStatus::Locked, "crashed".to_string())
            .await
            .unwrap();

        assert_eq!(orchestrator.resume_pending().await.unwrap(), 2);
        wait_for(&store, stuck.id, TransactionStatus::Completed).await;
        wait_for(&store, owed.id, TransactionStatus::Refunded).await;
    }

    #[tokio::test]
    async fn test_run_refuses_second_start() {
        let (orchestrator, _) = orchestrator(Arc::new(SimulatedAdapter::new(Duration::ZERO)));
        let runner = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(orchestrator.run().await.is_err());
        runner.abort();
    }
}
