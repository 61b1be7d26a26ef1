//! Per-transaction lifecycle task
//!
//! Every in-flight transaction is driven by one task consuming typed
//! messages: adapter results, quorum signals, and its own quorum deadline.
//! Status changes all go through the store's guarded transition, so a message
//! that arrives after the state has moved on loses the race and is dropped.

use crate::chain::{AdapterError, ChainAdapter, LegReceipt, TransferLeg};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::state::{BridgeTransaction, TransactionStatus, TransactionStore};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Messages a lifecycle task reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Locked { tx_hash: String },
    LockFailed { error: AdapterError },
    QuorumReached { signatures: usize },
    QuorumTimeout,
    Completed { tx_hash: String },
    CompletionFailed { error: AdapterError },
    Refunded { tx_hash: String },
    RefundFailed { error: AdapterError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Lock,
    Completion,
    Refund,
}

impl Leg {
    fn as_str(&self) -> &'static str {
        match self {
            Leg::Lock => "lock",
            Leg::Completion => "completion",
            Leg::Refund => "refund",
        }
    }
}

/// Retry, refund and deadline settings shared by all lifecycles
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Attempts per lock or completion leg on retryable adapter errors
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_refund_attempts: u32,
    pub refund_retry_delay: Duration,
    pub quorum_timeout: Duration,
    pub signature_threshold: usize,
}

impl LifecyclePolicy {
    pub fn from_config(config: &BridgeConfig, signature_threshold: usize) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            max_refund_attempts: config.max_refund_attempts,
            refund_retry_delay: config.refund_retry_delay(),
            quorum_timeout: config.quorum_timeout(),
            signature_threshold,
        }
    }
}

/// Sending side of a running lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleHandle {
    /// Returns `false` once the lifecycle has finished
    pub fn send(&self, event: LifecycleEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.sender.is_closed()
    }
}

enum Flow {
    Continue,
    Done,
}

/// State machine driver for a single transaction
pub struct TransactionLifecycle {
    tx: BridgeTransaction,
    store: Arc<TransactionStore>,
    adapter: Arc<dyn ChainAdapter>,
    policy: LifecyclePolicy,
    inbox: mpsc::UnboundedReceiver<LifecycleEvent>,
    outbox: mpsc::UnboundedSender<LifecycleEvent>,
    deadline: Option<Instant>,
}

impl TransactionLifecycle {
    /// Start driving `tx` from whatever status it is currently in
    pub fn spawn(
        tx: BridgeTransaction,
        store: Arc<TransactionStore>,
        adapter: Arc<dyn ChainAdapter>,
        policy: LifecyclePolicy,
    ) -> (LifecycleHandle, JoinHandle<()>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let lifecycle = Self {
            tx,
            store,
            adapter,
            policy,
            inbox,
            outbox: sender.clone(),
            deadline: None,
        };
        let task = tokio::spawn(lifecycle.run());
        (LifecycleHandle { sender }, task)
    }

    async fn run(mut self) {
        let id = self.tx.id;
        match self.resume().await {
            Ok(Flow::Done) => return,
            Ok(Flow::Continue) => {}
            Err(e) => error!(tx_id = %id, "Failed to resume lifecycle: {}", e),
        }

        loop {
            let event = tokio::select! {
                biased;
                Some(event) = self.inbox.recv() => event,
                _ = quorum_deadline(self.deadline) => LifecycleEvent::QuorumTimeout,
                else => break,
            };

            let redelivery = event.clone();
            match self.handle(event).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => break,
                Err(e) if e.is_stale() => {
                    debug!(tx_id = %id, "Dropped late {:?}: {}", redelivery, e);
                }
                Err(e) if e.is_retryable() => {
                    warn!(tx_id = %id, "Handling {:?} failed, retrying: {}", redelivery, e);
                    self.redeliver(redelivery, self.policy.retry_delay);
                }
                Err(e) if e.should_alert() => {
                    error!(tx_id = %id, "Handling {:?} failed: {}", redelivery, e);
                }
                Err(e) => {
                    warn!(tx_id = %id, "Handling {:?} failed: {}", redelivery, e);
                }
            }
        }

        debug!(tx_id = %id, "Lifecycle finished in {}", self.tx.status);
    }

    /// Pick up from the persisted status
    async fn resume(&mut self) -> BridgeResult<Flow> {
        match self.tx.status {
            TransactionStatus::Initiated => {
                self.spawn_leg(Leg::Lock, Duration::ZERO);
                Ok(Flow::Continue)
            }
            TransactionStatus::Locked => {
                self.enter_validation().await?;
                Ok(Flow::Continue)
            }
            TransactionStatus::Validating => {
                let elapsed = (Utc::now() - self.tx.updated_at)
                    .to_std()
                    .unwrap_or_default();
                self.arm_deadline(self.policy.quorum_timeout.saturating_sub(elapsed));
                self.check_collected_quorum();
                Ok(Flow::Continue)
            }
            TransactionStatus::Completing => {
                self.spawn_leg(Leg::Completion, Duration::ZERO);
                Ok(Flow::Continue)
            }
            TransactionStatus::Failed if self.tx.awaiting_refund() => {
                self.spawn_leg(Leg::Refund, Duration::ZERO);
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Done),
        }
    }

    async fn handle(&mut self, event: LifecycleEvent) -> BridgeResult<Flow> {
        let id = self.tx.id;
        match event {
            LifecycleEvent::Locked { tx_hash } => {
                if self.tx.status == TransactionStatus::Initiated {
                    info!(tx_id = %id, %tx_hash, "Source funds locked");
                    self.tx = self.store.mark_locked(id, tx_hash).await?;
                }
                self.enter_validation().await?;
                Ok(Flow::Continue)
            }

            LifecycleEvent::LockFailed { error } => {
                let reason = adapter_failure(Leg::Lock, &error);
                warn!(tx_id = %id, "{}", reason);
                self.tx = self
                    .store
                    .mark_failed(id, TransactionStatus::Initiated, reason)
                    .await?;
                // Nothing was locked, so there is nothing to refund
                Ok(Flow::Done)
            }

            LifecycleEvent::QuorumReached { signatures } => self.begin_completion(signatures).await,

            LifecycleEvent::QuorumTimeout => {
                self.deadline = None;
                let current = self.store.get(id).await?;
                if current.signature_count() >= self.policy.signature_threshold {
                    // Quorum landed before the deadline; its signal is still in flight
                    return self.begin_completion(current.signature_count()).await;
                }
                let reason = BridgeError::QuorumTimeout {
                    tx_id: id,
                    collected: current.signature_count(),
                    required: self.policy.signature_threshold,
                }
                .to_string();
                warn!(tx_id = %id, "{}", reason);
                self.fail_and_refund(TransactionStatus::Validating, reason)
                    .await
            }

            LifecycleEvent::Completed { tx_hash } => {
                self.tx = self.store.mark_completed(id, tx_hash).await?;
                let finished = self.tx.completed_at.unwrap_or_else(Utc::now);
                let latency = (finished - self.tx.created_at).num_milliseconds() as f64 / 1000.0;
                crate::metrics::record_completion_latency(
                    self.tx.direction.source.as_str(),
                    self.tx.direction.destination.as_str(),
                    latency,
                );
                info!(tx_id = %id, latency_secs = latency, "Bridge transfer completed");
                Ok(Flow::Done)
            }

            LifecycleEvent::CompletionFailed { error } => {
                let reason = adapter_failure(Leg::Completion, &error);
                warn!(tx_id = %id, "{}", reason);
                self.fail_and_refund(TransactionStatus::Completing, reason)
                    .await
            }

            LifecycleEvent::Refunded { tx_hash } => {
                self.tx = self.store.mark_refunded(id, tx_hash).await?;
                crate::metrics::record_refund("refunded");
                info!(tx_id = %id, "Source funds refunded");
                Ok(Flow::Done)
            }

            LifecycleEvent::RefundFailed { error } => {
                self.tx = self
                    .store
                    .record_refund_failure(id, self.policy.max_refund_attempts)
                    .await?;
                if self.tx.requires_manual_intervention {
                    crate::metrics::record_refund("manual_intervention");
                    error!(
                        tx_id = %id,
                        attempts = self.tx.refund_attempts,
                        "Refund abandoned, manual intervention required: {}",
                        error
                    );
                    return Ok(Flow::Done);
                }

                crate::metrics::record_refund("retry");
                warn!(
                    tx_id = %id,
                    "Refund attempt {}/{} failed: {}",
                    self.tx.refund_attempts, self.policy.max_refund_attempts, error
                );
                self.spawn_leg(Leg::Refund, self.policy.refund_retry_delay);
                Ok(Flow::Continue)
            }
        }
    }

    /// VALIDATING -> COMPLETING, then submit the destination leg
    async fn begin_completion(&mut self, signatures: usize) -> BridgeResult<Flow> {
        let id = self.tx.id;
        self.tx = self.store.begin_completion(id).await?;
        self.deadline = None;
        info!(tx_id = %id, signatures, "Quorum consumed, completing transfer");
        self.spawn_leg(Leg::Completion, Duration::ZERO);
        Ok(Flow::Continue)
    }

    /// LOCKED -> VALIDATING, then wait for quorum until the deadline
    async fn enter_validation(&mut self) -> BridgeResult<()> {
        self.tx = self.store.begin_validation(self.tx.id).await?;
        self.arm_deadline(self.policy.quorum_timeout);
        self.check_collected_quorum();
        Ok(())
    }

    /// Signatures may already satisfy the threshold when the quorum signal
    /// was emitted before a restart; replay it to ourselves.
    fn check_collected_quorum(&self) {
        let signatures = self.tx.signature_count();
        if signatures >= self.policy.signature_threshold {
            debug!(tx_id = %self.tx.id, signatures, "Quorum already collected");
            let _ = self.outbox.send(LifecycleEvent::QuorumReached { signatures });
        }
    }

    async fn fail_and_refund(
        &mut self,
        from: TransactionStatus,
        reason: String,
    ) -> BridgeResult<Flow> {
        self.tx = self.store.mark_failed(self.tx.id, from, reason).await?;
        self.deadline = None;
        if !self.tx.source_locked() {
            return Ok(Flow::Done);
        }
        self.spawn_leg(Leg::Refund, Duration::ZERO);
        Ok(Flow::Continue)
    }

    fn arm_deadline(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    fn redeliver(&self, event: LifecycleEvent, delay: Duration) {
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = outbox.send(event);
        });
    }

    fn transfer_leg(&self, leg: Leg) -> TransferLeg {
        let tx = &self.tx;
        let (chain, address, amount) = match leg {
            Leg::Lock | Leg::Refund => (tx.direction.source, tx.source_address.clone(), tx.amount),
            Leg::Completion => (
                tx.direction.destination,
                tx.destination_address.clone(),
                tx.net_amount,
            ),
        };
        TransferLeg {
            transaction_id: tx.id,
            direction: tx.direction,
            chain,
            address,
            amount,
        }
    }

    /// Run one adapter leg in the background and report its outcome
    fn spawn_leg(&self, leg: Leg, delay: Duration) {
        let adapter = self.adapter.clone();
        let outbox = self.outbox.clone();
        let transfer = self.transfer_leg(leg);
        // Each refund call counts as one refund attempt on the record
        let max_attempts = match leg {
            Leg::Refund => 1,
            Leg::Lock | Leg::Completion => self.policy.max_retries.max(1),
        };
        let retry_delay = self.policy.retry_delay;

        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let result =
                call_with_retry(adapter.as_ref(), leg, &transfer, max_attempts, retry_delay).await;
            let event = match (leg, result) {
                (Leg::Lock, Ok(r)) => LifecycleEvent::Locked { tx_hash: r.tx_hash },
                (Leg::Lock, Err(error)) => LifecycleEvent::LockFailed { error },
                (Leg::Completion, Ok(r)) => LifecycleEvent::Completed { tx_hash: r.tx_hash },
                (Leg::Completion, Err(error)) => LifecycleEvent::CompletionFailed { error },
                (Leg::Refund, Ok(r)) => LifecycleEvent::Refunded { tx_hash: r.tx_hash },
                (Leg::Refund, Err(error)) => LifecycleEvent::RefundFailed { error },
            };
            if outbox.send(event).is_err() {
                debug!(
                    tx_id = %transfer.transaction_id,
                    "{} result arrived after lifecycle ended",
                    leg.as_str()
                );
            }
        });
    }
}

async fn call_with_retry(
    adapter: &dyn ChainAdapter,
    leg: Leg,
    transfer: &TransferLeg,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<LegReceipt, AdapterError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = match leg {
            Leg::Lock => adapter.lock(transfer).await,
            Leg::Completion => adapter.complete_transfer(transfer).await,
            Leg::Refund => adapter.refund(transfer).await,
        };

        match result {
            Ok(receipt) => {
                debug!(
                    tx_id = %transfer.transaction_id,
                    "{} leg confirmed on {}: {} (attempt {}/{})",
                    leg.as_str(),
                    transfer.chain,
                    receipt.tx_hash,
                    attempts,
                    max_attempts
                );
                return Ok(receipt);
            }
            Err(e) => {
                crate::metrics::record_adapter_failure(leg.as_str(), e.retryable);
                if !e.retryable || attempts >= max_attempts {
                    return Err(e);
                }
                warn!(
                    tx_id = %transfer.transaction_id,
                    "{} leg failed (attempt {}/{}): {}",
                    leg.as_str(),
                    attempts,
                    max_attempts,
                    e
                );
                sleep(retry_delay).await;
            }
        }
    }
}

fn adapter_failure(leg: Leg, error: &AdapterError) -> String {
    BridgeError::AdapterFailure {
        leg: leg.as_str().to_string(),
        message: error.message.clone(),
    }
    .to_string()
}

async fn quorum_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
