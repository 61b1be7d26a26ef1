//! Bridge transaction store: guarded state transitions over a repository

use super::repository::{Mutation, TransactionRepository, TransactionStats};
use super::transaction::{BridgeTransaction, TransactionId, TransactionStatus, ValidatorSignature};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventSink, TransitionEvent};

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Attempts at appending a signature while the status keeps moving underneath
const MAX_SIGNATURE_RETRIES: usize = 8;

/// Owns the lifecycle rules of bridge transactions.
///
/// `transition` is the only way a status changes. It succeeds only when the
/// stored status equals the expected one, so of any number of concurrent
/// callers racing for the same edge exactly one wins.
pub struct TransactionStore {
    repository: Arc<dyn TransactionRepository>,
    events: Arc<dyn EventSink>,
}

impl TransactionStore {
    pub fn new(repository: Arc<dyn TransactionRepository>, events: Arc<dyn EventSink>) -> Self {
        Self { repository, events }
    }

    /// Persist a new `INITIATED` transaction
    pub async fn create(&self, tx: BridgeTransaction) -> BridgeResult<BridgeTransaction> {
        if tx.status != TransactionStatus::Initiated {
            return Err(BridgeError::Internal(format!(
                "new transaction {} must start INITIATED, not {}",
                tx.id, tx.status
            )));
        }
        if tx.fee.checked_add(tx.net_amount) != Some(tx.amount) {
            return Err(BridgeError::Internal(format!(
                "fee {} + net {} does not equal amount {}",
                tx.fee, tx.net_amount, tx.amount
            )));
        }

        self.repository.save(&tx).await?;
        self.events
            .emit(TransitionEvent::new(tx.id, None, TransactionStatus::Initiated));
        debug!("Created bridge transaction {}", tx.id);
        Ok(tx)
    }

    /// Get a transaction, failing if it does not exist
    pub async fn get(&self, id: TransactionId) -> BridgeResult<BridgeTransaction> {
        self.repository
            .load(id)
            .await?
            .ok_or(BridgeError::TransactionNotFound { tx_id: id })
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> BridgeResult<Option<BridgeTransaction>> {
        self.repository.find_by_idempotency_key(key).await
    }

    /// Move `id` from `from` to `to`
    pub async fn transition(
        &self,
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> BridgeResult<BridgeTransaction> {
        self.transition_with(id, from, to, |_| {}).await
    }

    /// Move `id` from `from` to `to`, applying `mutate` in the same atomic step
    pub async fn transition_with<F>(
        &self,
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
        mutate: F,
    ) -> BridgeResult<BridgeTransaction>
    where
        F: FnOnce(&mut BridgeTransaction) + Send + 'static,
    {
        if !from.can_transition_to(to) {
            return Err(BridgeError::InvalidStateTransition { from, to });
        }

        let mutation: Mutation = Box::new(move |tx| {
            mutate(&mut *tx);
            if to == TransactionStatus::Failed && tx.error_message.is_none() {
                return Err(BridgeError::Internal(format!(
                    "{} cannot fail without an error message",
                    tx.id
                )));
            }
            if to == TransactionStatus::Refunded && !tx.source_locked() {
                return Err(BridgeError::InvalidStateTransition { from, to });
            }

            let now = Utc::now();
            tx.status = to;
            tx.updated_at = now;
            if to == TransactionStatus::Completed {
                tx.completed_at = Some(now);
            }
            Ok(())
        });

        let updated = self.repository.compare_and_save(id, from, mutation).await?;
        self.events.emit(TransitionEvent::new(id, Some(from), to));
        debug!("Transaction {} {} -> {}", id, from, to);
        Ok(updated)
    }

    /// Source funds confirmed locked or burned
    pub async fn mark_locked(&self, id: TransactionId, source_tx_hash: String) -> BridgeResult<BridgeTransaction> {
        self.transition_with(
            id,
            TransactionStatus::Initiated,
            TransactionStatus::Locked,
            move |tx| tx.source_tx_hash = Some(source_tx_hash),
        )
        .await
    }

    /// Start waiting for validator quorum
    pub async fn begin_validation(&self, id: TransactionId) -> BridgeResult<BridgeTransaction> {
        self.transition(id, TransactionStatus::Locked, TransactionStatus::Validating)
            .await
    }

    /// Quorum consumed; destination leg about to be submitted
    pub async fn begin_completion(&self, id: TransactionId) -> BridgeResult<BridgeTransaction> {
        self.transition(id, TransactionStatus::Validating, TransactionStatus::Completing)
            .await
    }

    /// Destination leg confirmed
    pub async fn mark_completed(
        &self,
        id: TransactionId,
        destination_tx_hash: String,
    ) -> BridgeResult<BridgeTransaction> {
        self.transition_with(
            id,
            TransactionStatus::Completing,
            TransactionStatus::Completed,
            move |tx| tx.destination_tx_hash = Some(destination_tx_hash),
        )
        .await
    }

    /// Record an irrecoverable failure
    pub async fn mark_failed(
        &self,
        id: TransactionId,
        from: TransactionStatus,
        reason: String,
    ) -> BridgeResult<BridgeTransaction> {
        self.transition_with(id, from, TransactionStatus::Failed, move |tx| {
            tx.error_message = Some(reason)
        })
        .await
    }

    /// Refund of the locked source funds confirmed
    pub async fn mark_refunded(
        &self,
        id: TransactionId,
        refund_tx_hash: String,
    ) -> BridgeResult<BridgeTransaction> {
        self.transition_with(
            id,
            TransactionStatus::Failed,
            TransactionStatus::Refunded,
            move |tx| tx.refund_tx_hash = Some(refund_tx_hash),
        )
        .await
    }

    /// Count a failed refund; flags the record for manual intervention once
    /// `max_attempts` is reached. Status stays `FAILED`.
    pub async fn record_refund_failure(
        &self,
        id: TransactionId,
        max_attempts: u32,
    ) -> BridgeResult<BridgeTransaction> {
        let mutation: Mutation = Box::new(move |tx| {
            tx.refund_attempts += 1;
            if tx.refund_attempts >= max_attempts {
                tx.requires_manual_intervention = true;
            }
            Ok(())
        });
        let updated = self
            .repository
            .compare_and_save(id, TransactionStatus::Failed, mutation)
            .await?;
        if updated.requires_manual_intervention {
            warn!(
                "Transaction {} needs manual intervention after {} refund attempts",
                id, updated.refund_attempts
            );
        }
        Ok(updated)
    }

    /// Append a validator signature to the audit set without touching any
    /// lifecycle field. Returns `false` if the validator had already signed.
    pub async fn record_signature(
        &self,
        id: TransactionId,
        signature: ValidatorSignature,
    ) -> BridgeResult<bool> {
        let mut attempt = 0;
        loop {
            let current = self.get(id).await?;
            if current
                .validator_signatures
                .contains_key(&signature.validator_address)
            {
                return Ok(false);
            }

            let entry = signature.clone();
            let mutation: Mutation = Box::new(move |tx| {
                tx.validator_signatures
                    .entry(entry.validator_address.clone())
                    .or_insert(entry);
                Ok(())
            });

            match self
                .repository
                .compare_and_save(id, current.status, mutation)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_stale() && attempt < MAX_SIGNATURE_RETRIES => {
                    attempt += 1;
                    debug!("Status of {} moved while recording signature, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn list_unresolved(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        self.repository.list_unresolved().await
    }

    pub async fn stats(&self) -> BridgeResult<TransactionStats> {
        self.repository.stats().await
    }

    pub async fn health_check(&self) -> BridgeResult<()> {
        self.repository.health_check().await
    }
}
