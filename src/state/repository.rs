//! Persistence collaborator interface and the in-memory implementation

use super::transaction::{BridgeTransaction, TransactionId, TransactionStatus};
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Mutation applied under the status guard. Runs against a copy; the copy is
/// only committed if it returns `Ok`.
pub type Mutation = Box<dyn FnOnce(&mut BridgeTransaction) -> BridgeResult<()> + Send>;

/// Storage for transaction records.
///
/// `compare_and_save` must be atomic per record: concurrent callers on the same
/// id observe a single winner.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Load a record by id
    async fn load(&self, id: TransactionId) -> BridgeResult<Option<BridgeTransaction>>;

    /// Persist a newly created record. Fails with `DuplicateTransaction` if
    /// its idempotency key is already taken.
    async fn save(&self, tx: &BridgeTransaction) -> BridgeResult<()>;

    /// Apply `mutate` only if the stored status equals `expected`; otherwise
    /// fail with `StaleTransition` and leave the record untouched.
    async fn compare_and_save(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        mutate: Mutation,
    ) -> BridgeResult<BridgeTransaction>;

    /// Look up a record by client idempotency key
    async fn find_by_idempotency_key(&self, key: &str) -> BridgeResult<Option<BridgeTransaction>>;

    /// Records still needing engine work: non-terminal, or failed with a refund owed
    async fn list_unresolved(&self) -> BridgeResult<Vec<BridgeTransaction>>;

    /// Record counts per status
    async fn stats(&self) -> BridgeResult<TransactionStats>;

    /// Health check
    async fn health_check(&self) -> BridgeResult<()>;
}

/// Transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub initiated: u64,
    pub locked: u64,
    pub validating: u64,
    pub completing: u64,
    pub completed: u64,
    pub failed: u64,
    pub refunded: u64,
    pub manual_intervention: u64,
}

impl TransactionStats {
    pub fn record(&mut self, tx: &BridgeTransaction) {
        let slot = match tx.status {
            TransactionStatus::Initiated => &mut self.initiated,
            TransactionStatus::Locked => &mut self.locked,
            TransactionStatus::Validating => &mut self.validating,
            TransactionStatus::Completing => &mut self.completing,
            TransactionStatus::Completed => &mut self.completed,
            TransactionStatus::Failed => &mut self.failed,
            TransactionStatus::Refunded => &mut self.refunded,
        };
        *slot += 1;
        if tx.requires_manual_intervention {
            self.manual_intervention += 1;
        }
    }
}

/// In-memory repository with one lock per record, so unrelated
/// transactions never contend
#[derive(Default)]
pub struct MemoryRepository {
    records: DashMap<TransactionId, Arc<Mutex<BridgeTransaction>>>,
    idempotency_keys: DashMap<String, TransactionId>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: TransactionId) -> BridgeResult<Arc<Mutex<BridgeTransaction>>> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(BridgeError::TransactionNotFound { tx_id: id })
    }

    fn snapshot(record: &Mutex<BridgeTransaction>) -> BridgeResult<BridgeTransaction> {
        record
            .lock()
            .map(|tx| tx.clone())
            .map_err(|_| BridgeError::Internal("transaction lock poisoned".to_string()))
    }

    fn snapshots(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        let records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.iter().map(|r| Self::snapshot(r)).collect()
    }
}

#[async_trait]
impl TransactionRepository for MemoryRepository {
    async fn load(&self, id: TransactionId) -> BridgeResult<Option<BridgeTransaction>> {
        match self.records.get(&id).map(|r| r.value().clone()) {
            Some(record) => Self::snapshot(&record).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, tx: &BridgeTransaction) -> BridgeResult<()> {
        if let Some(key) = &tx.idempotency_key {
            match self.idempotency_keys.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(BridgeError::DuplicateTransaction { key: key.clone() })
                }
                Entry::Vacant(slot) => {
                    slot.insert(tx.id);
                }
            }
        }

        match self.records.entry(tx.id) {
            Entry::Occupied(_) => Err(BridgeError::Internal(format!(
                "transaction {} already stored",
                tx.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(tx.clone())));
                Ok(())
            }
        }
    }

    async fn compare_and_save(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        mutate: Mutation,
    ) -> BridgeResult<BridgeTransaction> {
        let record = self.record(id)?;
        let mut current = record
            .lock()
            .map_err(|_| BridgeError::Internal("transaction lock poisoned".to_string()))?;

        if current.status != expected {
            return Err(BridgeError::StaleTransition {
                tx_id: id,
                expected,
                actual: current.status,
            });
        }

        let mut next = current.clone();
        mutate(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> BridgeResult<Option<BridgeTransaction>> {
        let id = match self.idempotency_keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.load(id).await
    }

    async fn list_unresolved(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        Ok(self
            .snapshots()?
            .into_iter()
            .filter(|tx| {
                !(tx.status.is_terminal() || tx.status == TransactionStatus::Failed)
                    || tx.awaiting_refund()
            })
            .collect())
    }

    async fn stats(&self) -> BridgeResult<TransactionStats> {
        let mut stats = TransactionStats::default();
        for tx in self.snapshots()? {
            stats.record(&tx);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> BridgeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BridgeDirection, ChainId, FeeQuote};

    fn sample(key: Option<&str>) -> BridgeTransaction {
        BridgeTransaction::new(
            BridgeDirection::new(ChainId::Vrty, ChainId::Ethereum),
            "vrty1sender",
            "0xreceiver",
            1_000,
            FeeQuote {
                fee: 5,
                net_amount: 995,
            },
            key.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn test_compare_and_save_applies_on_match() {
        let repo = MemoryRepository::new();
        let tx = sample(None);
        repo.save(&tx).await.unwrap();

        let updated = repo
            .compare_and_save(
                tx.id,
                TransactionStatus::Initiated,
                Box::new(|tx| {
                    tx.status = TransactionStatus::Locked;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TransactionStatus::Locked);
        assert_eq!(
            repo.load(tx.id).await.unwrap().unwrap().status,
            TransactionStatus::Locked
        );
    }

    #[tokio::test]
    async fn test_compare_and_save_rejects_stale_without_mutation() {
        let repo = MemoryRepository::new();
        let tx = sample(None);
        repo.save(&tx).await.unwrap();

        let err = repo
            .compare_and_save(
                tx.id,
                TransactionStatus::Validating,
                Box::new(|tx| {
                    tx.error_message = Some("should not land".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(repo.load(tx.id).await.unwrap().unwrap(), tx);
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_committed() {
        let repo = MemoryRepository::new();
        let tx = sample(None);
        repo.save(&tx).await.unwrap();

        let result = repo
            .compare_and_save(
                tx.id,
                TransactionStatus::Initiated,
                Box::new(|tx| {
                    tx.status = TransactionStatus::Locked;
                    Err(BridgeError::Internal("nope".to_string()))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(
            repo.load(tx.id).await.unwrap().unwrap().status,
            TransactionStatus::Initiated
        );
    }

    #[tokio::test]
    async fn test_idempotency_key_is_unique() {
        let repo = MemoryRepository::new();
        let first = sample(Some("transfer-1"));
        repo.save(&first).await.unwrap();

        let err = repo.save(&sample(Some("transfer-1"))).await.unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateTransaction { .. }));
        assert_eq!(
            repo.find_by_idempotency_key("transfer-1").await.unwrap().unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn test_unresolved_and_stats() {
        let repo = MemoryRepository::new();
        let open = sample(None);
        let mut done = sample(None);
        done.status = TransactionStatus::Completed;
        let mut failed_unlocked = sample(None);
        failed_unlocked.status = TransactionStatus::Failed;
        for tx in [&open, &done, &failed_unlocked] {
            repo.save(tx).await.unwrap();
        }

        let unresolved = repo.list_unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, open.id);

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.initiated, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }
}
