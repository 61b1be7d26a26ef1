//! Validator quorum collection
//!
//! Each transaction owns an attestation ledger behind its own lock. The
//! "first time the threshold is crossed" check and the signal emission happen
//! under that lock, so a transaction produces at most one `QuorumReached`
//! no matter how attestations interleave.

use crate::error::{BridgeError, BridgeResult, ValidationError};
use crate::state::{BridgeTransaction, TransactionId, TransactionStore, ValidatorSignature};

use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Emitted once per transaction when its signature threshold is first met
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumReached {
    pub transaction_id: TransactionId,
    pub signatures: usize,
}

/// Result of a single attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// New attestation stored
    Recorded {
        signatures: usize,
        quorum_reached: bool,
    },
    /// This validator had already signed; nothing changed
    AlreadySigned { signatures: usize },
}

impl SubmissionOutcome {
    pub fn signatures(&self) -> usize {
        match self {
            SubmissionOutcome::Recorded { signatures, .. }
            | SubmissionOutcome::AlreadySigned { signatures } => *signatures,
        }
    }

    pub fn quorum_reached(&self) -> bool {
        matches!(
            self,
            SubmissionOutcome::Recorded {
                quorum_reached: true,
                ..
            }
        )
    }
}

#[derive(Debug)]
struct AttestationLedger {
    signers: BTreeSet<String>,
    quorum_fired: bool,
}

impl AttestationLedger {
    /// Rebuild from the persisted record. A record already past validation
    /// has consumed its quorum, so late attestations can never re-fire it.
    fn from_record(tx: &BridgeTransaction, threshold: usize) -> Self {
        let signers: BTreeSet<String> = tx.validator_signatures.keys().cloned().collect();
        let quorum_fired = tx.status.is_past_validation() || signers.len() >= threshold;
        Self {
            signers,
            quorum_fired,
        }
    }
}

/// Collects validator attestations and detects quorum
pub struct QuorumCollector {
    threshold: usize,
    validators: HashSet<String>,
    ledgers: DashMap<TransactionId, Arc<Mutex<AttestationLedger>>>,
    store: Arc<TransactionStore>,
    signals: mpsc::UnboundedSender<QuorumReached>,
}

impl QuorumCollector {
    /// Create a collector for a fixed validator set
    pub fn new(
        threshold: usize,
        validators: impl IntoIterator<Item = String>,
        store: Arc<TransactionStore>,
        signals: mpsc::UnboundedSender<QuorumReached>,
    ) -> BridgeResult<Self> {
        let validators: HashSet<String> = validators.into_iter().collect();
        if threshold == 0 || threshold > validators.len() {
            return Err(BridgeError::Config(format!(
                "Signature threshold {} must be between 1 and the {} configured validators",
                threshold,
                validators.len()
            )));
        }

        info!(
            "Quorum collector: {} of {} validators required",
            threshold,
            validators.len()
        );

        Ok(Self {
            threshold,
            validators,
            ledgers: DashMap::new(),
            store,
            signals,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_validator(&self, address: &str) -> bool {
        self.validators.contains(address)
    }

    /// Accept one attestation for `tx`.
    ///
    /// `tx` is the caller's snapshot of the record; it is only used to seed
    /// the ledger the first time this transaction is seen.
    pub async fn submit(
        &self,
        tx: &BridgeTransaction,
        validator_address: &str,
        signature: Vec<u8>,
    ) -> BridgeResult<SubmissionOutcome> {
        if !self.is_validator(validator_address) {
            crate::metrics::record_attestation("unknown_validator");
            return Err(ValidationError::UnknownValidator(validator_address.to_string()).into());
        }
        if signature.is_empty() {
            crate::metrics::record_attestation("invalid_signature");
            return Err(ValidationError::InvalidSignature.into());
        }

        let ledger = self
            .ledgers
            .entry(tx.id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(AttestationLedger::from_record(tx, self.threshold)))
            })
            .clone();
        let mut ledger = ledger.lock().await;

        if ledger.signers.contains(validator_address) {
            debug!("Validator {} already signed {}", validator_address, tx.id);
            crate::metrics::record_attestation("already_signed");
            return Ok(SubmissionOutcome::AlreadySigned {
                signatures: ledger.signers.len(),
            });
        }

        let entry = ValidatorSignature {
            validator_address: validator_address.to_string(),
            signature,
            received_at: Utc::now(),
        };
        let recorded = self.store.record_signature(tx.id, entry).await?;
        ledger.signers.insert(validator_address.to_string());
        let signatures = ledger.signers.len();

        if !recorded {
            crate::metrics::record_attestation("already_signed");
            return Ok(SubmissionOutcome::AlreadySigned { signatures });
        }
        crate::metrics::record_attestation("recorded");

        let quorum_reached = !ledger.quorum_fired && signatures >= self.threshold;
        if quorum_reached {
            ledger.quorum_fired = true;
            info!(
                "Quorum reached for {} with {} of {} signatures",
                tx.id, signatures, self.threshold
            );
            crate::metrics::record_quorum_reached();
            let signal = QuorumReached {
                transaction_id: tx.id,
                signatures,
            };
            if self.signals.send(signal).is_err() {
                warn!("Quorum signal for {} dropped: orchestrator not running", tx.id);
            }
        } else if ledger.quorum_fired {
            debug!(
                "Late attestation from {} for {} recorded for audit",
                validator_address, tx.id
            );
        }

        Ok(SubmissionOutcome::Recorded {
            signatures,
            quorum_reached,
        })
    }

    /// Drop the in-memory ledger of a resolved transaction
    pub fn prune(&self, id: TransactionId) {
        self.ledgers.remove(&id);
    }

    /// Transactions with an in-memory ledger
    pub fn tracked(&self) -> Vec<TransactionId> {
        self.ledgers.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BridgeDirection, ChainId, FeeQuote};
    use crate::events::BroadcastEventSink;
    use crate::state::{MemoryRepository, TransactionStatus};

    struct Harness {
        store: Arc<TransactionStore>,
        collector: Arc<QuorumCollector>,
        signals: mpsc::UnboundedReceiver<QuorumReached>,
    }

    fn harness(threshold: usize, validators: &[&str]) -> Harness {
        let store = Arc::new(TransactionStore::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(BroadcastEventSink::new(64)),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = QuorumCollector::new(
            threshold,
            validators.iter().map(|v| v.to_string()),
            store.clone(),
            tx,
        )
        .unwrap();
        Harness {
            store,
            collector: Arc::new(collector),
            signals: rx,
        }
    }

    async fn validating_tx(store: &TransactionStore) -> BridgeTransaction {
        let tx = store
            .create(BridgeTransaction::new(
                BridgeDirection::new(ChainId::Vrty, ChainId::Ethereum),
                "vrty1sender",
                "0xreceiver",
                1_000,
                FeeQuote {
                    fee: 5,
                    net_amount: 995,
                },
                None,
            ))
            .await
            .unwrap();
        store.mark_locked(tx.id, "0xlock".to_string()).await.unwrap();
        store.begin_validation(tx.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_quorum_fires_on_third_signature_in_arrival_order() {
        let mut h = harness(3, &["v1", "v2", "v3"]);
        let tx = validating_tx(&h.store).await;

        let v2 = h.collector.submit(&tx, "v2", vec![2]).await.unwrap();
        let v1 = h.collector.submit(&tx, "v1", vec![1]).await.unwrap();
        assert!(!v2.quorum_reached());
        assert!(!v1.quorum_reached());
        assert!(h.signals.try_recv().is_err());

        let v3 = h.collector.submit(&tx, "v3", vec![3]).await.unwrap();
        assert_eq!(
            v3,
            SubmissionOutcome::Recorded {
                signatures: 3,
                quorum_reached: true
            }
        );
        let signal = h.signals.try_recv().unwrap();
        assert_eq!(signal.transaction_id, tx.id);
        assert!(h.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubmission_changes_nothing() {
        let mut h = harness(2, &["v1", "v2"]);
        let tx = validating_tx(&h.store).await;

        h.collector.submit(&tx, "v1", vec![1]).await.unwrap();
        let again = h.collector.submit(&tx, "v1", vec![9, 9]).await.unwrap();
        assert_eq!(again, SubmissionOutcome::AlreadySigned { signatures: 1 });

        let stored = h.store.get(tx.id).await.unwrap();
        assert_eq!(stored.signature_count(), 1);
        assert_eq!(stored.validator_signatures["v1"].signature, vec![1]);
        assert!(h.signals.try_recv().is_err());

        h.collector.submit(&tx, "v2", vec![2]).await.unwrap();
        let after_quorum = h.collector.submit(&tx, "v2", vec![2]).await.unwrap();
        assert!(!after_quorum.quorum_reached());
        assert!(h.signals.try_recv().is_ok());
        assert!(h.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_fire_exactly_once() {
        let validators = ["v1", "v2", "v3", "v4", "v5", "v6", "v7"];
        let mut h = harness(3, &validators);
        let tx = validating_tx(&h.store).await;

        let submissions = validators.iter().map(|v| {
            let collector = h.collector.clone();
            let tx = tx.clone();
            let v = v.to_string();
            tokio::spawn(async move { collector.submit(&tx, &v, vec![7]).await })
        });
        let outcomes: Vec<_> = futures::future::join_all(submissions)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|o| o.quorum_reached()).count(), 1);
        assert!(h.signals.try_recv().is_ok());
        assert!(h.signals.try_recv().is_err());
        assert_eq!(h.store.get(tx.id).await.unwrap().signature_count(), 7);
    }

    #[tokio::test]
    async fn test_rejects_unknown_validator_and_empty_signature() {
        let h = harness(1, &["v1"]);
        let tx = validating_tx(&h.store).await;

        let err = h.collector.submit(&tx, "mallory", vec![1]).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Validation(ValidationError::UnknownValidator(_))
        ));
        let err = h.collector.submit(&tx, "v1", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Validation(ValidationError::InvalidSignature)
        ));
        assert_eq!(h.store.get(tx.id).await.unwrap().signature_count(), 0);
    }

    #[tokio::test]
    async fn test_rebuilt_ledger_past_validation_never_fires() {
        let mut h = harness(1, &["v1", "v2"]);
        let tx = validating_tx(&h.store).await;
        h.store.begin_completion(tx.id).await.unwrap();
        let completing = h.store.get(tx.id).await.unwrap();
        assert_eq!(completing.status, TransactionStatus::Completing);

        let outcome = h.collector.submit(&completing, "v2", vec![2]).await.unwrap();
        assert_eq!(
            outcome,
            SubmissionOutcome::Recorded {
                signatures: 1,
                quorum_reached: false
            }
        );
        assert!(h.signals.try_recv().is_err());
        assert_eq!(h.store.get(tx.id).await.unwrap().signature_count(), 1);
    }

    #[test]
    fn test_threshold_must_fit_validator_set() {
        let store = Arc::new(TransactionStore::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(BroadcastEventSink::new(4)),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(QuorumCollector::new(3, vec!["v1".to_string()], store.clone(), tx.clone()).is_err());
        assert!(QuorumCollector::new(0, vec!["v1".to_string()], store, tx).is_err());
    }
}
