//! Transition events for notification and dashboard fan-out
//!
//! One event is emitted per state transition. Delivery is the sink's concern:
//! the engine never waits on or retries a sink.

use crate::state::{TransactionId, TransactionStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A single status change. `from` is `None` when the record was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub transaction_id: TransactionId,
    pub from_status: Option<TransactionStatus>,
    pub to_status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(
        transaction_id: TransactionId,
        from_status: Option<TransactionStatus>,
        to_status: TransactionStatus,
    ) -> Self {
        Self {
            transaction_id,
            from_status,
            to_status,
            timestamp: Utc::now(),
        }
    }

    /// Label for metrics
    pub fn from_label(&self) -> &'static str {
        self.from_status.map(|s| s.as_str()).unwrap_or("NONE")
    }
}

/// Receives transition events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransitionEvent);
}

/// Fans events out to any number of subscribers over a broadcast channel
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TransitionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: TransitionEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            debug!("Transition event dropped: no subscribers");
        }
    }
}

/// Drain a subscription, logging each transition and recording metrics
pub async fn log_transitions(mut rx: broadcast::Receiver<TransitionEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                info!(
                    tx_id = %event.transaction_id,
                    from = event.from_label(),
                    to = event.to_status.as_str(),
                    "Bridge transaction transition"
                );
                crate::metrics::record_transition(&event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event logger lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
