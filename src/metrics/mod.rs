//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction transitions and completion latency
//! - Rejected bridge requests
//! - Adapter leg failures and refunds
//! - Validator attestations

use crate::error::{BridgeError, BridgeResult};
use crate::events::TransitionEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_INITIATED: CounterVec = register_counter_vec!(
        "vrty_bridge_transactions_initiated_total",
        "Total bridge transactions accepted",
        &["source_chain", "destination_chain"]
    ).unwrap();

    pub static ref TX_TRANSITIONS: CounterVec = register_counter_vec!(
        "vrty_bridge_transitions_total",
        "Total status transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref TX_REJECTED: CounterVec = register_counter_vec!(
        "vrty_bridge_requests_rejected_total",
        "Total bridge requests rejected by validation",
        &["reason"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "vrty_bridge_completion_latency_seconds",
        "Time from initiation to completion",
        &["source_chain", "destination_chain"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Adapter metrics
    pub static ref ADAPTER_FAILURES: CounterVec = register_counter_vec!(
        "vrty_bridge_adapter_failures_total",
        "Total chain adapter failures per leg",
        &["leg", "retryable"]
    ).unwrap();

    pub static ref REFUNDS: CounterVec = register_counter_vec!(
        "vrty_bridge_refunds_total",
        "Refund attempts by outcome",
        &["outcome"]
    ).unwrap();

    // Validator metrics
    pub static ref ATTESTATIONS: CounterVec = register_counter_vec!(
        "vrty_bridge_attestations_total",
        "Validator attestations by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref QUORUMS_REACHED: IntCounter = register_int_counter!(
        "vrty_bridge_quorums_reached_total",
        "Total transactions that reached signature quorum"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_initiated(source_chain: &str, destination_chain: &str) {
    TX_INITIATED
        .with_label_values(&[source_chain, destination_chain])
        .inc();
}

pub fn record_transition(event: &TransitionEvent) {
    TX_TRANSITIONS
        .with_label_values(&[event.from_label(), event.to_status.as_str()])
        .inc();
}

pub fn record_rejection(reason: &str) {
    TX_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_completion_latency(source_chain: &str, destination_chain: &str, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[source_chain, destination_chain])
        .observe(latency_secs);
}

pub fn record_adapter_failure(leg: &str, retryable: bool) {
    ADAPTER_FAILURES
        .with_label_values(&[leg, if retryable { "true" } else { "false" }])
        .inc();
}

pub fn record_refund(outcome: &str) {
    REFUNDS.with_label_values(&[outcome]).inc();
}

pub fn record_attestation(outcome: &str) {
    ATTESTATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_quorum_reached() {
    QUORUMS_REACHED.inc();
}
