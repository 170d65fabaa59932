//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Order status transitions and flow latency
//! - Escrow deployments, withdrawals and cancellations
//! - Chain errors and health
//! - Orders waiting for an operator

use crate::error::{SwapError, SwapResult};
use crate::model::{OrderStatus, Side};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Order metrics
    pub static ref ORDER_TRANSITIONS: CounterVec = register_counter_vec!(
        "crosslock_order_transitions_total",
        "Order status transitions by target status",
        &["status"]
    ).unwrap();

    pub static ref FLOW_LATENCY: HistogramVec = register_histogram_vec!(
        "crosslock_flow_duration_seconds",
        "Duration of orchestrator flows",
        &["flow", "outcome"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 1800.0, 3600.0]
    ).unwrap();

    pub static ref ATTENTION_ORDERS: Gauge = register_gauge!(
        "crosslock_orders_needing_attention",
        "Orders that need manual intervention"
    ).unwrap();

    // Escrow metrics
    pub static ref ESCROWS_DEPLOYED: CounterVec = register_counter_vec!(
        "crosslock_escrows_deployed_total",
        "Escrows deployed",
        &["chain_id", "side"]
    ).unwrap();

    pub static ref ESCROW_WITHDRAWALS: CounterVec = register_counter_vec!(
        "crosslock_escrow_withdrawals_total",
        "Escrow withdrawals",
        &["chain_id", "side"]
    ).unwrap();

    pub static ref ESCROW_CANCELLATIONS: CounterVec = register_counter_vec!(
        "crosslock_escrow_cancellations_total",
        "Escrow cancellations",
        &["chain_id", "side"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_ERRORS: CounterVec = register_counter_vec!(
        "crosslock_chain_errors_total",
        "Chain call errors by kind",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "crosslock_chain_healthy",
        "Chain health (1=healthy, 0=unhealthy)",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "crosslock_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "crosslock_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub fn router() -> Router {
        Router::new().route("/metrics", get(metrics_handler))
    }

    pub async fn run(&self) -> SwapResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Config(format!("cannot bind metrics port {}: {}", addr, e)))?;
        axum::serve(listener, Self::router())
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server: {}", e)))
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

pub fn record_transition(status: OrderStatus) {
    ORDER_TRANSITIONS.with_label_values(&[status.as_str()]).inc();
}

pub fn record_flow_duration(flow: &str, outcome: &str, secs: f64) {
    FLOW_LATENCY.with_label_values(&[flow, outcome]).observe(secs);
}

pub fn record_attention_raised() {
    ATTENTION_ORDERS.inc();
}

pub fn set_attention_orders(count: usize) {
    ATTENTION_ORDERS.set(count as f64);
}

pub fn record_escrow_deployed(chain_id: i64, side: Side) {
    ESCROWS_DEPLOYED
        .with_label_values(&[&chain_id.to_string(), side.as_str()])
        .inc();
}

pub fn record_withdrawal(chain_id: i64, side: Side) {
    ESCROW_WITHDRAWALS
        .with_label_values(&[&chain_id.to_string(), side.as_str()])
        .inc();
}

pub fn record_cancellation(chain_id: i64, side: Side) {
    ESCROW_CANCELLATIONS
        .with_label_values(&[&chain_id.to_string(), side.as_str()])
        .inc();
}

pub fn record_chain_error(chain_id: i64, error: &SwapError) {
    CHAIN_ERRORS
        .with_label_values(&[&chain_id.to_string(), error.kind()])
        .inc();
}

pub fn record_chain_health(chain_id: i64, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
