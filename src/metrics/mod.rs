//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Engine validation status
//! - Trade outcomes and latency
//! - Forward retries and inbound cancel attempts

use crate::error::{ForwarderError, ForwarderResult};
use crate::state::FailureCode;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Engine metrics
    pub static ref ENGINE_VALIDATED: GaugeVec = register_gauge_vec!(
        "swap_forwarder_engine_validated",
        "Engine validation status (1=validated, 0=not validated)",
        &["asset"]
    ).expect("metric can be registered");

    // Trade metrics
    pub static ref TRADES_CREATED: CounterVec = register_counter_vec!(
        "swap_forwarder_trades_created_total",
        "Total trades accepted",
        &["source_asset", "destination_asset"]
    ).expect("metric can be registered");

    pub static ref TRADES_COMPLETED: CounterVec = register_counter_vec!(
        "swap_forwarder_trades_completed_total",
        "Total trades completed",
        &["source_asset", "destination_asset"]
    ).expect("metric can be registered");

    pub static ref TRADES_FAILED: CounterVec = register_counter_vec!(
        "swap_forwarder_trades_failed_total",
        "Total trades failed by failure code",
        &["failure_code"]
    ).expect("metric can be registered");

    pub static ref TRADE_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_forwarder_trade_latency_seconds",
        "Time from trade start to completion",
        &["source_asset", "destination_asset"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0, 7200.0]
    ).expect("metric can be registered");

    // Forwarding metrics
    pub static ref FORWARD_RETRIES: CounterVec = register_counter_vec!(
        "swap_forwarder_forward_retries_total",
        "Total forward attempts retried after a temporary error",
        &["outbound_asset"]
    ).expect("metric can be registered");

    pub static ref CANCEL_ATTEMPTS: CounterVec = register_counter_vec!(
        "swap_forwarder_cancel_attempts_total",
        "Total inbound cancel attempts",
        &["asset"]
    ).expect("metric can be registered");

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_forwarder_health_check_success_total",
        "Total successful health checks",
        &[]
    ).expect("metric can be registered");

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_forwarder_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).expect("metric can be registered");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ForwarderResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ForwarderError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ForwarderError::Internal(format!("Metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_engine_validated(asset: &str, validated: bool) {
    ENGINE_VALIDATED
        .with_label_values(&[asset])
        .set(if validated { 1.0 } else { 0.0 });
}

pub fn record_trade_created(source_asset: &str, destination_asset: &str) {
    TRADES_CREATED
        .with_label_values(&[source_asset, destination_asset])
        .inc();
}

pub fn record_trade_completed(source_asset: &str, destination_asset: &str, latency_secs: f64) {
    TRADES_COMPLETED
        .with_label_values(&[source_asset, destination_asset])
        .inc();
    TRADE_LATENCY
        .with_label_values(&[source_asset, destination_asset])
        .observe(latency_secs);
}

pub fn record_trade_failed(code: FailureCode) {
    TRADES_FAILED.with_label_values(&[code.as_str()]).inc();
}

pub fn record_forward_retry(outbound_asset: &str) {
    FORWARD_RETRIES.with_label_values(&[outbound_asset]).inc();
}

pub fn record_cancel_attempt(asset: &str) {
    CANCEL_ATTEMPTS.with_label_values(&[asset]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_rendered() {
        record_trade_failed(FailureCode::ServerExecuteError);
        record_engine_validated("BTC", true);

        let text = render().unwrap();
        assert!(text.contains("swap_forwarder_trades_failed_total{failure_code=\"SERVER_EXECUTE_ERROR\"}"));
        assert!(text.contains("swap_forwarder_engine_validated{asset=\"BTC\"} 1"));
    }
}
