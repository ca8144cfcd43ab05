//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Deployment and link outcomes per chain
//! - Retries and reconciliations
//! - Ownership hand-overs
//! - Aggregate configuration outcomes

use crate::error::{ChainErrorCategory, DeployerError, DeployerResult};
use crate::model::ConfigurationStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "token_deployer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "token_deployer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain"]
    ).unwrap();

    // Deployment metrics
    pub static ref DEPLOYMENTS_STARTED: CounterVec = register_counter_vec!(
        "token_deployer_deployments_started_total",
        "Total deployment attempts started",
        &["chain"]
    ).unwrap();

    pub static ref DEPLOYMENTS_SUCCEEDED: CounterVec = register_counter_vec!(
        "token_deployer_deployments_succeeded_total",
        "Total deployments confirmed",
        &["chain"]
    ).unwrap();

    pub static ref DEPLOYMENTS_FAILED: CounterVec = register_counter_vec!(
        "token_deployer_deployments_failed_total",
        "Total failed deployment attempts by category",
        &["chain", "category"]
    ).unwrap();

    pub static ref DEPLOYMENT_LATENCY: HistogramVec = register_histogram_vec!(
        "token_deployer_deployment_latency_seconds",
        "Time from submission to confirmed deployment",
        &["chain"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    // Link metrics
    pub static ref LINKS_SUCCEEDED: CounterVec = register_counter_vec!(
        "token_deployer_links_succeeded_total",
        "Total hub/peer pairs linked",
        &["chain"]
    ).unwrap();

    pub static ref LINKS_FAILED: CounterVec = register_counter_vec!(
        "token_deployer_links_failed_total",
        "Total failed link attempts by category",
        &["chain", "category"]
    ).unwrap();

    // Recovery metrics
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "token_deployer_retries_total",
        "Total retries by kind (manual or automatic)",
        &["chain", "kind"]
    ).unwrap();

    pub static ref RECONCILED: CounterVec = register_counter_vec!(
        "token_deployer_reconciled_total",
        "Timed-out deployments found mined by reconciliation",
        &["chain"]
    ).unwrap();

    pub static ref OWNERSHIP_TRANSFERRED: CounterVec = register_counter_vec!(
        "token_deployer_ownership_transferred_total",
        "Contracts handed over to their creator",
        &["chain"]
    ).unwrap();

    // Aggregate metrics
    pub static ref CONFIGURATIONS_SETTLED: CounterVec = register_counter_vec!(
        "token_deployer_configurations_settled_total",
        "Configurations reaching a terminal aggregate status",
        &["status"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "token_deployer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "token_deployer_health_check_failure_total",
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

    pub async fn run(&self) -> DeployerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DeployerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DeployerError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_tx_submitted(chain: &str) {
    TX_SUBMITTED.with_label_values(&[chain]).inc();
}

pub fn record_deployment_started(chain: &str) {
    DEPLOYMENTS_STARTED.with_label_values(&[chain]).inc();
}

pub fn record_deployment_succeeded(chain: &str, latency_secs: f64) {
    DEPLOYMENTS_SUCCEEDED.with_label_values(&[chain]).inc();
    DEPLOYMENT_LATENCY
        .with_label_values(&[chain])
        .observe(latency_secs);
}

pub fn record_deployment_failed(chain: &str, category: ChainErrorCategory) {
    DEPLOYMENTS_FAILED
        .with_label_values(&[chain, category.as_str()])
        .inc();
}

pub fn record_link_succeeded(chain: &str) {
    LINKS_SUCCEEDED.with_label_values(&[chain]).inc();
}

pub fn record_link_failed(chain: &str, category: ChainErrorCategory) {
    LINKS_FAILED
        .with_label_values(&[chain, category.as_str()])
        .inc();
}

pub fn record_retry(chain: &str, automatic: bool) {
    let kind = if automatic { "automatic" } else { "manual" };
    RETRIES.with_label_values(&[chain, kind]).inc();
}

pub fn record_reconciled(chain: &str) {
    RECONCILED.with_label_values(&[chain]).inc();
}

pub fn record_ownership_transferred(chain: &str) {
    OWNERSHIP_TRANSFERRED.with_label_values(&[chain]).inc();
}

pub fn record_configuration_settled(status: ConfigurationStatus) {
    CONFIGURATIONS_SETTLED
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
