//! # Metrics Collection
//!
//! Provides Prometheus metrics collection for the control plane.

use crate::config::ObservabilityConfig;
use crate::errors::{EdgeplaneError, Result};
use ::tracing::{info, warn};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;

/// Metrics recorder that tracks control plane activity
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a completed DAG rebuild
    pub fn record_rebuild(&self, duration: f64, invalid_objects: usize) {
        counter!("edgeplane_dag_rebuilds_total").increment(1);
        histogram!("edgeplane_dag_rebuild_duration_seconds").record(duration);
        gauge!("edgeplane_invalid_objects").set(invalid_objects as f64);
    }

    /// Record a snapshot swap for one resource type
    pub fn record_snapshot_update(&self, type_url: &str, version: u64, resources: usize) {
        let labels = [("type_url", type_url.to_string())];
        counter!("edgeplane_snapshot_updates_total", &labels).increment(1);
        gauge!("edgeplane_snapshot_version", &labels).set(version as f64);
        gauge!("edgeplane_snapshot_resources", &labels).set(resources as f64);
    }

    /// Record an xDS stream connection event
    pub fn record_xds_connection(&self, connected: bool) {
        if connected {
            gauge!("edgeplane_xds_streams_active").increment(1.0);
        } else {
            gauge!("edgeplane_xds_streams_active").decrement(1.0);
        }
    }

    /// Record a response pushed to a subscriber
    pub fn record_xds_response(&self, type_url: &str, resources: usize) {
        let labels = [("type_url", type_url.to_string())];
        counter!("edgeplane_xds_responses_total", &labels).increment(1);
        histogram!("edgeplane_xds_response_resources", &labels).record(resources as f64);
    }

    /// Record a NACK reported by Envoy
    pub fn record_xds_nack(&self, type_url: &str) {
        let labels = [("type_url", type_url.to_string())];
        counter!("edgeplane_xds_nacks_total", &labels).increment(1);
    }

    /// Record an endpoint fast path update
    pub fn record_endpoint_update(&self) {
        counter!("edgeplane_endpoint_updates_total").increment(1);
    }

    pub fn register_metrics(&self) {
        describe_counter!(
            "edgeplane_dag_rebuilds_total",
            Unit::Count,
            "Number of completed DAG rebuilds"
        );
        describe_histogram!(
            "edgeplane_dag_rebuild_duration_seconds",
            Unit::Seconds,
            "Time spent building the DAG and publishing snapshots"
        );
        describe_gauge!(
            "edgeplane_invalid_objects",
            Unit::Count,
            "Objects marked invalid by the most recent rebuild"
        );
        describe_counter!(
            "edgeplane_snapshot_updates_total",
            Unit::Count,
            "Snapshot version changes per resource type"
        );
        describe_gauge!("edgeplane_snapshot_version", Unit::Count, "Current snapshot version");
        describe_gauge!(
            "edgeplane_snapshot_resources",
            Unit::Count,
            "Resources held in the current snapshot"
        );
        describe_gauge!("edgeplane_xds_streams_active", Unit::Count, "Open discovery streams");
        describe_counter!(
            "edgeplane_xds_responses_total",
            Unit::Count,
            "Discovery responses sent to subscribers"
        );
        describe_histogram!(
            "edgeplane_xds_response_resources",
            Unit::Count,
            "Resources carried per discovery response"
        );
        describe_counter!("edgeplane_xds_nacks_total", Unit::Count, "NACKs received from Envoy");
        describe_counter!(
            "edgeplane_endpoint_updates_total",
            Unit::Count,
            "Endpoint events applied without a rebuild"
        );
    }
}

/// Global metrics recorder instance, set once the exporter is installed
static METRICS: OnceCell<MetricsRecorder> = OnceCell::new();

/// Initialize metrics collection and Prometheus exporter
pub async fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            if config.enable_metrics {
                warn!("Metrics disabled: no bind address configured");
            }
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        EdgeplaneError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    let builder = PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name);

    builder.install().map_err(|e| {
        EdgeplaneError::config(format!("Failed to initialize metrics exporter: {}", e))
    })?;

    let recorder = METRICS.get_or_init(MetricsRecorder::new);
    recorder.register_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}

/// Get the global metrics recorder
pub fn get_metrics() -> Option<&'static MetricsRecorder> {
    METRICS.get()
}

pub fn record_rebuild(duration: f64, invalid_objects: usize) {
    if let Some(metrics) = get_metrics() {
        metrics.record_rebuild(duration, invalid_objects);
    }
}

pub fn record_snapshot_update(type_url: &str, version: u64, resources: usize) {
    if let Some(metrics) = get_metrics() {
        metrics.record_snapshot_update(type_url, version, resources);
    }
}

pub fn record_xds_connection(connected: bool) {
    if let Some(metrics) = get_metrics() {
        metrics.record_xds_connection(connected);
    }
}

pub fn record_xds_response(type_url: &str, resources: usize) {
    if let Some(metrics) = get_metrics() {
        metrics.record_xds_response(type_url, resources);
    }
}

pub fn record_xds_nack(type_url: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_xds_nack(type_url);
    }
}

pub fn record_endpoint_update() {
    if let Some(metrics) = get_metrics() {
        metrics.record_endpoint_update();
    }
}
