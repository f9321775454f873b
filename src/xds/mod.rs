//! # Envoy xDS
//!
//! Translation of the routing DAG into Envoy v3 resources, the per-type
//! snapshot caches that hold them, and the gRPC discovery server:
//! - ADS (Aggregated Discovery Service)
//! - CDS, EDS, LDS, RDS and SDS

pub mod cluster;
pub mod endpoint;
pub mod filters;
pub mod listener;
pub mod resources;
pub mod route;
pub mod secret;
pub mod server;
pub mod snapshot;
pub mod stream;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{AppConfig, CompressionAlgorithm};
use crate::coordinator::DagObserver;
use crate::dag::Dag;
use crate::utils::duration::TimeoutSetting;

pub use endpoint::EndpointTranslator;
pub use server::{serve, DiscoveryServer};
pub use snapshot::{DiscoveryCache, Snapshot, SnapshotCache, SnapshotSet, SnapshotUpdate};

/// Listener-wide settings applied while translating a DAG
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationOptions {
    pub compression: CompressionAlgorithm,
    pub authorization_before_rate_limit: bool,
    /// Port written into HTTP to HTTPS redirects; Envoy keeps the request port when unset
    pub https_redirect_port: Option<u16>,
    pub request_timeout: TimeoutSetting,
    pub connection_idle_timeout: TimeoutSetting,
    pub stream_idle_timeout: TimeoutSetting,
}

impl From<&AppConfig> for TranslationOptions {
    fn from(config: &AppConfig) -> Self {
        let policy = &config.policy;
        Self {
            compression: policy.compression,
            authorization_before_rate_limit: policy.authorization_server_before_rate_limit,
            https_redirect_port: config.listeners.https_redirect_port,
            request_timeout: policy.timeouts.request(),
            connection_idle_timeout: policy.timeouts.connection_idle(),
            stream_idle_timeout: policy.timeouts.stream_idle(),
        }
    }
}

/// Publishes every rebuilt DAG into the snapshot caches.
///
/// Secrets, clusters and endpoints are installed before routes and listeners
/// so that nothing Envoy receives references a resource it cannot fetch yet.
pub struct XdsTranslator {
    options: TranslationOptions,
    snapshots: Arc<SnapshotSet>,
    endpoints: Arc<EndpointTranslator>,
}

impl XdsTranslator {
    pub fn new(options: TranslationOptions, snapshots: Arc<SnapshotSet>, endpoints: Arc<EndpointTranslator>) -> Self {
        Self { options, snapshots, endpoints }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotSet> {
        &self.snapshots
    }

    /// Translate `dag` and install the results. Returns how many of the five
    /// caches changed.
    pub fn apply(&self, dag: &Dag) -> usize {
        let changes = [
            self.snapshots.secrets.update(secret::secrets(dag)),
            self.snapshots.clusters.update(cluster::clusters(dag)),
            self.endpoints.set_references(dag.endpoint_references()),
            self.snapshots.routes.update(route::route_configurations(dag, &self.options)),
            self.snapshots.listeners.update(listener::listeners(dag, &self.options)),
        ];
        let changed = changes.iter().filter(|c| **c).count();
        if changed > 0 {
            info!(
                changed_types = changed,
                listeners = self.snapshots.listeners.snapshot().resources.len(),
                clusters = self.snapshots.clusters.snapshot().resources.len(),
                "Published xDS snapshots"
            );
        } else {
            debug!("Rebuild produced identical xDS resources");
        }
        changed
    }
}

impl DagObserver for XdsTranslator {
    fn on_change(&self, dag: &Dag) {
        self.apply(dag);
    }
}
