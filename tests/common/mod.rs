//! Common test utilities for all integration tests.
//!
//! [`Harness`] wires the resource cache, graph builder, rebuild coordinator,
//! translators and snapshot caches the same way `edgeplane serve` does, with a
//! short hold-off so rebuilds land quickly.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use std::sync::Arc;
use std::time::Duration;

use edgeplane::cache::{CacheConfig, ResourceCache};
use edgeplane::config::{AppConfig, RebuildConfig};
use edgeplane::coordinator::{DagObserver, EventHandler, StatusStore};
use edgeplane::dag::{Builder, BuilderConfig, ObjectStatus};
use edgeplane::k8s::{manifest, Kind, KubernetesResource, ObjectKey};
use edgeplane::xds::{EndpointTranslator, SnapshotSet, TranslationOptions, XdsTranslator};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::{filter::ConfigType, Filter, Listener};
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use prost::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CERT: &str = include_str!("../fixtures/server.crt");
pub const KEY: &str = include_str!("../fixtures/server.key");
pub const CA: &str = include_str!("../fixtures/ca.crt");

const REBUILD_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub handler: EventHandler,
    pub snapshots: Arc<SnapshotSet>,
    pub statuses: Arc<StatusStore>,
    shutdown: CancellationToken,
    coordinator: JoinHandle<()>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::default()).await
    }

    /// Start a control plane and wait for the initial rebuild.
    pub async fn with_config(mut config: AppConfig) -> Self {
        config.rebuild = RebuildConfig { holdoff_delay_ms: 5, holdoff_max_delay_ms: 20 };

        let snapshots = Arc::new(SnapshotSet::new());
        let endpoints = Arc::new(EndpointTranslator::new(snapshots.clone()));
        let translator = Arc::new(XdsTranslator::new(
            TranslationOptions::from(&config),
            snapshots.clone(),
            endpoints.clone(),
        ));
        let statuses = Arc::new(StatusStore::new());
        let cache = Arc::new(ResourceCache::new(CacheConfig {
            ingress_class_names: config.ingress.class_names.clone(),
        }));
        let (handler, coordinator) = EventHandler::new(
            cache,
            endpoints,
            Builder::new(BuilderConfig::from(&config)),
            vec![translator as Arc<dyn DagObserver>],
            statuses.clone(),
            config.rebuild.clone(),
        );

        let shutdown = CancellationToken::new();
        let coordinator = tokio::spawn(coordinator.run(shutdown.clone()));
        let harness = Self { handler, snapshots, statuses, shutdown, coordinator };

        harness.handler.synced();
        harness.wait_past(0).await;
        harness
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.coordinator.await.expect("coordinator panicked");
    }

    /// Block until the rebuild sequence moves beyond `sequence`.
    pub async fn wait_past(&self, sequence: u64) {
        let mut completed = self.handler.rebuild_completed();
        tokio::time::timeout(REBUILD_TIMEOUT, completed.wait_for(|s| *s > sequence))
            .await
            .expect("rebuild did not complete in time")
            .expect("coordinator stopped");
    }

    /// Add every object in `yaml`, waiting for the rebuild they trigger.
    /// Returns whether anything changed.
    pub async fn apply(&self, yaml: &str) -> bool {
        self.apply_all(parse(yaml)).await
    }

    pub async fn apply_all(&self, resources: Vec<KubernetesResource>) -> bool {
        let before = self.handler.sequence();
        let mut changed = false;
        let mut rebuild = false;
        for resource in resources {
            let endpoints = matches!(resource, KubernetesResource::Endpoints(_));
            if self.handler.on_add(resource) {
                changed = true;
                rebuild |= !endpoints;
            }
        }
        if rebuild {
            self.wait_past(before).await;
        }
        changed
    }

    pub async fn update(&self, old: &str, new: &str) -> bool {
        let old = single(old);
        let new = single(new);
        let rebuild = !matches!(new, KubernetesResource::Endpoints(_));
        let before = self.handler.sequence();
        let changed = self.handler.on_update(old, new);
        if changed && rebuild {
            self.wait_past(before).await;
        }
        changed
    }

    pub async fn delete(&self, yaml: &str) -> bool {
        let resource = single(yaml);
        let rebuild = !matches!(resource, KubernetesResource::Endpoints(_));
        let before = self.handler.sequence();
        let changed = self.handler.on_delete(&resource);
        if changed && rebuild {
            self.wait_past(before).await;
        }
        changed
    }

    pub fn status(&self, kind: Kind, namespace: &str, name: &str) -> Option<ObjectStatus> {
        self.statuses.get(&ObjectKey::new(kind, namespace, name))
    }

    pub fn listener(&self, name: &str) -> Option<Listener> {
        self.snapshots.listeners.snapshot().resources.get(name).cloned()
    }

    pub fn route_config(&self, name: &str) -> Option<RouteConfiguration> {
        self.snapshots.routes.snapshot().resources.get(name).cloned()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.snapshots.clusters.snapshot().resources.keys().cloned().collect()
    }

    /// First cluster whose name starts with `prefix`
    pub fn cluster(&self, prefix: &str) -> Option<Cluster> {
        let snapshot = self.snapshots.clusters.snapshot();
        snapshot.resources.iter().find(|(name, _)| name.starts_with(prefix)).map(|(_, c)| c.clone())
    }

    pub fn assignment(&self, name: &str) -> Option<ClusterLoadAssignment> {
        self.snapshots.endpoints.snapshot().resources.get(name).cloned()
    }

    pub fn secret_names(&self) -> Vec<String> {
        self.snapshots.secrets.snapshot().resources.keys().cloned().collect()
    }
}

pub fn parse(yaml: &str) -> Vec<KubernetesResource> {
    manifest::parse_documents(yaml).expect("valid manifest")
}

fn single(yaml: &str) -> KubernetesResource {
    let mut resources = parse(yaml);
    assert_eq!(resources.len(), 1, "expected exactly one object");
    resources.remove(0)
}

/// Connection manager of a network filter
pub fn connection_manager(filter: &Filter) -> HttpConnectionManager {
    match &filter.config_type {
        Some(ConfigType::TypedConfig(any)) => {
            HttpConnectionManager::decode(any.value.as_slice()).expect("connection manager config")
        }
        other => panic!("unexpected filter config {:?}", other),
    }
}

/// Names of the HTTP filters on the first filter chain whose server names
/// include `server_name`, or on the first chain when `server_name` is empty
pub fn http_filter_names(listener: &Listener, server_name: &str) -> Vec<String> {
    let chain = listener
        .filter_chains
        .iter()
        .find(|chain| {
            server_name.is_empty()
                || chain
                    .filter_chain_match
                    .as_ref()
                    .is_some_and(|m| m.server_names.iter().any(|n| n == server_name))
        })
        .expect("filter chain");
    connection_manager(&chain.filters[0]).http_filters.into_iter().map(|f| f.name).collect()
}

fn indent(pem: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    pem.lines().map(|line| format!("{}{}", pad, line)).collect::<Vec<_>>().join("\n")
}

/// `kubernetes.io/tls` Secret manifest built from the fixture certificate
pub fn tls_secret_yaml(namespace: &str, name: &str) -> String {
    format!(
        "apiVersion: v1\nkind: Secret\nmetadata: {{name: {name}, namespace: {namespace}}}\ntype: kubernetes.io/tls\nstringData:\n  tls.crt: |\n{cert}\n  tls.key: |\n{key}\n",
        name = name,
        namespace = namespace,
        cert = indent(CERT, 4),
        key = indent(KEY, 4),
    )
}

/// Service manifest with one port per `(name, port)`
pub fn service_yaml(namespace: &str, name: &str, ports: &[(&str, i32)]) -> String {
    let ports: Vec<String> =
        ports.iter().map(|(port_name, port)| format!("  - {{name: {}, port: {}}}", port_name, port)).collect();
    format!(
        "apiVersion: v1\nkind: Service\nmetadata: {{name: {}, namespace: {}}}\nspec:\n  ports:\n{}\n",
        name,
        namespace,
        ports.join("\n")
    )
}

/// Endpoints manifest with the given ready addresses on one named port
pub fn endpoints_yaml(namespace: &str, name: &str, port_name: &str, port: i32, ips: &[&str]) -> String {
    if ips.is_empty() {
        return format!("apiVersion: v1\nkind: Endpoints\nmetadata: {{name: {}, namespace: {}}}\n", name, namespace);
    }
    let addresses: Vec<String> = ips.iter().map(|ip| format!("{{ip: {}}}", ip)).collect();
    format!(
        "apiVersion: v1\nkind: Endpoints\nmetadata: {{name: {}, namespace: {}}}\nsubsets:\n- addresses: [{}]\n  ports: [{{name: {}, port: {}}}]\n",
        name,
        namespace,
        addresses.join(", "),
        port_name,
        port
    )
}
