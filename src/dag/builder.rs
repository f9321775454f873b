//! # Graph Builder
//!
//! Runs the processors in a fixed order over one cache snapshot and tidies the
//! result so translation sees a fully resolved, deterministic DAG.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::cache::CacheContents;
use crate::config::{AppConfig, ListenerConfig, PolicyConfig};
use crate::k8s::ObjectKey;

use super::extension_service_processor::ExtensionServiceProcessor;
use super::gateway_processor::GatewayProcessor;
use super::httpproxy_processor::HttpProxyProcessor;
use super::ingress_processor::IngressProcessor;
use super::listener_processor::ListenerProcessor;
use super::route_order::sort_routes;
use super::status::{ObjectStatus, StatusCache};
use super::{CacheView, Dag, HTTPS_LISTENER_NAME};

/// Settings the builder needs from the application configuration
#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    pub listeners: ListenerConfig,
    pub policy: PolicyConfig,
}

impl From<&AppConfig> for BuilderConfig {
    fn from(config: &AppConfig) -> Self {
        Self { listeners: config.listeners.clone(), policy: config.policy.clone() }
    }
}

/// One stage of DAG construction
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, dag: &mut Dag, view: &CacheView<'_>, status: &mut StatusCache);
}

/// Output of one rebuild
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub dag: Dag,
    pub statuses: BTreeMap<ObjectKey, ObjectStatus>,
}

impl BuildResult {
    pub fn invalid_count(&self) -> usize {
        self.statuses.values().filter(|s| !s.is_valid()).count()
    }
}

pub struct Builder {
    config: BuilderConfig,
    processors: Vec<Box<dyn Processor>>,
}

impl Builder {
    pub fn new(config: BuilderConfig) -> Self {
        let processors: Vec<Box<dyn Processor>> = vec![
            Box::new(ListenerProcessor::new(config.listeners.clone())),
            Box::new(IngressProcessor),
            Box::new(ExtensionServiceProcessor),
            Box::new(HttpProxyProcessor),
            Box::new(GatewayProcessor),
        ];
        Self { config, processors }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn build(&self, contents: &CacheContents) -> BuildResult {
        let view = CacheView::new(contents, &self.config.policy);
        let mut dag = Dag::default();
        let mut status = StatusCache::new();

        for processor in &self.processors {
            trace!(processor = processor.name(), "Running processor");
            processor.run(&mut dag, &view, &mut status);
        }

        finalize(&mut dag, &view, &status);
        debug!(
            listeners = dag.listeners.len(),
            clusters = dag.clusters.len(),
            secrets = dag.secrets.len(),
            "DAG built"
        );
        BuildResult { dag, statuses: status.finish() }
    }
}

/// Route errors that reject every route of the offending object
const ROUTE_REJECTIONS: [&str; 2] = ["RouteConflict", "DuplicateMatchConditions"];

/// Drop rejected owners' routes and empty hosts, order routes and prune
/// unreferenced clusters.
fn finalize(dag: &mut Dag, view: &CacheView<'_>, status: &StatusCache) {
    let rejected = status.keys_with_error("RouteError", &ROUTE_REJECTIONS);
    for listener in dag.listeners.values_mut() {
        let vhosts = listener
            .virtual_hosts
            .values_mut()
            .chain(listener.secure_virtual_hosts.values_mut().map(|s| &mut s.vhost));
        for vhost in vhosts {
            let before = vhost.routes.len();
            vhost.routes.retain(|route| !rejected.contains(&route.owner));
            if vhost.routes.len() != before {
                debug!(vhost = %vhost.name, dropped = before - vhost.routes.len(), "Dropped routes of rejected owners");
            }
        }
    }

    for listener in dag.listeners.values_mut() {
        listener.virtual_hosts.retain(|_, vhost| vhost.has_routes());
        listener
            .secure_virtual_hosts
            .retain(|_, svhost| svhost.vhost.has_routes() || svhost.tcp_proxy.is_some());
        for vhost in listener.virtual_hosts.values_mut() {
            sort_routes(&mut vhost.routes);
        }
        for svhost in listener.secure_virtual_hosts.values_mut() {
            sort_routes(&mut svhost.vhost.routes);
        }
    }
    dag.listeners.retain(|name, listener| {
        name != HTTPS_LISTENER_NAME || !listener.secure_virtual_hosts.is_empty()
    });

    let mut referenced = BTreeSet::new();
    for listener in dag.listeners.values() {
        let routes = listener
            .virtual_hosts
            .values()
            .chain(listener.secure_virtual_hosts.values().map(|s| &s.vhost))
            .flat_map(|vhost| vhost.routes.iter());
        for route in routes {
            referenced.extend(route.clusters().map(str::to_string));
        }
        for tcp in listener.secure_virtual_hosts.values().filter_map(|s| s.tcp_proxy.as_ref()) {
            referenced.extend(tcp.clusters.iter().map(|c| c.cluster.clone()));
        }
    }
    dag.clusters.retain(|name, _| referenced.contains(name));

    let wants_client_cert = dag.clusters.values().any(|c| c.policy.client_certificate.is_some());
    if wants_client_cert {
        if let Some(secret) = view.client_certificate() {
            dag.add_secret(secret.clone());
        }
    }
}
