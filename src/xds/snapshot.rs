//! Versioned per-type resource snapshots.
//!
//! Each discovery type owns an independent [`SnapshotCache`]. An update that
//! changes nothing keeps the current version; any change installs a new
//! immutable snapshot under a single pointer swap and notifies subscribers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use parking_lot::RwLock;
use prost::Message;
use tokio::sync::broadcast;
use tracing::debug;

use crate::observability::metrics;

use super::resources::{
    any_from_message, type_label, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL,
    ROUTE_TYPE_URL, SECRET_TYPE_URL,
};

/// Broadcast when a snapshot changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub type_url: &'static str,
    pub version: u64,
}

/// One immutable resource set
#[derive(Debug)]
pub struct Snapshot<M> {
    pub version: u64,
    pub resources: BTreeMap<String, M>,
}

pub struct SnapshotCache<M> {
    type_url: &'static str,
    current: RwLock<Arc<Snapshot<M>>>,
    updates: broadcast::Sender<SnapshotUpdate>,
}

impl<M> SnapshotCache<M>
where
    M: Message + PartialEq,
{
    pub fn new(type_url: &'static str, updates: broadcast::Sender<SnapshotUpdate>) -> Self {
        Self {
            type_url,
            current: RwLock::new(Arc::new(Snapshot { version: 0, resources: BTreeMap::new() })),
            updates,
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    /// Install `resources` unless they equal the current snapshot. Returns
    /// whether the version moved.
    pub fn update(&self, resources: BTreeMap<String, M>) -> bool {
        let version = {
            let mut current = self.current.write();
            if current.resources == resources {
                return false;
            }
            let version = current.version + 1;
            let count = resources.len();
            *current = Arc::new(Snapshot { version, resources });
            metrics::record_snapshot_update(self.type_url, version, count);
            debug!(
                type_url = %self.type_url,
                version,
                resources = count,
                "Installed new {} snapshot",
                type_label(self.type_url)
            );
            version
        };
        // No receivers simply means no discovery stream is open yet.
        let _ = self.updates.send(SnapshotUpdate { type_url: self.type_url, version });
        true
    }

    pub fn snapshot(&self) -> Arc<Snapshot<M>> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// All resources for an empty name list, otherwise those named. Unknown
    /// names are skipped.
    pub fn query(&self, names: &[String]) -> (u64, Vec<Any>) {
        let snapshot = self.snapshot();
        let resources = if names.is_empty() {
            snapshot.resources.values().map(|m| any_from_message(self.type_url, m)).collect()
        } else {
            let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
            snapshot
                .resources
                .iter()
                .filter(|(name, _)| wanted.contains(name.as_str()))
                .map(|(_, m)| any_from_message(self.type_url, m))
                .collect()
        };
        (snapshot.version, resources)
    }
}

/// Type-erased access used by the discovery server
pub trait DiscoveryCache: Send + Sync {
    fn type_url(&self) -> &'static str;
    fn version(&self) -> u64;
    fn query(&self, names: &[String]) -> (u64, Vec<Any>);
}

impl<M> DiscoveryCache for SnapshotCache<M>
where
    M: Message + PartialEq + Send + Sync,
{
    fn type_url(&self) -> &'static str {
        self.type_url
    }

    fn version(&self) -> u64 {
        SnapshotCache::version(self)
    }

    fn query(&self, names: &[String]) -> (u64, Vec<Any>) {
        SnapshotCache::query(self, names)
    }
}

/// The five snapshot caches served over xDS, sharing one notification channel
pub struct SnapshotSet {
    pub clusters: SnapshotCache<Cluster>,
    pub endpoints: SnapshotCache<ClusterLoadAssignment>,
    pub listeners: SnapshotCache<Listener>,
    pub routes: SnapshotCache<RouteConfiguration>,
    pub secrets: SnapshotCache<Secret>,
    updates: broadcast::Sender<SnapshotUpdate>,
}

impl SnapshotSet {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(128);
        Self {
            clusters: SnapshotCache::new(CLUSTER_TYPE_URL, updates.clone()),
            endpoints: SnapshotCache::new(ENDPOINT_TYPE_URL, updates.clone()),
            listeners: SnapshotCache::new(LISTENER_TYPE_URL, updates.clone()),
            routes: SnapshotCache::new(ROUTE_TYPE_URL, updates.clone()),
            secrets: SnapshotCache::new(SECRET_TYPE_URL, updates.clone()),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.updates.subscribe()
    }

    pub fn cache(&self, type_url: &str) -> Option<&dyn DiscoveryCache> {
        match type_url {
            CLUSTER_TYPE_URL => Some(&self.clusters),
            ENDPOINT_TYPE_URL => Some(&self.endpoints),
            LISTENER_TYPE_URL => Some(&self.listeners),
            ROUTE_TYPE_URL => Some(&self.routes),
            SECRET_TYPE_URL => Some(&self.secrets),
            _ => None,
        }
    }
}

impl Default for SnapshotSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> (String, Cluster) {
        (name.to_string(), Cluster { name: name.to_string(), ..Default::default() })
    }

    #[test]
    fn unchanged_update_keeps_version() {
        let set = SnapshotSet::new();
        assert!(!set.clusters.update(BTreeMap::new()));
        assert_eq!(set.clusters.version(), 0);

        assert!(set.clusters.update(BTreeMap::from([cluster("a")])));
        assert_eq!(set.clusters.version(), 1);
        assert!(!set.clusters.update(BTreeMap::from([cluster("a")])));
        assert_eq!(set.clusters.version(), 1);
        assert!(set.clusters.update(BTreeMap::from([cluster("a"), cluster("b")])));
        assert_eq!(set.clusters.version(), 2);
    }

    #[test]
    fn query_filters_by_name() {
        let set = SnapshotSet::new();
        set.clusters.update(BTreeMap::from([cluster("a"), cluster("b")]));

        let (version, all) = set.clusters.query(&[]);
        assert_eq!(version, 1);
        assert_eq!(all.len(), 2);

        let (_, named) = set.clusters.query(&["b".to_string(), "missing".to_string()]);
        assert_eq!(named.len(), 1);
        assert_eq!(Cluster::decode(named[0].value.as_slice()).unwrap().name, "b");

        let (_, none) = set.clusters.query(&["missing".to_string()]);
        assert!(none.is_empty());
    }

    #[test]
    fn caches_are_independent() {
        let set = SnapshotSet::new();
        set.clusters.update(BTreeMap::from([cluster("a")]));
        assert_eq!(set.listeners.version(), 0);
        assert_eq!(set.cache(LISTENER_TYPE_URL).unwrap().version(), 0);
        assert_eq!(set.cache(CLUSTER_TYPE_URL).unwrap().version(), 1);
        assert!(set.cache("type.googleapis.com/unknown").is_none());
    }

    #[tokio::test]
    async fn updates_are_broadcast() {
        let set = SnapshotSet::new();
        let mut rx = set.subscribe();
        set.routes.update(BTreeMap::from([(
            "ingress_http".to_string(),
            RouteConfiguration { name: "ingress_http".into(), ..Default::default() },
        )]));
        let update = rx.recv().await.unwrap();
        assert_eq!(update, SnapshotUpdate { type_url: ROUTE_TYPE_URL, version: 1 });
    }
}
