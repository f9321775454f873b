//! Endpoints fast path.
//!
//! Endpoint churn is frequent and never changes the routing graph, so Endpoints
//! objects skip the resource cache and the rebuild entirely. The translator keeps
//! the latest object per Service and republishes the EDS snapshot after every
//! change. Assignments that once existed stay published (empty) after their
//! object goes away until a rebuild stops referencing them, and every EDS name
//! the current DAG references is always present.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{
    address, socket_address::PortSpecifier, Address, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::dag::{eds_service_name, ServicePortRef};
use crate::k8s::{name_of, namespace_of, Endpoints, NamespacedName};
use crate::observability::metrics;

use super::snapshot::SnapshotSet;

#[derive(Default)]
struct EndpointState {
    objects: BTreeMap<NamespacedName, Arc<Endpoints>>,
    references: BTreeMap<String, Vec<ServicePortRef>>,
    /// EDS names published from an Endpoints object since the last reference update
    known: BTreeSet<String>,
}

pub struct EndpointTranslator {
    state: Mutex<EndpointState>,
    snapshots: Arc<SnapshotSet>,
}

impl EndpointTranslator {
    pub fn new(snapshots: Arc<SnapshotSet>) -> Self {
        Self { state: Mutex::new(EndpointState::default()), snapshots }
    }

    /// Add or replace the Endpoints of one Service. Returns whether the EDS
    /// snapshot changed.
    pub fn upsert(&self, endpoints: Endpoints) -> bool {
        let key = NamespacedName::new(namespace_of(&endpoints.metadata), name_of(&endpoints.metadata));
        let mut state = self.state.lock();
        state.objects.insert(key, Arc::new(endpoints));
        self.publish(&mut state)
    }

    pub fn remove(&self, endpoints: &Endpoints) -> bool {
        let key = NamespacedName::new(namespace_of(&endpoints.metadata), name_of(&endpoints.metadata));
        let mut state = self.state.lock();
        if state.objects.remove(&key).is_none() {
            return false;
        }
        self.publish(&mut state)
    }

    /// Replace the set of EDS names the current DAG needs. Tombstones for names
    /// the DAG no longer references are dropped here; names still backed by an
    /// Endpoints object come back on publish.
    pub fn set_references(&self, references: BTreeMap<String, Vec<ServicePortRef>>) -> bool {
        let mut state = self.state.lock();
        let EndpointState { known, references: current, .. } = &mut *state;
        let before = known.len();
        known.retain(|name| references.contains_key(name));
        if *current == references && known.len() == before {
            return false;
        }
        *current = references;
        self.publish(&mut state)
    }

    fn publish(&self, state: &mut EndpointState) -> bool {
        let mut by_port: BTreeMap<String, Vec<LbEndpoint>> = BTreeMap::new();
        for endpoints in state.objects.values() {
            for (name, lb_endpoints) in lb_endpoints(endpoints) {
                by_port.entry(name).or_default().extend(lb_endpoints);
            }
        }
        state.known.extend(by_port.keys().cloned());

        let mut assignments: BTreeMap<String, ClusterLoadAssignment> = state
            .known
            .iter()
            .map(|name| {
                let endpoints = by_port.get(name).cloned().unwrap_or_default();
                (name.clone(), load_assignment(name, endpoints))
            })
            .collect();

        for (name, targets) in &state.references {
            if assignments.contains_key(name) {
                continue;
            }
            let mut merged: Vec<LbEndpoint> = targets
                .iter()
                .filter_map(|target| by_port.get(&target.eds_name()))
                .flatten()
                .cloned()
                .collect();
            merged.sort_by_key(endpoint_sort_key);
            merged.dedup();
            assignments.insert(name.clone(), load_assignment(name, merged));
        }

        let count = assignments.len();
        let changed = self.snapshots.endpoints.update(assignments);
        if changed {
            metrics::record_endpoint_update();
            debug!(assignments = count, "Published endpoint assignments");
        }
        changed
    }
}

fn load_assignment(name: &str, lb_endpoints: Vec<LbEndpoint>) -> ClusterLoadAssignment {
    let endpoints = if lb_endpoints.is_empty() {
        Vec::new()
    } else {
        vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }]
    };
    ClusterLoadAssignment { cluster_name: name.to_string(), endpoints, ..Default::default() }
}

fn lb_endpoint(ip: &str, port: u32) -> LbEndpoint {
    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(Address {
                address: Some(address::Address::SocketAddress(SocketAddress {
                    address: ip.to_string(),
                    port_specifier: Some(PortSpecifier::PortValue(port)),
                    ..Default::default()
                })),
            }),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn endpoint_sort_key(endpoint: &LbEndpoint) -> (String, u32) {
    let Some(HostIdentifier::Endpoint(Endpoint { address: Some(addr), .. })) = &endpoint.host_identifier
    else {
        return (String::new(), 0);
    };
    match &addr.address {
        Some(address::Address::SocketAddress(socket)) => {
            let port = match socket.port_specifier {
                Some(PortSpecifier::PortValue(port)) => port,
                _ => 0,
            };
            (socket.address.clone(), port)
        }
        _ => (String::new(), 0),
    }
}

/// Ready addresses of one Endpoints object grouped by EDS name. Not-ready
/// addresses are left out.
pub fn lb_endpoints(endpoints: &Endpoints) -> BTreeMap<String, Vec<LbEndpoint>> {
    let namespace = namespace_of(&endpoints.metadata);
    let service = name_of(&endpoints.metadata);
    let mut out: BTreeMap<String, Vec<LbEndpoint>> = BTreeMap::new();

    for subset in endpoints.subsets.iter().flatten() {
        let addresses = subset.addresses.as_deref().unwrap_or_default();
        for port in subset.ports.iter().flatten() {
            if port.protocol.as_deref().is_some_and(|p| p != "TCP") {
                continue;
            }
            let port_number = match u16::try_from(port.port) {
                Ok(number) if number != 0 => u32::from(number),
                _ => {
                    debug!(namespace, service, port = port.port, "Skipping endpoint port out of range");
                    continue;
                }
            };
            let name = eds_service_name(namespace, service, port.name.as_deref().unwrap_or_default());
            let entry = out.entry(name).or_default();
            for address in addresses {
                entry.push(lb_endpoint(&address.ip, port_number));
            }
        }
    }

    for entry in out.values_mut() {
        entry.sort_by_key(endpoint_sort_key);
        entry.dedup();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn endpoints(name: &str, ips: &[&str], ports: &[(&str, i32)]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress { ip: ip.to_string(), ..Default::default() })
                        .collect(),
                ),
                ports: Some(
                    ports
                        .iter()
                        .map(|(name, port)| EndpointPort {
                            name: (!name.is_empty()).then(|| name.to_string()),
                            port: *port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        }
    }

    fn assignment(snapshots: &SnapshotSet, name: &str) -> ClusterLoadAssignment {
        snapshots.endpoints.snapshot().resources[name].clone()
    }

    #[test]
    fn groups_by_port_name_in_address_order() {
        let grouped = lb_endpoints(&endpoints("kuard", &["10.0.0.2", "10.0.0.1"], &[("http", 8080), ("admin", 9000)]));
        assert_eq!(grouped.len(), 2);
        let http = &grouped["default/kuard/http"];
        assert_eq!(endpoint_sort_key(&http[0]), ("10.0.0.1".to_string(), 8080));
        assert_eq!(endpoint_sort_key(&http[1]), ("10.0.0.2".to_string(), 8080));
    }

    #[test]
    fn unnamed_port_uses_service_name() {
        let grouped = lb_endpoints(&endpoints("kuard", &["10.0.0.1"], &[("", 8080)]));
        assert!(grouped.contains_key("default/kuard"));
    }

    #[test]
    fn delete_leaves_empty_assignment() {
        let snapshots = Arc::new(SnapshotSet::new());
        let translator = EndpointTranslator::new(snapshots.clone());
        let object = endpoints("kuard", &["10.0.0.1"], &[("http", 8080)]);

        assert!(translator.upsert(object.clone()));
        assert_eq!(assignment(&snapshots, "default/kuard/http").endpoints.len(), 1);

        assert!(translator.remove(&object));
        let empty = assignment(&snapshots, "default/kuard/http");
        assert_eq!(empty.cluster_name, "default/kuard/http");
        assert!(empty.endpoints.is_empty());

        assert!(!translator.remove(&object));
    }

    #[test]
    fn out_of_range_ports_are_skipped() {
        let grouped = lb_endpoints(&endpoints("kuard", &["10.0.0.1"], &[("http", -80), ("big", 70000), ("ok", 8080)]));
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["default/kuard/ok"]);
        assert_eq!(endpoint_sort_key(&grouped["default/kuard/ok"][0]), ("10.0.0.1".to_string(), 8080));
    }

    #[test]
    fn unreferenced_tombstones_are_pruned_on_reference_update() {
        let snapshots = Arc::new(SnapshotSet::new());
        let translator = EndpointTranslator::new(snapshots.clone());
        let gone = endpoints("gone", &["10.0.0.1"], &[("http", 8080)]);
        let live = endpoints("live", &["10.0.0.2"], &[("http", 8080)]);
        translator.upsert(gone.clone());
        translator.upsert(live);
        translator.remove(&gone);
        assert!(snapshots.endpoints.snapshot().resources.contains_key("default/gone/http"));

        assert!(translator.set_references(BTreeMap::new()));
        let snapshot = snapshots.endpoints.snapshot();
        assert!(!snapshot.resources.contains_key("default/gone/http"));
        assert_eq!(snapshot.resources["default/live/http"].endpoints[0].lb_endpoints.len(), 1);

        assert!(!translator.set_references(BTreeMap::new()));
    }

    #[test]
    fn referenced_names_always_present() {
        let snapshots = Arc::new(SnapshotSet::new());
        let translator = EndpointTranslator::new(snapshots.clone());
        let target = ServicePortRef {
            namespace: "default".into(),
            service: "authz".into(),
            port: 9000,
            port_name: "grpc".into(),
        };
        translator.set_references(BTreeMap::from([
            ("default/kuard/http".to_string(), vec![]),
            ("extension/default/authz".to_string(), vec![target]),
        ]));
        assert!(assignment(&snapshots, "default/kuard/http").endpoints.is_empty());
        assert!(assignment(&snapshots, "extension/default/authz").endpoints.is_empty());

        translator.upsert(endpoints("authz", &["10.0.0.9"], &[("grpc", 9000)]));
        let merged = assignment(&snapshots, "extension/default/authz");
        assert_eq!(merged.endpoints[0].lb_endpoints.len(), 1);
    }
}
