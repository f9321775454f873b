//! Cluster translation.
//!
//! Every DAG cluster becomes an EDS cluster whose assignment is served under
//! the cluster's EDS service name, so several clusters for one Service port
//! share a single endpoint set.

use std::collections::{BTreeMap, HashMap};

use envoy_types::pb::envoy::config::cluster::v3::circuit_breakers::Thresholds;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::{CircuitBreakers as EnvoyCircuitBreakers, Cluster};
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::core::v3::{
    health_check::{self, HttpHealthCheck},
    HealthCheck as EnvoyHealthCheck, Http1ProtocolOptions, Http2ProtocolOptions,
    HttpProtocolOptions as CommonHttpProtocolOptions, RoutingPriority, TransportSocket,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context, CertificateValidationContext, CommonTlsContext, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::{Any, UInt32Value};

use crate::dag::{
    CircuitBreakers, Dag, HealthCheck, LoadBalancerStrategy, UpstreamPolicy, UpstreamProtocol,
    UpstreamValidation,
};
use crate::utils::duration::to_proto_duration;

use super::resources::{ads_config_source, any_from_message};
use super::secret::{inline_bytes, sds_secret_config};

pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_NAME: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

/// Every cluster of the DAG, service and extension clusters alike
pub fn clusters(dag: &Dag) -> BTreeMap<String, Cluster> {
    let mut out = BTreeMap::new();
    for (name, cluster) in &dag.clusters {
        out.insert(name.clone(), build_cluster(name, &cluster.eds_name(), &cluster.policy));
    }
    for (name, extension) in &dag.extension_clusters {
        out.insert(name.clone(), build_cluster(name, name, &extension.policy));
    }
    out
}

fn build_cluster(name: &str, eds_name: &str, policy: &UpstreamPolicy) -> Cluster {
    let mut cluster = Cluster {
        name: name.to_string(),
        alt_stat_name: name.replace('/', "_"),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: eds_name.to_string(),
        }),
        connect_timeout: Some(to_proto_duration(policy.connect_timeout)),
        lb_policy: lb_policy(policy.lb_strategy) as i32,
        ..Default::default()
    };

    if !policy.circuit_breakers.is_empty() {
        cluster.circuit_breakers = Some(circuit_breakers(&policy.circuit_breakers));
    }
    if let Some(check) = &policy.health_check {
        cluster.health_checks = vec![health_check(check)];
    }
    if policy.protocol.uses_tls() {
        cluster.transport_socket = Some(upstream_tls(policy));
    }
    if let Some(options) = protocol_options(policy) {
        cluster.typed_extension_protocol_options = options;
    }
    cluster
}

fn lb_policy(strategy: LoadBalancerStrategy) -> LbPolicy {
    match strategy {
        LoadBalancerStrategy::RoundRobin => LbPolicy::RoundRobin,
        LoadBalancerStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LoadBalancerStrategy::Random => LbPolicy::Random,
        LoadBalancerStrategy::RequestHash | LoadBalancerStrategy::Cookie => LbPolicy::RingHash,
    }
}

fn uint32(value: Option<u32>) -> Option<UInt32Value> {
    value.map(|value| UInt32Value { value })
}

fn circuit_breakers(spec: &CircuitBreakers) -> EnvoyCircuitBreakers {
    EnvoyCircuitBreakers {
        thresholds: vec![Thresholds {
            priority: RoutingPriority::Default as i32,
            max_connections: uint32(spec.max_connections),
            max_pending_requests: uint32(spec.max_pending_requests),
            max_requests: uint32(spec.max_requests),
            max_retries: uint32(spec.max_retries),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn health_check(spec: &HealthCheck) -> EnvoyHealthCheck {
    EnvoyHealthCheck {
        timeout: Some(to_proto_duration(spec.timeout)),
        interval: Some(to_proto_duration(spec.interval)),
        unhealthy_threshold: Some(UInt32Value { value: spec.unhealthy_threshold }),
        healthy_threshold: Some(UInt32Value { value: spec.healthy_threshold }),
        health_checker: Some(health_check::HealthChecker::HttpHealthCheck(HttpHealthCheck {
            host: spec.host.clone(),
            path: spec.path.clone(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn validation_context(validation: &UpstreamValidation) -> CertificateValidationContext {
    let mut ctx = CertificateValidationContext {
        trusted_ca: Some(inline_bytes(&validation.ca_bundle)),
        ..Default::default()
    };
    #[allow(deprecated)]
    {
        ctx.match_subject_alt_names = vec![StringMatcher {
            match_pattern: Some(MatchPattern::Exact(validation.subject_name.clone())),
            ignore_case: false,
        }];
    }
    ctx
}

fn upstream_tls(policy: &UpstreamPolicy) -> TransportSocket {
    let mut common = CommonTlsContext::default();
    if policy.protocol == UpstreamProtocol::H2 {
        common.alpn_protocols = vec!["h2".to_string()];
    }
    if let Some(validation) = &policy.validation {
        common.validation_context_type = Some(
            common_tls_context::ValidationContextType::ValidationContext(validation_context(validation)),
        );
    }
    if let Some(secret) = &policy.client_certificate {
        common.tls_certificate_sds_secret_configs = vec![sds_secret_config(secret)];
    }

    let tls = UpstreamTlsContext {
        common_tls_context: Some(common),
        sni: policy.sni.clone().unwrap_or_default(),
        ..Default::default()
    };

    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            UPSTREAM_TLS_CONTEXT_TYPE_URL,
            &tls,
        ))),
    }
}

/// Explicit HTTP protocol options, needed for HTTP/2 upstreams and for an
/// upstream idle timeout.
fn protocol_options(policy: &UpstreamPolicy) -> Option<HashMap<String, Any>> {
    let idle_timeout = policy.idle_connection_timeout.as_envoy_duration();
    if !policy.protocol.is_http2() && idle_timeout.is_none() {
        return None;
    }

    let protocol_config = if policy.protocol.is_http2() {
        ProtocolConfig::Http2ProtocolOptions(Http2ProtocolOptions::default())
    } else {
        ProtocolConfig::HttpProtocolOptions(Http1ProtocolOptions::default())
    };

    let options = HttpProtocolOptions {
        common_http_protocol_options: idle_timeout
            .map(|idle| CommonHttpProtocolOptions { idle_timeout: Some(idle), ..Default::default() }),
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(ExplicitHttpConfig {
            protocol_config: Some(protocol_config),
        })),
        ..Default::default()
    };

    let mut map = HashMap::new();
    map.insert(
        HTTP_PROTOCOL_OPTIONS_NAME.to_string(),
        any_from_message(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    );
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ServiceCluster, UpstreamValidation};
    use crate::k8s::NamespacedName;
    use crate::utils::duration::TimeoutSetting;
    use prost::Message;
    use std::sync::Arc;
    use std::time::Duration;

    fn service_cluster(policy: UpstreamPolicy) -> ServiceCluster {
        ServiceCluster {
            namespace: "default".into(),
            service: "kuard".into(),
            port: 443,
            port_name: "https".into(),
            policy,
        }
    }

    fn single(dag: &Dag) -> Cluster {
        clusters(dag).into_values().next().unwrap()
    }

    #[test]
    fn plain_cluster_uses_eds_over_ads() {
        let mut dag = Dag::default();
        let name = dag.add_cluster(service_cluster(UpstreamPolicy {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }));
        let cluster = single(&dag);
        assert_eq!(cluster.name, name);
        assert_eq!(cluster.eds_cluster_config.unwrap().service_name, "default/kuard/https");
        assert_eq!(cluster.connect_timeout.unwrap().seconds, 2);
        assert!(cluster.transport_socket.is_none());
        assert!(cluster.typed_extension_protocol_options.is_empty());
        assert_eq!(cluster.lb_policy, LbPolicy::RoundRobin as i32);
    }

    #[test]
    fn tls_cluster_carries_sni_and_validation() {
        let mut dag = Dag::default();
        dag.add_cluster(service_cluster(UpstreamPolicy {
            protocol: UpstreamProtocol::H2,
            sni: Some("backend.example.com".into()),
            validation: Some(UpstreamValidation {
                ca_secret: NamespacedName::new("default", "ca"),
                ca_bundle: Arc::new(b"CA".to_vec()),
                subject_name: "backend.example.com".into(),
            }),
            lb_strategy: LoadBalancerStrategy::Cookie,
            ..Default::default()
        }));
        let cluster = single(&dag);
        assert_eq!(cluster.lb_policy, LbPolicy::RingHash as i32);
        assert!(cluster.typed_extension_protocol_options.contains_key(HTTP_PROTOCOL_OPTIONS_NAME));

        let socket = cluster.transport_socket.unwrap();
        let Some(TransportSocketConfigType::TypedConfig(any)) = socket.config_type else {
            panic!("missing typed config");
        };
        let tls = UpstreamTlsContext::decode(any.value.as_slice()).unwrap();
        assert_eq!(tls.sni, "backend.example.com");
        let common = tls.common_tls_context.unwrap();
        assert_eq!(common.alpn_protocols, vec!["h2".to_string()]);
        assert!(common.validation_context_type.is_some());
    }

    #[test]
    fn idle_timeout_uses_http1_options() {
        let mut dag = Dag::default();
        dag.add_cluster(service_cluster(UpstreamPolicy {
            idle_connection_timeout: TimeoutSetting::Value(Duration::from_secs(60)),
            ..Default::default()
        }));
        let cluster = single(&dag);
        let any = &cluster.typed_extension_protocol_options[HTTP_PROTOCOL_OPTIONS_NAME];
        let options = HttpProtocolOptions::decode(any.value.as_slice()).unwrap();
        assert_eq!(
            options.common_http_protocol_options.unwrap().idle_timeout.unwrap().seconds,
            60
        );
    }

    #[test]
    fn circuit_breakers_only_when_set() {
        let mut dag = Dag::default();
        dag.add_cluster(service_cluster(UpstreamPolicy {
            circuit_breakers: CircuitBreakers { max_connections: Some(9), ..Default::default() },
            ..Default::default()
        }));
        let cluster = single(&dag);
        let thresholds = &cluster.circuit_breakers.unwrap().thresholds[0];
        assert_eq!(thresholds.max_connections, Some(UInt32Value { value: 9 }));
        assert!(thresholds.max_requests.is_none());
    }
}
