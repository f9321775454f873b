//! Listener translation.
//!
//! HTTP listeners carry one connection manager that fetches its routes over
//! RDS. HTTPS listeners sniff SNI with the TLS inspector and pick a filter
//! chain per secure virtual host; clients without SNI land on the fallback
//! chain when a fallback certificate is configured.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{
    address, socket_address::PortSpecifier, Address, HttpProtocolOptions, SocketAddress,
    TransportSocket,
};
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, listener_filter::ConfigType as ListenerFilterConfigType,
    Filter, FilterChain, FilterChainMatch, Listener as EnvoyListener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier, StripPortMode},
    HttpConnectionManager, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::{self, weighted_cluster::ClusterWeight},
    TcpProxy as EnvoyTcpProxy,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, CertificateValidationContext, CommonTlsContext,
    DownstreamTlsContext, TlsParameters,
};
use envoy_types::pb::google::protobuf::{Any, BoolValue};

use crate::dag::{
    Dag, ExternalAuthorization, Listener, ListenerProtocol, PeerValidation, SecureVirtualHost,
    TcpProxy, TlsVersion,
};

use super::filters::{http_filters, FilterChainOptions};
use super::resources::{ads_config_source, any_from_message};
use super::route::fallback_route_config_name;
use super::secret::{inline_bytes, sds_secret_config};
use super::TranslationOptions;

pub const HTTP_CONNECTION_MANAGER_FILTER: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
pub const TLS_INSPECTOR_FILTER: &str = "envoy.filters.listener.tls_inspector";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

// envoy.extensions.transport_sockets.tls.v3.TlsParameters.TlsProtocol
const TLS_V1_2: i32 = 3;
const TLS_V1_3: i32 = 4;

/// Every listener of the DAG, keyed by name. HTTPS listeners without a
/// single filter chain are left out.
pub fn listeners(dag: &Dag, options: &TranslationOptions) -> BTreeMap<String, EnvoyListener> {
    let mut out = BTreeMap::new();
    for listener in dag.listeners.values() {
        let envoy_listener = match listener.protocol {
            ListenerProtocol::Http => Some(http_listener(listener, dag, options)),
            ListenerProtocol::Https => https_listener(listener, dag, options),
        };
        if let Some(envoy_listener) = envoy_listener {
            out.insert(listener.name.clone(), envoy_listener);
        }
    }
    out
}

fn socket_address(listener: &Listener) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: listener.address.clone(),
            port_specifier: Some(PortSpecifier::PortValue(u32::from(listener.port))),
            ..Default::default()
        })),
    }
}

fn network_filter(name: &str, config: Any) -> Filter {
    Filter { name: name.to_string(), config_type: Some(FilterConfigType::TypedConfig(config)) }
}

fn http_connection_manager(
    stat_prefix: &str,
    route_config_name: String,
    dag: &Dag,
    authorization: Option<&ExternalAuthorization>,
    options: &TranslationOptions,
) -> Filter {
    let filters = http_filters(FilterChainOptions {
        compression: options.compression,
        rate_limit_service: dag.rate_limit_service.as_ref(),
        authorization,
        authorization_before_rate_limit: options.authorization_before_rate_limit,
    });
    let common_http_protocol_options = options
        .connection_idle_timeout
        .as_envoy_duration()
        .map(|idle| HttpProtocolOptions { idle_timeout: Some(idle), ..Default::default() });

    let hcm = HttpConnectionManager {
        codec_type: CodecType::Auto as i32,
        stat_prefix: stat_prefix.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name,
        })),
        http_filters: filters,
        common_http_protocol_options,
        request_timeout: options.request_timeout.as_envoy_duration(),
        stream_idle_timeout: options.stream_idle_timeout.as_envoy_duration(),
        use_remote_address: Some(BoolValue { value: true }),
        normalize_path: Some(BoolValue { value: true }),
        strip_port_mode: Some(StripPortMode::StripAnyHostPort(true)),
        ..Default::default()
    };
    network_filter(HTTP_CONNECTION_MANAGER_FILTER, any_from_message(HCM_TYPE_URL, &hcm))
}

fn tcp_proxy(stat_prefix: &str, proxy: &TcpProxy) -> Filter {
    let cluster_specifier = match proxy.clusters.as_slice() {
        [single] => tcp_proxy::ClusterSpecifier::Cluster(single.cluster.clone()),
        clusters => {
            let total: u32 = clusters.iter().map(|c| c.weight).sum();
            tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
                clusters: clusters
                    .iter()
                    .map(|c| ClusterWeight {
                        name: c.cluster.clone(),
                        weight: if total == 0 { 1 } else { c.weight },
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })
        }
    };
    let config = EnvoyTcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };
    network_filter(TCP_PROXY_FILTER, any_from_message(TCP_PROXY_TYPE_URL, &config))
}

fn http_listener(listener: &Listener, dag: &Dag, options: &TranslationOptions) -> EnvoyListener {
    let hcm = http_connection_manager(&listener.name, listener.route_config_name(), dag, None, options);
    EnvoyListener {
        name: listener.name.clone(),
        address: Some(socket_address(listener)),
        filter_chains: vec![FilterChain { filters: vec![hcm], ..Default::default() }],
        ..Default::default()
    }
}

fn tls_version(version: Option<&TlsVersion>, default: i32) -> i32 {
    match version {
        Some(TlsVersion::V1_2) => TLS_V1_2,
        Some(TlsVersion::V1_3) => TLS_V1_3,
        None => default,
    }
}

fn validation_context(peer: &PeerValidation) -> Option<ValidationContextType> {
    if peer.skip_client_cert_validation && peer.ca_bundle.is_none() {
        return None;
    }
    Some(ValidationContextType::ValidationContext(CertificateValidationContext {
        trusted_ca: peer.ca_bundle.as_ref().map(|ca| inline_bytes(ca)),
        crl: peer.crl.as_ref().map(|crl| inline_bytes(crl)),
        only_verify_leaf_cert_crl: peer.only_verify_leaf_cert_crl,
        trust_chain_verification: if peer.skip_client_cert_validation { 1 } else { 0 },
        ..Default::default()
    }))
}

/// TLS transport socket terminating connections with the named secret
fn downstream_tls(
    secret: &str,
    min: Option<&TlsVersion>,
    max: Option<&TlsVersion>,
    peer: Option<&PeerValidation>,
    alpn: bool,
) -> TransportSocket {
    let common = CommonTlsContext {
        tls_params: Some(TlsParameters {
            tls_minimum_protocol_version: tls_version(min, TLS_V1_2),
            tls_maximum_protocol_version: tls_version(max, TLS_V1_3),
            ..Default::default()
        }),
        tls_certificate_sds_secret_configs: vec![sds_secret_config(secret)],
        alpn_protocols: if alpn { vec!["h2".to_string(), "http/1.1".to_string()] } else { Vec::new() },
        validation_context_type: peer.and_then(validation_context),
        ..Default::default()
    };
    let require_client_certificate = peer
        .filter(|p| !p.optional_client_certificate && !p.skip_client_cert_validation)
        .map(|_| BoolValue { value: true });
    let tls = DownstreamTlsContext {
        common_tls_context: Some(common),
        require_client_certificate,
        ..Default::default()
    };
    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &tls,
        ))),
    }
}

fn sni_match(hostname: &str) -> FilterChainMatch {
    FilterChainMatch {
        server_names: vec![hostname.to_string()],
        transport_protocol: "tls".to_string(),
        ..Default::default()
    }
}

fn secure_filter_chain(
    listener: &Listener,
    svhost: &SecureVirtualHost,
    dag: &Dag,
    options: &TranslationOptions,
) -> Option<FilterChain> {
    let hostname = svhost.name();
    let stat_prefix = format!("{}/{}", listener.name, hostname);

    if svhost.passthrough {
        let proxy = svhost.tcp_proxy.as_ref()?;
        return Some(FilterChain {
            filter_chain_match: Some(sni_match(hostname)),
            filters: vec![tcp_proxy(&stat_prefix, proxy)],
            ..Default::default()
        });
    }

    let secret = svhost.secret.as_deref()?;
    let filter = match &svhost.tcp_proxy {
        Some(proxy) => tcp_proxy(&stat_prefix, proxy),
        None => {
            if !svhost.vhost.has_routes() {
                return None;
            }
            http_connection_manager(
                &listener.name,
                listener.secure_route_config_name(hostname),
                dag,
                svhost.authorization.as_ref(),
                options,
            )
        }
    };
    Some(FilterChain {
        filter_chain_match: Some(sni_match(hostname)),
        filters: vec![filter],
        transport_socket: Some(downstream_tls(
            secret,
            svhost.min_tls_version.as_ref(),
            svhost.max_tls_version.as_ref(),
            svhost.client_validation.as_ref(),
            svhost.tcp_proxy.is_none(),
        )),
        ..Default::default()
    })
}

fn fallback_filter_chain(listener: &Listener, dag: &Dag, options: &TranslationOptions) -> Option<FilterChain> {
    let secret = dag.fallback_certificate.as_deref()?;
    let wanted = listener
        .secure_virtual_hosts
        .values()
        .any(|svhost| svhost.fallback_certificate.is_some() && !svhost.passthrough && svhost.vhost.has_routes());
    if !wanted {
        return None;
    }
    let hcm = http_connection_manager(&listener.name, fallback_route_config_name(listener), dag, None, options);
    Some(FilterChain {
        name: "fallback-certificate".to_string(),
        filter_chain_match: Some(FilterChainMatch { transport_protocol: "tls".to_string(), ..Default::default() }),
        filters: vec![hcm],
        transport_socket: Some(downstream_tls(secret, None, None, None, true)),
        ..Default::default()
    })
}

fn https_listener(listener: &Listener, dag: &Dag, options: &TranslationOptions) -> Option<EnvoyListener> {
    let mut hosts: Vec<&SecureVirtualHost> = listener.secure_virtual_hosts.values().collect();
    // Exact server names win over wildcards.
    hosts.sort_by(|a, b| {
        (a.name().starts_with('*'), a.name()).cmp(&(b.name().starts_with('*'), b.name()))
    });

    let mut filter_chains: Vec<FilterChain> = hosts
        .into_iter()
        .filter_map(|svhost| secure_filter_chain(listener, svhost, dag, options))
        .collect();
    filter_chains.extend(fallback_filter_chain(listener, dag, options));
    if filter_chains.is_empty() {
        return None;
    }

    Some(EnvoyListener {
        name: listener.name.clone(),
        address: Some(socket_address(listener)),
        listener_filters: vec![ListenerFilter {
            name: TLS_INSPECTOR_FILTER.to_string(),
            config_type: Some(ListenerFilterConfigType::TypedConfig(Any {
                type_url: TLS_INSPECTOR_TYPE_URL.to_string(),
                value: Vec::new(),
            })),
            ..Default::default()
        }],
        filter_chains,
        ..Default::default()
    })
}
