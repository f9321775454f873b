//! # Routing DAG
//!
//! The fully resolved model of one rebuild. Processors populate it from a cache
//! snapshot; translators walk it to produce Envoy resources. Every reference in
//! the DAG points at something that exists: fragments whose dependencies are
//! missing are never added.

pub mod builder;
pub mod cache_view;
pub mod extension_service_processor;
pub mod gateway_processor;
pub mod httpproxy_processor;
pub mod ingress_processor;
pub mod listener_processor;
pub mod policy;
pub mod route_order;
pub mod status;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::k8s::{NamespacedName, ObjectKey};
use crate::utils::duration::TimeoutSetting;
use crate::utils::short_hash;

pub use builder::{Builder, BuilderConfig, Processor};
pub use cache_view::CacheView;
pub use status::{CurrentStatus, ObjectStatus, StatusCache};

pub const HTTP_LISTENER_NAME: &str = "ingress_http";
pub const HTTPS_LISTENER_NAME: &str = "ingress_https";

/// Hostname used when a rule does not name one
pub const WILDCARD_HOST: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerProtocol {
    Http,
    Https,
}

/// Path part of a route match
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMatch {
    Exact(String),
    Regex(String),
    /// Plain string prefix
    Prefix(String),
    /// Prefix matched on whole path segments (`/foo` matches `/foo/bar`, not `/foobar`)
    Segment(String),
}

impl PathMatch {
    pub fn path(&self) -> &str {
        match self {
            PathMatch::Exact(p) | PathMatch::Regex(p) | PathMatch::Prefix(p) | PathMatch::Segment(p) => p,
        }
    }
}

impl Default for PathMatch {
    fn default() -> Self {
        PathMatch::Prefix("/".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderMatchKind {
    Present,
    NotPresent,
    Exact(String),
    NotExact(String),
    Contains(String),
    NotContains(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderCondition {
    pub name: String,
    pub kind: HeaderMatchKind,
    pub ignore_case: bool,
    pub treat_missing_as_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryMatchKind {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(String),
    Contains(String),
    Present,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryCondition {
    pub name: String,
    pub kind: QueryMatchKind,
    pub ignore_case: bool,
}

/// Everything a request must satisfy to select a route. Header and query
/// conditions are kept sorted so equal sets compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteConditions {
    pub path: PathMatch,
    pub headers: Vec<HeaderCondition>,
    pub query_params: Vec<QueryCondition>,
}

impl RouteConditions {
    pub fn new(path: PathMatch, mut headers: Vec<HeaderCondition>, mut query_params: Vec<QueryCondition>) -> Self {
        headers.sort();
        headers.dedup();
        query_params.sort();
        query_params.dedup();
        Self { path, headers, query_params }
    }
}

/// Header mutations applied to requests or responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeadersPolicy {
    pub set: BTreeMap<String, String>,
    pub add: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl HeadersPolicy {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty() && self.remove.is_empty()
    }
}

/// One upstream of a forwarding route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WeightedCluster {
    /// Key into [`Dag::clusters`]
    pub cluster: String,
    pub weight: u32,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathRewrite {
    Prefix(String),
    FullPath(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Redirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u32>,
    pub path: Option<PathRewrite>,
    /// 301 when unset
    pub status_code: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteAction {
    Forward(Vec<WeightedCluster>),
    Redirect(Redirect),
    DirectResponse { status: u32, body: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: TimeoutSetting,
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteTimeouts {
    pub response: TimeoutSetting,
    pub idle: TimeoutSetting,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashSource {
    Header(String),
    QueryParameter(String),
    SourceIp,
    Cookie { name: String, ttl: Duration, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashPolicy {
    pub terminal: bool,
    pub source: HashSource,
}

/// Token bucket enforced by Envoy itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalRateLimit {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval: Duration,
    pub response_status_code: u32,
    pub response_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorEntry {
    GenericKey { key: String, value: String },
    RequestHeader { header_name: String, descriptor_key: String },
    RemoteAddress,
}

/// Descriptors sent to the rate limit service
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GlobalRateLimit {
    pub disabled: bool,
    pub descriptors: Vec<Vec<DescriptorEntry>>,
}

/// Per-route view of the virtual host authorization server
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteAuthorization {
    pub disabled: bool,
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub owner: ObjectKey,
    pub conditions: RouteConditions,
    pub action: RouteAction,
    /// Answer with a redirect to HTTPS instead of the action
    pub https_redirect: bool,
    pub websocket: bool,
    pub timeouts: RouteTimeouts,
    pub retry: Option<RetryPolicy>,
    pub path_rewrite: Option<PathRewrite>,
    pub host_rewrite: Option<String>,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
    pub authorization: Option<RouteAuthorization>,
    pub local_rate_limit: Option<LocalRateLimit>,
    pub global_rate_limit: Option<GlobalRateLimit>,
    pub hash_policies: Vec<HashPolicy>,
}

impl Route {
    pub fn new(owner: ObjectKey, conditions: RouteConditions, action: RouteAction) -> Self {
        Self {
            owner,
            conditions,
            action,
            https_redirect: false,
            websocket: false,
            timeouts: RouteTimeouts::default(),
            retry: None,
            path_rewrite: None,
            host_rewrite: None,
            request_headers: HeadersPolicy::default(),
            response_headers: HeadersPolicy::default(),
            authorization: None,
            local_rate_limit: None,
            global_rate_limit: None,
            hash_policies: Vec::new(),
        }
    }

    /// Insecure twin of a secure route: same match, answers with a redirect to HTTPS
    pub fn to_https_redirect(&self) -> Self {
        let mut redirect = Route::new(
            self.owner.clone(),
            self.conditions.clone(),
            RouteAction::Redirect(Redirect::default()),
        );
        redirect.https_redirect = true;
        redirect
    }

    /// Cluster names this route forwards to
    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        let forward = match &self.action {
            RouteAction::Forward(clusters) => clusters.as_slice(),
            _ => &[],
        };
        forward.iter().map(|c| c.cluster.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorsPolicy {
    pub allow_credentials: bool,
    pub allow_origin: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<Duration>,
    pub allow_private_network: bool,
}

/// A rejected route and who already owns the match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConflict {
    pub existing_owner: ObjectKey,
    pub same_owner: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualHost {
    pub name: String,
    pub routes: Vec<Route>,
    pub cors: Option<CorsPolicy>,
    pub local_rate_limit: Option<LocalRateLimit>,
    pub global_rate_limit: Option<GlobalRateLimit>,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Add a route unless an existing one has identical conditions.
    pub fn add_route(&mut self, route: Route) -> Result<(), RouteConflict> {
        if let Some(existing) = self.routes.iter().find(|r| r.conditions == route.conditions) {
            return Err(RouteConflict {
                existing_owner: existing.owner.clone(),
                same_owner: existing.owner == route.owner,
            });
        }
        self.routes.push(route);
        Ok(())
    }

    pub fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Add a route, reporting a rejection on the route's owner.
    pub fn add_route_reporting(&mut self, route: Route, status: &mut StatusCache) -> bool {
        let owner = route.owner.clone();
        let path = route.conditions.path.path().to_string();
        match self.add_route(route) {
            Ok(()) => true,
            Err(conflict) if conflict.same_owner => {
                status.add_error(
                    &owner,
                    "RouteError",
                    "DuplicateMatchConditions",
                    format!("duplicate match conditions for route {:?} on host {:?}", path, self.name),
                );
                false
            }
            Err(conflict) => {
                status.add_error(
                    &owner,
                    "RouteError",
                    "RouteConflict",
                    format!(
                        "route {:?} on host {:?} is already defined by {}",
                        path, self.name, conflict.existing_owner
                    ),
                );
                false
            }
        }
    }
}

/// Client certificate requirements on a secure virtual host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerValidation {
    pub ca_bundle: Option<Arc<Vec<u8>>>,
    pub crl: Option<Arc<Vec<u8>>>,
    pub skip_client_cert_validation: bool,
    pub only_verify_leaf_cert_crl: bool,
    pub optional_client_certificate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferSettings {
    pub max_request_bytes: u32,
    pub allow_partial_message: bool,
    pub pack_as_bytes: bool,
}

/// External authorization server attached to a secure virtual host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalAuthorization {
    /// Key into [`Dag::extension_clusters`]
    pub cluster: String,
    pub response_timeout: TimeoutSetting,
    pub fail_open: bool,
    pub with_request_body: Option<BufferSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpProxy {
    pub clusters: Vec<WeightedCluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1.2" => Some(TlsVersion::V1_2),
            "1.3" => Some(TlsVersion::V1_3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecureVirtualHost {
    pub vhost: VirtualHost,
    /// Key into [`Dag::secrets`]; absent for passthrough
    pub secret: Option<String>,
    pub min_tls_version: Option<TlsVersion>,
    pub max_tls_version: Option<TlsVersion>,
    pub fallback_certificate: Option<String>,
    pub client_validation: Option<PeerValidation>,
    pub authorization: Option<ExternalAuthorization>,
    pub tcp_proxy: Option<TcpProxy>,
    pub passthrough: bool,
}

impl SecureVirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            vhost: VirtualHost::new(name),
            secret: None,
            min_tls_version: None,
            max_tls_version: None,
            fallback_certificate: None,
            client_validation: None,
            authorization: None,
            tcp_proxy: None,
            passthrough: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.vhost.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub virtual_hosts: BTreeMap<String, VirtualHost>,
    pub secure_virtual_hosts: BTreeMap<String, SecureVirtualHost>,
}

impl Listener {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, protocol: ListenerProtocol) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            protocol,
            virtual_hosts: BTreeMap::new(),
            secure_virtual_hosts: BTreeMap::new(),
        }
    }

    pub fn vhost_mut(&mut self, hostname: &str) -> &mut VirtualHost {
        self.virtual_hosts.entry(hostname.to_string()).or_insert_with(|| VirtualHost::new(hostname))
    }

    pub fn secure_vhost_mut(&mut self, hostname: &str) -> &mut SecureVirtualHost {
        self.secure_virtual_hosts
            .entry(hostname.to_string())
            .or_insert_with(|| SecureVirtualHost::new(hostname))
    }

    /// Name of the route configuration carrying this listener's insecure hosts
    pub fn route_config_name(&self) -> String {
        self.name.clone()
    }

    /// Name of the route configuration for one secure host
    pub fn secure_route_config_name(&self, hostname: &str) -> String {
        if self.name == HTTPS_LISTENER_NAME {
            format!("https/{}", hostname)
        } else {
            format!("{}/{}", self.name, hostname)
        }
    }
}

/// Upstream protocol spoken to a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum UpstreamProtocol {
    #[default]
    Http1,
    H2,
    H2c,
    Tls,
}

impl UpstreamProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "h2" => Some(UpstreamProtocol::H2),
            "h2c" => Some(UpstreamProtocol::H2c),
            "tls" => Some(UpstreamProtocol::Tls),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::Http1 => "http/1.1",
            UpstreamProtocol::H2 => "h2",
            UpstreamProtocol::H2c => "h2c",
            UpstreamProtocol::Tls => "tls",
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, UpstreamProtocol::H2 | UpstreamProtocol::Tls)
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, UpstreamProtocol::H2 | UpstreamProtocol::H2c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    /// Consistent hashing on request attributes
    RequestHash,
    /// Consistent hashing on a generated session cookie
    Cookie,
}

impl LoadBalancerStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RoundRobin" => Some(LoadBalancerStrategy::RoundRobin),
            "WeightedLeastRequest" => Some(LoadBalancerStrategy::WeightedLeastRequest),
            "Random" => Some(LoadBalancerStrategy::Random),
            "RequestHash" => Some(LoadBalancerStrategy::RequestHash),
            "Cookie" => Some(LoadBalancerStrategy::Cookie),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::RoundRobin => "RoundRobin",
            LoadBalancerStrategy::WeightedLeastRequest => "WeightedLeastRequest",
            LoadBalancerStrategy::Random => "Random",
            LoadBalancerStrategy::RequestHash => "RequestHash",
            LoadBalancerStrategy::Cookie => "Cookie",
        }
    }

    pub fn uses_ring_hash(&self) -> bool {
        matches!(self, LoadBalancerStrategy::RequestHash | LoadBalancerStrategy::Cookie)
    }
}

/// Upstream certificate verification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamValidation {
    pub ca_secret: NamespacedName,
    pub ca_bundle: Arc<Vec<u8>>,
    pub subject_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HealthCheck {
    pub path: String,
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CircuitBreakers {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

impl CircuitBreakers {
    pub fn is_empty(&self) -> bool {
        *self == CircuitBreakers::default()
    }
}

/// Every proxy-relevant setting that distinguishes one cluster for a service
/// port from another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UpstreamPolicy {
    pub protocol: UpstreamProtocol,
    pub lb_strategy: LoadBalancerStrategy,
    pub validation: Option<UpstreamValidation>,
    pub sni: Option<String>,
    pub health_check: Option<HealthCheck>,
    pub circuit_breakers: CircuitBreakers,
    pub connect_timeout: Duration,
    pub idle_connection_timeout: TimeoutSetting,
    /// Secret presented by Envoy to TLS upstreams
    pub client_certificate: Option<String>,
}

impl UpstreamPolicy {
    /// Stable textual form hashed into the cluster name
    fn canonical(&self) -> Vec<String> {
        let mut parts = vec![
            format!("protocol={}", self.protocol.as_str()),
            format!("lb={}", self.lb_strategy.as_str()),
            format!("connect={}", self.connect_timeout.as_nanos()),
            format!("idle={:?}", self.idle_connection_timeout),
            format!(
                "cb={:?},{:?},{:?},{:?}",
                self.circuit_breakers.max_connections,
                self.circuit_breakers.max_pending_requests,
                self.circuit_breakers.max_requests,
                self.circuit_breakers.max_retries
            ),
        ];
        if let Some(validation) = &self.validation {
            parts.push(format!(
                "validation={},{},{}",
                validation.ca_secret,
                short_hash([validation.ca_bundle.as_slice()]),
                validation.subject_name
            ));
        }
        if let Some(sni) = &self.sni {
            parts.push(format!("sni={}", sni));
        }
        if let Some(hc) = &self.health_check {
            parts.push(format!(
                "hc={},{},{},{},{},{}",
                hc.path,
                hc.host,
                hc.interval.as_secs(),
                hc.timeout.as_secs(),
                hc.unhealthy_threshold,
                hc.healthy_threshold
            ));
        }
        if let Some(cert) = &self.client_certificate {
            parts.push(format!("client_cert={}", cert));
        }
        parts
    }
}

/// An upstream Kubernetes Service port with a fixed policy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceCluster {
    pub namespace: String,
    pub service: String,
    pub port: i32,
    /// Name of the Service port; empty for unnamed ports
    pub port_name: String,
    pub policy: UpstreamPolicy,
}

impl ServiceCluster {
    /// `<namespace>/<service>/<port>/<hash>`
    pub fn name(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace,
            self.service,
            self.port,
            short_hash(self.policy.canonical())
        )
    }

    /// Name endpoints are published under
    pub fn eds_name(&self) -> String {
        eds_service_name(&self.namespace, &self.service, &self.port_name)
    }
}

/// `<namespace>/<service>/<port-name>`, or `<namespace>/<service>` for an unnamed port
pub fn eds_service_name(namespace: &str, service: &str, port_name: &str) -> String {
    if port_name.is_empty() {
        format!("{}/{}", namespace, service)
    } else {
        format!("{}/{}/{}", namespace, service, port_name)
    }
}

/// A Service port backing an extension cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortRef {
    pub namespace: String,
    pub service: String,
    pub port: i32,
    pub port_name: String,
}

impl ServicePortRef {
    pub fn eds_name(&self) -> String {
        eds_service_name(&self.namespace, &self.service, &self.port_name)
    }
}

/// Cluster for a gRPC extension (authorization or rate limit service)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionCluster {
    pub source: NamespacedName,
    pub targets: Vec<ServicePortRef>,
    pub policy: UpstreamPolicy,
    pub response_timeout: TimeoutSetting,
}

impl ExtensionCluster {
    /// `extension/<namespace>/<name>`; also the EDS service name
    pub fn name(&self) -> String {
        extension_cluster_name(&self.source)
    }
}

pub fn extension_cluster_name(source: &NamespacedName) -> String {
    format!("extension/{}/{}", source.namespace, source.name)
}

/// Global rate limit service wiring, resolved from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitService {
    pub cluster: String,
    pub domain: String,
    pub fail_open: bool,
    pub enable_x_ratelimit_headers: bool,
    pub enable_resource_exhausted_code: bool,
}

/// Serving certificate and key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DagSecret {
    pub source: NamespacedName,
    pub cert_chain: Arc<Vec<u8>>,
    pub private_key: Arc<Vec<u8>>,
}

impl DagSecret {
    /// `<namespace>/<name>/<hash>` over the secret content
    pub fn name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.source.namespace,
            self.source.name,
            short_hash([self.cert_chain.as_slice(), self.private_key.as_slice()])
        )
    }
}

/// Result of one rebuild
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    pub listeners: BTreeMap<String, Listener>,
    pub clusters: BTreeMap<String, ServiceCluster>,
    pub extension_clusters: BTreeMap<String, ExtensionCluster>,
    pub secrets: BTreeMap<String, DagSecret>,
    pub rate_limit_service: Option<RateLimitService>,
    /// Secret served to clients that send no SNI, when configured and valid
    pub fallback_certificate: Option<String>,
}

impl Dag {
    pub fn listener_mut(&mut self, name: &str) -> Option<&mut Listener> {
        self.listeners.get_mut(name)
    }

    pub fn add_listener(&mut self, listener: Listener) -> &mut Listener {
        self.listeners.entry(listener.name.clone()).or_insert(listener)
    }

    /// Register a cluster, returning its name
    pub fn add_cluster(&mut self, cluster: ServiceCluster) -> String {
        let name = cluster.name();
        self.clusters.entry(name.clone()).or_insert(cluster);
        name
    }

    pub fn add_secret(&mut self, secret: DagSecret) -> String {
        let name = secret.name();
        self.secrets.entry(name.clone()).or_insert(secret);
        name
    }

    /// EDS names referenced by service clusters, with the Service port each maps to
    pub fn endpoint_references(&self) -> BTreeMap<String, Vec<ServicePortRef>> {
        let mut refs: BTreeMap<String, Vec<ServicePortRef>> = BTreeMap::new();
        for cluster in self.clusters.values() {
            let port = ServicePortRef {
                namespace: cluster.namespace.clone(),
                service: cluster.service.clone(),
                port: cluster.port,
                port_name: cluster.port_name.clone(),
            };
            let entry = refs.entry(cluster.eds_name()).or_default();
            if !entry.contains(&port) {
                entry.push(port);
            }
        }
        for extension in self.extension_clusters.values() {
            let entry = refs.entry(extension.name()).or_default();
            for target in &extension.targets {
                if !entry.contains(target) {
                    entry.push(target.clone());
                }
            }
        }
        refs
    }
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerProtocol::Http => f.write_str("HTTP"),
            ListenerProtocol::Https => f.write_str("HTTPS"),
        }
    }
}
