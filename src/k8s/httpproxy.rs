//! HTTPProxy Custom Resource Definition
//!
//! An HTTPProxy either roots a virtual host (`spec.virtualhost` set) or
//! contributes routes to one through another proxy's `spec.includes`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// HTTPProxy specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "HTTPProxy",
    plural = "httpproxies",
    shortname = "proxy",
    namespaced,
    derive = "PartialEq"
)]
#[serde(default, rename_all = "camelCase")]
pub struct HTTPProxySpec {
    /// Present on root proxies only
    pub virtualhost: Option<VirtualHost>,
    pub routes: Vec<Route>,
    pub tcpproxy: Option<TCPProxy>,
    pub includes: Vec<Include>,
    pub ingress_class_name: Option<String>,
}

impl HTTPProxy {
    pub fn is_root(&self) -> bool {
        self.spec.virtualhost.is_some()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct VirtualHost {
    pub fqdn: String,
    pub tls: Option<TLS>,
    pub authorization: Option<AuthorizationServer>,
    pub cors_policy: Option<CorsPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TLS {
    /// `name` or `namespace/name` of a delegated secret
    pub secret_name: Option<String>,
    pub minimum_protocol_version: Option<String>,
    pub maximum_protocol_version: Option<String>,
    pub passthrough: bool,
    pub client_validation: Option<DownstreamValidation>,
    pub enable_fallback_certificate: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DownstreamValidation {
    pub ca_secret: Option<String>,
    pub crl_secret: Option<String>,
    pub skip_client_cert_validation: bool,
    pub only_verify_leaf_cert_crl: bool,
    pub optional_client_certificate: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationServer {
    pub extension_ref: ExtensionServiceReference,
    pub response_timeout: Option<String>,
    pub fail_open: bool,
    pub auth_policy: Option<AuthorizationPolicy>,
    pub with_request_body: Option<AuthorizationServerBufferSettings>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtensionServiceReference {
    pub api_version: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
}

/// Per-scope authorization settings; route values merge over virtual host values
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    pub disabled: Option<bool>,
    pub context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationServerBufferSettings {
    pub max_request_bytes: Option<u32>,
    pub allow_partial_message: bool,
    pub pack_as_bytes: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsPolicy {
    pub allow_credentials: bool,
    pub allow_origin: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<String>,
    pub allow_private_network: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
    pub global: Option<GlobalRateLimitPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalRateLimitPolicy {
    pub requests: u32,
    /// `second`, `minute` or `hour`
    pub unit: String,
    pub burst: u32,
    pub response_status_code: Option<u32>,
    pub response_headers_to_add: Vec<HeaderValue>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalRateLimitPolicy {
    pub disabled: bool,
    pub descriptors: Vec<RateLimitDescriptor>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitDescriptor {
    pub entries: Vec<RateLimitDescriptorEntry>,
}

/// Exactly one field should be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitDescriptorEntry {
    pub generic_key: Option<GenericKeyDescriptor>,
    pub request_header: Option<RequestHeaderDescriptor>,
    pub remote_address: Option<RemoteAddressDescriptor>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct GenericKeyDescriptor {
    pub key: Option<String>,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestHeaderDescriptor {
    pub header_name: String,
    pub descriptor_key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RemoteAddressDescriptor {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Include {
    pub name: String,
    pub namespace: Option<String>,
    pub conditions: Vec<MatchCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HeaderMatchCondition {
    pub name: String,
    pub present: bool,
    #[serde(rename = "notpresent")]
    pub not_present: bool,
    pub contains: Option<String>,
    #[serde(rename = "notcontains")]
    pub not_contains: Option<String>,
    pub exact: Option<String>,
    #[serde(rename = "notexact")]
    pub not_exact: Option<String>,
    pub regex: Option<String>,
    pub ignore_case: bool,
    pub treat_missing_as_empty: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub regex: Option<String>,
    pub contains: Option<String>,
    pub ignore_case: bool,
    pub present: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Route {
    pub conditions: Vec<MatchCondition>,
    pub services: Vec<Service>,
    pub enable_websockets: bool,
    pub permit_insecure: bool,
    pub auth_policy: Option<AuthorizationPolicy>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub health_check_policy: Option<HTTPHealthCheckPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub path_rewrite_policy: Option<PathRewritePolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub request_redirect_policy: Option<HTTPRequestRedirectPolicy>,
    pub direct_response_policy: Option<HTTPDirectResponsePolicy>,
}

/// Upstream Kubernetes Service reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub port: i32,
    /// `h2`, `h2c` or `tls`
    pub protocol: Option<String>,
    pub weight: Option<i64>,
    pub validation: Option<UpstreamValidation>,
    pub mirror: bool,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutPolicy {
    pub response: Option<String>,
    pub idle: Option<String>,
    pub idle_connection: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub count: Option<i64>,
    pub per_try_timeout: Option<String>,
    pub retry_on: Vec<String>,
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HTTPHealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub unhealthy_threshold_count: Option<i64>,
    pub healthy_threshold_count: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancerPolicy {
    pub strategy: Option<String>,
    pub request_hash_policies: Vec<RequestHashPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestHashPolicy {
    pub terminal: bool,
    pub header_hash_options: Option<HeaderHashOptions>,
    pub query_parameter_hash_options: Option<QueryParameterHashOptions>,
    pub hash_source_ip: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HeaderHashOptions {
    pub header_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryParameterHashOptions {
    pub parameter_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PathRewritePolicy {
    pub replace_prefix: Vec<ReplacePrefix>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplacePrefix {
    pub prefix: Option<String>,
    pub replacement: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HeadersPolicy {
    pub set: Vec<HeaderValue>,
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HTTPRequestRedirectPolicy {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i32>,
    pub status_code: Option<i32>,
    pub path: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HTTPDirectResponsePolicy {
    pub status_code: i32,
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TCPProxy {
    pub services: Vec<Service>,
    pub include: Option<TCPProxyInclude>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TCPProxyInclude {
    pub name: String,
    pub namespace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_root_proxy() {
        let yaml = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: www.example.com
    tls:
      secretName: tls-cert
  includes:
  - name: child
    namespace: teama
    conditions:
    - prefix: /blog
  routes:
  - conditions:
    - header:
        name: x-canary
        notpresent: true
    services:
    - name: kuard
      port: 8080
      weight: 90
"#;
        let proxy: HTTPProxy = serde_yaml::from_str(yaml).unwrap();
        assert!(proxy.is_root());
        assert_eq!(proxy.metadata.name.as_deref(), Some("root"));
        let vhost = proxy.spec.virtualhost.as_ref().unwrap();
        assert_eq!(vhost.fqdn, "www.example.com");
        assert_eq!(vhost.tls.as_ref().unwrap().secret_name.as_deref(), Some("tls-cert"));
        assert_eq!(proxy.spec.includes[0].conditions[0].prefix.as_deref(), Some("/blog"));
        let header = proxy.spec.routes[0].conditions[0].header.as_ref().unwrap();
        assert!(header.not_present);
        assert_eq!(proxy.spec.routes[0].services[0].weight, Some(90));
    }

    #[test]
    fn auth_policy_disabled_is_tristate() {
        let unset: AuthorizationPolicy = serde_yaml::from_str("context: {a: b}").unwrap();
        assert_eq!(unset.disabled, None);
        let set: AuthorizationPolicy = serde_yaml::from_str("disabled: false").unwrap();
        assert_eq!(set.disabled, Some(false));
    }
}
