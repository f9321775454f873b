//! HTTPProxy translation.
//!
//! Root proxies own a virtual host. Their routes, together with the routes of
//! every proxy reachable through `includes`, are gathered with the include
//! conditions prepended, then attached to the insecure and/or secure virtual
//! host for the root's fqdn. Non-root proxies that no root reaches are
//! reported as orphaned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::k8s::httpproxy::{
    self, AuthorizationPolicy, HTTPProxy, HeaderMatchCondition, MatchCondition, QueryParameterMatchCondition,
};
use crate::k8s::{namespace_of, Kind, NamespacedName, ObjectKey};
use crate::utils::duration::{parse_timeout, TimeoutSetting};

use super::builder::Processor;
use super::cache_view::{ClusterOptions, PortRef};
use super::policy;
use super::status::StatusCache;
use super::{
    extension_cluster_name, BufferSettings, CacheView, CorsPolicy, Dag, ExternalAuthorization, GlobalRateLimit,
    HeaderCondition, HeaderMatchKind, LocalRateLimit, PathMatch, PeerValidation, QueryCondition, QueryMatchKind,
    Route, RouteAction, RouteConditions, SecureVirtualHost, TcpProxy, TlsVersion, WeightedCluster,
    HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};

const EXTENSION_SERVICE_API_VERSION: &str = "projectcontour.io/v1alpha1";
const DEFAULT_MAX_REQUEST_BYTES: u32 = 1024;

type Proxies = BTreeMap<NamespacedName, Arc<HTTPProxy>>;

pub struct HttpProxyProcessor;

fn proxy_key(proxy: &HTTPProxy) -> ObjectKey {
    ObjectKey::new(
        Kind::HTTPProxy,
        namespace_of(&proxy.metadata),
        proxy.metadata.name.clone().unwrap_or_default(),
    )
}

impl Processor for HttpProxyProcessor {
    fn name(&self) -> &'static str {
        "httpproxy"
    }

    fn run(&self, dag: &mut Dag, view: &CacheView<'_>, status: &mut StatusCache) {
        let proxies = &view.contents().httpproxies;
        let root_namespaces = &view.policy().root_namespaces;

        let mut by_fqdn: BTreeMap<String, Vec<&HTTPProxy>> = BTreeMap::new();
        for proxy in proxies.values() {
            let key = proxy_key(proxy);
            status.touch(&key, "Valid HTTPProxy");
            let Some(vhost) = &proxy.spec.virtualhost else {
                continue;
            };
            if !root_namespaces.is_empty() && !root_namespaces.iter().any(|ns| *ns == key.namespace) {
                status.add_error(
                    &key,
                    "RootNamespaceError",
                    "RootProxyNotAllowedInNamespace",
                    "root HTTPProxy cannot be defined in this namespace",
                );
                continue;
            }
            if let Err(e) = validate_fqdn(&vhost.fqdn) {
                status.add_error(&key, "VirtualHostError", "FQDNNotValid", e);
                continue;
            }
            by_fqdn.entry(vhost.fqdn.to_ascii_lowercase()).or_default().push(proxy);
        }

        let fallback = resolve_fallback(view);
        let mut reached = BTreeSet::new();
        for (fqdn, roots) in &by_fqdn {
            if roots.len() > 1 {
                let names: Vec<String> = roots.iter().map(|p| proxy_key(p).namespaced_name().to_string()).collect();
                for root in roots {
                    status.add_error(
                        &proxy_key(root),
                        "VirtualHostError",
                        "DuplicateVhost",
                        format!("fqdn {:?} is used in multiple HTTPProxies: {}", fqdn, names.join(", ")),
                    );
                }
                continue;
            }
            process_root(dag, view, status, &mut reached, proxies, roots[0], fqdn, fallback.as_ref());
        }

        for (name, proxy) in proxies {
            if !proxy.is_root() && !reached.contains(name) {
                status.set_orphaned(&proxy_key(proxy));
            }
        }
    }
}

fn validate_fqdn(fqdn: &str) -> Result<(), String> {
    if fqdn.is_empty() {
        return Err("Spec.VirtualHost.Fqdn must be specified".to_string());
    }
    let rest = fqdn.strip_prefix("*.").unwrap_or(fqdn);
    if rest.contains('*') || rest.is_empty() {
        return Err(format!("Spec.VirtualHost.Fqdn {:?} is not a valid hostname or wildcard", fqdn));
    }
    if rest.contains(':') {
        return Err(format!("Spec.VirtualHost.Fqdn {:?} must not contain a port", fqdn));
    }
    Ok(())
}

/// Configured fallback certificate, if it resolves to a valid serving secret
fn resolve_fallback(view: &CacheView<'_>) -> Option<super::DagSecret> {
    let reference = view.policy().fallback_certificate.as_ref()?;
    match view.tls_secret(reference, &reference.namespace) {
        Ok(secret) => Some(secret),
        Err(e) => {
            debug!(error = %e, "Fallback certificate unavailable");
            None
        }
    }
}

/// Secure virtual host settings derived from `spec.virtualhost.tls`
struct TlsSettings {
    passthrough: bool,
    secret: Option<super::DagSecret>,
    min_tls_version: Option<TlsVersion>,
    max_tls_version: Option<TlsVersion>,
    client_validation: Option<PeerValidation>,
    fallback: Option<super::DagSecret>,
}

fn tls_version(value: Option<&str>, field: &str) -> Result<Option<TlsVersion>, String> {
    match value.filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => TlsVersion::parse(v).map(Some).ok_or_else(|| format!("{} {:?} is not supported", field, v)),
    }
}

fn tls_settings(
    tls: &httpproxy::TLS,
    key: &ObjectKey,
    view: &CacheView<'_>,
    fallback: Option<&super::DagSecret>,
) -> Result<TlsSettings, (&'static str, &'static str, String)> {
    let namespace = key.namespace.as_str();
    let invalid = |msg: &str| ("TLSError", "TLSConfigNotValid", msg.to_string());

    if tls.passthrough && tls.secret_name.is_some() {
        return Err(invalid("Spec.VirtualHost.TLS: both Passthrough and SecretName were specified"));
    }
    if !tls.passthrough && tls.secret_name.as_deref().unwrap_or_default().is_empty() {
        return Err(invalid("Spec.VirtualHost.TLS: neither Passthrough nor SecretName were specified"));
    }
    if tls.enable_fallback_certificate && tls.client_validation.is_some() {
        return Err((
            "TLSError",
            "TLSIncompatibleFeatures",
            "Spec.Virtualhost.TLS fallback & client validation are incompatible".to_string(),
        ));
    }
    if tls.passthrough && (tls.enable_fallback_certificate || tls.client_validation.is_some()) {
        return Err((
            "TLSError",
            "TLSIncompatibleFeatures",
            "Spec.Virtualhost.TLS passthrough cannot be combined with fallback or client validation".to_string(),
        ));
    }

    let min_tls_version = tls_version(tls.minimum_protocol_version.as_deref(), "minimumProtocolVersion")
        .map_err(|e| invalid(&e))?;
    let max_tls_version = tls_version(tls.maximum_protocol_version.as_deref(), "maximumProtocolVersion")
        .map_err(|e| invalid(&e))?;
    if let (Some(min), Some(max)) = (&min_tls_version, &max_tls_version) {
        if min > max {
            return Err(invalid("minimumProtocolVersion is greater than maximumProtocolVersion"));
        }
    }

    let secret = match tls.secret_name.as_deref().filter(|_| !tls.passthrough) {
        Some(name) => {
            let reference = view.secret_ref(name, namespace);
            Some(view.tls_secret(&reference, namespace).map_err(|e| ("TLSError", e.reason(), e.to_string()))?)
        }
        None => None,
    };

    let client_validation = match &tls.client_validation {
        Some(validation) => {
            let ca_bundle = match validation.ca_secret.as_deref().filter(|s| !s.is_empty()) {
                Some(ca) => {
                    let reference = view.secret_ref(ca, namespace);
                    Some(view.ca_bundle(&reference, namespace).map_err(|e| ("TLSError", e.reason(), e.to_string()))?)
                }
                None if validation.skip_client_cert_validation => None,
                None => {
                    return Err((
                        "TLSError",
                        "ClientValidationInvalid",
                        "Spec.VirtualHost.TLS client validation requires a CA secret".to_string(),
                    ))
                }
            };
            let crl = match validation.crl_secret.as_deref().filter(|s| !s.is_empty()) {
                Some(crl) => {
                    let reference = view.secret_ref(crl, namespace);
                    Some(view.crl(&reference, namespace).map_err(|e| ("TLSError", e.reason(), e.to_string()))?)
                }
                None => None,
            };
            Some(PeerValidation {
                ca_bundle,
                crl,
                skip_client_cert_validation: validation.skip_client_cert_validation,
                only_verify_leaf_cert_crl: validation.only_verify_leaf_cert_crl,
                optional_client_certificate: validation.optional_client_certificate,
            })
        }
        None => None,
    };

    let fallback = if tls.enable_fallback_certificate {
        match fallback {
            Some(secret) => Some(secret.clone()),
            None => {
                return Err((
                    "TLSError",
                    "FallbackNotPresent",
                    "Spec.Virtualhost.TLS enabled the fallback certificate but none is configured".to_string(),
                ))
            }
        }
    } else {
        None
    };

    Ok(TlsSettings {
        passthrough: tls.passthrough,
        secret,
        min_tls_version,
        max_tls_version,
        client_validation,
        fallback,
    })
}

fn authorization(
    auth: &httpproxy::AuthorizationServer,
    key: &ObjectKey,
    dag: &Dag,
) -> Result<ExternalAuthorization, (&'static str, String)> {
    if let Some(version) = auth.extension_ref.api_version.as_deref() {
        if !version.is_empty() && version != EXTENSION_SERVICE_API_VERSION {
            return Err((
                "AuthBadResourceVersion",
                format!("Spec.Virtualhost.Authorization.ServiceAPIVersion {:?} is not supported", version),
            ));
        }
    }
    let namespace = auth.extension_ref.namespace.clone().unwrap_or_else(|| key.namespace.clone());
    let source = NamespacedName::new(namespace, auth.extension_ref.name.clone());
    let cluster = extension_cluster_name(&source);
    if !dag.extension_clusters.contains_key(&cluster) {
        return Err((
            "ExtensionServiceNotFound",
            format!("Spec.Virtualhost.Authorization.ExtensionRef extension service {:?} not found", source.to_string()),
        ));
    }
    let response_timeout = match auth.response_timeout.as_deref() {
        Some(value) => parse_timeout(value).map_err(|e| {
            (
                "AuthResponseTimeoutInvalid",
                format!("Spec.Virtualhost.Authorization.ResponseTimeout is invalid: {}", e),
            )
        })?,
        None => TimeoutSetting::Default,
    };
    Ok(ExternalAuthorization {
        cluster,
        response_timeout,
        fail_open: auth.fail_open,
        with_request_body: auth.with_request_body.as_ref().map(|body| BufferSettings {
            max_request_bytes: body.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
            allow_partial_message: body.allow_partial_message,
            pack_as_bytes: body.pack_as_bytes,
        }),
    })
}

fn rate_limits(
    policy: Option<&httpproxy::RateLimitPolicy>,
) -> Result<(Option<LocalRateLimit>, Option<GlobalRateLimit>), String> {
    let Some(policy) = policy else {
        return Ok((None, None));
    };
    let local = policy.local.as_ref().map(policy::local_rate_limit).transpose()?;
    let global = policy.global.as_ref().map(policy::global_rate_limit).transpose()?;
    Ok((local, global))
}

/// Virtual-host level settings of one root
struct VhostSettings {
    tls: Option<TlsSettings>,
    authorization: Option<ExternalAuthorization>,
    cors: Option<CorsPolicy>,
    local_rate_limit: Option<LocalRateLimit>,
    global_rate_limit: Option<GlobalRateLimit>,
}

fn vhost_settings(
    vhost: &httpproxy::VirtualHost,
    key: &ObjectKey,
    dag: &Dag,
    view: &CacheView<'_>,
    fallback: Option<&super::DagSecret>,
    status: &mut StatusCache,
) -> Option<VhostSettings> {
    let tls = match &vhost.tls {
        Some(tls) => match tls_settings(tls, key, view, fallback) {
            Ok(settings) => Some(settings),
            Err((condition, reason, message)) => {
                status.add_error(key, condition, reason, message);
                return None;
            }
        },
        None => None,
    };

    let authorization = match &vhost.authorization {
        Some(auth) => {
            if tls.as_ref().map_or(true, |t| t.passthrough) {
                status.add_error(
                    key,
                    "AuthError",
                    "AuthNotPermitted",
                    "Spec.Virtualhost.Authorization requires TLS termination",
                );
                return None;
            }
            match authorization(auth, key, dag) {
                Ok(auth) => Some(auth),
                Err((reason, message)) => {
                    status.add_error(key, "AuthError", reason, message);
                    return None;
                }
            }
        }
        None => None,
    };

    let cors = match vhost.cors_policy.as_ref().map(policy::cors_policy).transpose() {
        Ok(cors) => cors,
        Err(e) => {
            status.add_error(key, "CORSError", "PolicyDidNotParse", format!("Spec.VirtualHost.CORSPolicy: {}", e));
            return None;
        }
    };

    let (local_rate_limit, global_rate_limit) = match rate_limits(vhost.rate_limit_policy.as_ref()) {
        Ok(limits) => limits,
        Err(e) => {
            status.add_error(key, "RateLimitError", "PolicyDidNotParse", format!("Spec.VirtualHost.RateLimitPolicy: {}", e));
            return None;
        }
    };

    Some(VhostSettings { tls, authorization, cors, local_rate_limit, global_rate_limit })
}

/// Conditions inherited from the include chain
#[derive(Debug, Clone, Default)]
struct InheritedConditions {
    prefix: String,
    headers: Vec<HeaderCondition>,
    query_params: Vec<QueryCondition>,
}

/// Join an include prefix with a route path.
fn join_prefix(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        return if child.is_empty() { "/".to_string() } else { child.to_string() };
    }
    if child.is_empty() || child == "/" {
        return parent.to_string();
    }
    format!("{}/{}", parent.trim_end_matches('/'), child.trim_start_matches('/'))
}

fn header_condition(c: &HeaderMatchCondition) -> Result<HeaderCondition, String> {
    if c.name.is_empty() {
        return Err("header match condition requires a name".to_string());
    }
    let mut kinds = Vec::new();
    if c.present {
        kinds.push(HeaderMatchKind::Present);
    }
    if c.not_present {
        kinds.push(HeaderMatchKind::NotPresent);
    }
    if let Some(v) = &c.contains {
        kinds.push(HeaderMatchKind::Contains(v.clone()));
    }
    if let Some(v) = &c.not_contains {
        kinds.push(HeaderMatchKind::NotContains(v.clone()));
    }
    if let Some(v) = &c.exact {
        kinds.push(HeaderMatchKind::Exact(v.clone()));
    }
    if let Some(v) = &c.not_exact {
        kinds.push(HeaderMatchKind::NotExact(v.clone()));
    }
    if let Some(v) = &c.regex {
        regex::Regex::new(v).map_err(|e| format!("invalid header regex {:?}: {}", v, e))?;
        kinds.push(HeaderMatchKind::Regex(v.clone()));
    }
    if kinds.len() != 1 {
        return Err(format!("header match condition {:?} must specify exactly one match type", c.name));
    }
    Ok(HeaderCondition {
        name: c.name.to_ascii_lowercase(),
        kind: kinds.remove(0),
        ignore_case: c.ignore_case,
        treat_missing_as_empty: c.treat_missing_as_empty,
    })
}

fn query_condition(c: &QueryParameterMatchCondition) -> Result<QueryCondition, String> {
    if c.name.is_empty() {
        return Err("query parameter match condition requires a name".to_string());
    }
    let mut kinds = Vec::new();
    if let Some(v) = &c.exact {
        kinds.push(QueryMatchKind::Exact(v.clone()));
    }
    if let Some(v) = &c.prefix {
        kinds.push(QueryMatchKind::Prefix(v.clone()));
    }
    if let Some(v) = &c.suffix {
        kinds.push(QueryMatchKind::Suffix(v.clone()));
    }
    if let Some(v) = &c.regex {
        regex::Regex::new(v).map_err(|e| format!("invalid query parameter regex {:?}: {}", v, e))?;
        kinds.push(QueryMatchKind::Regex(v.clone()));
    }
    if let Some(v) = &c.contains {
        kinds.push(QueryMatchKind::Contains(v.clone()));
    }
    if c.present {
        kinds.push(QueryMatchKind::Present);
    }
    if kinds.len() != 1 {
        return Err(format!("query parameter match condition {:?} must specify exactly one match type", c.name));
    }
    Ok(QueryCondition { name: c.name.clone(), kind: kinds.remove(0), ignore_case: c.ignore_case })
}

/// Path part of a list of match conditions
enum PathCondition {
    None,
    Prefix(String),
    Exact(String),
    Regex(String),
}

/// Split conditions into path, header and query parts, enforcing at most one path condition.
fn split_conditions(
    conditions: &[MatchCondition],
) -> Result<(PathCondition, Vec<HeaderCondition>, Vec<QueryCondition>), (&'static str, String)> {
    let mut path = PathCondition::None;
    let mut path_count = 0;
    let mut headers = Vec::new();
    let mut query_params = Vec::new();
    for condition in conditions {
        for (value, make) in [
            (&condition.prefix, PathCondition::Prefix as fn(String) -> PathCondition),
            (&condition.exact, PathCondition::Exact as fn(String) -> PathCondition),
            (&condition.regex, PathCondition::Regex as fn(String) -> PathCondition),
        ] {
            if let Some(value) = value {
                path_count += 1;
                path = make(value.clone());
            }
        }
        if let Some(header) = &condition.header {
            headers.push(header_condition(header).map_err(|e| ("HeaderMatchConditionsNotValid", e))?);
        }
        if let Some(query) = &condition.query_parameter {
            query_params.push(query_condition(query).map_err(|e| ("QueryParameterMatchConditionsNotValid", e))?);
        }
    }
    if path_count > 1 {
        return Err(("PathMatchConditionsNotValid", "route: more than one path condition specified".to_string()));
    }
    match &path {
        PathCondition::Prefix(p) | PathCondition::Exact(p) if !p.starts_with('/') => {
            return Err(("PathMatchConditionsNotValid", format!("path condition {:?} must start with '/'", p)));
        }
        PathCondition::Regex(r) => {
            regex::Regex::new(r).map_err(|e| ("PathMatchConditionsNotValid", format!("invalid regex {:?}: {}", r, e)))?;
        }
        _ => {}
    }
    Ok((path, headers, query_params))
}

/// Two exact matches on one header can never both hold.
fn check_exact_headers(headers: &[HeaderCondition]) -> Result<(), String> {
    let mut exact: BTreeMap<&str, &str> = BTreeMap::new();
    for header in headers {
        if let HeaderMatchKind::Exact(value) = &header.kind {
            if let Some(previous) = exact.insert(&header.name, value) {
                if previous != value {
                    return Err(format!(
                        "cannot specify duplicate header 'exact match' conditions in the same route for {:?}",
                        header.name
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Walks the include graph of one root collecting routes
struct RouteWalker<'v, 'm> {
    view: &'m CacheView<'v>,
    proxies: &'v Proxies,
    dag: &'m mut Dag,
    status: &'m mut StatusCache,
    reached: &'m mut BTreeSet<NamespacedName>,
    vhost_auth: Option<&'v AuthorizationPolicy>,
    authorized: bool,
    cyclic: BTreeSet<ObjectKey>,
    /// Routes with their `permitInsecure` flag
    routes: Vec<(Route, bool)>,
}

impl<'v, 'm> RouteWalker<'v, 'm> {
    fn walk(&mut self, proxy: &'v HTTPProxy, inherited: &InheritedConditions, visited: &mut Vec<ObjectKey>) {
        let key = proxy_key(proxy);

        for include in &proxy.spec.includes {
            let namespace = include.namespace.clone().unwrap_or_else(|| key.namespace.clone());
            let child_name = NamespacedName::new(namespace, include.name.clone());
            let Some(child) = self.proxies.get(&child_name) else {
                self.status.add_error(
                    &key,
                    "IncludeError",
                    "IncludeNotFound",
                    format!("include {} not found", child_name),
                );
                continue;
            };
            let child_key = proxy_key(child);
            if child.is_root() {
                self.status.add_error(
                    &key,
                    "IncludeError",
                    "RootIncludesRoot",
                    format!("root httpproxy cannot include another root httpproxy {}", child_name),
                );
                continue;
            }
            // Every proxy on the path from the root is marked, not only the loop.
            if visited.contains(&child_key) {
                let chain: Vec<String> = visited
                    .iter()
                    .chain(std::iter::once(&child_key))
                    .map(|k| k.namespaced_name().to_string())
                    .collect();
                let message = format!("include creates an include cycle: {}", chain.join(" -> "));
                for member in visited.iter() {
                    self.status.add_error(member, "IncludeError", "IncludeCreatesCycle", message.clone());
                    self.cyclic.insert(member.clone());
                }
                continue;
            }

            let (path, headers, query_params) = match split_conditions(&include.conditions) {
                Ok(parts) => parts,
                Err((reason, message)) => {
                    self.status.add_error(&key, "IncludeError", reason, message);
                    continue;
                }
            };
            let prefix = match path {
                PathCondition::None => String::new(),
                PathCondition::Prefix(p) => p,
                PathCondition::Exact(_) | PathCondition::Regex(_) => {
                    self.status.add_error(
                        &key,
                        "IncludeError",
                        "PathMatchConditionsNotValid",
                        "include conditions may only use prefix path matches",
                    );
                    continue;
                }
            };
            let mut child_inherited = inherited.clone();
            if !prefix.is_empty() {
                child_inherited.prefix = join_prefix(&inherited.prefix, &prefix);
            }
            child_inherited.headers.extend(headers);
            child_inherited.query_params.extend(query_params);

            self.reached.insert(child_name);
            visited.push(child_key);
            self.walk(child, &child_inherited, visited);
            visited.pop();
        }

        // A proxy on an include cycle contributes nothing.
        if self.cyclic.contains(&key) {
            return;
        }

        let mut own = Vec::new();
        for route in &proxy.spec.routes {
            if let Some(built) = self.route(proxy, &key, route, inherited) {
                own.push(built);
            }
        }
        for (i, (route, _)) in own.iter().enumerate() {
            if own[..i].iter().any(|(other, _)| other.conditions == route.conditions) {
                self.status.add_error(
                    &key,
                    "RouteError",
                    "DuplicateMatchConditions",
                    "duplicate conditions defined on routes",
                );
                return;
            }
        }
        self.routes.extend(own);
    }

    fn route(
        &mut self,
        proxy: &'v HTTPProxy,
        key: &ObjectKey,
        route: &'v httpproxy::Route,
        inherited: &InheritedConditions,
    ) -> Option<(Route, bool)> {
        let fail = |status: &mut StatusCache, condition: &str, reason: &str, message: String| {
            status.add_error(key, condition, reason, message);
            None
        };

        let (path, headers, query_params) = match split_conditions(&route.conditions) {
            Ok(parts) => parts,
            Err((reason, message)) => return fail(self.status, "RouteError", reason, message),
        };
        let route_prefix = match &path {
            PathCondition::Prefix(p) => Some(join_prefix(&inherited.prefix, p)),
            PathCondition::None => Some(join_prefix(&inherited.prefix, "")),
            _ => None,
        };
        let path = match path {
            PathCondition::None | PathCondition::Prefix(_) => {
                PathMatch::Prefix(route_prefix.clone().unwrap_or_else(|| "/".to_string()))
            }
            PathCondition::Exact(e) => PathMatch::Exact(join_prefix(&inherited.prefix, &e)),
            PathCondition::Regex(r) => {
                if inherited.prefix.is_empty() {
                    PathMatch::Regex(r)
                } else {
                    PathMatch::Regex(format!("{}{}", regex::escape(inherited.prefix.trim_end_matches('/')), r))
                }
            }
        };
        let mut all_headers = inherited.headers.clone();
        all_headers.extend(headers);
        if let Err(e) = check_exact_headers(&all_headers) {
            return fail(self.status, "RouteError", "HeaderMatchConditionsNotValid", e);
        }
        let mut all_query = inherited.query_params.clone();
        all_query.extend(query_params);
        let conditions = RouteConditions::new(path, all_headers, all_query);

        let timeouts = match policy::route_timeouts(route.timeout_policy.as_ref()) {
            Ok(t) => t,
            Err(e) => return fail(self.status, "RouteError", "TimeoutPolicyNotValid", e),
        };
        let idle_connection = match policy::idle_connection_timeout(route.timeout_policy.as_ref()) {
            Ok(t) => t,
            Err(e) => return fail(self.status, "RouteError", "TimeoutPolicyNotValid", e),
        };
        let retry = match policy::retry_policy(route.retry_policy.as_ref()) {
            Ok(r) => r,
            Err(e) => return fail(self.status, "RouteError", "RetryPolicyNotValid", e),
        };
        let (request_headers, host_rewrite) = match policy::headers_policy(route.request_headers_policy.as_ref(), true) {
            Ok(h) => h,
            Err(e) => return fail(self.status, "RouteError", "RequestHeadersPolicyInvalid", e),
        };
        let (response_headers, _) = match policy::headers_policy(route.response_headers_policy.as_ref(), false) {
            Ok(h) => h,
            Err(e) => return fail(self.status, "RouteError", "ResponseHeadersPolicyInvalid", e),
        };
        let (local_rate_limit, global_rate_limit) = match rate_limits(route.rate_limit_policy.as_ref()) {
            Ok(l) => l,
            Err(e) => return fail(self.status, "RateLimitError", "PolicyDidNotParse", e),
        };
        let path_rewrite = match policy::path_rewrite(route.path_rewrite_policy.as_ref(), route_prefix.as_deref()) {
            Ok(p) => p,
            Err(e) => return fail(self.status, "RouteError", "PathRewritePolicyNotValid", e),
        };
        if route.auth_policy.is_some() && !self.authorized {
            return fail(
                self.status,
                "AuthError",
                "AuthNotPermitted",
                "route authPolicy requires an authorization server on the virtual host".to_string(),
            );
        }

        let forwards = route.services.iter().filter(|s| !s.mirror).count();
        let actions = [forwards > 0, route.request_redirect_policy.is_some(), route.direct_response_policy.is_some()];
        let action_count = actions.iter().filter(|a| **a).count();
        if action_count == 0 {
            return fail(self.status, "RouteError", "NoServicesPresent", "route must have at least one service".to_string());
        }
        if action_count > 1 {
            return fail(
                self.status,
                "RouteError",
                "InvalidAction",
                "route may specify only one of services, requestRedirectPolicy or directResponsePolicy".to_string(),
            );
        }

        let lb_strategy = policy::lb_strategy(route.load_balancer_policy.as_ref());
        let action = if let Some(redirect) = &route.request_redirect_policy {
            match policy::redirect(redirect) {
                Ok(r) => RouteAction::Redirect(r),
                Err(e) => return fail(self.status, "RouteError", "RequestRedirectPolicyNotValid", e),
            }
        } else if let Some(direct) = &route.direct_response_policy {
            match policy::direct_response(direct) {
                Ok((status, body)) => RouteAction::DirectResponse { status, body },
                Err(e) => return fail(self.status, "RouteError", "DirectResponsePolicyNotValid", e),
            }
        } else {
            let explicit_weights = route.services.iter().any(|s| s.weight.is_some());
            let mut clusters = Vec::new();
            for service in route.services.iter().filter(|s| !s.mirror) {
                let options = ClusterOptions {
                    protocol: service.protocol.as_deref(),
                    validation: service.validation.as_ref(),
                    lb_strategy,
                    health_check: policy::health_check(route.health_check_policy.as_ref()),
                    idle_connection_timeout: idle_connection,
                };
                let namespace = namespace_of(&proxy.metadata);
                let cluster =
                    match self.view.service_cluster(namespace, &service.name, &PortRef::Number(service.port), options) {
                        Ok(cluster) => cluster,
                        Err(e) => return fail(self.status, "ServiceError", "ServiceUnresolvedReference", e),
                    };
                let (svc_request, _) = match policy::headers_policy(service.request_headers_policy.as_ref(), false) {
                    Ok(h) => h,
                    Err(e) => return fail(self.status, "RouteError", "RequestHeadersPolicyInvalid", e),
                };
                let (svc_response, _) = match policy::headers_policy(service.response_headers_policy.as_ref(), false)
                {
                    Ok(h) => h,
                    Err(e) => return fail(self.status, "RouteError", "ResponseHeadersPolicyInvalid", e),
                };
                let weight = match (explicit_weights, service.weight) {
                    (false, _) => 1,
                    (true, Some(w)) => u32::try_from(w.max(0)).unwrap_or(u32::MAX),
                    (true, None) => 0,
                };
                clusters.push(WeightedCluster {
                    cluster: self.dag.add_cluster(cluster),
                    weight,
                    request_headers: svc_request,
                    response_headers: svc_response,
                });
            }
            RouteAction::Forward(clusters)
        };

        let mut built = Route::new(key.clone(), conditions, action);
        built.websocket = route.enable_websockets;
        built.timeouts = timeouts;
        built.retry = retry;
        built.path_rewrite = path_rewrite;
        built.host_rewrite = host_rewrite;
        built.request_headers = request_headers;
        built.response_headers = response_headers;
        built.local_rate_limit = local_rate_limit;
        built.global_rate_limit = global_rate_limit;
        built.hash_policies = policy::hash_policies(route.load_balancer_policy.as_ref());
        if self.authorized {
            built.authorization = Some(policy::merge_auth_policy(self.vhost_auth, route.auth_policy.as_ref()));
        }
        Some((built, route.permit_insecure))
    }
}

/// Resolve `spec.tcpproxy` of a root, following a single include.
fn tcp_proxy(
    root: &HTTPProxy,
    key: &ObjectKey,
    proxies: &Proxies,
    dag: &mut Dag,
    view: &CacheView<'_>,
    status: &mut StatusCache,
    reached: &mut BTreeSet<NamespacedName>,
) -> Option<TcpProxy> {
    let mut spec = root.spec.tcpproxy.as_ref()?;
    let mut namespace = key.namespace.clone();
    if let Some(include) = &spec.include {
        if !spec.services.is_empty() {
            status.add_error(
                key,
                "TCPProxyError",
                "NoServicesAndInclude",
                "cannot specify services and include in the same tcpproxy",
            );
            return None;
        }
        let child_namespace = include.namespace.clone().unwrap_or_else(|| namespace.clone());
        let child_name = NamespacedName::new(child_namespace.clone(), include.name.clone());
        let Some(child) = proxies.get(&child_name) else {
            status.add_error(key, "TCPProxyIncludeError", "IncludeNotFound", format!("include {} not found", child_name));
            return None;
        };
        reached.insert(child_name);
        let Some(child_spec) = child.spec.tcpproxy.as_ref() else {
            status.add_error(
                key,
                "TCPProxyIncludeError",
                "NoTCPProxy",
                format!("included httpproxy {} has no tcpproxy", proxy_key(child).namespaced_name()),
            );
            return None;
        };
        spec = child_spec;
        namespace = child_namespace;
    }
    if spec.services.is_empty() {
        status.add_error(key, "TCPProxyError", "NoServicesPresent", "tcpproxy must have at least one service");
        return None;
    }

    let lb_strategy = policy::lb_strategy(spec.load_balancer_policy.as_ref());
    let explicit_weights = spec.services.iter().any(|s| s.weight.is_some());
    let mut clusters = Vec::new();
    for service in &spec.services {
        let options = ClusterOptions {
            protocol: service.protocol.as_deref(),
            validation: service.validation.as_ref(),
            lb_strategy,
            ..Default::default()
        };
        match view.service_cluster(&namespace, &service.name, &PortRef::Number(service.port), options) {
            Ok(cluster) => clusters.push(WeightedCluster {
                cluster: dag.add_cluster(cluster),
                weight: if explicit_weights { service.weight.unwrap_or(0).max(0) as u32 } else { 1 },
                request_headers: Default::default(),
                response_headers: Default::default(),
            }),
            Err(e) => {
                status.add_error(key, "ServiceError", "ServiceUnresolvedReference", e);
                return None;
            }
        }
    }
    Some(TcpProxy { clusters })
}

#[allow(clippy::too_many_arguments)]
fn process_root<'v>(
    dag: &mut Dag,
    view: &CacheView<'v>,
    status: &mut StatusCache,
    reached: &mut BTreeSet<NamespacedName>,
    proxies: &'v Proxies,
    root: &'v HTTPProxy,
    fqdn: &str,
    fallback: Option<&super::DagSecret>,
) {
    let key = proxy_key(root);
    let Some(vhost) = &root.spec.virtualhost else {
        return;
    };
    let Some(settings) = vhost_settings(vhost, &key, dag, view, fallback, status) else {
        return;
    };

    let passthrough = settings.tls.as_ref().is_some_and(|t| t.passthrough);
    let tcp = match &root.spec.tcpproxy {
        Some(_) if settings.tls.is_none() => {
            status.add_error(&key, "TCPProxyError", "TLSMustBeConfigured", "tcpproxy requires tls to be configured");
            return;
        }
        Some(_) => match tcp_proxy(root, &key, proxies, dag, view, status, reached) {
            Some(tcp) => Some(tcp),
            None => return,
        },
        None if passthrough => {
            status.add_error(&key, "TLSError", "TCPProxyRequired", "tls passthrough requires a tcpproxy");
            return;
        }
        None => None,
    };

    let routes = {
        let mut walker = RouteWalker {
            view,
            proxies,
            dag: &mut *dag,
            status: &mut *status,
            reached: &mut *reached,
            vhost_auth: vhost.authorization.as_ref().and_then(|a| a.auth_policy.as_ref()),
            authorized: settings.authorization.is_some(),
            cyclic: BTreeSet::new(),
            routes: Vec::new(),
        };
        let mut visited = vec![key.clone()];
        walker.walk(root, &InheritedConditions::default(), &mut visited);
        if walker.cyclic.contains(&key) {
            Vec::new()
        } else {
            walker.routes
        }
    };
    debug!(proxy = %key, fqdn = fqdn, routes = routes.len(), "Processed root HTTPProxy");

    let permit_insecure_allowed = !view.policy().disable_permit_insecure;
    let secure_termination = settings.tls.as_ref().is_some_and(|t| !t.passthrough);

    if let Some(tls) = settings.tls {
        let secret = tls.secret.map(|s| dag.add_secret(s));
        let fallback_name = tls.fallback.map(|s| dag.add_secret(s));
        if fallback_name.is_some() {
            dag.fallback_certificate = fallback_name.clone();
        }
        let Some(https) = dag.listener_mut(HTTPS_LISTENER_NAME) else {
            return;
        };
        let mut svhost = SecureVirtualHost::new(fqdn);
        svhost.secret = secret;
        svhost.passthrough = tls.passthrough;
        svhost.min_tls_version = tls.min_tls_version;
        svhost.max_tls_version = tls.max_tls_version;
        svhost.fallback_certificate = fallback_name;
        svhost.client_validation = tls.client_validation;
        svhost.authorization = settings.authorization.clone();
        svhost.tcp_proxy = tcp;
        svhost.vhost.cors = settings.cors.clone();
        svhost.vhost.local_rate_limit = settings.local_rate_limit.clone();
        svhost.vhost.global_rate_limit = settings.global_rate_limit.clone();
        https.secure_virtual_hosts.insert(fqdn.to_string(), svhost);
    }

    for (route, permit_insecure) in routes {
        if secure_termination {
            let Some(svhost) = dag.listener_mut(HTTPS_LISTENER_NAME).and_then(|l| l.secure_virtual_hosts.get_mut(fqdn))
            else {
                continue;
            };
            if !svhost.vhost.add_route_reporting(route.clone(), status) {
                continue;
            }
        }
        let insecure = if secure_termination && !(permit_insecure && permit_insecure_allowed) {
            route.to_https_redirect()
        } else {
            let mut plain = route;
            plain.authorization = None;
            plain
        };
        if let Some(http) = dag.listener_mut(HTTP_LISTENER_NAME) {
            let vhost = http.vhost_mut(fqdn);
            vhost.cors = settings.cors.clone();
            vhost.local_rate_limit = settings.local_rate_limit.clone();
            vhost.global_rate_limit = settings.global_rate_limit.clone();
            vhost.add_route_reporting(insecure, status);
        }
    }
}
