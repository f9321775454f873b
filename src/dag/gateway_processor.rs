//! Gateway API translation for the one configured Gateway.
//!
//! Each Gateway listener maps onto a DAG listener named `http-<port>` or
//! `https-<port>`. HTTPRoutes attach routes to the virtual hosts formed by
//! intersecting route and listener hostnames; TLSRoutes become passthrough
//! TCP proxies keyed on SNI.

use std::collections::BTreeMap;

use tracing::debug;

use crate::k8s::gateway::{
    BackendRef, GatewayListeners, GatewayListenersAllowedRoutesNamespacesFrom, HTTPRouteRulesFilters,
    HTTPRouteRulesFiltersRequestRedirectPath, HTTPRouteRulesFiltersRequestRedirectPathType,
    HTTPRouteRulesFiltersRequestRedirectScheme, HTTPRouteRulesFiltersType, HTTPRouteRulesFiltersUrlRewritePath,
    HTTPRouteRulesFiltersUrlRewritePathType, HTTPRouteRulesMatches, HTTPRouteRulesMatchesHeadersType,
    HTTPRouteRulesMatchesMethod, HTTPRouteRulesMatchesPathType, HTTPRouteRulesMatchesQueryParamsType, ParentRef,
};
use crate::k8s::{namespace_of, name_of, Gateway, HTTPRoute, Kind, NamespacedName, ObjectKey, TLSRoute};

use super::builder::Processor;
use super::cache_view::{ClusterOptions, PortRef};
use super::status::StatusCache;
use super::{
    CacheView, Dag, HeaderCondition, HeaderMatchKind, HeadersPolicy, Listener, ListenerProtocol, PathMatch,
    PathRewrite, QueryCondition, QueryMatchKind, Redirect, Route, RouteAction, RouteConditions, TcpProxy,
    WeightedCluster, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME, WILDCARD_HOST,
};

pub struct GatewayProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerMode {
    Http,
    Terminate,
    Passthrough,
}

/// A Gateway listener that passed validation
#[derive(Debug, Clone)]
struct ResolvedListener {
    name: String,
    port: i32,
    dag_listener: String,
    hostname: Option<String>,
    mode: ListenerMode,
    /// Key into [`Dag::secrets`] for terminating listeners
    secret: Option<String>,
    all_namespaces: bool,
}

impl ResolvedListener {
    fn admits(&self, parent: &dyn ParentRef, route_namespace: &str, gateway_namespace: &str) -> bool {
        let section_ok = parent.section_name().map_or(true, |s| s == self.name);
        let port_ok = parent.port().map_or(true, |p| p == self.port);
        let namespace_ok = self.all_namespaces || route_namespace == gateway_namespace;
        section_ok && port_ok && namespace_ok
    }
}

impl Processor for GatewayProcessor {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn run(&self, dag: &mut Dag, view: &CacheView<'_>, status: &mut StatusCache) {
        let Some(gateway_name) = view.policy().gateway.as_ref() else {
            return;
        };
        let Some(gateway) = view.contents().gateways.get(gateway_name) else {
            debug!(gateway = %gateway_name, "Configured Gateway not present");
            return;
        };
        let gateway_key = ObjectKey::new(Kind::Gateway, &gateway_name.namespace, &gateway_name.name);
        status.touch(&gateway_key, "Valid Gateway");

        let listeners = resolve_listeners(gateway, &gateway_key, dag, view, status);
        status.set_condition(&gateway_key, "Accepted", true, "Accepted", "Gateway is accepted");

        for route in view.contents().httproutes.values() {
            process_http_route(route, gateway_name, &listeners, dag, view, status);
        }
        for route in view.contents().tlsroutes.values() {
            process_tls_route(route, gateway_name, &listeners, dag, view, status);
        }
    }
}

fn resolve_listeners(
    gateway: &Gateway,
    key: &ObjectKey,
    dag: &mut Dag,
    view: &CacheView<'_>,
    status: &mut StatusCache,
) -> Vec<ResolvedListener> {
    let address = dag
        .listeners
        .get(HTTP_LISTENER_NAME)
        .map(|l| l.address.clone())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let reserved: BTreeMap<u16, String> = dag
        .listeners
        .values()
        .filter(|l| l.name == HTTP_LISTENER_NAME || l.name == HTTPS_LISTENER_NAME)
        .map(|l| (l.port, l.name.clone()))
        .collect();
    let mut used: BTreeMap<u16, ListenerProtocol> = BTreeMap::new();
    let mut resolved = Vec::new();

    for listener in &gateway.spec.listeners {
        let Ok(port) = u16::try_from(listener.port) else {
            status.add_warning(
                key,
                "ListenerError",
                "InvalidPort",
                format!("listener {:?} has invalid port {}", listener.name, listener.port),
            );
            continue;
        };
        let (mode, protocol) = match listener.protocol.as_str() {
            "HTTP" => (ListenerMode::Http, ListenerProtocol::Http),
            "HTTPS" => (ListenerMode::Terminate, ListenerProtocol::Https),
            "TLS" => (ListenerMode::Passthrough, ListenerProtocol::Https),
            other => {
                status.add_warning(
                    key,
                    "ListenerError",
                    "UnsupportedProtocol",
                    format!("listener {:?} protocol {:?} is not supported", listener.name, other),
                );
                continue;
            }
        };
        if let Some(owner) = reserved.get(&port) {
            status.add_warning(
                key,
                "ListenerError",
                "PortConflict",
                format!("listener {:?} port {} is already used by {}", listener.name, port, owner),
            );
            continue;
        }
        if let Some(existing) = used.get(&port) {
            if *existing != protocol {
                status.add_warning(
                    key,
                    "ListenerError",
                    "PortConflict",
                    format!("listener {:?} port {} is used with another protocol", listener.name, port),
                );
                continue;
            }
        }

        let secret = match mode {
            ListenerMode::Terminate => match listener_secret(listener, key, view) {
                Ok(secret) => Some(dag.add_secret(secret)),
                Err(message) => {
                    status.add_warning(key, "ListenerError", "InvalidCertificateRef", message);
                    continue;
                }
            },
            _ => None,
        };

        used.insert(port, protocol);
        let dag_listener = match protocol {
            ListenerProtocol::Http => format!("http-{}", port),
            ListenerProtocol::Https => format!("https-{}", port),
        };
        if !dag.listeners.contains_key(&dag_listener) {
            dag.add_listener(Listener::new(dag_listener.clone(), address.clone(), port, protocol));
        }
        resolved.push(ResolvedListener {
            name: listener.name.clone(),
            port: listener.port,
            dag_listener,
            hostname: listener.hostname.clone().filter(|h| !h.is_empty()),
            mode,
            secret,
            all_namespaces: matches!(
                listener
                    .allowed_routes
                    .as_ref()
                    .and_then(|a| a.namespaces.as_ref())
                    .and_then(|n| n.from.as_ref()),
                Some(GatewayListenersAllowedRoutesNamespacesFrom::All)
            ),
        });
    }
    resolved
}

fn listener_secret(
    listener: &GatewayListeners,
    key: &ObjectKey,
    view: &CacheView<'_>,
) -> Result<super::DagSecret, String> {
    let reference = listener
        .tls
        .as_ref()
        .and_then(|tls| tls.certificate_refs.as_deref())
        .and_then(|refs| refs.first())
        .ok_or_else(|| format!("listener {:?} requires a certificateRef", listener.name))?;
    if reference.kind.as_deref().is_some_and(|k| k != "Secret") {
        return Err(format!("listener {:?} certificateRef must be a Secret", listener.name));
    }
    let secret = NamespacedName::new(
        reference.namespace.clone().unwrap_or_else(|| key.namespace.clone()),
        reference.name.clone(),
    );
    view.tls_secret(&secret, &key.namespace).map_err(|e| e.to_string())
}

/// Hostnames a route serves on a listener, or empty when they do not overlap.
fn intersect_hostnames(route_hosts: &[String], listener_host: Option<&str>) -> Vec<String> {
    let Some(listener_host) = listener_host else {
        if route_hosts.is_empty() {
            return vec![WILDCARD_HOST.to_string()];
        }
        return route_hosts.to_vec();
    };
    if route_hosts.is_empty() {
        return vec![listener_host.to_string()];
    }
    let mut hosts: Vec<String> = route_hosts
        .iter()
        .filter_map(|host| {
            if host == listener_host {
                Some(host.clone())
            } else if let Some(suffix) = listener_host.strip_prefix('*') {
                host.ends_with(suffix).then(|| host.clone())
            } else if let Some(suffix) = host.strip_prefix('*') {
                listener_host.ends_with(suffix).then(|| listener_host.to_string())
            } else {
                None
            }
        })
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

/// Listeners of the Gateway a route attaches to, with the reason when none accept it.
fn attach<'l, P: ParentRef>(
    parents: &[P],
    route_namespace: &str,
    gateway: &NamespacedName,
    listeners: &'l [ResolvedListener],
    modes: &[ListenerMode],
) -> Option<Result<Vec<&'l ResolvedListener>, &'static str>> {
    let refs: Vec<&P> = parents
        .iter()
        .filter(|p| p.targets_gateway(route_namespace, &gateway.namespace, &gateway.name))
        .collect();
    if refs.is_empty() {
        return None;
    }
    let mut matched: Vec<&ResolvedListener> = Vec::new();
    let mut named_section_exists = false;
    for parent in &refs {
        for listener in listeners.iter().filter(|l| modes.contains(&l.mode)) {
            if parent.section_name().map_or(true, |s| s == listener.name) {
                named_section_exists = true;
            }
            if listener.admits(*parent, route_namespace, &gateway.namespace)
                && !matched.iter().any(|m| m.name == listener.name)
            {
                matched.push(listener);
            }
        }
    }
    if matched.is_empty() {
        return Some(Err(if named_section_exists { "NotAllowedByListeners" } else { "NoMatchingParent" }));
    }
    Some(Ok(matched))
}

fn header_policy<'a>(
    set: impl IntoIterator<Item = (&'a str, &'a str)>,
    add: impl IntoIterator<Item = (&'a str, &'a str)>,
    remove: &[String],
) -> HeadersPolicy {
    let mut policy = HeadersPolicy::default();
    for (name, value) in set {
        policy.set.insert(name.to_ascii_lowercase(), value.to_string());
    }
    for (name, value) in add {
        policy.add.insert(name.to_ascii_lowercase(), value.to_string());
    }
    policy.remove = remove.iter().map(|h| h.to_ascii_lowercase()).collect();
    policy.remove.sort();
    policy.remove.dedup();
    policy
}

fn path_rewrite(full: Option<&String>, prefix: Option<&String>, replace_full: bool) -> Result<PathRewrite, String> {
    if replace_full {
        full.cloned()
            .map(PathRewrite::FullPath)
            .ok_or_else(|| "ReplaceFullPath requires replaceFullPath".to_string())
    } else {
        prefix
            .cloned()
            .map(PathRewrite::Prefix)
            .ok_or_else(|| "ReplacePrefixMatch requires replacePrefixMatch".to_string())
    }
}

fn redirect_path(path: &HTTPRouteRulesFiltersRequestRedirectPath) -> Result<PathRewrite, String> {
    path_rewrite(
        path.replace_full_path.as_ref(),
        path.replace_prefix_match.as_ref(),
        matches!(path.r#type, HTTPRouteRulesFiltersRequestRedirectPathType::ReplaceFullPath),
    )
}

fn rewrite_path(path: &HTTPRouteRulesFiltersUrlRewritePath) -> Result<PathRewrite, String> {
    path_rewrite(
        path.replace_full_path.as_ref(),
        path.replace_prefix_match.as_ref(),
        matches!(path.r#type, HTTPRouteRulesFiltersUrlRewritePathType::ReplaceFullPath),
    )
}

/// Wire name of a method match, e.g. `GET`
fn method_name(method: &HTTPRouteRulesMatchesMethod) -> Result<String, String> {
    serde_json::to_value(method)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| format!("method {:?} is not supported", method))
}

fn match_conditions(m: &HTTPRouteRulesMatches) -> Result<RouteConditions, String> {
    let path = match &m.path {
        None => PathMatch::default(),
        Some(p) => {
            let value = p.value.clone().unwrap_or_else(|| "/".to_string());
            match p.r#type.as_ref().unwrap_or(&HTTPRouteRulesMatchesPathType::PathPrefix) {
                HTTPRouteRulesMatchesPathType::Exact => PathMatch::Exact(value),
                HTTPRouteRulesMatchesPathType::PathPrefix if value == "/" => PathMatch::Prefix(value),
                HTTPRouteRulesMatchesPathType::PathPrefix => {
                    PathMatch::Segment(value.trim_end_matches('/').to_string())
                }
                HTTPRouteRulesMatchesPathType::RegularExpression => {
                    regex::Regex::new(&value).map_err(|e| format!("invalid path regex {:?}: {}", value, e))?;
                    PathMatch::Regex(value)
                }
            }
        }
    };
    let mut headers = Vec::new();
    for h in m.headers.iter().flatten() {
        let kind = match h.r#type.as_ref().unwrap_or(&HTTPRouteRulesMatchesHeadersType::Exact) {
            HTTPRouteRulesMatchesHeadersType::Exact => HeaderMatchKind::Exact(h.value.clone()),
            HTTPRouteRulesMatchesHeadersType::RegularExpression => {
                regex::Regex::new(&h.value).map_err(|e| format!("invalid header regex {:?}: {}", h.value, e))?;
                HeaderMatchKind::Regex(h.value.clone())
            }
        };
        headers.push(HeaderCondition {
            name: h.name.to_ascii_lowercase(),
            kind,
            ignore_case: false,
            treat_missing_as_empty: false,
        });
    }
    if let Some(method) = &m.method {
        headers.push(HeaderCondition {
            name: ":method".to_string(),
            kind: HeaderMatchKind::Exact(method_name(method)?),
            ignore_case: false,
            treat_missing_as_empty: false,
        });
    }
    let mut query_params = Vec::new();
    for q in m.query_params.iter().flatten() {
        let kind = match q.r#type.as_ref().unwrap_or(&HTTPRouteRulesMatchesQueryParamsType::Exact) {
            HTTPRouteRulesMatchesQueryParamsType::Exact => QueryMatchKind::Exact(q.value.clone()),
            HTTPRouteRulesMatchesQueryParamsType::RegularExpression => QueryMatchKind::Regex(q.value.clone()),
        };
        query_params.push(QueryCondition { name: q.name.clone(), kind, ignore_case: false });
    }
    Ok(RouteConditions::new(path, headers, query_params))
}

/// Resolve weighted Service backends; the error carries a ResolvedRefs reason.
fn backends<'r, B: BackendRef + 'r>(
    refs: impl IntoIterator<Item = &'r B>,
    namespace: &str,
    dag: &mut Dag,
    view: &CacheView<'_>,
) -> Result<Vec<WeightedCluster>, (&'static str, String)> {
    let mut clusters = Vec::new();
    for backend in refs {
        if !backend.is_service() {
            return Err(("InvalidKind", format!("backendRef {:?} is not a Service", backend.name())));
        }
        if backend.namespace().is_some_and(|ns| ns != namespace) {
            return Err(("RefNotPermitted", format!("backendRef {:?} is in another namespace", backend.name())));
        }
        let Some(port) = backend.port() else {
            return Err(("UnsupportedValue", format!("backendRef {:?} must specify a port", backend.name())));
        };
        let cluster = view
            .service_cluster(namespace, backend.name(), &PortRef::Number(port), ClusterOptions::default())
            .map_err(|e| ("BackendNotFound", e))?;
        let weight = u32::try_from(backend.weight().unwrap_or(1)).unwrap_or(0);
        clusters.push(WeightedCluster {
            cluster: dag.add_cluster(cluster),
            weight,
            request_headers: HeadersPolicy::default(),
            response_headers: HeadersPolicy::default(),
        });
    }
    Ok(clusters)
}

/// Apply filters onto a route built for one match.
fn apply_filters(route: &mut Route, filters: &[HTTPRouteRulesFilters]) -> Result<(), String> {
    for filter in filters {
        match &filter.r#type {
            HTTPRouteRulesFiltersType::RequestHeaderModifier => {
                let Some(modifier) = &filter.request_header_modifier else {
                    return Err("RequestHeaderModifier filter requires requestHeaderModifier".to_string());
                };
                route.request_headers = header_policy(
                    modifier.set.iter().flatten().map(|h| (h.name.as_str(), h.value.as_str())),
                    modifier.add.iter().flatten().map(|h| (h.name.as_str(), h.value.as_str())),
                    modifier.remove.as_deref().unwrap_or_default(),
                );
            }
            HTTPRouteRulesFiltersType::ResponseHeaderModifier => {
                let Some(modifier) = &filter.response_header_modifier else {
                    return Err("ResponseHeaderModifier filter requires responseHeaderModifier".to_string());
                };
                route.response_headers = header_policy(
                    modifier.set.iter().flatten().map(|h| (h.name.as_str(), h.value.as_str())),
                    modifier.add.iter().flatten().map(|h| (h.name.as_str(), h.value.as_str())),
                    modifier.remove.as_deref().unwrap_or_default(),
                );
            }
            HTTPRouteRulesFiltersType::RequestRedirect => {
                let Some(redirect) = &filter.request_redirect else {
                    return Err("RequestRedirect filter requires requestRedirect".to_string());
                };
                let scheme = redirect.scheme.as_ref().map(|scheme| match scheme {
                    HTTPRouteRulesFiltersRequestRedirectScheme::Http => "http".to_string(),
                    HTTPRouteRulesFiltersRequestRedirectScheme::Https => "https".to_string(),
                });
                route.action = RouteAction::Redirect(Redirect {
                    scheme,
                    hostname: redirect.hostname.clone(),
                    port: redirect.port.and_then(|p| u32::try_from(p).ok()),
                    path: redirect.path.as_ref().map(redirect_path).transpose()?,
                    status_code: redirect.status_code.and_then(|c| u32::try_from(c).ok()),
                });
            }
            HTTPRouteRulesFiltersType::UrlRewrite => {
                let Some(rewrite) = &filter.url_rewrite else {
                    return Err("URLRewrite filter requires urlRewrite".to_string());
                };
                route.host_rewrite = rewrite.hostname.clone();
                route.path_rewrite = rewrite.path.as_ref().map(rewrite_path).transpose()?;
            }
            other => return Err(format!("filter type {:?} is not supported", other)),
        }
    }
    Ok(())
}

fn process_http_route(
    route: &HTTPRoute,
    gateway: &NamespacedName,
    listeners: &[ResolvedListener],
    dag: &mut Dag,
    view: &CacheView<'_>,
    status: &mut StatusCache,
) {
    let namespace = namespace_of(&route.metadata);
    let key = ObjectKey::new(Kind::HTTPRoute, namespace, name_of(&route.metadata));
    let attached = match attach(
        route.spec.parent_refs.as_deref().unwrap_or_default(),
        namespace,
        gateway,
        listeners,
        &[ListenerMode::Http, ListenerMode::Terminate],
    ) {
        None => return,
        Some(attached) => attached,
    };
    status.touch(&key, "Valid HTTPRoute");
    let attached = match attached {
        Ok(attached) => attached,
        Err(reason) => {
            status.set_condition(&key, "Accepted", false, reason, "no Gateway listener accepts this route");
            return;
        }
    };

    let route_hosts = route.spec.hostnames.as_deref().unwrap_or_default();
    let targets: Vec<(&ResolvedListener, Vec<String>)> = attached
        .into_iter()
        .map(|l| (l, intersect_hostnames(route_hosts, l.hostname.as_deref())))
        .filter(|(_, hosts)| !hosts.is_empty())
        .collect();
    if targets.is_empty() {
        status.set_condition(
            &key,
            "Accepted",
            false,
            "NoMatchingListenerHostname",
            "no listener hostname matches the route hostnames",
        );
        return;
    }

    let mut routes = Vec::new();
    for rule in route.spec.rules.iter().flatten() {
        let backend_refs = rule.backend_refs.as_deref().unwrap_or_default();
        let action = if backend_refs.is_empty() {
            RouteAction::Forward(Vec::new())
        } else {
            match backends(backend_refs, namespace, dag, view) {
                Ok(clusters) => RouteAction::Forward(clusters),
                Err((reason, message)) => {
                    status.set_condition(&key, "ResolvedRefs", false, reason, message);
                    RouteAction::DirectResponse { status: 500, body: None }
                }
            }
        };
        let default_match = [HTTPRouteRulesMatches::default()];
        let matches = match rule.matches.as_deref() {
            Some(matches) if !matches.is_empty() => matches,
            _ => &default_match[..],
        };
        for m in matches {
            let conditions = match match_conditions(m) {
                Ok(c) => c,
                Err(e) => {
                    status.set_condition(&key, "Accepted", false, "UnsupportedValue", e);
                    return;
                }
            };
            let mut built = Route::new(key.clone(), conditions, action.clone());
            if let Err(e) = apply_filters(&mut built, rule.filters.as_deref().unwrap_or_default()) {
                status.set_condition(&key, "Accepted", false, "UnsupportedValue", e);
                return;
            }
            if matches!(&built.action, RouteAction::Forward(c) if c.is_empty()) {
                built.action = RouteAction::DirectResponse { status: 500, body: None };
            }
            routes.push(built);
        }
    }

    for (listener, hosts) in targets {
        let Some(dag_listener) = dag.listener_mut(&listener.dag_listener) else {
            continue;
        };
        for host in hosts {
            for built in &routes {
                let vhost = match listener.mode {
                    ListenerMode::Terminate => {
                        let svhost = dag_listener.secure_vhost_mut(&host);
                        svhost.secret = listener.secret.clone();
                        &mut svhost.vhost
                    }
                    _ => dag_listener.vhost_mut(&host),
                };
                vhost.add_route_reporting(built.clone(), status);
            }
        }
    }
    status.set_condition(&key, "Accepted", true, "Accepted", "route is accepted");
    status.set_condition(&key, "ResolvedRefs", true, "ResolvedRefs", "references are resolved");
}

fn process_tls_route(
    route: &TLSRoute,
    gateway: &NamespacedName,
    listeners: &[ResolvedListener],
    dag: &mut Dag,
    view: &CacheView<'_>,
    status: &mut StatusCache,
) {
    let namespace = namespace_of(&route.metadata);
    let key = ObjectKey::new(Kind::TLSRoute, namespace, name_of(&route.metadata));
    let parents = route.spec.parent_refs.as_deref().unwrap_or_default();
    let attached = match attach(parents, namespace, gateway, listeners, &[ListenerMode::Passthrough]) {
        None => return,
        Some(attached) => attached,
    };
    status.touch(&key, "Valid TLSRoute");
    let attached = match attached {
        Ok(attached) => attached,
        Err(reason) => {
            status.set_condition(&key, "Accepted", false, reason, "no Gateway listener accepts this route");
            return;
        }
    };

    let refs = route.spec.rules.iter().flat_map(|r| r.backend_refs.iter().flatten());
    let clusters = match backends(refs, namespace, dag, view) {
        Ok(clusters) if !clusters.is_empty() => clusters,
        Ok(_) => {
            status.set_condition(&key, "ResolvedRefs", false, "BackendNotFound", "route has no backends");
            return;
        }
        Err((reason, message)) => {
            status.set_condition(&key, "ResolvedRefs", false, reason, message);
            return;
        }
    };

    let mut accepted = false;
    for listener in attached {
        let hosts = intersect_hostnames(
            route.spec.hostnames.as_deref().unwrap_or_default(),
            listener.hostname.as_deref(),
        );
        let Some(dag_listener) = dag.listener_mut(&listener.dag_listener) else {
            continue;
        };
        for host in hosts {
            let svhost = dag_listener.secure_vhost_mut(&host);
            svhost.passthrough = true;
            svhost.tcp_proxy = Some(TcpProxy { clusters: clusters.clone() });
            accepted = true;
        }
    }
    if accepted {
        status.set_condition(&key, "Accepted", true, "Accepted", "route is accepted");
        status.set_condition(&key, "ResolvedRefs", true, "ResolvedRefs", "references are resolved");
    } else {
        status.set_condition(
            &key,
            "Accepted",
            false,
            "NoMatchingListenerHostname",
            "no listener hostname matches the route hostnames",
        );
    }
}
