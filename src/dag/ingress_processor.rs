//! `networking.k8s.io/v1` Ingress translation.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{IngressBackend, IngressSpec};
use tracing::debug;

use crate::k8s::annotations::{
    annotation, bool_annotation, list_annotation, ALLOW_HTTP, FORCE_SSL_REDIRECT, NUM_RETRIES,
    PER_TRY_TIMEOUT, RESPONSE_TIMEOUT, RETRY_ON, TLS_MINIMUM_PROTOCOL_VERSION, WEBSOCKET_ROUTES,
};
use crate::k8s::{namespace_of, Ingress, Kind, ObjectKey};
use crate::utils::duration::{parse_timeout, TimeoutSetting};

use super::builder::Processor;
use super::cache_view::{ClusterOptions, PortRef};
use super::policy::retry_from_annotations;
use super::status::StatusCache;
use super::{
    CacheView, Dag, HeadersPolicy, PathMatch, RetryPolicy, Route, RouteAction, RouteConditions,
    TlsVersion, WeightedCluster, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME, WILDCARD_HOST,
};

const REGEX_META: &[char] = &['^', '$', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\'];

pub struct IngressProcessor;

/// Route settings shared by every path of one Ingress
struct IngressSettings {
    force_ssl_redirect: bool,
    allow_http: bool,
    websocket_paths: Vec<String>,
    response_timeout: TimeoutSetting,
    retry: Option<RetryPolicy>,
    min_tls_version: Option<TlsVersion>,
}

impl Processor for IngressProcessor {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn run(&self, dag: &mut Dag, view: &CacheView<'_>, status: &mut StatusCache) {
        for ingress in view.contents().ingresses.values() {
            process_ingress(dag, view, status, ingress);
        }
    }
}

fn settings(ingress: &Ingress, key: &ObjectKey, status: &mut StatusCache) -> IngressSettings {
    let annotations = &ingress.metadata.annotations;

    let response_timeout = match annotation(annotations, RESPONSE_TIMEOUT).map(parse_timeout) {
        Some(Ok(timeout)) => timeout,
        Some(Err(e)) => {
            status.add_error(key, "AnnotationError", "ResponseTimeoutInvalid", format!("{}: {}", RESPONSE_TIMEOUT, e));
            TimeoutSetting::Default
        }
        None => TimeoutSetting::Default,
    };

    let retry = retry_from_annotations(
        annotation(annotations, RETRY_ON),
        annotation(annotations, NUM_RETRIES),
        annotation(annotations, PER_TRY_TIMEOUT),
    )
    .unwrap_or_else(|e| {
        status.add_error(key, "AnnotationError", "RetryPolicyInvalid", e);
        None
    });

    IngressSettings {
        force_ssl_redirect: bool_annotation(annotations, FORCE_SSL_REDIRECT),
        allow_http: annotation(annotations, ALLOW_HTTP).map(str::trim) != Some("false"),
        websocket_paths: list_annotation(annotations, WEBSOCKET_ROUTES),
        response_timeout,
        retry,
        min_tls_version: annotation(annotations, TLS_MINIMUM_PROTOCOL_VERSION).and_then(TlsVersion::parse),
    }
}

/// Map an Ingress path onto a route path match.
fn path_match(path: Option<&str>, path_type: &str) -> PathMatch {
    let path = path.filter(|p| !p.is_empty()).unwrap_or("/");
    match path_type {
        "Exact" => PathMatch::Exact(path.to_string()),
        "Prefix" if path == "/" => PathMatch::Prefix("/".to_string()),
        "Prefix" => PathMatch::Segment(path.trim_end_matches('/').to_string()),
        _ if path.contains(REGEX_META) => PathMatch::Regex(path.to_string()),
        _ => PathMatch::Prefix(path.to_string()),
    }
}

/// Secure hostnames of this Ingress mapped to their DAG secret
fn tls_hosts(
    spec: &IngressSpec,
    namespace: &str,
    key: &ObjectKey,
    dag: &mut Dag,
    view: &CacheView<'_>,
    status: &mut StatusCache,
) -> BTreeMap<String, String> {
    let mut hosts = BTreeMap::new();
    for tls in spec.tls.iter().flatten() {
        let Some(secret_name) = tls.secret_name.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let reference = view.secret_ref(secret_name, namespace);
        match view.tls_secret(&reference, namespace) {
            Ok(secret) => {
                let name = dag.add_secret(secret);
                for host in tls.hosts.iter().flatten() {
                    hosts.entry(host.clone()).or_insert_with(|| name.clone());
                }
            }
            Err(e) => status.add_error(key, "TLSError", e.reason(), e.to_string()),
        }
    }
    hosts
}

fn backend_cluster(
    backend: &IngressBackend,
    namespace: &str,
    key: &ObjectKey,
    dag: &mut Dag,
    view: &CacheView<'_>,
    status: &mut StatusCache,
) -> Option<String> {
    let Some(service) = &backend.service else {
        status.add_error(key, "ServiceError", "UnsupportedBackend", "only Service backends are supported");
        return None;
    };
    let port = match &service.port {
        Some(p) => match (p.number, &p.name) {
            (Some(number), _) => PortRef::Number(number),
            (None, Some(name)) => PortRef::Name(name.clone()),
            (None, None) => PortRef::Number(0),
        },
        None => PortRef::Number(0),
    };
    match view.service_cluster(namespace, &service.name, &port, ClusterOptions::default()) {
        Ok(cluster) => Some(dag.add_cluster(cluster)),
        Err(e) => {
            status.add_error(key, "ServiceError", "ServiceUnresolvedReference", e);
            None
        }
    }
}

fn process_ingress(dag: &mut Dag, view: &CacheView<'_>, status: &mut StatusCache, ingress: &Ingress) {
    let namespace = namespace_of(&ingress.metadata).to_string();
    let key = ObjectKey::new(Kind::Ingress, &namespace, ingress.metadata.name.clone().unwrap_or_default());
    status.touch(&key, "Valid Ingress");
    let Some(spec) = &ingress.spec else {
        return;
    };

    let settings = settings(ingress, &key, status);
    let secure_hosts = tls_hosts(spec, &namespace, &key, dag, view, status);

    // (host, path, backend) triples including the default backend
    let mut paths = Vec::new();
    if let Some(backend) = &spec.default_backend {
        paths.push((WILDCARD_HOST.to_string(), PathMatch::Prefix("/".into()), "/".to_string(), backend));
    }
    for rule in spec.rules.iter().flatten() {
        let host = rule.host.clone().filter(|h| !h.is_empty()).unwrap_or_else(|| WILDCARD_HOST.to_string());
        for path in rule.http.iter().flat_map(|http| http.paths.iter()) {
            let raw = path.path.clone().unwrap_or_else(|| "/".to_string());
            paths.push((host.clone(), path_match(path.path.as_deref(), &path.path_type), raw, &path.backend));
        }
    }

    for (host, matcher, raw_path, backend) in paths {
        let Some(cluster) = backend_cluster(backend, &namespace, &key, dag, view, status) else {
            continue;
        };
        let mut route = Route::new(
            key.clone(),
            RouteConditions::new(matcher, vec![], vec![]),
            RouteAction::Forward(vec![WeightedCluster {
                cluster,
                weight: 1,
                request_headers: HeadersPolicy::default(),
                response_headers: HeadersPolicy::default(),
            }]),
        );
        route.websocket = settings.websocket_paths.iter().any(|p| *p == raw_path);
        route.timeouts.response = settings.response_timeout;
        route.retry = settings.retry.clone();

        let secret = secure_hosts.get(&host);
        if let Some(secret) = secret {
            let Some(https) = dag.listener_mut(HTTPS_LISTENER_NAME) else {
                continue;
            };
            let svhost = https.secure_vhost_mut(&host);
            if svhost.secret.is_none() {
                svhost.secret = Some(secret.clone());
                svhost.min_tls_version = settings.min_tls_version.clone();
            }
            if !svhost.vhost.add_route_reporting(route.clone(), status) {
                continue;
            }
        }

        if !settings.allow_http {
            debug!(ingress = %key, host = %host, "HTTP disabled by annotation");
            continue;
        }
        let insecure = if secret.is_some() && settings.force_ssl_redirect {
            route.to_https_redirect()
        } else {
            route
        };
        if let Some(http) = dag.listener_mut(HTTP_LISTENER_NAME) {
            http.vhost_mut(&host).add_route_reporting(insecure, status);
        }
    }
}
