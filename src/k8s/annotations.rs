//! Annotation parsing for Ingress, Service and class selection.

use std::collections::BTreeMap;

use super::{KubernetesResource, Service};

pub const DEFAULT_INGRESS_CLASS: &str = "contour";

pub const CONTOUR_INGRESS_CLASS: &str = "projectcontour.io/ingress.class";
pub const KUBERNETES_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

pub const FORCE_SSL_REDIRECT: &str = "ingress.kubernetes.io/force-ssl-redirect";
pub const ALLOW_HTTP: &str = "kubernetes.io/ingress.allow-http";
pub const WEBSOCKET_ROUTES: &str = "projectcontour.io/websocket-routes";
pub const RESPONSE_TIMEOUT: &str = "projectcontour.io/response-timeout";
pub const NUM_RETRIES: &str = "projectcontour.io/num-retries";
pub const RETRY_ON: &str = "projectcontour.io/retry-on";
pub const PER_TRY_TIMEOUT: &str = "projectcontour.io/per-try-timeout";
pub const TLS_MINIMUM_PROTOCOL_VERSION: &str = "projectcontour.io/tls-minimum-protocol-version";

const UPSTREAM_PROTOCOL_PREFIX: &str = "projectcontour.io/upstream-protocol.";
const MAX_CONNECTIONS: &str = "projectcontour.io/max-connections";
const MAX_PENDING_REQUESTS: &str = "projectcontour.io/max-pending-requests";
const MAX_REQUESTS: &str = "projectcontour.io/max-requests";
const MAX_RETRIES: &str = "projectcontour.io/max-retries";

static EMPTY: BTreeMap<String, String> = BTreeMap::new();

fn annotations(meta_annotations: &Option<BTreeMap<String, String>>) -> &BTreeMap<String, String> {
    meta_annotations.as_ref().unwrap_or(&EMPTY)
}

/// Look up a single annotation value
pub fn annotation<'a>(
    meta_annotations: &'a Option<BTreeMap<String, String>>,
    key: &str,
) -> Option<&'a str> {
    meta_annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

/// The ingress class an object asks for, if any
pub fn ingress_class(resource: &KubernetesResource) -> Option<String> {
    let meta = resource.metadata();
    if let Some(class) = annotation(&meta.annotations, CONTOUR_INGRESS_CLASS) {
        return Some(class.to_string());
    }
    if let Some(class) = annotation(&meta.annotations, KUBERNETES_INGRESS_CLASS) {
        return Some(class.to_string());
    }
    match resource {
        KubernetesResource::Ingress(ingress) => {
            ingress.spec.as_ref().and_then(|spec| spec.ingress_class_name.clone())
        }
        KubernetesResource::HTTPProxy(proxy) => proxy.spec.ingress_class_name.clone(),
        _ => None,
    }
}

/// Class selection: with nothing configured, unclassed objects and the default
/// class match; otherwise only the configured classes do.
pub fn matches_ingress_class(class: Option<&str>, configured: &[String]) -> bool {
    match class {
        None => configured.is_empty(),
        Some(class) if configured.is_empty() => class == DEFAULT_INGRESS_CLASS,
        Some(class) => configured.iter().any(|c| c == class),
    }
}

/// Upstream protocol for a service port, matched by port name or number
pub fn upstream_protocol(service: &Service, port_name: &str, port: i32) -> Option<&'static str> {
    let port_number = port.to_string();
    for (key, value) in annotations(&service.metadata.annotations) {
        let Some(protocol) = key.strip_prefix(UPSTREAM_PROTOCOL_PREFIX) else {
            continue;
        };
        let protocol = match protocol {
            "h2" => "h2",
            "h2c" => "h2c",
            "tls" => "tls",
            _ => continue,
        };
        let listed = value
            .split(',')
            .map(str::trim)
            .any(|entry| (!port_name.is_empty() && entry == port_name) || entry == port_number);
        if listed {
            return Some(protocol);
        }
    }
    None
}

/// Circuit breaker thresholds requested on a Service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitBreakerOverrides {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

pub fn circuit_breaker_overrides(service: &Service) -> CircuitBreakerOverrides {
    let parse = |key: &str| {
        annotation(&service.metadata.annotations, key).and_then(|v| v.trim().parse::<u32>().ok())
    };
    CircuitBreakerOverrides {
        max_connections: parse(MAX_CONNECTIONS),
        max_pending_requests: parse(MAX_PENDING_REQUESTS),
        max_requests: parse(MAX_REQUESTS),
        max_retries: parse(MAX_RETRIES),
    }
}

/// Parse a boolean annotation; anything but `true` is false
pub fn bool_annotation(meta_annotations: &Option<BTreeMap<String, String>>, key: &str) -> bool {
    annotation(meta_annotations, key).map(|v| v.trim() == "true").unwrap_or(false)
}

/// Comma separated list annotation, trimmed, empty entries dropped
pub fn list_annotation(meta_annotations: &Option<BTreeMap<String, String>>, key: &str) -> Vec<String> {
    annotation(meta_annotations, key)
        .map(|v| {
            v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::HTTPProxy;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta_with(annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("obj".into()),
            namespace: Some("default".into()),
            annotations: Some(
                annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn class_matching_without_configuration() {
        assert!(matches_ingress_class(None, &[]));
        assert!(matches_ingress_class(Some("contour"), &[]));
        assert!(!matches_ingress_class(Some("nginx"), &[]));
    }

    #[test]
    fn class_matching_with_configuration() {
        let configured = vec!["internal".to_string()];
        assert!(!matches_ingress_class(None, &configured));
        assert!(!matches_ingress_class(Some("contour"), &configured));
        assert!(matches_ingress_class(Some("internal"), &configured));
    }

    #[test]
    fn class_sources_in_priority_order() {
        let mut proxy = HTTPProxy::new("p", Default::default());
        proxy.metadata = meta_with(&[(KUBERNETES_INGRESS_CLASS, "b"), (CONTOUR_INGRESS_CLASS, "a")]);
        proxy.spec.ingress_class_name = Some("c".into());
        assert_eq!(ingress_class(&KubernetesResource::HTTPProxy(proxy.clone())).as_deref(), Some("a"));

        proxy.metadata = meta_with(&[]);
        assert_eq!(ingress_class(&KubernetesResource::HTTPProxy(proxy)).as_deref(), Some("c"));
    }

    #[test]
    fn upstream_protocol_by_name_or_number() {
        let service = Service {
            metadata: meta_with(&[
                ("projectcontour.io/upstream-protocol.h2c", "grpc, 9000"),
                ("projectcontour.io/upstream-protocol.tls", "https"),
            ]),
            ..Default::default()
        };
        assert_eq!(upstream_protocol(&service, "grpc", 8080), Some("h2c"));
        assert_eq!(upstream_protocol(&service, "", 9000), Some("h2c"));
        assert_eq!(upstream_protocol(&service, "https", 443), Some("tls"));
        assert_eq!(upstream_protocol(&service, "http", 80), None);
    }

    #[test]
    fn circuit_breaker_annotations() {
        let service = Service {
            metadata: meta_with(&[(MAX_CONNECTIONS, "9000"), (MAX_RETRIES, "not-a-number")]),
            ..Default::default()
        };
        let overrides = circuit_breaker_overrides(&service);
        assert_eq!(overrides.max_connections, Some(9000));
        assert_eq!(overrides.max_retries, None);
    }
}
