//! ExtensionService objects become extension clusters.

use tracing::warn;

use crate::k8s::{namespace_of, ExtensionService, Kind, NamespacedName, ObjectKey};

use super::builder::Processor;
use super::cache_view::PortRef;
use super::policy::{idle_connection_timeout, lb_strategy, route_timeouts};
use super::status::StatusCache;
use super::{
    extension_cluster_name, CacheView, CircuitBreakers, Dag, ExtensionCluster, RateLimitService,
    UpstreamPolicy, UpstreamProtocol, UpstreamValidation,
};

pub struct ExtensionServiceProcessor;

impl Processor for ExtensionServiceProcessor {
    fn name(&self) -> &'static str {
        "extensionservice"
    }

    fn run(&self, dag: &mut Dag, view: &CacheView<'_>, status: &mut StatusCache) {
        for extension in view.contents().extension_services.values() {
            if let Some(cluster) = extension_cluster(extension, view, status) {
                dag.extension_clusters.insert(cluster.name(), cluster);
            }
        }
        dag.rate_limit_service = rate_limit_service(dag, view);
    }
}

fn extension_cluster(
    extension: &ExtensionService,
    view: &CacheView<'_>,
    status: &mut StatusCache,
) -> Option<ExtensionCluster> {
    let namespace = namespace_of(&extension.metadata).to_string();
    let name = extension.metadata.name.clone().unwrap_or_default();
    let key = ObjectKey::new(Kind::ExtensionService, &namespace, &name);
    status.touch(&key, "Valid ExtensionService");
    let spec = &extension.spec;

    if let Some(version) = spec.protocol_version.as_deref() {
        if version != "v3" {
            status.add_error(
                &key,
                "SpecError",
                "UnsupportedProtocolVersion",
                format!("unsupported protocol version {:?}", version),
            );
            return None;
        }
    }

    let protocol = match spec.protocol.as_deref().unwrap_or("h2") {
        "h2" => UpstreamProtocol::H2,
        "h2c" => UpstreamProtocol::H2c,
        other => {
            status.add_error(&key, "SpecError", "UnsupportedProtocol", format!("unsupported protocol {:?}", other));
            return None;
        }
    };

    let validation = match &spec.validation {
        Some(_) if protocol == UpstreamProtocol::H2c => {
            status.add_error(
                &key,
                "SpecError",
                "InconsistentProtocol",
                "upstream TLS validation is not supported with protocol h2c",
            );
            return None;
        }
        Some(validation) => {
            let ca_secret = view.secret_ref(&validation.ca_secret, &namespace);
            match view.ca_bundle(&ca_secret, &namespace) {
                Ok(ca_bundle) => Some(UpstreamValidation {
                    ca_secret,
                    ca_bundle,
                    subject_name: validation.subject_name.clone(),
                }),
                Err(e) => {
                    status.add_error(&key, "TLSError", e.reason(), e.to_string());
                    return None;
                }
            }
        }
        None => None,
    };

    let timeouts = match route_timeouts(spec.timeout_policy.as_ref())
        .and_then(|t| idle_connection_timeout(spec.timeout_policy.as_ref()).map(|idle| (t, idle)))
    {
        Ok(timeouts) => timeouts,
        Err(e) => {
            status.add_error(&key, "SpecError", "TimeoutPolicyNotValid", e);
            return None;
        }
    };

    if spec.services.is_empty() {
        status.add_error(&key, "ServiceError", "NoServicesPresent", "at least one service is required");
        return None;
    }
    let mut targets = Vec::with_capacity(spec.services.len());
    for target in &spec.services {
        match view.service_port(&namespace, &target.name, &PortRef::Number(target.port)) {
            Ok(port) => targets.push(port),
            Err(e) => {
                status.add_error(&key, "ServiceError", "ServiceUnresolvedReference", e);
                return None;
            }
        }
    }
    targets.sort();

    let client_certificate = view.client_certificate().map(|secret| secret.name()).filter(|_| protocol.uses_tls());

    Some(ExtensionCluster {
        source: NamespacedName::new(namespace, name),
        targets,
        policy: UpstreamPolicy {
            protocol,
            lb_strategy: lb_strategy(spec.load_balancer_policy.as_ref()),
            sni: validation.as_ref().map(|v| v.subject_name.clone()),
            validation,
            health_check: None,
            circuit_breakers: CircuitBreakers::default(),
            connect_timeout: view.policy().cluster.connect_timeout(),
            idle_connection_timeout: timeouts.1,
            client_certificate,
        },
        response_timeout: timeouts.0.response,
    })
}

/// Resolve the configured global rate limit service against the built extension clusters.
fn rate_limit_service(dag: &Dag, view: &CacheView<'_>) -> Option<RateLimitService> {
    let config = view.policy().rate_limit_service.as_ref()?;
    let cluster = extension_cluster_name(&config.extension_service);
    if !dag.extension_clusters.contains_key(&cluster) {
        warn!(
            extension_service = %config.extension_service,
            "Rate limit service references a missing or invalid ExtensionService"
        );
        return None;
    }
    Some(RateLimitService {
        cluster,
        domain: config.domain.clone(),
        fail_open: config.fail_open,
        enable_x_ratelimit_headers: config.enable_x_ratelimit_headers,
        enable_resource_exhausted_code: config.enable_resource_exhausted_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheContents;
    use crate::config::{PolicyConfig, RateLimitServiceConfig};
    use crate::dag::test_helpers::{add_service, meta, service};
    use crate::k8s::extension_service::{ExtensionServiceSpec, ExtensionServiceTarget};
    use crate::k8s::httpproxy::UpstreamValidation as CrdValidation;
    use std::sync::Arc;

    fn extension(spec: ExtensionServiceSpec) -> ExtensionService {
        let mut extension = ExtensionService::new("ratelimit", spec);
        extension.metadata = meta("projectcontour", "ratelimit");
        extension
    }

    fn run(contents: &CacheContents, policy: &PolicyConfig) -> (Dag, StatusCache) {
        let view = CacheView::new(contents, policy);
        let mut dag = Dag::default();
        let mut status = StatusCache::new();
        ExtensionServiceProcessor.run(&mut dag, &view, &mut status);
        (dag, status)
    }

    fn contents_with(spec: ExtensionServiceSpec) -> CacheContents {
        let mut contents = CacheContents::default();
        add_service(&mut contents, service("projectcontour", "ratelimit", &[("grpc", 8081)]));
        contents
            .extension_services
            .insert(NamespacedName::new("projectcontour", "ratelimit"), Arc::new(extension(spec)));
        contents
    }

    fn target() -> Vec<ExtensionServiceTarget> {
        vec![ExtensionServiceTarget { name: "ratelimit".into(), port: 8081, weight: None }]
    }

    #[test]
    fn builds_cluster_and_rate_limit_service() {
        let contents = contents_with(ExtensionServiceSpec {
            services: target(),
            protocol: Some("h2c".into()),
            ..Default::default()
        });
        let policy = PolicyConfig {
            rate_limit_service: Some(RateLimitServiceConfig {
                extension_service: NamespacedName::new("projectcontour", "ratelimit"),
                domain: "contour".into(),
                fail_open: true,
                enable_x_ratelimit_headers: false,
                enable_resource_exhausted_code: false,
            }),
            ..Default::default()
        };
        let (dag, status) = run(&contents, &policy);
        let cluster = &dag.extension_clusters["extension/projectcontour/ratelimit"];
        assert_eq!(cluster.policy.protocol, UpstreamProtocol::H2c);
        assert_eq!(cluster.targets[0].eds_name(), "projectcontour/ratelimit/grpc");
        assert_eq!(dag.rate_limit_service.as_ref().unwrap().cluster, "extension/projectcontour/ratelimit");
        assert!(status.finish().values().all(|s| s.is_valid()));
    }

    #[test]
    fn h2c_with_validation_is_inconsistent() {
        let contents = contents_with(ExtensionServiceSpec {
            services: target(),
            protocol: Some("h2c".into()),
            validation: Some(CrdValidation { ca_secret: "ca".into(), subject_name: "rl".into() }),
            ..Default::default()
        });
        let (dag, status) = run(&contents, &PolicyConfig::default());
        assert!(dag.extension_clusters.is_empty());
        let statuses = status.finish();
        let key = ObjectKey::new(Kind::ExtensionService, "projectcontour", "ratelimit");
        assert!(statuses[&key].has_error("SpecError", "InconsistentProtocol"));
    }

    #[test]
    fn missing_service_emits_no_cluster() {
        let contents = contents_with(ExtensionServiceSpec {
            services: vec![ExtensionServiceTarget { name: "other".into(), port: 1, weight: None }],
            ..Default::default()
        });
        let (dag, _) = run(&contents, &PolicyConfig::default());
        assert!(dag.extension_clusters.is_empty());
        assert!(dag.rate_limit_service.is_none());
    }
}
