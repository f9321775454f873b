//! Read-only lookups over one cache snapshot used by every processor.
//!
//! Secret access goes through here so TLSCertificateDelegation rules are
//! applied in exactly one place.

use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheContents;
use crate::config::PolicyConfig;
use crate::k8s::annotations::{circuit_breaker_overrides, upstream_protocol};
use crate::k8s::{httpproxy, name_of, ExtensionService, NamespacedName, Secret, Service};
use crate::utils::certificates::{
    validate_ca_bundle, validate_crl, validate_tls_secret, CA_CERT_KEY, CRL_KEY, TLS_CERT_KEY,
    TLS_PRIVATE_KEY_KEY,
};
use crate::utils::duration::TimeoutSetting;

use super::{
    CircuitBreakers, DagSecret, HealthCheck, LoadBalancerStrategy, ServiceCluster, ServicePortRef,
    UpstreamPolicy, UpstreamProtocol, UpstreamValidation,
};

/// Why a secret reference could not be used
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(NamespacedName),
    #[error("Secret {secret} is not delegated to namespace {namespace}")]
    NotDelegated { secret: NamespacedName, namespace: String },
    #[error("Secret {secret} is invalid: {reason}")]
    Invalid { secret: NamespacedName, reason: String },
}

impl SecretError {
    /// Condition reason reported on the referencing object
    pub fn reason(&self) -> &'static str {
        match self {
            SecretError::NotFound(_) | SecretError::Invalid { .. } => "SecretNotValid",
            SecretError::NotDelegated { .. } => "DelegationNotPermitted",
        }
    }
}

/// Service port selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

/// Upstream settings requested by a route for one backend
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions<'a> {
    /// Explicit protocol; overrides Service annotations
    pub protocol: Option<&'a str>,
    pub validation: Option<&'a httpproxy::UpstreamValidation>,
    pub lb_strategy: LoadBalancerStrategy,
    pub health_check: Option<HealthCheck>,
    pub idle_connection_timeout: TimeoutSetting,
}

pub struct CacheView<'a> {
    contents: &'a CacheContents,
    policy: &'a PolicyConfig,
    client_certificate: Option<DagSecret>,
}

impl<'a> CacheView<'a> {
    pub fn new(contents: &'a CacheContents, policy: &'a PolicyConfig) -> Self {
        let mut view = Self { contents, policy, client_certificate: None };
        if let Some(reference) = &policy.envoy_client_certificate {
            // Configured by the operator, so delegation does not apply.
            match view.tls_secret(reference, &reference.namespace) {
                Ok(secret) => view.client_certificate = Some(secret),
                Err(e) => tracing::warn!(error = %e, "Envoy client certificate unavailable"),
            }
        }
        view
    }

    pub fn contents(&self) -> &'a CacheContents {
        self.contents
    }

    pub fn policy(&self) -> &'a PolicyConfig {
        self.policy
    }

    /// Certificate Envoy presents to TLS upstreams, when configured and valid
    pub fn client_certificate(&self) -> Option<&DagSecret> {
        self.client_certificate.as_ref()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<&'a Service> {
        self.contents.services.get(&NamespacedName::new(namespace, name)).map(|s| s.as_ref())
    }

    pub fn extension_service(&self, key: &NamespacedName) -> Option<&'a ExtensionService> {
        self.contents.extension_services.get(key).map(|s| s.as_ref())
    }

    /// Resolve a Service port by number or name.
    pub fn service_port(&self, namespace: &str, name: &str, port: &PortRef) -> Result<ServicePortRef, String> {
        let service = self
            .service(namespace, name)
            .ok_or_else(|| format!("Service \"{}/{}\" not found", namespace, name))?;
        let ports = service.spec.as_ref().and_then(|s| s.ports.as_ref());
        let found = ports.into_iter().flatten().find(|p| match port {
            PortRef::Number(number) => p.port == *number,
            PortRef::Name(port_name) => p.name.as_deref() == Some(port_name.as_str()),
        });
        match found {
            Some(p) => Ok(ServicePortRef {
                namespace: namespace.to_string(),
                service: name_of(&service.metadata).to_string(),
                port: p.port,
                port_name: p.name.clone().unwrap_or_default(),
            }),
            None => {
                let label = match port {
                    PortRef::Number(n) => n.to_string(),
                    PortRef::Name(n) => n.clone(),
                };
                Err(format!("port \"{}\" on Service \"{}/{}\" not matched", label, namespace, name))
            }
        }
    }

    /// Build the cluster for a backend, resolving protocol and upstream TLS.
    pub fn service_cluster(
        &self,
        namespace: &str,
        name: &str,
        port: &PortRef,
        options: ClusterOptions<'_>,
    ) -> Result<ServiceCluster, String> {
        let port_ref = self.service_port(namespace, name, port)?;
        let service = self
            .service(namespace, name)
            .ok_or_else(|| format!("Service \"{}/{}\" not found", namespace, name))?;

        let protocol = match options.protocol {
            Some(explicit) => UpstreamProtocol::parse(explicit)
                .ok_or_else(|| format!("unsupported protocol {:?}", explicit))?,
            None => upstream_protocol(service, &port_ref.port_name, port_ref.port)
                .and_then(UpstreamProtocol::parse)
                .unwrap_or_default(),
        };

        let validation = match options.validation {
            Some(validation) => {
                if !protocol.uses_tls() {
                    return Err(format!(
                        "upstream validation requires a TLS protocol, Service \"{}/{}\" uses {}",
                        namespace,
                        name,
                        protocol.as_str()
                    ));
                }
                let ca_secret = self.secret_ref(&validation.ca_secret, namespace);
                let ca_bundle = self.ca_bundle(&ca_secret, namespace).map_err(|e| e.to_string())?;
                Some(UpstreamValidation { ca_secret, ca_bundle, subject_name: validation.subject_name.clone() })
            }
            None => None,
        };

        let defaults = &self.policy.cluster;
        let overrides = circuit_breaker_overrides(service);
        let circuit_breakers = CircuitBreakers {
            max_connections: overrides.max_connections.or(defaults.max_connections),
            max_pending_requests: overrides.max_pending_requests.or(defaults.max_pending_requests),
            max_requests: overrides.max_requests.or(defaults.max_requests),
            max_retries: overrides.max_retries.or(defaults.max_retries),
        };

        let client_certificate = if protocol.uses_tls() {
            self.client_certificate.as_ref().map(DagSecret::name)
        } else {
            None
        };

        Ok(ServiceCluster {
            namespace: port_ref.namespace,
            service: port_ref.service,
            port: port_ref.port,
            port_name: port_ref.port_name,
            policy: UpstreamPolicy {
                protocol,
                lb_strategy: options.lb_strategy,
                sni: validation.as_ref().map(|v| v.subject_name.clone()),
                validation,
                health_check: options.health_check,
                circuit_breakers,
                connect_timeout: defaults.connect_timeout(),
                idle_connection_timeout: options.idle_connection_timeout,
                client_certificate,
            },
        })
    }

    /// `name` refers to the owner's namespace; `namespace/name` to another one.
    pub fn secret_ref(&self, reference: &str, owner_namespace: &str) -> NamespacedName {
        reference
            .parse::<NamespacedName>()
            .unwrap_or_else(|_| NamespacedName::new(owner_namespace, reference))
    }

    /// Whether `namespace` may use `secret`
    pub fn delegation_permitted(&self, secret: &NamespacedName, namespace: &str) -> bool {
        if secret.namespace == namespace {
            return true;
        }
        self.contents
            .delegations
            .iter()
            .filter(|(key, _)| key.namespace == secret.namespace)
            .flat_map(|(_, delegation)| delegation.spec.delegations.iter())
            .any(|d| d.secret_name == secret.name && d.permits(namespace))
    }

    fn lookup_secret(&self, secret: &NamespacedName, namespace: &str) -> Result<&'a Secret, SecretError> {
        let found = self
            .contents
            .secrets
            .get(secret)
            .ok_or_else(|| SecretError::NotFound(secret.clone()))?;
        if !self.delegation_permitted(secret, namespace) {
            return Err(SecretError::NotDelegated {
                secret: secret.clone(),
                namespace: namespace.to_string(),
            });
        }
        Ok(found.as_ref())
    }

    /// Falls back to `stringData`, which only appears in manifests read from disk
    fn data<'s>(secret: &'s Secret, key: &str) -> Option<&'s [u8]> {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.as_slice())
            .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).map(|s| s.as_bytes()))
    }

    /// Serving certificate and key for `namespace`
    pub fn tls_secret(&self, secret: &NamespacedName, namespace: &str) -> Result<DagSecret, SecretError> {
        let found = self.lookup_secret(secret, namespace)?;
        let cert = Self::data(found, TLS_CERT_KEY);
        let key = Self::data(found, TLS_PRIVATE_KEY_KEY);
        validate_tls_secret(cert, key).map_err(|e| SecretError::Invalid {
            secret: secret.clone(),
            reason: e.to_string(),
        })?;
        Ok(DagSecret {
            source: secret.clone(),
            cert_chain: Arc::new(cert.unwrap_or_default().to_vec()),
            private_key: Arc::new(key.unwrap_or_default().to_vec()),
        })
    }

    pub fn ca_bundle(&self, secret: &NamespacedName, namespace: &str) -> Result<Arc<Vec<u8>>, SecretError> {
        let found = self.lookup_secret(secret, namespace)?;
        let data = Self::data(found, CA_CERT_KEY);
        validate_ca_bundle(data).map_err(|e| SecretError::Invalid { secret: secret.clone(), reason: e.to_string() })?;
        Ok(Arc::new(data.unwrap_or_default().to_vec()))
    }

    pub fn crl(&self, secret: &NamespacedName, namespace: &str) -> Result<Arc<Vec<u8>>, SecretError> {
        let found = self.lookup_secret(secret, namespace)?;
        let data = Self::data(found, CRL_KEY);
        validate_crl(data).map_err(|e| SecretError::Invalid { secret: secret.clone(), reason: e.to_string() })?;
        Ok(Arc::new(data.unwrap_or_default().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::delegation::{CertificateDelegation, TLSCertificateDelegationSpec};
    use crate::k8s::TLSCertificateDelegation;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    const CERT: &str = include_str!("../../tests/fixtures/server.crt");
    const KEY: &str = include_str!("../../tests/fixtures/server.key");

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta { name: Some(name.into()), namespace: Some(namespace.into()), ..Default::default() }
    }

    fn contents() -> CacheContents {
        let mut contents = CacheContents::default();
        let service = Service {
            metadata: meta("default", "kuard"),
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort { name: Some("http".into()), port: 80, ..Default::default() },
                    ServicePort { port: 9000, ..Default::default() },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        contents.services.insert(NamespacedName::new("default", "kuard"), Arc::new(service));

        let secret = Secret {
            metadata: meta("certs", "wildcard"),
            type_: Some("kubernetes.io/tls".into()),
            data: Some(
                [
                    (TLS_CERT_KEY.to_string(), ByteString(CERT.as_bytes().to_vec())),
                    (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(KEY.as_bytes().to_vec())),
                ]
                .into(),
            ),
            ..Default::default()
        };
        contents.secrets.insert(NamespacedName::new("certs", "wildcard"), Arc::new(secret));

        let mut delegation = TLSCertificateDelegation::new(
            "delegation",
            TLSCertificateDelegationSpec {
                delegations: vec![CertificateDelegation {
                    secret_name: "wildcard".into(),
                    target_namespaces: vec!["teama".into()],
                }],
            },
        );
        delegation.metadata = meta("certs", "delegation");
        contents.delegations.insert(NamespacedName::new("certs", "delegation"), Arc::new(delegation));
        contents
    }

    #[test]
    fn resolves_ports_by_name_and_number() {
        let contents = contents();
        let policy = PolicyConfig::default();
        let view = CacheView::new(&contents, &policy);

        let named = view.service_port("default", "kuard", &PortRef::Name("http".into())).unwrap();
        assert_eq!(named.port, 80);
        let unnamed = view.service_port("default", "kuard", &PortRef::Number(9000)).unwrap();
        assert_eq!(unnamed.eds_name(), "default/kuard");
        assert!(view.service_port("default", "kuard", &PortRef::Number(81)).is_err());
        assert!(view.service_port("default", "missing", &PortRef::Number(80)).is_err());
    }

    #[test]
    fn delegation_controls_secret_access() {
        let contents = contents();
        let policy = PolicyConfig::default();
        let view = CacheView::new(&contents, &policy);
        let secret = view.secret_ref("certs/wildcard", "teama");

        let delegated = view.tls_secret(&secret, "teama").unwrap();
        assert!(delegated.name().starts_with("certs/wildcard/"));

        let denied = view.tls_secret(&secret, "teamb").unwrap_err();
        assert_eq!(denied.reason(), "DelegationNotPermitted");

        let missing = view.tls_secret(&view.secret_ref("nope", "teama"), "teama").unwrap_err();
        assert_eq!(missing, SecretError::NotFound(NamespacedName::new("teama", "nope")));
    }

    #[test]
    fn validation_requires_tls_protocol() {
        let contents = contents();
        let policy = PolicyConfig::default();
        let view = CacheView::new(&contents, &policy);
        let validation = httpproxy::UpstreamValidation { ca_secret: "ca".into(), subject_name: "kuard".into() };
        let options = ClusterOptions { validation: Some(&validation), ..Default::default() };
        let err = view.service_cluster("default", "kuard", &PortRef::Number(80), options).unwrap_err();
        assert!(err.contains("requires a TLS protocol"));

        let cluster = view
            .service_cluster("default", "kuard", &PortRef::Number(80), ClusterOptions::default())
            .unwrap();
        assert_eq!(cluster.policy.protocol, UpstreamProtocol::Http1);
        assert_eq!(cluster.eds_name(), "default/kuard/http");
    }
}
