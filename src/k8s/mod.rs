//! # Kubernetes Resource Model
//!
//! Typed views of every object kind the control plane consumes. Built-in kinds
//! come from `k8s-openapi` and the Gateway API kinds from `gateway-api`; the
//! Contour kinds are declared here as `kube::CustomResource` types.

pub mod annotations;
pub mod delegation;
pub mod extension_service;
pub mod gateway;
pub mod httpproxy;
pub mod manifest;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
pub use k8s_openapi::api::networking::v1::Ingress;

pub use delegation::TLSCertificateDelegation;
pub use extension_service::ExtensionService;
pub use gateway::{Gateway, HTTPRoute, TLSRoute};
pub use httpproxy::HTTPProxy;

/// Object kinds tracked by the resource cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Service,
    Endpoints,
    Secret,
    Ingress,
    HTTPProxy,
    ExtensionService,
    TLSCertificateDelegation,
    Gateway,
    HTTPRoute,
    TLSRoute,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Service => "Service",
            Kind::Endpoints => "Endpoints",
            Kind::Secret => "Secret",
            Kind::Ingress => "Ingress",
            Kind::HTTPProxy => "HTTPProxy",
            Kind::ExtensionService => "ExtensionService",
            Kind::TLSCertificateDelegation => "TLSCertificateDelegation",
            Kind::Gateway => "Gateway",
            Kind::HTTPRoute => "HTTPRoute",
            Kind::TLSRoute => "TLSRoute",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `namespace/name` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for NamespacedName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(format!("expected namespace/name, got {:?}", s)),
        }
    }
}

impl TryFrom<String> for NamespacedName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NamespacedName> for String {
    fn from(value: NamespacedName) -> Self {
        value.to_string()
    }
}

/// Identity of one object in the cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Any object the control plane understands
#[derive(Debug, Clone)]
pub enum KubernetesResource {
    Service(Service),
    Endpoints(Endpoints),
    Secret(Secret),
    Ingress(Ingress),
    HTTPProxy(HTTPProxy),
    ExtensionService(ExtensionService),
    TLSCertificateDelegation(TLSCertificateDelegation),
    Gateway(Gateway),
    HTTPRoute(HTTPRoute),
    TLSRoute(TLSRoute),
}

impl KubernetesResource {
    pub fn kind(&self) -> Kind {
        match self {
            KubernetesResource::Service(_) => Kind::Service,
            KubernetesResource::Endpoints(_) => Kind::Endpoints,
            KubernetesResource::Secret(_) => Kind::Secret,
            KubernetesResource::Ingress(_) => Kind::Ingress,
            KubernetesResource::HTTPProxy(_) => Kind::HTTPProxy,
            KubernetesResource::ExtensionService(_) => Kind::ExtensionService,
            KubernetesResource::TLSCertificateDelegation(_) => Kind::TLSCertificateDelegation,
            KubernetesResource::Gateway(_) => Kind::Gateway,
            KubernetesResource::HTTPRoute(_) => Kind::HTTPRoute,
            KubernetesResource::TLSRoute(_) => Kind::TLSRoute,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KubernetesResource::Service(o) => &o.metadata,
            KubernetesResource::Endpoints(o) => &o.metadata,
            KubernetesResource::Secret(o) => &o.metadata,
            KubernetesResource::Ingress(o) => &o.metadata,
            KubernetesResource::HTTPProxy(o) => &o.metadata,
            KubernetesResource::ExtensionService(o) => &o.metadata,
            KubernetesResource::TLSCertificateDelegation(o) => &o.metadata,
            KubernetesResource::Gateway(o) => &o.metadata,
            KubernetesResource::HTTPRoute(o) => &o.metadata,
            KubernetesResource::TLSRoute(o) => &o.metadata,
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("default")
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace(), self.name())
    }
}

/// Namespace of an object, defaulting like the API server does
pub fn namespace_of(meta: &ObjectMeta) -> &str {
    meta.namespace.as_deref().unwrap_or("default")
}

/// Name of an object
pub fn name_of(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_name_parses() {
        let parsed: NamespacedName = "projectcontour/fallback".parse().unwrap();
        assert_eq!(parsed, NamespacedName::new("projectcontour", "fallback"));
        assert_eq!(parsed.to_string(), "projectcontour/fallback");
        assert!("fallback".parse::<NamespacedName>().is_err());
        assert!("a/b/c".parse::<NamespacedName>().is_err());
        assert!("/b".parse::<NamespacedName>().is_err());
    }

    #[test]
    fn object_key_orders_by_kind_then_namespace() {
        let a = ObjectKey::new(Kind::Service, "b", "x");
        let b = ObjectKey::new(Kind::Ingress, "a", "x");
        let c = ObjectKey::new(Kind::Service, "a", "y");
        let mut keys = vec![b.clone(), a.clone(), c.clone()];
        keys.sort();
        assert_eq!(keys, vec![c, a, b]);
    }

    #[test]
    fn resource_key_defaults_namespace() {
        let service = Service {
            metadata: ObjectMeta { name: Some("kuard".into()), ..Default::default() },
            ..Default::default()
        };
        let resource = KubernetesResource::Service(service);
        assert_eq!(resource.key(), ObjectKey::new(Kind::Service, "default", "kuard"));
        assert_eq!(resource.key().to_string(), "Service default/kuard");
    }
}
