//! # Resource Cache
//!
//! Latest observed state of every Kubernetes object that feeds the DAG.
//!
//! Writers replace the shared [`CacheContents`] copy-on-write, so a rebuild that
//! holds a [`ResourceCache::snapshot`] keeps reading one consistent view while
//! events continue to arrive.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::k8s::annotations::{ingress_class, matches_ingress_class};
use crate::k8s::{
    ExtensionService, Gateway, HTTPProxy, HTTPRoute, Ingress,
    KubernetesResource, NamespacedName, Secret, Service, TLSCertificateDelegation, TLSRoute,
};
use crate::utils::certificates::{CA_CERT_KEY, CRL_KEY};

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Point-in-time contents of the cache, one map per kind
#[derive(Debug, Clone, Default)]
pub struct CacheContents {
    pub services: BTreeMap<NamespacedName, Arc<Service>>,
    pub secrets: BTreeMap<NamespacedName, Arc<Secret>>,
    pub ingresses: BTreeMap<NamespacedName, Arc<Ingress>>,
    pub httpproxies: BTreeMap<NamespacedName, Arc<HTTPProxy>>,
    pub extension_services: BTreeMap<NamespacedName, Arc<ExtensionService>>,
    pub delegations: BTreeMap<NamespacedName, Arc<TLSCertificateDelegation>>,
    pub gateways: BTreeMap<NamespacedName, Arc<Gateway>>,
    pub httproutes: BTreeMap<NamespacedName, Arc<HTTPRoute>>,
    pub tlsroutes: BTreeMap<NamespacedName, Arc<TLSRoute>>,
}

impl CacheContents {
    /// Total number of stored objects
    pub fn len(&self) -> usize {
        self.services.len()
            + self.secrets.len()
            + self.ingresses.len()
            + self.httpproxies.len()
            + self.extension_services.len()
            + self.delegations.len()
            + self.gateways.len()
            + self.httproutes.len()
            + self.tlsroutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache selection settings
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Accepted ingress classes; empty means unclassed objects and the default class
    pub ingress_class_names: Vec<String>,
}

/// Thread-safe store of the latest Kubernetes objects
#[derive(Debug, Default)]
pub struct ResourceCache {
    config: CacheConfig,
    contents: RwLock<Arc<CacheContents>>,
}

/// Insert `value` under `key`, reporting whether the stored state changed.
fn upsert<T: PartialEq>(
    map: &mut BTreeMap<NamespacedName, Arc<T>>,
    key: NamespacedName,
    value: T,
) -> bool {
    match map.get(&key) {
        Some(existing) if **existing == value => false,
        _ => {
            map.insert(key, Arc::new(value));
            true
        }
    }
}

/// Secrets are only interesting when they carry serving certificates or CA material.
fn is_certificate_secret(secret: &Secret) -> bool {
    if secret.type_.as_deref() == Some(TLS_SECRET_TYPE) {
        return true;
    }
    let has = |key: &str| {
        secret.data.as_ref().is_some_and(|d| d.contains_key(key))
            || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
    };
    has(CA_CERT_KEY) || has(CRL_KEY)
}

impl ResourceCache {
    pub fn new(config: CacheConfig) -> Self {
        Self { config, contents: RwLock::new(Arc::new(CacheContents::default())) }
    }

    /// Coherent point-in-time view for one rebuild
    pub fn snapshot(&self) -> Arc<CacheContents> {
        self.contents.read().clone()
    }

    /// Whether the object passes class and content filters
    fn accepts(&self, resource: &KubernetesResource) -> bool {
        match resource {
            KubernetesResource::Ingress(_) | KubernetesResource::HTTPProxy(_) => {
                let class = ingress_class(resource);
                matches_ingress_class(class.as_deref(), &self.config.ingress_class_names)
            }
            KubernetesResource::Secret(secret) => is_certificate_secret(secret),
            KubernetesResource::Endpoints(_) => false,
            _ => true,
        }
    }

    /// Add or update an object. Returns true when a rebuild is warranted.
    pub fn insert(&self, resource: KubernetesResource) -> bool {
        if matches!(resource, KubernetesResource::Endpoints(_)) {
            return false;
        }
        if !self.accepts(&resource) {
            // An object that no longer qualifies must not linger from an earlier add.
            trace!(object = %resource.key(), "Object filtered from cache");
            return self.remove(&resource);
        }

        let object = resource.key();
        let key = object.namespaced_name();
        let mut guard = self.contents.write();
        let contents = Arc::make_mut(&mut *guard);
        let changed = match resource {
            KubernetesResource::Service(o) => upsert(&mut contents.services, key, o),
            KubernetesResource::Secret(o) => upsert(&mut contents.secrets, key, o),
            KubernetesResource::Ingress(o) => upsert(&mut contents.ingresses, key, o),
            KubernetesResource::HTTPProxy(o) => upsert(&mut contents.httpproxies, key, o),
            KubernetesResource::ExtensionService(o) => {
                upsert(&mut contents.extension_services, key, o)
            }
            KubernetesResource::TLSCertificateDelegation(o) => {
                upsert(&mut contents.delegations, key, o)
            }
            KubernetesResource::Gateway(o) => upsert(&mut contents.gateways, key, o),
            KubernetesResource::HTTPRoute(o) => upsert(&mut contents.httproutes, key, o),
            KubernetesResource::TLSRoute(o) => upsert(&mut contents.tlsroutes, key, o),
            KubernetesResource::Endpoints(_) => false,
        };
        if changed {
            debug!(object = %object, "Cache updated");
        }
        changed
    }

    /// Delete an object. Returns true when it was present.
    pub fn remove(&self, resource: &KubernetesResource) -> bool {
        let key = NamespacedName::new(resource.namespace(), resource.name());
        let mut guard = self.contents.write();
        let present = match resource {
            KubernetesResource::Service(_) => guard.services.contains_key(&key),
            KubernetesResource::Secret(_) => guard.secrets.contains_key(&key),
            KubernetesResource::Ingress(_) => guard.ingresses.contains_key(&key),
            KubernetesResource::HTTPProxy(_) => guard.httpproxies.contains_key(&key),
            KubernetesResource::ExtensionService(_) => guard.extension_services.contains_key(&key),
            KubernetesResource::TLSCertificateDelegation(_) => guard.delegations.contains_key(&key),
            KubernetesResource::Gateway(_) => guard.gateways.contains_key(&key),
            KubernetesResource::HTTPRoute(_) => guard.httproutes.contains_key(&key),
            KubernetesResource::TLSRoute(_) => guard.tlsroutes.contains_key(&key),
            KubernetesResource::Endpoints(_) => false,
        };
        if !present {
            return false;
        }

        let contents = Arc::make_mut(&mut *guard);
        match resource {
            KubernetesResource::Service(_) => {
                contents.services.remove(&key);
            }
            KubernetesResource::Secret(_) => {
                contents.secrets.remove(&key);
            }
            KubernetesResource::Ingress(_) => {
                contents.ingresses.remove(&key);
            }
            KubernetesResource::HTTPProxy(_) => {
                contents.httpproxies.remove(&key);
            }
            KubernetesResource::ExtensionService(_) => {
                contents.extension_services.remove(&key);
            }
            KubernetesResource::TLSCertificateDelegation(_) => {
                contents.delegations.remove(&key);
            }
            KubernetesResource::Gateway(_) => {
                contents.gateways.remove(&key);
            }
            KubernetesResource::HTTPRoute(_) => {
                contents.httproutes.remove(&key);
            }
            KubernetesResource::TLSRoute(_) => {
                contents.tlsroutes.remove(&key);
            }
            KubernetesResource::Endpoints(_) => {}
        }
        debug!(object = %resource.key(), "Removed from cache");
        true
    }

    /// Look up a secret by namespace and name
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.contents.read().secrets.get(&NamespacedName::new(namespace, name)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::annotations::CONTOUR_INGRESS_CLASS;
    use crate::k8s::Endpoints;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn meta(name: &str, annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            },
            ..Default::default()
        }
    }

    fn proxy(name: &str, class: Option<&str>) -> KubernetesResource {
        let mut proxy = HTTPProxy::new(name, Default::default());
        proxy.metadata = match class {
            Some(class) => meta(name, &[(CONTOUR_INGRESS_CLASS, class)]),
            None => meta(name, &[]),
        };
        KubernetesResource::HTTPProxy(proxy)
    }

    #[test]
    fn insert_and_remove_service() {
        let cache = ResourceCache::default();
        let service =
            KubernetesResource::Service(Service { metadata: meta("kuard", &[]), ..Default::default() });
        assert!(cache.insert(service.clone()));
        assert!(!cache.insert(service.clone()), "identical update is not a change");
        assert_eq!(cache.snapshot().services.len(), 1);
        assert!(cache.remove(&service));
        assert!(!cache.remove(&service));
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let cache = ResourceCache::default();
        let before = cache.snapshot();
        cache.insert(proxy("a", None));
        assert!(before.httpproxies.is_empty());
        assert_eq!(cache.snapshot().httpproxies.len(), 1);
    }

    #[test]
    fn ingress_class_filtering_default() {
        let cache = ResourceCache::default();
        assert!(cache.insert(proxy("unclassed", None)));
        assert!(cache.insert(proxy("contour", Some("contour"))));
        assert!(!cache.insert(proxy("nginx", Some("nginx"))));
        assert_eq!(cache.snapshot().httpproxies.len(), 2);
    }

    #[test]
    fn ingress_class_filtering_configured() {
        let cache = ResourceCache::new(CacheConfig { ingress_class_names: vec!["internal".into()] });
        assert!(!cache.insert(proxy("unclassed", None)));
        assert!(!cache.insert(proxy("contour", Some("contour"))));
        assert!(cache.insert(proxy("internal", Some("internal"))));

        // Changing the class away removes the stored object.
        assert!(cache.insert(proxy("internal", Some("other"))));
        assert!(cache.snapshot().httpproxies.is_empty());
    }

    #[test]
    fn only_certificate_secrets_are_stored() {
        let cache = ResourceCache::default();
        let opaque = Secret { metadata: meta("opaque", &[]), ..Default::default() };
        assert!(!cache.insert(KubernetesResource::Secret(opaque)));

        let tls = Secret {
            metadata: meta("tls", &[]),
            type_: Some(TLS_SECRET_TYPE.into()),
            ..Default::default()
        };
        assert!(cache.insert(KubernetesResource::Secret(tls)));

        let ca = Secret {
            metadata: meta("ca", &[]),
            data: Some([(CA_CERT_KEY.to_string(), ByteString(b"pem".to_vec()))].into()),
            ..Default::default()
        };
        assert!(cache.insert(KubernetesResource::Secret(ca)));
        assert!(cache.secret("default", "ca").is_some());
        assert_eq!(cache.snapshot().secrets.len(), 2);
    }

    #[test]
    fn endpoints_are_not_stored() {
        let cache = ResourceCache::default();
        let endpoints = Endpoints { metadata: meta("kuard", &[]), ..Default::default() };
        assert!(!cache.insert(KubernetesResource::Endpoints(endpoints)));
        assert!(cache.snapshot().is_empty());
    }
}
