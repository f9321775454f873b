//! Object constructors shared by the processor unit tests.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::cache::CacheContents;
use crate::k8s::{NamespacedName, Secret, Service};
use crate::utils::certificates::{CA_CERT_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

pub const CERT: &str = include_str!("../../tests/fixtures/server.crt");
pub const KEY: &str = include_str!("../../tests/fixtures/server.key");
pub const CA: &str = include_str!("../../tests/fixtures/ca.crt");

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some(namespace.into()), ..Default::default() }
}

/// Service with named ports `(name, port)`; an empty name leaves the port unnamed
pub fn service(namespace: &str, name: &str, ports: &[(&str, i32)]) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: (!port_name.is_empty()).then(|| port_name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn tls_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        type_: Some("kubernetes.io/tls".into()),
        data: Some(
            [
                (TLS_CERT_KEY.to_string(), ByteString(CERT.as_bytes().to_vec())),
                (TLS_PRIVATE_KEY_KEY.to_string(), ByteString(KEY.as_bytes().to_vec())),
            ]
            .into(),
        ),
        ..Default::default()
    }
}

pub fn ca_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        data: Some([(CA_CERT_KEY.to_string(), ByteString(CA.as_bytes().to_vec()))].into()),
        ..Default::default()
    }
}

pub fn add_service(contents: &mut CacheContents, service: Service) {
    let key = NamespacedName::new(
        service.metadata.namespace.clone().unwrap_or_default(),
        service.metadata.name.clone().unwrap_or_default(),
    );
    contents.services.insert(key, Arc::new(service));
}

pub fn add_secret(contents: &mut CacheContents, secret: Secret) {
    let key = NamespacedName::new(
        secret.metadata.namespace.clone().unwrap_or_default(),
        secret.metadata.name.clone().unwrap_or_default(),
    );
    contents.secrets.insert(key, Arc::new(secret));
}
