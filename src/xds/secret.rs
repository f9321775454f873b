//! Serving certificates for SDS.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, SdsSecretConfig, Secret, TlsCertificate,
};

use crate::dag::{Dag, DagSecret};

use super::resources::ads_config_source;

pub(crate) fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource { specifier: Some(Specifier::InlineBytes(bytes.to_vec())), ..Default::default() }
}

pub(crate) fn inline_string(value: impl Into<String>) -> DataSource {
    DataSource { specifier: Some(Specifier::InlineString(value.into())), ..Default::default() }
}

/// Reference to a secret served over ADS
pub(crate) fn sds_secret_config(name: &str) -> SdsSecretConfig {
    SdsSecretConfig { name: name.to_string(), sds_config: Some(ads_config_source()) }
}

fn build_secret(name: &str, source: &DagSecret) -> Secret {
    Secret {
        name: name.to_string(),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline_bytes(&source.cert_chain)),
            private_key: Some(inline_bytes(&source.private_key)),
            ..Default::default()
        })),
    }
}

/// All TLS secrets referenced by the DAG, keyed by resource name
pub fn secrets(dag: &Dag) -> BTreeMap<String, Secret> {
    dag.secrets.iter().map(|(name, source)| (name.clone(), build_secret(name, source))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::NamespacedName;
    use std::sync::Arc;

    #[test]
    fn secrets_carry_inline_material() {
        let mut dag = Dag::default();
        let name = dag.add_secret(DagSecret {
            source: NamespacedName::new("default", "tls"),
            cert_chain: Arc::new(b"CERT".to_vec()),
            private_key: Arc::new(b"KEY".to_vec()),
        });
        let out = secrets(&dag);
        let secret = &out[&name];
        assert!(name.starts_with("default/tls/"));
        match &secret.r#type {
            Some(secret::Type::TlsCertificate(cert)) => {
                assert_eq!(
                    cert.certificate_chain.as_ref().unwrap().specifier,
                    Some(Specifier::InlineBytes(b"CERT".to_vec()))
                );
            }
            other => panic!("unexpected secret type {:?}", other),
        }
    }
}
