//! TLSCertificateDelegation Custom Resource Definition
//!
//! Grants other namespaces permission to reference a TLS secret.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "TLSCertificateDelegation",
    plural = "tlscertificatedelegations",
    namespaced,
    derive = "PartialEq"
)]
#[serde(default, rename_all = "camelCase")]
pub struct TLSCertificateDelegationSpec {
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CertificateDelegation {
    pub secret_name: String,
    /// Namespaces allowed to use the secret; `*` allows every namespace
    pub target_namespaces: Vec<String>,
}

impl CertificateDelegation {
    pub fn permits(&self, namespace: &str) -> bool {
        self.target_namespaces.iter().any(|target| target == "*" || target == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_and_named_targets() {
        let delegation = CertificateDelegation {
            secret_name: "wildcard".into(),
            target_namespaces: vec!["teama".into()],
        };
        assert!(delegation.permits("teama"));
        assert!(!delegation.permits("teamb"));

        let everyone =
            CertificateDelegation { secret_name: "wildcard".into(), target_namespaces: vec!["*".into()] };
        assert!(everyone.permits("teamb"));
    }
}
