//! ExtensionService Custom Resource Definition
//!
//! Describes a gRPC service Envoy calls out to (authorization servers, rate
//! limit services). Each ExtensionService becomes one extension cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::httpproxy::{LoadBalancerPolicy, TimeoutPolicy, UpstreamValidation};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "projectcontour.io",
    version = "v1alpha1",
    kind = "ExtensionService",
    plural = "extensionservices",
    shortname = "extensionservice",
    namespaced,
    derive = "PartialEq"
)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtensionServiceSpec {
    pub services: Vec<ExtensionServiceTarget>,
    /// `h2` (TLS) or `h2c` (cleartext); defaults to `h2`
    pub protocol: Option<String>,
    /// Only `v3` is supported
    pub protocol_version: Option<String>,
    pub validation: Option<UpstreamValidation>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub timeout_policy: Option<TimeoutPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtensionServiceTarget {
    pub name: String,
    pub port: i32,
    pub weight: Option<u32>,
}
