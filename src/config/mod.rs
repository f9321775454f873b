//! # Configuration Management
//!
//! Layered configuration for the Edgeplane control plane: an optional YAML file
//! followed by `EDGEPLANE__*` environment overrides.

pub mod settings;

pub use settings::{
    AppConfig, ClusterPolicyConfig, CompressionAlgorithm, IngressConfig, ListenerConfig,
    ObservabilityConfig, PolicyConfig, RateLimitServiceConfig, RebuildConfig,
    TimeoutPolicyConfig, XdsConfig,
};
