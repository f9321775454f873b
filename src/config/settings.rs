//! # Configuration Settings
//!
//! Defines the configuration structure for the Edgeplane control plane.

use crate::errors::{EdgeplaneError, Result};
use crate::k8s::NamespacedName;
use crate::utils::duration::{parse_duration, parse_timeout, TimeoutSetting};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Prefix for environment overrides, e.g. `EDGEPLANE__XDS__PORT=9000`
pub const ENV_PREFIX: &str = "EDGEPLANE";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Envoy listener addresses and ports
    #[validate(nested)]
    pub listeners: ListenerConfig,

    /// Ingress class selection
    #[validate(nested)]
    pub ingress: IngressConfig,

    /// Rebuild hold-off timing
    #[validate(nested)]
    pub rebuild: RebuildConfig,

    /// Translation policy defaults
    #[validate(nested)]
    pub policy: PolicyConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from an optional YAML file followed by `EDGEPLANE__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ingress.class_names")
                .with_list_parse_key("policy.root_namespaces"),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(EdgeplaneError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Cross-field checks the derive cannot express
    fn validate_custom(&self) -> Result<()> {
        let ports = [
            ("xds.port", self.xds.port),
            ("listeners.http_port", self.listeners.http_port),
            ("listeners.https_port", self.listeners.https_port),
        ];
        for (i, (name_a, port_a)) in ports.iter().enumerate() {
            for (name_b, port_b) in ports.iter().skip(i + 1) {
                if port_a == port_b {
                    return Err(EdgeplaneError::validation_field(
                        format!("{} and {} cannot share port {}", name_a, name_b, port_a),
                        *name_b,
                    ));
                }
            }
        }
        if self.observability.enable_metrics
            && ports.iter().any(|(_, port)| *port == self.observability.metrics_port)
        {
            return Err(EdgeplaneError::validation_field(
                "Metrics port clashes with another configured port",
                "observability.metrics_port",
            ));
        }

        if self.rebuild.holdoff_max_delay_ms < self.rebuild.holdoff_delay_ms {
            return Err(EdgeplaneError::validation_field(
                "Maximum hold-off must be at least the hold-off delay",
                "rebuild.holdoff_max_delay_ms",
            ));
        }

        let timeouts = &self.policy.timeouts;
        for (field, value) in [
            ("policy.timeouts.request_timeout", &timeouts.request_timeout),
            ("policy.timeouts.connection_idle_timeout", &timeouts.connection_idle_timeout),
            ("policy.timeouts.stream_idle_timeout", &timeouts.stream_idle_timeout),
        ] {
            if let Some(value) = value {
                parse_timeout(value).map_err(|e| EdgeplaneError::validation_field(e, field))?;
            }
        }
        parse_duration(&self.policy.cluster.connect_timeout).map_err(|e| {
            EdgeplaneError::validation_field(e, "policy.cluster.connect_timeout")
        })?;

        Ok(())
    }
}

/// xDS server configuration for Envoy communication
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct XdsConfig {
    /// xDS server bind address
    #[validate(length(min = 1, message = "xDS bind address cannot be empty"))]
    pub bind_address: String,

    /// xDS server port
    #[validate(range(min = 1, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 8001 }
    }
}

impl XdsConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Addresses Envoy binds its ingress listeners on
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ListenerConfig {
    #[validate(length(min = 1, message = "Listener address cannot be empty"))]
    pub address: String,

    #[validate(range(min = 1, message = "HTTP port must be between 1 and 65535"))]
    pub http_port: u16,

    #[validate(range(min = 1, message = "HTTPS port must be between 1 and 65535"))]
    pub https_port: u16,

    /// Port used in HTTP to HTTPS redirects when Envoy is reached on a non-default port
    pub https_redirect_port: Option<u16>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_port: 8443,
            https_redirect_port: None,
        }
    }
}

/// Ingress class selection
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct IngressConfig {
    /// Accepted class names. Empty means unannotated objects and the default class.
    pub class_names: Vec<String>,
}

/// Debounce timing for DAG rebuilds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RebuildConfig {
    /// Quiet period after the latest mutation before a rebuild runs
    #[validate(range(max = 60000, message = "Hold-off delay must be at most 60s"))]
    pub holdoff_delay_ms: u64,

    /// Upper bound on how long the first pending mutation can wait
    #[validate(range(max = 300000, message = "Maximum hold-off must be at most 300s"))]
    pub holdoff_max_delay_ms: u64,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self { holdoff_delay_ms: 100, holdoff_max_delay_ms: 500 }
    }
}

impl RebuildConfig {
    pub fn holdoff_delay(&self) -> Duration {
        Duration::from_millis(self.holdoff_delay_ms)
    }

    pub fn holdoff_max_delay(&self) -> Duration {
        Duration::from_millis(self.holdoff_max_delay_ms)
    }
}

/// Compression applied by the HTTP connection manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Brotli,
    Zstd,
    Disabled,
}

/// Defaults and cluster-wide policy applied during translation
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Namespaces allowed to hold root HTTPProxies; empty allows all
    pub root_namespaces: Vec<String>,

    /// Certificate served to clients that send no SNI
    pub fallback_certificate: Option<NamespacedName>,

    /// Client certificate Envoy presents to TLS upstreams
    pub envoy_client_certificate: Option<NamespacedName>,

    #[validate(nested)]
    pub timeouts: TimeoutPolicyConfig,

    #[validate(nested)]
    pub cluster: ClusterPolicyConfig,

    pub compression: CompressionAlgorithm,

    #[validate(nested)]
    pub rate_limit_service: Option<RateLimitServiceConfig>,

    /// Place ext_authz ahead of the global rate limit filter
    pub authorization_server_before_rate_limit: bool,

    /// Gateway processed by the Gateway API processor
    pub gateway: Option<NamespacedName>,

    /// Ignore `permitInsecure` on HTTPProxy routes
    pub disable_permit_insecure: bool,
}

/// Connection manager timeouts; values use duration syntax or `infinity`
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct TimeoutPolicyConfig {
    pub request_timeout: Option<String>,
    pub connection_idle_timeout: Option<String>,
    pub stream_idle_timeout: Option<String>,
}

impl TimeoutPolicyConfig {
    fn setting(value: &Option<String>) -> TimeoutSetting {
        value.as_deref().and_then(|v| parse_timeout(v).ok()).unwrap_or_default()
    }

    pub fn request(&self) -> TimeoutSetting {
        Self::setting(&self.request_timeout)
    }

    pub fn connection_idle(&self) -> TimeoutSetting {
        Self::setting(&self.connection_idle_timeout)
    }

    pub fn stream_idle(&self) -> TimeoutSetting {
        Self::setting(&self.stream_idle_timeout)
    }
}

/// Upstream cluster defaults
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClusterPolicyConfig {
    #[validate(length(min = 1, message = "Connect timeout cannot be empty"))]
    pub connect_timeout: String,
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

impl Default for ClusterPolicyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "2s".to_string(),
            max_connections: None,
            max_pending_requests: None,
            max_requests: None,
            max_retries: None,
        }
    }
}

impl ClusterPolicyConfig {
    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(2))
    }
}

/// Global rate limit service reference
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitServiceConfig {
    /// ExtensionService hosting the rate limit service
    pub extension_service: NamespacedName,

    #[validate(length(min = 1, message = "Rate limit domain cannot be empty"))]
    #[serde(default = "default_rate_limit_domain")]
    pub domain: String,

    #[serde(default)]
    pub fail_open: bool,

    #[serde(default)]
    pub enable_x_ratelimit_headers: bool,

    #[serde(default)]
    pub enable_resource_exhausted_code: bool,
}

fn default_rate_limit_domain() -> String {
    "contour".to_string()
}

/// Observability configuration for metrics and logging
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port
    pub metrics_port: u16,

    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 8002,
            service_name: "edgeplane".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if !self.enable_metrics || self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.xds.socket_address(), "0.0.0.0:8001");
        assert_eq!(config.rebuild.holdoff_delay(), Duration::from_millis(100));
        assert_eq!(config.policy.compression, CompressionAlgorithm::Gzip);
    }

    #[test]
    fn test_port_clash_rejected() {
        let mut config = AppConfig::default();
        config.listeners.https_port = config.listeners.http_port;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot share port"));
    }

    #[test]
    fn test_holdoff_bounds() {
        let mut config = AppConfig::default();
        config.rebuild.holdoff_delay_ms = 1000;
        config.rebuild.holdoff_max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let mut config = AppConfig::default();
        config.policy.timeouts.request_timeout = Some("forever".to_string());
        assert!(config.validate().is_err());

        config.policy.timeouts.request_timeout = Some("infinity".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.policy.timeouts.request(), TimeoutSetting::Disabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "xds:\n  port: 9001\ningress:\n  class_names: [\"internal\"]\npolicy:\n  compression: brotli\n  fallback_certificate: projectcontour/fallback\n  gateway: projectcontour/contour"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.xds.port, 9001);
        assert_eq!(config.ingress.class_names, vec!["internal".to_string()]);
        assert_eq!(config.policy.compression, CompressionAlgorithm::Brotli);
        let fallback = config.policy.fallback_certificate.unwrap();
        assert_eq!(fallback.namespace, "projectcontour");
        assert_eq!(fallback.name, "fallback");
        assert_eq!(config.listeners.http_port, 8080);
    }

    #[test]
    fn test_metrics_address() {
        let mut config = ObservabilityConfig::default();
        assert!(config.metrics_bind_address().is_none());
        config.enable_metrics = true;
        assert_eq!(config.metrics_bind_address().as_deref(), Some("0.0.0.0:8002"));
    }
}
