//! HTTP filter chain and per-route filter configuration.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::core::v3::{
    grpc_service::{EnvoyGrpc, TargetSpecifier},
    header_value_option::HeaderAppendAction,
    ApiVersion, GrpcService, HeaderValue, HeaderValueOption, RuntimeFeatureFlag,
    RuntimeFractionalPercent, TypedExtensionConfig,
};
use envoy_types::pb::envoy::config::ratelimit::v3::RateLimitServiceConfig;
use envoy_types::pb::envoy::config::route::v3::rate_limit::{action, Action};
use envoy_types::pb::envoy::config::route::v3::RateLimit as RouteRateLimit;
use envoy_types::pb::envoy::extensions::compression::gzip::compressor::v3::Gzip;
use envoy_types::pb::envoy::extensions::filters::http::compressor::v3::{
    compressor::{CommonDirectionConfig, ResponseDirectionConfig},
    Compressor,
};
use envoy_types::pb::envoy::extensions::filters::http::cors::v3::{
    Cors, CorsPolicy as FilterCorsPolicy,
};
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::{
    ext_authz::Services, ext_authz_per_route::Override, BufferSettings as EnvoyBufferSettings,
    CheckSettings, ExtAuthz, ExtAuthzPerRoute,
};
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3::LocalRateLimit as EnvoyLocalRateLimit;
use envoy_types::pb::envoy::extensions::filters::http::ratelimit::v3::{
    rate_limit::XRateLimitHeadersRfcVersion, RateLimit as EnvoyRateLimit, RateLimitPerRoute,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_filter::ConfigType as HttpFilterConfigType, HttpFilter,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use envoy_types::pb::envoy::r#type::v3::{fractional_percent, FractionalPercent, HttpStatus, TokenBucket};
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration as ProtoDuration, UInt32Value};

use crate::config::CompressionAlgorithm;
use crate::dag::{
    CorsPolicy, DescriptorEntry, ExternalAuthorization, GlobalRateLimit, LocalRateLimit,
    RateLimitService, RouteAuthorization,
};
use crate::utils::duration::{to_proto_duration, TimeoutSetting};

use super::resources::any_from_message;

pub const COMPRESSOR_FILTER: &str = "envoy.filters.http.compressor";
pub const CORS_FILTER: &str = "envoy.filters.http.cors";
pub const EXT_AUTHZ_FILTER: &str = "envoy.filters.http.ext_authz";
pub const LOCAL_RATE_LIMIT_FILTER: &str = "envoy.filters.http.local_ratelimit";
pub const RATE_LIMIT_FILTER: &str = "envoy.filters.http.ratelimit";
pub const ROUTER_FILTER: &str = "envoy.filters.http.router";

const COMPRESSOR_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.compressor.v3.Compressor";
const GZIP_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.compression.gzip.compressor.v3.Gzip";
const BROTLI_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.compression.brotli.compressor.v3.Brotli";
const ZSTD_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.compression.zstd.compressor.v3.Zstd";
const CORS_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.cors.v3.Cors";
const CORS_POLICY_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.cors.v3.CorsPolicy";
const EXT_AUTHZ_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
const EXT_AUTHZ_PER_ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthzPerRoute";
const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";
const RATE_LIMIT_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.ratelimit.v3.RateLimit";
const RATE_LIMIT_PER_ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ratelimit.v3.RateLimitPerRoute";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

/// Timeout for calls to the global rate limit service
const RATE_LIMIT_TIMEOUT_MS: i32 = 100;

fn http_filter(name: &str, config: Any) -> HttpFilter {
    HttpFilter {
        name: name.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(config)),
        ..Default::default()
    }
}

/// Inputs that shape one HTTP connection manager's filter chain
#[derive(Debug, Clone, Copy)]
pub struct FilterChainOptions<'a> {
    pub compression: CompressionAlgorithm,
    pub rate_limit_service: Option<&'a RateLimitService>,
    pub authorization: Option<&'a ExternalAuthorization>,
    pub authorization_before_rate_limit: bool,
}

/// The ordered HTTP filters of a connection manager. The router is always last.
pub fn http_filters(options: FilterChainOptions<'_>) -> Vec<HttpFilter> {
    let mut filters = Vec::new();
    if let Some(compressor) = compressor(options.compression) {
        filters.push(http_filter(COMPRESSOR_FILTER, compressor));
    }

    let rate_limit = options
        .rate_limit_service
        .map(|service| http_filter(RATE_LIMIT_FILTER, global_rate_limit_filter(service)));
    let ext_authz = options
        .authorization
        .map(|auth| http_filter(EXT_AUTHZ_FILTER, ext_authz_filter(auth)));
    if options.authorization_before_rate_limit {
        filters.extend(ext_authz);
        filters.extend(rate_limit);
    } else {
        filters.extend(rate_limit);
        filters.extend(ext_authz);
    }

    filters.push(http_filter(
        LOCAL_RATE_LIMIT_FILTER,
        any_from_message(
            LOCAL_RATE_LIMIT_TYPE_URL,
            &EnvoyLocalRateLimit { stat_prefix: "http".to_string(), ..Default::default() },
        ),
    ));
    filters.push(http_filter(CORS_FILTER, any_from_message(CORS_TYPE_URL, &Cors::default())));
    filters.push(http_filter(ROUTER_FILTER, any_from_message(ROUTER_TYPE_URL, &Router::default())));
    filters
}

fn compressor(algorithm: CompressionAlgorithm) -> Option<Any> {
    let library = match algorithm {
        CompressionAlgorithm::Disabled => return None,
        CompressionAlgorithm::Gzip => TypedExtensionConfig {
            name: "gzip".to_string(),
            typed_config: Some(any_from_message(GZIP_TYPE_URL, &Gzip::default())),
        },
        CompressionAlgorithm::Brotli => TypedExtensionConfig {
            name: "brotli".to_string(),
            typed_config: Some(Any { type_url: BROTLI_TYPE_URL.to_string(), value: Vec::new() }),
        },
        CompressionAlgorithm::Zstd => TypedExtensionConfig {
            name: "zstd".to_string(),
            typed_config: Some(Any { type_url: ZSTD_TYPE_URL.to_string(), value: Vec::new() }),
        },
    };

    let config = Compressor {
        response_direction_config: Some(ResponseDirectionConfig {
            common_config: Some(CommonDirectionConfig {
                enabled: Some(RuntimeFeatureFlag {
                    default_value: Some(BoolValue { value: true }),
                    runtime_key: String::new(),
                }),
                min_content_length: None,
                content_type: Vec::new(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        compressor_library: Some(library),
        ..Default::default()
    };
    Some(any_from_message(COMPRESSOR_TYPE_URL, &config))
}

fn grpc_service(cluster: &str, timeout: Option<ProtoDuration>) -> GrpcService {
    GrpcService {
        timeout,
        target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
            cluster_name: cluster.to_string(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn global_rate_limit_filter(service: &RateLimitService) -> Any {
    let config = EnvoyRateLimit {
        domain: service.domain.clone(),
        timeout: Some(ProtoDuration { seconds: 0, nanos: RATE_LIMIT_TIMEOUT_MS * 1_000_000 }),
        failure_mode_deny: !service.fail_open,
        rate_limit_service: Some(RateLimitServiceConfig {
            grpc_service: Some(grpc_service(&service.cluster, None)),
            transport_api_version: ApiVersion::V3 as i32,
        }),
        enable_x_ratelimit_headers: if service.enable_x_ratelimit_headers {
            XRateLimitHeadersRfcVersion::DraftVersion03 as i32
        } else {
            XRateLimitHeadersRfcVersion::Off as i32
        },
        rate_limited_as_resource_exhausted: service.enable_resource_exhausted_code,
        ..Default::default()
    };
    any_from_message(RATE_LIMIT_TYPE_URL, &config)
}

fn ext_authz_filter(auth: &ExternalAuthorization) -> Any {
    let timeout = match auth.response_timeout {
        TimeoutSetting::Value(d) => Some(to_proto_duration(d)),
        TimeoutSetting::Disabled | TimeoutSetting::Default => None,
    };
    let config = ExtAuthz {
        services: Some(Services::GrpcService(grpc_service(&auth.cluster, timeout))),
        failure_mode_allow: auth.fail_open,
        transport_api_version: ApiVersion::V3 as i32,
        with_request_body: auth.with_request_body.as_ref().map(|body| EnvoyBufferSettings {
            max_request_bytes: body.max_request_bytes,
            allow_partial_message: body.allow_partial_message,
            pack_as_bytes: body.pack_as_bytes,
        }),
        ..Default::default()
    };
    any_from_message(EXT_AUTHZ_TYPE_URL, &config)
}

/// Per-route authorization override
pub fn ext_authz_per_route(auth: &RouteAuthorization) -> Any {
    let r#override = if auth.disabled {
        Override::Disabled(true)
    } else {
        Override::CheckSettings(CheckSettings {
            context_extensions: auth.context.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ..Default::default()
        })
    };
    any_from_message(EXT_AUTHZ_PER_ROUTE_TYPE_URL, &ExtAuthzPerRoute { r#override: Some(r#override) })
}

/// Tells the rate limit filter to skip the virtual host's descriptors on one route
pub fn ignore_vhost_rate_limits() -> Any {
    let config = RateLimitPerRoute {
        vh_rate_limits: 2, // IGNORE
        ..Default::default()
    };
    any_from_message(RATE_LIMIT_PER_ROUTE_TYPE_URL, &config)
}

fn always() -> RuntimeFractionalPercent {
    RuntimeFractionalPercent {
        runtime_key: String::new(),
        default_value: Some(FractionalPercent {
            numerator: 100,
            denominator: fractional_percent::DenominatorType::Hundred as i32,
        }),
    }
}

pub(crate) fn header_value_option(key: &str, value: &str, action: HeaderAppendAction) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue { key: key.to_string(), value: value.to_string(), ..Default::default() }),
        append_action: action as i32,
        ..Default::default()
    }
}

/// Token bucket config for the local rate limit filter
pub fn local_rate_limit(limit: &LocalRateLimit, stat_prefix: &str) -> Any {
    let mut config = EnvoyLocalRateLimit {
        stat_prefix: stat_prefix.to_string(),
        token_bucket: Some(TokenBucket {
            max_tokens: limit.max_tokens,
            tokens_per_fill: Some(UInt32Value { value: limit.tokens_per_fill }),
            fill_interval: Some(to_proto_duration(limit.fill_interval)),
        }),
        filter_enabled: Some(always()),
        filter_enforced: Some(always()),
        response_headers_to_add: limit
            .response_headers
            .iter()
            .map(|(k, v)| header_value_option(k, v, HeaderAppendAction::OverwriteIfExistsOrAdd))
            .collect(),
        ..Default::default()
    };
    if limit.response_status_code != 429 {
        config.status = Some(HttpStatus { code: limit.response_status_code as i32 });
    }
    any_from_message(LOCAL_RATE_LIMIT_TYPE_URL, &config)
}

/// Descriptor actions sent to the global rate limit service
pub fn rate_limits(limit: &GlobalRateLimit) -> Vec<RouteRateLimit> {
    limit
        .descriptors
        .iter()
        .map(|entries| RouteRateLimit {
            actions: entries.iter().map(descriptor_action).collect(),
            ..Default::default()
        })
        .collect()
}

fn descriptor_action(entry: &DescriptorEntry) -> Action {
    let specifier = match entry {
        DescriptorEntry::GenericKey { key, value } => {
            action::ActionSpecifier::GenericKey(action::GenericKey {
                descriptor_value: value.clone(),
                descriptor_key: key.clone(),
                ..Default::default()
            })
        }
        DescriptorEntry::RequestHeader { header_name, descriptor_key } => {
            action::ActionSpecifier::RequestHeaders(action::RequestHeaders {
                header_name: header_name.clone(),
                descriptor_key: descriptor_key.clone(),
                skip_if_absent: false,
                ..Default::default()
            })
        }
        DescriptorEntry::RemoteAddress => action::ActionSpecifier::RemoteAddress(action::RemoteAddress::default()),
    };
    Action { action_specifier: Some(specifier) }
}

fn origin_matcher(origin: &str) -> StringMatcher {
    let match_pattern = if origin == "*" {
        MatchPattern::SafeRegex(RegexMatcher { regex: ".*".to_string(), ..Default::default() })
    } else {
        MatchPattern::Exact(origin.to_string())
    };
    StringMatcher { match_pattern: Some(match_pattern), ignore_case: true }
}

pub fn cors_policy(policy: &CorsPolicy) -> Any {
    let config = FilterCorsPolicy {
        allow_origin_string_match: policy.allow_origin.iter().map(|o| origin_matcher(o)).collect(),
        allow_methods: policy.allow_methods.join(","),
        allow_headers: policy.allow_headers.join(","),
        expose_headers: policy.expose_headers.join(","),
        max_age: policy.max_age.map(|d| d.as_secs().to_string()).unwrap_or_default(),
        allow_credentials: Some(BoolValue { value: policy.allow_credentials }),
        allow_private_network_access: Some(BoolValue { value: policy.allow_private_network }),
        ..Default::default()
    };
    any_from_message(CORS_POLICY_TYPE_URL, &config)
}

/// Per-filter config map for a virtual host
pub fn vhost_filter_configs(
    cors: Option<&CorsPolicy>,
    local: Option<&LocalRateLimit>,
) -> HashMap<String, Any> {
    let mut configs = HashMap::new();
    if let Some(cors) = cors {
        configs.insert(CORS_FILTER.to_string(), cors_policy(cors));
    }
    if let Some(local) = local {
        configs.insert(LOCAL_RATE_LIMIT_FILTER.to_string(), local_rate_limit(local, "vhost"));
    }
    configs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::BufferSettings;
    use prost::Message;
    use std::time::Duration;

    fn names(filters: &[HttpFilter]) -> Vec<&str> {
        filters.iter().map(|f| f.name.as_str()).collect()
    }

    fn service() -> RateLimitService {
        RateLimitService {
            cluster: "extension/projectcontour/ratelimit".into(),
            domain: "contour".into(),
            fail_open: false,
            enable_x_ratelimit_headers: true,
            enable_resource_exhausted_code: false,
        }
    }

    fn authorization() -> ExternalAuthorization {
        ExternalAuthorization {
            cluster: "extension/auth/authz".into(),
            response_timeout: TimeoutSetting::Value(Duration::from_millis(500)),
            fail_open: true,
            with_request_body: Some(BufferSettings {
                max_request_bytes: 1024,
                allow_partial_message: false,
                pack_as_bytes: false,
            }),
        }
    }

    #[test]
    fn default_chain_ends_with_router() {
        let filters = http_filters(FilterChainOptions {
            compression: CompressionAlgorithm::Gzip,
            rate_limit_service: None,
            authorization: None,
            authorization_before_rate_limit: false,
        });
        assert_eq!(
            names(&filters),
            vec![COMPRESSOR_FILTER, LOCAL_RATE_LIMIT_FILTER, CORS_FILTER, ROUTER_FILTER]
        );
    }

    #[test]
    fn rate_limit_precedes_ext_authz_unless_flipped() {
        let service = service();
        let auth = authorization();
        let mut options = FilterChainOptions {
            compression: CompressionAlgorithm::Disabled,
            rate_limit_service: Some(&service),
            authorization: Some(&auth),
            authorization_before_rate_limit: false,
        };
        assert_eq!(&names(&http_filters(options))[..2], &[RATE_LIMIT_FILTER, EXT_AUTHZ_FILTER]);

        options.authorization_before_rate_limit = true;
        assert_eq!(&names(&http_filters(options))[..2], &[EXT_AUTHZ_FILTER, RATE_LIMIT_FILTER]);
    }

    #[test]
    fn ext_authz_targets_extension_cluster() {
        let any = ext_authz_filter(&authorization());
        let config = ExtAuthz::decode(any.value.as_slice()).unwrap();
        assert!(config.failure_mode_allow);
        assert_eq!(config.with_request_body.unwrap().max_request_bytes, 1024);
        let Some(Services::GrpcService(grpc)) = config.services else { panic!("expected gRPC") };
        assert_eq!(grpc.timeout.unwrap().nanos, 500_000_000);
        let Some(TargetSpecifier::EnvoyGrpc(target)) = grpc.target_specifier else { panic!() };
        assert_eq!(target.cluster_name, "extension/auth/authz");
    }

    #[test]
    fn per_route_context_is_carried() {
        let auth = RouteAuthorization {
            disabled: false,
            context: [("a".to_string(), "root".to_string())].into_iter().collect(),
        };
        let config = ExtAuthzPerRoute::decode(ext_authz_per_route(&auth).value.as_slice()).unwrap();
        let Some(Override::CheckSettings(settings)) = config.r#override else { panic!() };
        assert_eq!(settings.context_extensions["a"], "root");

        let disabled = RouteAuthorization { disabled: true, ..Default::default() };
        let config = ExtAuthzPerRoute::decode(ext_authz_per_route(&disabled).value.as_slice()).unwrap();
        assert_eq!(config.r#override, Some(Override::Disabled(true)));
    }

    #[test]
    fn descriptors_become_actions() {
        let limit = GlobalRateLimit {
            disabled: false,
            descriptors: vec![vec![
                DescriptorEntry::GenericKey { key: "generic_key".into(), value: "foo".into() },
                DescriptorEntry::RemoteAddress,
            ]],
        };
        let out = rate_limits(&limit);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].actions.len(), 2);
    }

    #[test]
    fn wildcard_origin_is_regex() {
        assert!(matches!(origin_matcher("*").match_pattern, Some(MatchPattern::SafeRegex(_))));
        assert_eq!(
            origin_matcher("https://a.com").match_pattern,
            Some(MatchPattern::Exact("https://a.com".into()))
        );
    }
}
