//! Conversion of per-route and per-virtual-host policy blocks into DAG values.
//!
//! Each function validates its input and returns a message describing the
//! first problem found; callers attach that message to the owning object.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::k8s::httpproxy;
use crate::utils::duration::{parse_duration, parse_timeout, TimeoutSetting};

use super::{
    CorsPolicy, DescriptorEntry, GlobalRateLimit, HashPolicy, HashSource, HeadersPolicy, HealthCheck,
    LoadBalancerStrategy, LocalRateLimit, PathRewrite, Redirect, RetryPolicy, RouteAuthorization,
    RouteTimeouts,
};

pub const SESSION_AFFINITY_COOKIE: &str = "X-Contour-Session-Affinity";
pub const DEFAULT_HEALTH_CHECK_HOST: &str = "contour-envoy-healthcheck";

const DEFAULT_RETRY_ON: &str = "5xx";
const VALID_RETRY_ON: &[&str] = &[
    "5xx",
    "gateway-error",
    "reset",
    "connect-failure",
    "retriable-4xx",
    "refused-stream",
    "retriable-status-codes",
    "retriable-headers",
    "cancelled",
    "deadline-exceeded",
    "internal",
    "resource-exhausted",
    "unavailable",
];

/// Merge two context maps key by key; `leaf` wins on conflicts.
pub fn merge_context(
    root: &BTreeMap<String, String>,
    leaf: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = root.clone();
    merged.extend(leaf.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Effective authorization settings for a route under a virtual host policy.
pub fn merge_auth_policy(
    vhost: Option<&httpproxy::AuthorizationPolicy>,
    route: Option<&httpproxy::AuthorizationPolicy>,
) -> RouteAuthorization {
    let empty = BTreeMap::new();
    let root_context = vhost.map(|p| &p.context).unwrap_or(&empty);
    let leaf_context = route.map(|p| &p.context).unwrap_or(&empty);
    let disabled = route
        .and_then(|p| p.disabled)
        .or_else(|| vhost.and_then(|p| p.disabled))
        .unwrap_or(false);
    RouteAuthorization { disabled, context: merge_context(root_context, leaf_context) }
}

fn timeout_field(value: Option<&String>, field: &str) -> Result<TimeoutSetting, String> {
    match value {
        Some(value) => parse_timeout(value).map_err(|e| format!("{} timeout {:?}: {}", field, value, e)),
        None => Ok(TimeoutSetting::Default),
    }
}

pub fn route_timeouts(policy: Option<&httpproxy::TimeoutPolicy>) -> Result<RouteTimeouts, String> {
    let Some(policy) = policy else {
        return Ok(RouteTimeouts::default());
    };
    Ok(RouteTimeouts {
        response: timeout_field(policy.response.as_ref(), "response")?,
        idle: timeout_field(policy.idle.as_ref(), "idle")?,
    })
}

pub fn idle_connection_timeout(policy: Option<&httpproxy::TimeoutPolicy>) -> Result<TimeoutSetting, String> {
    timeout_field(policy.and_then(|p| p.idle_connection.as_ref()), "idle connection")
}

pub fn retry_policy(policy: Option<&httpproxy::RetryPolicy>) -> Result<Option<RetryPolicy>, String> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    let num_retries = match policy.count {
        None | Some(0) => 1,
        Some(n) if n < 0 => return Err(format!("retry count {} must not be negative", n)),
        Some(n) => u32::try_from(n).map_err(|_| format!("retry count {} is too large", n))?,
    };
    let per_try_timeout = timeout_field(policy.per_try_timeout.as_ref(), "per-try")?;
    for condition in &policy.retry_on {
        if !VALID_RETRY_ON.contains(&condition.as_str()) {
            return Err(format!("unsupported retryOn value {:?}", condition));
        }
    }
    let retry_on = if policy.retry_on.is_empty() {
        DEFAULT_RETRY_ON.to_string()
    } else {
        policy.retry_on.join(",")
    };
    Ok(Some(RetryPolicy {
        retry_on,
        num_retries,
        per_try_timeout,
        retriable_status_codes: policy.retriable_status_codes.clone(),
    }))
}

/// Retry policy from the Ingress annotations
pub fn retry_from_annotations(
    retry_on: Option<&str>,
    num_retries: Option<&str>,
    per_try_timeout: Option<&str>,
) -> Result<Option<RetryPolicy>, String> {
    let Some(retry_on) = retry_on.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    let count = num_retries.map(|v| v.trim().parse::<i64>()).transpose().map_err(|e| e.to_string())?;
    let policy = httpproxy::RetryPolicy {
        count,
        per_try_timeout: per_try_timeout.map(str::to_string),
        retry_on: retry_on.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        retriable_status_codes: Vec::new(),
    };
    retry_policy(Some(&policy))
}

fn header_name(name: &str) -> Result<String, String> {
    http::HeaderName::from_bytes(name.as_bytes())
        .map(|h| h.as_str().to_string())
        .map_err(|_| format!("invalid header name {:?}", name))
}

/// Header policy plus the Host rewrite extracted from a `set: Host` entry.
pub fn headers_policy(
    policy: Option<&httpproxy::HeadersPolicy>,
    allow_host_rewrite: bool,
) -> Result<(HeadersPolicy, Option<String>), String> {
    let mut out = HeadersPolicy::default();
    let mut host = None;
    let Some(policy) = policy else {
        return Ok((out, host));
    };
    for entry in &policy.set {
        let name = header_name(&entry.name)?;
        if name == "host" {
            if !allow_host_rewrite {
                return Err("rewriting the Host header is not supported here".to_string());
            }
            host = Some(entry.value.clone());
            continue;
        }
        if out.set.insert(name.clone(), entry.value.clone()).is_some() {
            return Err(format!("duplicate header addition {:?}", name));
        }
    }
    for name in &policy.remove {
        let name = header_name(name)?;
        if out.remove.contains(&name) {
            return Err(format!("duplicate header removal {:?}", name));
        }
        out.remove.push(name);
    }
    out.remove.sort();
    Ok((out, host))
}

pub fn local_rate_limit(policy: &httpproxy::LocalRateLimitPolicy) -> Result<LocalRateLimit, String> {
    if policy.requests == 0 {
        return Err("local rate limit requests must be greater than zero".to_string());
    }
    let fill_interval = match policy.unit.as_str() {
        "second" => Duration::from_secs(1),
        "minute" => Duration::from_secs(60),
        "hour" => Duration::from_secs(3600),
        other => return Err(format!("invalid local rate limit unit {:?}", other)),
    };
    let response_status_code = policy.response_status_code.unwrap_or(429);
    if !(400..600).contains(&response_status_code) {
        return Err(format!("invalid local rate limit response status code {}", response_status_code));
    }
    let mut response_headers = BTreeMap::new();
    for header in &policy.response_headers_to_add {
        response_headers.insert(header_name(&header.name)?, header.value.clone());
    }
    Ok(LocalRateLimit {
        max_tokens: policy.requests.saturating_add(policy.burst),
        tokens_per_fill: policy.requests,
        fill_interval,
        response_status_code,
        response_headers,
    })
}

pub fn global_rate_limit(policy: &httpproxy::GlobalRateLimitPolicy) -> Result<GlobalRateLimit, String> {
    let mut descriptors = Vec::with_capacity(policy.descriptors.len());
    for descriptor in &policy.descriptors {
        let mut entries = Vec::with_capacity(descriptor.entries.len());
        for entry in &descriptor.entries {
            let set = [entry.generic_key.is_some(), entry.request_header.is_some(), entry.remote_address.is_some()]
                .iter()
                .filter(|b| **b)
                .count();
            if set != 1 {
                return Err("rate limit descriptor entries must set exactly one field".to_string());
            }
            let converted = if let Some(generic) = &entry.generic_key {
                DescriptorEntry::GenericKey {
                    key: generic.key.clone().unwrap_or_else(|| "generic_key".to_string()),
                    value: generic.value.clone(),
                }
            } else if let Some(header) = &entry.request_header {
                DescriptorEntry::RequestHeader {
                    header_name: header.header_name.clone(),
                    descriptor_key: header.descriptor_key.clone(),
                }
            } else {
                DescriptorEntry::RemoteAddress
            };
            entries.push(converted);
        }
        descriptors.push(entries);
    }
    Ok(GlobalRateLimit { disabled: policy.disabled, descriptors })
}

pub fn cors_policy(policy: &httpproxy::CorsPolicy) -> Result<CorsPolicy, String> {
    if policy.allow_origin.is_empty() {
        return Err("CORS policy must allow at least one origin".to_string());
    }
    if policy.allow_methods.is_empty() {
        return Err("CORS policy must allow at least one method".to_string());
    }
    for origin in &policy.allow_origin {
        if origin != "*" && !origin.contains("://") {
            return Err(format!("invalid allowed origin {:?}", origin));
        }
    }
    let max_age = policy
        .max_age
        .as_deref()
        .map(|v| parse_duration(v).map_err(|e| format!("invalid max age {:?}: {}", v, e)))
        .transpose()?;
    Ok(CorsPolicy {
        allow_credentials: policy.allow_credentials,
        allow_origin: policy.allow_origin.clone(),
        allow_methods: policy.allow_methods.clone(),
        allow_headers: policy.allow_headers.clone(),
        expose_headers: policy.expose_headers.clone(),
        max_age,
        allow_private_network: policy.allow_private_network,
    })
}

/// Strategy named in a policy; unknown names fall back to round robin.
pub fn lb_strategy(policy: Option<&httpproxy::LoadBalancerPolicy>) -> LoadBalancerStrategy {
    policy
        .and_then(|p| p.strategy.as_deref())
        .and_then(LoadBalancerStrategy::parse)
        .unwrap_or_default()
}

/// Route hash policies implied by the load balancer strategy.
pub fn hash_policies(policy: Option<&httpproxy::LoadBalancerPolicy>) -> Vec<HashPolicy> {
    match lb_strategy(policy) {
        LoadBalancerStrategy::Cookie => vec![HashPolicy {
            terminal: false,
            source: HashSource::Cookie {
                name: SESSION_AFFINITY_COOKIE.to_string(),
                ttl: Duration::ZERO,
                path: "/".to_string(),
            },
        }],
        LoadBalancerStrategy::RequestHash => policy
            .map(|p| p.request_hash_policies.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|hp| {
                let source = match (&hp.header_hash_options, &hp.query_parameter_hash_options, hp.hash_source_ip) {
                    (Some(h), None, false) if !h.header_name.is_empty() => {
                        HashSource::Header(h.header_name.to_ascii_lowercase())
                    }
                    (None, Some(q), false) if !q.parameter_name.is_empty() => {
                        HashSource::QueryParameter(q.parameter_name.clone())
                    }
                    (None, None, true) => HashSource::SourceIp,
                    _ => return None,
                };
                Some(HashPolicy { terminal: hp.terminal, source })
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub fn health_check(policy: Option<&httpproxy::HTTPHealthCheckPolicy>) -> Option<HealthCheck> {
    let policy = policy?;
    let positive = |v: Option<i64>, default: u64| v.filter(|v| *v > 0).map(|v| v as u64).unwrap_or(default);
    Some(HealthCheck {
        path: policy.path.clone(),
        host: policy.host.clone().unwrap_or_else(|| DEFAULT_HEALTH_CHECK_HOST.to_string()),
        interval: Duration::from_secs(positive(policy.interval_seconds, 5)),
        timeout: Duration::from_secs(positive(policy.timeout_seconds, 2)),
        unhealthy_threshold: positive(policy.unhealthy_threshold_count, 3) as u32,
        healthy_threshold: positive(policy.healthy_threshold_count, 2) as u32,
    })
}

pub fn redirect(policy: &httpproxy::HTTPRequestRedirectPolicy) -> Result<Redirect, String> {
    let status_code = match policy.status_code {
        None => None,
        Some(code @ (301 | 302)) => Some(code as u32),
        Some(code) => return Err(format!("redirect status code {} must be 301 or 302", code)),
    };
    let path = match (&policy.path, &policy.prefix) {
        (Some(_), Some(_)) => return Err("cannot set both path and prefix on a redirect".to_string()),
        (Some(path), None) => Some(PathRewrite::FullPath(path.clone())),
        (None, Some(prefix)) => Some(PathRewrite::Prefix(prefix.clone())),
        (None, None) => None,
    };
    let port = policy
        .port
        .map(|p| u32::try_from(p).ok().filter(|p| *p > 0 && *p <= 65535).ok_or(format!("invalid redirect port {}", p)))
        .transpose()?;
    Ok(Redirect { scheme: policy.scheme.clone(), hostname: policy.hostname.clone(), port, path, status_code })
}

pub fn direct_response(policy: &httpproxy::HTTPDirectResponsePolicy) -> Result<(u32, Option<String>), String> {
    if !(200..600).contains(&policy.status_code) {
        return Err(format!("invalid direct response status code {}", policy.status_code));
    }
    Ok((policy.status_code as u32, policy.body.clone()))
}

/// Pick the prefix replacement applying to a route matched on `route_prefix`.
pub fn path_rewrite(
    policy: Option<&httpproxy::PathRewritePolicy>,
    route_prefix: Option<&str>,
) -> Result<Option<PathRewrite>, String> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    let unprefixed: Vec<_> = policy.replace_prefix.iter().filter(|r| r.prefix.is_none()).collect();
    if unprefixed.len() > 1 {
        return Err("ambiguous prefix replacement".to_string());
    }
    let specific = route_prefix.and_then(|route_prefix| {
        policy
            .replace_prefix
            .iter()
            .find(|r| r.prefix.as_deref().map(|p| p.trim_end_matches('/')) == Some(route_prefix.trim_end_matches('/')))
    });
    Ok(specific.or(unprefixed.first().copied()).map(|r| PathRewrite::Prefix(r.replacement.clone())))
}
