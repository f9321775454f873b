//! Route configuration translation.
//!
//! One `RouteConfiguration` per HTTP listener carries every insecure virtual
//! host. Each secure virtual host gets its own configuration, referenced from
//! the filter chain that matches its SNI name.

use std::collections::{BTreeMap, HashMap};

use envoy_types::pb::envoy::config::core::v3::header_value_option::HeaderAppendAction;
use envoy_types::pb::envoy::config::core::v3::HeaderValueOption;
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier,
    query_parameter_matcher::QueryParameterMatchSpecifier,
    redirect_action::{PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier},
    route::Action,
    route_action::{
        hash_policy::{self, PolicySpecifier},
        ClusterSpecifier, HashPolicy as EnvoyHashPolicy, HostRewriteSpecifier, UpgradeConfig,
    },
    route_match::PathSpecifier,
    weighted_cluster::ClusterWeight,
    DirectResponseAction, HeaderMatcher, QueryParameterMatcher, RedirectAction,
    RetryPolicy as EnvoyRetryPolicy, Route as EnvoyRoute, RouteAction, RouteConfiguration,
    RouteMatch, VirtualHost as EnvoyVirtualHost, WeightedCluster as EnvoyWeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatchAndSubstitute, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::{Any, UInt32Value};

use crate::dag::{
    Dag, HashPolicy, HashSource, HeaderCondition, HeaderMatchKind, HeadersPolicy, Listener,
    ListenerProtocol, PathMatch, PathRewrite, QueryCondition, QueryMatchKind, Redirect, RetryPolicy,
    Route, RouteAction as DagRouteAction, SecureVirtualHost, VirtualHost, WeightedCluster,
    HTTPS_LISTENER_NAME,
};
use crate::utils::duration::to_proto_duration;

use super::filters::{
    ext_authz_per_route, header_value_option, ignore_vhost_rate_limits, local_rate_limit, rate_limits,
    vhost_filter_configs, EXT_AUTHZ_FILTER, LOCAL_RATE_LIMIT_FILTER, RATE_LIMIT_FILTER,
};
use super::secret::inline_string;
use super::TranslationOptions;

/// Route configuration shared by hosts served with the fallback certificate
pub const FALLBACK_ROUTE_CONFIG: &str = "ingress_fallbackcert";

/// Name of the fallback route configuration for a listener
pub fn fallback_route_config_name(listener: &Listener) -> String {
    if listener.name == HTTPS_LISTENER_NAME {
        FALLBACK_ROUTE_CONFIG.to_string()
    } else {
        format!("{}/fallback", listener.name)
    }
}

/// Every route configuration of the DAG, keyed by name
pub fn route_configurations(dag: &Dag, options: &TranslationOptions) -> BTreeMap<String, RouteConfiguration> {
    let mut out = BTreeMap::new();
    for listener in dag.listeners.values() {
        if listener.protocol == ListenerProtocol::Http {
            let name = listener.route_config_name();
            let vhosts = listener.virtual_hosts.values().map(|v| virtual_host(v, options)).collect();
            out.insert(name.clone(), route_configuration(name, vhosts));
        }

        let mut fallback_hosts = Vec::new();
        for (hostname, svhost) in &listener.secure_virtual_hosts {
            if svhost.passthrough || !svhost.vhost.has_routes() {
                continue;
            }
            let vhost = secure_virtual_host(svhost, options);
            if svhost.fallback_certificate.is_some() {
                fallback_hosts.push(vhost.clone());
            }
            let name = listener.secure_route_config_name(hostname);
            out.insert(name.clone(), route_configuration(name, vec![vhost]));
        }
        if !fallback_hosts.is_empty() {
            let name = fallback_route_config_name(listener);
            out.insert(name.clone(), route_configuration(name, fallback_hosts));
        }
    }
    out
}

fn route_configuration(name: String, virtual_hosts: Vec<EnvoyVirtualHost>) -> RouteConfiguration {
    RouteConfiguration { name, virtual_hosts, ..Default::default() }
}

fn virtual_host(vhost: &VirtualHost, options: &TranslationOptions) -> EnvoyVirtualHost {
    EnvoyVirtualHost {
        name: vhost.name.clone(),
        domains: vec![vhost.name.clone()],
        routes: vhost.routes.iter().map(|r| route(r, options)).collect(),
        typed_per_filter_config: vhost_filter_configs(vhost.cors.as_ref(), vhost.local_rate_limit.as_ref()),
        rate_limits: vhost
            .global_rate_limit
            .as_ref()
            .filter(|limit| !limit.disabled)
            .map(rate_limits)
            .unwrap_or_default(),
        ..Default::default()
    }
}

fn secure_virtual_host(svhost: &SecureVirtualHost, options: &TranslationOptions) -> EnvoyVirtualHost {
    virtual_host(&svhost.vhost, options)
}

fn route(route: &Route, options: &TranslationOptions) -> EnvoyRoute {
    let action = if route.https_redirect {
        Action::Redirect(RedirectAction {
            scheme_rewrite_specifier: Some(SchemeRewriteSpecifier::HttpsRedirect(true)),
            port_redirect: options.https_redirect_port.map(u32::from).unwrap_or_default(),
            response_code: RedirectResponseCode::MovedPermanently as i32,
            ..Default::default()
        })
    } else {
        match &route.action {
            DagRouteAction::Forward(clusters) => Action::Route(route_action(route, clusters)),
            DagRouteAction::Redirect(redirect) => Action::Redirect(redirect_action(redirect)),
            DagRouteAction::DirectResponse { status, body } => Action::DirectResponse(DirectResponseAction {
                status: *status,
                body: body.as_ref().map(|b| inline_string(b.clone())),
                ..Default::default()
            }),
        }
    };

    let mut envoy_route = EnvoyRoute {
        r#match: Some(route_match(route)),
        action: Some(action),
        ..Default::default()
    };
    if route.https_redirect {
        return envoy_route;
    }

    envoy_route.request_headers_to_add = headers_to_add(&route.request_headers);
    envoy_route.request_headers_to_remove = route.request_headers.remove.clone();
    envoy_route.response_headers_to_add = headers_to_add(&route.response_headers);
    envoy_route.response_headers_to_remove = route.response_headers.remove.clone();
    envoy_route.typed_per_filter_config = route_filter_configs(route);
    envoy_route
}

fn route_filter_configs(route: &Route) -> HashMap<String, Any> {
    let mut configs = HashMap::new();
    if let Some(auth) = &route.authorization {
        configs.insert(EXT_AUTHZ_FILTER.to_string(), ext_authz_per_route(auth));
    }
    if let Some(local) = &route.local_rate_limit {
        configs.insert(LOCAL_RATE_LIMIT_FILTER.to_string(), local_rate_limit(local, "route"));
    }
    if route.global_rate_limit.as_ref().is_some_and(|g| g.disabled) {
        configs.insert(RATE_LIMIT_FILTER.to_string(), ignore_vhost_rate_limits());
    }
    configs
}

fn headers_to_add(policy: &HeadersPolicy) -> Vec<HeaderValueOption> {
    let set = policy
        .set
        .iter()
        .map(|(k, v)| header_value_option(k, v, HeaderAppendAction::OverwriteIfExistsOrAdd));
    let add = policy
        .add
        .iter()
        .map(|(k, v)| header_value_option(k, v, HeaderAppendAction::AppendIfExistsOrAdd));
    set.chain(add).collect()
}

fn regex(pattern: &str) -> RegexMatcher {
    RegexMatcher { regex: pattern.to_string(), ..Default::default() }
}

fn path_specifier(path: &PathMatch) -> PathSpecifier {
    match path {
        PathMatch::Exact(p) => PathSpecifier::Path(p.clone()),
        PathMatch::Regex(p) => PathSpecifier::SafeRegex(regex(p)),
        PathMatch::Prefix(p) => PathSpecifier::Prefix(p.clone()),
        PathMatch::Segment(p) => {
            let trimmed = p.trim_end_matches('/');
            if trimmed.is_empty() {
                PathSpecifier::Prefix("/".to_string())
            } else {
                PathSpecifier::PathSeparatedPrefix(trimmed.to_string())
            }
        }
    }
}

fn string_matcher(pattern: MatchPattern, ignore_case: bool) -> StringMatcher {
    StringMatcher { match_pattern: Some(pattern), ignore_case }
}

fn header_matcher(condition: &HeaderCondition) -> HeaderMatcher {
    let ignore_case = condition.ignore_case;
    let (specifier, invert) = match &condition.kind {
        HeaderMatchKind::Present => (HeaderMatchSpecifier::PresentMatch(true), false),
        HeaderMatchKind::NotPresent => (HeaderMatchSpecifier::PresentMatch(true), true),
        HeaderMatchKind::Exact(v) => {
            (HeaderMatchSpecifier::StringMatch(string_matcher(MatchPattern::Exact(v.clone()), ignore_case)), false)
        }
        HeaderMatchKind::NotExact(v) => {
            (HeaderMatchSpecifier::StringMatch(string_matcher(MatchPattern::Exact(v.clone()), ignore_case)), true)
        }
        HeaderMatchKind::Contains(v) => (
            HeaderMatchSpecifier::StringMatch(string_matcher(MatchPattern::Contains(v.clone()), ignore_case)),
            false,
        ),
        HeaderMatchKind::NotContains(v) => (
            HeaderMatchSpecifier::StringMatch(string_matcher(MatchPattern::Contains(v.clone()), ignore_case)),
            true,
        ),
        HeaderMatchKind::Regex(v) => {
            (HeaderMatchSpecifier::StringMatch(string_matcher(MatchPattern::SafeRegex(regex(v)), false)), false)
        }
    };
    HeaderMatcher {
        name: condition.name.clone(),
        invert_match: invert,
        treat_missing_header_as_empty: condition.treat_missing_as_empty,
        header_match_specifier: Some(specifier),
    }
}

fn query_matcher(condition: &QueryCondition) -> QueryParameterMatcher {
    let ignore_case = condition.ignore_case;
    let specifier = match &condition.kind {
        QueryMatchKind::Present => QueryParameterMatchSpecifier::PresentMatch(true),
        QueryMatchKind::Exact(v) => {
            QueryParameterMatchSpecifier::StringMatch(string_matcher(MatchPattern::Exact(v.clone()), ignore_case))
        }
        QueryMatchKind::Prefix(v) => {
            QueryParameterMatchSpecifier::StringMatch(string_matcher(MatchPattern::Prefix(v.clone()), ignore_case))
        }
        QueryMatchKind::Suffix(v) => {
            QueryParameterMatchSpecifier::StringMatch(string_matcher(MatchPattern::Suffix(v.clone()), ignore_case))
        }
        QueryMatchKind::Contains(v) => {
            QueryParameterMatchSpecifier::StringMatch(string_matcher(MatchPattern::Contains(v.clone()), ignore_case))
        }
        QueryMatchKind::Regex(v) => {
            QueryParameterMatchSpecifier::StringMatch(string_matcher(MatchPattern::SafeRegex(regex(v)), false))
        }
    };
    QueryParameterMatcher { name: condition.name.clone(), query_parameter_match_specifier: Some(specifier) }
}

fn route_match(route: &Route) -> RouteMatch {
    RouteMatch {
        path_specifier: Some(path_specifier(&route.conditions.path)),
        headers: route.conditions.headers.iter().map(header_matcher).collect(),
        query_parameters: route.conditions.query_params.iter().map(query_matcher).collect(),
        ..Default::default()
    }
}

fn retry_policy(retry: &RetryPolicy) -> EnvoyRetryPolicy {
    EnvoyRetryPolicy {
        retry_on: retry.retry_on.clone(),
        num_retries: Some(UInt32Value { value: retry.num_retries }),
        per_try_timeout: retry.per_try_timeout.as_envoy_duration(),
        retriable_status_codes: retry.retriable_status_codes.clone(),
        ..Default::default()
    }
}

fn hash_policy(policy: &HashPolicy) -> EnvoyHashPolicy {
    let specifier = match &policy.source {
        HashSource::Header(name) => PolicySpecifier::Header(hash_policy::Header {
            header_name: name.clone(),
            ..Default::default()
        }),
        HashSource::QueryParameter(name) => {
            PolicySpecifier::QueryParameter(hash_policy::QueryParameter { name: name.clone() })
        }
        HashSource::SourceIp => {
            PolicySpecifier::ConnectionProperties(hash_policy::ConnectionProperties { source_ip: true })
        }
        HashSource::Cookie { name, ttl, path } => PolicySpecifier::Cookie(hash_policy::Cookie {
            name: name.clone(),
            ttl: Some(to_proto_duration(*ttl)),
            path: path.clone(),
            ..Default::default()
        }),
    };
    EnvoyHashPolicy { policy_specifier: Some(specifier), terminal: policy.terminal }
}

fn cluster_specifier(clusters: &[WeightedCluster]) -> ClusterSpecifier {
    if let [single] = clusters {
        if single.request_headers.is_empty() && single.response_headers.is_empty() {
            return ClusterSpecifier::Cluster(single.cluster.clone());
        }
    }
    let total: u32 = clusters.iter().map(|c| c.weight).sum();
    let weights = clusters
        .iter()
        .map(|c| ClusterWeight {
            name: c.cluster.clone(),
            weight: Some(UInt32Value { value: if total == 0 { 1 } else { c.weight } }),
            request_headers_to_add: headers_to_add(&c.request_headers),
            request_headers_to_remove: c.request_headers.remove.clone(),
            response_headers_to_add: headers_to_add(&c.response_headers),
            response_headers_to_remove: c.response_headers.remove.clone(),
            ..Default::default()
        })
        .collect();
    ClusterSpecifier::WeightedClusters(EnvoyWeightedCluster { clusters: weights, ..Default::default() })
}

fn route_action(route: &Route, clusters: &[WeightedCluster]) -> RouteAction {
    let mut action = RouteAction {
        cluster_specifier: Some(cluster_specifier(clusters)),
        timeout: route.timeouts.response.as_envoy_duration(),
        idle_timeout: route.timeouts.idle.as_envoy_duration(),
        retry_policy: route.retry.as_ref().map(retry_policy),
        hash_policy: route.hash_policies.iter().map(hash_policy).collect(),
        ..Default::default()
    };

    match &route.path_rewrite {
        Some(PathRewrite::Prefix(prefix)) => action.prefix_rewrite = prefix.clone(),
        Some(PathRewrite::FullPath(path)) => {
            action.regex_rewrite = Some(RegexMatchAndSubstitute {
                pattern: Some(regex("^/.*$")),
                substitution: path.clone(),
            })
        }
        None => {}
    }
    if let Some(host) = &route.host_rewrite {
        action.host_rewrite_specifier = Some(HostRewriteSpecifier::HostRewriteLiteral(host.clone()));
    }
    if route.websocket {
        action.upgrade_configs = vec![UpgradeConfig { upgrade_type: "websocket".to_string(), ..Default::default() }];
    }
    if let Some(global) = route.global_rate_limit.as_ref().filter(|g| !g.disabled) {
        action.rate_limits = rate_limits(global);
    }
    action
}

fn redirect_action(redirect: &Redirect) -> RedirectAction {
    let response_code = match redirect.status_code.unwrap_or(301) {
        302 => RedirectResponseCode::Found,
        303 => RedirectResponseCode::SeeOther,
        307 => RedirectResponseCode::TemporaryRedirect,
        308 => RedirectResponseCode::PermanentRedirect,
        _ => RedirectResponseCode::MovedPermanently,
    };
    RedirectAction {
        scheme_rewrite_specifier: redirect.scheme.clone().map(SchemeRewriteSpecifier::SchemeRedirect),
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        port_redirect: redirect.port.unwrap_or_default(),
        path_rewrite_specifier: redirect.path.as_ref().map(|path| match path {
            PathRewrite::FullPath(p) => PathRewriteSpecifier::PathRedirect(p.clone()),
            PathRewrite::Prefix(p) => PathRewriteSpecifier::PrefixRewrite(p.clone()),
        }),
        response_code: response_code as i32,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        GlobalRateLimit, ListenerProtocol, RouteAuthorization, RouteConditions, HTTP_LISTENER_NAME,
    };
    use crate::k8s::{Kind, ObjectKey};

    fn owner() -> ObjectKey {
        ObjectKey::new(Kind::HTTPProxy, "default", "app")
    }

    fn forward(path: PathMatch, cluster: &str) -> Route {
        Route::new(
            owner(),
            RouteConditions::new(path, vec![], vec![]),
            DagRouteAction::Forward(vec![WeightedCluster {
                cluster: cluster.into(),
                weight: 1,
                request_headers: HeadersPolicy::default(),
                response_headers: HeadersPolicy::default(),
            }]),
        )
    }

    fn dag_with(routes: Vec<Route>) -> Dag {
        let mut dag = Dag::default();
        let listener = dag.add_listener(Listener::new(HTTP_LISTENER_NAME, "0.0.0.0", 8080, ListenerProtocol::Http));
        listener.vhost_mut("example.com").routes = routes;
        dag
    }

    fn only_route(dag: &Dag) -> EnvoyRoute {
        let configs = route_configurations(dag, &TranslationOptions::default());
        configs[HTTP_LISTENER_NAME].virtual_hosts[0].routes[0].clone()
    }

    #[test]
    fn http_listener_always_has_route_config() {
        let mut dag = Dag::default();
        dag.add_listener(Listener::new(HTTP_LISTENER_NAME, "0.0.0.0", 8080, ListenerProtocol::Http));
        let configs = route_configurations(&dag, &TranslationOptions::default());
        assert!(configs[HTTP_LISTENER_NAME].virtual_hosts.is_empty());
    }

    #[test]
    fn single_cluster_forward() {
        let route = only_route(&dag_with(vec![forward(PathMatch::Prefix("/".into()), "default/kuard/80/abc")]));
        let Some(Action::Route(action)) = route.action else { panic!("expected route action") };
        assert_eq!(action.cluster_specifier, Some(ClusterSpecifier::Cluster("default/kuard/80/abc".into())));
        assert_eq!(route.r#match.unwrap().path_specifier, Some(PathSpecifier::Prefix("/".into())));
    }

    #[test]
    fn https_redirect_uses_configured_port() {
        let redirect = forward(PathMatch::Prefix("/".into()), "c").to_https_redirect();
        let dag = dag_with(vec![redirect]);
        let options = TranslationOptions { https_redirect_port: Some(443), ..Default::default() };
        let configs = route_configurations(&dag, &options);
        let route = &configs[HTTP_LISTENER_NAME].virtual_hosts[0].routes[0];
        let Some(Action::Redirect(action)) = &route.action else { panic!("expected redirect") };
        assert_eq!(action.port_redirect, 443);
        assert_eq!(action.scheme_rewrite_specifier, Some(SchemeRewriteSpecifier::HttpsRedirect(true)));
    }

    #[test]
    fn segment_prefix_uses_path_separated_prefix() {
        assert_eq!(
            path_specifier(&PathMatch::Segment("/api/".into())),
            PathSpecifier::PathSeparatedPrefix("/api".into())
        );
        assert_eq!(path_specifier(&PathMatch::Segment("/".into())), PathSpecifier::Prefix("/".into()));
    }

    #[test]
    fn not_contains_inverts_match() {
        let matcher = header_matcher(&HeaderCondition {
            name: "x-canary".into(),
            kind: HeaderMatchKind::NotContains("true".into()),
            ignore_case: false,
            treat_missing_as_empty: false,
        });
        assert!(matcher.invert_match);
        let Some(HeaderMatchSpecifier::StringMatch(sm)) = matcher.header_match_specifier else { panic!() };
        assert_eq!(sm.match_pattern, Some(MatchPattern::Contains("true".into())));
    }

    #[test]
    fn weighted_clusters_and_filters() {
        let mut route = forward(PathMatch::Prefix("/".into()), "a");
        if let DagRouteAction::Forward(clusters) = &mut route.action {
            clusters[0].weight = 90;
            clusters.push(WeightedCluster {
                cluster: "b".into(),
                weight: 10,
                request_headers: HeadersPolicy::default(),
                response_headers: HeadersPolicy::default(),
            });
        }
        route.websocket = true;
        route.authorization = Some(RouteAuthorization::default());
        route.global_rate_limit = Some(GlobalRateLimit { disabled: true, descriptors: vec![] });

        let out = only_route(&dag_with(vec![route]));
        assert!(out.typed_per_filter_config.contains_key(EXT_AUTHZ_FILTER));
        assert!(out.typed_per_filter_config.contains_key(RATE_LIMIT_FILTER));
        let Some(Action::Route(action)) = out.action else { panic!() };
        assert_eq!(action.upgrade_configs[0].upgrade_type, "websocket");
        let Some(ClusterSpecifier::WeightedClusters(weighted)) = action.cluster_specifier else { panic!() };
        assert_eq!(weighted.clusters.len(), 2);
        assert_eq!(weighted.clusters[1].weight, Some(UInt32Value { value: 10 }));
    }

    #[test]
    fn redirect_status_codes() {
        let redirect = redirect_action(&Redirect { status_code: Some(302), ..Default::default() });
        assert_eq!(redirect.response_code, RedirectResponseCode::Found as i32);
        let redirect = redirect_action(&Redirect::default());
        assert_eq!(redirect.response_code, RedirectResponseCode::MovedPermanently as i32);
    }
}
