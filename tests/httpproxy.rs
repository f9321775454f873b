//! Integration tests for HTTPProxy translation

mod common;

use common::{http_filter_names, service_yaml, tls_secret_yaml, Harness};
use edgeplane::dag::{HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME};
use edgeplane::k8s::Kind;
use edgeplane::xds::filters::{EXT_AUTHZ_FILTER, ROUTER_FILTER};
use envoy_types::pb::envoy::config::route::v3::header_matcher::HeaderMatchSpecifier;
use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::ext_authz_per_route::Override;
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::ExtAuthzPerRoute;
use envoy_types::pb::envoy::r#type::matcher::v3::string_matcher::MatchPattern;
use prost::Message;

const ROOT: &str = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata: {name: root, namespace: default}
spec:
  virtualhost: {fqdn: www.example.com}
  includes:
  - name: blog
    namespace: teama
    conditions:
    - prefix: /blog
  routes:
  - services:
    - {name: kuard, port: 8080}
"#;

const BLOG: &str = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata: {name: blog, namespace: teama}
spec:
  routes:
  - conditions:
    - prefix: /posts
    - header: {name: x-tenant, contains: acme}
    services:
    - {name: blog, port: 80}
"#;

const AUTH_SERVICE: &str = r#"
apiVersion: projectcontour.io/v1alpha1
kind: ExtensionService
metadata: {name: authz, namespace: auth}
spec:
  protocol: h2c
  services:
  - {name: authz, port: 9000}
"#;

const SECURE: &str = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata: {name: secure, namespace: default}
spec:
  virtualhost:
    fqdn: auth.example.com
    tls: {secretName: cert}
    authorization:
      extensionRef: {namespace: auth, name: authz}
      responseTimeout: 500ms
      authPolicy:
        context: {tier: gold, owner: root}
  routes:
  - conditions: [{prefix: /admin}]
    authPolicy:
      context: {owner: admin}
    services: [{name: kuard, port: 8080}]
  - services: [{name: kuard, port: 8080}]
"#;

const CONFLICTING_ROOT: &str = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata: {name: root, namespace: default}
spec:
  virtualhost: {fqdn: www.example.com}
  includes: [{name: child}]
  routes:
  - conditions: [{prefix: /a}]
    services: [{name: kuard, port: 8080}]
  - conditions: [{prefix: /c}]
    services: [{name: kuard, port: 8080}]
"#;

const CONFLICTING_CHILD: &str = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata: {name: child, namespace: default}
spec:
  routes:
  - conditions: [{prefix: /a}]
    services: [{name: kuard, port: 8080}]
  - conditions: [{prefix: /b}]
    services: [{name: kuard, port: 8080}]
"#;

async fn services(harness: &Harness) {
    let mut yaml = service_yaml("default", "kuard", &[("http", 8080)]);
    yaml.push_str("---\n");
    yaml.push_str(&service_yaml("teama", "blog", &[("http", 80)]));
    yaml.push_str("---\n");
    yaml.push_str(&service_yaml("auth", "authz", &[("grpc", 9000)]));
    yaml.push_str("---\n");
    yaml.push_str(&tls_secret_yaml("default", "cert"));
    harness.apply(&yaml).await;
}

#[tokio::test]
async fn included_routes_carry_the_include_conditions() {
    let harness = Harness::new().await;
    services(&harness).await;
    harness.apply(&format!("{}---{}", ROOT, BLOG)).await;

    let routes = harness.route_config(HTTP_LISTENER_NAME).expect("routes");
    let vhost = routes.virtual_hosts.iter().find(|v| v.name == "www.example.com").expect("vhost");
    assert_eq!(vhost.routes.len(), 2);

    let blog = &vhost.routes[0];
    let route_match = blog.r#match.as_ref().expect("match");
    assert_eq!(
        route_match.path_specifier,
        Some(PathSpecifier::Prefix("/blog/posts".into()))
    );
    let tenant = &route_match.headers[0];
    assert_eq!(tenant.name, "x-tenant");
    assert!(!tenant.invert_match);
    match &tenant.header_match_specifier {
        Some(HeaderMatchSpecifier::StringMatch(matcher)) => {
            assert_eq!(matcher.match_pattern, Some(MatchPattern::Contains("acme".into())));
        }
        other => panic!("unexpected header matcher {:?}", other),
    }

    assert!(harness.status(Kind::HTTPProxy, "default", "root").expect("root").is_valid());
    assert!(harness.status(Kind::HTTPProxy, "teama", "blog").expect("blog").is_valid());
    harness.shutdown().await;
}

#[tokio::test]
async fn removing_the_root_orphans_the_child() {
    let harness = Harness::new().await;
    services(&harness).await;
    harness.apply(&format!("{}---{}", ROOT, BLOG)).await;
    assert!(harness.delete(ROOT).await);

    let status = harness.status(Kind::HTTPProxy, "teama", "blog").expect("blog");
    assert_eq!(status.current_status, edgeplane::dag::CurrentStatus::Orphaned);
    let routes = harness.route_config(HTTP_LISTENER_NAME).expect("routes");
    assert!(routes.virtual_hosts.is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn route_conflict_removes_all_routes_of_the_losing_proxy() {
    let harness = Harness::new().await;
    services(&harness).await;
    harness.apply(&format!("{}---{}", CONFLICTING_ROOT, CONFLICTING_CHILD)).await;

    let root = harness.status(Kind::HTTPProxy, "default", "root").expect("root");
    assert!(root.has_error("RouteError", "RouteConflict"));

    let routes = harness.route_config(HTTP_LISTENER_NAME).expect("routes");
    let vhost = routes.virtual_hosts.iter().find(|v| v.name == "www.example.com").expect("vhost");
    let mut prefixes: Vec<String> = vhost
        .routes
        .iter()
        .filter_map(|r| match r.r#match.as_ref()?.path_specifier.clone()? {
            PathSpecifier::Prefix(prefix) => Some(prefix),
            _ => None,
        })
        .collect();
    prefixes.sort();
    assert_eq!(prefixes, vec!["/a", "/b"]);
    harness.shutdown().await;
}

#[tokio::test]
async fn authorization_adds_ext_authz_and_merges_context() {
    let harness = Harness::new().await;
    services(&harness).await;
    harness.apply(AUTH_SERVICE).await;
    harness.apply(SECURE).await;

    assert!(harness.status(Kind::HTTPProxy, "default", "secure").expect("status").is_valid());
    assert!(harness.cluster_names().iter().any(|name| name == "extension/auth/authz"));

    let listener = harness.listener(HTTPS_LISTENER_NAME).expect("https listener");
    let filters = http_filter_names(&listener, "auth.example.com");
    assert!(filters.iter().any(|f| f == EXT_AUTHZ_FILTER));
    assert_eq!(filters.last().map(String::as_str), Some(ROUTER_FILTER));

    let routes = harness.route_config("https/auth.example.com").expect("secure routes");
    let admin = routes.virtual_hosts[0]
        .routes
        .iter()
        .find(|r| {
            r.r#match.as_ref().and_then(|m| m.path_specifier.clone())
                == Some(PathSpecifier::Prefix("/admin".into()))
        })
        .expect("admin route");
    let per_route = ExtAuthzPerRoute::decode(admin.typed_per_filter_config[EXT_AUTHZ_FILTER].value.as_slice())
        .expect("ext_authz per route");
    let Some(Override::CheckSettings(settings)) = per_route.r#override else {
        panic!("expected check settings");
    };
    assert_eq!(settings.context_extensions["tier"], "gold");
    assert_eq!(settings.context_extensions["owner"], "admin");

    // The insecure side only redirects.
    let insecure = harness.listener(HTTP_LISTENER_NAME).expect("http listener");
    assert!(!http_filter_names(&insecure, "").iter().any(|f| f == EXT_AUTHZ_FILTER));
    harness.shutdown().await;
}

#[tokio::test]
async fn invalid_auth_timeout_rejects_the_proxy() {
    let harness = Harness::new().await;
    services(&harness).await;
    harness.apply(AUTH_SERVICE).await;
    harness.apply(&SECURE.replace("responseTimeout: 500ms", "responseTimeout: invalid-timeout")).await;

    let status = harness.status(Kind::HTTPProxy, "default", "secure").expect("status");
    assert!(status.has_error("AuthError", "AuthResponseTimeoutInvalid"));
    assert!(harness.listener(HTTPS_LISTENER_NAME).is_none());
    assert!(harness.route_config("https/auth.example.com").is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn output_does_not_depend_on_event_order() {
    let objects = [ROOT, BLOG, AUTH_SERVICE, SECURE];

    let forward = Harness::new().await;
    services(&forward).await;
    for object in objects {
        forward.apply(object).await;
    }

    let reverse = Harness::new().await;
    for object in objects.iter().rev() {
        reverse.apply(object).await;
    }
    services(&reverse).await;

    assert_eq!(
        forward.snapshots.listeners.snapshot().resources,
        reverse.snapshots.listeners.snapshot().resources
    );
    assert_eq!(forward.snapshots.routes.snapshot().resources, reverse.snapshots.routes.snapshot().resources);
    assert_eq!(
        forward.snapshots.clusters.snapshot().resources,
        reverse.snapshots.clusters.snapshot().resources
    );
    assert_eq!(forward.secret_names(), reverse.secret_names());

    forward.shutdown().await;
    reverse.shutdown().await;
}
