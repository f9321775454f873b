//! Integration tests for the Gateway API processor

mod common;

use common::{service_yaml, tls_secret_yaml, Harness};
use edgeplane::config::AppConfig;
use edgeplane::k8s::{Kind, NamespacedName};
use envoy_types::pb::envoy::config::route::v3::route::Action;

const GATEWAY: &str = r#"
apiVersion: gateway.networking.k8s.io/v1
kind: Gateway
metadata: {name: contour, namespace: projectcontour}
spec:
  gatewayClassName: contour
  listeners:
  - name: http
    port: 80
    protocol: HTTP
    allowedRoutes: {namespaces: {from: All}}
  - name: https
    port: 443
    protocol: HTTPS
    hostname: "*.example.com"
    tls:
      certificateRefs: [{name: cert}]
    allowedRoutes: {namespaces: {from: All}}
"#;

const ROUTE: &str = r#"
apiVersion: gateway.networking.k8s.io/v1
kind: HTTPRoute
metadata: {name: kuard, namespace: default}
spec:
  parentRefs: [{name: contour, namespace: projectcontour}]
  hostnames: [app.example.com]
  rules:
  - matches:
    - path: {type: PathPrefix, value: /api}
    backendRefs: [{name: kuard, port: 80}]
"#;

async fn gateway() -> Harness {
    let mut config = AppConfig::default();
    config.policy.gateway = Some(NamespacedName::new("projectcontour", "contour"));
    let harness = Harness::with_config(config).await;
    harness.apply(&service_yaml("default", "kuard", &[("http", 80)])).await;
    harness.apply(&tls_secret_yaml("projectcontour", "cert")).await;
    harness.apply(GATEWAY).await;
    harness
}

#[tokio::test]
async fn gateway_listeners_become_envoy_listeners() {
    let harness = gateway().await;
    harness.apply(ROUTE).await;

    assert!(harness.listener("http-80").is_some());
    assert!(harness.listener("https-443").is_some());

    let routes = harness.route_config("http-80").expect("http-80 routes");
    let vhost = routes.virtual_hosts.iter().find(|v| v.name == "app.example.com").expect("vhost");
    assert!(matches!(vhost.routes[0].action, Some(Action::Route(_))));
    assert!(harness.route_config("https-443/app.example.com").is_some());

    let status = harness.status(Kind::HTTPRoute, "default", "kuard").expect("route status");
    assert!(status.is_valid());
    assert!(harness.cluster("default/kuard/80/").is_some());
    harness.shutdown().await;
}

#[tokio::test]
async fn missing_backend_answers_500() {
    let harness = gateway().await;
    harness.apply(&ROUTE.replace("name: kuard, port: 80", "name: missing, port: 80")).await;

    let routes = harness.route_config("http-80").expect("routes");
    let vhost = routes.virtual_hosts.iter().find(|v| v.name == "app.example.com").expect("vhost");
    match &vhost.routes[0].action {
        Some(Action::DirectResponse(response)) => assert_eq!(response.status, 500),
        other => panic!("expected a direct response, got {:?}", other),
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn gateways_other_than_the_configured_one_are_ignored() {
    let harness = Harness::new().await;
    harness.apply(&service_yaml("default", "kuard", &[("http", 80)])).await;
    harness.apply(GATEWAY).await;
    harness.apply(ROUTE).await;

    assert!(harness.listener("http-80").is_none());
    assert!(harness.status(Kind::HTTPRoute, "default", "kuard").is_none());
    harness.shutdown().await;
}
