//! Type URLs and encoding helpers shared by the translators.

use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, AggregatedConfigSource, ApiVersion, ConfigSource,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Every type served by the discovery server, in the order Envoy needs them
pub const ALL_TYPE_URLS: [&str; 5] = [
    CLUSTER_TYPE_URL,
    ENDPOINT_TYPE_URL,
    LISTENER_TYPE_URL,
    ROUTE_TYPE_URL,
    SECRET_TYPE_URL,
];

/// Wrap a message into an `Any` with the given type URL.
pub fn any_from_message<M: Message>(type_url: impl Into<String>, msg: &M) -> Any {
    Any { type_url: type_url.into(), value: msg.encode_to_vec() }
}

/// Config source pointing back at this server over ADS
pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource::default())),
        ..Default::default()
    }
}

/// Short label used in logs and metrics (`Cluster`, `Listener`, ...)
pub fn type_label(type_url: &str) -> &str {
    type_url.rsplit('.').next().unwrap_or(type_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;

    #[test]
    fn type_labels() {
        assert_eq!(type_label(CLUSTER_TYPE_URL), "Cluster");
        assert_eq!(type_label(ENDPOINT_TYPE_URL), "ClusterLoadAssignment");
        assert_eq!(type_label(SECRET_TYPE_URL), "Secret");
    }

    #[test]
    fn any_round_trips_through_prost() {
        let cluster = Cluster { name: "default/kuard/80/abc".into(), ..Default::default() };
        let any = any_from_message(CLUSTER_TYPE_URL, &cluster);
        assert_eq!(any.type_url, CLUSTER_TYPE_URL);
        assert_eq!(Cluster::decode(any.value.as_slice()).unwrap(), cluster);
    }
}
