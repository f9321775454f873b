//! gRPC discovery services.
//!
//! One [`DiscoveryServer`] implements ADS and the five single-type services.
//! Only state-of-the-world streams are supported; delta variants answer
//! `UNIMPLEMENTED`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::config::XdsConfig;
use crate::errors::{EdgeplaneError, Result};
use crate::utils::generate_id;

use super::resources::{
    CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, SECRET_TYPE_URL,
};
use super::snapshot::SnapshotSet;
use super::stream::{run_stream_loop, ResponseStream};

type DeltaStream = Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

fn delta_unimplemented(label: &str) -> Status {
    warn!(stream = %label, "Rejecting delta discovery stream");
    Status::unimplemented("delta xDS is not supported, use state-of-the-world")
}

/// Serves the snapshot caches to Envoy
#[derive(Clone)]
pub struct DiscoveryServer {
    snapshots: Arc<SnapshotSet>,
    shutdown: CancellationToken,
}

impl DiscoveryServer {
    pub fn new(snapshots: Arc<SnapshotSet>, shutdown: CancellationToken) -> Self {
        Self { snapshots, shutdown }
    }

    fn stream(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
        type_url: Option<&'static str>,
        label: &'static str,
    ) -> Response<ResponseStream> {
        info!(stream = %label, remote = ?request.remote_addr(), "New discovery stream connection established");
        Response::new(run_stream_loop(
            self.snapshots.clone(),
            request.into_inner(),
            type_url,
            label,
            self.shutdown.child_token(),
        ))
    }

    /// Unary fetch of the current resources of one type
    fn fetch(
        &self,
        request: Request<DiscoveryRequest>,
        type_url: &'static str,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        let request = request.into_inner();
        let node_id = request.node.as_ref().map(|n| n.id.as_str()).unwrap_or("unknown");
        let _span = crate::xds_span!("fetch", node_id, type_url = %type_url).entered();
        if !request.type_url.is_empty() && request.type_url != type_url {
            return Err(Status::invalid_argument(format!("cannot fetch type {}", request.type_url)));
        }
        let cache = self
            .snapshots
            .cache(type_url)
            .ok_or_else(|| Status::internal(format!("no cache for {}", type_url)))?;
        let (version, resources) = cache.query(&request.resource_names);
        Ok(Response::new(DiscoveryResponse {
            version_info: version.to_string(),
            resources,
            type_url: type_url.to_string(),
            nonce: generate_id(),
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.stream(request, None, "ADS"))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(delta_unimplemented("ADS"))
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = ResponseStream;
    type DeltaClustersStream = DeltaStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamClustersStream>, Status> {
        Ok(self.stream(request, Some(CLUSTER_TYPE_URL), "CDS"))
    }

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaClustersStream>, Status> {
        Err(delta_unimplemented("CDS"))
    }

    async fn fetch_clusters(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, CLUSTER_TYPE_URL)
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for DiscoveryServer {
    type StreamEndpointsStream = ResponseStream;
    type DeltaEndpointsStream = DeltaStream;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamEndpointsStream>, Status> {
        Ok(self.stream(request, Some(ENDPOINT_TYPE_URL), "EDS"))
    }

    async fn delta_endpoints(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(delta_unimplemented("EDS"))
    }

    async fn fetch_endpoints(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, ENDPOINT_TYPE_URL)
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = ResponseStream;
    type DeltaListenersStream = DeltaStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamListenersStream>, Status> {
        Ok(self.stream(request, Some(LISTENER_TYPE_URL), "LDS"))
    }

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaListenersStream>, Status> {
        Err(delta_unimplemented("LDS"))
    }

    async fn fetch_listeners(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, LISTENER_TYPE_URL)
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = ResponseStream;
    type DeltaRoutesStream = DeltaStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamRoutesStream>, Status> {
        Ok(self.stream(request, Some(ROUTE_TYPE_URL), "RDS"))
    }

    async fn delta_routes(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(delta_unimplemented("RDS"))
    }

    async fn fetch_routes(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, ROUTE_TYPE_URL)
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for DiscoveryServer {
    type StreamSecretsStream = ResponseStream;
    type DeltaSecretsStream = DeltaStream;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamSecretsStream>, Status> {
        Ok(self.stream(request, Some(SECRET_TYPE_URL), "SDS"))
    }

    async fn delta_secrets(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(delta_unimplemented("SDS"))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        self.fetch(request, SECRET_TYPE_URL)
    }
}

/// Run the discovery server until `shutdown` fires.
pub async fn serve(config: &XdsConfig, snapshots: Arc<SnapshotSet>, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = config
        .socket_address()
        .parse()
        .map_err(|e| EdgeplaneError::config(format!("Invalid xDS address: {}", e)))?;

    let server = DiscoveryServer::new(snapshots, shutdown.clone());
    info!(address = %addr, "Starting xDS discovery server");

    Server::builder()
        .add_service(AggregatedDiscoveryServiceServer::new(server.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(server.clone()))
        .add_service(EndpointDiscoveryServiceServer::new(server.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(server.clone()))
        .add_service(RouteDiscoveryServiceServer::new(server.clone()))
        .add_service(SecretDiscoveryServiceServer::new(server))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            let error_msg = e.to_string();
            if error_msg.contains("Address already in use") || error_msg.contains("bind") {
                EdgeplaneError::transport(format!(
                    "xDS server failed to bind to {}: Port {} is already in use",
                    addr,
                    addr.port()
                ))
            } else {
                EdgeplaneError::transport(format!("xDS server failed: {}", e))
            }
        })?;

    info!("xDS discovery server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use std::collections::BTreeMap;

    fn server() -> DiscoveryServer {
        let snapshots = Arc::new(SnapshotSet::new());
        snapshots.clusters.update(BTreeMap::from([(
            "default/kuard/80/abc".to_string(),
            Cluster { name: "default/kuard/80/abc".into(), ..Default::default() },
        )]));
        DiscoveryServer::new(snapshots, CancellationToken::new())
    }

    #[tokio::test]
    async fn fetch_returns_current_snapshot() {
        let server = server();
        let response = server.fetch_clusters(Request::new(DiscoveryRequest::default())).await.unwrap().into_inner();
        assert_eq!(response.version_info, "1");
        assert_eq!(response.resources.len(), 1);

        let empty = server
            .fetch_listeners(Request::new(DiscoveryRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(empty.version_info, "0");
        assert!(empty.resources.is_empty());
    }

    #[tokio::test]
    async fn fetch_rejects_foreign_type() {
        let server = server();
        let request = DiscoveryRequest { type_url: LISTENER_TYPE_URL.to_string(), ..Default::default() };
        let status = server.fetch_clusters(Request::new(request)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn invalid_bind_address_is_a_config_error() {
        let config = XdsConfig { bind_address: "not an address".into(), port: 8001 };
        let err = serve(&config, Arc::new(SnapshotSet::new()), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EdgeplaneError::Config { .. }));
    }
}
