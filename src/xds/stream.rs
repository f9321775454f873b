//! State-of-the-world discovery streams.
//!
//! One loop runs per gRPC stream. It answers requests from the snapshot
//! caches and pushes a fresh response whenever a cache the client subscribed
//! to changes. A response is only sent when the resources matching the
//! subscription differ from what the stream last received, or the client asks
//! for something new.
//!
//! ACK and NACK are recognised through the response nonce:
//! - ACK: nonce and version match the last response and no error detail is set
//! - NACK: nonce matches and an error detail is set; the rejected content is
//!   not sent again until it changes

use std::collections::HashMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, error, info, warn, Instrument};

use crate::observability::metrics;
use crate::utils::generate_id;

use super::resources::type_label;
use super::snapshot::{SnapshotSet, SnapshotUpdate};

pub type ResponseStream = ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;

/// What the stream last sent for one type
#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: String,
    nonce: String,
    resources: Vec<Any>,
}

#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    last: Option<LastDiscoverySnapshot>,
}

/// Per-stream protocol state, independent of the transport
pub(crate) struct StreamSession {
    snapshots: Arc<SnapshotSet>,
    /// Set for single-type services (CDS, EDS, ...); `None` for ADS
    type_url: Option<&'static str>,
    label: &'static str,
    subscriptions: HashMap<String, Subscription>,
}

impl StreamSession {
    pub(crate) fn new(snapshots: Arc<SnapshotSet>, type_url: Option<&'static str>, label: &'static str) -> Self {
        Self { snapshots, type_url, label, subscriptions: HashMap::new() }
    }

    /// Handle one client request. `Ok(None)` means nothing needs sending.
    pub(crate) fn handle_request(
        &mut self,
        request: DiscoveryRequest,
    ) -> std::result::Result<Option<DiscoveryResponse>, Status> {
        let type_url = match (self.type_url, request.type_url.as_str()) {
            (Some(expected), "") => expected.to_string(),
            (Some(expected), requested) if requested != expected => {
                return Err(Status::invalid_argument(format!(
                    "{} stream cannot serve type {}",
                    self.label, requested
                )));
            }
            (None, "") => return Err(Status::invalid_argument("discovery request without type_url")),
            (_, requested) => requested.to_string(),
        };
        let node_id = request.node.as_ref().map(|n| n.id.as_str()).unwrap_or_default();

        info!(
            type_url = %type_url,
            version_info = %request.version_info,
            resource_names = ?request.resource_names,
            node_id = %node_id,
            stream = %self.label,
            "Received discovery request"
        );

        let Some(cache) = self.snapshots.cache(&type_url) else {
            warn!(type_url = %type_url, stream = %self.label, "Ignoring request for unsupported resource type");
            return Ok(None);
        };

        let subscription = self.subscriptions.entry(type_url.clone()).or_default();
        let names_changed = subscription.names != request.resource_names;
        subscription.names = request.resource_names.clone();

        let (version, resources) = cache.query(&subscription.names);
        let version = version.to_string();

        if let Some(last) = subscription.last.as_ref() {
            let answers_last = !request.response_nonce.is_empty() && request.response_nonce == last.nonce;
            let unchanged = !names_changed && last.resources == resources;

            if !request.response_nonce.is_empty() && !answers_last && !names_changed {
                debug!(
                    type_url = %type_url,
                    nonce = %request.response_nonce,
                    stream = %self.label,
                    "Ignoring request carrying a stale nonce"
                );
                return Ok(None);
            }

            if let Some(error_detail) = request.error_detail.as_ref() {
                if answers_last {
                    warn!(
                        type_url = %type_url,
                        nonce = %request.response_nonce,
                        error_code = error_detail.code,
                        error_message = %error_detail.message,
                        node_id = %node_id,
                        stream = %self.label,
                        "[NACK] Envoy rejected previous response"
                    );
                    metrics::record_xds_nack(&type_url);
                    if unchanged {
                        return Ok(None);
                    }
                }
            } else if answers_last && request.version_info == last.version && unchanged {
                debug!(
                    type_url = %type_url,
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    node_id = %node_id,
                    stream = %self.label,
                    "[ACK] Skipping duplicate discovery request"
                );
                return Ok(None);
            }
        }

        Ok(Some(self.respond(&type_url, version, resources)))
    }

    /// Handle a snapshot change. Only types the client subscribed to, whose
    /// matching resources changed, produce a response.
    pub(crate) fn handle_update(&mut self, update: &SnapshotUpdate) -> Option<DiscoveryResponse> {
        let subscription = self.subscriptions.get(update.type_url)?;
        let last = subscription.last.as_ref()?;
        let cache = self.snapshots.cache(update.type_url)?;

        let (version, resources) = cache.query(&subscription.names);
        if last.resources == resources {
            debug!(
                type_url = %update.type_url,
                version,
                stream = %self.label,
                "Subscribed resources unchanged, skipping push"
            );
            return None;
        }
        Some(self.respond(update.type_url, version.to_string(), resources))
    }

    /// Every subscribed type, resent after the stream fell behind on updates
    pub(crate) fn resync(&mut self) -> Vec<DiscoveryResponse> {
        let mut type_urls: Vec<&'static str> = self
            .subscriptions
            .keys()
            .filter_map(|t| self.snapshots.cache(t).map(|c| c.type_url()))
            .collect();
        type_urls.sort_unstable();
        type_urls
            .into_iter()
            .filter_map(|type_url| {
                let version = self.snapshots.cache(type_url)?.version();
                self.handle_update(&SnapshotUpdate { type_url, version })
            })
            .collect()
    }

    fn respond(&mut self, type_url: &str, version: String, resources: Vec<Any>) -> DiscoveryResponse {
        let nonce = generate_id();
        let subscription = self.subscriptions.entry(type_url.to_string()).or_default();
        subscription.last = Some(LastDiscoverySnapshot {
            version: version.clone(),
            nonce: nonce.clone(),
            resources: resources.clone(),
        });
        metrics::record_xds_response(type_url, resources.len());
        DiscoveryResponse {
            version_info: version,
            resources,
            type_url: type_url.to_string(),
            nonce,
            ..Default::default()
        }
    }
}

/// Run the shared SOTW stream loop for one client.
///
/// The loop ends when the client closes its side, sends an error, drops the
/// response stream, or `shutdown` fires.
pub fn run_stream_loop<S>(
    snapshots: Arc<SnapshotSet>,
    mut in_stream: S,
    type_url: Option<&'static str>,
    label: &'static str,
    shutdown: CancellationToken,
) -> ResponseStream
where
    S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let mut update_rx = snapshots.subscribe();
    let mut session = StreamSession::new(snapshots, type_url, label);
    let span = tracing::info_span!("xds_stream", stream = %label, stream_id = %generate_id());

    tokio::spawn(
        async move {
            metrics::record_xds_connection(true);
            loop {
                tokio::select! {
                    result = in_stream.next() => {
                        match result {
                            Some(Ok(request)) => match session.handle_request(request) {
                                Ok(Some(response)) => {
                                    if !send(&tx, response, label).await {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(status) => {
                                    warn!(stream = %label, error = %status.message(), "Rejecting discovery request");
                                    let _ = tx.send(Err(status)).await;
                                    break;
                                }
                            },
                            Some(Err(e)) => {
                                warn!(stream = %label, "Error receiving discovery request: {}", e);
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                            None => {
                                info!(stream = %label, "ADS stream ended by client");
                                break;
                            }
                        }
                    }
                    update = update_rx.recv() => {
                        let responses = match update {
                            Ok(update) => session.handle_update(&update).into_iter().collect(),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(stream = %label, skipped, "Missed {} update notifications, resyncing", skipped);
                                session.resync()
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                warn!(stream = %label, "Update notification channel closed");
                                break;
                            }
                        };
                        let mut open = true;
                        for response in responses {
                            if !send(&tx, response, label).await {
                                open = false;
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!(stream = %label, "Shutting down discovery stream");
                        break;
                    }
                }
            }
            metrics::record_xds_connection(false);
        }
        .instrument(span),
    );

    ReceiverStream::new(rx)
}

async fn send(
    tx: &mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
    response: DiscoveryResponse,
    label: &str,
) -> bool {
    info!(
        type_url = %type_label(&response.type_url),
        version = %response.version_info,
        nonce = %response.nonce,
        resource_count = response.resources.len(),
        stream = %label,
        "Sending discovery response"
    );
    if tx.send(Ok(response)).await.is_err() {
        error!(stream = %label, "Discovery response receiver dropped");
        return false;
    }
    true
}
