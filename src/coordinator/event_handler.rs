//! Event intake and the debounced rebuild loop.

use std::future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::cache::ResourceCache;
use crate::config::RebuildConfig;
use crate::dag::Builder;
use crate::k8s::KubernetesResource;
use crate::observability::metrics;
use crate::xds::EndpointTranslator;

use super::{DagObserver, StatusWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Changed,
    Synced,
}

/// Entry point for Kubernetes events. Cheap to share behind an `Arc`.
pub struct EventHandler {
    cache: Arc<ResourceCache>,
    endpoints: Arc<EndpointTranslator>,
    events: mpsc::UnboundedSender<Event>,
    completed: watch::Receiver<u64>,
}

impl EventHandler {
    /// Create the handler and the coordinator that serves it. The coordinator
    /// must be driven with [`RebuildCoordinator::run`].
    pub fn new(
        cache: Arc<ResourceCache>,
        endpoints: Arc<EndpointTranslator>,
        builder: Builder,
        observers: Vec<Arc<dyn DagObserver>>,
        status: Arc<dyn StatusWriter>,
        config: RebuildConfig,
    ) -> (Self, RebuildCoordinator) {
        let (events, rx) = mpsc::unbounded_channel();
        let (sequence, completed) = watch::channel(0);
        let handler = Self { cache: cache.clone(), endpoints, events, completed };
        let coordinator = RebuildCoordinator {
            rebuilder: Rebuilder { cache, builder, observers, status, sequence },
            config,
            events: rx,
        };
        (handler, coordinator)
    }

    /// Returns whether the event changed anything.
    pub fn on_add(&self, resource: KubernetesResource) -> bool {
        trace!(object = %resource.key(), "Add event");
        match resource {
            KubernetesResource::Endpoints(endpoints) => self.endpoints.upsert(endpoints),
            other => self.schedule_if(self.cache.insert(other)),
        }
    }

    pub fn on_update(&self, old: KubernetesResource, new: KubernetesResource) -> bool {
        trace!(object = %new.key(), "Update event");
        if old.key() != new.key() {
            let removed = self.on_delete(&old);
            return self.on_add(new) || removed;
        }
        self.on_add(new)
    }

    pub fn on_delete(&self, resource: &KubernetesResource) -> bool {
        trace!(object = %resource.key(), "Delete event");
        match resource {
            KubernetesResource::Endpoints(endpoints) => self.endpoints.remove(endpoints),
            other => self.schedule_if(self.cache.remove(other)),
        }
    }

    /// Signal that the initial listing is complete. The first rebuild runs
    /// immediately; rebuilds before this point are held back.
    pub fn synced(&self) {
        info!("Initial resource sync complete");
        let _ = self.events.send(Event::Synced);
    }

    /// Receiver of the rebuild sequence number, advanced after every rebuild
    /// has been published to all observers.
    pub fn rebuild_completed(&self) -> watch::Receiver<u64> {
        self.completed.clone()
    }

    pub fn sequence(&self) -> u64 {
        *self.completed.borrow()
    }

    fn schedule_if(&self, changed: bool) -> bool {
        if changed {
            // A closed channel means the coordinator has shut down.
            let _ = self.events.send(Event::Changed);
        }
        changed
    }
}

struct Rebuilder {
    cache: Arc<ResourceCache>,
    builder: Builder,
    observers: Vec<Arc<dyn DagObserver>>,
    status: Arc<dyn StatusWriter>,
    sequence: watch::Sender<u64>,
}

/// Single writer that turns cache mutations into published DAGs
pub struct RebuildCoordinator {
    rebuilder: Rebuilder,
    config: RebuildConfig,
    events: mpsc::UnboundedReceiver<Event>,
}

impl RebuildCoordinator {
    /// Run until `shutdown` fires or every [`EventHandler`] is gone. A rebuild
    /// in progress always completes, so the last published snapshots stay
    /// consistent.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self { rebuilder, config, mut events } = self;
        let holdoff = config.holdoff_delay();
        let max_holdoff = config.holdoff_max_delay();
        let mut synced = false;
        let mut first_pending: Option<TokioInstant> = None;
        let mut deadline: Option<TokioInstant> = None;

        info!(
            holdoff_ms = holdoff.as_millis() as u64,
            max_holdoff_ms = max_holdoff.as_millis() as u64,
            "Rebuild coordinator started"
        );

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Rebuild coordinator shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(Event::Synced) => {
                        synced = true;
                        first_pending = None;
                        deadline = None;
                        rebuilder.rebuild();
                    }
                    Some(Event::Changed) if synced => {
                        let now = TokioInstant::now();
                        let first = *first_pending.get_or_insert(now);
                        deadline = Some((now + holdoff).min(first + max_holdoff));
                        trace!("Rebuild pending");
                    }
                    Some(Event::Changed) => {
                        trace!("Change before initial sync, rebuild deferred");
                    }
                    None => {
                        debug!("All event handlers dropped");
                        break;
                    }
                },
                _ = timer => {
                    first_pending = None;
                    deadline = None;
                    rebuilder.rebuild();
                }
            }
        }
    }
}

impl Rebuilder {
    fn rebuild(&self) {
        let sequence = *self.sequence.borrow() + 1;
        let span = crate::rebuild_span!(sequence);
        let _guard = span.enter();

        let started = Instant::now();
        let contents = self.cache.snapshot();
        let result = self.builder.build(&contents);
        for observer in &self.observers {
            observer.on_change(&result.dag);
        }
        self.status.write(&result.statuses);

        let invalid = result.invalid_count();
        let elapsed = started.elapsed();
        metrics::record_rebuild(elapsed.as_secs_f64(), invalid);
        self.sequence.send_replace(sequence);
        info!(
            sequence,
            objects = contents.len(),
            invalid_objects = invalid,
            duration_ms = elapsed.as_millis() as u64,
            "DAG rebuild complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::coordinator::StatusStore;
    use crate::dag::{BuilderConfig, Dag};
    use crate::xds::SnapshotSet;
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingObserver {
        seen: Mutex<usize>,
    }

    impl DagObserver for CountingObserver {
        fn on_change(&self, _dag: &Dag) {
            *self.seen.lock() += 1;
        }
    }

    fn service(name: &str, port: i32) -> KubernetesResource {
        KubernetesResource::Service(Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort { port, ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn setup(config: RebuildConfig) -> (EventHandler, RebuildCoordinator, Arc<CountingObserver>) {
        let snapshots = Arc::new(SnapshotSet::new());
        let endpoints = Arc::new(EndpointTranslator::new(snapshots));
        let observer = Arc::new(CountingObserver::default());
        let (handler, coordinator) = EventHandler::new(
            Arc::new(ResourceCache::new(CacheConfig::default())),
            endpoints,
            Builder::new(BuilderConfig::default()),
            vec![observer.clone() as Arc<dyn DagObserver>],
            Arc::new(StatusStore::new()),
            config,
        );
        (handler, coordinator, observer)
    }

    #[tokio::test]
    async fn sync_triggers_first_rebuild() {
        let (handler, coordinator, observer) = setup(RebuildConfig::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let mut completed = handler.rebuild_completed();
        handler.synced();
        completed.changed().await.unwrap();
        assert_eq!(*completed.borrow(), 1);
        assert_eq!(*observer.seen.lock(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_are_coalesced() {
        let config = RebuildConfig { holdoff_delay_ms: 100, holdoff_max_delay_ms: 500 };
        let (handler, coordinator, observer) = setup(config);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let mut completed = handler.rebuild_completed();
        handler.synced();
        completed.changed().await.unwrap();

        for port in 80..85 {
            assert!(handler.on_add(service("kuard", port)));
        }
        completed.changed().await.unwrap();
        assert_eq!(*completed.borrow(), 2);
        assert_eq!(*observer.seen.lock(), 2);

        // Re-adding an identical object schedules nothing.
        assert!(!handler.on_add(service("kuard", 84)));
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.sequence(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn max_holdoff_bounds_the_wait() {
        let config = RebuildConfig { holdoff_delay_ms: 100, holdoff_max_delay_ms: 250 };
        let (handler, coordinator, _observer) = setup(config);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let mut completed = handler.rebuild_completed();
        handler.synced();
        completed.changed().await.unwrap();

        let started = TokioInstant::now();
        for port in 1..=10 {
            handler.on_add(service("kuard", port));
            time::sleep(Duration::from_millis(50)).await;
            if handler.sequence() == 2 {
                break;
            }
        }
        completed.changed().await.ok();
        assert_eq!(handler.sequence(), 2);
        assert!(started.elapsed() < Duration::from_millis(400));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn changes_before_sync_wait_for_sync() {
        let (handler, coordinator, observer) = setup(RebuildConfig::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        assert!(handler.on_add(service("kuard", 80)));
        time::sleep(Duration::from_millis(700)).await;
        assert_eq!(handler.sequence(), 0);
        assert_eq!(*observer.seen.lock(), 0);

        let mut completed = handler.rebuild_completed();
        handler.synced();
        completed.changed().await.unwrap();
        assert_eq!(handler.sequence(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
