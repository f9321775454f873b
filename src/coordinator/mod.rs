//! # Rebuild Coordinator
//!
//! Kubernetes events enter through the [`EventHandler`]. Endpoints go straight
//! to the EDS fast path; everything else mutates the resource cache and
//! schedules a debounced rebuild. A single [`RebuildCoordinator`] task runs the
//! graph builder and hands each DAG to the registered observers and each
//! status set to the [`StatusWriter`].

pub mod event_handler;
pub mod status_writer;

use std::collections::BTreeMap;

use crate::dag::{Dag, ObjectStatus};
use crate::k8s::ObjectKey;

pub use event_handler::{EventHandler, RebuildCoordinator};
pub use status_writer::StatusStore;

/// Receives every DAG a rebuild produces
pub trait DagObserver: Send + Sync {
    fn on_change(&self, dag: &Dag);
}

/// Sink for the statuses computed by a rebuild
pub trait StatusWriter: Send + Sync {
    fn write(&self, statuses: &BTreeMap<ObjectKey, ObjectStatus>);
}
