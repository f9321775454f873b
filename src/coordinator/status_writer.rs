//! In-process status sink.
//!
//! Keeps the statuses of the latest rebuild and logs every object whose
//! status changed since the previous one.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::dag::{CurrentStatus, ObjectStatus};
use crate::k8s::ObjectKey;

use super::StatusWriter;

#[derive(Debug, Default)]
pub struct StatusStore {
    statuses: RwLock<BTreeMap<ObjectKey, ObjectStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<ObjectStatus> {
        self.statuses.read().get(key).cloned()
    }

    pub fn all(&self) -> BTreeMap<ObjectKey, ObjectStatus> {
        self.statuses.read().clone()
    }
}

impl StatusWriter for StatusStore {
    fn write(&self, statuses: &BTreeMap<ObjectKey, ObjectStatus>) {
        let mut current = self.statuses.write();
        for (key, status) in statuses {
            if current.get(key) == Some(status) {
                continue;
            }
            match status.current_status {
                CurrentStatus::Valid => {
                    info!(object = %key, description = %status.description, "Object is valid")
                }
                CurrentStatus::Orphaned => {
                    warn!(object = %key, description = %status.description, "Object is orphaned")
                }
                CurrentStatus::Invalid => {
                    let errors: Vec<String> =
                        status.errors().map(|e| format!("{}: {}", e.reason, e.message)).collect();
                    warn!(object = %key, errors = ?errors, "Object is invalid");
                }
            }
        }
        *current = statuses.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::StatusCache;
    use crate::k8s::Kind;
    use tracing_test::traced_test;

    #[test]
    fn latest_statuses_replace_previous() {
        let store = StatusStore::new();
        let proxy = ObjectKey::new(Kind::HTTPProxy, "default", "app");
        let ingress = ObjectKey::new(Kind::Ingress, "default", "web");

        let mut first = StatusCache::new();
        first.touch(&proxy, "valid HTTPProxy");
        first.touch(&ingress, "valid Ingress");
        store.write(&first.finish());
        assert!(store.get(&proxy).unwrap().is_valid());

        let mut second = StatusCache::new();
        second.touch(&proxy, "valid HTTPProxy");
        store.write(&second.finish());
        assert!(store.get(&ingress).is_none());
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    #[traced_test]
    fn only_changed_statuses_are_logged() {
        let store = StatusStore::new();
        let proxy = ObjectKey::new(Kind::HTTPProxy, "default", "broken");

        let mut statuses = StatusCache::new();
        statuses.touch(&proxy, "HTTPProxy");
        statuses.add_error(&proxy, "IncludeError", "IncludeNotFound", "include default/missing not found");
        let statuses = statuses.finish();

        store.write(&statuses);
        assert!(logs_contain("Object is invalid"));
        assert!(logs_contain("IncludeNotFound"));
        assert!(!store.get(&proxy).unwrap().is_valid());
    }
}
