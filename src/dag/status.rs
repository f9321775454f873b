//! Validation and status accumulation.
//!
//! Every rebuild starts from an empty [`StatusCache`]; processors record what
//! they find and the finished statuses replace the previous set wholesale.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::k8s::ObjectKey;

/// Overall state reported on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentStatus {
    Valid,
    Invalid,
    Orphaned,
}

impl fmt::Display for CurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrentStatus::Valid => f.write_str("valid"),
            CurrentStatus::Invalid => f.write_str("invalid"),
            CurrentStatus::Orphaned => f.write_str("orphaned"),
        }
    }
}

/// One problem found on an object, grouped under a condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDetail {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub errors: Vec<ConditionDetail>,
    pub warnings: Vec<ConditionDetail>,
}

/// Status written back for one object after a rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    #[serde(skip)]
    pub object: ObjectKey,
    pub current_status: CurrentStatus,
    pub description: String,
    pub conditions: Vec<Condition>,
}

impl ObjectStatus {
    pub fn is_valid(&self) -> bool {
        self.current_status == CurrentStatus::Valid
    }

    /// All error details across conditions
    pub fn errors(&self) -> impl Iterator<Item = &ConditionDetail> {
        self.conditions.iter().flat_map(|c| c.errors.iter())
    }

    pub fn has_error(&self, condition_type: &str, reason: &str) -> bool {
        self.errors().any(|e| e.condition_type == condition_type && e.reason == reason)
    }
}

#[derive(Debug, Default)]
struct PendingStatus {
    description: Option<String>,
    orphaned: bool,
    errors: Vec<ConditionDetail>,
    warnings: Vec<ConditionDetail>,
    conditions: BTreeMap<String, Condition>,
}

/// Per-rebuild collection of object statuses
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: BTreeMap<ObjectKey, PendingStatus>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, key: &ObjectKey) -> &mut PendingStatus {
        self.entries.entry(key.clone()).or_default()
    }

    /// Register an object as seen so it receives a status even when nothing is wrong.
    pub fn touch(&mut self, key: &ObjectKey, description: impl Into<String>) {
        let entry = self.entry(key);
        if entry.description.is_none() {
            entry.description = Some(description.into());
        }
    }

    pub fn add_error(
        &mut self,
        key: &ObjectKey,
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let detail = ConditionDetail {
            condition_type: condition_type.into(),
            reason: reason.into(),
            message: message.into(),
        };
        let entry = self.entry(key);
        if !entry.errors.contains(&detail) {
            entry.errors.push(detail);
        }
    }

    pub fn add_warning(
        &mut self,
        key: &ObjectKey,
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let detail = ConditionDetail {
            condition_type: condition_type.into(),
            reason: reason.into(),
            message: message.into(),
        };
        let entry = self.entry(key);
        if !entry.warnings.contains(&detail) {
            entry.warnings.push(detail);
        }
    }

    pub fn set_orphaned(&mut self, key: &ObjectKey) {
        self.entry(key).orphaned = true;
    }

    /// Record an explicit named condition (Gateway API style)
    pub fn set_condition(
        &mut self,
        key: &ObjectKey,
        condition_type: &str,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let condition = Condition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        let entry = self.entry(key);
        // A false condition is sticky within one rebuild.
        match entry.conditions.get(condition_type) {
            Some(existing) if !existing.status && status => {}
            _ => {
                entry.conditions.insert(condition_type.to_string(), condition);
            }
        }
    }

    pub fn has_errors(&self, key: &ObjectKey) -> bool {
        self.entries.get(key).map(|e| !e.errors.is_empty()).unwrap_or(false)
    }

    /// Objects carrying an error of `condition_type` with any of `reasons`
    pub fn keys_with_error(&self, condition_type: &str, reasons: &[&str]) -> BTreeSet<ObjectKey> {
        self.entries
            .iter()
            .filter(|(_, pending)| {
                pending
                    .errors
                    .iter()
                    .any(|e| e.condition_type == condition_type && reasons.contains(&e.reason.as_str()))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Produce final statuses, sorted by object key.
    pub fn finish(self) -> BTreeMap<ObjectKey, ObjectStatus> {
        self.entries
            .into_iter()
            .map(|(key, pending)| {
                let status = finalize(&key, pending);
                (key, status)
            })
            .collect()
    }
}

fn finalize(key: &ObjectKey, pending: PendingStatus) -> ObjectStatus {
    let kind = key.kind.as_str();
    let (current_status, description, reason) = if !pending.errors.is_empty() {
        (
            CurrentStatus::Invalid,
            "At least one error present, see Errors for details".to_string(),
            "ErrorPresent",
        )
    } else if pending.orphaned {
        (
            CurrentStatus::Orphaned,
            format!("this {} is not part of a delegation chain from a root {}", kind, kind),
            "Orphaned",
        )
    } else {
        (
            CurrentStatus::Valid,
            pending.description.unwrap_or_else(|| format!("Valid {}", kind)),
            "Valid",
        )
    };

    let mut conditions = vec![Condition {
        condition_type: "Valid".to_string(),
        status: current_status == CurrentStatus::Valid,
        reason: reason.to_string(),
        message: description.clone(),
        errors: pending.errors,
        warnings: pending.warnings,
    }];
    conditions.extend(pending.conditions.into_values());

    ObjectStatus { object: key.clone(), current_status, description, conditions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::Kind;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Kind::HTTPProxy, "default", name)
    }

    #[test]
    fn touched_object_is_valid() {
        let mut cache = StatusCache::new();
        cache.touch(&key("a"), "Valid HTTPProxy");
        let statuses = cache.finish();
        let status = &statuses[&key("a")];
        assert!(status.is_valid());
        assert_eq!(status.description, "Valid HTTPProxy");
        assert_eq!(status.conditions[0].condition_type, "Valid");
        assert!(status.conditions[0].status);
    }

    #[test]
    fn errors_win_over_orphaned() {
        let mut cache = StatusCache::new();
        cache.set_orphaned(&key("a"));
        cache.add_error(&key("a"), "AuthError", "AuthResponseTimeoutInvalid", "bad timeout");
        cache.add_error(&key("a"), "AuthError", "AuthResponseTimeoutInvalid", "bad timeout");
        let statuses = cache.finish();
        let status = &statuses[&key("a")];
        assert_eq!(status.current_status, CurrentStatus::Invalid);
        assert!(status.has_error("AuthError", "AuthResponseTimeoutInvalid"));
        assert_eq!(status.errors().count(), 1);
    }

    #[test]
    fn orphaned_status() {
        let mut cache = StatusCache::new();
        cache.set_orphaned(&key("child"));
        let statuses = cache.finish();
        assert_eq!(statuses[&key("child")].current_status, CurrentStatus::Orphaned);
    }

    #[test]
    fn false_condition_is_sticky() {
        let mut cache = StatusCache::new();
        let route = ObjectKey::new(Kind::HTTPRoute, "default", "r");
        cache.set_condition(&route, "ResolvedRefs", false, "BackendNotFound", "missing");
        cache.set_condition(&route, "ResolvedRefs", true, "ResolvedRefs", "ok");
        let statuses = cache.finish();
        let resolved = statuses[&route]
            .conditions
            .iter()
            .find(|c| c.condition_type == "ResolvedRefs")
            .unwrap();
        assert!(!resolved.status);
    }
}
