//! Status condition aggregation
//!
//! Conditions are keyed by type. A pass rebuilds the set from the previous
//! status, so condition types this operator does not know about ride along
//! untouched, and `lastTransitionTime` only moves when the status value
//! actually flips.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionStatus};

/// Condition type: a fatal or configuration problem blocks convergence
pub const DEGRADED: &str = "Degraded";
/// Condition type: the operator is still pushing toward the desired state
pub const PROGRESSING: &str = "Progressing";
/// Condition type: the registry is serving with minimum availability
pub const AVAILABLE: &str = "Available";
/// Condition type: teardown finished
pub const REMOVED: &str = "Removed";
/// Condition type: the storage medium exists
pub const STORAGE_EXISTS: &str = "StorageExists";
/// Condition type: the storage medium carries operator tags
pub const STORAGE_TAGGED: &str = "StorageTagged";
/// Condition type: server-side encryption is configured
pub const STORAGE_ENCRYPTED: &str = "StorageEncrypted";
/// Condition type: incomplete-upload cleanup is configured
pub const STORAGE_UPLOAD_CLEANUP: &str = "StorageIncompleteUploadCleanupEnabled";

/// Aggregated condition map for one resource
#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    conditions: BTreeMap<String, Condition>,
}

impl ConditionSet {
    /// Build the set from a previous status's condition list
    pub fn from_conditions(existing: &[Condition]) -> Self {
        let mut conditions = BTreeMap::new();
        for condition in existing {
            conditions.insert(condition.type_.clone(), condition.clone());
        }
        Self { conditions }
    }

    /// Set a condition
    ///
    /// `lastTransitionTime` is preserved unless the status value changes;
    /// reason and message refresh in place. Last write wins within a pass.
    pub fn update(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let message = message.into();
        match self.conditions.get_mut(type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = now;
                }
                existing.reason = Some(reason.to_string());
                existing.message = Some(message);
            }
            None => {
                self.conditions.insert(
                    type_.to_string(),
                    Condition {
                        type_: type_.to_string(),
                        status,
                        last_transition_time: now,
                        reason: Some(reason.to_string()),
                        message: Some(message),
                    },
                );
            }
        }
    }

    /// Drop a condition that no longer applies
    pub fn remove(&mut self, type_: &str) {
        self.conditions.remove(type_);
    }

    /// Look up a condition by type
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.conditions.get(type_)
    }

    /// Flatten into the list stored in the status, ordered by type
    pub fn into_vec(self) -> Vec<Condition> {
        self.conditions.into_values().collect()
    }
}

/// Facts folded into the Degraded/Progressing/Available triad
#[derive(Debug, Clone)]
pub struct RollupFacts {
    /// Fatal or configuration problem, as (reason, message)
    pub degraded: Option<(String, String)>,

    /// Descriptions of work still in flight; empty means converged
    pub pending: Vec<String>,

    /// Whether the serving deployment has minimum availability
    pub availability: Availability,
}

/// Availability verdict for the serving deployment
#[derive(Debug, Clone)]
pub enum Availability {
    /// Minimum availability satisfied, with a message
    Available(String),
    /// Not available, as (reason, message)
    Unavailable(String, String),
}

/// Apply the roll-up rule to the triad conditions
///
/// Degraded is True exactly when a fatal fact exists; Progressing is True
/// exactly when work is pending; Available requires both a healthy registry
/// and minimum availability.
pub fn rollup(set: &mut ConditionSet, facts: &RollupFacts, now: DateTime<Utc>) {
    match &facts.degraded {
        Some((reason, message)) => {
            set.update(DEGRADED, ConditionStatus::True, reason, message.clone(), now);
        }
        None => {
            set.update(
                DEGRADED,
                ConditionStatus::False,
                "AsExpected",
                "The registry is operating as expected",
                now,
            );
        }
    }

    if facts.pending.is_empty() {
        set.update(
            PROGRESSING,
            ConditionStatus::False,
            "AsExpected",
            "The deployment matches the desired state",
            now,
        );
    } else {
        set.update(
            PROGRESSING,
            ConditionStatus::True,
            "Reconciling",
            facts.pending.join("; "),
            now,
        );
    }

    match (&facts.degraded, &facts.availability) {
        (None, Availability::Available(message)) => {
            set.update(
                AVAILABLE,
                ConditionStatus::True,
                "MinimumAvailability",
                message.clone(),
                now,
            );
        }
        (Some((reason, message)), _) => {
            set.update(AVAILABLE, ConditionStatus::False, reason, message.clone(), now);
        }
        (None, Availability::Unavailable(reason, message)) => {
            set.update(AVAILABLE, ConditionStatus::False, reason, message.clone(), now);
        }
    }
}
