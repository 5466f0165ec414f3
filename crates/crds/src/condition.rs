//! Status conditions shared by all OSLayer resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pool or build config cannot make progress until an operator intervenes
pub const CONDITION_DEGRADED: &str = "Degraded";
/// A build for the pool is in flight
pub const CONDITION_BUILDING: &str = "Building";
/// Build config has a usable image for its pool
pub const CONDITION_READY: &str = "Ready";
/// Outcome of the last image pruning pass for a build config
pub const CONDITION_IMAGE_PRUNED: &str = "ImagePruned";

/// A build ran out of attempts
pub const REASON_BUILD_FAILED: &str = "BuildFailed";
/// Build config inputs cannot be used to start a build
pub const REASON_INVALID_BUILD_CONFIG: &str = "InvalidBuildConfig";
/// Build completed and its image was recorded
pub const REASON_BUILD_SUCCEEDED: &str = "BuildSucceeded";
/// Build in progress
pub const REASON_BUILD_IN_PROGRESS: &str = "BuildInProgress";
/// Build stopped for reasons outside the build itself
pub const REASON_BUILD_INTERRUPTED: &str = "BuildInterrupted";
/// Pruning pass finished without report-worthy failures
pub const REASON_PRUNE_SUCCEEDED: &str = "PruneSucceeded";
/// Pruning pass hit failures that were not tolerable
pub const REASON_PRUNE_FAILED: &str = "PruneFailed";

/// Status value for a condition that holds
pub const STATUS_TRUE: &str = "True";
/// Status value for a condition that does not hold
pub const STATUS_FALSE: &str = "False";

/// Condition represents one observation about a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Last time the status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    /// Create a condition stamped with the current time
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    /// True if the status is `"True"`
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == STATUS_TRUE
    }

    /// True if the reason equals `reason`
    #[must_use]
    pub fn has_reason(&self, reason: &str) -> bool {
        self.reason.as_deref() == Some(reason)
    }
}

/// Find a condition by type
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// True if a condition of this type exists and holds
#[must_use]
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(Condition::is_true)
}

/// Insert or replace a condition. Returns false when nothing observable changed.
///
/// The transition time is only moved when the status flips, so re-asserting an
/// unchanged condition is a no-op.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            let transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..condition
            };
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Remove a condition by type. Returns true if one was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.r#type != condition_type);
    conditions.len() != before
}
