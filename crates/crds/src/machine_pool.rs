//! MachinePool CRD
//!
//! A named group of machines sharing one configuration lifecycle. Operators own
//! the spec and labels; the build controller owns the status.

use crate::condition::{CONDITION_DEGRADED, Condition, find_condition};
use crate::labels::{LAYERING_ENABLED_LABEL, REBUILD_LABEL, label_enabled};
use crate::references::LocalReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "MachinePool",
    namespaced,
    status = "MachinePoolStatus",
    shortname = "mpool",
    printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.configuration.name"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.configuration.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolSpec {
    /// Desired (rendered) configuration for the pool
    pub configuration: LocalReference,

    /// Operator pause marker; informational for the build controller
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolStatus {
    /// Configuration whose image has been built and applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<LocalReference>,

    /// Pool conditions (`Degraded`, `Building`)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MachinePool {
    /// Name of the desired configuration
    #[must_use]
    pub fn desired_configuration(&self) -> &str {
        &self.spec.configuration.name
    }

    /// Name of the applied configuration, if any
    #[must_use]
    pub fn applied_configuration(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.configuration.as_ref())
            .map(|c| c.name.as_str())
    }

    /// Status conditions, empty when no status has been written
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    /// The `Degraded` condition, when it holds
    #[must_use]
    pub fn degraded(&self) -> Option<&Condition> {
        find_condition(self.conditions(), CONDITION_DEGRADED).filter(|c| c.is_true())
    }

    /// True if the pool is opted into image building
    #[must_use]
    pub fn is_layering_enabled(&self) -> bool {
        label_enabled(self.metadata.labels.as_ref(), LAYERING_ENABLED_LABEL)
    }

    /// True if an operator asked for the current configuration to be rebuilt
    #[must_use]
    pub fn rebuild_requested(&self) -> bool {
        label_enabled(self.metadata.labels.as_ref(), REBUILD_LABEL)
    }
}
