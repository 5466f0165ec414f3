//! ImageBuild CRD
//!
//! One attempt to produce an image for a specific (pool, configuration) pair.
//! The spec is fixed at creation; the build controller drives the status.

use crate::condition::Condition;
use crate::references::LocalReference;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "ImageBuild",
    namespaced,
    status = "ImageBuildStatus",
    shortname = "ib",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolRef.name"}"#,
    printcolumn = r#"{"name":"Configuration","type":"string","jsonPath":".spec.configuration.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Attempt","type":"integer","jsonPath":".status.attempt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildSpec {
    /// Pool the build belongs to
    pub pool_ref: LocalReference,

    /// Configuration being built
    pub configuration: LocalReference,

    /// Build config the build was created from
    pub build_config_ref: LocalReference,

    /// Monotonic per-pool build number
    pub version: u64,

    /// Tagged pullspec the image is pushed to
    pub rendered_image_pushspec: String,
}

/// Lifecycle phase of a build
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub enum BuildPhase {
    /// Created, waiting for its pod to run
    #[default]
    Pending,
    /// Build pod is running
    Running,
    /// Image built, pushed and recorded
    Succeeded,
    /// Build pod failed and the attempt budget is spent
    Failed,
    /// Stopped by something outside the build (eviction, node loss)
    Interrupted,
}

impl BuildPhase {
    /// Every phase, in lifecycle order
    pub const ALL: [BuildPhase; 5] = [
        BuildPhase::Pending,
        BuildPhase::Running,
        BuildPhase::Succeeded,
        BuildPhase::Failed,
        BuildPhase::Interrupted,
    ];

    /// Terminal phases never change again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildPhase::Succeeded | BuildPhase::Failed | BuildPhase::Interrupted
        )
    }

    /// Phase name as written to conditions
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::Pending => "Pending",
            BuildPhase::Running => "Running",
            BuildPhase::Succeeded => "Succeeded",
            BuildPhase::Failed => "Failed",
            BuildPhase::Interrupted => "Interrupted",
        }
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BuildPhase,

    /// One condition per phase; exactly one holds
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// 1-based attempt counter
    #[serde(default)]
    pub attempt: u32,

    /// Earliest time the next attempt's pod may be created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_time: Option<DateTime<Utc>>,

    /// Pod driving the current attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ref: Option<LocalReference>,

    /// When the build was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the build reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Digested pullspec of the produced image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pullspec: Option<String>,

    /// Digest of the produced image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,

    /// Human-readable detail about the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ImageBuild {
    /// Current phase; a build without status is Pending
    #[must_use]
    pub fn phase(&self) -> BuildPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// True once the build can no longer change
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Name of the configuration being built
    #[must_use]
    pub fn configuration(&self) -> &str {
        &self.spec.configuration.name
    }

    /// Pod driving the current attempt
    #[must_use]
    pub fn pod_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.pod_ref.as_ref())
            .map(|r| r.name.as_str())
    }

    /// Digested pullspec of the produced image
    #[must_use]
    pub fn image_pullspec(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.image_pullspec.as_deref())
    }
}

/// Deterministic build name for a pool, configuration and version
#[must_use]
pub fn build_name(pool: &str, configuration: &str, version: u64) -> String {
    format!("{pool}-{configuration}-{version}")
}
