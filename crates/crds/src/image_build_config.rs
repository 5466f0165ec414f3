//! ImageBuildConfig CRD
//!
//! Declares how to build a custom OS image for one pool. One build config per
//! pool by convention, matched through `spec.poolRef`.

use crate::condition::Condition;
use crate::references::LocalReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "osbuild.microscaler.io",
    version = "v1alpha1",
    kind = "ImageBuildConfig",
    namespaced,
    status = "ImageBuildConfigStatus",
    shortname = "ibc",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolRef.name"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".status.currentImagePullspec"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildConfigSpec {
    /// Pool this build config produces images for
    pub pool_ref: LocalReference,

    /// Base OS image pullspec
    pub base_image: String,

    /// Extensions to layer on top of the base image
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Kernel variant (`default`, `realtime`, `64k-pages`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_type: Option<String>,

    /// Tagged pullspec the built image is pushed to
    pub push_destination: String,

    /// Secret with credentials for pulling the base image
    pub base_image_pull_secret: LocalReference,

    /// Secret with credentials for pushing the built image
    pub push_secret: LocalReference,

    /// Extra Containerfile instructions appended to the generated ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containerfile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildConfigStatus {
    /// Digested pullspec of the most recent successful build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image_pullspec: Option<String>,

    /// Digest of the most recent successful build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,

    /// Configuration the current image was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_configuration: Option<String>,

    /// Name of the build that produced the current image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build: Option<String>,

    /// Conditions (`Ready`, `ImagePruned`)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ImageBuildConfig {
    /// Digested pullspec of the current image, if one was recorded
    #[must_use]
    pub fn current_image(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_image_pullspec.as_deref())
    }

    /// Configuration the current image was built from
    #[must_use]
    pub fn built_configuration(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.built_configuration.as_deref())
    }

    /// Status conditions, empty when no status has been written
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }
}
