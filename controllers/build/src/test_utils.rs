//! Test utilities for unit testing the build controller
//!
//! Builders for pools, build configs, builds and credential secrets, plus a
//! pod builder that records what it was asked to build.

use crate::config::BuildControllerConfig;
use crate::error::ControllerError;
use crate::pod_builder::{BuildPodBuilder, BuildPodRequest};
use crate::secrets::{DOCKER_CFG_KEY, DOCKER_CONFIG_JSON_KEY};
use crds::labels::{CONFIGURATION_LABEL, LAYERING_ENABLED_LABEL, POOL_LABEL};
use crds::*;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Configuration with the defaults the controller ships with
pub fn test_config() -> BuildControllerConfig {
    BuildControllerConfig::default()
}

/// Helper to create a test MachinePool
pub fn create_test_pool(name: &str, configuration: &str, opted_in: bool) -> MachinePool {
    let mut labels = BTreeMap::new();
    if opted_in {
        labels.insert(LAYERING_ENABLED_LABEL.to_string(), "true".to_string());
    }
    MachinePool {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation: Some(1),
            labels: Some(labels),
            ..Default::default()
        },
        spec: MachinePoolSpec {
            configuration: LocalReference::new(configuration),
            paused: false,
        },
        status: None,
    }
}

/// Mark a pool Degraded with the given reason
pub fn set_degraded(pool: &mut MachinePool, reason: &str, message: &str) {
    let status = pool.status.get_or_insert_with(Default::default);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_DEGRADED, true, reason, message),
    );
}

/// Helper to create a valid ImageBuildConfig for a pool
pub fn create_test_build_config(name: &str, pool: &str) -> ImageBuildConfig {
    ImageBuildConfig {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: ImageBuildConfigSpec {
            pool_ref: LocalReference::new(pool),
            base_image: "quay.io/fedora/fedora-coreos:stable".to_string(),
            extensions: Vec::new(),
            kernel_type: None,
            push_destination: "quay.io/example/os-images:latest".to_string(),
            base_image_pull_secret: LocalReference::new("pull-secret"),
            push_secret: LocalReference::new("push-secret"),
            containerfile: None,
        },
        status: None,
    }
}

/// Record a built image for `configuration` on a build config
pub fn with_built_image(mut config: ImageBuildConfig, configuration: &str) -> ImageBuildConfig {
    config.status = Some(ImageBuildConfigStatus {
        current_image_pullspec: Some(format!(
            "quay.io/example/os-images@sha256:{}",
            "0".repeat(64)
        )),
        image_digest: Some(format!("sha256:{}", "0".repeat(64))),
        built_configuration: Some(configuration.to_string()),
        last_build: Some(build_name(
            &config.spec.pool_ref.name,
            configuration,
            1,
        )),
        ..Default::default()
    });
    config
}

/// Helper to create an ImageBuild in a given phase
pub fn create_test_build(pool: &str, configuration: &str, version: u64, phase: BuildPhase) -> ImageBuild {
    let name = build_name(pool, configuration, version);
    ImageBuild {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some("default".to_string()),
            labels: Some(BTreeMap::from([
                (POOL_LABEL.to_string(), pool.to_string()),
                (CONFIGURATION_LABEL.to_string(), configuration.to_string()),
            ])),
            ..Default::default()
        },
        spec: ImageBuildSpec {
            pool_ref: LocalReference::new(pool),
            configuration: LocalReference::new(configuration),
            build_config_ref: LocalReference::new(format!("{pool}-build")),
            version,
            rendered_image_pushspec: "quay.io/example/os-images:latest".to_string(),
        },
        status: Some(ImageBuildStatus {
            phase,
            attempt: 1,
            ..Default::default()
        }),
    }
}

/// Give a build the uid the API server would assign
pub fn with_uid(mut build: ImageBuild) -> ImageBuild {
    build.metadata.uid = Some(format!("uid-{}", kube::ResourceExt::name_any(&build)));
    build
}

/// `.dockerconfigjson` payload with one registry entry
pub fn docker_config_json(registry: &str, username: &str, password: &str) -> Vec<u8> {
    serde_json::json!({
        "auths": { registry: { "username": username, "password": password } }
    })
    .to_string()
    .into_bytes()
}

/// Legacy `.dockercfg` payload with one registry entry
pub fn legacy_docker_cfg(registry: &str, username: &str, password: &str) -> Vec<u8> {
    serde_json::json!({
        registry: { "username": username, "password": password }
    })
    .to_string()
    .into_bytes()
}

/// Helper to create a credential secret, in legacy dockercfg format if `legacy`
pub fn create_test_secret(name: &str, registry: &str, legacy: bool) -> Secret {
    let (key, type_, payload) = if legacy {
        (
            DOCKER_CFG_KEY,
            "kubernetes.io/dockercfg",
            legacy_docker_cfg(&format!("https://{registry}/"), "robot", "secret"),
        )
    } else {
        (
            DOCKER_CONFIG_JSON_KEY,
            "kubernetes.io/dockerconfigjson",
            docker_config_json(registry, "robot", "secret"),
        )
    };
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        data: Some(BTreeMap::from([(key.to_string(), ByteString(payload))])),
        ..Default::default()
    }
}

/// Pod builder that records requests and returns a bare pod
#[derive(Debug, Default)]
pub struct RecordingPodBuilder {
    requests: Mutex<Vec<BuildPodRequest>>,
    extra_labels: BTreeMap<String, String>,
}

impl RecordingPodBuilder {
    /// Add a label to every pod on top of the request's own
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.extra_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn requests(&self) -> Vec<BuildPodRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BuildPodBuilder for RecordingPodBuilder {
    fn build_pod(&self, request: &BuildPodRequest) -> Result<Pod, ControllerError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let mut metadata = request.metadata();
        metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(self.extra_labels.clone());
        Ok(Pod {
            metadata,
            ..Default::default()
        })
    }
}
