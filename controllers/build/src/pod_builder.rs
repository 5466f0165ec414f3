//! Build pod construction.
//!
//! The lifecycle tracker only needs "a pod that builds this image"; how that
//! pod looks is behind [`BuildPodBuilder`] so tests can swap in a recorder.

use crate::error::ControllerError;
use crate::validation::canonical_kernel_type;
use crds::labels::{
    BUILD_ANNOTATION, BUILD_LABEL, CONFIGURATION_LABEL, K8S_MANAGED_BY,
    MANAGED_BY_BUILD_CONTROLLER, POOL_ANNOTATION, POOL_LABEL, bounded_label_value,
};
use crds::{ImageBuild, ImageBuildConfig};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use registry_client::ImageReference;
use std::collections::BTreeMap;

const PULL_SECRET_MOUNT: &str = "/var/run/secrets/oslayer/pull";
const PUSH_SECRET_MOUNT: &str = "/var/run/secrets/oslayer/push";
const BUILD_CONTAINER: &str = "image-build";

const BUILD_SCRIPT: &str = r#"set -euo pipefail
workdir="$(mktemp -d)"
printf '%s\n' "$CONTAINERFILE" > "$workdir/Containerfile"
buildah build \
  --storage-driver vfs \
  --authfile "$PULL_AUTHFILE" \
  --file "$workdir/Containerfile" \
  --tag "$PUSH_DESTINATION" \
  "$workdir"
buildah push \
  --storage-driver vfs \
  --authfile "$PUSH_AUTHFILE" \
  --digestfile "$workdir/digest" \
  "$PUSH_DESTINATION"
printf '%s@%s' "$IMAGE_REPOSITORY" "$(cat "$workdir/digest")" > /dev/termination-log
"#;

/// Everything needed to construct the pod for one attempt of a build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildPodRequest {
    pub pod_name: String,
    pub build_name: String,
    pub pool: String,
    pub configuration: String,
    pub attempt: u32,
    pub base_image: String,
    pub push_destination: String,
    pub kernel_type: String,
    pub extensions: Vec<String>,
    pub containerfile: Option<String>,
    /// Canonical secret used to pull the base and build context images
    pub pull_secret: String,
    /// Canonical secret used to push the result
    pub push_secret: String,
    pub owner: OwnerReference,
}

/// Name of the pod driving `attempt` of a build
#[must_use]
pub fn pod_name(build: &str, attempt: u32) -> String {
    format!("{build}-{attempt}")
}

impl BuildPodRequest {
    pub fn new(
        build: &ImageBuild,
        build_config: &ImageBuildConfig,
        attempt: u32,
        pull_secret: &str,
        push_secret: &str,
    ) -> Result<Self, ControllerError> {
        let build_name = build.name_any();
        let owner = build.controller_owner_ref(&()).ok_or_else(|| {
            ControllerError::PodBuild(format!("build {build_name} has no uid yet"))
        })?;
        let spec = &build_config.spec;
        Ok(Self {
            pod_name: pod_name(&build_name, attempt),
            pool: build.spec.pool_ref.name.clone(),
            configuration: build.spec.configuration.name.clone(),
            attempt,
            base_image: spec.base_image.clone(),
            push_destination: build.spec.rendered_image_pushspec.clone(),
            kernel_type: canonical_kernel_type(spec.kernel_type.as_deref())
                .unwrap_or("default")
                .to_string(),
            extensions: spec.extensions.clone(),
            containerfile: spec.containerfile.clone(),
            pull_secret: pull_secret.to_string(),
            push_secret: push_secret.to_string(),
            owner,
            build_name,
        })
    }

    /// Labels every build pod carries; values are bounded to the label limit
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (POOL_LABEL.to_string(), bounded_label_value(&self.pool)),
            (BUILD_LABEL.to_string(), bounded_label_value(&self.build_name)),
            (CONFIGURATION_LABEL.to_string(), bounded_label_value(&self.configuration)),
            (K8S_MANAGED_BY.to_string(), MANAGED_BY_BUILD_CONTROLLER.to_string()),
        ])
    }

    /// Pod metadata shared by every builder
    #[must_use]
    pub fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.pod_name.clone()),
            labels: Some(self.labels()),
            annotations: Some(BTreeMap::from([
                (POOL_ANNOTATION.to_string(), self.pool.clone()),
                (BUILD_ANNOTATION.to_string(), self.build_name.clone()),
            ])),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }
}

/// Constructs the pod that executes a build
pub trait BuildPodBuilder: Send + Sync {
    fn build_pod(&self, request: &BuildPodRequest) -> Result<Pod, ControllerError>;
}

/// Builds images with buildah inside the cluster
#[derive(Debug, Clone)]
pub struct BuildahPodBuilder {
    builder_image: String,
    build_context_image: String,
}

impl BuildahPodBuilder {
    pub fn new(builder_image: impl Into<String>, build_context_image: impl Into<String>) -> Self {
        Self {
            builder_image: builder_image.into(),
            build_context_image: build_context_image.into(),
        }
    }

    /// Containerfile layering the configuration onto the base image
    #[must_use]
    pub fn render_containerfile(&self, request: &BuildPodRequest) -> String {
        let mut lines = vec![
            format!("FROM {} AS context", self.build_context_image),
            format!("FROM {}", request.base_image),
            format!(
                "ENV CONFIGURATION_NAME={} KERNEL_TYPE={} EXTENSIONS=\"{}\"",
                request.configuration,
                request.kernel_type,
                request.extensions.join(" ")
            ),
            "RUN --mount=type=bind,from=context,source=/,target=/run/context \\".to_string(),
            "    /run/context/usr/bin/os-build-context apply \\".to_string(),
            "      --configuration \"$CONFIGURATION_NAME\" \\".to_string(),
            "      --kernel-type \"$KERNEL_TYPE\" \\".to_string(),
            "      --extensions \"$EXTENSIONS\"".to_string(),
        ];
        if let Some(extra) = request.containerfile.as_deref().map(str::trim) {
            if !extra.is_empty() {
                lines.push(extra.to_string());
            }
        }
        lines.push(format!("LABEL {CONFIGURATION_LABEL}={}", request.configuration));
        lines.join("\n")
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

impl BuildPodBuilder for BuildahPodBuilder {
    fn build_pod(&self, request: &BuildPodRequest) -> Result<Pod, ControllerError> {
        let repository = ImageReference::parse(&request.push_destination)
            .map_err(|e| ControllerError::PodBuild(e.to_string()))?
            .repository_pullspec();

        Ok(Pod {
            metadata: request.metadata(),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: BUILD_CONTAINER.to_string(),
                    image: Some(self.builder_image.clone()),
                    command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
                    args: Some(vec![BUILD_SCRIPT.to_string()]),
                    env: Some(vec![
                        env("CONTAINERFILE", self.render_containerfile(request)),
                        env("PUSH_DESTINATION", request.push_destination.clone()),
                        env("IMAGE_REPOSITORY", repository),
                        env("PULL_AUTHFILE", format!("{PULL_SECRET_MOUNT}/.dockerconfigjson")),
                        env("PUSH_AUTHFILE", format!("{PUSH_SECRET_MOUNT}/.dockerconfigjson")),
                        env("BUILDAH_ISOLATION", "chroot"),
                    ]),
                    volume_mounts: Some(vec![
                        read_only_mount("pull-secret", PULL_SECRET_MOUNT),
                        read_only_mount("push-secret", PUSH_SECRET_MOUNT),
                    ]),
                    termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                    ..Default::default()
                }],
                volumes: Some(vec![
                    secret_volume("pull-secret", &request.pull_secret),
                    secret_volume("push-secret", &request.push_secret),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
