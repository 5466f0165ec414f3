//! Build lifecycle tracker.
//!
//! Drives an `ImageBuild` through `Pending -> Running -> {Succeeded | Failed |
//! Interrupted}` by observing its build pod. All state lives in the build's
//! status, so a restarted controller resumes from whatever it observes.

use crate::config::BuildControllerConfig;
use crate::decision::is_controller_reason;
use crate::error::ControllerError;
use crate::pod_builder::{BuildPodBuilder, BuildPodRequest};
use crate::secrets::SecretCanonicalizer;
use crate::store::{
    ClusterStore, StoreError, modify_build_config_status, modify_build_status, modify_pool_status,
};
use chrono::Utc;
use crds::labels::{
    CONFIGURATION_LABEL, K8S_MANAGED_BY, MANAGED_BY_BUILD_CONTROLLER, POOL_LABEL,
    bounded_label_value,
};
use crds::{
    BuildPhase, CONDITION_BUILDING, CONDITION_DEGRADED, CONDITION_READY, Condition, ImageBuild,
    ImageBuildConfig, ImageBuildSpec, ImageBuildStatus, LocalReference, MachinePool,
    MachinePoolStatus, REASON_BUILD_FAILED, REASON_BUILD_IN_PROGRESS, REASON_BUILD_INTERRUPTED,
    REASON_BUILD_SUCCEEDED, build_name, find_condition, remove_condition, set_condition,
};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Allowed phase changes. Pending reaches Succeeded only through Running.
pub const TRANSITIONS: [(BuildPhase, BuildPhase); 6] = [
    (BuildPhase::Pending, BuildPhase::Running),
    (BuildPhase::Pending, BuildPhase::Failed),
    (BuildPhase::Pending, BuildPhase::Interrupted),
    (BuildPhase::Running, BuildPhase::Succeeded),
    (BuildPhase::Running, BuildPhase::Failed),
    (BuildPhase::Running, BuildPhase::Interrupted),
];

/// Pod failure reasons that mean the work was cut short rather than failed
const INTERRUPTION_REASONS: [&str; 5] = ["Evicted", "NodeLost", "Shutdown", "NodeShutdown", "Terminated"];

/// Container waiting reasons that will not resolve by themselves
const FATAL_WAITING_REASONS: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
    "InvalidImageName",
];

/// Reject phase changes outside [`TRANSITIONS`]
pub fn validate_transition(
    build: &str,
    from: BuildPhase,
    to: BuildPhase,
) -> Result<(), ControllerError> {
    if TRANSITIONS.contains(&(from, to)) {
        Ok(())
    } else {
        Err(ControllerError::InvalidTransition {
            build: build.to_string(),
            from,
            to,
        })
    }
}

/// Move a build's status to `to`, recording one condition per phase.
///
/// Returns false if the build is already in `to`.
pub fn transition(
    build: &str,
    status: &mut ImageBuildStatus,
    to: BuildPhase,
    reason: &str,
    message: &str,
) -> Result<bool, ControllerError> {
    let from = status.phase;
    if from == to {
        return Ok(false);
    }
    validate_transition(build, from, to)?;
    set_condition(&mut status.conditions, Condition::new(from.as_str(), false, reason, message));
    set_condition(&mut status.conditions, Condition::new(to.as_str(), true, reason, message));
    status.phase = to;
    status.message = Some(message.to_string());
    if to.is_terminal() {
        status.end_time = Some(Utc::now());
        status.next_attempt_time = None;
    }
    Ok(true)
}

/// What the build pod says about the current attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodObservation {
    Pending,
    Running,
    /// Digested pullspec of the pushed image
    Succeeded(String),
    AttemptFailed(String),
    Interrupted(String),
}

/// Classify a build pod; `None` means it is gone
#[must_use]
pub fn observe_pod(pod: Option<&Pod>) -> PodObservation {
    let Some(pod) = pod else {
        return PodObservation::Interrupted("build pod disappeared".to_string());
    };
    if pod.metadata.deletion_timestamp.is_some() {
        return PodObservation::Interrupted(format!("build pod {} is being deleted", pod.name_any()));
    }
    let Some(status) = pod.status.as_ref() else {
        return PodObservation::Pending;
    };
    let container_statuses = status.container_statuses.as_deref().unwrap_or_default();

    match status.phase.as_deref() {
        Some("Running") => PodObservation::Running,
        // The kubelet stopped reporting; the node is lost
        Some("Unknown") => PodObservation::Interrupted(format!(
            "build pod {} is in phase Unknown: {}",
            pod.name_any(),
            status.message.as_deref().unwrap_or("node unreachable")
        )),
        Some("Succeeded") => {
            let image = container_statuses
                .iter()
                .filter_map(|c| c.state.as_ref()?.terminated.as_ref()?.message.as_deref())
                .map(str::trim)
                .find(|m| m.contains("@sha256:") || m.contains("@sha512:"));
            match image {
                Some(image) => PodObservation::Succeeded(image.to_string()),
                None => PodObservation::AttemptFailed(
                    "build pod succeeded without reporting an image digest".to_string(),
                ),
            }
        }
        Some("Failed") => {
            let reason = status.reason.as_deref().unwrap_or_default();
            let message = status
                .message
                .clone()
                .or_else(|| {
                    container_statuses.iter().find_map(|c| {
                        let terminated = c.state.as_ref()?.terminated.as_ref()?;
                        Some(terminated.message.clone().unwrap_or_else(|| {
                            format!("container {} exited with code {}", c.name, terminated.exit_code)
                        }))
                    })
                })
                .unwrap_or_else(|| "build pod failed".to_string());
            if INTERRUPTION_REASONS.contains(&reason) {
                PodObservation::Interrupted(format!("{reason}: {message}"))
            } else {
                PodObservation::AttemptFailed(message.trim().to_string())
            }
        }
        _ => container_statuses
            .iter()
            .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
            .find(|w| {
                w.reason
                    .as_deref()
                    .is_some_and(|r| FATAL_WAITING_REASONS.contains(&r))
            })
            .map_or(PodObservation::Pending, |w| {
                PodObservation::AttemptFailed(format!(
                    "{}: {}",
                    w.reason.as_deref().unwrap_or_default(),
                    w.message.as_deref().unwrap_or_default()
                ))
            }),
    }
}

/// Split `repo@digest` into its digest
fn digest_of(pullspec: &str) -> Option<&str> {
    pullspec.split_once('@').map(|(_, digest)| digest)
}

/// Drives builds from creation to a terminal phase
#[derive(Clone)]
pub struct BuildTracker {
    store: Arc<dyn ClusterStore>,
    pod_builder: Arc<dyn BuildPodBuilder>,
    canonicalizer: SecretCanonicalizer,
    max_retries: u32,
    update_delay: Duration,
}

impl BuildTracker {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        pod_builder: Arc<dyn BuildPodBuilder>,
        canonicalizer: SecretCanonicalizer,
        config: &BuildControllerConfig,
    ) -> Self {
        Self {
            store,
            pod_builder,
            canonicalizer,
            max_retries: config.max_retries.max(1),
            update_delay: config.update_delay,
        }
    }

    /// Create the next build of the pool's desired configuration and launch its first pod.
    pub async fn start_build(
        &self,
        pool: &MachinePool,
        build_config: &ImageBuildConfig,
        existing: &[ImageBuild],
    ) -> Result<ImageBuild, ControllerError> {
        let pool_name = pool.name_any();
        let configuration = pool.desired_configuration();
        let version = existing.iter().map(|b| b.spec.version).max().unwrap_or(0) + 1;
        let name = build_name(&pool_name, configuration, version);

        let build = ImageBuild {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([
                    (POOL_LABEL.to_string(), bounded_label_value(&pool_name)),
                    (CONFIGURATION_LABEL.to_string(), bounded_label_value(configuration)),
                    (K8S_MANAGED_BY.to_string(), MANAGED_BY_BUILD_CONTROLLER.to_string()),
                ])),
                ..Default::default()
            },
            spec: ImageBuildSpec {
                pool_ref: LocalReference::new(&pool_name),
                configuration: LocalReference::new(configuration),
                build_config_ref: LocalReference::new(build_config.name_any()),
                version,
                rendered_image_pushspec: build_config.spec.push_destination.clone(),
            },
            status: None,
        };

        match self.store.create_build(&build).await {
            Ok(_) => info!("Created build {} for pool {}", name, pool_name),
            Err(StoreError::AlreadyExists { .. }) => {
                let found = self.store.get_build(&name).await?;
                if found.spec.pool_ref.name != pool_name || found.configuration() != configuration {
                    return Err(ControllerError::BuildNameCollision {
                        configuration: found.configuration().to_string(),
                        pool: found.spec.pool_ref.name,
                        build: name,
                    });
                }
                debug!("Build {} already exists", name);
            }
            Err(e) => return Err(e.into()),
        }

        let build = modify_build_status(self.store.as_ref(), &name, |build| {
            if build.status.as_ref().is_some_and(|s| s.attempt > 0) {
                return Ok(false);
            }
            let status = build.status.get_or_insert_with(Default::default);
            status.phase = BuildPhase::Pending;
            status.attempt = 1;
            status.start_time = Some(Utc::now());
            set_condition(
                &mut status.conditions,
                Condition::new(
                    BuildPhase::Pending.as_str(),
                    true,
                    REASON_BUILD_IN_PROGRESS,
                    format!("building {configuration}"),
                ),
            );
            Ok(true)
        })
        .await?;

        let message = format!("building {configuration} in {name}");
        modify_pool_status(self.store.as_ref(), &pool_name, |status| {
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_BUILDING, true, REASON_BUILD_IN_PROGRESS, message.as_str()),
            )
        })
        .await?;

        self.launch_attempt(&build).await?;
        self.store.get_build(&name).await.map_err(Into::into)
    }

    /// Observe a non-terminal build's pod and advance the build.
    ///
    /// Returns when to look again, or `None` once the build is terminal.
    pub async fn sync_build(&self, build: &ImageBuild) -> Result<Option<Duration>, ControllerError> {
        if build.is_terminal() {
            return Ok(None);
        }
        let name = build.name_any();

        let Some(pod_name) = build.pod_name() else {
            let next_attempt = build.status.as_ref().and_then(|s| s.next_attempt_time);
            if let Some(wait) = next_attempt.and_then(|t| (t - Utc::now()).to_std().ok()) {
                debug!("Build {} waits {:?} before its next attempt", name, wait);
                return Ok(Some(wait));
            }
            return self.launch_attempt(build).await;
        };

        let pod = self.store.get_pod(pod_name).await?;
        match observe_pod(pod.as_ref()) {
            PodObservation::Pending => Ok(Some(self.update_delay)),
            PodObservation::Running => {
                modify_build_status(self.store.as_ref(), &name, |build| {
                    let status = build.status.get_or_insert_with(Default::default);
                    transition(
                        &name,
                        status,
                        BuildPhase::Running,
                        REASON_BUILD_IN_PROGRESS,
                        "build pod is running",
                    )
                })
                .await?;
                Ok(Some(self.update_delay))
            }
            PodObservation::Succeeded(image) => {
                self.complete(build, &image).await?;
                Ok(None)
            }
            PodObservation::AttemptFailed(message) => self.attempt_failed(build, &message).await,
            PodObservation::Interrupted(message) => {
                self.interrupt(build, &message).await?;
                Ok(None)
            }
        }
    }

    /// Finish pool bookkeeping for a build that succeeded before the pool status was written.
    pub async fn repair_applied_configuration(
        &self,
        pool: &MachinePool,
        build_config: &ImageBuildConfig,
        builds: &[ImageBuild],
    ) -> Result<(), ControllerError> {
        let Some(last) = build_config.status.as_ref().and_then(|s| s.last_build.as_deref()) else {
            return Ok(());
        };
        let Some(build) = builds.iter().find(|b| b.name_any() == last) else {
            return Ok(());
        };
        if build.phase() != BuildPhase::Succeeded
            || pool.applied_configuration() == Some(build.configuration())
            || !crds::is_condition_true(pool.conditions(), CONDITION_BUILDING)
        {
            return Ok(());
        }
        info!("Recording applied configuration {} on pool {}", build.configuration(), pool.name_any());
        self.record_on_pool(&pool.name_any(), build).await
    }

    /// Create the pod for the build's current attempt
    async fn launch_attempt(&self, build: &ImageBuild) -> Result<Option<Duration>, ControllerError> {
        let name = build.name_any();
        let pool_name = &build.spec.pool_ref.name;
        let attempt = build.status.as_ref().map_or(1, |s| s.attempt.max(1));

        let pool = self.store.get_pool(pool_name).await?;
        if let Some(degraded) = pool.degraded() {
            if !is_controller_reason(degraded.reason.as_deref()) {
                info!("Pool {} is degraded; not creating a pod for build {}", pool_name, name);
                return Ok(Some(self.update_delay));
            }
        }

        let config_name = &build.spec.build_config_ref.name;
        let build_config = match self.store.get_build_config(config_name).await {
            Ok(config) => config,
            Err(StoreError::NotFound { .. }) => {
                self.interrupt(build, &format!("build config {config_name} was deleted"))
                    .await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let pull = self
            .canonicalizer
            .canonicalize(&build_config.spec.base_image_pull_secret.name)
            .await;
        let push = self.canonicalizer.canonicalize(&build_config.spec.push_secret.name).await;
        let (pull, push) = match (pull, push) {
            (Ok(pull), Ok(push)) => (pull, push),
            (Err(e), _) | (_, Err(e)) if e.is_input_error() => {
                return self.attempt_failed(build, &e.to_string()).await;
            }
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        let request = BuildPodRequest::new(
            build,
            &build_config,
            attempt,
            &pull.name_any(),
            &push.name_any(),
        )?;
        let pod = self.pod_builder.build_pod(&request)?;
        match self.store.create_pod(&pod).await {
            Ok(_) => info!("Created pod {} for build {} (attempt {})", request.pod_name, name, attempt),
            Err(StoreError::AlreadyExists { .. }) => debug!("Pod {} already exists", request.pod_name),
            Err(StoreError::Invalid { message, .. }) => {
                let message = format!("build pod {} rejected: {message}", request.pod_name);
                return self.attempt_failed(build, &message).await;
            }
            Err(e) => return Err(e.into()),
        }

        let pod_name = request.pod_name.as_str();
        modify_build_status(self.store.as_ref(), &name, |build| {
            let status = build.status.get_or_insert_with(Default::default);
            if status.pod_ref.as_ref().is_some_and(|p| p.name == pod_name) {
                return Ok(false);
            }
            status.pod_ref = Some(LocalReference::new(pod_name));
            status.next_attempt_time = None;
            Ok(true)
        })
        .await?;
        Ok(Some(self.update_delay))
    }

    /// Retry the build or, once its attempts are used up, fail it
    async fn attempt_failed(
        &self,
        build: &ImageBuild,
        message: &str,
    ) -> Result<Option<Duration>, ControllerError> {
        let name = build.name_any();
        let attempt = build.status.as_ref().map_or(1, |s| s.attempt.max(1));
        if attempt >= self.max_retries {
            self.fail(build, attempt, message).await?;
            return Ok(None);
        }

        warn!(
            "Build {} attempt {}/{} failed: {}",
            name, attempt, self.max_retries, message
        );
        let delay = chrono::Duration::from_std(self.update_delay)
            .map_err(|e| ControllerError::InvalidConfig(format!("update delay: {e}")))?;
        let next_attempt = Utc::now() + delay;
        let retry_message = format!("attempt {attempt} failed: {message}");
        let old_pod = build.pod_name().map(str::to_string);
        modify_build_status(self.store.as_ref(), &name, |build| {
            let status = build.status.get_or_insert_with(Default::default);
            if status.attempt != attempt {
                return Ok(false);
            }
            status.attempt = attempt + 1;
            status.pod_ref = None;
            status.next_attempt_time = Some(next_attempt);
            status.message = Some(retry_message.clone());
            Ok(true)
        })
        .await?;

        if let Some(pod) = old_pod {
            if let Err(e) = self.store.delete_pod(&pod).await {
                warn!("Failed to delete pod {} of build {}: {}", pod, name, e);
            }
        }
        Ok(Some(self.update_delay))
    }

    async fn fail(&self, build: &ImageBuild, attempts: u32, message: &str) -> Result<(), ControllerError> {
        let name = build.name_any();
        let configuration = build.configuration();
        let degraded_message = format!(
            "build {name} for {configuration} failed after {attempts} attempt(s): {message}"
        );
        warn!("{}", degraded_message);

        modify_pool_status(self.store.as_ref(), &build.spec.pool_ref.name, |status| {
            let mut changed = set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_BUILDING, false, REASON_BUILD_FAILED, degraded_message.as_str()),
            );
            let external = find_condition(&status.conditions, CONDITION_DEGRADED)
                .is_some_and(|c| c.is_true() && !is_controller_reason(c.reason.as_deref()));
            if !external {
                changed |= set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_DEGRADED, true, REASON_BUILD_FAILED, degraded_message.as_str()),
                );
            }
            changed
        })
        .await?;

        self.mark_config_not_ready(build, &degraded_message).await?;

        modify_build_status(self.store.as_ref(), &name, |build| {
            let status = build.status.get_or_insert_with(Default::default);
            transition(&name, status, BuildPhase::Failed, REASON_BUILD_FAILED, message)
        })
        .await?;
        Ok(())
    }

    async fn interrupt(&self, build: &ImageBuild, message: &str) -> Result<(), ControllerError> {
        let name = build.name_any();
        info!("Build {} interrupted: {}", name, message);

        modify_pool_status(self.store.as_ref(), &build.spec.pool_ref.name, |status| {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_BUILDING,
                    false,
                    REASON_BUILD_INTERRUPTED,
                    format!("build {name} interrupted: {message}"),
                ),
            )
        })
        .await?;

        modify_build_status(self.store.as_ref(), &name, |build| {
            let status = build.status.get_or_insert_with(Default::default);
            transition(&name, status, BuildPhase::Interrupted, REASON_BUILD_INTERRUPTED, message)
        })
        .await?;
        Ok(())
    }

    /// Record a pushed image: build config first, then the build, then the pool
    async fn complete(&self, build: &ImageBuild, image: &str) -> Result<(), ControllerError> {
        let name = build.name_any();
        let configuration = build.configuration();
        let digest = digest_of(image).map(str::to_string);
        let config_name = &build.spec.build_config_ref.name;

        let recorded = modify_build_config_status(self.store.as_ref(), config_name, |status| {
            let mut changed = false;
            if status.current_image_pullspec.as_deref() != Some(image)
                || status.built_configuration.as_deref() != Some(configuration)
                || status.last_build.as_deref() != Some(name.as_str())
            {
                status.current_image_pullspec = Some(image.to_string());
                status.image_digest.clone_from(&digest);
                status.built_configuration = Some(configuration.to_string());
                status.last_build = Some(name.clone());
                changed = true;
            }
            changed |= set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_READY,
                    true,
                    REASON_BUILD_SUCCEEDED,
                    format!("image for {configuration} built by {name}"),
                ),
            );
            changed
        })
        .await;
        match recorded {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return self
                    .interrupt(build, &format!("build config {config_name} was deleted"))
                    .await;
            }
            Err(e) => return Err(e),
        }

        let build = modify_build_status(self.store.as_ref(), &name, |build| {
            let status = build.status.get_or_insert_with(Default::default);
            if status.phase == BuildPhase::Pending {
                transition(
                    &name,
                    status,
                    BuildPhase::Running,
                    REASON_BUILD_IN_PROGRESS,
                    "build pod is running",
                )?;
            }
            status.image_pullspec = Some(image.to_string());
            status.image_digest.clone_from(&digest);
            transition(
                &name,
                status,
                BuildPhase::Succeeded,
                REASON_BUILD_SUCCEEDED,
                &format!("pushed {image}"),
            )
        })
        .await?;
        info!("Build {} succeeded: {}", name, image);

        self.record_on_pool(&build.spec.pool_ref.name, &build).await
    }

    async fn record_on_pool(&self, pool: &str, build: &ImageBuild) -> Result<(), ControllerError> {
        let name = build.name_any();
        let configuration = build.configuration();
        modify_pool_status(self.store.as_ref(), pool, |status| {
            apply_success(status, configuration, &name)
        })
        .await?;
        Ok(())
    }

    async fn mark_config_not_ready(&self, build: &ImageBuild, message: &str) -> Result<(), ControllerError> {
        let result = modify_build_config_status(
            self.store.as_ref(),
            &build.spec.build_config_ref.name,
            |status| {
                set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_READY, false, REASON_BUILD_FAILED, message),
                )
            },
        )
        .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

/// Pool status after a successful build of `configuration`
fn apply_success(status: &mut MachinePoolStatus, configuration: &str, build: &str) -> bool {
    let mut changed = false;
    if status.configuration.as_ref().map(|c| c.name.as_str()) != Some(configuration) {
        status.configuration = Some(LocalReference::new(configuration));
        changed = true;
    }
    changed |= set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_BUILDING,
            false,
            REASON_BUILD_SUCCEEDED,
            format!("build {build} succeeded"),
        ),
    );
    let owned_degraded = find_condition(&status.conditions, CONDITION_DEGRADED)
        .is_some_and(|c| is_controller_reason(c.reason.as_deref()));
    if owned_degraded {
        changed |= remove_condition(&mut status.conditions, CONDITION_DEGRADED);
    }
    changed
}
