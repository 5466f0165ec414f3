//! Per-pool reconciliation.
//!
//! One pass: advance any in-flight build, re-read the pool and its inputs,
//! ask the decision engine what to do and do it. Everything is read fresh
//! from the store; nothing is taken from the watch cache.

use crate::backoff::ErrorBackoff;
use crate::config::BuildControllerConfig;
use crate::decision::{Decision, DecisionInput, NoOpReason, decide, is_controller_reason};
use crate::error::ControllerError;
use crate::lifecycle::BuildTracker;
use crate::pod_builder::BuildPodBuilder;
use crate::secrets::SecretCanonicalizer;
use crate::store::{
    ClusterStore, modify_build_config_status, modify_pool_status, retry_on_conflict,
};
use crate::validation::validate_build_config;
use crds::labels::REBUILD_LABEL;
use crds::{
    CONDITION_DEGRADED, CONDITION_READY, Condition, ImageBuildConfig, REASON_INVALID_BUILD_CONFIG,
    find_condition, remove_condition, set_condition,
};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconciles MachinePools.
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    tracker: BuildTracker,
    canonicalizer: SecretCanonicalizer,
    update_delay: Duration,
    resync_interval: Duration,
    /// Per-pool error backoff used by the controller's error policy
    pub backoff: ErrorBackoff,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        pod_builder: Arc<dyn BuildPodBuilder>,
        config: &BuildControllerConfig,
    ) -> Self {
        let canonicalizer = SecretCanonicalizer::new(store.clone());
        let tracker = BuildTracker::new(store.clone(), pod_builder, canonicalizer.clone(), config);
        Self {
            store,
            tracker,
            canonicalizer,
            update_delay: config.update_delay,
            resync_interval: config.resync_interval,
            backoff: ErrorBackoff::default(),
        }
    }

    /// Reconcile one pool. Returns when to requeue it, `None` if it no longer exists.
    pub async fn reconcile_pool(&self, name: &str) -> Result<Option<Duration>, ControllerError> {
        // Advance in-flight builds before deciding anything
        let mut next_sync: Option<Duration> = None;
        for build in self.store.list_builds(name).await? {
            if build.is_terminal() {
                continue;
            }
            if let Some(wait) = self.tracker.sync_build(&build).await? {
                next_sync = Some(next_sync.map_or(wait, |current| current.min(wait)));
            }
        }

        let pool = match self.store.get_pool(name).await {
            Ok(pool) => pool,
            Err(e) => {
                let e = ControllerError::from(e);
                if e.is_not_found() {
                    debug!("Pool {} no longer exists", name);
                    return Ok(None);
                }
                return Err(e);
            }
        };

        let mut build_configs: Vec<ImageBuildConfig> = self
            .store
            .list_build_configs()
            .await?
            .into_iter()
            .filter(|c| c.spec.pool_ref.name == name)
            .collect();
        build_configs.sort_by_key(ResourceExt::name_any);
        let build_config = build_configs.first();
        let builds = self.store.list_builds(name).await?;

        if let Some(build_config) = build_config {
            self.tracker
                .repair_applied_configuration(&pool, build_config, &builds)
                .await?;
        }

        let mut problems = Vec::new();
        let validated = pool.is_layering_enabled() && build_config.is_some();
        if let (true, Some(build_config)) = (validated, build_config) {
            if build_configs.len() > 1 {
                let names: Vec<String> = build_configs.iter().map(ResourceExt::name_any).collect();
                problems.push(format!(
                    "multiple build configs reference pool {name}: {}",
                    names.join(", ")
                ));
            }
            problems.extend(validate_build_config(build_config));
            for (field, secret) in [
                ("baseImagePullSecret", &build_config.spec.base_image_pull_secret.name),
                ("pushSecret", &build_config.spec.push_secret.name),
            ] {
                if secret.trim().is_empty() {
                    continue;
                }
                match self.canonicalizer.canonicalize(secret).await {
                    Ok(_) => {}
                    Err(e) if e.is_input_error() => problems.push(format!("{field}: {e}")),
                    Err(e) => return Err(e),
                }
            }
        }

        let decision = decide(&DecisionInput {
            pool: &pool,
            build_config,
            builds: &builds,
            problems: &problems,
        });
        info!("Pool {}: {}", name, decision);

        match decision {
            Decision::MarkDegraded(message) => {
                if let Some(build_config) = build_config {
                    self.mark_invalid(name, &build_config.name_any(), &message).await?;
                }
            }
            Decision::StartBuild(reason) => {
                if let Some(build_config) = build_config {
                    self.clear_invalid(&pool, build_config).await?;
                    let build = self.tracker.start_build(&pool, build_config, &builds).await?;
                    info!("Started build {} for pool {} ({})", build.name_any(), name, reason);
                    if pool.rebuild_requested() {
                        self.remove_rebuild_label(name).await?;
                    }
                    return Ok(Some(self.update_delay));
                }
            }
            Decision::NoOp(reason) => {
                if let (true, Some(build_config)) = (validated, build_config) {
                    self.clear_invalid(&pool, build_config).await?;
                }
                // The in-flight build already produces what the rebuild asks for
                if matches!(reason, NoOpReason::BuildInFlight(_)) && pool.rebuild_requested() {
                    self.remove_rebuild_label(name).await?;
                }
            }
        }

        if builds.iter().any(|b| !b.is_terminal()) {
            return Ok(Some(next_sync.unwrap_or(self.update_delay)));
        }
        Ok(Some(self.resync_interval))
    }

    async fn mark_invalid(
        &self,
        pool: &str,
        build_config: &str,
        message: &str,
    ) -> Result<(), ControllerError> {
        warn!("Pool {} has an invalid build config {}: {}", pool, build_config, message);
        modify_pool_status(self.store.as_ref(), pool, |status| {
            let external = find_condition(&status.conditions, CONDITION_DEGRADED)
                .is_some_and(|c| c.is_true() && !is_controller_reason(c.reason.as_deref()));
            !external
                && set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_DEGRADED, true, REASON_INVALID_BUILD_CONFIG, message),
                )
        })
        .await?;
        modify_build_config_status(self.store.as_ref(), build_config, |status| {
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_READY, false, REASON_INVALID_BUILD_CONFIG, message),
            )
        })
        .await?;
        Ok(())
    }

    /// Drop InvalidBuildConfig conditions once the inputs validate again
    async fn clear_invalid(
        &self,
        pool: &crds::MachinePool,
        build_config: &ImageBuildConfig,
    ) -> Result<(), ControllerError> {
        let invalid = |conditions: &[Condition], kind: &str| {
            find_condition(conditions, kind).is_some_and(|c| c.has_reason(REASON_INVALID_BUILD_CONFIG))
        };
        if invalid(pool.conditions(), CONDITION_DEGRADED) {
            info!("Pool {} build config is valid again", pool.name_any());
            modify_pool_status(self.store.as_ref(), &pool.name_any(), |status| {
                invalid(&status.conditions, CONDITION_DEGRADED)
                    && remove_condition(&mut status.conditions, CONDITION_DEGRADED)
            })
            .await?;
        }
        if invalid(build_config.conditions(), CONDITION_READY) {
            modify_build_config_status(self.store.as_ref(), &build_config.name_any(), |status| {
                invalid(&status.conditions, CONDITION_READY)
                    && remove_condition(&mut status.conditions, CONDITION_READY)
            })
            .await?;
        }
        Ok(())
    }

    async fn remove_rebuild_label(&self, name: &str) -> Result<(), ControllerError> {
        let store = self.store.as_ref();
        retry_on_conflict(name, move || async move {
            let mut pool = store.get_pool(name).await?;
            let removed = pool
                .metadata
                .labels
                .as_mut()
                .and_then(|labels| labels.remove(REBUILD_LABEL));
            if removed.is_some() {
                store.replace_pool(&pool).await?;
                info!("Removed {} from pool {}", REBUILD_LABEL, name);
            }
            Ok(())
        })
        .await
    }
}
