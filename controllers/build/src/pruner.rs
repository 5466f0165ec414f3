//! Registry image pruning.
//!
//! Succeeded builds leave their images behind in the push repository. Once a
//! build config has moved on to a newer image, the older ones are inspected
//! and deleted. Missing images and missing permissions are expected here and
//! only logged; anything else is reported on the build config's `ImagePruned`
//! condition.

use crate::error::ControllerError;
use crate::secrets::{SecretCanonicalizer, registry_credentials};
use crate::store::{ClusterStore, modify_build_config_status};
use crds::{
    BuildPhase, CONDITION_IMAGE_PRUNED, Condition, ImageBuildConfig, REASON_PRUNE_FAILED,
    REASON_PRUNE_SUCCEEDED, set_condition,
};
use kube::ResourceExt;
use registry_client::{
    ImageReference, RegistryClientTrait, RegistryCredentials, RegistryError, classify,
    is_tolerable_delete_err,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One image that could not be pruned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneFailure {
    pub build_config: String,
    pub image: String,
    pub error: String,
}

/// Outcome of a pruning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Pullspecs deleted from their registry
    pub deleted: Vec<String>,
    /// Pullspecs skipped because the registry reported them gone or off limits
    pub skipped: Vec<String>,
    pub failures: Vec<PruneFailure>,
}

impl PruneReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Deletes images superseded by a newer build of the same build config
pub struct ImagePruner {
    store: Arc<dyn ClusterStore>,
    registry: Arc<dyn RegistryClientTrait>,
    canonicalizer: SecretCanonicalizer,
}

impl ImagePruner {
    pub fn new(store: Arc<dyn ClusterStore>, registry: Arc<dyn RegistryClientTrait>) -> Self {
        let canonicalizer = SecretCanonicalizer::new(store.clone());
        Self {
            store,
            registry,
            canonicalizer,
        }
    }

    /// Prune every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!("Starting image pruner (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Dropping the pass on shutdown cancels any registry call in flight
            tokio::select! {
                () = shutdown.cancelled() => break,
                report = self.prune_once() => {
                    if report.is_clean() {
                        debug!(
                            "Prune pass finished: {} deleted, {} skipped",
                            report.deleted.len(),
                            report.skipped.len()
                        );
                    } else {
                        error!("Prune pass finished with {} failures", report.failures.len());
                    }
                }
            }
        }
        info!("Image pruner stopped");
    }

    /// One pass over every build config.
    pub async fn prune_once(&self) -> PruneReport {
        let mut report = PruneReport::default();
        let configs = match self.store.list_build_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!("Failed to list build configs for pruning: {}", e);
                return report;
            }
        };

        for config in &configs {
            let name = config.name_any();
            let mut config_report = PruneReport::default();
            if let Err(e) = self.prune_build_config(config, &mut config_report).await {
                config_report.failures.push(PruneFailure {
                    build_config: name.clone(),
                    image: String::new(),
                    error: e.to_string(),
                });
            }
            for failure in &config_report.failures {
                error!(
                    "Failed to prune image {:?} for ImageBuildConfig {}: {}",
                    failure.image, name, failure.error
                );
            }
            if let Err(e) = self.record_outcome(&name, &config_report).await {
                warn!("Failed to record prune outcome on ImageBuildConfig {}: {}", name, e);
            }
            report.deleted.append(&mut config_report.deleted);
            report.skipped.append(&mut config_report.skipped);
            report.failures.append(&mut config_report.failures);
        }
        report
    }

    async fn prune_build_config(
        &self,
        config: &ImageBuildConfig,
        report: &mut PruneReport,
    ) -> Result<(), ControllerError> {
        let name = config.name_any();
        let Some(current) = config.current_image() else {
            debug!("ImageBuildConfig {} has no current image; nothing to prune", name);
            return Ok(());
        };

        let stale: Vec<String> = self
            .store
            .list_builds(&config.spec.pool_ref.name)
            .await?
            .into_iter()
            .filter(|b| b.spec.build_config_ref.name == name)
            .filter(|b| b.status.as_ref().is_some_and(|s| s.phase == BuildPhase::Succeeded))
            .filter_map(|b| b.status.and_then(|s| s.image_pullspec))
            .filter(|image| image != current)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let secret = self.canonicalizer.canonicalize(&config.spec.push_secret.name).await?;
        for image in stale {
            let reference = match ImageReference::parse(&image) {
                Ok(reference) => reference,
                Err(e) => {
                    report.failures.push(PruneFailure {
                        build_config: name.clone(),
                        image,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let credentials = match registry_credentials(&secret, &reference.registry) {
                Ok(credentials) => credentials,
                Err(e) => {
                    report.failures.push(PruneFailure {
                        build_config: name.clone(),
                        image,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            match self.delete_image(&reference, &credentials).await {
                Ok(()) => {
                    info!("Pruned image {} for ImageBuildConfig {}", image, name);
                    report.deleted.push(image);
                }
                Err(e) if is_tolerable_delete_err(&e) => {
                    info!(
                        "Skipping image {} for ImageBuildConfig {} ({:?}): {}",
                        image,
                        name,
                        classify(&e),
                        e
                    );
                    report.skipped.push(image);
                }
                Err(e) => report.failures.push(PruneFailure {
                    build_config: name.clone(),
                    image,
                    error: e.to_string(),
                }),
            }
        }
        Ok(())
    }

    async fn delete_image(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<(), RegistryError> {
        let inspection = self.registry.inspect(reference, credentials).await?;
        debug!("Deleting {} ({})", reference, inspection.digest);
        self.registry.delete(reference, credentials).await
    }

    async fn record_outcome(&self, name: &str, report: &PruneReport) -> Result<(), ControllerError> {
        let condition = if report.is_clean() {
            Condition::new(CONDITION_IMAGE_PRUNED, true, REASON_PRUNE_SUCCEEDED, "")
        } else {
            let images: Vec<String> = report
                .failures
                .iter()
                .map(|f| {
                    if f.image.is_empty() {
                        f.error.clone()
                    } else {
                        format!("{}: {}", f.image, f.error)
                    }
                })
                .collect();
            Condition::new(
                CONDITION_IMAGE_PRUNED,
                false,
                REASON_PRUNE_FAILED,
                images.join("; "),
            )
        };
        modify_build_config_status(self.store.as_ref(), name, |status| {
            set_condition(&mut status.conditions, condition.clone())
        })
        .await?;
        Ok(())
    }
}
