//! Kubernetes resource watchers.
//!
//! A single `kube_runtime::Controller` keyed by MachinePool. Build configs,
//! builds and build pods are watched too and mapped back to their pool, so
//! any change to a pool's inputs or outputs queues that pool. The runtime's
//! scheduler never runs two reconciles for the same pool at once.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::labels::{K8S_MANAGED_BY, MANAGED_BY_BUILD_CONTROLLER, POOL_ANNOTATION, POOL_LABEL};
use crds::{ImageBuild, ImageBuildConfig, MachinePool};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reference to the pool named `pool` in the namespace of `obj`
fn pool_ref<K: ResourceExt>(obj: &K, pool: &str) -> Option<ObjectRef<MachinePool>> {
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(pool).within(&namespace))
}

/// Watches pools and everything that feeds into or out of them.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    pools: Api<MachinePool>,
    build_configs: Api<ImageBuildConfig>,
    builds: Api<ImageBuild>,
    pods: Api<Pod>,
    workers: usize,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        pools: Api<MachinePool>,
        build_configs: Api<ImageBuildConfig>,
        builds: Api<ImageBuild>,
        pods: Api<Pod>,
        workers: usize,
    ) -> Self {
        Self {
            reconciler,
            pools,
            build_configs,
            builds,
            pods,
            workers,
        }
    }

    /// Run the pool controller until `shutdown` is cancelled.
    pub async fn watch_pools(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting MachinePool watcher with {} workers", self.workers);

        let reconcile = |pool: Arc<MachinePool>, ctx: Arc<Reconciler>| async move {
            let name = pool.name_any();
            debug!("Reconciling MachinePool {}", name);
            let requeue = ctx.reconcile_pool(&name).await?;
            ctx.backoff.reset(&name);
            Ok::<_, ControllerError>(requeue.map_or_else(Action::await_change, Action::requeue))
        };

        // Errors stay isolated to their pool: requeue that pool with its own backoff
        let error_policy = |pool: Arc<MachinePool>, error: &ControllerError, ctx: Arc<Reconciler>| {
            let name = pool.name_any();
            let delay = ctx.backoff.record_error(&name);
            error!(
                "Reconciliation error for MachinePool {}: {} (retrying in {:?})",
                name, error, delay
            );
            Action::requeue(delay)
        };

        let pod_selector = format!("{K8S_MANAGED_BY}={MANAGED_BY_BUILD_CONTROLLER}");
        let controller_config = ControllerConfig::default()
            .concurrency(u16::try_from(self.workers).unwrap_or(u16::MAX));

        Controller::new(self.pools.clone(), watcher::Config::default())
            .watches(
                self.build_configs.clone(),
                watcher::Config::default(),
                |config: ImageBuildConfig| pool_ref(&config, &config.spec.pool_ref.name),
            )
            .watches(
                self.builds.clone(),
                watcher::Config::default(),
                |build: ImageBuild| pool_ref(&build, &build.spec.pool_ref.name),
            )
            .watches(
                self.pods.clone(),
                watcher::Config::default().labels(&pod_selector),
                |pod: Pod| {
                    let pool = pod
                        .annotations()
                        .get(POOL_ANNOTATION)
                        .or_else(|| pod.labels().get(POOL_LABEL))?
                        .clone();
                    pool_ref(&pod, &pool)
                },
            )
            .with_config(controller_config)
            .graceful_shutdown_on(shutdown.cancelled_owned())
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((pool, _)) => debug!("Reconciled MachinePool {}", pool.name),
                    Err(e) => error!("MachinePool controller error: {}", e),
                }
            })
            .await;

        info!("MachinePool watcher stopped");
        Ok(())
    }
}
