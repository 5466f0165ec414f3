//! Cluster store seam.
//!
//! Every read and write the controller makes against the API server goes
//! through [`ClusterStore`]. Writes carry the object's `resourceVersion`, so a
//! stale write fails with [`StoreError::Conflict`] instead of clobbering a
//! concurrent change. [`retry_on_conflict`] re-runs a read-modify-write until it
//! lands.

pub mod kube_store;
#[cfg(test)]
pub mod memory;

use crate::error::ControllerError;
use crds::{ImageBuild, ImageBuildConfig, ImageBuildConfigStatus, MachinePool, MachinePoolStatus};
use k8s_openapi::api::core::v1::{Pod, Secret};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Attempts made by [`retry_on_conflict`] before giving up
pub const CONFLICT_RETRIES: u32 = 10;

/// Errors returned by the cluster store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// Create of an object that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// Write based on a stale resourceVersion
    #[error("Conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
        /// API server message
        message: String,
    },

    /// The API server rejected the object as invalid (422)
    #[error("Invalid {kind} {name}: {message}")]
    Invalid {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
        /// API server message
        message: String,
    },

    /// The API call did not finish in time
    #[error("Timed out after {0:?} waiting for the API server")]
    Timeout(Duration),

    /// Any other API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Reads and optimistic-concurrency writes for every object the controller touches
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a pool
    async fn get_pool(&self, name: &str) -> Result<MachinePool, StoreError>;
    /// Replace a pool's metadata and spec
    async fn replace_pool(&self, pool: &MachinePool) -> Result<MachinePool, StoreError>;
    /// Replace a pool's status
    async fn update_pool_status(&self, pool: &MachinePool) -> Result<MachinePool, StoreError>;

    /// List all build configs in the namespace
    async fn list_build_configs(&self) -> Result<Vec<ImageBuildConfig>, StoreError>;
    /// Fetch a build config
    async fn get_build_config(&self, name: &str) -> Result<ImageBuildConfig, StoreError>;
    /// Replace a build config's status
    async fn update_build_config_status(
        &self,
        config: &ImageBuildConfig,
    ) -> Result<ImageBuildConfig, StoreError>;

    /// List the builds of a pool
    async fn list_builds(&self, pool: &str) -> Result<Vec<ImageBuild>, StoreError>;
    /// Fetch a build
    async fn get_build(&self, name: &str) -> Result<ImageBuild, StoreError>;
    /// Create a build
    async fn create_build(&self, build: &ImageBuild) -> Result<ImageBuild, StoreError>;
    /// Replace a build's status
    async fn update_build_status(&self, build: &ImageBuild) -> Result<ImageBuild, StoreError>;

    /// Fetch a pod, `None` if it does not exist
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, StoreError>;
    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;
    /// Delete a pod; deleting a missing pod succeeds
    async fn delete_pod(&self, name: &str) -> Result<(), StoreError>;

    /// Fetch a secret
    async fn get_secret(&self, name: &str) -> Result<Secret, StoreError>;
    /// List secrets matching a label selector
    async fn list_secrets(&self, selector: &str) -> Result<Vec<Secret>, StoreError>;
    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    /// Replace a secret
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    /// Delete a secret, only if it is still at `resource_version` when one is given
    async fn delete_secret(
        &self,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Run a read-modify-write until it stops hitting optimistic-concurrency conflicts.
///
/// `operation` must re-read whatever it modifies on every call.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut operation: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!("Conflict updating {} (attempt {}): {}", what, attempt, e);
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Re-read a pool, let `mutate` edit its status and write it back if it reports a change.
pub async fn modify_pool_status<F>(
    store: &dyn ClusterStore,
    name: &str,
    mutate: F,
) -> Result<MachinePool, ControllerError>
where
    F: Fn(&mut MachinePoolStatus) -> bool + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(name, move || async move {
        let mut pool = store.get_pool(name).await?;
        let generation = pool.metadata.generation;
        let status = pool.status.get_or_insert_with(Default::default);
        if !mutate(status) {
            return Ok(pool);
        }
        status.observed_generation = generation;
        Ok(store.update_pool_status(&pool).await?)
    })
    .await
}

/// Re-read a build config, let `mutate` edit its status and write it back if it reports a change.
pub async fn modify_build_config_status<F>(
    store: &dyn ClusterStore,
    name: &str,
    mutate: F,
) -> Result<ImageBuildConfig, ControllerError>
where
    F: Fn(&mut ImageBuildConfigStatus) -> bool + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(name, move || async move {
        let mut config = store.get_build_config(name).await?;
        let generation = config.metadata.generation;
        let status = config.status.get_or_insert_with(Default::default);
        if !mutate(status) {
            return Ok(config);
        }
        status.observed_generation = generation;
        Ok(store.update_build_config_status(&config).await?)
    })
    .await
}

/// Re-read a build, let `mutate` edit it and write its status back if it reports a change.
///
/// `mutate` sees the whole build so it can validate phase transitions.
pub async fn modify_build_status<F>(
    store: &dyn ClusterStore,
    name: &str,
    mutate: F,
) -> Result<ImageBuild, ControllerError>
where
    F: Fn(&mut ImageBuild) -> Result<bool, ControllerError> + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(name, move || async move {
        let mut build = store.get_build(name).await?;
        if !mutate(&mut build)? {
            return Ok(build);
        }
        Ok(store.update_build_status(&build).await?)
    })
    .await
}

/// Split a `k=v,k2=v2,k3` selector into requirements (`None` value = key must exist)
#[must_use]
pub fn parse_selector(selector: &str) -> Vec<(&str, Option<&str>)> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|req| match req.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (req, None),
        })
        .collect()
}
