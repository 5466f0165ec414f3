//! In-memory cluster store for tests.
//!
//! Mimics the API server semantics the controller relies on: resourceVersion
//! checks on every write, AlreadyExists on duplicate creates, label selectors,
//! status writes that leave spec and metadata alone, label value validation on
//! pods, and injectable conflicts.

use super::{ClusterStore, StoreError, parse_selector};
use chrono::Utc;
use crds::labels::{MAX_LABEL_VALUE_LEN, POOL_LABEL, bounded_label_value};
use crds::{ImageBuild, ImageBuildConfig, MachinePool};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod,
    PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Parks the next read of a secret until the test releases it
#[derive(Debug)]
struct ReadHold {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, MachinePool>,
    build_configs: BTreeMap<String, ImageBuildConfig>,
    builds: BTreeMap<String, ImageBuild>,
    pods: BTreeMap<String, Pod>,
    secrets: BTreeMap<String, Secret>,
    resource_version: u64,
    injected_conflicts: HashMap<&'static str, u32>,
    writes: HashMap<&'static str, u32>,
    read_holds: HashMap<String, ReadHold>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn take_injected_conflict(&mut self, kind: &'static str, name: &str) -> Result<(), StoreError> {
        match self.injected_conflicts.get_mut(kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Conflict {
                    kind,
                    name: name.to_string(),
                    message: "injected conflict".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn record_write(&mut self, kind: &'static str) {
        *self.writes.entry(kind).or_insert(0) += 1;
    }
}

/// In-memory [`ClusterStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    parse_selector(selector).iter().all(|(key, value)| match value {
        Some(value) => labels.get(*key).is_some_and(|v| v == value),
        None => labels.contains_key(*key),
    })
}

fn create<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    kind: &'static str,
    obj: &K,
    version: String,
) -> Result<K, StoreError> {
    let name = obj.name_any();
    if map.contains_key(&name) {
        return Err(StoreError::AlreadyExists { kind, name });
    }
    let mut stored = obj.clone();
    let meta = stored.meta_mut();
    meta.resource_version = Some(version);
    meta.uid = Some(format!("uid-{kind}-{name}"));
    meta.creation_timestamp = Some(Time(Utc::now()));
    map.insert(name, stored.clone());
    Ok(stored)
}

fn check_version<K: Resource>(
    kind: &'static str,
    existing: &K,
    incoming: &K,
) -> Result<(), StoreError> {
    match incoming.meta().resource_version.as_deref() {
        Some(rv) if Some(rv) != existing.meta().resource_version.as_deref() => {
            Err(StoreError::Conflict {
                kind,
                name: incoming.name_any(),
                message: format!(
                    "the object has been modified; please apply your changes to the latest version ({} != {:?})",
                    rv,
                    existing.meta().resource_version
                ),
            })
        }
        _ => Ok(()),
    }
}

fn replace<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    kind: &'static str,
    obj: &K,
    version: String,
) -> Result<K, StoreError> {
    let name = obj.name_any();
    let existing = map
        .get(&name)
        .ok_or_else(|| StoreError::NotFound { kind, name: name.clone() })?;
    check_version(kind, existing, obj)?;
    let mut stored = obj.clone();
    let meta = stored.meta_mut();
    meta.resource_version = Some(version);
    meta.uid.clone_from(&existing.meta().uid);
    meta.creation_timestamp.clone_from(&existing.meta().creation_timestamp);
    map.insert(name, stored.clone());
    Ok(stored)
}

fn write_status<K: Resource + Clone>(
    map: &mut BTreeMap<String, K>,
    kind: &'static str,
    obj: &K,
    version: String,
    copy_status: impl FnOnce(&mut K, &K),
) -> Result<K, StoreError> {
    let name = obj.name_any();
    let existing = map
        .get_mut(&name)
        .ok_or_else(|| StoreError::NotFound { kind, name: name.clone() })?;
    check_version(kind, existing, obj)?;
    copy_status(existing, obj);
    existing.meta_mut().resource_version = Some(version);
    Ok(existing.clone())
}

fn get<K: Clone>(map: &BTreeMap<String, K>, kind: &'static str, name: &str) -> Result<K, StoreError> {
    map.get(name).cloned().ok_or_else(|| StoreError::NotFound {
        kind,
        name: name.to_string(),
    })
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Test setup

    pub fn insert_pool(&self, pool: MachinePool) -> MachinePool {
        let mut state = self.state();
        let version = state.next_version();
        let name = pool.name_any();
        state.pools.remove(&name);
        create(&mut state.pools, "MachinePool", &pool, version).unwrap_or(pool)
    }

    pub fn insert_build_config(&self, config: ImageBuildConfig) -> ImageBuildConfig {
        let mut state = self.state();
        let version = state.next_version();
        let name = config.name_any();
        state.build_configs.remove(&name);
        create(&mut state.build_configs, "ImageBuildConfig", &config, version).unwrap_or(config)
    }

    pub fn insert_build(&self, build: ImageBuild) -> ImageBuild {
        let mut state = self.state();
        let version = state.next_version();
        let name = build.name_any();
        state.builds.remove(&name);
        create(&mut state.builds, "ImageBuild", &build, version).unwrap_or(build)
    }

    pub fn insert_secret(&self, secret: Secret) -> Secret {
        let mut state = self.state();
        let version = state.next_version();
        let name = secret.name_any();
        state.secrets.remove(&name);
        create(&mut state.secrets, "Secret", &secret, version).unwrap_or(secret)
    }

    /// Apply an operator edit to a pool (bumps resourceVersion and generation)
    pub fn edit_pool(&self, name: &str, edit: impl FnOnce(&mut MachinePool)) {
        let mut state = self.state();
        let version = state.next_version();
        if let Some(pool) = state.pools.get_mut(name) {
            edit(pool);
            pool.metadata.resource_version = Some(version);
            pool.metadata.generation = Some(pool.metadata.generation.unwrap_or(1) + 1);
        }
    }

    /// Replace a secret's data as an operator would
    pub fn edit_secret_data(&self, name: &str, key: &str, value: &[u8]) {
        let mut state = self.state();
        let version = state.next_version();
        if let Some(secret) = state.secrets.get_mut(name) {
            secret.data = Some(BTreeMap::from([(key.to_string(), ByteString(value.to_vec()))]));
            secret.metadata.resource_version = Some(version);
        }
    }

    /// Make the next `count` writes of `kind` fail with a conflict
    pub fn inject_conflicts(&self, kind: &'static str, count: u32) {
        self.state().injected_conflicts.insert(kind, count);
    }

    /// Park the next `get_secret(name)` after it has read the secret.
    ///
    /// Returns `(reached, release)`: `reached` fires once the read happened and
    /// the reader resumes when `release` is notified.
    pub fn hold_next_secret_read(&self, name: &str) -> (Arc<Notify>, Arc<Notify>) {
        let hold = ReadHold {
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        let handles = (hold.reached.clone(), hold.release.clone());
        self.state().read_holds.insert(name.to_string(), hold);
        handles
    }

    /// Successful writes (create, replace, status) of `kind` so far
    pub fn write_count(&self, kind: &'static str) -> u32 {
        self.state().writes.get(kind).copied().unwrap_or(0)
    }

    // Pod lifecycle driven by tests in place of the kubelet

    pub fn set_pod_phase(&self, name: &str, phase: &str) {
        self.update_pod(name, |status| status.phase = Some(phase.to_string()));
    }

    pub fn set_pod_succeeded(&self, name: &str, termination_message: &str) {
        self.update_pod(name, |status| {
            status.phase = Some("Succeeded".to_string());
            status.container_statuses = Some(vec![terminated_container(0, termination_message)]);
        });
    }

    pub fn set_pod_failed(&self, name: &str, reason: Option<&str>, message: &str) {
        self.update_pod(name, |status| {
            status.phase = Some("Failed".to_string());
            status.reason = reason.map(str::to_string);
            status.message = Some(message.to_string());
            status.container_statuses = Some(vec![terminated_container(1, message)]);
        });
    }

    pub fn set_pod_waiting(&self, name: &str, reason: &str) {
        self.update_pod(name, |status| {
            status.phase = Some("Pending".to_string());
            status.container_statuses = Some(vec![ContainerStatus {
                name: "image-build".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some(reason.to_string()),
                        message: Some(format!("container is waiting: {reason}")),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        });
    }

    pub fn remove_pod(&self, name: &str) {
        self.state().pods.remove(name);
    }

    fn update_pod(&self, name: &str, update: impl FnOnce(&mut PodStatus)) {
        let mut state = self.state();
        let version = state.next_version();
        if let Some(pod) = state.pods.get_mut(name) {
            update(pod.status.get_or_insert_with(PodStatus::default));
            pod.metadata.resource_version = Some(version);
        }
    }

    // Inspection

    pub fn pool(&self, name: &str) -> Option<MachinePool> {
        self.state().pools.get(name).cloned()
    }

    pub fn build_config(&self, name: &str) -> Option<ImageBuildConfig> {
        self.state().build_configs.get(name).cloned()
    }

    pub fn builds(&self) -> Vec<ImageBuild> {
        self.state().builds.values().cloned().collect()
    }

    pub fn build(&self, name: &str) -> Option<ImageBuild> {
        self.state().builds.get(name).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state().pods.values().cloned().collect()
    }

    pub fn secrets(&self) -> Vec<Secret> {
        self.state().secrets.values().cloned().collect()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state().secrets.get(name).cloned()
    }
}

fn terminated_container(exit_code: i32, message: &str) -> ContainerStatus {
    ContainerStatus {
        name: "image-build".to_string(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                message: Some(message.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemoryStore {
    async fn get_pool(&self, name: &str) -> Result<MachinePool, StoreError> {
        get(&self.state().pools, "MachinePool", name)
    }

    async fn replace_pool(&self, pool: &MachinePool) -> Result<MachinePool, StoreError> {
        let mut state = self.state();
        state.take_injected_conflict("MachinePool", &pool.name_any())?;
        let version = state.next_version();
        let stored = replace(&mut state.pools, "MachinePool", pool, version)?;
        state.record_write("MachinePool");
        Ok(stored)
    }

    async fn update_pool_status(&self, pool: &MachinePool) -> Result<MachinePool, StoreError> {
        let mut state = self.state();
        state.take_injected_conflict("MachinePool", &pool.name_any())?;
        let version = state.next_version();
        let stored = write_status(&mut state.pools, "MachinePool", pool, version, |existing, new| {
            existing.status.clone_from(&new.status);
        })?;
        state.record_write("MachinePool");
        Ok(stored)
    }

    async fn list_build_configs(&self) -> Result<Vec<ImageBuildConfig>, StoreError> {
        Ok(self.state().build_configs.values().cloned().collect())
    }

    async fn get_build_config(&self, name: &str) -> Result<ImageBuildConfig, StoreError> {
        get(&self.state().build_configs, "ImageBuildConfig", name)
    }

    async fn update_build_config_status(
        &self,
        config: &ImageBuildConfig,
    ) -> Result<ImageBuildConfig, StoreError> {
        let mut state = self.state();
        state.take_injected_conflict("ImageBuildConfig", &config.name_any())?;
        let version = state.next_version();
        let stored = write_status(
            &mut state.build_configs,
            "ImageBuildConfig",
            config,
            version,
            |existing, new| existing.status.clone_from(&new.status),
        )?;
        state.record_write("ImageBuildConfig");
        Ok(stored)
    }

    async fn list_builds(&self, pool: &str) -> Result<Vec<ImageBuild>, StoreError> {
        Ok(self
            .state()
            .builds
            .values()
            .filter(|b| {
                b.labels().get(POOL_LABEL).is_some_and(|p| *p == bounded_label_value(pool))
                    && b.spec.pool_ref.name == pool
            })
            .cloned()
            .collect())
    }

    async fn get_build(&self, name: &str) -> Result<ImageBuild, StoreError> {
        get(&self.state().builds, "ImageBuild", name)
    }

    async fn create_build(&self, build: &ImageBuild) -> Result<ImageBuild, StoreError> {
        let mut state = self.state();
        let version = state.next_version();
        let stored = create(&mut state.builds, "ImageBuild", build, version)?;
        state.record_write("ImageBuild");
        Ok(stored)
    }

    async fn update_build_status(&self, build: &ImageBuild) -> Result<ImageBuild, StoreError> {
        let mut state = self.state();
        state.take_injected_conflict("ImageBuild", &build.name_any())?;
        let version = state.next_version();
        let stored = write_status(&mut state.builds, "ImageBuild", build, version, |existing, new| {
            existing.status.clone_from(&new.status);
        })?;
        state.record_write("ImageBuild");
        Ok(stored)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, StoreError> {
        Ok(self.state().pods.get(name).cloned())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        if let Some((key, value)) = pod
            .labels()
            .iter()
            .find(|(_, v)| v.len() > MAX_LABEL_VALUE_LEN)
        {
            return Err(StoreError::Invalid {
                kind: "Pod",
                name: pod.name_any(),
                message: format!(
                    "metadata.labels: Invalid value: \"{value}\": {key} must be no more than {MAX_LABEL_VALUE_LEN} characters"
                ),
            });
        }
        let mut state = self.state();
        let version = state.next_version();
        let mut pod = pod.clone();
        pod.status.get_or_insert_with(|| PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        let stored = create(&mut state.pods, "Pod", &pod, version)?;
        state.record_write("Pod");
        Ok(stored)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), StoreError> {
        self.state().pods.remove(name);
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, StoreError> {
        let (secret, hold) = {
            let mut state = self.state();
            let secret = get(&state.secrets, "Secret", name);
            (secret, state.read_holds.remove(name))
        };
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        secret
    }

    async fn list_secrets(&self, selector: &str) -> Result<Vec<Secret>, StoreError> {
        Ok(self
            .state()
            .secrets
            .values()
            .filter(|s| matches_selector(s.labels(), selector))
            .cloned()
            .collect())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let mut state = self.state();
        let version = state.next_version();
        let stored = create(&mut state.secrets, "Secret", secret, version)?;
        state.record_write("Secret");
        Ok(stored)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let mut state = self.state();
        state.take_injected_conflict("Secret", &secret.name_any())?;
        let version = state.next_version();
        let stored = replace(&mut state.secrets, "Secret", secret, version)?;
        state.record_write("Secret");
        Ok(stored)
    }

    async fn delete_secret(
        &self,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let existing = state.secrets.get(name).ok_or_else(|| StoreError::NotFound {
            kind: "Secret",
            name: name.to_string(),
        })?;
        let current = existing.metadata.resource_version.as_deref();
        if let Some(rv) = resource_version.filter(|rv| Some(*rv) != current) {
            return Err(StoreError::Conflict {
                kind: "Secret",
                name: name.to_string(),
                message: format!("precondition failed: resourceVersion {rv} != {current:?}"),
            });
        }
        state.secrets.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_pool;

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let store = MemoryStore::new();
        store.insert_pool(create_test_pool("worker", "rendered-worker-1", true));

        let first = store.get_pool("worker").await.unwrap();
        let second = store.get_pool("worker").await.unwrap();

        store.update_pool_status(&first).await.unwrap();
        let err = store.update_pool_status(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_create_already_exists() {
        let store = MemoryStore::new();
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("pull".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        store.create_secret(&secret).await.unwrap();
        let err = store.create_secret(&secret).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_conditional_delete_checks_resource_version() {
        let store = MemoryStore::new();
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("pull".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = store.create_secret(&secret).await.unwrap();
        let replaced = store.replace_secret(&created).await.unwrap();

        let err = store
            .delete_secret("pull", created.metadata.resource_version.as_deref())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        store
            .delete_secret("pull", replaced.metadata.resource_version.as_deref())
            .await
            .unwrap();
        assert!(store.secret("pull").is_none());
    }

    #[tokio::test]
    async fn test_overlong_pod_label_is_invalid() {
        let store = MemoryStore::new();
        let pod = Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("p".to_string()),
                labels: Some(BTreeMap::from([("build".to_string(), "x".repeat(64))])),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = store.create_pod(&pod).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid { .. }));
        assert!(store.pods().is_empty());
    }

    #[test]
    fn test_matches_selector() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert!(matches_selector(&labels, "a=1,b"));
        assert!(!matches_selector(&labels, "a=2"));
        assert!(!matches_selector(&labels, "c"));
    }
}
