//! Kubernetes-backed cluster store.

use super::{ClusterStore, StoreError};
use crds::labels::{POOL_LABEL, bounded_label_value};
use crds::{ImageBuild, ImageBuildConfig, MachinePool};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Field manager used for server-side apply of status
pub const FIELD_MANAGER: &str = "oslayer-build-controller";

/// Store backed by the Kubernetes API server, scoped to one namespace
#[derive(Clone)]
pub struct KubeStore {
    pools: Api<MachinePool>,
    build_configs: Api<ImageBuildConfig>,
    builds: Api<ImageBuild>,
    pods: Api<Pod>,
    secrets: Api<Secret>,
    timeout: Duration,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

fn map_kube_error(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind,
            name: name.to_string(),
            message: ae.message,
        },
        kube::Error::Api(ae) if ae.code == 422 => StoreError::Invalid {
            kind,
            name: name.to_string(),
            message: ae.message,
        },
        other => StoreError::Kube(other),
    }
}

impl KubeStore {
    /// Create a store for `namespace`; every call is bounded by `timeout`
    #[must_use]
    pub fn new(client: Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            pools: Api::namespaced(client.clone(), namespace),
            build_configs: Api::namespaced(client.clone(), namespace),
            builds: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
            timeout,
        }
    }

    async fn call<T, Fut>(&self, kind: &'static str, name: &str, fut: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(StoreError::Timeout(self.timeout)),
            Ok(result) => result.map_err(|e| map_kube_error(kind, name, e)),
        }
    }

    /// Server-side apply of the status subresource, guarded by the object's resourceVersion.
    ///
    /// Apply drops fields this manager set before and omits now, so clearing an
    /// optional status field works the same way as with a full replace.
    async fn apply_status<K, S>(
        &self,
        api: &Api<K>,
        kind: &'static str,
        obj: &K,
        status: Option<&S>,
    ) -> Result<K, StoreError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
        S: Serialize,
    {
        let name = obj.name_any();
        let patch = serde_json::json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "metadata": {
                "name": name,
                "resourceVersion": obj.resource_version(),
            },
            "status": status,
        });
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.call(kind, &name, api.patch_status(&name, &params, &Patch::Apply(&patch)))
            .await
    }
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn get_pool(&self, name: &str) -> Result<MachinePool, StoreError> {
        self.call("MachinePool", name, self.pools.get(name)).await
    }

    async fn replace_pool(&self, pool: &MachinePool) -> Result<MachinePool, StoreError> {
        let name = pool.name_any();
        self.call(
            "MachinePool",
            &name,
            self.pools.replace(&name, &PostParams::default(), pool),
        )
        .await
    }

    async fn update_pool_status(&self, pool: &MachinePool) -> Result<MachinePool, StoreError> {
        self.apply_status(&self.pools, "MachinePool", pool, pool.status.as_ref())
            .await
    }

    async fn list_build_configs(&self) -> Result<Vec<ImageBuildConfig>, StoreError> {
        let list = self
            .call("ImageBuildConfig", "*", self.build_configs.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn get_build_config(&self, name: &str) -> Result<ImageBuildConfig, StoreError> {
        self.call("ImageBuildConfig", name, self.build_configs.get(name))
            .await
    }

    async fn update_build_config_status(
        &self,
        config: &ImageBuildConfig,
    ) -> Result<ImageBuildConfig, StoreError> {
        self.apply_status(
            &self.build_configs,
            "ImageBuildConfig",
            config,
            config.status.as_ref(),
        )
        .await
    }

    async fn list_builds(&self, pool: &str) -> Result<Vec<ImageBuild>, StoreError> {
        let selector = format!("{POOL_LABEL}={}", bounded_label_value(pool));
        let params = ListParams::default().labels(&selector);
        let list = self
            .call("ImageBuild", pool, self.builds.list(&params))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter(|b| b.spec.pool_ref.name == pool)
            .collect())
    }

    async fn get_build(&self, name: &str) -> Result<ImageBuild, StoreError> {
        self.call("ImageBuild", name, self.builds.get(name)).await
    }

    async fn create_build(&self, build: &ImageBuild) -> Result<ImageBuild, StoreError> {
        let name = build.name_any();
        self.call(
            "ImageBuild",
            &name,
            self.builds.create(&PostParams::default(), build),
        )
        .await
    }

    async fn update_build_status(&self, build: &ImageBuild) -> Result<ImageBuild, StoreError> {
        self.apply_status(&self.builds, "ImageBuild", build, build.status.as_ref())
            .await
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, StoreError> {
        self.call("Pod", name, self.pods.get_opt(name)).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let name = pod.name_any();
        self.call("Pod", &name, self.pods.create(&PostParams::default(), pod))
            .await
    }

    async fn delete_pod(&self, name: &str) -> Result<(), StoreError> {
        match self
            .call("Pod", name, self.pods.delete(name, &DeleteParams::default()))
            .await
        {
            Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, StoreError> {
        self.call("Secret", name, self.secrets.get(name)).await
    }

    async fn list_secrets(&self, selector: &str) -> Result<Vec<Secret>, StoreError> {
        let params = ListParams::default().labels(selector);
        let list = self.call("Secret", selector, self.secrets.list(&params)).await?;
        Ok(list.items)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.name_any();
        self.call(
            "Secret",
            &name,
            self.secrets.create(&PostParams::default(), secret),
        )
        .await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        let name = secret.name_any();
        self.call(
            "Secret",
            &name,
            self.secrets.replace(&name, &PostParams::default(), secret),
        )
        .await
    }

    async fn delete_secret(
        &self,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        self.call("Secret", name, self.secrets.delete(name, &params))
            .await
            .map(|_| ())
    }
}
