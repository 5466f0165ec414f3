//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the store, the
//! reconciler, the pool watcher and the image pruner together and owns their
//! background tasks.

use crate::config::BuildControllerConfig;
use crate::error::ControllerError;
use crate::pod_builder::BuildahPodBuilder;
use crate::pruner::ImagePruner;
use crate::reconciler::Reconciler;
use crate::store::kube_store::KubeStore;
use crate::watcher::Watcher;
use crds::{ImageBuild, ImageBuildConfig, MachinePool};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use registry_client::RegistryClient;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main controller for OS image builds.
pub struct Controller {
    pool_watcher: JoinHandle<Result<(), ControllerError>>,
    pruner: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: BuildControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Build Controller");

        let client = Client::try_default().await?;
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        info!("Watching namespace {}", namespace);

        let store = Arc::new(KubeStore::new(client.clone(), &namespace, config.api_timeout));
        let pod_builder = Arc::new(BuildahPodBuilder::new(
            config.builder_image.clone(),
            config.build_context_image.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(store.clone(), pod_builder, &config));

        let watcher = Watcher::new(
            reconciler,
            Api::<MachinePool>::namespaced(client.clone(), &namespace),
            Api::<ImageBuildConfig>::namespaced(client.clone(), &namespace),
            Api::<ImageBuild>::namespaced(client.clone(), &namespace),
            Api::<Pod>::namespaced(client, &namespace),
            config.workers,
        );

        let shutdown = CancellationToken::new();
        let pool_watcher = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_pools(shutdown).await })
        };

        let pruner = match config.prune_interval {
            Some(interval) => {
                let registry = Arc::new(RegistryClient::with_timeout(config.api_timeout)?);
                let pruner = ImagePruner::new(store, registry);
                let shutdown = shutdown.clone();
                Some(tokio::spawn(async move { pruner.run(interval, shutdown).await }))
            }
            None => {
                info!("Image pruning disabled");
                None
            }
        };

        Ok(Self {
            pool_watcher,
            pruner,
            shutdown,
        })
    }

    /// Runs the controller until a shutdown signal or until the watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Build Controller running");

        let exited = tokio::select! {
            result = &mut self.pool_watcher => Some(result),
            signal = shutdown_signal() => {
                info!("Received {}, shutting down", signal);
                None
            }
        };
        self.shutdown.cancel();
        let joined = match exited {
            Some(result) => result,
            None => (&mut self.pool_watcher).await,
        };
        let result = joined
            .map_err(|e| ControllerError::Watch(format!("MachinePool watcher panicked: {}", e)))?
            .map_err(|e| ControllerError::Watch(format!("MachinePool watcher error: {}", e)));

        if let Some(pruner) = self.pruner.take() {
            if let Err(e) = pruner.await {
                warn!("Image pruner task failed: {}", e);
            }
        }

        info!("Build Controller stopped");
        result
    }
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
