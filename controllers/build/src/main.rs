//! Build Controller
//!
//! Builds a custom OS image for every MachinePool that opts into image
//! layering, tracks each build through its pod, and records the result on
//! the pool so the rollout can pick it up.
//!
//! Superseded images are pruned from the registry in the background.

mod backoff;
mod config;
mod controller;
mod decision;
mod error;
mod lifecycle;
mod pod_builder;
mod pruner;
mod reconciler;
mod secrets;
mod store;
#[cfg(test)]
mod test_utils;
mod validation;
mod watcher;

use crate::config::BuildControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and reqwest both link rustls; pick the provider once for the process
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Build Controller");

    let config = BuildControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("(client default)"));
    info!("  Max retries: {}", config.max_retries);
    info!("  Update delay: {:?}", config.update_delay);
    info!("  Workers: {}", config.workers);
    info!("  Prune interval: {:?}", config.prune_interval);
    info!("  Builder image: {}", config.builder_image);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
