//! Controller-specific error types.

use crate::store::StoreError;
use crds::BuildPhase;
use registry_client::RegistryError;
use thiserror::Error;

/// Errors that can occur in the build controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client error outside the store (client construction, discovery)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Image registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid controller configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A referenced credential secret does not exist
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// A credential secret exists but its payload is unusable
    #[error("Malformed secret {name}: {reason}")]
    MalformedSecret {
        /// Secret name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// A build phase change outside the transition table
    #[error("Invalid transition for build {build}: {from} -> {to}")]
    InvalidTransition {
        /// Build name
        build: String,
        /// Current phase
        from: BuildPhase,
        /// Requested phase
        to: BuildPhase,
    },

    /// The derived build name is taken by a build of another pool or configuration
    #[error("Build {build} already exists for pool {pool} and configuration {configuration}")]
    BuildNameCollision {
        /// Build name
        build: String,
        /// Pool of the existing build
        pool: String,
        /// Configuration of the existing build
        configuration: String,
    },

    /// Build pod could not be constructed
    #[error("Build pod construction failed: {0}")]
    PodBuild(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Optimistic-concurrency failures that a re-read and retry resolves
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Conflict { .. } | StoreError::AlreadyExists { .. })
        )
    }

    /// Store lookups that found nothing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }

    /// Errors caused by operator input rather than infrastructure
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::SecretNotFound(_) | Self::MalformedSecret { .. })
    }
}
