//! Mock RegistryClient for unit testing
//!
//! Stores images in memory keyed by pullspec and can be told to fail specific
//! references with registry-shaped errors.

use crate::auth::RegistryCredentials;
use crate::client::ImageInspection;
use crate::error::RegistryError;
use crate::reference::ImageReference;
use crate::registry_trait::RegistryClientTrait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failure a mock reference answers with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Registry answered with a status and distribution error code
    Api {
        /// HTTP status
        status: u16,
        /// Distribution error code, empty for none
        code: String,
        /// Error message
        message: String,
    },
    /// The request never got an answer
    Transport(String),
}

impl MockFailure {
    fn to_error(&self, reference: &ImageReference) -> RegistryError {
        match self {
            Self::Api { status, code, message } => RegistryError::Api {
                registry: reference.registry.clone(),
                status: *status,
                codes: if code.is_empty() { Vec::new() } else { vec![code.clone()] },
                message: message.clone(),
            },
            Self::Transport(message) => RegistryError::Transport {
                registry: reference.registry.clone(),
                message: message.clone(),
            },
        }
    }
}

/// Mock RegistryClient for testing
#[derive(Debug, Clone, Default)]
pub struct MockRegistryClient {
    images: Arc<Mutex<HashMap<String, ImageInspection>>>,
    failures: Arc<Mutex<HashMap<String, MockFailure>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    inspected: Arc<Mutex<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockRegistryClient {
    /// Create an empty mock registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image under its pullspec (for test setup)
    pub fn add_image(&self, pullspec: &str, digest: &str) {
        lock(&self.images).insert(
            key(pullspec),
            ImageInspection {
                manifest: serde_json::json!({
                    "schemaVersion": 2,
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                }),
                digest: digest.to_string(),
                media_type: Some("application/vnd.oci.image.manifest.v1+json".to_string()),
            },
        );
    }

    /// Make every call for `pullspec` fail
    pub fn fail_with(&self, pullspec: &str, failure: MockFailure) {
        lock(&self.failures).insert(key(pullspec), failure);
    }

    /// True if the pullspec is still present
    #[must_use]
    pub fn contains(&self, pullspec: &str) -> bool {
        lock(&self.images).contains_key(&key(pullspec))
    }

    /// Pullspecs deleted so far, in order
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    /// Pullspecs inspected so far, in order
    #[must_use]
    pub fn inspected(&self) -> Vec<String> {
        lock(&self.inspected).clone()
    }

    fn failure_for(&self, reference: &ImageReference) -> Option<RegistryError> {
        lock(&self.failures)
            .get(&reference.to_string())
            .map(|f| f.to_error(reference))
    }

    fn not_found(reference: &ImageReference) -> RegistryError {
        RegistryError::Api {
            registry: reference.registry.clone(),
            status: 404,
            codes: vec!["MANIFEST_UNKNOWN".to_string()],
            message: "manifest unknown".to_string(),
        }
    }
}

// Normalize through the parser so equivalent spellings share a key.
fn key(pullspec: &str) -> String {
    ImageReference::parse(pullspec).map_or_else(|_| pullspec.to_string(), |r| r.to_string())
}

#[async_trait::async_trait]
impl RegistryClientTrait for MockRegistryClient {
    async fn inspect(
        &self,
        reference: &ImageReference,
        _credentials: &RegistryCredentials,
    ) -> Result<ImageInspection, RegistryError> {
        let pullspec = reference.to_string();
        lock(&self.inspected).push(pullspec.clone());
        if let Some(err) = self.failure_for(reference) {
            return Err(err);
        }
        lock(&self.images)
            .get(&pullspec)
            .cloned()
            .ok_or_else(|| Self::not_found(reference))
    }

    async fn delete(
        &self,
        reference: &ImageReference,
        _credentials: &RegistryCredentials,
    ) -> Result<(), RegistryError> {
        if let Some(err) = self.failure_for(reference) {
            return Err(err);
        }
        let pullspec = reference.to_string();
        match lock(&self.images).remove(&pullspec) {
            Some(_) => {
                lock(&self.deleted).push(pullspec);
                Ok(())
            }
            None => Err(Self::not_found(reference)),
        }
    }
}
