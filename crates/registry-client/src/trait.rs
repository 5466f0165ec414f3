//! RegistryClient trait for mocking
//!
//! The build controller depends on this trait rather than the concrete client
//! so pruning can be exercised without a registry.

use crate::auth::RegistryCredentials;
use crate::client::ImageInspection;
use crate::error::RegistryError;
use crate::reference::ImageReference;

/// Registry operations used by the image pruner
///
/// Cancellation is by dropping the returned future.
#[async_trait::async_trait]
pub trait RegistryClientTrait: Send + Sync {
    /// Fetch the manifest and digest an image reference resolves to
    async fn inspect(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<ImageInspection, RegistryError>;

    /// Delete the manifest an image reference resolves to
    async fn delete(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<(), RegistryError>;
}
