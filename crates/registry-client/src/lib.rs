//! OCI Registry Client
//!
//! A small client for the OCI distribution API, used by OSLayer to inspect and
//! delete images it has built, plus a classifier that maps the many ways
//! registries report failures onto a fixed taxonomy.
//!
//! # Example
//!
//! ```no_run
//! use registry_client::{
//!     ImageReference, RegistryClient, RegistryClientTrait, RegistryCredentials,
//!     is_tolerable_delete_err,
//! };
//!
//! # async fn example(docker_config: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let client = RegistryClient::new()?;
//! let reference = ImageReference::parse("quay.io/example/os-image:worker-1")?;
//! let credentials = RegistryCredentials::from_docker_config(docker_config, &reference.registry)?;
//!
//! let inspection = client.inspect(&reference, &credentials).await?;
//! println!("digest: {}", inspection.digest);
//!
//! if let Err(e) = client.delete(&reference, &credentials).await {
//!     if !is_tolerable_delete_err(&e) {
//!         return Err(e.into());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod classify;
pub mod client;
pub mod error;
pub mod reference;
#[path = "trait.rs"]
pub mod registry_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use auth::RegistryCredentials;
pub use classify::{
    ErrorClass, classify, is_access_denied_err, is_image_not_found_err, is_tolerable_delete_err,
};
pub use client::{ImageInspection, RegistryClient};
pub use error::RegistryError;
pub use reference::ImageReference;
pub use registry_trait::RegistryClientTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockFailure, MockRegistryClient};
