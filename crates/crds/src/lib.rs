//! OSLayer CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the OSLayer image build controller.
//!
//! - `MachinePool`: a group of machines sharing one configuration lifecycle
//! - `ImageBuildConfig`: how to build the custom OS image for a pool
//! - `ImageBuild`: one attempt to produce an image for a pool's desired configuration

pub mod condition;
pub mod image_build;
pub mod image_build_config;
pub mod labels;
pub mod machine_pool;
pub mod references;

pub use condition::*;
pub use image_build::*;
pub use image_build_config::*;
pub use machine_pool::*;
pub use references::*;
