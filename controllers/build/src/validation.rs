//! Static validation of build configs.

use crds::ImageBuildConfig;
use registry_client::ImageReference;

/// Kernel types a build can select
pub const KERNEL_TYPES: [&str; 3] = ["default", "realtime", "64k-pages"];

/// Extensions a build can layer onto the base image
pub const SUPPORTED_EXTENSIONS: [&str; 8] = [
    "two-node-ha",
    "wasm",
    "ipsec",
    "usbguard",
    "kerberos",
    "kernel-devel",
    "sandboxed-containers",
    "sysstat",
];

/// Canonical kernel type for an optional user value, `None` if unknown
#[must_use]
pub fn canonical_kernel_type(kernel_type: Option<&str>) -> Option<&'static str> {
    match kernel_type.map(str::trim).unwrap_or_default() {
        "" | "default" => Some("default"),
        "rt" | "realtime" => Some("realtime"),
        "64k-pages" => Some("64k-pages"),
        _ => None,
    }
}

/// Every problem with a build config's spec; empty when it is buildable
#[must_use]
pub fn validate_build_config(config: &ImageBuildConfig) -> Vec<String> {
    let spec = &config.spec;
    let mut problems = Vec::new();

    if spec.base_image.trim().is_empty() {
        problems.push("baseImage is empty".to_string());
    } else if let Err(e) = ImageReference::parse(&spec.base_image) {
        problems.push(format!("baseImage {:?} is not a valid pullspec: {}", spec.base_image, e));
    }

    if spec.push_destination.trim().is_empty() {
        problems.push("pushDestination is empty".to_string());
    } else {
        match ImageReference::parse(&spec.push_destination) {
            Ok(reference) if reference.digest.is_some() => problems.push(format!(
                "pushDestination {:?} must be a tag, not a digest",
                spec.push_destination
            )),
            Ok(_) => {}
            Err(e) => problems.push(format!(
                "pushDestination {:?} is not a valid pullspec: {}",
                spec.push_destination, e
            )),
        }
    }

    if canonical_kernel_type(spec.kernel_type.as_deref()).is_none() {
        problems.push(format!(
            "kernelType {:?} is not one of {}",
            spec.kernel_type.as_deref().unwrap_or_default(),
            KERNEL_TYPES.join(", ")
        ));
    }

    for extension in &spec.extensions {
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            problems.push(format!("extension {extension:?} is not supported"));
        }
    }

    if spec.base_image_pull_secret.name.trim().is_empty() {
        problems.push("baseImagePullSecret is empty".to_string());
    }
    if spec.push_secret.name.trim().is_empty() {
        problems.push("pushSecret is empty".to_string());
    }

    problems
}
