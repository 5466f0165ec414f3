//! Label and annotation keys used across the OSLayer resources.
//!
//! Pools are toggled through labels, and objects created by the build
//! controller carry labels pointing back at the pool and build they belong to.
//! Label values derived from names go through [`bounded_label_value`].

use sha2::{Digest, Sha256};

/// API group of all OSLayer custom resources
pub const GROUP: &str = "osbuild.microscaler.io";

// Pool toggles

/// Opts a pool into image building. Any value other than `"false"` enables it.
pub const LAYERING_ENABLED_LABEL: &str = "osbuild.microscaler.io/layering-enabled";

/// Requests a rebuild of the pool's current configuration. Removed by the controller
/// once the corresponding `ImageBuild` exists.
pub const REBUILD_LABEL: &str = "osbuild.microscaler.io/rebuild";

// Ownership labels on builds and build pods

/// Name of the pool a build or build pod belongs to
pub const POOL_LABEL: &str = "osbuild.microscaler.io/pool";

/// Name of the build a build pod drives
pub const BUILD_LABEL: &str = "osbuild.microscaler.io/build";

/// Configuration a build was created for
pub const CONFIGURATION_LABEL: &str = "osbuild.microscaler.io/configuration";

/// Full name of the pool a build pod belongs to, for names too long for a label
pub const POOL_ANNOTATION: &str = "osbuild.microscaler.io/pool-name";

/// Full name of the build a build pod drives
pub const BUILD_ANNOTATION: &str = "osbuild.microscaler.io/build-name";

/// Standard Kubernetes label naming the managing tool
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of `app.kubernetes.io/managed-by` for objects created by the build controller
pub const MANAGED_BY_BUILD_CONTROLLER: &str = "oslayer-build-controller";

// Canonical credential secrets

/// Marks a secret as a controller-owned canonical credential secret
pub const CANONICAL_SECRET_LABEL: &str = "osbuild.microscaler.io/canonical-secret";

/// Back-reference from a canonical secret to the secret it was derived from
pub const ORIGINAL_SECRET_NAME_LABEL: &str = "osbuild.microscaler.io/original-secret-name";

/// Sorted, comma-separated names of every source secret that normalizes to a
/// canonical secret. The canonical secret is deleted once this set is empty.
pub const SOURCE_SECRETS_ANNOTATION: &str = "osbuild.microscaler.io/source-secrets";

/// Full content fingerprint of a canonical secret
pub const SECRET_FINGERPRINT_ANNOTATION: &str = "osbuild.microscaler.io/secret-fingerprint";

/// Suffix appended to the fingerprint to form a canonical secret name
pub const CANONICAL_SECRET_SUFFIX: &str = "-canonical";

/// Longest value the API server accepts for a label
pub const MAX_LABEL_VALUE_LEN: usize = 63;

const LABEL_HASH_LEN: usize = 10;

/// `value` if it fits in a label, otherwise a prefix of it joined to a short
/// sha256 of the whole. The same input always yields the same value.
#[must_use]
pub fn bounded_label_value(value: &str) -> String {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value.to_string();
    }
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    let hash = &digest[..LABEL_HASH_LEN];
    let mut cut = MAX_LABEL_VALUE_LEN - LABEL_HASH_LEN - 1;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    // Label values must start and end with an alphanumeric character
    let prefix = value[..cut].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if prefix.is_empty() {
        hash.to_string()
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Returns true if a label map has `key` set to a value other than `"false"`.
#[must_use]
pub fn label_enabled(
    labels: Option<&std::collections::BTreeMap<String, String>>,
    key: &str,
) -> bool {
    labels
        .and_then(|l| l.get(key))
        .is_some_and(|v| !v.eq_ignore_ascii_case("false"))
}

/// Label selector matching every object the build controller creates for a pool
#[must_use]
pub fn pool_selector(pool: &str) -> String {
    format!(
        "{K8S_MANAGED_BY}={MANAGED_BY_BUILD_CONTROLLER},{POOL_LABEL}={}",
        bounded_label_value(pool)
    )
}
