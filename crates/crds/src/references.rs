//! Object references shared by the OSLayer CRDs
//!
//! All references are local: the referenced object lives in the same namespace
//! as the referencing resource.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another object in the same namespace by name
///
/// Used for pool, configuration, build config and secret references.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalReference {
    /// Name of the referenced object
    pub name: String,
}

impl LocalReference {
    /// Create a reference to the named object
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for LocalReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
