//! Registry error taxonomy
//!
//! Registries disagree on how to say "that image does not exist" and "you may
//! not do that". Several answer a request for a private repository with an auth
//! failure instead of a 404 so they never confirm it exists. Classification is
//! therefore best effort and provider dependent: a static rule table, keyed by
//! registry host, status code, distribution error code and message substring,
//! maps each failure onto [`ErrorClass`]. Rows are evaluated top to bottom and
//! registry-specific rows come first.

use crate::error::RegistryError;

/// Stable classification of a registry failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The repository, tag or digest does not exist
    ImageNotFound,
    /// The caller lacks permission (or the registry hides existence behind an auth failure)
    AccessDenied,
    /// Anything else: transport failures, rate limiting, server errors, malformed responses
    Other,
}

/// One row of the classification table. Empty lists match anything.
#[derive(Debug)]
struct ClassificationRule {
    /// Registry hosts (exact or parent domain)
    registries: &'static [&'static str],
    statuses: &'static [u16],
    /// Distribution error codes (`MANIFEST_UNKNOWN`, ...)
    codes: &'static [&'static str],
    /// Lower-case message substrings
    messages: &'static [&'static str],
    class: ErrorClass,
}

const ANY: &[&str] = &[];

static RULES: &[ClassificationRule] = &[
    // registry.access.redhat.com only serves public content; an auth failure
    // there means the repository does not exist.
    ClassificationRule {
        registries: &["registry.access.redhat.com"],
        statuses: &[401, 403],
        codes: ANY,
        messages: ANY,
        class: ErrorClass::ImageNotFound,
    },
    // GHCR does not implement manifest deletion through the distribution API.
    ClassificationRule {
        registries: &["ghcr.io"],
        statuses: &[404, 405],
        codes: ANY,
        messages: &["unsupported", "not allowed", "method"],
        class: ErrorClass::AccessDenied,
    },
    ClassificationRule {
        registries: &["ghcr.io"],
        statuses: &[405],
        codes: ANY,
        messages: ANY,
        class: ErrorClass::AccessDenied,
    },
    // GCR and Artifact Registry: "Permission denied ... (or it may not exist)".
    ClassificationRule {
        registries: &["gcr.io", "pkg.dev"],
        statuses: &[403],
        codes: ANY,
        messages: &["may not exist"],
        class: ErrorClass::AccessDenied,
    },
    // Quay answers 401 for unknown organizations and repositories.
    ClassificationRule {
        registries: &["quay.io"],
        statuses: &[401],
        codes: ANY,
        messages: ANY,
        class: ErrorClass::AccessDenied,
    },
    // Generic rows
    ClassificationRule {
        registries: ANY,
        statuses: &[],
        codes: &["MANIFEST_UNKNOWN", "NAME_UNKNOWN", "BLOB_UNKNOWN", "NOT_FOUND"],
        messages: ANY,
        class: ErrorClass::ImageNotFound,
    },
    ClassificationRule {
        registries: ANY,
        statuses: &[],
        codes: &["UNAUTHORIZED", "DENIED", "UNSUPPORTED"],
        messages: ANY,
        class: ErrorClass::AccessDenied,
    },
    ClassificationRule {
        registries: ANY,
        statuses: &[404],
        codes: ANY,
        messages: ANY,
        class: ErrorClass::ImageNotFound,
    },
    // 405: deletion disabled on this registry, i.e. no delete rights.
    ClassificationRule {
        registries: ANY,
        statuses: &[401, 403, 405],
        codes: ANY,
        messages: ANY,
        class: ErrorClass::AccessDenied,
    },
    ClassificationRule {
        registries: ANY,
        statuses: &[],
        codes: ANY,
        messages: &["manifest unknown", "name unknown", "not found", "does not exist"],
        class: ErrorClass::ImageNotFound,
    },
    ClassificationRule {
        registries: ANY,
        statuses: &[],
        codes: ANY,
        messages: &[
            "access to the resource is denied",
            "authentication required",
            "unauthorized",
            "permission denied",
        ],
        class: ErrorClass::AccessDenied,
    },
];

impl ClassificationRule {
    fn matches(&self, registry: &str, status: u16, codes: &[String], message: &str) -> bool {
        let registry_matches = self.registries.is_empty()
            || self
                .registries
                .iter()
                .any(|r| registry == *r || registry.ends_with(&format!(".{r}")));
        let status_matches = self.statuses.is_empty() || self.statuses.contains(&status);
        let code_matches = self.codes.is_empty()
            || codes
                .iter()
                .any(|c| self.codes.iter().any(|known| c.eq_ignore_ascii_case(known)));
        let message_matches =
            self.messages.is_empty() || self.messages.iter().any(|m| message.contains(m));

        registry_matches && status_matches && code_matches && message_matches
    }
}

/// Classify a registry error
#[must_use]
pub fn classify(err: &RegistryError) -> ErrorClass {
    match err {
        RegistryError::Api {
            registry,
            status,
            codes,
            message,
        } => classify_response(registry, *status, codes, message),
        RegistryError::Auth {
            registry,
            status,
            message,
        } => classify_response(registry, *status, &[], message),
        // No answer from the registry says nothing about the image.
        RegistryError::Http(_)
        | RegistryError::Transport { .. }
        | RegistryError::InvalidReference(_)
        | RegistryError::InvalidCredentials(_)
        | RegistryError::Serialization(_) => ErrorClass::Other,
    }
}

fn classify_response(registry: &str, status: u16, codes: &[String], message: &str) -> ErrorClass {
    let registry = registry.to_ascii_lowercase();
    let message = message.to_ascii_lowercase();
    RULES
        .iter()
        .find(|rule| rule.matches(&registry, status, codes, &message))
        .map_or(ErrorClass::Other, |rule| rule.class)
}

/// True if the error means the image (or its repository) does not exist
#[must_use]
pub fn is_image_not_found_err(err: &RegistryError) -> bool {
    classify(err) == ErrorClass::ImageNotFound
}

/// True if the error means the caller lacks permission
#[must_use]
pub fn is_access_denied_err(err: &RegistryError) -> bool {
    classify(err) == ErrorClass::AccessDenied
}

/// True if a failed delete is acceptable for a best-effort pruning pass:
/// the image was already gone, or we are not allowed to delete it.
#[must_use]
pub fn is_tolerable_delete_err(err: &RegistryError) -> bool {
    matches!(classify(err), ErrorClass::ImageNotFound | ErrorClass::AccessDenied)
}

impl RegistryError {
    /// Classification of this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        classify(self)
    }
}
