//! Registry client errors

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when talking to an image registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// HTTP client construction or protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The request never produced a response (DNS, TLS, connection reset, timeout)
    #[error("Transport error talking to {registry}: {message}")]
    Transport {
        /// Registry host
        registry: String,
        /// Underlying error text
        message: String,
    },

    /// The registry answered with a non-success status
    #[error("Registry {registry} returned {status}: {message}")]
    Api {
        /// Registry host
        registry: String,
        /// HTTP status code
        status: u16,
        /// Distribution error codes from the response body (e.g. `MANIFEST_UNKNOWN`)
        codes: Vec<String>,
        /// Error messages from the response body, or the raw body
        message: String,
    },

    /// The token service refused to issue a token
    #[error("Authentication with {registry} failed ({status}): {message}")]
    Auth {
        /// Registry host
        registry: String,
        /// HTTP status code from the token endpoint
        status: u16,
        /// Response body
        message: String,
    },

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Credential payload could not be used
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Build an API error from a status code and response body.
    ///
    /// Understands the distribution spec error envelope
    /// `{"errors":[{"code":"...","message":"..."}]}` and falls back to the raw body.
    #[must_use]
    pub fn from_response(registry: &str, status: u16, body: &str) -> Self {
        let (codes, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) if !envelope.errors.is_empty() => {
                let codes = envelope.errors.iter().map(|e| e.code.clone()).collect();
                let message = envelope
                    .errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ");
                (codes, message)
            }
            _ => (Vec::new(), body.trim().chars().take(512).collect()),
        };

        Self::Api {
            registry: registry.to_string(),
            status,
            codes,
            message,
        }
    }

    /// Registry host the error came from, when known
    #[must_use]
    pub fn registry(&self) -> Option<&str> {
        match self {
            Self::Transport { registry, .. }
            | Self::Api { registry, .. }
            | Self::Auth { registry, .. } => Some(registry),
            _ => None,
        }
    }

    /// HTTP status code, when the registry answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Auth { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}
