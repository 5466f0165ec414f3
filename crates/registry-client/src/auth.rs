//! Registry credentials and authentication challenges
//!
//! Credentials come from dockerconfigjson payloads (the canonical secrets the
//! build controller maintains). Challenges come from `WWW-Authenticate` headers.

use crate::error::RegistryError;
use crate::reference::DOCKER_HUB_ALIASES;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Credentials scoped to one registry
#[derive(Clone, Default, PartialEq, Eq)]
pub enum RegistryCredentials {
    /// No credentials; only anonymous tokens are requested
    #[default]
    Anonymous,
    /// Username and password (or token) for basic auth and token exchange
    Basic {
        /// Username
        username: String,
        /// Password or access token
        password: String,
    },
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl RegistryCredentials {
    /// Look up the credentials for `registry` in a dockerconfigjson payload.
    ///
    /// Keys may carry a scheme or path (`https://index.docker.io/v1/`); only the
    /// host part is compared. A registry with no matching entry is anonymous.
    pub fn from_docker_config(config: &[u8], registry: &str) -> Result<Self, RegistryError> {
        let config: DockerConfigJson = serde_json::from_slice(config)
            .map_err(|e| RegistryError::InvalidCredentials(format!("invalid docker config: {e}")))?;

        let wanted = registry.to_ascii_lowercase();
        let wanted_is_hub = DOCKER_HUB_ALIASES.contains(&wanted.as_str());

        let entry = config.auths.iter().find_map(|(key, entry)| {
            let host = registry_host(key);
            let matches = host == wanted
                || (wanted_is_hub && DOCKER_HUB_ALIASES.contains(&host.as_str()));
            matches.then_some(entry)
        });

        match entry {
            None => Ok(Self::Anonymous),
            Some(entry) => Self::from_entry(entry, registry),
        }
    }

    fn from_entry(entry: &DockerAuthEntry, registry: &str) -> Result<Self, RegistryError> {
        if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD.decode(auth.trim()).map_err(|e| {
                RegistryError::InvalidCredentials(format!("auth for {registry} is not base64: {e}"))
            })?;
            let decoded = String::from_utf8(decoded).map_err(|e| {
                RegistryError::InvalidCredentials(format!("auth for {registry} is not UTF-8: {e}"))
            })?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                RegistryError::InvalidCredentials(format!("auth for {registry} is not user:password"))
            })?;
            return Ok(Self::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => Ok(Self::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Ok(Self::Anonymous),
        }
    }
}

/// Host part of a docker config key (`https://quay.io/v2/` -> `quay.io`)
#[must_use]
pub fn registry_host(key: &str) -> String {
    let key = key.trim();
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key).to_ascii_lowercase()
}

/// Authentication scheme requested by a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

/// Parse a `WWW-Authenticate` header value
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let params = parse_params(params);
    let realm = params.get("realm")?.clone();
    Some(Challenge::Bearer {
        realm,
        service: params.get("service").cloned(),
        scope: params.get("scope").cloned(),
    })
}

// key="value" pairs separated by commas; commas inside quotes belong to the value
fn parse_params(input: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' if in_value => in_quotes = !in_quotes,
            '=' if !in_value => in_value = true,
            ',' if !in_quotes => {
                if !key.trim().is_empty() {
                    params.insert(key.trim().to_ascii_lowercase(), value.clone());
                }
                key.clear();
                value.clear();
                in_value = false;
            }
            _ if in_value => value.push(c),
            _ => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        params.insert(key.trim().to_ascii_lowercase(), value);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_from_auth_field() {
        let auth = STANDARD.encode("robot:s3cret");
        let config = format!(r#"{{"auths":{{"quay.io":{{"auth":"{auth}"}}}}}}"#);
        let creds = RegistryCredentials::from_docker_config(config.as_bytes(), "quay.io").unwrap();
        assert_eq!(
            creds,
            RegistryCredentials::Basic {
                username: "robot".to_string(),
                password: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn test_credentials_docker_hub_alias() {
        let config = r#"{"auths":{"https://index.docker.io/v1/":{"username":"me","password":"pw"}}}"#;
        let creds = RegistryCredentials::from_docker_config(config.as_bytes(), "docker.io").unwrap();
        assert!(matches!(creds, RegistryCredentials::Basic { ref username, .. } if username == "me"));
    }

    #[test]
    fn test_credentials_missing_registry_is_anonymous() {
        let config = r#"{"auths":{"quay.io":{"auth":"cm9ib3Q6cHc="}}}"#;
        let creds = RegistryCredentials::from_docker_config(config.as_bytes(), "ghcr.io").unwrap();
        assert_eq!(creds, RegistryCredentials::Anonymous);
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = RegistryCredentials::Basic {
            username: "u".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/fedora:pull,push""#;
        assert_eq!(
            parse_challenge(header),
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/fedora:pull,push".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenge() {
        assert_eq!(parse_challenge(r#"Basic realm="Registry""#), Some(Challenge::Basic));
        assert_eq!(parse_challenge("Negotiate"), None);
    }
}
