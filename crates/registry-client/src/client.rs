//! OCI distribution API client
//!
//! Implements the two manifest operations the controllers need:
//! `GET /v2/<repository>/manifests/<reference>` and
//! `DELETE /v2/<repository>/manifests/<digest>`, with token authentication.

use crate::auth::{Challenge, RegistryCredentials, parse_challenge};
use crate::error::RegistryError;
use crate::reference::ImageReference;
use crate::registry_trait::RegistryClientTrait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Result of inspecting an image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInspection {
    /// Manifest (or index) document
    pub manifest: serde_json::Value,
    /// Content digest of the manifest
    pub digest: String,
    /// Manifest media type, when the registry reported one
    pub media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry API client
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: Client,
}

impl RegistryClient {
    /// Create a new registry client with a 30 second request timeout
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new registry client with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("oslayer-registry-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn manifest_url(reference: &ImageReference, manifest_reference: &str) -> String {
        format!(
            "https://{}/v2/{}/manifests/{}",
            reference.api_host(),
            reference.repository,
            manifest_reference
        )
    }

    /// Send a request, answering one authentication challenge if the registry issues it.
    async fn send(
        &self,
        method: Method,
        url: &str,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
        actions: &str,
    ) -> Result<Response, RegistryError> {
        let request = || self.client.request(method.clone(), url).header(ACCEPT, MANIFEST_MEDIA_TYPES);

        let response = self.execute(request(), reference).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);

        let authorized = match (challenge, credentials) {
            (Some(Challenge::Bearer { realm, service, scope }), _) => {
                let scope = scope
                    .filter(|_| actions == "pull")
                    .unwrap_or_else(|| format!("repository:{}:{actions}", reference.repository));
                let token = self
                    .fetch_token(&realm, service.as_deref(), &scope, reference, credentials)
                    .await?;
                request().bearer_auth(token)
            }
            (Some(Challenge::Basic), RegistryCredentials::Basic { username, password }) => {
                request().basic_auth(username, Some(password))
            }
            _ => return Ok(response),
        };

        self.execute(authorized, reference).await
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        reference: &ImageReference,
    ) -> Result<Response, RegistryError> {
        request.send().await.map_err(|e| RegistryError::Transport {
            registry: reference.registry.clone(),
            message: e.to_string(),
        })
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String, RegistryError> {
        debug!("Requesting registry token from {} for scope {}", realm, scope);

        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        let mut request = self.client.get(realm).query(&query);
        if let RegistryCredentials::Basic { username, password } = credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = self.execute(request, reference).await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| RegistryError::Transport {
            registry: reference.registry.clone(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(RegistryError::Auth {
                registry: reference.registry.clone(),
                status: status.as_u16(),
                message: body.trim().chars().take(512).collect(),
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Auth {
                registry: reference.registry.clone(),
                status: status.as_u16(),
                message: "token response contained no token".to_string(),
            })
    }

    async fn api_error(reference: &ImageReference, response: Response) -> RegistryError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        RegistryError::from_response(&reference.registry, status, &body)
    }

    /// Resolve a reference to its manifest digest without downloading the manifest
    pub async fn resolve_digest(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String, RegistryError> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let url = Self::manifest_url(reference, reference.manifest_reference());
        let response = self.send(Method::HEAD, &url, reference, credentials, "pull").await?;
        if !response.status().is_success() {
            return Err(Self::api_error(reference, response).await);
        }
        match digest_header(response.headers()) {
            Some(digest) => Ok(digest),
            None => Ok(self.inspect(reference, credentials).await?.digest),
        }
    }
}

fn digest_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait::async_trait]
impl RegistryClientTrait for RegistryClient {
    async fn inspect(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<ImageInspection, RegistryError> {
        let url = Self::manifest_url(reference, reference.manifest_reference());
        debug!("Inspecting {}", reference);

        let response = self.send(Method::GET, &url, reference, credentials, "pull").await?;
        if !response.status().is_success() {
            return Err(Self::api_error(reference, response).await);
        }

        let header_digest = digest_header(response.headers());
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| RegistryError::Transport {
            registry: reference.registry.clone(),
            message: e.to_string(),
        })?;

        let digest = header_digest
            .unwrap_or_else(|| format!("sha256:{}", hex::encode(Sha256::digest(&body))));
        let manifest = serde_json::from_slice(&body)?;

        Ok(ImageInspection {
            manifest,
            digest,
            media_type,
        })
    }

    async fn delete(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<(), RegistryError> {
        let digest = self.resolve_digest(reference, credentials).await?;
        let url = Self::manifest_url(reference, &digest);
        debug!("Deleting {}@{}", reference.repository_pullspec(), digest);

        let response = self
            .send(Method::DELETE, &url, reference, credentials, "pull,push,delete")
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(reference, response).await)
        }
    }
}
