//! Canonical credential secrets.
//!
//! Operators hand the controller pull and push secrets in whatever docker
//! config flavour they have. Build pods and the pruner only ever consume a
//! canonical copy: a `kubernetes.io/dockerconfigjson` secret whose payload is
//! normalized and whose name is derived from the payload's fingerprint, so the
//! same credentials always map to the same object no matter how many workers
//! race to produce it. Each canonical secret lists the sources that map to it
//! and is deleted once that list is empty.

use crate::error::ControllerError;
use crate::store::{CONFLICT_RETRIES, ClusterStore, StoreError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::labels::{
    CANONICAL_SECRET_LABEL, CANONICAL_SECRET_SUFFIX, K8S_MANAGED_BY, MANAGED_BY_BUILD_CONTROLLER,
    ORIGINAL_SECRET_NAME_LABEL, SECRET_FINGERPRINT_ANNOTATION, SOURCE_SECRETS_ANNOTATION,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use registry_client::RegistryCredentials;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Data key of a `kubernetes.io/dockerconfigjson` secret
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
/// Data key of a legacy `kubernetes.io/dockercfg` secret
pub const DOCKER_CFG_KEY: &str = ".dockercfg";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Normalize a docker config payload into sorted, compact `{"auths":{...}}` JSON.
///
/// Returns the reason the payload is unusable on failure.
pub fn normalize_docker_config(key: &str, raw: &[u8]) -> Result<Vec<u8>, String> {
    let parsed: Value =
        serde_json::from_slice(raw).map_err(|e| format!("{key} is not valid JSON: {e}"))?;
    let auths = match (key, parsed) {
        (DOCKER_CONFIG_JSON_KEY, Value::Object(mut root)) => match root.remove("auths") {
            Some(Value::Object(auths)) => auths,
            Some(_) => return Err("auths is not an object".to_string()),
            None => return Err(format!("{key} has no auths")),
        },
        (DOCKER_CFG_KEY, Value::Object(auths)) => auths,
        (_, _) => return Err(format!("{key} is not a JSON object")),
    };
    if auths.is_empty() {
        return Err("auths is empty".to_string());
    }

    let mut normalized = BTreeMap::new();
    for (registry, entry) in auths {
        let Value::Object(mut entry) = entry else {
            return Err(format!("auth entry for {registry} is not an object"));
        };
        if !entry.contains_key("auth") {
            if let (Some(Value::String(user)), Some(Value::String(pass))) =
                (entry.get("username"), entry.get("password"))
            {
                let encoded = STANDARD.encode(format!("{user}:{pass}"));
                entry.insert("auth".to_string(), Value::String(encoded));
            }
        }
        normalized.insert(normalize_registry_key(&registry), sort_keys(Value::Object(entry)));
    }

    let mut root = Map::new();
    root.insert(
        "auths".to_string(),
        Value::Object(normalized.into_iter().collect()),
    );
    serde_json::to_vec(&Value::Object(root)).map_err(|e| e.to_string())
}

fn normalize_registry_key(key: &str) -> String {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.trim_end_matches('/').to_string()
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// sha256 hex of a normalized payload
#[must_use]
pub fn fingerprint(normalized: &[u8]) -> String {
    hex::encode(Sha256::digest(normalized))
}

/// Name of the canonical secret for a fingerprint
#[must_use]
pub fn canonical_name(fingerprint: &str) -> String {
    format!("{fingerprint}{CANONICAL_SECRET_SUFFIX}")
}

/// True if the secret was produced by the canonicalizer
#[must_use]
pub fn is_canonical(secret: &Secret) -> bool {
    secret
        .labels()
        .get(CANONICAL_SECRET_LABEL)
        .is_some_and(|v| v == "true")
}

/// Credentials for `registry` from a canonical secret
pub fn registry_credentials(
    secret: &Secret,
    registry: &str,
) -> Result<RegistryCredentials, ControllerError> {
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
        .ok_or_else(|| ControllerError::MalformedSecret {
            name: secret.name_any(),
            reason: format!("missing {DOCKER_CONFIG_JSON_KEY}"),
        })?;
    Ok(RegistryCredentials::from_docker_config(&payload.0, registry)?)
}

/// Produces and garbage-collects canonical secrets
#[derive(Clone)]
pub struct SecretCanonicalizer {
    store: Arc<dyn ClusterStore>,
}

impl SecretCanonicalizer {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// Ensure the canonical secret for `name` exists and return it.
    ///
    /// `name` may be an operator secret or a canonical secret; the latter is
    /// followed back to its source. Concurrent callers converge on one object.
    pub async fn canonicalize(&self, name: &str) -> Result<Secret, ControllerError> {
        let mut attempt = 1;
        loop {
            match self.try_canonicalize(name).await {
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    debug!("Conflict canonicalizing secret {} (attempt {}): {}", name, attempt, e);
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_canonicalize(&self, name: &str) -> Result<Secret, ControllerError> {
        let source = self.get_source(name).await?;
        if is_canonical(&source) {
            // A canonical secret whose sources are gone stays usable as is
            return Ok(source);
        }
        let source_name = source.name_any();

        let normalized = normalized_payload(&source)?;
        let fingerprint = fingerprint(&normalized);
        let desired_name = canonical_name(&fingerprint);

        let canonical = match self.store.get_secret(&desired_name).await {
            Ok(mut existing) => {
                let mut sources = source_set(&existing);
                let added = sources.insert(source_name.clone());
                let repair = !payload_matches(&existing, &normalized);
                if !added && !repair {
                    existing
                } else {
                    if repair {
                        info!("Repairing canonical secret {} for {}", desired_name, source_name);
                        existing.data = Some(canonical_data(normalized));
                        existing.type_ = Some(DOCKER_CONFIG_JSON_TYPE.to_string());
                    } else {
                        debug!("Canonical secret {} now also backs {}", desired_name, source_name);
                    }
                    set_source_set(&mut existing, &sources);
                    self.store
                        .replace_secret(&existing)
                        .await
                        .map_err(|e| vanished_as_conflict(e, "canonical secret deleted concurrently"))?
                }
            }
            Err(StoreError::NotFound { .. }) => {
                let secret =
                    new_canonical_secret(&desired_name, &source_name, &fingerprint, normalized);
                let created = self.store.create_secret(&secret).await?;
                info!("Created canonical secret {} for {}", desired_name, source_name);
                created
            }
            Err(e) => return Err(e.into()),
        };

        // List before re-reading the source: anything a caller with newer
        // content creates after this point is never released here.
        let stale = self.stale_references(&source_name, &desired_name).await?;
        self.ensure_source_unchanged(&source_name, &fingerprint).await?;
        self.release(&source_name, stale).await?;
        Ok(canonical)
    }

    /// Fetch `name`, following a canonical secret to a live source
    async fn get_source(&self, name: &str) -> Result<Secret, ControllerError> {
        let secret = self.store.get_secret(name).await.map_err(|e| match e {
            StoreError::NotFound { .. } => ControllerError::SecretNotFound(name.to_string()),
            other => other.into(),
        })?;
        if !is_canonical(&secret) {
            return Ok(secret);
        }
        for original in source_set(&secret) {
            match self.store.get_secret(&original).await {
                Ok(source) if !is_canonical(&source) => return Ok(source),
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(secret)
    }

    /// Fail with a conflict if `source` no longer normalizes to `expected`.
    ///
    /// A caller holding an old read must not clean up after a caller holding a
    /// newer one; the retry re-reads the source and converges.
    async fn ensure_source_unchanged(
        &self,
        source: &str,
        expected: &str,
    ) -> Result<(), ControllerError> {
        let current = self.store.get_secret(source).await.map_err(|e| {
            vanished_as_conflict(e, "source secret deleted while canonicalizing")
        })?;
        let unchanged = normalized_payload(&current).is_ok_and(|n| fingerprint(&n) == expected);
        if unchanged {
            return Ok(());
        }
        Err(StoreError::Conflict {
            kind: "Secret",
            name: source.to_string(),
            message: "source secret changed while canonicalizing".to_string(),
        }
        .into())
    }

    /// Other canonical secrets that still list `source` as a back-reference
    async fn stale_references(
        &self,
        source: &str,
        keep: &str,
    ) -> Result<Vec<Secret>, ControllerError> {
        let selector = format!("{CANONICAL_SECRET_LABEL}=true");
        Ok(self
            .store
            .list_secrets(&selector)
            .await?
            .into_iter()
            .filter(|s| s.name_any() != keep && source_set(s).contains(source))
            .collect())
    }

    /// Drop `source` from each stale secret, deleting the ones nothing else references.
    ///
    /// Writes are guarded by the listed resourceVersion.
    async fn release(&self, source: &str, stale: Vec<Secret>) -> Result<(), ControllerError> {
        for mut secret in stale {
            let name = secret.name_any();
            let mut sources = source_set(&secret);
            sources.remove(source);

            let result = if sources.is_empty() {
                let version = secret.resource_version();
                self.store.delete_secret(&name, version.as_deref()).await
            } else {
                set_source_set(&mut secret, &sources);
                self.store.replace_secret(&secret).await.map(|_| ())
            };
            match result {
                Ok(()) if sources.is_empty() => {
                    info!("Deleted stale canonical secret {} for {}", name, source);
                }
                Ok(()) => info!(
                    "Released canonical secret {} from {}; still backs {}",
                    name,
                    source,
                    join_sources(&sources)
                ),
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Turn a NotFound into a retryable conflict
fn vanished_as_conflict(err: StoreError, message: &str) -> StoreError {
    match err {
        StoreError::NotFound { kind, name } => StoreError::Conflict {
            kind,
            name,
            message: message.to_string(),
        },
        other => other,
    }
}

/// Names of the source secrets a canonical secret backs
fn source_set(secret: &Secret) -> BTreeSet<String> {
    match secret.annotations().get(SOURCE_SECRETS_ANNOTATION) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        // Written before the annotation existed
        None => secret
            .labels()
            .get(ORIGINAL_SECRET_NAME_LABEL)
            .into_iter()
            .cloned()
            .collect(),
    }
}

fn join_sources(sources: &BTreeSet<String>) -> String {
    sources.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Store `sources` on the secret, keeping the back-reference label on a live entry
fn set_source_set(secret: &mut Secret, sources: &BTreeSet<String>) {
    secret
        .annotations_mut()
        .insert(SOURCE_SECRETS_ANNOTATION.to_string(), join_sources(sources));
    let labels = secret.labels_mut();
    let current = labels.get(ORIGINAL_SECRET_NAME_LABEL);
    if !current.is_some_and(|name| sources.contains(name)) {
        if let Some(first) = sources.first() {
            labels.insert(ORIGINAL_SECRET_NAME_LABEL.to_string(), first.clone());
        }
    }
}

fn normalized_payload(source: &Secret) -> Result<Vec<u8>, ControllerError> {
    let (key, raw) = payload(source)?;
    normalize_docker_config(key, raw).map_err(|reason| ControllerError::MalformedSecret {
        name: source.name_any(),
        reason,
    })
}

fn payload(secret: &Secret) -> Result<(&'static str, &[u8]), ControllerError> {
    let data = secret.data.as_ref();
    [DOCKER_CONFIG_JSON_KEY, DOCKER_CFG_KEY]
        .into_iter()
        .find_map(|key| data.and_then(|d| d.get(key)).map(|v| (key, v.0.as_slice())))
        .ok_or_else(|| ControllerError::MalformedSecret {
            name: secret.name_any(),
            reason: format!("neither {DOCKER_CONFIG_JSON_KEY} nor {DOCKER_CFG_KEY} is set"),
        })
}

fn payload_matches(secret: &Secret, normalized: &[u8]) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
        .is_some_and(|v| v.0 == normalized)
}

fn canonical_data(normalized: Vec<u8>) -> BTreeMap<String, ByteString> {
    BTreeMap::from([(DOCKER_CONFIG_JSON_KEY.to_string(), ByteString(normalized))])
}

fn new_canonical_secret(
    name: &str,
    source: &str,
    fingerprint: &str,
    normalized: Vec<u8>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([
                (CANONICAL_SECRET_LABEL.to_string(), "true".to_string()),
                (ORIGINAL_SECRET_NAME_LABEL.to_string(), source.to_string()),
                (K8S_MANAGED_BY.to_string(), MANAGED_BY_BUILD_CONTROLLER.to_string()),
            ])),
            annotations: Some(BTreeMap::from([
                (SECRET_FINGERPRINT_ANNOTATION.to_string(), fingerprint.to_string()),
                (SOURCE_SECRETS_ANNOTATION.to_string(), source.to_string()),
            ])),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(canonical_data(normalized)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::test_utils::{create_test_secret, docker_config_json, legacy_docker_cfg};

    fn setup() -> (Arc<MemoryStore>, SecretCanonicalizer) {
        let store = Arc::new(MemoryStore::new());
        let canonicalizer = SecretCanonicalizer::new(store.clone());
        (store, canonicalizer)
    }

    fn canonical_secrets(store: &MemoryStore) -> Vec<Secret> {
        store.secrets().into_iter().filter(is_canonical).collect()
    }

    fn normalized_source(store: &MemoryStore, name: &str) -> Vec<u8> {
        normalized_payload(&store.secret(name).unwrap()).unwrap()
    }

    #[test]
    fn test_normalize_sorts_and_strips_scheme() {
        let raw = br#"{"auths":{"https://quay.io/":{"password":"p","username":"u"}}}"#;
        let normalized = normalize_docker_config(DOCKER_CONFIG_JSON_KEY, raw).unwrap();
        let expected = format!(
            r#"{{"auths":{{"quay.io":{{"auth":"{}","password":"p","username":"u"}}}}}}"#,
            STANDARD.encode("u:p")
        );
        assert_eq!(String::from_utf8(normalized).unwrap(), expected);
    }

    #[test]
    fn test_legacy_and_modern_formats_share_fingerprint() {
        let modern = normalize_docker_config(
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "secret"),
        )
        .unwrap();
        let legacy =
            normalize_docker_config(DOCKER_CFG_KEY, &legacy_docker_cfg("https://quay.io", "robot", "secret"))
                .unwrap();
        assert_eq!(fingerprint(&modern), fingerprint(&legacy));
    }

    #[test]
    fn test_normalize_rejects_bad_payloads() {
        assert!(normalize_docker_config(DOCKER_CONFIG_JSON_KEY, b"not json").is_err());
        assert!(normalize_docker_config(DOCKER_CONFIG_JSON_KEY, br#"{"auths":{}}"#).is_err());
        assert!(normalize_docker_config(DOCKER_CONFIG_JSON_KEY, br#"{"other":{}}"#).is_err());
        assert!(normalize_docker_config(DOCKER_CFG_KEY, br#"["quay.io"]"#).is_err());
    }

    #[tokio::test]
    async fn test_canonicalize_creates_labelled_secret() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));

        let canonical = canonicalizer.canonicalize("pull").await.unwrap();

        let name = canonical.name_any();
        assert!(name.ends_with(CANONICAL_SECRET_SUFFIX));
        assert_eq!(name.len(), 64 + CANONICAL_SECRET_SUFFIX.len());
        assert_eq!(canonical.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
        assert_eq!(
            canonical.labels().get(ORIGINAL_SECRET_NAME_LABEL).map(String::as_str),
            Some("pull")
        );
        assert_eq!(
            canonical.annotations().get(SECRET_FINGERPRINT_ANNOTATION).map(String::as_str),
            name.strip_suffix(CANONICAL_SECRET_SUFFIX)
        );
        assert_eq!(source_set(&canonical), BTreeSet::from(["pull".to_string()]));
        assert!(registry_credentials(&canonical, "quay.io").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_canonicalization_produces_one_object() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));
        let expected = normalized_source(&store, "pull");

        let tasks: Vec<_> = (0..11)
            .map(|_| {
                let canonicalizer = canonicalizer.clone();
                tokio::spawn(async move { canonicalizer.canonicalize("pull").await })
            })
            .collect();

        let mut names = Vec::new();
        for task in tasks {
            let canonical = task.await.unwrap().unwrap();
            assert!(payload_matches(&canonical, &expected));
            names.push(canonical.name_any());
        }
        names.dedup();
        assert_eq!(names.len(), 1);

        let stored = canonical_secrets(&store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name_any(), canonical_name(&fingerprint(&expected)));
        assert!(payload_matches(&stored[0], &expected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_canonicalization_during_edit_converges_on_new_content() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));

        let spawn = |canonicalizer: SecretCanonicalizer| {
            tokio::spawn(async move { canonicalizer.canonicalize("pull").await })
        };
        let mut tasks: Vec<_> = (0..8).map(|_| spawn(canonicalizer.clone())).collect();
        tokio::task::yield_now().await;
        store.edit_secret_data(
            "pull",
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "rotated"),
        );
        tasks.extend((0..8).map(|_| spawn(canonicalizer.clone())));

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let expected = normalized_source(&store, "pull");
        let stored = canonical_secrets(&store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name_any(), canonical_name(&fingerprint(&expected)));
        assert!(payload_matches(&stored[0], &expected));
        assert_eq!(source_set(&stored[0]), BTreeSet::from(["pull".to_string()]));
    }

    #[tokio::test]
    async fn test_stale_reader_does_not_remove_newer_canonical() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));
        let old = canonicalizer.canonicalize("pull").await.unwrap().name_any();

        // The first caller reads the old content and stalls
        let (reached, release) = store.hold_next_secret_read("pull");
        let stale = {
            let canonicalizer = canonicalizer.clone();
            tokio::spawn(async move { canonicalizer.canonicalize("pull").await })
        };
        reached.notified().await;

        store.edit_secret_data(
            "pull",
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "rotated"),
        );
        let fresh = canonicalizer.canonicalize("pull").await.unwrap().name_any();
        assert_ne!(fresh, old);
        assert!(store.secret(&old).is_none());

        release.notify_one();
        let stale = stale.await.unwrap().unwrap();

        assert_eq!(stale.name_any(), fresh);
        let remaining: Vec<_> = canonical_secrets(&store).iter().map(ResourceExt::name_any).collect();
        assert_eq!(remaining, vec![fresh]);
    }

    #[tokio::test]
    async fn test_shared_canonical_survives_edit_of_one_source() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));
        store.insert_secret(create_test_secret("push", "quay.io", false));
        let shared = canonicalizer.canonicalize("pull").await.unwrap().name_any();
        assert_eq!(canonicalizer.canonicalize("push").await.unwrap().name_any(), shared);
        assert_eq!(
            source_set(&store.secret(&shared).unwrap()),
            BTreeSet::from(["pull".to_string(), "push".to_string()])
        );

        store.edit_secret_data(
            "pull",
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "rotated"),
        );
        let rotated = canonicalizer.canonicalize("pull").await.unwrap().name_any();
        assert_ne!(rotated, shared);

        let kept = store.secret(&shared).unwrap();
        assert_eq!(source_set(&kept), BTreeSet::from(["push".to_string()]));
        assert_eq!(
            kept.labels().get(ORIGINAL_SECRET_NAME_LABEL).map(String::as_str),
            Some("push")
        );
        assert_eq!(canonicalizer.canonicalize("push").await.unwrap().name_any(), shared);

        // Once the last source moves away the shared secret goes too
        store.edit_secret_data(
            "push",
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "rotated"),
        );
        assert_eq!(canonicalizer.canonicalize("push").await.unwrap().name_any(), rotated);
        assert!(store.secret(&shared).is_none());
        assert_eq!(
            source_set(&store.secret(&rotated).unwrap()),
            BTreeSet::from(["pull".to_string(), "push".to_string()])
        );
    }

    #[tokio::test]
    async fn test_edit_converges_to_single_canonical_secret() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));
        let first = canonicalizer.canonicalize("pull").await.unwrap().name_any();

        store.edit_secret_data(
            "pull",
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "rotated"),
        );
        let second = canonicalizer.canonicalize("pull").await.unwrap().name_any();

        assert_ne!(first, second);
        let remaining: Vec<_> = canonical_secrets(&store).iter().map(ResourceExt::name_any).collect();
        assert_eq!(remaining, vec![second]);
    }

    #[tokio::test]
    async fn test_canonical_input_follows_back_reference() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));
        let canonical = canonicalizer.canonicalize("pull").await.unwrap().name_any();

        let again = canonicalizer.canonicalize(&canonical).await.unwrap();
        assert_eq!(again.name_any(), canonical);

        store.edit_secret_data(
            "pull",
            DOCKER_CONFIG_JSON_KEY,
            &docker_config_json("quay.io", "robot", "rotated"),
        );
        let followed = canonicalizer.canonicalize(&canonical).await.unwrap();
        assert_ne!(followed.name_any(), canonical);
    }

    #[tokio::test]
    async fn test_canonical_input_without_source_is_returned() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("pull", "quay.io", false));
        let canonical = canonicalizer.canonicalize("pull").await.unwrap().name_any();
        store.delete_secret("pull", None).await.unwrap();

        let again = canonicalizer.canonicalize(&canonical).await.unwrap();
        assert_eq!(again.name_any(), canonical);
    }

    #[tokio::test]
    async fn test_missing_and_malformed_sources() {
        let (store, canonicalizer) = setup();
        let err = canonicalizer.canonicalize("absent").await.unwrap_err();
        assert!(matches!(err, ControllerError::SecretNotFound(ref n) if n == "absent"));
        assert!(err.is_input_error());

        store.insert_secret(create_test_secret("pull", "quay.io", false));
        store.edit_secret_data("pull", DOCKER_CONFIG_JSON_KEY, b"{\"auths\":{}}");
        let err = canonicalizer.canonicalize("pull").await.unwrap_err();
        assert!(matches!(err, ControllerError::MalformedSecret { .. }));
        assert!(canonical_secrets(&store).is_empty());
    }

    #[tokio::test]
    async fn test_legacy_source_is_canonicalized() {
        let (store, canonicalizer) = setup();
        store.insert_secret(create_test_secret("legacy", "quay.io", true));
        store.insert_secret(create_test_secret("modern", "quay.io", false));

        let legacy = canonicalizer.canonicalize("legacy").await.unwrap();
        let modern = canonicalizer.canonicalize("modern").await.unwrap();
        assert_eq!(legacy.data, modern.data);
    }
}
