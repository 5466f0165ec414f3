//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use std::time::Duration;

/// Runtime configuration for the build controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildControllerConfig {
    /// Namespace to watch; `None` uses the client's default namespace
    pub namespace: Option<String>,
    /// Total attempts a build gets before it is Failed
    pub max_retries: u32,
    /// Delay between attempts, and the poll interval while a build is in flight
    pub update_delay: Duration,
    /// Pools reconciled concurrently
    pub workers: usize,
    /// Upper bound on a single API call
    pub api_timeout: Duration,
    /// Requeue interval for idle pools
    pub resync_interval: Duration,
    /// Image pruning period; `None` disables pruning
    pub prune_interval: Option<Duration>,
    /// Image that runs the build script
    pub builder_image: String,
    /// Image containing the in-pod configuration applier
    pub build_context_image: String,
}

impl Default for BuildControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            max_retries: 3,
            update_delay: Duration::from_secs(5),
            workers: 5,
            api_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
            prune_interval: Some(Duration::from_secs(600)),
            builder_image: "quay.io/buildah/stable:latest".to_string(),
            build_context_image: "quay.io/microscaler/os-build-context:latest".to_string(),
        }
    }
}

impl BuildControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_retries = parse_or(&get, "MAX_RETRIES", defaults.max_retries)?;
        if max_retries == 0 {
            return Err(ControllerError::InvalidConfig(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        let workers = parse_or(&get, "WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig("WORKERS must be at least 1".to_string()));
        }
        let prune_secs: u64 = parse_or(
            &get,
            "PRUNE_INTERVAL_SECS",
            defaults.prune_interval.map_or(0, |d| d.as_secs()),
        )?;

        Ok(Self {
            namespace: get("WATCH_NAMESPACE"),
            max_retries,
            update_delay: Duration::from_secs(parse_or(
                &get,
                "UPDATE_DELAY_SECS",
                defaults.update_delay.as_secs(),
            )?),
            workers,
            api_timeout: Duration::from_secs(parse_or(
                &get,
                "API_TIMEOUT_SECS",
                defaults.api_timeout.as_secs(),
            )?),
            resync_interval: Duration::from_secs(parse_or(
                &get,
                "RESYNC_INTERVAL_SECS",
                defaults.resync_interval.as_secs(),
            )?),
            prune_interval: (prune_secs > 0).then(|| Duration::from_secs(prune_secs)),
            builder_image: get("BUILDER_IMAGE").unwrap_or(defaults.builder_image),
            build_context_image: get("BUILD_CONTEXT_IMAGE").unwrap_or(defaults.build_context_image),
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}
