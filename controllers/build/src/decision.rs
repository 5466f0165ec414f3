//! Build decision engine.
//!
//! Pure function from the observed state of one pool to the single action the
//! reconciler should take. It never fails: bad inputs become
//! [`Decision::MarkDegraded`].

use crds::{
    BuildPhase, ImageBuild, ImageBuildConfig, MachinePool, REASON_BUILD_FAILED,
    REASON_INVALID_BUILD_CONFIG,
};
use std::fmt;

/// Everything the engine looks at
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub pool: &'a MachinePool,
    pub build_config: Option<&'a ImageBuildConfig>,
    /// Every build of the pool, in any order
    pub builds: &'a [ImageBuild],
    /// Validation and credential problems found by the caller
    pub problems: &'a [String],
}

/// Action for the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoOp(NoOpReason),
    StartBuild(StartReason),
    MarkDegraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpReason {
    NotOptedIn,
    NoBuildConfig,
    /// Degraded by someone other than the build controller
    ExternallyDegraded(String),
    /// A build for the desired configuration is already running
    BuildInFlight(String),
    /// A build for an older configuration must finish first
    WaitingForBuild(String),
    UpToDate,
    /// The last build of the desired configuration used up its attempts
    PreviousBuildFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReason {
    NoBuild,
    ForcedRebuild,
    PreviousBuildInterrupted,
    ImageOutOfDate,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::NoOp(reason) => write!(f, "no-op ({reason})"),
            Decision::StartBuild(reason) => write!(f, "start-build ({reason})"),
            Decision::MarkDegraded(message) => write!(f, "mark-degraded ({message})"),
        }
    }
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoOpReason::NotOptedIn => f.write_str("pool is not opted into image building"),
            NoOpReason::NoBuildConfig => f.write_str("pool has no build config"),
            NoOpReason::ExternallyDegraded(reason) => write!(f, "pool is degraded: {reason}"),
            NoOpReason::BuildInFlight(build) => write!(f, "build {build} is in flight"),
            NoOpReason::WaitingForBuild(build) => {
                write!(f, "waiting for build {build} of an older configuration")
            }
            NoOpReason::UpToDate => f.write_str("image is up to date"),
            NoOpReason::PreviousBuildFailed(build) => write!(f, "build {build} failed"),
        }
    }
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartReason::NoBuild => "no build yet",
            StartReason::ForcedRebuild => "rebuild requested",
            StartReason::PreviousBuildInterrupted => "previous build interrupted",
            StartReason::ImageOutOfDate => "image out of date",
        })
    }
}

/// True for Degraded reasons owned by the build controller
#[must_use]
pub fn is_controller_reason(reason: Option<&str>) -> bool {
    matches!(reason, Some(REASON_BUILD_FAILED | REASON_INVALID_BUILD_CONFIG))
}

/// Decide the next action for a pool. First matching rule wins.
#[must_use]
pub fn decide(input: &DecisionInput<'_>) -> Decision {
    let pool = input.pool;
    if !pool.is_layering_enabled() {
        return Decision::NoOp(NoOpReason::NotOptedIn);
    }
    let Some(build_config) = input.build_config else {
        return Decision::NoOp(NoOpReason::NoBuildConfig);
    };

    if let Some(degraded) = pool.degraded() {
        if !is_controller_reason(degraded.reason.as_deref()) {
            let reason = degraded
                .message
                .clone()
                .or_else(|| degraded.reason.clone())
                .unwrap_or_default();
            return Decision::NoOp(NoOpReason::ExternallyDegraded(reason));
        }
    }

    if !input.problems.is_empty() {
        return Decision::MarkDegraded(input.problems.join("; "));
    }

    let desired = pool.desired_configuration();
    if let Some(active) = input.builds.iter().find(|b| !b.is_terminal()) {
        let name = kube::ResourceExt::name_any(active);
        return if active.configuration() == desired {
            Decision::NoOp(NoOpReason::BuildInFlight(name))
        } else {
            Decision::NoOp(NoOpReason::WaitingForBuild(name))
        };
    }

    if pool.rebuild_requested() {
        return Decision::StartBuild(StartReason::ForcedRebuild);
    }

    if build_config.built_configuration() == Some(desired) && build_config.current_image().is_some() {
        return Decision::NoOp(NoOpReason::UpToDate);
    }

    let latest = input
        .builds
        .iter()
        .filter(|b| b.configuration() == desired)
        .max_by_key(|b| b.spec.version);
    match latest.map(|b| (b, b.phase())) {
        Some((build, BuildPhase::Failed)) => {
            Decision::NoOp(NoOpReason::PreviousBuildFailed(kube::ResourceExt::name_any(build)))
        }
        Some((_, BuildPhase::Interrupted)) => {
            Decision::StartBuild(StartReason::PreviousBuildInterrupted)
        }
        None if build_config.current_image().is_none() => Decision::StartBuild(StartReason::NoBuild),
        _ => Decision::StartBuild(StartReason::ImageOutOfDate),
    }
}
