//! Canary rollout: a canary and a stable Deployment derived from one Release.
//!
//! Derivation is a pure function of the parent, so deriving twice yields
//! identical workloads. Materialization is create-if-absent; an existing
//! Deployment with the derived name is left untouched.

use super::RolloutStrategy;
use super::readiness::wait_for_ready;
use crate::client::WorkloadClient;
use crate::crd::Release;
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Label that separates the canary pods from the stable pods.
pub const TRACK_LABEL: &str = "track";

/// Label marking objects this operator created.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "kdeploy-operator";

/// Label naming the parent Release of a derived workload.
pub const RELEASE_LABEL: &str = "kdeploy.io/release";

/// One side of a canary rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    /// Receives the new version first.
    Canary,
    /// Follows once the canary is healthy.
    Stable,
}

impl Track {
    /// Label value and name suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Canary => "canary",
            Track::Stable => "stable",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the workload derived for `track`.
pub fn derived_name(parent: &str, track: Track) -> String {
    format!("{}-{}", parent, track)
}

/// Add the track label to a parent label set; an existing `track` key is an error.
fn with_track(
    labels: Option<&BTreeMap<String, String>>,
    track: Track,
    field: &str,
) -> OperatorResult<BTreeMap<String, String>> {
    let mut merged = labels.cloned().unwrap_or_default();
    if merged.contains_key(TRACK_LABEL) {
        return Err(OperatorError::validation(format!(
            "{field} already sets the reserved label '{TRACK_LABEL}'"
        )));
    }
    merged.insert(TRACK_LABEL.to_string(), track.as_str().to_string());
    Ok(merged)
}

/// Build the Deployment for one track of a Release.
pub fn derive_workload(release: &Release, track: Track) -> OperatorResult<Deployment> {
    let name = release.name_any();
    let namespace = release
        .namespace()
        .ok_or_else(|| OperatorError::validation(format!("release '{name}' has no namespace")))?;
    let selector = release
        .spec
        .selector
        .as_ref()
        .ok_or_else(|| OperatorError::validation(format!("release '{name}' has no selector")))?;

    let selector = LabelSelector {
        match_labels: Some(with_track(
            selector.match_labels.as_ref(),
            track,
            "spec.selector.matchLabels",
        )?),
        match_expressions: selector.match_expressions.clone(),
    };

    let template_meta = release.spec.template.metadata.clone().unwrap_or_default();
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(with_track(
                template_meta.labels.as_ref(),
                track,
                "spec.template.metadata.labels",
            )?),
            ..template_meta
        }),
        spec: release.spec.template.spec.clone(),
    };

    let labels = BTreeMap::from([
        (TRACK_LABEL.to_string(), track.as_str().to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (RELEASE_LABEL.to_string(), name.clone()),
    ]);

    let spec = &release.spec;
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(derived_name(&name, track)),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: release.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.desired_replicas()),
            selector,
            template,
            min_ready_seconds: (spec.min_ready_seconds > 0).then_some(spec.min_ready_seconds),
            revision_history_limit: spec.revision_history_limit,
            progress_deadline_seconds: spec.progress_deadline_seconds,
            paused: None,
            strategy: None,
        }),
        status: None,
    })
}

/// What [`ensure_exists`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The Deployment was created.
    Created,
    /// A Deployment with that name already existed; nothing was written.
    AlreadyExists,
}

/// Create `desired` unless a Deployment with its name already exists.
pub async fn ensure_exists(
    workloads: &dyn WorkloadClient,
    desired: &Deployment,
) -> OperatorResult<EnsureOutcome> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();

    if workloads.get(&namespace, &name).await?.is_some() {
        debug!(namespace = %namespace, name = %name, "Workload exists, skipping create");
        return Ok(EnsureOutcome::AlreadyExists);
    }

    match workloads.create(&namespace, desired).await {
        Ok(_) => {
            info!(namespace = %namespace, name = %name, "Created workload");
            Ok(EnsureOutcome::Created)
        }
        // Lost a race with another writer; the object exists either way
        Err(OperatorError::KubeError(kube::Error::Api(resp))) if resp.code == 409 => {
            debug!(namespace = %namespace, name = %name, "Workload created concurrently");
            Ok(EnsureOutcome::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}

/// Canary engine tunables.
#[derive(Debug, Clone)]
pub struct CanaryConfig {
    /// Upper bound on waiting for the canary to become ready; zero skips the gate.
    pub health_timeout: Duration,
    /// Delay between readiness checks.
    pub health_poll_interval: Duration,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(120),
            health_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Canary strategy: canary first, readiness gate, then stable.
pub struct CanaryStrategy {
    workloads: Arc<dyn WorkloadClient>,
    config: CanaryConfig,
    cancel: CancellationToken,
}

impl CanaryStrategy {
    /// Create a canary strategy that writes through `workloads`.
    pub fn new(
        workloads: Arc<dyn WorkloadClient>,
        config: CanaryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workloads,
            config,
            cancel,
        }
    }

    fn validate(release: &Release) -> OperatorResult<()> {
        let name = release.meta().name.as_deref().unwrap_or_default();
        if name.is_empty() {
            return Err(OperatorError::validation("release has an empty name"));
        }
        if release.namespace().is_none_or(|ns| ns.is_empty()) {
            return Err(OperatorError::validation(format!(
                "release '{name}' has no namespace"
            )));
        }
        if release.spec.selector.is_none() {
            return Err(OperatorError::validation(format!(
                "release '{name}' has no selector"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RolloutStrategy for CanaryStrategy {
    fn name(&self) -> &'static str {
        "Canary"
    }

    #[instrument(skip(self, release), fields(name = %release.name_any(), namespace = ?release.namespace()))]
    async fn run(&self, release: &Release) -> OperatorResult<()> {
        Self::validate(release)?;

        // Derive both up front so a bad parent fails before any write
        let canary = derive_workload(release, Track::Canary)?;
        let stable = derive_workload(release, Track::Stable)?;

        let outcome = ensure_exists(self.workloads.as_ref(), &canary).await?;
        debug!(track = %Track::Canary, ?outcome, "Canary workload ensured");

        if !self.config.health_timeout.is_zero() {
            wait_for_ready(
                self.workloads.as_ref(),
                &canary.namespace().unwrap_or_default(),
                &canary.name_any(),
                self.config.health_timeout,
                self.config.health_poll_interval,
                &self.cancel,
            )
            .await?;
        }

        let outcome = ensure_exists(self.workloads.as_ref(), &stable).await?;
        debug!(track = %Track::Stable, ?outcome, "Stable workload ensured");

        Ok(())
    }
}
