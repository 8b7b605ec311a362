//! Release Custom Resource Definition.
//!
//! A Release declares a workload and the rollout strategy the operator uses
//! to materialize it.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// API group of the Release resource.
pub const RELEASE_GROUP: &str = "kdeploy.io";

/// Served and stored version of the Release resource.
pub const RELEASE_VERSION: &str = "v1";

/// Plural resource path of the Release resource.
pub const RELEASE_PLURAL: &str = "releases";

/// Fully qualified name of the Release CustomResourceDefinition.
pub const RELEASE_CRD_NAME: &str = "releases.kdeploy.io";

/// Human description attached to the registered resource type.
pub const RELEASE_DESCRIPTION: &str = "Custom releases support (Canary, Blue-green)";

/// Release is the Schema for the releases API.
///
/// The operator derives a canary and a stable Deployment from each Release
/// and reports the outcome in `status.state`.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kdeploy.io",
    version = "v1",
    kind = "Release",
    plural = "releases",
    shortname = "rel",
    namespaced,
    status = "ReleaseStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Strategy", "type":"string", "jsonPath":".spec.strategy.type"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    /// Number of desired pods. Absent means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for pods managed by this release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Template of the pods that will be created.
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// The strategy used to roll out new pods.
    #[serde(default)]
    pub strategy: ReleaseStrategy,

    /// Minimum seconds a new pod must be ready before it counts as available.
    #[serde(default)]
    pub min_ready_seconds: i32,

    /// Number of old revisions to retain for rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// A paused release is not processed by the operator.
    #[serde(default)]
    pub paused: bool,

    /// Revision this release is rolling back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_to: Option<RollbackConfig>,

    /// Maximum seconds for the release to make progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,
}

impl ReleaseSpec {
    /// Declared replica count, defaulting to 1.
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

/// Rollout strategy declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStrategy {
    /// Strategy type: "Canary", "BlueGreen", or empty for the default (Canary).
    ///
    /// Kept verbatim so a full-object write never rewrites the declared value.
    #[serde(rename = "type", default)]
    pub strategy_type: String,

    /// Canary tunables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryParams>,
}

impl ReleaseStrategy {
    /// Parse the declared type into a [`StrategyKind`].
    pub fn kind(&self) -> StrategyKind {
        StrategyKind::from(self.strategy_type.as_str())
    }
}

/// Canary tunables. Declared but not consumed by the canary engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryParams {
    /// Maximum pods that may be unavailable during the rollout (count or percentage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Maximum pods that may be scheduled above the desired count (count or percentage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

/// Rollback target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackConfig {
    /// Revision to roll back to; 0 means the last revision.
    #[serde(default)]
    pub revision: i64,
}

/// Closed set of strategies a release can declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyKind {
    /// Canary rollout (also the default for an empty type).
    Canary,
    /// Blue-green rollout. Accepted, not implemented.
    BlueGreen,
    /// Anything else, kept for logging.
    Unknown(String),
}

impl From<&str> for StrategyKind {
    fn from(s: &str) -> Self {
        match s {
            "" | "Canary" => StrategyKind::Canary,
            "BlueGreen" => StrategyKind::BlueGreen,
            other => StrategyKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Canary => f.write_str("Canary"),
            StrategyKind::BlueGreen => f.write_str("BlueGreen"),
            StrategyKind::Unknown(s) => write!(f, "Unknown({s})"),
        }
    }
}

/// Release status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStatus {
    /// Current state of the release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ReleaseState>,
}

/// Observed release state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReleaseState {
    /// Derived workloads exist.
    Ready,
    /// The last rollout attempt failed.
    Failure,
}

impl Release {
    /// Current state, if any has been written.
    pub fn state(&self) -> Option<ReleaseState> {
        self.status.as_ref().and_then(|s| s.state)
    }
}
