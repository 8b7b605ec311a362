//! Rollout strategies.
//!
//! Each implemented [`StrategyKind`](crate::crd::StrategyKind) variant has one
//! [`RolloutStrategy`] implementation.

pub mod canary;
pub mod readiness;

use crate::crd::Release;
use crate::error::OperatorResult;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

pub use canary::{
    CanaryConfig, CanaryStrategy, EnsureOutcome, Track, derive_workload, derived_name,
    ensure_exists,
};
pub use readiness::{Readiness, deployment_readiness, wait_for_ready};

/// Drives the cluster toward a Release's declared workload.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RolloutStrategy: Send + Sync {
    /// Strategy name, for logs.
    fn name(&self) -> &'static str;

    /// Materialize the Release. `Ok` means every derived workload exists.
    async fn run(&self, release: &Release) -> OperatorResult<()>;
}
