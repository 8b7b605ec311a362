//! Readiness of derived Deployments.

use crate::client::WorkloadClient;
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::apps::v1::Deployment;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observed readiness of one Deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every desired replica is updated and ready.
    Ready,
    /// The rollout is still moving.
    Progressing {
        /// Ready replicas observed.
        ready: i32,
        /// Replicas desired.
        desired: i32,
    },
    /// The Deployment does not exist.
    Missing,
}

/// Readiness as reported by the Deployment's own status.
///
/// Status that describes an older generation never counts as ready.
pub fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return Readiness::Progressing { ready: 0, desired };
    };

    let ready = status.ready_replicas.unwrap_or(0);
    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Readiness::Progressing { ready, desired };
    }

    let updated = status.updated_replicas.unwrap_or(0);
    if desired == 0 || (updated >= desired && ready >= desired) {
        Readiness::Ready
    } else {
        Readiness::Progressing { ready, desired }
    }
}

/// Poll a Deployment until it is ready, `timeout` elapses, or `cancel` fires.
///
/// Transient read errors are logged and polled through; anything else ends
/// the wait.
pub async fn wait_for_ready(
    workloads: &dyn WorkloadClient,
    namespace: &str,
    name: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> OperatorResult<()> {
    let deadline = Instant::now() + timeout;

    loop {
        let readiness = match workloads.get(namespace, name).await {
            Ok(Some(deployment)) => deployment_readiness(&deployment),
            Ok(None) => Readiness::Missing,
            Err(e) if e.is_transient() => {
                warn!(namespace = %namespace, name = %name, error = %e, "Readiness check failed, polling again");
                Readiness::Missing
            }
            Err(e) => return Err(e),
        };

        if readiness == Readiness::Ready {
            info!(namespace = %namespace, name = %name, "Workload is ready");
            return Ok(());
        }
        debug!(namespace = %namespace, name = %name, ?readiness, "Waiting for workload");

        let now = Instant::now();
        if now >= deadline {
            return Err(OperatorError::Timeout {
                what: format!("{namespace}/{name} to become ready"),
                after: timeout,
            });
        }

        let sleep = poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(OperatorError::Cancelled),
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
