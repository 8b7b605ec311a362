//! Turns mirror events into reconciliations and writes the result back.

use crate::client::ReleaseClient;
use crate::crd::{Release, ReleaseState, ReleaseStatus, StrategyKind};
use crate::error::{OperatorError, OperatorResult};
use crate::informer::ResourceEvent;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::strategy::RolloutStrategy;
use kube::ResourceExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, warn};

/// What handling one event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The object was invalid; dropped without writes.
    Rejected,
    /// Update or delete notification; logged only.
    Observed,
    /// Valid but intentionally not processed.
    Skipped,
    /// The strategy succeeded and `Ready` was written.
    Reconciled,
    /// The strategy succeeded but the status write failed.
    WriteBackFailed,
    /// The strategy failed; `Failure` was written on a best-effort basis.
    Failed,
    /// Shutdown interrupted the strategy.
    Interrupted,
}

/// Routes Release events to the matching rollout strategy.
pub struct ReleaseDispatcher {
    releases: Arc<dyn ReleaseClient>,
    canary: Arc<dyn RolloutStrategy>,
    write_retry: RetryConfig,
}

impl ReleaseDispatcher {
    /// Create a dispatcher.
    pub fn new(
        releases: Arc<dyn ReleaseClient>,
        canary: Arc<dyn RolloutStrategy>,
        write_retry: RetryConfig,
    ) -> Self {
        Self {
            releases,
            canary,
            write_retry,
        }
    }

    /// Handle one mirror event.
    pub async fn dispatch(&self, event: ResourceEvent<Release>) -> DispatchOutcome {
        match event {
            ResourceEvent::Added(release) => self.on_add(&release).await,
            ResourceEvent::Updated { old, new } => self.on_update(&old, &new),
            ResourceEvent::Deleted(release) => self.on_delete(&release),
        }
    }

    /// A Release appeared in the mirror.
    pub async fn on_add(&self, release: &Release) -> DispatchOutcome {
        if release.metadata.name.as_deref().unwrap_or_default().is_empty() {
            warn!(namespace = ?release.namespace(), "Dropping release with an empty name");
            return DispatchOutcome::Rejected;
        }
        self.handle(release).await
    }

    /// A Release changed, or was re-delivered by a resync.
    pub fn on_update(&self, old: &Release, new: &Release) -> DispatchOutcome {
        debug!(
            name = %new.name_any(),
            namespace = ?new.namespace(),
            old_resource_version = ?old.resource_version(),
            resource_version = ?new.resource_version(),
            "Release updated"
        );
        DispatchOutcome::Observed
    }

    /// A Release was removed. Derived workloads are owned by it and left to
    /// the cluster's garbage collector.
    pub fn on_delete(&self, release: &Release) -> DispatchOutcome {
        info!(name = %release.name_any(), namespace = ?release.namespace(), "Release deleted");
        DispatchOutcome::Observed
    }

    /// Route a valid Release to its strategy and record the outcome.
    pub async fn handle(&self, release: &Release) -> DispatchOutcome {
        let name = release.name_any();
        let namespace = release.namespace();

        if release.spec.paused {
            info!(name = %name, namespace = ?namespace, "Release is paused, skipping");
            return DispatchOutcome::Skipped;
        }

        let strategy = match release.spec.strategy.kind() {
            StrategyKind::Canary => Arc::clone(&self.canary),
            StrategyKind::BlueGreen => {
                info!(name = %name, namespace = ?namespace, "BlueGreen strategy is not implemented, skipping");
                return DispatchOutcome::Skipped;
            }
            StrategyKind::Unknown(kind) => {
                warn!(name = %name, namespace = ?namespace, strategy = %kind, "Unknown strategy type, dropping");
                return DispatchOutcome::Rejected;
            }
        };

        info!(name = %name, namespace = ?namespace, strategy = strategy.name(), "Reconciling release");
        match strategy.run(release).await {
            Ok(()) => match self.write_state(release, ReleaseState::Ready).await {
                Ok(()) => {
                    info!(name = %name, namespace = ?namespace, "Release is ready");
                    DispatchOutcome::Reconciled
                }
                Err(e) => {
                    error!(name = %name, namespace = ?namespace, error = %e, "Failed to write release status");
                    DispatchOutcome::WriteBackFailed
                }
            },
            Err(e) if e.is_validation() => {
                warn!(name = %name, namespace = ?namespace, error = %e, "Invalid release, dropping");
                DispatchOutcome::Rejected
            }
            Err(OperatorError::Cancelled) => {
                info!(name = %name, namespace = ?namespace, "Rollout interrupted by shutdown");
                DispatchOutcome::Interrupted
            }
            Err(e) => {
                error!(name = %name, namespace = ?namespace, error = %e, "Rollout failed");
                if let Err(write_err) = self.write_state(release, ReleaseState::Failure).await {
                    warn!(name = %name, namespace = ?namespace, error = %write_err, "Failed to record failure status");
                }
                DispatchOutcome::Failed
            }
        }
    }

    /// Write `state` with a full-object replace of the status subresource,
    /// addressed by the object's own namespace and name.
    ///
    /// The first attempt writes the delivered copy; retries re-read the latest
    /// copy so a conflict is not repeated.
    async fn write_state(&self, release: &Release, state: ReleaseState) -> OperatorResult<()> {
        let name = release.name_any();
        let namespace = release.namespace().ok_or_else(|| {
            OperatorError::validation(format!("release '{name}' has no namespace"))
        })?;
        let attempt = AtomicU32::new(0);
        let (releases, name_ref, namespace_ref, attempt_ref) =
            (&self.releases, &name, &namespace, &attempt);

        retry_with_backoff(
            &self.write_retry,
            "write_release_status",
            OperatorError::is_transient,
            move || async move {
                let mut target = if attempt_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                    release.clone()
                } else {
                    releases
                        .get(namespace_ref, name_ref)
                        .await?
                        .ok_or_else(|| OperatorError::NotFound {
                            kind: "Release".to_string(),
                            name: name_ref.clone(),
                            namespace: namespace_ref.clone(),
                        })?
                };
                target.status = Some(ReleaseStatus { state: Some(state) });
                releases
                    .replace_status(namespace_ref, name_ref, &target)
                    .await?;
                Ok::<(), OperatorError>(())
            },
        )
        .await?;

        debug!(name = %name, namespace = %namespace, ?state, "Release status written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockReleaseClient;
    use crate::crd::{ReleaseSpec, ReleaseStrategy};
    use crate::strategy::MockRolloutStrategy;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn release(name: &str, strategy_type: &str) -> Release {
        let mut release = Release::new(
            name,
            ReleaseSpec {
                replicas: Some(3),
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), "x".to_string())])),
                    ..Default::default()
                }),
                template: Default::default(),
                strategy: ReleaseStrategy {
                    strategy_type: strategy_type.to_string(),
                    canary: None,
                },
                min_ready_seconds: 0,
                revision_history_limit: None,
                paused: false,
                rollback_to: None,
                progress_deadline_seconds: None,
            },
        );
        release.metadata.namespace = Some("default".to_string());
        release.metadata.resource_version = Some("1".to_string());
        release
    }

    fn api_error(code: u16) -> OperatorError {
        OperatorError::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        }))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn strategy_ok() -> MockRolloutStrategy {
        let mut strategy = MockRolloutStrategy::new();
        strategy.expect_name().return_const("Canary");
        strategy.expect_run().times(1).returning(|_| Ok(()));
        strategy
    }

    fn strategy_untouched() -> MockRolloutStrategy {
        let mut strategy = MockRolloutStrategy::new();
        strategy.expect_name().return_const("Canary");
        strategy.expect_run().never();
        strategy
    }

    fn releases_untouched() -> MockReleaseClient {
        let mut releases = MockReleaseClient::new();
        releases.expect_get().never();
        releases.expect_replace_status().never();
        releases
    }

    fn dispatcher(releases: MockReleaseClient, strategy: MockRolloutStrategy) -> ReleaseDispatcher {
        ReleaseDispatcher::new(Arc::new(releases), Arc::new(strategy), fast_retry())
    }

    #[tokio::test]
    async fn success_writes_ready_to_the_same_object() {
        let mut releases = MockReleaseClient::new();
        releases
            .expect_replace_status()
            .withf(|ns, name, r| {
                ns == "default"
                    && name == "r1"
                    && r.state() == Some(ReleaseState::Ready)
                    && r.spec.strategy.strategy_type.is_empty()
                    && r.metadata.resource_version.as_deref() == Some("1")
            })
            .times(1)
            .returning(|_, _, r| Ok(r.clone()));

        let d = dispatcher(releases, strategy_ok());
        let outcome = d.on_add(&release("r1", "")).await;
        assert_eq!(outcome, DispatchOutcome::Reconciled);
    }

    #[tokio::test]
    async fn empty_name_never_reaches_strategy() {
        let d = dispatcher(releases_untouched(), strategy_untouched());
        let outcome = d.on_add(&release("", "Canary")).await;
        assert_eq!(outcome, DispatchOutcome::Rejected);
    }

    #[tokio::test]
    async fn unknown_strategy_writes_nothing() {
        let d = dispatcher(releases_untouched(), strategy_untouched());
        let outcome = d.on_add(&release("r1", "Rolling")).await;
        assert_eq!(outcome, DispatchOutcome::Rejected);
    }

    #[tokio::test]
    async fn blue_green_is_skipped() {
        let d = dispatcher(releases_untouched(), strategy_untouched());
        let outcome = d.on_add(&release("r1", "BlueGreen")).await;
        assert_eq!(outcome, DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn paused_release_is_skipped() {
        let d = dispatcher(releases_untouched(), strategy_untouched());
        let mut r = release("r1", "Canary");
        r.spec.paused = true;
        assert_eq!(d.on_add(&r).await, DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn updates_and_deletes_are_observed_only() {
        let d = dispatcher(releases_untouched(), strategy_untouched());
        let old = Arc::new(release("r1", ""));
        let mut changed = release("r1", "");
        changed.metadata.resource_version = Some("2".to_string());
        let new = Arc::new(changed);

        let outcome = d
            .dispatch(ResourceEvent::Updated {
                old: old.clone(),
                new,
            })
            .await;
        assert_eq!(outcome, DispatchOutcome::Observed);
        assert_eq!(
            d.dispatch(ResourceEvent::Deleted(old)).await,
            DispatchOutcome::Observed
        );
    }

    #[tokio::test]
    async fn validation_failure_is_rejected_without_writes() {
        let mut strategy = MockRolloutStrategy::new();
        strategy.expect_name().return_const("Canary");
        strategy
            .expect_run()
            .returning(|_| Err(OperatorError::validation("no selector")));

        let d = dispatcher(releases_untouched(), strategy);
        assert_eq!(d.on_add(&release("r1", "")).await, DispatchOutcome::Rejected);
    }

    #[tokio::test]
    async fn strategy_failure_records_failure_state() {
        let mut strategy = MockRolloutStrategy::new();
        strategy.expect_name().return_const("Canary");
        strategy.expect_run().returning(|_| Err(api_error(403)));

        let mut releases = MockReleaseClient::new();
        releases
            .expect_replace_status()
            .withf(|_, _, r| r.state() == Some(ReleaseState::Failure))
            .times(1)
            .returning(|_, _, r| Ok(r.clone()));

        let d = dispatcher(releases, strategy);
        assert_eq!(d.on_add(&release("r1", "")).await, DispatchOutcome::Failed);
    }

    #[tokio::test]
    async fn cancelled_strategy_writes_nothing() {
        let mut strategy = MockRolloutStrategy::new();
        strategy.expect_name().return_const("Canary");
        strategy.expect_run().returning(|_| Err(OperatorError::Cancelled));

        let d = dispatcher(releases_untouched(), strategy);
        assert_eq!(d.on_add(&release("r1", "")).await, DispatchOutcome::Interrupted);
    }

    #[tokio::test]
    async fn conflict_is_retried_against_latest_copy() {
        let mut releases = MockReleaseClient::new();
        let mut seq = mockall::Sequence::new();
        releases
            .expect_replace_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(api_error(409)));
        releases
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let mut latest = release("r1", "");
                latest.metadata.resource_version = Some("2".to_string());
                Ok(Some(latest))
            });
        releases
            .expect_replace_status()
            .withf(|_, _, r| {
                r.metadata.resource_version.as_deref() == Some("2")
                    && r.state() == Some(ReleaseState::Ready)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, r| Ok(r.clone()));

        let d = dispatcher(releases, strategy_ok());
        assert_eq!(d.on_add(&release("r1", "")).await, DispatchOutcome::Reconciled);
    }

    #[tokio::test]
    async fn exhausted_write_retries_are_reported() {
        let mut releases = MockReleaseClient::new();
        releases
            .expect_replace_status()
            .times(3)
            .returning(|_, _, _| Err(api_error(503)));
        releases
            .expect_get()
            .times(2)
            .returning(|_, _| Ok(Some(release("r1", ""))));

        let d = dispatcher(releases, strategy_ok());
        assert_eq!(
            d.on_add(&release("r1", "")).await,
            DispatchOutcome::WriteBackFailed
        );
    }

    #[tokio::test]
    async fn permanent_write_error_is_not_retried() {
        let mut releases = MockReleaseClient::new();
        releases
            .expect_replace_status()
            .times(1)
            .returning(|_, _, _| Err(api_error(422)));
        releases.expect_get().never();

        let d = dispatcher(releases, strategy_ok());
        assert_eq!(
            d.on_add(&release("r1", "")).await,
            DispatchOutcome::WriteBackFailed
        );
    }
}
