//! Release controller runtime.
//!
//! Wires the pieces together:
//!
//! - the [registrar](crate::registrar) makes sure the Release type exists;
//! - an [`Informer`] mirrors Releases and emits ordered events;
//! - the [`ReleaseDispatcher`] consumes those events one at a time.
//!
//! ```ignore
//! let context = ControllerContext::from_client(client);
//! let controller = Controller::new(context, ControllerConfig::default());
//! controller.run(cancel).await?;
//! ```

mod dispatcher;

pub use dispatcher::{DispatchOutcome, ReleaseDispatcher};

use crate::client::codec::ResourceCodec;
use crate::client::{
    KubeReleaseClient, KubeTypeCatalog, KubeWorkloadClient, ReleaseClient, TypeCatalog,
    WorkloadClient,
};
use crate::crd::Release;
use crate::error::OperatorResult;
use crate::informer::source::{KubeListWatch, ListOptions, ListWatch};
use crate::informer::{Informer, InformerConfig};
use crate::registrar::{RegistrarConfig, ResourceTypeDescriptor, ensure_type_registered};
use crate::retry::RetryConfig;
use crate::strategy::{CanaryConfig, CanaryStrategy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cluster access shared by the controller's components.
#[derive(Clone)]
pub struct ControllerContext {
    /// Status writes to Releases.
    pub releases: Arc<dyn ReleaseClient>,
    /// Derived Deployments.
    pub workloads: Arc<dyn WorkloadClient>,
    /// Resource type catalog.
    pub catalog: Arc<dyn TypeCatalog>,
    /// Release list-watch.
    pub list_watch: Arc<dyn ListWatch<Release>>,
}

impl ControllerContext {
    /// Production context over a Kubernetes client. One Release codec is
    /// shared by the list-watch and the status writer.
    pub fn from_client(client: kube::Client) -> Self {
        let codec = ResourceCodec::<Release>::new();
        Self {
            releases: Arc::new(KubeReleaseClient::new(client.clone(), codec.clone())),
            workloads: Arc::new(KubeWorkloadClient::new(client.clone())),
            catalog: Arc::new(KubeTypeCatalog::new(client.clone())),
            list_watch: Arc::new(KubeListWatch::new(client, codec)),
        }
    }
}

/// Controller settings.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Which Releases to watch.
    pub list_options: ListOptions,
    /// Informer tunables.
    pub informer: InformerConfig,
    /// Canary tunables.
    pub canary: CanaryConfig,
    /// Retry policy for status writes.
    pub write_retry: RetryConfig,
    /// Startup registration bounds.
    pub registrar: RegistrarConfig,
}

/// Runs the Release control loop.
pub struct Controller {
    context: ControllerContext,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller.
    pub fn new(context: ControllerContext, config: ControllerConfig) -> Self {
        Self { context, config }
    }

    /// Register the type, start the informer, wait for sync, then dispatch
    /// events until `cancel` fires.
    ///
    /// Registration failures are returned before anything is watched. A
    /// cancellation before the mirror syncs returns
    /// [`OperatorError::Cancelled`](crate::error::OperatorError::Cancelled).
    pub async fn run(self, cancel: CancellationToken) -> OperatorResult<()> {
        let outcome = ensure_type_registered(
            self.context.catalog.as_ref(),
            &ResourceTypeDescriptor::for_release(),
            &self.config.registrar,
            &cancel,
        )
        .await?;
        info!(?outcome, "Release type registration complete");

        let (informer, handle, mut events) = Informer::new(
            Arc::clone(&self.context.list_watch),
            self.config.list_options.clone(),
            self.config.informer.clone(),
        );
        let informer_task = tokio::spawn(informer.run(cancel.clone()));

        let canary = CanaryStrategy::new(
            Arc::clone(&self.context.workloads),
            self.config.canary.clone(),
            cancel.clone(),
        );
        let dispatcher = ReleaseDispatcher::new(
            Arc::clone(&self.context.releases),
            Arc::new(canary),
            self.config.write_retry.clone(),
        );

        if let Err(e) = handle.wait_for_sync(&cancel).await {
            cancel.cancel();
            if let Err(join_err) = informer_task.await {
                warn!(error = %join_err, "Informer task ended abnormally");
            }
            return Err(e);
        }
        info!(releases = handle.store().len(), "Release mirror synced, dispatching events");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        let key = event.key();
                        let outcome = dispatcher.dispatch(event).await;
                        debug!(key = %key, ?outcome, "Event handled");
                    }
                    None => {
                        warn!("Event channel closed");
                        break;
                    }
                },
            }
        }

        cancel.cancel();
        if let Err(e) = informer_task.await {
            warn!(error = %e, "Informer task ended abnormally");
        }
        info!("Controller stopped");
        Ok(())
    }
}
