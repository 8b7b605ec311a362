//! Startup registration of the Release resource type.
//!
//! The operator owns the `releases.kdeploy.io` CustomResourceDefinition. At
//! startup it is looked up and created when missing; an existing definition is
//! left alone. Registration errors are fatal to startup.

use crate::client::TypeCatalog;
use crate::crd::{RELEASE_CRD_NAME, RELEASE_DESCRIPTION, Release};
use crate::error::{OperatorError, OperatorResult};
use crate::retry::{RetryConfig, retry_with_backoff};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Annotation holding the human description of the resource type.
pub const DESCRIPTION_ANNOTATION: &str = "kdeploy.io/description";

/// Annotation naming the status field that signals readiness.
pub const READY_FIELD_PATH_ANNOTATION: &str = "kdeploy.io/ready-when-field-path";

/// Annotation holding the value of the readiness field once ready.
pub const READY_FIELD_VALUE_ANNOTATION: &str = "kdeploy.io/ready-when-field-value";

/// Everything needed to register one resource type.
#[derive(Debug, Clone)]
pub struct ResourceTypeDescriptor {
    /// Fully qualified name, `<plural>.<group>`.
    pub name: String,
    /// Definition with schema, names and versions.
    pub definition: CustomResourceDefinition,
    /// Human description.
    pub description: String,
    /// JSONPath of the readiness field.
    pub ready_field_path: String,
    /// Value of the readiness field once ready.
    pub ready_field_value: String,
}

impl ResourceTypeDescriptor {
    /// Descriptor of the Release type.
    pub fn for_release() -> Self {
        Self {
            name: RELEASE_CRD_NAME.to_string(),
            definition: Release::crd(),
            description: RELEASE_DESCRIPTION.to_string(),
            ready_field_path: "{$.status.state}".to_string(),
            ready_field_value: "Ready".to_string(),
        }
    }

    /// The CustomResourceDefinition to submit.
    pub fn build(&self) -> CustomResourceDefinition {
        let mut crd = self.definition.clone();
        crd.metadata.name = Some(self.name.clone());
        let annotations = crd.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(DESCRIPTION_ANNOTATION.to_string(), self.description.clone());
        annotations.insert(
            READY_FIELD_PATH_ANNOTATION.to_string(),
            self.ready_field_path.clone(),
        );
        annotations.insert(
            READY_FIELD_VALUE_ANNOTATION.to_string(),
            self.ready_field_value.clone(),
        );
        crd
    }
}

/// Bounds for registration.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Retry policy for catalog calls.
    pub retry: RetryConfig,
    /// Upper bound on waiting for a new definition to be served.
    pub established_timeout: Duration,
    /// Delay between establishment checks.
    pub established_poll: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            established_timeout: Duration::from_secs(30),
            established_poll: Duration::from_millis(500),
        }
    }
}

/// What [`ensure_type_registered`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The type was already registered; nothing was written.
    AlreadyExists,
    /// The type was created and is established.
    Created,
}

/// True when the definition reports `Established=True`.
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

fn is_conflict(err: &OperatorError) -> bool {
    matches!(err, OperatorError::KubeError(kube::Error::Api(resp)) if resp.code == 409)
}

/// Make sure the resource type exists, creating it when missing.
pub async fn ensure_type_registered(
    catalog: &dyn TypeCatalog,
    descriptor: &ResourceTypeDescriptor,
    config: &RegistrarConfig,
    cancel: &CancellationToken,
) -> OperatorResult<RegistrationOutcome> {
    let name = descriptor.name.as_str();

    let existing = retry_with_backoff(
        &config.retry,
        "get_resource_type",
        OperatorError::is_transient,
        || catalog.get(name),
    )
    .await
    .map_err(|e| OperatorError::RegistrationError(format!("failed to look up {name}: {e}")))?;

    if existing.is_some() {
        info!(name = %name, "Resource type already registered, skipping");
        return Ok(RegistrationOutcome::AlreadyExists);
    }

    let crd = descriptor.build();
    let created = retry_with_backoff(
        &config.retry,
        "create_resource_type",
        |e: &OperatorError| e.is_transient() && !is_conflict(e),
        || catalog.create(&crd),
    )
    .await;

    match created {
        Ok(_) => info!(name = %name, "Registered resource type"),
        Err(e) if is_conflict(&e) => {
            info!(name = %name, "Resource type registered concurrently, skipping");
            return Ok(RegistrationOutcome::AlreadyExists);
        }
        Err(e) => {
            return Err(OperatorError::RegistrationError(format!(
                "failed to create {name}: {e}"
            )));
        }
    }

    wait_established(catalog, name, config, cancel).await?;
    Ok(RegistrationOutcome::Created)
}

async fn wait_established(
    catalog: &dyn TypeCatalog,
    name: &str,
    config: &RegistrarConfig,
    cancel: &CancellationToken,
) -> OperatorResult<()> {
    let deadline = Instant::now() + config.established_timeout;

    loop {
        match catalog.get(name).await {
            Ok(Some(crd)) if is_established(&crd) => {
                info!(name = %name, "Resource type established");
                return Ok(());
            }
            Ok(_) => debug!(name = %name, "Resource type not established yet"),
            Err(e) if e.is_transient() => debug!(name = %name, error = %e, "Establishment check failed"),
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(OperatorError::Timeout {
                what: format!("resource type {name} to be established"),
                after: config.established_timeout,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(OperatorError::Cancelled),
            _ = tokio::time::sleep(config.established_poll.min(deadline - now)) => {}
        }
    }
}
