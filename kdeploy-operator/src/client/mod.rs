//! Cluster API client seams.
//!
//! The controller talks to the cluster only through the traits in this module,
//! so reconciliation logic can be exercised without an API server. The
//! `Kube*` types are the production implementations.

pub mod codec;

use crate::crd::Release;
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use codec::ResourceCodec;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DynamicObject, PostParams};
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

/// Writes to the parent Release resource.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseClient: Send + Sync {
    /// Fetch the latest copy of a Release.
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<Release>>;

    /// Full-object write (PUT) to the status subresource. Only `status` is
    /// stored; `metadata.resourceVersion` is checked for conflicts.
    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        release: &Release,
    ) -> OperatorResult<Release>;
}

/// Access to derived Deployments.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Get a Deployment by name; `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<Deployment>>;

    /// Create a Deployment.
    async fn create(&self, namespace: &str, deployment: &Deployment)
    -> OperatorResult<Deployment>;
}

/// The cluster's catalog of resource types.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TypeCatalog: Send + Sync {
    /// Get a CustomResourceDefinition by name; `None` when it does not exist.
    async fn get(&self, name: &str) -> OperatorResult<Option<CustomResourceDefinition>>;

    /// Create a CustomResourceDefinition.
    async fn create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> OperatorResult<CustomResourceDefinition>;
}

/// Map a 404 from the API server to `None`.
fn not_found_as_none<T>(result: Result<T, kube::Error>) -> OperatorResult<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Release client backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeReleaseClient {
    client: Client,
    codec: ResourceCodec<Release>,
}

impl KubeReleaseClient {
    /// Create a client that addresses Releases through `codec`.
    pub fn new(client: Client, codec: ResourceCodec<Release>) -> Self {
        Self { client, codec }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, self.codec.api_resource())
    }
}

#[async_trait]
impl ReleaseClient for KubeReleaseClient {
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<Release>> {
        match not_found_as_none(self.api(namespace).get(name).await)? {
            Some(obj) => Ok(Some(self.codec.decode(obj)?)),
            None => Ok(None),
        }
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        release: &Release,
    ) -> OperatorResult<Release> {
        // Status is a subresource; a PUT to the main resource drops it
        let body = serde_json::to_vec(&self.codec.encode(release)?)?;
        let updated = self
            .api(namespace)
            .replace_status(name, &PostParams::default(), body)
            .await?;
        self.codec.decode(updated)
    }
}

/// Deployment client backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a new Deployment client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<Deployment>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(deployments.get(name).await)
    }

    async fn create(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> OperatorResult<Deployment> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments
            .create(&PostParams::default(), deployment)
            .await?)
    }
}

/// CustomResourceDefinition catalog backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeTypeCatalog {
    client: Client,
}

impl KubeTypeCatalog {
    /// Create a new catalog client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TypeCatalog for KubeTypeCatalog {
    async fn get(&self, name: &str) -> OperatorResult<Option<CustomResourceDefinition>> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        not_found_as_none(crds.get(name).await)
    }

    async fn create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> OperatorResult<CustomResourceDefinition> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        crds.create(&PostParams::default(), crd)
            .await
            .map_err(OperatorError::from)
    }
}
