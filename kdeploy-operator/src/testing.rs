//! In-memory cluster doubles for tests.
//!
//! [`FakeListWatch`] drives an informer deterministically: the test sets the
//! list result and pushes watch records by hand. [`FakeCluster`] implements
//! every client seam over shared in-memory state so a whole controller can run
//! without an API server.
//!
//! ```ignore
//! use kdeploy_operator::testing::FakeCluster;
//!
//! let cluster = Arc::new(FakeCluster::new());
//! cluster.apply_release(release);
//! let controller = Controller::new(cluster.context(), config);
//! ```

use crate::client::{ReleaseClient, TypeCatalog, WorkloadClient};
use crate::controller::ControllerContext;
use crate::crd::{Release, ReleaseState};
use crate::error::{OperatorError, OperatorResult};
use crate::informer::{
    ListOptions, ListPage, ListWatch, NamespaceScope, ObjectKey, WatchRecord, WatchStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
};
use kube::ResourceExt;
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};

type RecordSender<K> = mpsc::UnboundedSender<OperatorResult<WatchRecord<K>>>;

fn record_stream<K: Send + 'static>(
    rx: mpsc::UnboundedReceiver<OperatorResult<WatchRecord<K>>>,
) -> WatchStream<K> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

fn api_error(code: u16, reason: &str, message: String) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

/// The producing end of one open watch session.
pub struct WatchFeed<K> {
    /// Version the watch was opened from.
    pub resource_version: String,
    tx: RecordSender<K>,
}

impl<K> WatchFeed<K> {
    /// Push a record to the watcher.
    pub fn send(&self, record: WatchRecord<K>) {
        let _ = self.tx.send(Ok(record));
    }

    /// Push an error, ending the session from the watcher's side.
    pub fn fail(&self, error: OperatorError) {
        let _ = self.tx.send(Err(error));
    }

    /// End the stream cleanly.
    pub fn close(self) {}
}

struct ListWatchState<K> {
    items: Vec<K>,
    resource_version: String,
    fail_next: Option<OperatorError>,
    fail_all: bool,
    list_calls: usize,
    feeds: VecDeque<WatchFeed<K>>,
}

/// Scripted list-watch source.
pub struct FakeListWatch<K> {
    state: Mutex<ListWatchState<K>>,
    watch_opened: Notify,
}

impl<K> Default for FakeListWatch<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(ListWatchState {
                items: Vec::new(),
                resource_version: "0".to_string(),
                fail_next: None,
                fail_all: false,
                list_calls: 0,
                feeds: VecDeque::new(),
            }),
            watch_opened: Notify::new(),
        }
    }
}

impl<K> FakeListWatch<K> {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Result of every following list call.
    pub fn set_list(&self, items: Vec<K>, resource_version: &str) {
        let mut state = self.state.lock();
        state.items = items;
        state.resource_version = resource_version.to_string();
    }

    /// Fail the next list call with `error`.
    pub fn fail_next_list(&self, error: OperatorError) {
        self.state.lock().fail_next = Some(error);
    }

    /// Fail every list call while `fail` is set.
    pub fn fail_all_lists(&self, fail: bool) {
        self.state.lock().fail_all = fail;
    }

    /// Number of list calls so far.
    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    /// Wait for the next watch session the informer opens.
    pub async fn next_watch(&self) -> WatchFeed<K> {
        loop {
            if let Some(feed) = self.state.lock().feeds.pop_front() {
                return feed;
            }
            self.watch_opened.notified().await;
        }
    }
}

#[async_trait]
impl<K> ListWatch<K> for FakeListWatch<K>
where
    K: Clone + Send + Sync + 'static,
{
    async fn list(&self, _options: &ListOptions) -> OperatorResult<ListPage<K>> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if state.fail_all {
            return Err(OperatorError::validation("list unavailable"));
        }
        Ok(ListPage {
            items: state.items.clone(),
            resource_version: Some(state.resource_version.clone()),
        })
    }

    async fn watch(
        &self,
        _options: &ListOptions,
        resource_version: &str,
    ) -> OperatorResult<WatchStream<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().feeds.push_back(WatchFeed {
            resource_version: resource_version.to_string(),
            tx,
        });
        self.watch_opened.notify_one();
        Ok(record_stream(rx))
    }
}

/// A write the fake cluster accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterWrite {
    /// A Deployment was created.
    CreateDeployment {
        /// Namespace.
        namespace: String,
        /// Deployment name.
        name: String,
    },
    /// A Release status was replaced.
    ReplaceStatus {
        /// Namespace.
        namespace: String,
        /// Release name.
        name: String,
        /// Status state carried by the write.
        state: Option<ReleaseState>,
    },
    /// A resource type was registered.
    CreateType {
        /// Definition name.
        name: String,
    },
}

fn in_scope(scope: &NamespaceScope, release: &Release) -> bool {
    match scope {
        NamespaceScope::All => true,
        NamespaceScope::Named(ns) => release.namespace().as_deref() == Some(ns.as_str()),
    }
}

fn record_in_scope(scope: &NamespaceScope, record: &WatchRecord<Release>) -> bool {
    match record {
        WatchRecord::Added(r) | WatchRecord::Modified(r) | WatchRecord::Deleted(r) => {
            in_scope(scope, r)
        }
        WatchRecord::Bookmark { .. } => true,
    }
}

#[derive(Default)]
struct ClusterState {
    releases: BTreeMap<ObjectKey, Release>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    types: BTreeMap<String, CustomResourceDefinition>,
    resource_version: u64,
    watchers: Vec<(NamespaceScope, RecordSender<Release>)>,
    history: Vec<(u64, WatchRecord<Release>)>,
    writes: Vec<ClusterWrite>,
    status_write_failures: VecDeque<OperatorError>,
}

impl ClusterState {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Record a change at the current version and push it to open watches.
    fn broadcast(&mut self, record: WatchRecord<Release>) {
        self.watchers.retain(|(scope, tx)| {
            !record_in_scope(scope, &record) || tx.send(Ok(record.clone())).is_ok()
        });
        self.history.push((self.resource_version, record));
    }
}

/// In-memory cluster holding Releases, Deployments and resource types.
///
/// Created Deployments report every replica ready immediately, and newly
/// registered types are established immediately.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller context whose every seam is this cluster.
    pub fn context(self: &Arc<Self>) -> ControllerContext {
        ControllerContext {
            releases: self.clone(),
            workloads: self.clone(),
            catalog: self.clone(),
            list_watch: self.clone(),
        }
    }

    /// Create or update a Release as a user would, notifying open watches.
    ///
    /// This is a write to the main resource, so the status of an existing
    /// Release is kept and the status carried by `release` is ignored.
    pub fn apply_release(&self, mut release: Release) -> Release {
        let mut state = self.state.lock();
        let key = ObjectKey::of(&release);
        release.status = state.releases.get(&key).and_then(|r| r.status.clone());
        release.metadata.resource_version = Some(state.next_version());
        let existed = state.releases.insert(key, release.clone()).is_some();
        let record = if existed {
            WatchRecord::Modified(release.clone())
        } else {
            WatchRecord::Added(release.clone())
        };
        state.broadcast(record);
        release
    }

    /// Delete a Release, notifying open watches.
    pub fn delete_release(&self, namespace: &str, name: &str) -> Option<Release> {
        let mut state = self.state.lock();
        let removed = state.releases.remove(&ObjectKey::new(namespace, name))?;
        state.next_version();
        state.broadcast(WatchRecord::Deleted(removed.clone()));
        Some(removed)
    }

    /// Seed a Deployment without recording a write.
    pub fn insert_deployment(&self, deployment: Deployment) {
        let mut state = self.state.lock();
        state
            .deployments
            .insert(ObjectKey::of(&deployment), deployment);
    }

    /// Fail the next Release status writes with these errors, in order.
    pub fn fail_status_writes(&self, errors: impl IntoIterator<Item = OperatorError>) {
        self.state.lock().status_write_failures.extend(errors);
    }

    /// Current copy of a Release.
    pub fn release(&self, namespace: &str, name: &str) -> Option<Release> {
        self.state
            .lock()
            .releases
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    /// Current copy of a Deployment.
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .deployments
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    /// Registered resource type.
    pub fn resource_type(&self, name: &str) -> Option<CustomResourceDefinition> {
        self.state.lock().types.get(name).cloned()
    }

    /// Every write accepted so far, in order.
    pub fn writes(&self) -> Vec<ClusterWrite> {
        self.state.lock().writes.clone()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

#[async_trait]
impl ReleaseClient for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<Release>> {
        Ok(self.release(namespace, name))
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        release: &Release,
    ) -> OperatorResult<Release> {
        let mut state = self.state.lock();
        if let Some(error) = state.status_write_failures.pop_front() {
            return Err(error);
        }

        let key = ObjectKey::new(namespace, name);
        let current = state.releases.get(&key).ok_or_else(|| {
            api_error(404, "NotFound", format!("releases \"{name}\" not found"))
        })?;
        if current.metadata.resource_version != release.metadata.resource_version {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object \"{name}\" has been modified"),
            ));
        }

        // Only status goes through the subresource
        let mut stored = current.clone();
        stored.status = release.status.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.releases.insert(key, stored.clone());
        state.writes.push(ClusterWrite::ReplaceStatus {
            namespace: namespace.to_string(),
            name: name.to_string(),
            state: stored.state(),
        });
        state.broadcast(WatchRecord::Modified(stored.clone()));
        Ok(stored)
    }
}

#[async_trait]
impl WorkloadClient for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn create(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> OperatorResult<Deployment> {
        let mut state = self.state.lock();
        let name = deployment.name_any();
        let key = ObjectKey::new(namespace, name.clone());
        if state.deployments.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("deployments.apps \"{name}\" already exists"),
            ));
        }

        let mut stored = deployment.clone();
        let replicas = stored.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.generation = Some(1);
        stored.metadata.resource_version = Some(state.next_version());
        stored.status = Some(DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(replicas),
            ready_replicas: Some(replicas),
            updated_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        });
        state.deployments.insert(key, stored.clone());
        state.writes.push(ClusterWrite::CreateDeployment {
            namespace: namespace.to_string(),
            name,
        });
        Ok(stored)
    }
}

#[async_trait]
impl TypeCatalog for FakeCluster {
    async fn get(&self, name: &str) -> OperatorResult<Option<CustomResourceDefinition>> {
        Ok(self.resource_type(name))
    }

    async fn create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> OperatorResult<CustomResourceDefinition> {
        let mut state = self.state.lock();
        let name = crd.name_any();
        if state.types.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }

        let mut stored = crd.clone();
        stored.status = Some(CustomResourceDefinitionStatus {
            conditions: Some(vec![CustomResourceDefinitionCondition {
                type_: "Established".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        state.types.insert(name.clone(), stored.clone());
        state.writes.push(ClusterWrite::CreateType { name });
        Ok(stored)
    }
}

#[async_trait]
impl ListWatch<Release> for FakeCluster {
    async fn list(&self, options: &ListOptions) -> OperatorResult<ListPage<Release>> {
        let state = self.state.lock();
        let items = state
            .releases
            .values()
            .filter(|r| in_scope(&options.namespace, r))
            .cloned()
            .collect();
        Ok(ListPage {
            items,
            resource_version: Some(state.resource_version.to_string()),
        })
    }

    async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> OperatorResult<WatchStream<Release>> {
        let since = resource_version.parse::<u64>().unwrap_or(0);
        let scope = options.namespace.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        // Replay what happened between the list and this watch
        for (version, record) in &state.history {
            if *version > since && record_in_scope(&scope, record) {
                let _ = tx.send(Ok(record.clone()));
            }
        }
        state.watchers.push((scope, tx));
        Ok(record_stream(rx))
    }
}
