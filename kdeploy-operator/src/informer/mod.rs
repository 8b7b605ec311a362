//! Local mirror of cluster objects, kept current by list-watch.
//!
//! The [`Informer`] lists every object once, marks itself synced, and then
//! follows the watch stream, delivering a [`ResourceEvent`] per change on an
//! ordered channel. When the stream ends or fails it lists again from
//! scratch rather than resuming from the last seen version.
//!
//! ```ignore
//! let (informer, handle, mut events) = Informer::new(source, options, config);
//! tokio::spawn(informer.run(cancel.clone()));
//! handle.wait_for_sync(&cancel).await?;
//! while let Some(event) = events.recv().await {
//!     // one event at a time, in delivery order
//! }
//! ```

pub mod source;
pub mod store;

use crate::error::{OperatorError, OperatorResult};
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store::Upsert;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use source::{
    KubeListWatch, ListOptions, ListPage, ListWatch, NamespaceScope, WatchRecord, WatchStream,
};
pub use store::{ObjectKey, Store};

/// A change delivered to the consumer.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    /// The object is new to the mirror.
    Added(Arc<K>),
    /// The object changed, or a resync re-delivered it (then `old` and `new`
    /// are the same object).
    Updated {
        /// Previous state.
        old: Arc<K>,
        /// Current state.
        new: Arc<K>,
    },
    /// The object is gone; carries its last known state.
    Deleted(Arc<K>),
}

impl<K: Resource> ResourceEvent<K> {
    /// Key of the object the event is about.
    pub fn key(&self) -> ObjectKey {
        match self {
            ResourceEvent::Added(obj) | ResourceEvent::Deleted(obj) => ObjectKey::of(obj.as_ref()),
            ResourceEvent::Updated { new, .. } => ObjectKey::of(new.as_ref()),
        }
    }
}

/// Lifecycle of an informer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    /// Not running.
    Idle,
    /// Performing the initial list.
    Listing,
    /// Following the watch stream.
    Watching,
    /// Listing again after the watch stream ended.
    Relisting,
}

/// Informer tunables.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Period of full re-delivery of the snapshot; zero disables resync.
    pub resync_period: Duration,
    /// Pause before retrying a failed list or watch call.
    pub relist_backoff: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(10),
            relist_backoff: Duration::from_secs(1),
        }
    }
}

/// Read side of a running informer.
#[derive(Clone)]
pub struct InformerHandle<K> {
    store: Store<K>,
    synced: watch::Receiver<bool>,
    state: watch::Receiver<InformerState>,
}

impl<K: Resource> InformerHandle<K> {
    /// True once the initial list has been stored.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InformerState {
        *self.state.borrow()
    }

    /// The read-only snapshot.
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Block until the initial list has been stored.
    ///
    /// Fails with [`OperatorError::Cancelled`] when `cancel` fires first or the
    /// informer stops before syncing.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> OperatorResult<()> {
        let mut synced = self.synced.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(OperatorError::Cancelled),
            result = synced.wait_for(|s| *s) => result.map(|_| ()).map_err(|_| OperatorError::Cancelled),
        }
    }
}

/// A watch that ends sooner than this after opening counts as a failure, so
/// the relist waits out the backoff.
const MIN_WATCH_DURATION: Duration = Duration::from_secs(5);

/// How a watch session ended.
enum WatchExit {
    /// Cancellation fired.
    Cancelled,
    /// The consumer dropped its receiver.
    Closed,
    /// The stream ended cleanly after a normal session; relist right away.
    Ended,
    /// The stream ended right after opening; relist after a pause.
    EndedEarly,
    /// The stream or the watch call failed; relist after a pause.
    Failed,
}

/// Keeps a [`Store`] in sync with the cluster and emits change events.
pub struct Informer<K> {
    source: Arc<dyn ListWatch<K>>,
    options: ListOptions,
    config: InformerConfig,
    store: Store<K>,
    synced: watch::Sender<bool>,
    state: watch::Sender<InformerState>,
    events: mpsc::UnboundedSender<ResourceEvent<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Create an informer, its read handle, and the event receiver.
    pub fn new(
        source: Arc<dyn ListWatch<K>>,
        options: ListOptions,
        config: InformerConfig,
    ) -> (
        Self,
        InformerHandle<K>,
        mpsc::UnboundedReceiver<ResourceEvent<K>>,
    ) {
        let store = Store::default();
        let (synced_tx, synced_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(InformerState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = InformerHandle {
            store: store.clone(),
            synced: synced_rx,
            state: state_rx,
        };
        let informer = Self {
            source,
            options,
            config,
            store,
            synced: synced_tx,
            state: state_tx,
            events: events_tx,
        };
        (informer, handle, events_rx)
    }

    /// Run until `cancel` fires or the event receiver is dropped.
    pub async fn run(self, cancel: CancellationToken) {
        let mut resync = self.resync_interval();
        let mut listed_once = false;

        info!(
            namespace = ?self.options.namespace,
            resync_secs = self.config.resync_period.as_secs(),
            "Informer started"
        );

        while !cancel.is_cancelled() {
            self.state.send_replace(if listed_once {
                InformerState::Relisting
            } else {
                InformerState::Listing
            });

            let version = match self.list_and_replace().await {
                Ok(Some(version)) => version,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "List failed, retrying");
                    if !self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };
            listed_once = true;

            self.state.send_replace(InformerState::Watching);
            match self.watch(&version, &mut resync, &cancel).await {
                WatchExit::Cancelled | WatchExit::Closed => break,
                WatchExit::Ended => debug!("Watch stream ended, relisting"),
                WatchExit::EndedEarly => {
                    warn!("Watch stream closed right after opening, backing off");
                    if !self.pause(&cancel).await {
                        break;
                    }
                }
                WatchExit::Failed => {
                    if !self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(InformerState::Idle);
        info!("Informer stopped");
    }

    fn resync_interval(&self) -> Option<Interval> {
        let period = self.config.resync_period;
        if period.is_zero() {
            return None;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    /// Sleep for the relist backoff; false when cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.relist_backoff) => true,
        }
    }

    /// List, swap the snapshot, mark synced, then deliver the differences.
    ///
    /// Returns the version to watch from, or `None` when the consumer is gone.
    async fn list_and_replace(&self) -> OperatorResult<Option<String>> {
        let page = self.source.list(&self.options).await?;
        let mut previous: HashMap<ObjectKey, Arc<K>> = self
            .store
            .list()
            .into_iter()
            .map(|obj| (ObjectKey::of(obj.as_ref()), obj))
            .collect();

        let mut snapshot = HashMap::with_capacity(page.items.len());
        let mut pending = Vec::with_capacity(page.items.len());

        for item in page.items {
            let key = ObjectKey::of(&item);
            match previous.remove(&key) {
                None => {
                    let obj = Arc::new(item);
                    snapshot.insert(key, Arc::clone(&obj));
                    pending.push(ResourceEvent::Added(obj));
                }
                Some(old) if store::is_stale(old.as_ref(), &item) => {
                    debug!(key = %key, "List returned an older version, keeping cached object");
                    snapshot.insert(key, old);
                }
                Some(old) if old.resource_version() == item.resource_version() => {
                    snapshot.insert(key, old);
                }
                Some(old) => {
                    let new = Arc::new(item);
                    snapshot.insert(key, Arc::clone(&new));
                    pending.push(ResourceEvent::Updated { old, new });
                }
            }
        }

        // Whatever was cached but not listed has been deleted meanwhile
        let mut gone: Vec<_> = previous.into_iter().collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        pending.extend(gone.into_iter().map(|(_, obj)| ResourceEvent::Deleted(obj)));

        let count = snapshot.len();
        self.store.replace(snapshot);
        self.synced.send_replace(true);

        let version = page.resource_version.unwrap_or_default();
        info!(objects = count, resource_version = %version, "List complete, mirror synced");

        for event in pending {
            if !self.deliver(event) {
                return Ok(None);
            }
        }
        Ok(Some(version))
    }

    async fn watch(
        &self,
        version: &str,
        resync: &mut Option<Interval>,
        cancel: &CancellationToken,
    ) -> WatchExit {
        let opened = Instant::now();
        let mut stream = match self.source.watch(&self.options, version).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to start watch");
                return WatchExit::Failed;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return WatchExit::Cancelled,
                _ = next_tick(resync) => {
                    if !self.resync() {
                        return WatchExit::Closed;
                    }
                }
                record = stream.next() => match record {
                    Some(Ok(record)) => {
                        if !self.apply(record) {
                            return WatchExit::Closed;
                        }
                    }
                    Some(Err(e)) if e.is_transient() => {
                        debug!(error = %e, "Watch interrupted");
                        return WatchExit::Failed;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Watch failed");
                        return WatchExit::Failed;
                    }
                    None if opened.elapsed() < MIN_WATCH_DURATION => return WatchExit::EndedEarly,
                    None => return WatchExit::Ended,
                },
            }
        }
    }

    /// Fold one watch record into the store; false when the consumer is gone.
    fn apply(&self, record: WatchRecord<K>) -> bool {
        match record {
            WatchRecord::Added(obj) | WatchRecord::Modified(obj) => {
                let key = ObjectKey::of(&obj);
                match self.store.upsert(obj) {
                    Upsert::Inserted(new) => self.deliver(ResourceEvent::Added(new)),
                    Upsert::Replaced { old, new } => {
                        self.deliver(ResourceEvent::Updated { old, new })
                    }
                    Upsert::Stale => {
                        debug!(key = %key, "Ignoring out-of-order watch record");
                        true
                    }
                }
            }
            WatchRecord::Deleted(obj) => {
                let key = ObjectKey::of(&obj);
                match self.store.remove(&key) {
                    Some(_) => self.deliver(ResourceEvent::Deleted(Arc::new(obj))),
                    None => {
                        debug!(key = %key, "Delete for an object the mirror never saw");
                        true
                    }
                }
            }
            WatchRecord::Bookmark { resource_version } => {
                trace!(resource_version = %resource_version, "Watch bookmark");
                true
            }
        }
    }

    /// Re-deliver every cached object as an update.
    fn resync(&self) -> bool {
        let objects = self.store.list();
        debug!(objects = objects.len(), "Resync");
        objects.into_iter().all(|obj| {
            self.deliver(ResourceEvent::Updated {
                old: Arc::clone(&obj),
                new: obj,
            })
        })
    }

    fn deliver(&self, event: ResourceEvent<K>) -> bool {
        if self.events.send(event).is_err() {
            info!("Event receiver dropped, stopping informer");
            return false;
        }
        true
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeListWatch;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn no_resync() -> InformerConfig {
        InformerConfig {
            resync_period: Duration::ZERO,
            relist_backoff: Duration::from_millis(10),
        }
    }

    fn describe(event: &ResourceEvent<ConfigMap>) -> String {
        match event {
            ResourceEvent::Added(o) => format!(
                "added {}@{}",
                o.name_any(),
                o.resource_version().unwrap_or_default()
            ),
            ResourceEvent::Updated { old, new } => format!(
                "updated {}@{}->{}",
                new.name_any(),
                old.resource_version().unwrap_or_default(),
                new.resource_version().unwrap_or_default()
            ),
            ResourceEvent::Deleted(o) => format!("deleted {}", o.name_any()),
        }
    }

    async fn next(rx: &mut UnboundedReceiver<ResourceEvent<ConfigMap>>) -> String {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        describe(&event)
    }

    #[tokio::test]
    async fn initial_list_syncs_before_delivering() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1"), cm("b", "2")], "2");
        let (informer, handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());

        assert!(!handle.has_synced());
        assert_eq!(handle.state(), InformerState::Idle);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        let first = rx.recv().await.expect("event");
        // Delivery only starts after the mirror is authoritative
        assert!(handle.has_synced());
        assert_eq!(describe(&first), "added a@1");
        assert_eq!(next(&mut rx).await, "added b@2");
        assert_eq!(handle.store().len(), 2);

        handle.wait_for_sync(&cancel).await.expect("synced");

        cancel.cancel();
        task.await.expect("informer task");
        assert_eq!(handle.state(), InformerState::Idle);
    }

    #[tokio::test]
    async fn watch_records_become_ordered_events() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1")], "1");
        let (informer, handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        let watch = source.next_watch().await;
        assert_eq!(watch.resource_version, "1");

        watch.send(WatchRecord::Modified(cm("a", "2")));
        watch.send(WatchRecord::Added(cm("b", "3")));
        watch.send(WatchRecord::Bookmark {
            resource_version: "4".to_string(),
        });
        watch.send(WatchRecord::Deleted(cm("a", "5")));

        assert_eq!(next(&mut rx).await, "updated a@1->2");
        assert_eq!(next(&mut rx).await, "added b@3");
        assert_eq!(next(&mut rx).await, "deleted a");

        assert!(handle.store().get(&ObjectKey::new("default", "a")).is_none());
        assert!(handle.store().get(&ObjectKey::new("default", "b")).is_some());

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test]
    async fn out_of_order_records_are_dropped() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "10")], "10");
        let (informer, handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@10");
        let watch = source.next_watch().await;
        watch.send(WatchRecord::Modified(cm("a", "9")));
        watch.send(WatchRecord::Modified(cm("a", "11")));

        assert_eq!(next(&mut rx).await, "updated a@10->11");
        let cached = handle.store().get(&ObjectKey::new("default", "a")).unwrap();
        assert_eq!(cached.resource_version().as_deref(), Some("11"));

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test]
    async fn stream_end_triggers_full_relist() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1"), cm("b", "1")], "1");
        let (informer, handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        assert_eq!(next(&mut rx).await, "added b@1");

        let watch = source.next_watch().await;
        // While disconnected: a changed, b deleted, c created
        source.set_list(vec![cm("a", "4"), cm("c", "5")], "5");
        watch.close();

        assert_eq!(next(&mut rx).await, "updated a@1->4");
        assert_eq!(next(&mut rx).await, "added c@5");
        assert_eq!(next(&mut rx).await, "deleted b");

        let watch = source.next_watch().await;
        assert_eq!(watch.resource_version, "5");
        assert_eq!(source.list_calls(), 2);
        assert_eq!(handle.store().len(), 2);

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test(start_paused = true)]
    async fn immediately_closed_watch_backs_off() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1")], "1");
        let config = InformerConfig {
            resync_period: Duration::ZERO,
            relist_backoff: Duration::from_secs(1),
        };
        let (informer, _handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        source.next_watch().await.close();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(source.list_calls(), 1);

        let watch = source.next_watch().await;
        assert_eq!(source.list_calls(), 2);
        assert_eq!(watch.resource_version, "1");

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test(start_paused = true)]
    async fn long_lived_watch_end_relists_at_once() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1")], "1");
        let config = InformerConfig {
            resync_period: Duration::ZERO,
            relist_backoff: Duration::from_secs(60),
        };
        let (informer, _handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        let watch = source.next_watch().await;
        tokio::time::sleep(MIN_WATCH_DURATION * 2).await;
        watch.close();

        tokio::time::timeout(Duration::from_secs(1), source.next_watch())
            .await
            .expect("relist without waiting for the backoff");
        assert_eq!(source.list_calls(), 2);

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test]
    async fn watch_error_relists_after_backoff() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1")], "1");
        let (informer, _handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        let watch = source.next_watch().await;
        watch.fail(OperatorError::validation("stream broke"));

        // Relist sees the same object, so nothing is re-delivered
        let watch = source.next_watch().await;
        assert_eq!(source.list_calls(), 2);
        watch.send(WatchRecord::Modified(cm("a", "2")));
        assert_eq!(next(&mut rx).await, "updated a@1->2");

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test]
    async fn failed_list_is_retried() {
        let source = Arc::new(FakeListWatch::new());
        source.fail_next_list(OperatorError::validation("apiserver unavailable"));
        source.set_list(vec![cm("a", "1")], "1");
        let (informer, handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        assert!(handle.has_synced());
        assert_eq!(source.list_calls(), 2);

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test(start_paused = true)]
    async fn resync_redelivers_cached_objects() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1"), cm("b", "2")], "2");
        let config = InformerConfig {
            resync_period: Duration::from_secs(10),
            relist_backoff: Duration::from_millis(10),
        };
        let (informer, _handle, mut rx) =
            Informer::new(source.clone(), ListOptions::default(), config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        assert_eq!(next(&mut rx).await, "added a@1");
        assert_eq!(next(&mut rx).await, "added b@2");
        let _watch = source.next_watch().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(next(&mut rx).await, "updated a@1->1");
        assert_eq!(next(&mut rx).await, "updated b@2->2");

        cancel.cancel();
        task.await.expect("informer task");
    }

    #[tokio::test]
    async fn wait_for_sync_is_cancellable() {
        let source = Arc::new(FakeListWatch::<ConfigMap>::new());
        // The list never succeeds
        source.fail_all_lists(true);
        let (informer, handle, _rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(informer.run(cancel.clone()));

        let waiter = {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handle.wait_for_sync(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        // A second cancellation is a no-op
        cancel.cancel();

        let result = waiter.await.expect("waiter task");
        assert!(matches!(result, Err(OperatorError::Cancelled)));
        assert!(!handle.has_synced());
        task.await.expect("informer task");
    }

    #[tokio::test]
    async fn dropped_receiver_stops_informer() {
        let source = Arc::new(FakeListWatch::new());
        source.set_list(vec![cm("a", "1")], "1");
        let (informer, handle, rx) =
            Informer::new(source.clone(), ListOptions::default(), no_resync());
        drop(rx);

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), informer.run(cancel))
            .await
            .expect("informer should stop on its own");
        assert_eq!(handle.state(), InformerState::Idle);
    }
}
