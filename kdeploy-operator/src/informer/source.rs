//! List-watch source: one list call plus a watch stream for a single kind.

use crate::client::codec::ResourceCodec;
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::{DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Server-side watch timeout; the informer relists when the stream ends.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Which namespaces a list-watch covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Every namespace.
    #[default]
    All,
    /// A single namespace.
    Named(String),
}

impl NamespaceScope {
    /// Scope from an optional namespace name; empty means all namespaces.
    pub fn from_option(namespace: Option<String>) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => NamespaceScope::Named(ns),
            _ => NamespaceScope::All,
        }
    }
}

/// Request options shared by the list and the watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Namespace scope.
    pub namespace: NamespaceScope,
    /// Field selector, e.g. `metadata.name=r1`.
    pub field_selector: Option<String>,
    /// Label selector, e.g. `team=payments`.
    pub label_selector: Option<String>,
}

impl ListOptions {
    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(fields) = &self.field_selector {
            lp = lp.fields(fields);
        }
        if let Some(labels) = &self.label_selector {
            lp = lp.labels(labels);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(fields) = &self.field_selector {
            wp = wp.fields(fields);
        }
        if let Some(labels) = &self.label_selector {
            wp = wp.labels(labels);
        }
        wp
    }
}

/// Result of a list call.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    /// Objects, in server order.
    pub items: Vec<K>,
    /// Collection version to start the watch from.
    pub resource_version: Option<String>,
}

/// A change record from the watch stream.
#[derive(Debug, Clone)]
pub enum WatchRecord<K> {
    /// Object created.
    Added(K),
    /// Object changed.
    Modified(K),
    /// Object removed; carries its last state.
    Deleted(K),
    /// Progress marker without an object change.
    Bookmark {
        /// Collection version at the bookmark.
        resource_version: String,
    },
}

/// Stream of watch records; an `Err` item ends the session.
pub type WatchStream<K> = BoxStream<'static, OperatorResult<WatchRecord<K>>>;

/// Something that can list and watch one kind of object.
#[async_trait]
pub trait ListWatch<K>: Send + Sync {
    /// List every object matching `options`.
    async fn list(&self, options: &ListOptions) -> OperatorResult<ListPage<K>>;

    /// Watch for changes after `resource_version`.
    async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> OperatorResult<WatchStream<K>>;
}

/// List-watch over the Kubernetes API, addressed and decoded with the
/// kind's own codec.
pub struct KubeListWatch<K> {
    client: Client,
    codec: ResourceCodec<K>,
}

impl<K> KubeListWatch<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    /// Create a list-watch for the kind described by `codec`.
    pub fn new(client: Client, codec: ResourceCodec<K>) -> Self {
        Self { client, codec }
    }

    fn api(&self, scope: &NamespaceScope) -> Api<DynamicObject> {
        match scope {
            NamespaceScope::All => Api::all_with(self.client.clone(), self.codec.api_resource()),
            NamespaceScope::Named(ns) => {
                Api::namespaced_with(self.client.clone(), ns, self.codec.api_resource())
            }
        }
    }
}

/// Decode one object, logging and dropping malformed ones.
fn decode_or_skip<K>(codec: &ResourceCodec<K>, object: DynamicObject) -> Option<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let name = object.metadata.name.clone().unwrap_or_default();
    match codec.decode(object) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(name = %name, error = %e, "Dropping malformed object");
            None
        }
    }
}

/// Turn one API watch event into a record. Malformed objects yield `None`;
/// error events and transport failures become `Err` items.
fn translate<K>(
    codec: &ResourceCodec<K>,
    event: Result<WatchEvent<DynamicObject>, kube::Error>,
) -> Option<OperatorResult<WatchRecord<K>>>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    match event {
        Ok(WatchEvent::Added(obj)) => decode_or_skip(codec, obj).map(|o| Ok(WatchRecord::Added(o))),
        Ok(WatchEvent::Modified(obj)) => {
            decode_or_skip(codec, obj).map(|o| Ok(WatchRecord::Modified(o)))
        }
        Ok(WatchEvent::Deleted(obj)) => {
            decode_or_skip(codec, obj).map(|o| Ok(WatchRecord::Deleted(o)))
        }
        Ok(WatchEvent::Bookmark(bookmark)) => Some(Ok(WatchRecord::Bookmark {
            resource_version: bookmark.metadata.resource_version,
        })),
        Ok(WatchEvent::Error(err)) => {
            debug!(code = err.code, message = %err.message, "Watch returned an error event");
            Some(Err(OperatorError::KubeError(kube::Error::Api(err))))
        }
        Err(e) => Some(Err(OperatorError::from(e))),
    }
}

#[async_trait]
impl<K> ListWatch<K> for KubeListWatch<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + 'static,
{
    async fn list(&self, options: &ListOptions) -> OperatorResult<ListPage<K>> {
        let list = self.api(&options.namespace).list(&options.list_params()).await?;
        let items = list
            .items
            .into_iter()
            .filter_map(|obj| decode_or_skip(&self.codec, obj))
            .collect();

        Ok(ListPage {
            items,
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> OperatorResult<WatchStream<K>> {
        let events = self
            .api(&options.namespace)
            .watch(&options.watch_params(), resource_version)
            .await?;

        let codec = self.codec.clone();
        let records =
            events.filter_map(move |event| futures::future::ready(translate(&codec, event)));

        Ok(records.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Release;

    #[test]
    fn namespace_scope_from_option() {
        assert_eq!(NamespaceScope::from_option(None), NamespaceScope::All);
        assert_eq!(
            NamespaceScope::from_option(Some(String::new())),
            NamespaceScope::All
        );
        assert_eq!(
            NamespaceScope::from_option(Some("team-a".to_string())),
            NamespaceScope::Named("team-a".to_string())
        );
    }

    #[test]
    fn selectors_flow_into_request_params() {
        let options = ListOptions {
            namespace: NamespaceScope::All,
            field_selector: Some("metadata.name=r1".to_string()),
            label_selector: Some("team=payments".to_string()),
        };

        let lp = options.list_params();
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=r1"));
        assert_eq!(lp.label_selector.as_deref(), Some("team=payments"));

        let wp = options.watch_params();
        assert_eq!(wp.field_selector.as_deref(), Some("metadata.name=r1"));
        assert_eq!(wp.label_selector.as_deref(), Some("team=payments"));
        assert_eq!(wp.timeout, Some(WATCH_TIMEOUT_SECS));
    }

    fn event(value: serde_json::Value) -> Result<WatchEvent<DynamicObject>, kube::Error> {
        Ok(serde_json::from_value(value).expect("valid watch event"))
    }

    #[test]
    fn object_events_are_decoded() {
        let codec = ResourceCodec::<Release>::new();
        let record = translate(
            &codec,
            event(serde_json::json!({
                "type": "MODIFIED",
                "object": {
                    "apiVersion": "kdeploy.io/v1",
                    "kind": "Release",
                    "metadata": { "name": "r1", "namespace": "default", "resourceVersion": "12" },
                    "spec": { "replicas": 2 }
                }
            })),
        );

        match record {
            Some(Ok(WatchRecord::Modified(release))) => {
                assert_eq!(release.metadata.name.as_deref(), Some("r1"));
                assert_eq!(release.metadata.resource_version.as_deref(), Some("12"));
                assert_eq!(release.spec.replicas, Some(2));
            }
            other => panic!("expected Modified, got {other:?}"),
        }
    }

    #[test]
    fn object_without_kind_is_dropped() {
        let codec = ResourceCodec::<Release>::new();
        let record = translate(
            &codec,
            event(serde_json::json!({
                "type": "ADDED",
                "object": {
                    "apiVersion": "kdeploy.io/v1",
                    "metadata": { "name": "r1", "namespace": "default" },
                    "spec": {}
                }
            })),
        );
        assert!(record.is_none());
    }

    #[test]
    fn bookmark_keeps_its_version() {
        let codec = ResourceCodec::<Release>::new();
        let record = translate(
            &codec,
            event(serde_json::json!({
                "type": "BOOKMARK",
                "object": {
                    "apiVersion": "kdeploy.io/v1",
                    "kind": "Release",
                    "metadata": { "resourceVersion": "4021" }
                }
            })),
        );

        match record {
            Some(Ok(WatchRecord::Bookmark { resource_version })) => {
                assert_eq!(resource_version, "4021");
            }
            other => panic!("expected Bookmark, got {other:?}"),
        }
    }

    #[test]
    fn gone_error_event_is_a_transient_failure() {
        let codec = ResourceCodec::<Release>::new();
        let record = translate(
            &codec,
            event(serde_json::json!({
                "type": "ERROR",
                "object": {
                    "status": "Failure",
                    "message": "too old resource version: 1 (4021)",
                    "reason": "Expired",
                    "code": 410
                }
            })),
        );

        let err = match record {
            Some(Err(err)) => err,
            other => panic!("expected an error, got {other:?}"),
        };
        assert!(err.is_transient());
        assert!(matches!(
            err,
            OperatorError::KubeError(kube::Error::Api(ref resp)) if resp.code == 410
        ));
    }

    #[test]
    fn empty_options_select_everything() {
        let lp = ListOptions::default().list_params();
        assert!(lp.field_selector.is_none());
        assert!(lp.label_selector.is_none());
    }
}
