//! Keyed snapshot of the objects known to an informer.
//!
//! Only the informer writes to a store; everyone else gets [`Store`] clones
//! that hand out shared, read-only `Arc`s.

use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace; `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Create a namespaced key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an object.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// True when `incoming` carries an older resource version than `current`.
///
/// Versions that do not parse as integers are never considered stale.
pub fn is_stale<K: Resource>(current: &K, incoming: &K) -> bool {
    let parse = |obj: &K| {
        obj.meta()
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
    };
    matches!((parse(current), parse(incoming)), (Some(cur), Some(inc)) if inc < cur)
}

/// Outcome of writing one object into the store.
#[derive(Debug)]
pub(crate) enum Upsert<K> {
    /// The key was new.
    Inserted(Arc<K>),
    /// The key existed; carries the previous and the new object.
    Replaced { old: Arc<K>, new: Arc<K> },
    /// The incoming object was older than the stored one and was dropped.
    Stale,
}

/// Shared, read-only view of the informer's snapshot.
pub struct Store<K> {
    inner: Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: Resource> Store<K> {
    /// Look up an object.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.read().get(key).cloned()
    }

    /// All objects, ordered by key.
    pub fn list(&self) -> Vec<Arc<K>> {
        let guard = self.inner.read();
        let mut entries: Vec<_> = guard.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, obj)| Arc::clone(obj)).collect()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub(crate) fn upsert(&self, obj: K) -> Upsert<K> {
        let key = ObjectKey::of(&obj);
        let mut guard = self.inner.write();
        match guard.get(&key) {
            Some(current) if is_stale(current.as_ref(), &obj) => Upsert::Stale,
            Some(current) => {
                let old = Arc::clone(current);
                let new = Arc::new(obj);
                guard.insert(key, Arc::clone(&new));
                Upsert::Replaced { old, new }
            }
            None => {
                let new = Arc::new(obj);
                guard.insert(key, Arc::clone(&new));
                Upsert::Inserted(new)
            }
        }
    }

    pub(crate) fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.write().remove(key)
    }

    /// Swap in a complete snapshot and return the previous one.
    pub(crate) fn replace(
        &self,
        snapshot: HashMap<ObjectKey, Arc<K>>,
    ) -> HashMap<ObjectKey, Arc<K>> {
        std::mem::replace(&mut *self.inner.write(), snapshot)
    }
}
