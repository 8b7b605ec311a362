//! Per-kind codec for custom resources.
//!
//! Requests for a custom kind are built from the kind's own group, version and
//! plural, and every payload is decoded against that kind. One codec value is
//! constructed per kind at startup and shared by every component that talks to
//! the cluster about that kind.

use crate::error::{OperatorError, OperatorResult};
use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// Encodes and decodes one resource kind.
pub struct ResourceCodec<K> {
    resource: ApiResource,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for ResourceCodec<K> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for ResourceCodec<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCodec")
            .field("api_version", &self.resource.api_version)
            .field("kind", &self.resource.kind)
            .field("plural", &self.resource.plural)
            .finish()
    }
}

impl<K> Default for ResourceCodec<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ResourceCodec<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    /// Build the codec from the kind's static type information.
    pub fn new() -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            _kind: PhantomData,
        }
    }

    /// Group, version, kind and plural used to address the kind.
    pub fn api_resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Kind name, for logs and errors.
    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    /// Decode an untyped object, rejecting objects whose type metadata is
    /// unset or names a different kind.
    pub fn decode(&self, object: DynamicObject) -> OperatorResult<K> {
        let types = object
            .types
            .as_ref()
            .filter(|t| !t.api_version.is_empty() && !t.kind.is_empty())
            .ok_or_else(|| self.decode_error("apiVersion/kind is unset"))?;

        if types.api_version != self.resource.api_version || types.kind != self.resource.kind {
            return Err(self.decode_error(format!(
                "expected {}/{}, got {}/{}",
                self.resource.api_version, self.resource.kind, types.api_version, types.kind
            )));
        }

        let value = serde_json::to_value(&object)?;
        serde_json::from_value(value).map_err(|e| self.decode_error(e.to_string()))
    }

    /// Encode a typed object for a write request.
    pub fn encode(&self, object: &K) -> OperatorResult<DynamicObject> {
        let value = serde_json::to_value(object)?;
        Ok(serde_json::from_value(value)?)
    }

    fn decode_error(&self, reason: impl Into<String>) -> OperatorError {
        OperatorError::DecodeError {
            kind: self.resource.kind.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Release;
    use kube::ResourceExt;

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).expect("Failed to build DynamicObject")
    }

    #[test]
    fn api_resource_matches_release() {
        let codec = ResourceCodec::<Release>::new();
        let ar = codec.api_resource();
        assert_eq!(ar.group, "kdeploy.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.api_version, "kdeploy.io/v1");
        assert_eq!(ar.kind, "Release");
        assert_eq!(ar.plural, "releases");
    }

    #[test]
    fn decodes_well_formed_release() {
        let codec = ResourceCodec::<Release>::new();
        let release = codec
            .decode(dynamic(serde_json::json!({
                "apiVersion": "kdeploy.io/v1",
                "kind": "Release",
                "metadata": { "name": "r1", "namespace": "default", "resourceVersion": "7" },
                "spec": { "replicas": 3 }
            })))
            .expect("Failed to decode Release");

        assert_eq!(release.name_any(), "r1");
        assert_eq!(release.resource_version().as_deref(), Some("7"));
        assert_eq!(release.spec.replicas, Some(3));
    }

    #[test]
    fn rejects_unset_type_metadata() {
        let codec = ResourceCodec::<Release>::new();
        let err = codec
            .decode(dynamic(serde_json::json!({
                "metadata": { "name": "r1", "namespace": "default" },
                "spec": {}
            })))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("unset"));
    }

    #[test]
    fn rejects_foreign_kind() {
        let codec = ResourceCodec::<Release>::new();
        let err = codec
            .decode(dynamic(serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "r1", "namespace": "default" },
                "spec": {}
            })))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("apps/v1/Deployment"));
    }

    #[test]
    fn encode_keeps_type_metadata() {
        let codec = ResourceCodec::<Release>::new();
        let release = codec
            .decode(dynamic(serde_json::json!({
                "apiVersion": "kdeploy.io/v1",
                "kind": "Release",
                "metadata": { "name": "r1", "namespace": "default" },
                "spec": {}
            })))
            .expect("Failed to decode Release");

        let encoded = codec.encode(&release).expect("Failed to encode Release");
        let types = encoded.types.expect("type metadata");
        assert_eq!(types.api_version, "kdeploy.io/v1");
        assert_eq!(types.kind, "Release");
        assert_eq!(encoded.metadata.name.as_deref(), Some("r1"));
    }
}
