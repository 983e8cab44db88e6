//! Immutable object snapshots and read-only views over them.
//!
//! A `Snapshot` is cheap to clone and never mutated; every processing cycle gets a
//! fresh one, and accessors compute their views from it on each call.

use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::{FieldPath, ObjectId};

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot(Arc<Json>);

impl Snapshot {
    pub fn new(mut raw: Json) -> Self {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);
        Self(Arc::new(raw))
    }

    pub fn raw(&self) -> &Json { &self.0 }
    pub fn into_raw(self) -> Json { Arc::try_unwrap(self.0).unwrap_or_else(|arc| (*arc).clone()) }

    pub fn id(&self) -> anyhow::Result<ObjectId> { ObjectId::from_body(&self.0) }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> { self.meta_str("name") }
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace") }
    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }
    pub fn deletion_timestamp(&self) -> Option<&str> { self.meta_str("deletionTimestamp") }
    pub fn is_deletion_marked(&self) -> bool { self.deletion_timestamp().is_some() }

    pub fn labels(&self) -> Option<&Map<String, Json>> {
        self.0.get("metadata").and_then(|m| m.get("labels")).and_then(|v| v.as_object())
    }

    pub fn annotations(&self) -> Option<&Map<String, Json>> {
        self.0.get("metadata").and_then(|m| m.get("annotations")).and_then(|v| v.as_object())
    }

    pub fn label(&self, key: &str) -> Option<&str> { self.labels().and_then(|l| l.get(key)).and_then(|v| v.as_str()) }
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn finalizers(&self) -> Vec<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("finalizers"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn has_finalizer(&self, marker: &str) -> bool { self.finalizers().iter().any(|f| *f == marker) }

    /// `spec` subtree, or `Null` when absent.
    pub fn spec(&self) -> &Json { self.0.get("spec").unwrap_or(&Json::Null) }
    /// `status` subtree, or `Null` when absent.
    pub fn status(&self) -> &Json { self.0.get("status").unwrap_or(&Json::Null) }

    pub fn get(&self, path: &FieldPath) -> Option<&Json> { path.resolve(&self.0) }
}

impl From<Json> for Snapshot {
    fn from(raw: Json) -> Self { Self::new(raw) }
}

#[cfg_attr(not(feature = "strip-managed-fields"), allow(dead_code))]
fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// The part of a body that user handlers care about: everything except `status`
/// and server-managed metadata. Labels and annotations are kept, minus the ones
/// under the framework-reserved `prefix`. Empty maps are pruned.
pub fn essence(raw: &Json, prefix: &str) -> Json {
    let mut out = raw.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.retain(|k, _| k == "labels" || k == "annotations");
            if let Some(annos) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
                let reserved = format!("{}/", prefix);
                annos.retain(|k, _| k != LAST_APPLIED && !k.starts_with(&reserved));
            }
        }
    }
    prune_empty(&mut out);
    out
}

fn prune_empty(v: &mut Json) {
    if let Json::Object(map) = v {
        for (_k, child) in map.iter_mut() {
            prune_empty(child);
        }
        map.retain(|_k, child| !matches!(child, Json::Object(m) if m.is_empty()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "6f1d2b3e-0000-4000-8000-000000000001",
                "resourceVersion": "12",
                "generation": 3,
                "managedFields": [{"manager": "kubectl"}],
                "labels": {"app": "demo"},
                "annotations": {
                    "orka.skelops.io/last-handled-configuration": "{}",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "team": "core"
                },
                "finalizers": ["orka.skelops.io/finalizer"]
            },
            "spec": {"a": 1, "empty": {}},
            "status": {"ready": true}
        })
    }

    #[test]
    fn accessors_read_metadata() {
        let s = Snapshot::new(body());
        assert_eq!(s.name(), Some("x"));
        assert_eq!(s.namespace(), Some("ns"));
        assert_eq!(s.resource_version(), Some("12"));
        assert_eq!(s.label("app"), Some("demo"));
        assert!(s.has_finalizer("orka.skelops.io/finalizer"));
        assert!(!s.is_deletion_marked());
        assert_eq!(s.spec()["a"], json!(1));
        assert_eq!(Snapshot::new(json!({})).status(), &Json::Null);
    }

    #[cfg(feature = "strip-managed-fields")]
    #[test]
    fn managed_fields_are_stripped() {
        let s = Snapshot::new(body());
        assert!(s.raw()["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn essence_drops_noise_and_reserved_annotations() {
        let e = essence(&body(), "orka.skelops.io");
        assert_eq!(
            e,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"labels": {"app": "demo"}, "annotations": {"team": "core"}},
                "spec": {"a": 1}
            })
        );
    }

    #[test]
    fn essence_ignores_status_only_changes() {
        let a = body();
        let mut b = body();
        b["status"]["ready"] = json!(false);
        b["metadata"]["resourceVersion"] = json!("13");
        assert_eq!(essence(&a, "orka.skelops.io"), essence(&b, "orka.skelops.io"));
    }
}
