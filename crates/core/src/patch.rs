//! Patch accumulation for one processing cycle.
//!
//! A `Patch` collects declarative merge entries (a nested map where `null` means
//! "delete this field") and imperative transforms (`&mut Json` mutators applied to
//! the freshest snapshot). Handlers and the framework write into the same patch;
//! the applier splits it into store calls at the end of the cycle.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::FieldPath;

pub type Transform = Arc<dyn Fn(&mut Json) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Patch {
    body: Map<String, Json>,
    transforms: Vec<Transform>,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patch").field("body", &self.body).field("transforms", &self.transforms.len()).finish()
    }
}

/// The patch split by destination. Each part is sent as its own store call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchParts {
    /// Merge patch for the main body (no `status`, no `metadata.finalizers`).
    pub main: Option<Json>,
    /// Merge patch for `status`, wrapped as `{"status": ...}`.
    pub status: Option<Json>,
    /// Merge patch replacing `metadata.finalizers`.
    pub finalizers: Option<Json>,
}

impl Patch {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.body.is_empty() && self.transforms.is_empty() }
    pub fn body(&self) -> &Map<String, Json> { &self.body }
    pub fn as_json(&self) -> Json { Json::Object(self.body.clone()) }
    pub fn transforms(&self) -> &[Transform] { &self.transforms }

    /// Merge a declarative fragment; nested maps merge, everything else (incl. `null`) overwrites.
    pub fn merge(&mut self, fragment: Json) {
        if let Json::Object(map) = fragment {
            for (k, v) in map {
                accumulate(self.body.entry(k).or_insert(Json::Null), v);
            }
        }
    }

    pub fn set(&mut self, path: &FieldPath, value: Json) {
        let mut fragment = value;
        for seg in path.segments().iter().rev() {
            let mut m = Map::new();
            m.insert(seg.clone(), fragment);
            fragment = Json::Object(m);
        }
        self.merge(fragment);
    }

    pub fn remove(&mut self, path: &FieldPath) { self.set(path, Json::Null) }

    pub fn set_annotation(&mut self, key: &str, value: Option<String>) {
        let v = value.map(Json::String).unwrap_or(Json::Null);
        self.merge(serde_json::json!({"metadata": {"annotations": {key: v}}}));
    }

    pub fn set_label(&mut self, key: &str, value: Option<String>) {
        let v = value.map(Json::String).unwrap_or(Json::Null);
        self.merge(serde_json::json!({"metadata": {"labels": {key: v}}}));
    }

    pub fn set_status(&mut self, key: &str, value: Json) {
        self.merge(serde_json::json!({"status": {key: value}}));
    }

    pub fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.merge(serde_json::json!({"metadata": {"finalizers": finalizers}}));
    }

    /// Register an imperative change, applied in registration order.
    pub fn transform<F>(&mut self, f: F)
    where
        F: Fn(&mut Json) + Send + Sync + 'static,
    {
        self.transforms.push(Arc::new(f));
    }

    /// Fold another patch into this one (fragments merged, transforms appended).
    pub fn extend(&mut self, other: Patch) {
        self.merge(Json::Object(other.body));
        self.transforms.extend(other.transforms);
    }

    /// Split declarative entries by destination. With `status_subresource = false`
    /// the status part stays inside `main`.
    pub fn split(&self, status_subresource: bool) -> PatchParts {
        let mut main = self.body.clone();
        let mut parts = PatchParts::default();
        if status_subresource {
            if let Some(status) = main.remove("status") {
                parts.status = Some(serde_json::json!({ "status": status }));
            }
        }
        if let Some(meta) = main.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            if let Some(fins) = meta.remove("finalizers") {
                parts.finalizers = Some(serde_json::json!({"metadata": {"finalizers": fins}}));
            }
            if meta.is_empty() {
                main.remove("metadata");
            }
        }
        if !main.is_empty() {
            parts.main = Some(Json::Object(main));
        }
        parts
    }

    /// Run the transforms against `base` and return the mutated copy.
    pub fn transformed(&self, base: &Json) -> Json {
        let mut out = base.clone();
        for t in self.transforms.iter() {
            t(&mut out);
        }
        out
    }
}

fn accumulate(target: &mut Json, value: Json) {
    match (target, value) {
        (Json::Object(t), Json::Object(v)) => {
            for (k, vv) in v {
                accumulate(t.entry(k).or_insert(Json::Null), vv);
            }
        }
        (t, v) => *t = v,
    }
}

/// The merge patch turning `old` into `new`: removed keys become `null`.
pub fn merge_patch_between(old: &Json, new: &Json) -> Json {
    match (old, new) {
        (Json::Object(o), Json::Object(n)) => {
            let mut out = Map::new();
            for (k, ov) in o.iter() {
                match n.get(k) {
                    None => {
                        out.insert(k.clone(), Json::Null);
                    }
                    Some(nv) if nv != ov => {
                        out.insert(k.clone(), merge_patch_between(ov, nv));
                    }
                    Some(_) => {}
                }
            }
            for (k, nv) in n.iter() {
                if !o.contains_key(k) {
                    out.insert(k.clone(), nv.clone());
                }
            }
            Json::Object(out)
        }
        (_, n) => n.clone(),
    }
}

/// RFC 7386 merge: `null` deletes, maps merge recursively, everything else overwrites.
pub fn merge_values(target: &mut Json, patch: &Json) { json_patch::merge(target, patch) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragments_accumulate_and_keep_deletions() {
        let mut p = Patch::new();
        p.merge(json!({"spec": {"a": 1, "b": {"c": 1}}}));
        p.merge(json!({"spec": {"b": {"d": 2}, "a": null}}));
        p.set(&FieldPath::parse("spec.e"), json!([1]));
        assert_eq!(p.as_json(), json!({"spec": {"a": null, "b": {"c": 1, "d": 2}, "e": [1]}}));
    }

    #[test]
    fn map_overwrites_scalar_and_back() {
        let mut p = Patch::new();
        p.merge(json!({"x": 1}));
        p.merge(json!({"x": {"y": 1}}));
        assert_eq!(p.as_json(), json!({"x": {"y": 1}}));
        p.merge(json!({"x": "s"}));
        assert_eq!(p.as_json(), json!({"x": "s"}));
    }

    #[test]
    fn split_separates_status_and_finalizers() {
        let mut p = Patch::new();
        p.set_annotation("orka.skelops.io/h1", Some("{}".into()));
        p.set_status("h1", json!({"ok": true}));
        p.set_finalizers(vec!["orka.skelops.io/finalizer".into()]);
        let parts = p.split(true);
        assert_eq!(parts.main, Some(json!({"metadata": {"annotations": {"orka.skelops.io/h1": "{}"}}})));
        assert_eq!(parts.status, Some(json!({"status": {"h1": {"ok": true}}})));
        assert_eq!(parts.finalizers, Some(json!({"metadata": {"finalizers": ["orka.skelops.io/finalizer"]}})));

        let inline = p.split(false);
        assert_eq!(inline.status, None);
        assert_eq!(inline.main.as_ref().and_then(|m| m.get("status")), Some(&json!({"h1": {"ok": true}})));
    }

    #[test]
    fn finalizers_only_patch_leaves_main_empty() {
        let mut p = Patch::new();
        p.set_finalizers(vec![]);
        let parts = p.split(true);
        assert!(parts.main.is_none());
        assert!(parts.finalizers.is_some());
    }

    #[test]
    fn transforms_apply_in_order() {
        let mut p = Patch::new();
        p.transform(|v| v["spec"]["items"].as_array_mut().into_iter().for_each(|a| a.push(json!(3))));
        p.transform(|v| v["spec"]["count"] = json!(v["spec"]["items"].as_array().map(|a| a.len()).unwrap_or(0)));
        assert!(!p.is_empty());
        let out = p.transformed(&json!({"spec": {"items": [1, 2]}}));
        assert_eq!(out, json!({"spec": {"items": [1, 2, 3], "count": 3}}));
    }

    #[test]
    fn merge_patch_between_nulls_removed_keys() {
        let old = json!({"a": 1, "b": {"c": 1, "d": 2}, "e": [1]});
        let new = json!({"b": {"c": 1, "d": 3}, "e": [1], "f": true});
        let p = merge_patch_between(&old, &new);
        assert_eq!(p, json!({"a": null, "b": {"d": 3}, "f": true}));
        let mut doc = old.clone();
        merge_values(&mut doc, &p);
        assert_eq!(doc, new);
    }

    #[test]
    fn merge_values_deletes_nulls() {
        let mut doc = json!({"a": 1, "b": {"c": 1, "d": 2}});
        merge_values(&mut doc, &json!({"a": null, "b": {"d": null, "e": 3}}));
        assert_eq!(doc, json!({"b": {"c": 1, "e": 3}}));
    }
}
