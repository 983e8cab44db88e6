//! Orka persistence: state kept on the objects themselves.
//!
//! Two things survive restarts: per-handler execution records (the retry ledger)
//! and the last-handled essence (the baseline for the next diff). Both live in
//! annotations and/or a reserved `status` sub-tree under framework-owned keys.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use metrics::counter;
use orka_core::{essence, merge_patch_between, FieldPath, Patch, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

pub const DEFAULT_PREFIX: &str = "orka.skelops.io";
pub const DIFFBASE_KEY: &str = "last-handled-configuration";
const STATUS_ROOT: &str = "orka";
const MAX_NAME_LEN: usize = 63;

/// Retry ledger for one (object, handler) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed: Option<DateTime<Utc>>,
    /// Cause reason this record belongs to; records of another purpose are stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionRecord {
    pub fn is_finished(&self) -> bool { self.success || self.failure }
}

/// Annotation name for `id` under `prefix`, shortened when it would not be a valid
/// annotation name: sanitised, truncated and suffixed with a stable hash.
pub fn annotation_key(prefix: &str, id: &str) -> String {
    let mut name: String =
        id.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '.' }).collect();
    let trimmed = name.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string();
    let changed = trimmed != id;
    name = trimmed;
    if name.len() > MAX_NAME_LEN || (changed && !name.is_empty()) || name.is_empty() {
        let suffix = format!("{:016x}", fnv1a(id.as_bytes()));
        let keep = MAX_NAME_LEN - suffix.len() - 1;
        name.truncate(keep);
        let head = name.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
        name = if head.is_empty() { suffix } else { format!("{}-{}", head, suffix) };
    }
    format!("{}/{}", prefix, name)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn patch_has(patch: &Patch, path: &[&str]) -> bool {
    let mut cur = match patch.body().get(path[0]) {
        Some(v) => v,
        None => return false,
    };
    for seg in &path[1..] {
        cur = match cur.get(seg) {
            Some(v) => v,
            None => return false,
        };
    }
    !cur.is_null()
}

fn parse_record(raw: &Json, handler_id: &str) -> Option<ExecutionRecord> {
    match serde_json::from_value::<ExecutionRecord>(raw.clone()) {
        Ok(r) => Some(r),
        Err(e) => {
            counter!("persist_corrupt_records_total", 1u64);
            warn!(handler = %handler_id, error = %e, "ignoring unparsable execution record");
            None
        }
    }
}

pub trait ProgressStorage: Send + Sync {
    fn fetch(&self, body: &Snapshot, handler_id: &str) -> Option<ExecutionRecord>;
    fn store(&self, body: &Snapshot, patch: &mut Patch, handler_id: &str, record: &ExecutionRecord);
    fn purge(&self, body: &Snapshot, patch: &mut Patch, handler_id: &str);
}

/// Records as JSON strings in `metadata.annotations["<prefix>/<id>"]`.
#[derive(Debug, Clone)]
pub struct AnnotationsProgressStorage {
    prefix: String,
}

impl AnnotationsProgressStorage {
    pub fn new(prefix: &str) -> Self { Self { prefix: prefix.to_string() } }
}

impl ProgressStorage for AnnotationsProgressStorage {
    fn fetch(&self, body: &Snapshot, handler_id: &str) -> Option<ExecutionRecord> {
        let key = annotation_key(&self.prefix, handler_id);
        let text = body.annotation(&key)?;
        let raw: Json = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(handler = %handler_id, error = %e, "ignoring non-JSON execution record annotation");
                return None;
            }
        };
        parse_record(&raw, handler_id)
    }

    fn store(&self, _body: &Snapshot, patch: &mut Patch, handler_id: &str, record: &ExecutionRecord) {
        let key = annotation_key(&self.prefix, handler_id);
        match serde_json::to_string(record) {
            Ok(text) => patch.set_annotation(&key, Some(text)),
            Err(e) => warn!(handler = %handler_id, error = %e, "failed to serialise execution record"),
        }
    }

    fn purge(&self, body: &Snapshot, patch: &mut Patch, handler_id: &str) {
        let key = annotation_key(&self.prefix, handler_id);
        if body.annotation(&key).is_some() || patch_has(patch, &["metadata", "annotations", key.as_str()]) {
            patch.set_annotation(&key, None);
        }
    }
}

/// Records as structured JSON in `status.orka.progress.<id>`.
#[derive(Debug, Clone, Default)]
pub struct StatusProgressStorage;

impl StatusProgressStorage {
    fn path(handler_id: &str) -> FieldPath { FieldPath::from(["status", STATUS_ROOT, "progress", handler_id]) }
}

impl ProgressStorage for StatusProgressStorage {
    fn fetch(&self, body: &Snapshot, handler_id: &str) -> Option<ExecutionRecord> {
        let raw = body.get(&Self::path(handler_id))?;
        if raw.is_null() {
            return None;
        }
        parse_record(raw, handler_id)
    }

    fn store(&self, _body: &Snapshot, patch: &mut Patch, handler_id: &str, record: &ExecutionRecord) {
        match serde_json::to_value(record) {
            Ok(v) => patch.set(&Self::path(handler_id), v),
            Err(e) => warn!(handler = %handler_id, error = %e, "failed to serialise execution record"),
        }
    }

    fn purge(&self, body: &Snapshot, patch: &mut Patch, handler_id: &str) {
        let present = body.get(&Self::path(handler_id)).map(|v| !v.is_null()).unwrap_or(false);
        if present || patch_has(patch, &["status", STATUS_ROOT, "progress", handler_id]) {
            patch.remove(&Self::path(handler_id));
        }
    }
}

/// Writes both; reads annotations first. Annotations share a write with the
/// diff-base, so they are the authoritative copy.
#[derive(Debug, Clone)]
pub struct SmartProgressStorage {
    annotations: AnnotationsProgressStorage,
    status: StatusProgressStorage,
}

impl SmartProgressStorage {
    pub fn new(prefix: &str) -> Self { Self { annotations: AnnotationsProgressStorage::new(prefix), status: StatusProgressStorage } }
}

impl ProgressStorage for SmartProgressStorage {
    fn fetch(&self, body: &Snapshot, handler_id: &str) -> Option<ExecutionRecord> {
        self.annotations.fetch(body, handler_id).or_else(|| self.status.fetch(body, handler_id))
    }

    fn store(&self, body: &Snapshot, patch: &mut Patch, handler_id: &str, record: &ExecutionRecord) {
        self.annotations.store(body, patch, handler_id, record);
        self.status.store(body, patch, handler_id, record);
    }

    fn purge(&self, body: &Snapshot, patch: &mut Patch, handler_id: &str) {
        self.annotations.purge(body, patch, handler_id);
        self.status.purge(body, patch, handler_id);
    }
}

/// Every execution record found on a body, by annotation name (under `prefix`)
/// or by `status` key. Annotation names may be shortened, so they are reported
/// as stored. Used for inspection; the engine reads records by handler id.
pub fn list_records(body: &Snapshot, prefix: &str) -> Vec<(String, ExecutionRecord)> {
    let mut out = Vec::new();
    let own = format!("{}/", prefix);
    let skip = [format!("{}{}", own, DIFFBASE_KEY), format!("{}finalizer", own)];
    for (key, value) in body.annotations().into_iter().flatten() {
        if !key.starts_with(&own) || skip.contains(key) {
            continue;
        }
        let parsed = value.as_str().and_then(|t| serde_json::from_str::<ExecutionRecord>(t).ok());
        if let Some(record) = parsed {
            out.push((key.clone(), record));
        }
    }
    let progress = FieldPath::from(["status", STATUS_ROOT, "progress"]);
    if let Some(entries) = body.get(&progress).and_then(|v| v.as_object()) {
        for (id, raw) in entries.iter().filter(|(_, v)| !v.is_null()) {
            if let Some(record) = parse_record(raw, id) {
                out.push((format!("status.{}.progress.{}", STATUS_ROOT, id), record));
            }
        }
    }
    out
}

pub trait DiffBaseStorage: Send + Sync {
    /// The essence of a body, as it would be stored.
    fn build(&self, raw: &Json) -> Json;
    fn fetch(&self, body: &Snapshot) -> Option<Json>;
    fn store(&self, body: &Snapshot, patch: &mut Patch, essence: &Json);
}

#[derive(Debug, Clone)]
pub struct AnnotationsDiffBaseStorage {
    prefix: String,
    key: String,
}

impl AnnotationsDiffBaseStorage {
    pub fn new(prefix: &str) -> Self { Self { prefix: prefix.to_string(), key: format!("{}/{}", prefix, DIFFBASE_KEY) } }
}

impl DiffBaseStorage for AnnotationsDiffBaseStorage {
    fn build(&self, raw: &Json) -> Json { essence(raw, &self.prefix) }

    fn fetch(&self, body: &Snapshot) -> Option<Json> {
        let text = body.annotation(&self.key)?;
        match serde_json::from_str(text) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "ignoring unparsable last-handled configuration");
                None
            }
        }
    }

    fn store(&self, body: &Snapshot, patch: &mut Patch, essence: &Json) {
        let text = serde_json::to_string(essence).unwrap_or_else(|_| "{}".to_string());
        if body.annotation(&self.key) != Some(text.as_str()) {
            patch.set_annotation(&self.key, Some(text));
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusDiffBaseStorage {
    prefix: String,
}

impl StatusDiffBaseStorage {
    pub fn new(prefix: &str) -> Self { Self { prefix: prefix.to_string() } }
    fn path() -> FieldPath { FieldPath::from(["status", STATUS_ROOT, DIFFBASE_KEY]) }
}

impl DiffBaseStorage for StatusDiffBaseStorage {
    fn build(&self, raw: &Json) -> Json { essence(raw, &self.prefix) }

    fn fetch(&self, body: &Snapshot) -> Option<Json> { body.get(&Self::path()).filter(|v| !v.is_null()).cloned() }

    fn store(&self, body: &Snapshot, patch: &mut Patch, essence: &Json) {
        match body.get(&Self::path()) {
            Some(old) if old == essence => {}
            // keys removed since the last store must be nulled explicitly
            Some(old) => patch.set(&Self::path(), merge_patch_between(old, essence)),
            None => patch.set(&Self::path(), essence.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStorageKind {
    Annotations,
    Status,
    #[default]
    Smart,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiffBaseStorageKind {
    #[default]
    Annotations,
    Status,
}

pub fn progress_storage(kind: ProgressStorageKind, prefix: &str) -> Box<dyn ProgressStorage> {
    match kind {
        ProgressStorageKind::Annotations => Box::new(AnnotationsProgressStorage::new(prefix)),
        ProgressStorageKind::Status => Box::new(StatusProgressStorage),
        ProgressStorageKind::Smart => Box::new(SmartProgressStorage::new(prefix)),
    }
}

pub fn diffbase_storage(kind: DiffBaseStorageKind, prefix: &str) -> Box<dyn DiffBaseStorage> {
    match kind {
        DiffBaseStorageKind::Annotations => Box::new(AnnotationsDiffBaseStorage::new(prefix)),
        DiffBaseStorageKind::Status => Box::new(StatusDiffBaseStorage::new(prefix)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn applied(body: &Json, patch: &Patch) -> Snapshot {
        let mut out = body.clone();
        orka_core::merge_values(&mut out, &patch.as_json());
        Snapshot::new(out)
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord {
            started: Some("2024-01-01T00:00:00Z".parse().expect("ts")),
            retries: 2,
            purpose: Some("create".into()),
            message: Some("not yet".into()),
            ..Default::default()
        }
    }

    #[test]
    fn annotation_keys_are_valid_and_stable() {
        assert_eq!(annotation_key(DEFAULT_PREFIX, "create_fn"), "orka.skelops.io/create_fn");
        let weird = annotation_key(DEFAULT_PREFIX, "module/create fn");
        let name = weird.split_once('/').map(|(_, n)| n).unwrap_or("");
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)), "{}", weird);
        let long_id = "x".repeat(100);
        let long = annotation_key(DEFAULT_PREFIX, &long_id);
        assert!(long.len() - DEFAULT_PREFIX.len() - 1 <= 63);
        assert_eq!(long, annotation_key(DEFAULT_PREFIX, &long_id));
        assert_ne!(long, annotation_key(DEFAULT_PREFIX, &"x".repeat(101)));
    }

    #[test]
    fn annotations_storage_roundtrips_and_purges() {
        let s = AnnotationsProgressStorage::new(DEFAULT_PREFIX);
        let body = json!({"metadata": {"name": "x"}});
        let mut patch = Patch::new();
        s.store(&Snapshot::new(body.clone()), &mut patch, "h1", &record());
        let after = applied(&body, &patch);
        assert_eq!(s.fetch(&after, "h1"), Some(record()));

        let mut purge = Patch::new();
        s.purge(&after, &mut purge, "h1");
        assert_eq!(purge.as_json(), json!({"metadata": {"annotations": {"orka.skelops.io/h1": null}}}));

        let mut nothing = Patch::new();
        s.purge(&Snapshot::new(body), &mut nothing, "h1");
        assert!(nothing.is_empty());
    }

    #[test]
    fn status_storage_roundtrips() {
        let s = StatusProgressStorage;
        let body = json!({"metadata": {"name": "x"}, "status": {"other": 1}});
        let mut patch = Patch::new();
        s.store(&Snapshot::new(body.clone()), &mut patch, "h1", &record());
        let after = applied(&body, &patch);
        assert_eq!(after.status()["other"], json!(1));
        assert_eq!(s.fetch(&after, "h1"), Some(record()));
        let mut purge = Patch::new();
        s.purge(&after, &mut purge, "h1");
        assert_eq!(s.fetch(&applied(after.raw(), &purge), "h1"), None);
    }

    #[test]
    fn smart_storage_prefers_annotations() {
        let s = SmartProgressStorage::new(DEFAULT_PREFIX);
        let mut only_status = record();
        only_status.retries = 9;
        let body = json!({"metadata": {"name": "x"}, "status": {"orka": {"progress": {"h1": serde_json::to_value(&only_status).expect("json")}}}});
        assert_eq!(s.fetch(&Snapshot::new(body.clone()), "h1").map(|r| r.retries), Some(9));

        let mut patch = Patch::new();
        s.store(&Snapshot::new(body.clone()), &mut patch, "h1", &record());
        let after = applied(&body, &patch);
        assert_eq!(s.fetch(&after, "h1").map(|r| r.retries), Some(2));
    }

    #[test]
    fn listing_finds_records_in_both_places() {
        let text = serde_json::to_string(&record()).expect("json");
        let body = Snapshot::new(json!({
            "metadata": {"annotations": {
                "orka.skelops.io/h1": text,
                "orka.skelops.io/last-handled-configuration": "{}",
                "orka.skelops.io/garbage": "nope",
                "other.io/h1": text,
            }},
            "status": {"orka": {"progress": {"h2": {"retries": 1}, "h3": null}}},
        }));
        let found = list_records(&body, DEFAULT_PREFIX);
        let keys: Vec<&str> = found.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["orka.skelops.io/h1", "status.orka.progress.h2"]);
        assert_eq!(found[0].1, record());
        assert_eq!(found[1].1.retries, 1);
    }

    #[test]
    fn garbage_records_are_ignored() {
        let s = AnnotationsProgressStorage::new(DEFAULT_PREFIX);
        let body = Snapshot::new(json!({"metadata": {"annotations": {"orka.skelops.io/h1": "not json"}}}));
        assert_eq!(s.fetch(&body, "h1"), None);
    }

    #[test]
    fn diffbase_annotation_is_written_only_when_changed() {
        let s = AnnotationsDiffBaseStorage::new(DEFAULT_PREFIX);
        let body = json!({"metadata": {"name": "x", "resourceVersion": "1"}, "spec": {"a": 1}, "status": {"s": 1}});
        let e = s.build(&body);
        assert_eq!(e, json!({"spec": {"a": 1}}));
        let mut patch = Patch::new();
        s.store(&Snapshot::new(body.clone()), &mut patch, &e);
        let after = applied(&body, &patch);
        assert_eq!(s.fetch(&after), Some(e.clone()));
        // the stored annotation is reserved, so the essence is unchanged by storing it
        assert_eq!(s.build(after.raw()), e);
        let mut again = Patch::new();
        s.store(&after, &mut again, &e);
        assert!(again.is_empty());
    }

    #[test]
    fn diffbase_in_status_replaces_old_tree() {
        let s = StatusDiffBaseStorage::new(DEFAULT_PREFIX);
        let body = json!({"spec": {"a": 1, "b": 2}});
        let mut patch = Patch::new();
        s.store(&Snapshot::new(body.clone()), &mut patch, &s.build(&body));
        let after = applied(&body, &patch);
        assert_eq!(s.fetch(&after), Some(json!({"spec": {"a": 1, "b": 2}})));

        let mut next = after.raw().clone();
        next["spec"] = json!({"a": 1});
        let mut patch = Patch::new();
        s.store(&Snapshot::new(next.clone()), &mut patch, &s.build(&next));
        let after = applied(&next, &patch);
        assert_eq!(s.fetch(&after), Some(json!({"spec": {"a": 1}})));
    }
}
