//! In-RAM cluster: enough of the API server's behaviour to drive the engine in tests.
//!
//! Simulated: a global resourceVersion counter, watch history with replay from a
//! version token (and `Gone` after `compact`), finalizer-gated deletion, the
//! status subresource, JSON-patch `test` preconditions and no-op patch detection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::{stream, StreamExt};
use orka_core::{merge_values, ResourceKey};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::broadcast;

use crate::{EventKind, EventStream, ObjectList, RawEvent, ResourceInfo, StoreClient, StoreError, WatchSource};

type ObjectKey = (ResourceKey, Option<String>, String);

#[derive(Debug, Clone)]
enum Signal {
    Event { key: ResourceKey, namespace: Option<String>, event: RawEvent },
    Disconnect,
    Fail(StoreError),
}

/// A mutating call as the store received it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub op: &'static str,
    pub resource: ResourceKey,
    pub name: String,
    pub subresource: Option<String>,
    pub body: Json,
}

#[derive(Default)]
struct MemState {
    rv: u64,
    compacted: u64,
    resources: FxHashMap<ResourceKey, ResourceInfo>,
    objects: BTreeMap<ObjectKey, Json>,
    history: Vec<(u64, Signal)>,
    calls: Vec<StoreCall>,
    failures: VecDeque<StoreError>,
    aimed: Vec<(&'static str, Option<String>, StoreError)>,
}

pub struct MemoryStore {
    state: Mutex<MemState>,
    signals: broadcast::Sender<Signal>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

fn now_ts() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true) }

fn meta_str<'a>(body: &'a Json, field: &str) -> Option<&'a str> {
    body.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

fn set_meta(body: &mut Json, field: &str, value: Json) {
    if !body.is_object() {
        *body = Json::Object(Default::default());
    }
    if !body["metadata"].is_object() {
        body["metadata"] = Json::Object(Default::default());
    }
    body["metadata"][field] = value;
}

fn remove_meta(body: &mut Json, field: &str) {
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove(field);
    }
}

fn finalizers_empty(body: &Json) -> bool {
    body.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(|f| f.as_array())
        .map(|a| a.is_empty())
        .unwrap_or(true)
}

impl MemoryStore {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(4096);
        Self { state: Mutex::new(MemState::default()), signals }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn register(&self, info: ResourceInfo) {
        self.lock().resources.insert(info.key.clone(), info);
    }

    fn info(st: &MemState, key: &ResourceKey) -> Result<ResourceInfo, StoreError> {
        st.resources.get(key).cloned().ok_or_else(|| StoreError::NotFound(format!("resource not served: {}", key)))
    }

    fn emit(&self, st: &mut MemState, key: &ResourceKey, namespace: Option<String>, kind: EventKind, object: Json) {
        let sig = Signal::Event { key: key.clone(), namespace, event: RawEvent::new(kind, object) };
        st.history.push((st.rv, sig.clone()));
        let _ = self.signals.send(sig);
    }

    /// Store `body` under a fresh resourceVersion and announce it. Objects marked
    /// for deletion with no finalizers left are removed instead.
    fn commit(&self, st: &mut MemState, okey: ObjectKey, mut body: Json, kind: EventKind) -> Json {
        st.rv += 1;
        set_meta(&mut body, "resourceVersion", Json::String(st.rv.to_string()));
        let (key, ns, _) = okey.clone();
        if meta_str(&body, "deletionTimestamp").is_some() && finalizers_empty(&body) {
            st.objects.remove(&okey);
            self.emit(st, &key, ns, EventKind::Deleted, body.clone());
            return body;
        }
        st.objects.insert(okey, body.clone());
        self.emit(st, &key, ns, kind, body.clone());
        body
    }

    fn record(st: &mut MemState, op: &'static str, resource: &ResourceKey, name: &str, subresource: Option<&str>, body: Json) {
        st.calls.push(StoreCall { op, resource: resource.clone(), name: name.to_string(), subresource: subresource.map(|s| s.to_string()), body });
    }

    /// Create or replace an object the way an external client would.
    pub fn put(&self, resource: &ResourceKey, mut body: Json) -> Json {
        let mut st = self.lock();
        let ns = meta_str(&body, "namespace").map(|s| s.to_string());
        let name = meta_str(&body, "name").unwrap_or_default().to_string();
        let okey = (resource.clone(), ns, name);
        let existing = st.objects.get(&okey).cloned();
        let kind = match existing {
            Some(old) => {
                for f in ["uid", "creationTimestamp", "deletionTimestamp"] {
                    if let Some(v) = old.get("metadata").and_then(|m| m.get(f)) {
                        if meta_str(&body, f).is_none() {
                            set_meta(&mut body, f, v.clone());
                        }
                    }
                }
                EventKind::Modified
            }
            None => {
                if meta_str(&body, "uid").is_none() {
                    set_meta(&mut body, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
                }
                if meta_str(&body, "creationTimestamp").is_none() {
                    set_meta(&mut body, "creationTimestamp", Json::String(now_ts()));
                }
                EventKind::Added
            }
        };
        self.commit(&mut st, okey, body, kind)
    }

    /// Modify an existing object in place as an external client would.
    pub fn update(&self, resource: &ResourceKey, namespace: Option<&str>, name: &str, f: impl FnOnce(&mut Json)) -> Option<Json> {
        let mut st = self.lock();
        let okey = (resource.clone(), namespace.map(|s| s.to_string()), name.to_string());
        let mut body = st.objects.get(&okey).cloned()?;
        f(&mut body);
        Some(self.commit(&mut st, okey, body, EventKind::Modified))
    }

    /// Request deletion: marks the object when finalizers block it, removes it otherwise.
    pub fn delete(&self, resource: &ResourceKey, namespace: Option<&str>, name: &str) -> bool {
        let mut st = self.lock();
        let okey = (resource.clone(), namespace.map(|s| s.to_string()), name.to_string());
        let mut body = match st.objects.get(&okey) {
            Some(b) => b.clone(),
            None => return false,
        };
        if meta_str(&body, "deletionTimestamp").is_some() {
            return true;
        }
        set_meta(&mut body, "deletionTimestamp", Json::String(now_ts()));
        self.commit(&mut st, okey, body, EventKind::Modified);
        true
    }

    pub fn object(&self, resource: &ResourceKey, namespace: Option<&str>, name: &str) -> Option<Json> {
        self.lock().objects.get(&(resource.clone(), namespace.map(|s| s.to_string()), name.to_string())).cloned()
    }

    pub fn objects(&self, resource: &ResourceKey) -> Vec<Json> {
        self.lock().objects.iter().filter(|((k, _, _), _)| k == resource).map(|(_, v)| v.clone()).collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> { self.lock().calls.clone() }
    pub fn clear_calls(&self) { self.lock().calls.clear() }

    /// The next mutating call fails with `err`.
    pub fn fail_next(&self, err: StoreError) { self.lock().failures.push_back(err) }

    /// The next `op` call ("merge", "json", "create", ...) against `subresource` fails with `err`.
    pub fn fail_next_on(&self, op: &'static str, subresource: Option<&str>, err: StoreError) {
        self.lock().aimed.push((op, subresource.map(|s| s.to_string()), err));
    }

    /// Forget watch history: resuming from any version up to now yields `Gone`.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted = st.rv;
        st.history.clear();
    }

    /// End every open watch cleanly.
    pub fn disconnect_watches(&self) { let _ = self.signals.send(Signal::Disconnect); }

    /// Fail every open watch with `err`.
    pub fn break_watches(&self, err: StoreError) { let _ = self.signals.send(Signal::Fail(err)); }

    fn take_failure(st: &mut MemState) -> Result<(), StoreError> {
        if let Some(e) = st.failures.pop_front() {
            return Err(e);
        }
        let Some(call) = st.calls.last() else { return Ok(()) };
        let hit = st.aimed.iter().position(|(op, sub, _)| *op == call.op && *sub == call.subresource);
        match hit {
            Some(i) => Err(st.aimed.remove(i).2),
            None => Ok(()),
        }
    }

    fn lookup(st: &MemState, resource: &ResourceKey, namespace: Option<&str>, name: &str) -> Result<(ObjectKey, Json), StoreError> {
        let okey = (resource.clone(), namespace.map(|s| s.to_string()), name.to_string());
        let body = st.objects.get(&okey).cloned().ok_or_else(|| StoreError::NotFound(format!("{}/{}", resource, name)))?;
        Ok((okey, body))
    }

    /// Keep only what the target (main body or status) may change.
    fn confine(info: &ResourceInfo, old: &Json, mut new: Json, subresource: Option<&str>) -> Json {
        match subresource {
            Some("status") => {
                let mut out = old.clone();
                match new.get_mut("status").map(Json::take) {
                    Some(s) => out["status"] = s,
                    None => {
                        if let Some(o) = out.as_object_mut() {
                            o.remove("status");
                        }
                    }
                }
                out
            }
            _ if info.status_subresource => {
                match old.get("status") {
                    Some(s) => new["status"] = s.clone(),
                    None => {
                        if let Some(o) = new.as_object_mut() {
                            o.remove("status");
                        }
                    }
                }
                new
            }
            _ => new,
        }
    }

    fn finish_write(&self, st: &mut MemState, okey: ObjectKey, old: Json, mut new: Json) -> Json {
        // identity fields are server-owned
        for f in ["uid", "name", "namespace", "creationTimestamp", "deletionTimestamp", "resourceVersion"] {
            match old.get("metadata").and_then(|m| m.get(f)).cloned() {
                Some(v) => set_meta(&mut new, f, v),
                None => remove_meta(&mut new, f),
            }
        }
        if new == old {
            return old;
        }
        self.commit(st, okey, new, EventKind::Modified)
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn resolve(&self, key: &ResourceKey) -> Result<ResourceInfo, StoreError> { Self::info(&self.lock(), key) }

    async fn get(&self, resource: &ResourceInfo, namespace: Option<&str>, name: &str) -> Result<Json, StoreError> {
        Ok(Self::lookup(&self.lock(), &resource.key, namespace, name)?.1)
    }

    async fn list(&self, resource: &ResourceInfo, namespace: Option<&str>) -> Result<ObjectList, StoreError> {
        let st = self.lock();
        let items = st
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == resource.key && (namespace.is_none() || ns.as_deref() == namespace))
            .map(|(_, v)| v.clone())
            .collect();
        Ok(ObjectList { items, resource_version: st.rv.to_string() })
    }

    async fn merge_patch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        name: &str,
        patch: &Json,
        subresource: Option<&str>,
    ) -> Result<Json, StoreError> {
        let mut st = self.lock();
        Self::record(&mut st, "merge", &resource.key, name, subresource, patch.clone());
        Self::take_failure(&mut st)?;
        let (okey, old) = Self::lookup(&st, &resource.key, namespace, name)?;
        let mut new = old.clone();
        merge_values(&mut new, patch);
        let new = Self::confine(resource, &old, new, subresource);
        Ok(self.finish_write(&mut st, okey, old, new))
    }

    async fn json_patch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        name: &str,
        ops: &json_patch::Patch,
        subresource: Option<&str>,
    ) -> Result<Json, StoreError> {
        let mut st = self.lock();
        Self::record(&mut st, "json", &resource.key, name, subresource, serde_json::to_value(ops).unwrap_or(Json::Null));
        Self::take_failure(&mut st)?;
        let (okey, old) = Self::lookup(&st, &resource.key, namespace, name)?;
        for op in ops.0.iter() {
            if let json_patch::PatchOperation::Test(t) = op {
                if old.pointer(t.path.as_str()) != Some(&t.value) {
                    return Err(StoreError::Conflict(format!("test failed at {}", t.path)));
                }
            }
        }
        let mut new = old.clone();
        json_patch::patch(&mut new, ops).map_err(|e| StoreError::Api { code: 422, message: e.to_string() })?;
        let new = Self::confine(resource, &old, new, subresource);
        Ok(self.finish_write(&mut st, okey, old, new))
    }

    async fn create(&self, resource: &ResourceInfo, namespace: Option<&str>, body: &Json) -> Result<Json, StoreError> {
        let mut st = self.lock();
        let name_hint = meta_str(body, "name").unwrap_or_default().to_string();
        Self::record(&mut st, "create", &resource.key, &name_hint, None, body.clone());
        Self::take_failure(&mut st)?;
        let mut body = body.clone();
        let name = match meta_str(&body, "name") {
            Some(n) => n.to_string(),
            None => {
                let base = meta_str(&body, "generateName").unwrap_or("obj-").to_string();
                format!("{}{}", base, &uuid::Uuid::new_v4().simple().to_string()[..5])
            }
        };
        let ns = namespace.map(|s| s.to_string()).or_else(|| meta_str(&body, "namespace").map(|s| s.to_string()));
        let ns = if resource.namespaced { ns } else { None };
        let okey = (resource.key.clone(), ns.clone(), name.clone());
        if st.objects.contains_key(&okey) {
            return Err(StoreError::Conflict(format!("{} already exists", name)));
        }
        set_meta(&mut body, "name", Json::String(name));
        if let Some(ns) = ns {
            set_meta(&mut body, "namespace", Json::String(ns));
        }
        set_meta(&mut body, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut body, "creationTimestamp", Json::String(now_ts()));
        Ok(self.commit(&mut st, okey, body, EventKind::Added))
    }
}

#[async_trait]
impl WatchSource for MemoryStore {
    async fn list(&self, resource: &ResourceInfo, namespace: Option<&str>) -> Result<ObjectList, StoreError> {
        StoreClient::list(self, resource, namespace).await
    }

    async fn watch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        resource_version: &str,
        timeout: Option<Duration>,
    ) -> Result<EventStream, StoreError> {
        let st = self.lock();
        let from: u64 = if resource_version.is_empty() { st.rv } else { resource_version.parse().unwrap_or(0) };
        if from < st.compacted {
            return Err(StoreError::Gone(resource_version.to_string()));
        }
        let key = resource.key.clone();
        let ns = namespace.map(|s| s.to_string());
        let wanted = move |sig: &Signal| -> Option<Result<RawEvent, StoreError>> {
            match sig {
                Signal::Event { key: k, namespace: n, event } => {
                    (*k == key && (ns.is_none() || *n == ns)).then(|| Ok(event.clone()))
                }
                Signal::Fail(e) => Some(Err(e.clone())),
                Signal::Disconnect => None,
            }
        };
        let replay: Vec<_> = st.history.iter().filter(|(rv, _)| *rv > from).filter_map(|(_, s)| wanted(s)).collect();
        let rx = self.signals.subscribe();
        drop(st);

        let live = stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
            loop {
                match rx.recv().await {
                    Ok(Signal::Disconnect) => return None,
                    Ok(sig) => {
                        if let Some(item) = wanted(&sig) {
                            return Some((item, (rx, wanted)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((Err(StoreError::Gone("watch lagged".into())), (rx, wanted)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        let all = stream::iter(replay).chain(live);
        Ok(match timeout {
            Some(t) => all.take_until(tokio::time::sleep(t)).boxed(),
            None => all.boxed(),
        })
    }
}
