//! `StoreClient` + `WatchSource` over a live cluster via kube-rs.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use orka_core::ResourceKey;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::vault::{LoginProvider, Vault, VaultEntry};
use crate::{EventKind, EventStream, ObjectList, RawEvent, ResourceInfo, StoreClient, StoreError, WatchSource};

const FIELD_MANAGER: &str = "orka";

/// One usable set of credentials: a ready client.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub client: Client,
}

/// Login from the ambient kubeconfig or in-cluster service account.
pub struct InClusterLogin;

#[async_trait]
impl LoginProvider<ConnectionInfo> for InClusterLogin {
    fn name(&self) -> &str { "kubeconfig" }

    async fn login(&self) -> anyhow::Result<Vec<VaultEntry<ConnectionInfo>>> {
        let client = Client::try_default().await?;
        Ok(vec![VaultEntry::new("default", ConnectionInfo { client })])
    }
}

fn api_resource(r: &ResourceInfo) -> ApiResource {
    ApiResource {
        group: r.key.group.clone(),
        version: r.key.version.clone(),
        api_version: r.key.api_version(),
        kind: r.kind.clone(),
        plural: r.key.plural.clone(),
    }
}

fn api(client: Client, r: &ResourceInfo, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = api_resource(r);
    match (r.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    }
}

fn map_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => StoreError::from_code(resp.code, resp.message),
        kube::Error::Auth(e) => {
            debug!(error = %e, "auth error from client");
            StoreError::Unauthorized
        }
        other => StoreError::Transport(other.to_string()),
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, StoreError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Transport(format!("serializing object: {}", e)))?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(raw)
}

pub struct KubeStore {
    vault: Arc<Vault<ConnectionInfo>>,
    resolved: Mutex<FxHashMap<ResourceKey, ResourceInfo>>,
}

impl KubeStore {
    pub fn new(vault: Arc<Vault<ConnectionInfo>>) -> Self { Self { vault, resolved: Mutex::new(FxHashMap::default()) } }

    pub fn vault(&self) -> &Arc<Vault<ConnectionInfo>> { &self.vault }

    /// Run one call with a credential drawn from the vault; a 401 invalidates that
    /// credential and the call is repeated with the next one.
    async fn with_client<T, F, Fut>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        loop {
            let (key, conn) = self.vault.acquire().await?;
            match f(conn.client).await.map_err(map_err) {
                Err(StoreError::Unauthorized) => self.vault.invalidate(&key),
                other => return other,
            }
        }
    }
}

#[async_trait]
impl StoreClient for KubeStore {
    async fn resolve(&self, key: &ResourceKey) -> Result<ResourceInfo, StoreError> {
        let cached = self.resolved.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned();
        if let Some(found) = cached {
            return Ok(found);
        }
        let discovery = self.with_client(|c| Discovery::new(c).run()).await?;
        for group in discovery.groups() {
            if group.name() != key.group {
                continue;
            }
            for (ar, caps) in group.versioned_resources(&key.version) {
                if ar.plural != key.plural {
                    continue;
                }
                let status = caps.subresources.iter().any(|(sr, _)| sr.plural == "status" || sr.plural.ends_with("/status"));
                let info = ResourceInfo::new(key.clone(), &ar.kind, matches!(caps.scope, Scope::Namespaced), status);
                info!(resource = %key, kind = %info.kind, namespaced = info.namespaced, "resource resolved");
                self.resolved.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone(), info.clone());
                return Ok(info);
            }
        }
        Err(StoreError::NotFound(format!("resource not served: {}", key)))
    }

    async fn get(&self, resource: &ResourceInfo, namespace: Option<&str>, name: &str) -> Result<Json, StoreError> {
        let obj = self.with_client(|c| {
            let a = api(c, resource, namespace);
            async move { a.get(name).await }
        })
        .await?;
        to_json(&obj)
    }

    async fn list(&self, resource: &ResourceInfo, namespace: Option<&str>) -> Result<ObjectList, StoreError> {
        let list = self.with_client(|c| {
            let a = api(c, resource, namespace);
            async move { a.list(&ListParams::default()).await }
        })
        .await?;
        let items = list.items.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectList { items, resource_version: list.metadata.resource_version.unwrap_or_default() })
    }

    async fn merge_patch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        name: &str,
        patch: &Json,
        subresource: Option<&str>,
    ) -> Result<Json, StoreError> {
        counter!("patch_calls_total", 1u64);
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let obj = self.with_client(|c| {
            let a = api(c, resource, namespace);
            let pp = pp.clone();
            async move {
                match subresource {
                    Some(sub) => a.patch_subresource(sub, name, &pp, &Patch::Merge(patch)).await,
                    None => a.patch(name, &pp, &Patch::Merge(patch)).await,
                }
            }
        })
        .await?;
        to_json(&obj)
    }

    async fn json_patch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        name: &str,
        ops: &json_patch::Patch,
        subresource: Option<&str>,
    ) -> Result<Json, StoreError> {
        counter!("patch_calls_total", 1u64);
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let res = self
            .with_client(|c| {
                let a = api(c, resource, namespace);
                let pp = pp.clone();
                let patch: Patch<()> = Patch::Json(ops.clone());
                async move {
                    match subresource {
                        Some(sub) => a.patch_subresource(sub, name, &pp, &patch).await,
                        None => a.patch(name, &pp, &patch).await,
                    }
                }
            })
            .await;
        match res {
            Ok(obj) => to_json(&obj),
            // a failed `test` operation comes back as 422
            Err(StoreError::Api { code: 422, message }) => Err(StoreError::Conflict(message)),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, resource: &ResourceInfo, namespace: Option<&str>, body: &Json) -> Result<Json, StoreError> {
        let obj: DynamicObject =
            serde_json::from_value(body.clone()).map_err(|e| StoreError::Api { code: 400, message: e.to_string() })?;
        let created = self.with_client(|c| {
            let a = api(c, resource, namespace);
            let obj = obj.clone();
            async move { a.create(&PostParams::default(), &obj).await }
        })
        .await?;
        to_json(&created)
    }
}

#[async_trait]
impl WatchSource for KubeStore {
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
        let mut wp = WatchParams::default();
        if let Some(t) = timeout {
            // the API server caps watch timeouts below 295s
            wp = wp.timeout(t.as_secs().clamp(1, 290) as u32);
        }
        loop {
            let (key, conn) = self.vault.acquire().await?;
            let a = api(conn.client, resource, namespace);
            match a.watch(&wp, resource_version).await.map_err(map_err) {
                Err(StoreError::Unauthorized) => {
                    self.vault.invalidate(&key);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(stream) => {
                    let vault = self.vault.clone();
                    let mapped = stream.map_err(map_err).map(move |item| {
                        item.and_then(convert).map_err(|e| {
                            if matches!(e, StoreError::Unauthorized) {
                                vault.invalidate(&key);
                            }
                            e
                        })
                    });
                    return Ok(mapped.boxed());
                }
            }
        }
    }
}

fn convert(ev: WatchEvent<DynamicObject>) -> Result<RawEvent, StoreError> {
    match ev {
        WatchEvent::Added(o) => Ok(RawEvent::new(EventKind::Added, to_json(&o)?)),
        WatchEvent::Modified(o) => Ok(RawEvent::new(EventKind::Modified, to_json(&o)?)),
        WatchEvent::Deleted(o) => Ok(RawEvent::new(EventKind::Deleted, to_json(&o)?)),
        WatchEvent::Bookmark(b) => Ok(RawEvent::new(
            EventKind::Bookmark,
            serde_json::json!({"metadata": {"resourceVersion": b.metadata.resource_version}}),
        )),
        WatchEvent::Error(resp) => Err(StoreError::from_code(resp.code, resp.message)),
    }
}
