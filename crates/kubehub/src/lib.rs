//! Orka kubehub: the store and watch boundary the engine talks through.
//!
//! The engine never touches `kube` directly. It sees two traits: `StoreClient`
//! (get/list/patch/create) and `WatchSource` (list + resumable watch). `KubeStore`
//! implements both against a live cluster; `memory::MemoryStore` implements both in
//! RAM for tests and local experiments.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use orka_core::ResourceKey;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod kube_store;
pub mod memory;
pub mod vault;
pub mod watching;

pub use kube_store::{ConnectionInfo, InClusterLogin, KubeStore};
pub use memory::MemoryStore;
pub use vault::{Authenticator, LoginProvider, Vault, VaultEntry, VaultError};
pub use watching::{stream_events, WatchConfig};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("gone: resource version {0} is too old")]
    Gone(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("vault: {0}")]
    Vault(#[from] VaultError),
}

impl StoreError {
    pub fn from_code(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 => StoreError::Unauthorized,
            404 => StoreError::NotFound(message),
            409 => StoreError::Conflict(message),
            410 => StoreError::Gone(message),
            _ => StoreError::Api { code, message },
        }
    }

    /// Worth retrying at the stream level (as opposed to a request the server will
    /// keep rejecting).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) | StoreError::Vault(_) | StoreError::Unauthorized => true,
            StoreError::Api { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// A served resource as the engine needs to know it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub key: ResourceKey,
    pub kind: String,
    pub namespaced: bool,
    /// Whether `status` is a separate subresource (writes to the main body ignore it).
    pub status_subresource: bool,
}

impl ResourceInfo {
    pub fn new(key: ResourceKey, kind: &str, namespaced: bool, status_subresource: bool) -> Self {
        Self { key, kind: kind.to_string(), namespaced, status_subresource }
    }

    /// `v1/events`, used for posting notifications about objects.
    pub fn events() -> Self { Self::new(ResourceKey::new("", "v1", "events"), "Event", true, false) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

/// One event as it comes off a watch connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub object: Json,
    /// Set on the items of a watcher's first listing: the object existed before watching began.
    pub initial: bool,
}

impl RawEvent {
    pub fn new(kind: EventKind, object: Json) -> Self { Self { kind, object, initial: false } }

    pub fn listed(object: Json) -> Self { Self { kind: EventKind::Added, object, initial: true } }

    pub fn resource_version(&self) -> Option<&str> {
        self.object.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str())
    }
}

/// A consistent listing and the version token to resume watching from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<Json>,
    pub resource_version: String,
}

pub type EventStream = BoxStream<'static, Result<RawEvent, StoreError>>;

#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn resolve(&self, key: &ResourceKey) -> Result<ResourceInfo, StoreError>;
    async fn get(&self, resource: &ResourceInfo, namespace: Option<&str>, name: &str) -> Result<Json, StoreError>;
    async fn list(&self, resource: &ResourceInfo, namespace: Option<&str>) -> Result<ObjectList, StoreError>;
    /// RFC 7386 merge patch; `subresource = Some("status")` targets the status subresource.
    async fn merge_patch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        name: &str,
        patch: &Json,
        subresource: Option<&str>,
    ) -> Result<Json, StoreError>;
    /// RFC 6902 patch. Preconditions travel as `test` operations; a failed test is `Conflict`.
    async fn json_patch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        name: &str,
        ops: &json_patch::Patch,
        subresource: Option<&str>,
    ) -> Result<Json, StoreError>;
    async fn create(&self, resource: &ResourceInfo, namespace: Option<&str>, body: &Json) -> Result<Json, StoreError>;
}

#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn list(&self, resource: &ResourceInfo, namespace: Option<&str>) -> Result<ObjectList, StoreError>;
    /// Open a watch from `resource_version`. A stream that ends is a clean closure;
    /// an `Err` item is a hard failure.
    async fn watch(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        resource_version: &str,
        timeout: Option<Duration>,
    ) -> Result<EventStream, StoreError>;
}

/// Both halves, as the engine consumes them.
pub trait Cluster: StoreClient + WatchSource {}
impl<T: StoreClient + WatchSource> Cluster for T {}
