//! What handlers receive when invoked, and how they are invoked.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use orka_core::{Diff, FieldPath, HandlerResult, Patch, ResourceKey, Snapshot};
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Reason;

/// A user callback in one of two execution lanes. Async callbacks run on the
/// object's processing task; blocking ones go to the bounded worker pool.
pub enum Callback<C> {
    Async(Arc<dyn Fn(C) -> BoxFuture<'static, HandlerResult> + Send + Sync>),
    Blocking(Arc<dyn Fn(C) -> HandlerResult + Send + Sync>),
}

impl<C> Clone for Callback<C> {
    fn clone(&self) -> Self {
        match self {
            Callback::Async(f) => Callback::Async(Arc::clone(f)),
            Callback::Blocking(f) => Callback::Blocking(Arc::clone(f)),
        }
    }
}

impl<C> fmt::Debug for Callback<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if matches!(self, Callback::Blocking(_)) { "Callback::Blocking" } else { "Callback::Async" })
    }
}

impl<C: Send + 'static> Callback<C> {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Callback::Async(Arc::new(move |c| Box::pin(f(c))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(C) -> HandlerResult + Send + Sync + 'static,
    {
        Callback::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool { matches!(self, Callback::Blocking(_)) }
}

/// Shared, cycle-scoped patch. Every handler of one cycle writes into the same one.
#[derive(Clone, Default, Debug)]
pub struct PatchHandle(Arc<Mutex<Patch>>);

impl PatchHandle {
    pub fn new() -> Self { Self::default() }

    pub fn with<R>(&self, f: impl FnOnce(&mut Patch) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn merge(&self, fragment: Json) { self.with(|p| p.merge(fragment)) }
    pub fn set(&self, path: &str, value: Json) { self.with(|p| p.set(&FieldPath::parse(path), value)) }

    pub fn transform<F>(&self, f: F)
    where
        F: Fn(&mut Json) + Send + Sync + 'static,
    {
        self.with(|p| p.transform(f))
    }

    /// Take the accumulated patch, leaving an empty one behind.
    pub fn take(&self) -> Patch { self.with(std::mem::take) }
    pub fn is_empty(&self) -> bool { self.with(|p| p.is_empty()) }
}

/// Context for resource-changing handlers (create/update/delete/resume).
#[derive(Clone, Debug)]
pub struct ChangeContext {
    pub resource: ResourceKey,
    pub handler_id: String,
    pub reason: Reason,
    /// True while the object is handled for the first time after being found in
    /// the startup listing.
    pub initial: bool,
    pub body: Snapshot,
    /// Old/new essence, narrowed to the handler's field when it has one.
    pub old: Option<Json>,
    pub new: Option<Json>,
    pub diff: Diff,
    /// Number of previous attempts in this cycle (0 on first invocation).
    pub retry: u32,
    pub started: DateTime<Utc>,
    pub runtime: Duration,
    pub patch: PatchHandle,
}

/// Stop signal for a background task; set by the supervisor, observed by the task.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(CancellationToken);

impl StopFlag {
    pub fn new() -> Self { Self::default() }
    pub fn is_set(&self) -> bool { self.0.is_cancelled() }
    pub fn set(&self) { self.0.cancel() }

    /// Resolves once the flag is set.
    pub async fn wait(&self) { self.0.cancelled().await }

    /// Sleep for `d` unless stopped earlier; returns `true` if the flag was set.
    pub async fn sleep_or_stop(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.0.cancelled() => true,
            _ = tokio::time::sleep(d) => self.is_set(),
        }
    }
}

/// Context for daemons. The body accessor always returns the freshest snapshot.
#[derive(Clone, Debug)]
pub struct DaemonContext {
    pub resource: ResourceKey,
    pub handler_id: String,
    pub stopped: StopFlag,
    pub retry: u32,
    pub patch: PatchHandle,
    body: watch::Receiver<Snapshot>,
}

impl DaemonContext {
    pub fn new(resource: ResourceKey, handler_id: &str, stopped: StopFlag, retry: u32, body: watch::Receiver<Snapshot>) -> Self {
        Self { resource, handler_id: handler_id.to_string(), stopped, retry, patch: PatchHandle::new(), body }
    }

    pub fn body(&self) -> Snapshot { self.body.borrow().clone() }
}

/// Context for one timer invocation.
#[derive(Clone, Debug)]
pub struct TimerContext {
    pub resource: ResourceKey,
    pub handler_id: String,
    pub body: Snapshot,
    pub stopped: StopFlag,
    pub patch: PatchHandle,
}
