//! Orka handler registry.
//!
//! Handlers are registered explicitly during startup and are immutable afterwards.
//! The registry answers one question per object: which handlers apply to it now.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use orka_core::{Diff, FieldPath, ResourceKey, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod context;
pub mod filters;

pub use context::{Callback, ChangeContext, DaemonContext, PatchHandle, StopFlag, TimerContext};
pub use filters::{Filters, MetaFilter};

/// Why a change-cycle runs. `Noop` never selects handlers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Create,
    Update,
    Delete,
    Resume,
    Noop,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Create => "create",
            Reason::Update => "update",
            Reason::Delete => "delete",
            Reason::Resume => "resume",
            Reason::Noop => "noop",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// How unclassified handler errors are treated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Retry after the handler's backoff.
    #[default]
    Temporary,
    /// Fail the handler for this cycle.
    Permanent,
    /// Log and treat the handler as done.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate handler id {id} for {resource}")]
    Duplicate { resource: ResourceKey, id: String },
    #[error("invalid handler {id}: {reason}")]
    Invalid { id: String, reason: String },
}

/// A resource-changing handler.
#[derive(Debug, Clone)]
pub struct ChangeHandler {
    pub id: String,
    pub resource: ResourceKey,
    /// Applicable reasons; empty means create, update and resume.
    pub reasons: Vec<Reason>,
    pub field: Option<FieldPath>,
    pub filters: Filters,
    pub errors: ErrorMode,
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub backoff: Option<Duration>,
    pub initial_delay: Option<Duration>,
    /// Deletion handlers only: do not block deletion with a finalizer.
    pub optional: bool,
    pub callback: Callback<ChangeContext>,
}

impl ChangeHandler {
    pub fn new(resource: ResourceKey, id: &str, reasons: &[Reason], callback: Callback<ChangeContext>) -> Self {
        Self {
            id: id.to_string(),
            resource,
            reasons: reasons.to_vec(),
            field: None,
            filters: Filters::default(),
            errors: ErrorMode::default(),
            retries: None,
            timeout: None,
            backoff: None,
            initial_delay: None,
            optional: false,
            callback,
        }
    }

    pub fn on_create(resource: ResourceKey, id: &str, cb: Callback<ChangeContext>) -> Self { Self::new(resource, id, &[Reason::Create], cb) }
    pub fn on_update(resource: ResourceKey, id: &str, cb: Callback<ChangeContext>) -> Self { Self::new(resource, id, &[Reason::Update], cb) }
    pub fn on_delete(resource: ResourceKey, id: &str, cb: Callback<ChangeContext>) -> Self { Self::new(resource, id, &[Reason::Delete], cb) }
    pub fn on_resume(resource: ResourceKey, id: &str, cb: Callback<ChangeContext>) -> Self { Self::new(resource, id, &[Reason::Resume], cb) }

    /// Field-scoped handler for any non-deletion change touching `field`.
    pub fn on_field(resource: ResourceKey, id: &str, field: &str, cb: Callback<ChangeContext>) -> Self {
        let mut h = Self::new(resource, id, &[], cb);
        h.field = Some(FieldPath::parse(field));
        h
    }

    pub fn field(mut self, field: &str) -> Self { self.field = Some(FieldPath::parse(field)); self }
    pub fn filters(mut self, filters: Filters) -> Self { self.filters = filters; self }
    pub fn errors(mut self, mode: ErrorMode) -> Self { self.errors = mode; self }
    pub fn retries(mut self, n: u32) -> Self { self.retries = Some(n); self }
    pub fn timeout(mut self, d: Duration) -> Self { self.timeout = Some(d); self }
    pub fn backoff(mut self, d: Duration) -> Self { self.backoff = Some(d); self }
    pub fn initial_delay(mut self, d: Duration) -> Self { self.initial_delay = Some(d); self }
    pub fn optional(mut self) -> Self { self.optional = true; self }

    pub fn applies_to(&self, reason: Reason) -> bool {
        if reason == Reason::Noop {
            return false;
        }
        if self.reasons.is_empty() {
            matches!(reason, Reason::Create | Reason::Update | Reason::Resume)
        } else {
            self.reasons.contains(&reason)
        }
    }

    pub fn is_deletion(&self) -> bool { self.reasons.contains(&Reason::Delete) }
}

/// A long-running per-object task.
#[derive(Debug, Clone)]
pub struct DaemonHandler {
    pub id: String,
    pub resource: ResourceKey,
    pub filters: Filters,
    pub initial_delay: Option<Duration>,
    /// Delay before restarting after a failed run.
    pub backoff: Option<Duration>,
    pub errors: ErrorMode,
    pub retries: Option<u32>,
    /// Grace period between the stop-flag and forced cancellation.
    pub cancellation_backoff: Option<Duration>,
    /// Time allowed after forced cancellation before the task is abandoned; `None`
    /// means never cancel forcibly and wait indefinitely.
    pub cancellation_timeout: Option<Duration>,
    pub optional: bool,
    pub callback: Callback<DaemonContext>,
}

impl DaemonHandler {
    pub fn new(resource: ResourceKey, id: &str, callback: Callback<DaemonContext>) -> Self {
        Self {
            id: id.to_string(),
            resource,
            filters: Filters::default(),
            initial_delay: None,
            backoff: None,
            errors: ErrorMode::default(),
            retries: None,
            cancellation_backoff: None,
            cancellation_timeout: None,
            optional: false,
            callback,
        }
    }

    pub fn filters(mut self, filters: Filters) -> Self { self.filters = filters; self }
    pub fn initial_delay(mut self, d: Duration) -> Self { self.initial_delay = Some(d); self }
    pub fn backoff(mut self, d: Duration) -> Self { self.backoff = Some(d); self }
    pub fn errors(mut self, mode: ErrorMode) -> Self { self.errors = mode; self }
    pub fn retries(mut self, n: u32) -> Self { self.retries = Some(n); self }
    pub fn cancellation_backoff(mut self, d: Duration) -> Self { self.cancellation_backoff = Some(d); self }
    pub fn cancellation_timeout(mut self, d: Duration) -> Self { self.cancellation_timeout = Some(d); self }
    pub fn optional(mut self) -> Self { self.optional = true; self }
}

/// A recurring per-object task. Invocations of one timer never overlap.
#[derive(Debug, Clone)]
pub struct TimerHandler {
    pub id: String,
    pub resource: ResourceKey,
    pub filters: Filters,
    pub interval: Duration,
    /// Only fire when the object has been unchanged for this long.
    pub idle: Option<Duration>,
    pub initial_delay: Option<Duration>,
    /// Align invocations to the interval grid instead of sleeping after each run.
    pub sharp: bool,
    pub errors: ErrorMode,
    pub backoff: Option<Duration>,
    pub optional: bool,
    pub callback: Callback<TimerContext>,
}

impl TimerHandler {
    pub fn new(resource: ResourceKey, id: &str, interval: Duration, callback: Callback<TimerContext>) -> Self {
        Self {
            id: id.to_string(),
            resource,
            filters: Filters::default(),
            interval,
            idle: None,
            initial_delay: None,
            sharp: false,
            errors: ErrorMode::default(),
            backoff: None,
            optional: false,
            callback,
        }
    }

    pub fn filters(mut self, filters: Filters) -> Self { self.filters = filters; self }
    pub fn idle(mut self, d: Duration) -> Self { self.idle = Some(d); self }
    pub fn initial_delay(mut self, d: Duration) -> Self { self.initial_delay = Some(d); self }
    pub fn sharp(mut self) -> Self { self.sharp = true; self }
    pub fn errors(mut self, mode: ErrorMode) -> Self { self.errors = mode; self }
    pub fn backoff(mut self, d: Duration) -> Self { self.backoff = Some(d); self }
    pub fn optional(mut self) -> Self { self.optional = true; self }
}

#[derive(Debug, Default)]
pub struct Registry {
    changes: Vec<Arc<ChangeHandler>>,
    daemons: Vec<Arc<DaemonHandler>>,
    timers: Vec<Arc<TimerHandler>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    fn ensure_unique(&self, resource: &ResourceKey, id: &str) -> Result<(), RegistryError> {
        let taken = self.changes.iter().any(|h| &h.resource == resource && h.id == id)
            || self.daemons.iter().any(|h| &h.resource == resource && h.id == id)
            || self.timers.iter().any(|h| &h.resource == resource && h.id == id);
        if taken {
            return Err(RegistryError::Duplicate { resource: resource.clone(), id: id.to_string() });
        }
        if id.is_empty() {
            return Err(RegistryError::Invalid { id: id.to_string(), reason: "empty id".into() });
        }
        Ok(())
    }

    pub fn add_change(&mut self, h: ChangeHandler) -> Result<(), RegistryError> {
        self.ensure_unique(&h.resource, &h.id)?;
        if h.optional && !h.is_deletion() {
            return Err(RegistryError::Invalid { id: h.id, reason: "only deletion handlers can be optional".into() });
        }
        debug!(resource = %h.resource, handler = %h.id, reasons = ?h.reasons, "change handler registered");
        self.changes.push(Arc::new(h));
        Ok(())
    }

    pub fn add_daemon(&mut self, h: DaemonHandler) -> Result<(), RegistryError> {
        self.ensure_unique(&h.resource, &h.id)?;
        debug!(resource = %h.resource, handler = %h.id, "daemon registered");
        self.daemons.push(Arc::new(h));
        Ok(())
    }

    pub fn add_timer(&mut self, h: TimerHandler) -> Result<(), RegistryError> {
        self.ensure_unique(&h.resource, &h.id)?;
        if h.interval.is_zero() {
            return Err(RegistryError::Invalid { id: h.id, reason: "timer interval must be positive".into() });
        }
        debug!(resource = %h.resource, handler = %h.id, interval_s = h.interval.as_secs_f64(), "timer registered");
        self.timers.push(Arc::new(h));
        Ok(())
    }

    /// Every resource with at least one handler of any kind, in registration order.
    pub fn resources(&self) -> Vec<ResourceKey> {
        let mut out: Vec<ResourceKey> = Vec::new();
        let all = self
            .changes
            .iter()
            .map(|h| &h.resource)
            .chain(self.daemons.iter().map(|h| &h.resource))
            .chain(self.timers.iter().map(|h| &h.resource));
        for r in all {
            if !out.contains(r) {
                out.push(r.clone());
            }
        }
        out
    }

    /// Handlers for this cause. Field-scoped handlers on create/update additionally
    /// require their field to be affected by `diff`.
    pub fn change_handlers(&self, resource: &ResourceKey, body: &Snapshot, reason: Reason, diff: &Diff) -> Vec<Arc<ChangeHandler>> {
        self.changes
            .iter()
            .filter(|h| &h.resource == resource && h.applies_to(reason))
            .filter(|h| match (&h.field, reason) {
                (Some(field), Reason::Create | Reason::Update) => diff.touches(field),
                _ => true,
            })
            .filter(|h| h.filters.matches(body))
            .cloned()
            .collect()
    }

    /// Resume handlers, selected in addition to the cause's own for objects found at startup.
    pub fn resume_handlers(&self, resource: &ResourceKey, body: &Snapshot) -> Vec<Arc<ChangeHandler>> {
        self.changes
            .iter()
            .filter(|h| &h.resource == resource && h.applies_to(Reason::Resume))
            .filter(|h| h.filters.matches(body))
            .cloned()
            .collect()
    }

    /// Whether any change handler of this resource matches the object at all.
    /// Objects that match none are processed without persisting a diff-base.
    pub fn has_change_handlers(&self, resource: &ResourceKey, body: &Snapshot) -> bool {
        self.changes.iter().any(|h| &h.resource == resource && h.filters.matches(body))
    }

    /// Ids of every change handler of the resource, filters not applied.
    pub fn change_handler_ids(&self, resource: &ResourceKey) -> Vec<&str> {
        self.changes.iter().filter(|h| &h.resource == resource).map(|h| h.id.as_str()).collect()
    }

    pub fn daemons(&self, resource: &ResourceKey) -> Vec<Arc<DaemonHandler>> {
        self.daemons.iter().filter(|h| &h.resource == resource).cloned().collect()
    }

    pub fn timers(&self, resource: &ResourceKey) -> Vec<Arc<TimerHandler>> {
        self.timers.iter().filter(|h| &h.resource == resource).cloned().collect()
    }

    /// A finalizer is needed when a non-optional deletion handler or background
    /// task matches the object.
    pub fn requires_finalizer(&self, resource: &ResourceKey, body: &Snapshot) -> bool {
        let deletion = self
            .changes
            .iter()
            .any(|h| &h.resource == resource && h.is_deletion() && !h.optional && h.filters.matches(body));
        let daemon = self.daemons.iter().any(|h| &h.resource == resource && !h.optional && h.filters.matches(body));
        let timer = self.timers.iter().any(|h| &h.resource == resource && !h.optional && h.filters.matches(body));
        deletion || daemon || timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orka_core::diff;
    use serde_json::json;

    fn res() -> ResourceKey { ResourceKey::new("orka.skelops.io", "v1", "widgets") }
    fn noop() -> Callback<ChangeContext> { Callback::from_async(|_ctx| async { Ok(None) }) }
    fn body(labels: serde_json::Value) -> Snapshot {
        Snapshot::new(json!({"metadata": {"name": "w", "labels": labels}, "spec": {"size": 1, "color": "red"}}))
    }

    #[test]
    fn duplicate_ids_are_rejected_per_resource() {
        let mut r = Registry::new();
        r.add_change(ChangeHandler::on_create(res(), "h", noop())).expect("first");
        assert!(matches!(r.add_change(ChangeHandler::on_update(res(), "h", noop())), Err(RegistryError::Duplicate { .. })));
        let other = ResourceKey::new("", "v1", "configmaps");
        r.add_change(ChangeHandler::on_create(other.clone(), "h", noop())).expect("other resource");
        assert_eq!(r.resources(), vec![res(), other]);
    }

    #[test]
    fn only_deletion_handlers_may_be_optional() {
        let mut r = Registry::new();
        assert!(r.add_change(ChangeHandler::on_create(res(), "c", noop()).optional()).is_err());
        assert!(r.add_change(ChangeHandler::on_delete(res(), "d", noop()).optional()).is_ok());
    }

    #[test]
    fn selection_respects_reason_field_and_filters() {
        let mut r = Registry::new();
        r.add_change(ChangeHandler::on_create(res(), "create", noop())).expect("ok");
        r.add_change(ChangeHandler::on_update(res(), "update", noop())).expect("ok");
        r.add_change(ChangeHandler::on_field(res(), "size", "spec.size", noop())).expect("ok");
        r.add_change(
            ChangeHandler::on_update(res(), "labelled", noop()).filters(Filters::new().label("app", MetaFilter::Value("x".into()))),
        )
        .expect("ok");

        let b = body(json!({"app": "y"}));
        let old = json!({"spec": {"size": 1, "color": "blue"}});
        let d = diff(Some(&old), Some(b.raw()));
        let ids: Vec<_> = r.change_handlers(&res(), &b, Reason::Update, &d).iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids, vec!["update"]);

        let old = json!({"spec": {"size": 2, "color": "red"}});
        let d = diff(Some(&old), Some(b.raw()));
        let ids: Vec<_> = r.change_handlers(&res(), &b, Reason::Update, &d).iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids, vec!["update", "size"]);

        assert!(r.change_handlers(&res(), &b, Reason::Noop, &Diff::default()).is_empty());
        assert!(r.has_change_handlers(&res(), &b));
    }

    #[test]
    fn finalizer_requirement_follows_non_optional_handlers() {
        let mut r = Registry::new();
        r.add_change(ChangeHandler::on_delete(res(), "cleanup", noop()).optional()).expect("ok");
        let b = body(json!({}));
        assert!(!r.requires_finalizer(&res(), &b));

        let cb: Callback<DaemonContext> = Callback::from_async(|_ctx| async { Ok(None) });
        r.add_daemon(DaemonHandler::new(res(), "watcher", cb).filters(Filters::new().label("watched", MetaFilter::Present)))
            .expect("ok");
        assert!(!r.requires_finalizer(&res(), &b));
        assert!(r.requires_finalizer(&res(), &body(json!({"watched": "yes"}))));
    }

    #[test]
    fn timers_need_a_positive_interval() {
        let mut r = Registry::new();
        let cb: Callback<TimerContext> = Callback::from_async(|_ctx| async { Ok(None) });
        assert!(r.add_timer(TimerHandler::new(res(), "t", Duration::ZERO, cb.clone())).is_err());
        assert!(r.add_timer(TimerHandler::new(res(), "t", Duration::from_secs(10), cb)).is_ok());
        assert_eq!(r.timers(&res()).len(), 1);
    }
}
