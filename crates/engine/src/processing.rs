//! One processing cycle for one object: classify the cause, keep background
//! tasks and the finalizer in line, run a pass of handlers, persist progress and
//! apply the accumulated patch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, histogram};
use orka_core::{Clock, ObjectId, Patch, Snapshot};
use orka_kubehub::{EventKind, ResourceInfo, StoreClient, StoreError};
use orka_persist::{diffbase_storage, progress_storage, DiffBaseStorage, ProgressStorage};
use orka_registry::{ChangeHandler, Reason, Registry};
use rustc_hash::FxHashSet;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::applying::apply_patch;
use crate::causation::{detect_cause, Cause};
use crate::daemons::Supervisor;
use crate::execution::{execute_handlers_once, Execution};
use crate::finalizers;
use crate::queueing::ObjectLocks;
use crate::settings::Settings;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// What a cycle asks of its worker.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Come back after this long with `body`.
    pub rerun: Option<Duration>,
    /// The freshest body known after the cycle.
    pub body: Option<Snapshot>,
    /// Nothing was handled because peering froze us.
    pub frozen: bool,
    /// The object is gone; its worker can stop.
    pub gone: bool,
}

/// Everything a resource's cycles share.
pub struct Processor {
    resource: ResourceInfo,
    registry: Arc<Registry>,
    store: Arc<dyn StoreClient>,
    settings: Arc<Settings>,
    clock: Clock,
    progress: Box<dyn ProgressStorage>,
    diffbase: Box<dyn DiffBaseStorage>,
    finalizer: String,
    supervisor: Arc<Supervisor>,
    locks: ObjectLocks,
    pool: Arc<Semaphore>,
    frozen: watch::Receiver<bool>,
    /// Listed at startup, first cycle not finished yet: resume handlers apply.
    resuming: Mutex<FxHashSet<ObjectId>>,
    /// Objects whose resume cycle has finished; it runs once per process.
    resumed: Mutex<FxHashSet<ObjectId>>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource: ResourceInfo,
        registry: Arc<Registry>,
        store: Arc<dyn StoreClient>,
        settings: Arc<Settings>,
        clock: Clock,
        supervisor: Arc<Supervisor>,
        locks: ObjectLocks,
        pool: Arc<Semaphore>,
        frozen: watch::Receiver<bool>,
    ) -> Self {
        let persistence = &settings.persistence;
        Self {
            progress: progress_storage(persistence.progress_storage, &persistence.prefix),
            diffbase: diffbase_storage(persistence.diffbase_storage, &persistence.prefix),
            finalizer: persistence.finalizer(),
            resource,
            registry,
            store,
            settings,
            clock,
            supervisor,
            locks,
            pool,
            frozen,
            resuming: Mutex::new(FxHashSet::default()),
            resumed: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn resource(&self) -> &ResourceInfo { &self.resource }

    pub fn supervisor(&self) -> &Arc<Supervisor> { &self.supervisor }

    /// Handle one event (or re-entry) for `oid`. `initial` marks an object that
    /// was already there when watching began.
    pub async fn process(&self, oid: &ObjectId, kind: EventKind, body: Snapshot, initial: bool) -> Outcome {
        if kind == EventKind::Deleted {
            self.forget(oid).await;
            return Outcome { gone: true, ..Default::default() };
        }
        // Noted before the freeze check: a frozen startup still owes the resume.
        if initial && !lock(&self.resumed).contains(oid) {
            lock(&self.resuming).insert(oid.clone());
        }
        if *self.frozen.borrow() {
            debug!("frozen; not handling");
            return Outcome { frozen: true, ..Default::default() };
        }
        // Outside the object lock: stopping tasks flush their patches under it.
        if body.is_deletion_marked() && !self.supervisor.stop_object(oid).await {
            warn!("background tasks abandoned; going on with deletion");
        }
        let guard = self.locks.get(oid);
        let _held = guard.lock().await;
        let t0 = std::time::Instant::now();
        let out = self.cycle(oid, body).await;
        histogram!("cycle_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        out
    }

    async fn forget(&self, oid: &ObjectId) {
        debug!("object deleted");
        if !self.supervisor.stop_object(oid).await {
            warn!("background tasks abandoned after deletion");
        }
        lock(&self.resuming).remove(oid);
        lock(&self.resumed).remove(oid);
        self.locks.forget(oid);
    }

    async fn cycle(&self, oid: &ObjectId, mut body: Snapshot) -> Outcome {
        let key = &self.resource.key;
        self.supervisor.adjust(oid, &body);
        let deleting = body.is_deletion_marked();
        let stealth = !self.registry.has_change_handlers(key, &body);
        let mut patch = Patch::new();

        if !deleting {
            let required = finalizers::requires(&self.registry, key, &body);
            let present = body.has_finalizer(&self.finalizer);
            if required && !present {
                info!(finalizer = %self.finalizer, "adding the finalizer");
                let mut own = Patch::new();
                finalizers::add(&body, &mut own, &self.finalizer);
                body = match self.send(&body, &own).await {
                    Ok(Some(fresh)) => fresh,
                    Ok(None) => return Outcome::default(),
                    Err(e) => return self.failed(&body, e),
                };
            } else if !required && present {
                info!(finalizer = %self.finalizer, "removing the finalizer; nothing needs it");
                finalizers::remove(&body, &mut patch, &self.finalizer);
            }
            if stealth {
                // Nothing matches, so nothing is owed: a later match is a creation.
                lock(&self.resuming).remove(oid);
                return self.conclude(oid, &body, patch, None, None).await;
            }
        }

        let initial = lock(&self.resuming).contains(oid);
        let baseline = self.diffbase.fetch(&body);
        let essence = self.diffbase.build(body.raw());
        let cause = detect_cause(baseline.as_ref(), &body, &essence, initial);
        let handlers = self.handlers_for(&cause, &body);
        counter!("cycles_total", 1u64, "reason" => cause.reported().as_str());

        if handlers.is_empty() {
            return self.conclude(oid, &body, patch, None, Some(&cause)).await;
        }
        debug!(reason = %cause.reported(), handlers = handlers.len(), "handling");
        let ex = Execution {
            resource: &self.resource,
            settings: &self.settings,
            store: self.store.as_ref(),
            clock: &self.clock,
            progress: self.progress.as_ref(),
            pool: &self.pool,
        };
        let pass = execute_handlers_once(&ex, &handlers, &cause, &body, &mut patch).await;
        if pass.done {
            info!(reason = %cause.reported(), "all handlers done");
            return self.conclude(oid, &body, patch, None, Some(&cause)).await;
        }
        self.conclude(oid, &body, patch, pass.delay, None).await
    }

    /// Change handlers for the cause, plus resume handlers for objects listed at startup.
    fn handlers_for(&self, cause: &Cause, body: &Snapshot) -> Vec<Arc<ChangeHandler>> {
        let key = &self.resource.key;
        let mut handlers = match cause.reason {
            Reason::Noop => Vec::new(),
            reason => self.registry.change_handlers(key, body, reason, &cause.diff),
        };
        if cause.initial && cause.reason != Reason::Delete {
            for h in self.registry.resume_handlers(key, body) {
                if !handlers.iter().any(|x| x.id == h.id) {
                    handlers.push(h);
                }
            }
        }
        handlers
    }

    /// The cycle is over: forget per-handler progress and record the handled
    /// state, or release the object when it is being deleted. Built against the
    /// body the handlers' own patch produced.
    fn complete(&self, body: &Snapshot, cause: &Cause) -> Patch {
        let mut patch = Patch::new();
        if cause.reason == Reason::Delete {
            finalizers::remove(body, &mut patch, &self.finalizer);
            return patch;
        }
        for id in self.registry.change_handler_ids(&self.resource.key) {
            self.progress.purge(body, &mut patch, id);
        }
        self.diffbase.store(body, &mut patch, &cause.new);
        patch
    }

    async fn send(&self, body: &Snapshot, patch: &Patch) -> Result<Option<Snapshot>, StoreError> {
        apply_patch(self.store.as_ref(), &self.resource, body, patch, self.settings.patching.conflict_retries).await
    }

    /// Apply the cycle's patch and tell the worker when to come back. A finished
    /// cycle (`done` carries its cause) is committed in a second call, so the
    /// handled state never runs ahead of what the handlers produced.
    async fn conclude(&self, oid: &ObjectId, body: &Snapshot, patch: Patch, after: Option<Duration>, done: Option<&Cause>) -> Outcome {
        let mut fresh = match self.send(body, &patch).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return Outcome::default(),
            Err(e) => return self.failed(body, e),
        };
        let mut written = !patch.is_empty();
        if let Some(cause) = done {
            let commit = self.complete(&fresh, cause);
            fresh = match self.send(&fresh, &commit).await {
                Ok(Some(committed)) => committed,
                Ok(None) => return Outcome::default(),
                Err(e) => return self.failed(&fresh, e),
            };
            written |= !commit.is_empty();
            if lock(&self.resuming).remove(oid) {
                lock(&self.resumed).insert(oid.clone());
            }
        }
        // Our own writes may have raced with foreign ones; look at the result once more.
        let released = done.is_some() && body.is_deletion_marked();
        let rerun = if !written || released { after } else { Some(Duration::ZERO) };
        Outcome { rerun, body: Some(fresh), ..Default::default() }
    }

    fn failed(&self, body: &Snapshot, e: StoreError) -> Outcome {
        let delay = self.settings.patching.error_delay;
        counter!("patch_failures_total", 1u64);
        warn!(error = %e, delay_s = delay.as_secs_f64(), "failed to apply the patch; the cycle will be retried");
        Outcome { rerun: Some(delay), body: Some(body.clone()), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use orka_core::{essence, ResourceKey};
    use orka_kubehub::MemoryStore;
    use orka_persist::{DEFAULT_PREFIX, DIFFBASE_KEY};
    use orka_registry::{Callback, ChangeContext};
    use serde_json::json;

    fn key() -> ResourceKey { ResourceKey::new("orka.skelops.io", "v1", "widgets") }

    fn widgets() -> ResourceInfo { ResourceInfo::new(key(), "Widget", true, true) }

    fn diffbase_key() -> String { format!("{}/{}", DEFAULT_PREFIX, DIFFBASE_KEY) }

    fn counting(id: &str, reason: Reason, calls: Arc<AtomicU32>) -> ChangeHandler {
        ChangeHandler::new(
            key(),
            id,
            &[reason],
            Callback::from_async(move |_ctx: ChangeContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Some(json!("done"))) }
            }),
        )
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        processor: Processor,
    }

    impl Fixture {
        fn new(registry: Registry) -> Self {
            let store = Arc::new(MemoryStore::new());
            store.register(widgets());
            let mut settings = Settings::default();
            settings.posting.enabled = false;
            let settings = Arc::new(settings);
            let registry = Arc::new(registry);
            let pool = Arc::new(Semaphore::new(2));
            let locks = ObjectLocks::default();
            let supervisor =
                Arc::new(Supervisor::new(widgets(), registry.clone(), store.clone(), settings.clone(), pool.clone(), locks.clone()));
            let processor =
                Processor::new(widgets(), registry, store.clone(), settings, Clock::new(), supervisor, locks, pool, watch::channel(false).1);
            Self { store, processor }
        }

        fn body(&self, name: &str) -> Snapshot { Snapshot::new(self.store.object(&key(), Some("ns"), name).expect("present")) }

        async fn run(&self, name: &str, initial: bool) -> Outcome {
            let body = self.body(name);
            let oid = body.id().expect("id");
            self.processor.process(&oid, EventKind::Modified, body, initial).await
        }

        /// An object some earlier run of the engine already handled.
        fn handled(&self, name: &str) {
            let body = self.store.put(&key(), json!({"metadata": {"name": name, "namespace": "ns"}, "spec": {"n": 1}}));
            let base = essence(&body, DEFAULT_PREFIX).to_string();
            self.store.update(&key(), Some("ns"), name, |b| b["metadata"]["annotations"][diffbase_key()] = json!(base));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn startup_listing_resumes_once() {
        let (made, woken) = (Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)));
        let mut reg = Registry::new();
        reg.add_change(counting("make", Reason::Create, made.clone())).expect("register");
        reg.add_change(counting("wake", Reason::Resume, woken.clone())).expect("register");
        let fx = Fixture::new(reg);
        fx.handled("w");

        let out = fx.run("w", true).await;
        assert_eq!(out.rerun, Some(Duration::ZERO));
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(made.load(Ordering::SeqCst), 0);
        assert_eq!(fx.body("w").status()["wake"], json!("done"));

        // the echo of our own writes, then a second listing of the same object
        fx.run("w", false).await;
        fx.run("w", true).await;
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn objects_created_while_watching_are_not_resumed() {
        let (made, woken) = (Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)));
        let mut reg = Registry::new();
        reg.add_change(counting("make", Reason::Create, made.clone())).expect("register");
        reg.add_change(counting("wake", Reason::Resume, woken.clone())).expect("register");
        let fx = Fixture::new(reg);
        fx.store.put(&key(), json!({"metadata": {"name": "w", "namespace": "ns"}, "spec": {"n": 1}}));

        fx.run("w", false).await;
        fx.run("w", false).await;
        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert_eq!(woken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_write_holds_back_the_handled_state() {
        let made = Arc::new(AtomicU32::new(0));
        let mut reg = Registry::new();
        reg.add_change(counting("make", Reason::Create, made.clone())).expect("register");
        let fx = Fixture::new(reg);
        fx.store.put(&key(), json!({"metadata": {"name": "w", "namespace": "ns"}, "spec": {"n": 1}}));
        fx.store.fail_next_on("merge", Some("status"), StoreError::Transport("reset".into()));

        let out = fx.run("w", false).await;
        assert_eq!(out.rerun, Some(Settings::default().patching.error_delay));
        let body = fx.body("w");
        assert_eq!(body.annotation(&diffbase_key()), None);
        assert!(body.status()["make"].is_null());

        fx.run("w", false).await;
        assert_eq!(made.load(Ordering::SeqCst), 2);
        let body = fx.body("w");
        assert_eq!(body.status()["make"], json!("done"));
        assert!(body.annotation(&diffbase_key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn handled_state_is_written_after_the_results() {
        let mut reg = Registry::new();
        reg.add_change(counting("make", Reason::Create, Arc::new(AtomicU32::new(0)))).expect("register");
        let fx = Fixture::new(reg);
        fx.store.put(&key(), json!({"metadata": {"name": "w", "namespace": "ns"}, "spec": {"n": 1}}));
        fx.store.clear_calls();

        fx.run("w", false).await;
        let calls = fx.store.calls();
        let result = calls.iter().position(|c| c.subresource.as_deref() == Some("status") && c.body["status"]["make"] == json!("done"));
        let handled = calls.iter().position(|c| !c.body["metadata"]["annotations"][diffbase_key()].is_null());
        assert!(result.expect("result written") < handled.expect("handled state written"));
    }
}
