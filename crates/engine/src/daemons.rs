//! Background tasks bound to objects: daemons (long-running, restarted on
//! failure) and timers (periodic, optionally gated on the object being idle).
//!
//! The supervisor starts and stops tasks as objects come, change and go. Stopping
//! is three-staged: set the stop flag, give the task `cancellation_backoff` to
//! exit on its own, then (only if a `cancellation_timeout` is configured) cancel
//! it and wait that long. A task still alive after that is abandoned.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use orka_core::{ObjectId, Patch, Snapshot};
use orka_kubehub::{ResourceInfo, StoreClient};
use orka_registry::{DaemonContext, DaemonHandler, PatchHandle, Registry, StopFlag, TimerContext, TimerHandler};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::applying::apply_patch;
use crate::execution::{classify, invoke, Verdict};
use crate::queueing::ObjectLocks;
use crate::settings::{BackgroundSettings, Settings};

type ExitSet = Arc<Mutex<FxHashSet<String>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// One running background task.
struct Task {
    handler: String,
    stop: StopFlag,
    join: JoinHandle<()>,
    /// Blocking callbacks cannot be cancelled, only abandoned.
    blocking: bool,
    cancellation_backoff: Option<Duration>,
    cancellation_timeout: Option<Duration>,
}

/// Everything the supervisor tracks for one object.
struct ObjectTasks {
    body: watch::Sender<Snapshot>,
    /// When the object was last seen changing; feeds timer idleness.
    touched: watch::Sender<Instant>,
    tasks: FxHashMap<String, Task>,
    /// Handlers whose task finished on its own; not restarted for this object.
    exited: ExitSet,
}

/// What background tasks need at run time.
struct Shared {
    resource: ResourceInfo,
    store: Arc<dyn StoreClient>,
    settings: Arc<Settings>,
    pool: Arc<Semaphore>,
    locks: ObjectLocks,
}

impl Shared {
    /// Apply what a task left in its patch, serialized with the object's cycles.
    async fn flush(&self, oid: &ObjectId, body: &watch::Receiver<Snapshot>, patch: Patch) {
        if patch.is_empty() {
            return;
        }
        let guard = self.locks.get(oid);
        let _held = guard.lock().await;
        let current = body.borrow().clone();
        if let Err(e) = apply_patch(self.store.as_ref(), &self.resource, &current, &patch, self.settings.patching.conflict_retries).await {
            warn!(object = %oid, error = %e, "failed to apply background task patch");
        }
    }
}

pub struct Supervisor {
    registry: Arc<Registry>,
    shared: Arc<Shared>,
    objects: Mutex<FxHashMap<ObjectId, ObjectTasks>>,
}

impl Supervisor {
    pub fn new(
        resource: ResourceInfo,
        registry: Arc<Registry>,
        store: Arc<dyn StoreClient>,
        settings: Arc<Settings>,
        pool: Arc<Semaphore>,
        locks: ObjectLocks,
    ) -> Self {
        Self {
            registry,
            shared: Arc::new(Shared { resource, store, settings, pool, locks }),
            objects: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of live tasks, across objects.
    pub fn running(&self) -> usize {
        lock(&self.objects).values().map(|o| o.tasks.values().filter(|t| !t.join.is_finished()).count()).sum()
    }

    /// Bring the object's tasks in line with its current body: start what now
    /// matches, stop what no longer does, hand the fresh body to the rest.
    pub fn adjust(&self, oid: &ObjectId, body: &Snapshot) {
        let key = &self.shared.resource.key;
        let daemons = self.registry.daemons(key);
        let timers = self.registry.timers(key);
        if (daemons.is_empty() && timers.is_empty()) || body.is_deletion_marked() {
            return;
        }
        let mut retired = Vec::new();
        {
            let mut objects = lock(&self.objects);
            let entry = objects.entry(oid.clone()).or_insert_with(|| ObjectTasks {
                body: watch::channel(body.clone()).0,
                touched: watch::channel(Instant::now()).0,
                tasks: FxHashMap::default(),
                exited: ExitSet::default(),
            });
            let changed = entry.body.borrow().resource_version() != body.resource_version();
            if changed {
                entry.body.send_replace(body.clone());
                entry.touched.send_replace(Instant::now());
            }
            entry.tasks.retain(|_, t| !t.join.is_finished());
            let exited = lock(&entry.exited).clone();

            for h in daemons.iter() {
                let wanted = h.filters.matches(body) && !exited.contains(&h.id);
                match (wanted, entry.tasks.contains_key(&h.id)) {
                    (true, false) => {
                        let task = self.spawn_daemon(oid, h.clone(), entry);
                        entry.tasks.insert(h.id.clone(), task);
                    }
                    (false, true) => retired.extend(entry.tasks.remove(&h.id)),
                    _ => {}
                }
            }
            for h in timers.iter() {
                let wanted = h.filters.matches(body) && !exited.contains(&h.id);
                match (wanted, entry.tasks.contains_key(&h.id)) {
                    (true, false) => {
                        let task = self.spawn_timer(oid, h.clone(), entry);
                        entry.tasks.insert(h.id.clone(), task);
                    }
                    (false, true) => retired.extend(entry.tasks.remove(&h.id)),
                    _ => {}
                }
            }
        }
        for task in retired {
            let defaults = self.shared.settings.background.clone();
            let oid = oid.clone();
            tokio::spawn(async move {
                debug!(object = %oid, handler = %task.handler, "stopping task no longer matching");
                terminate(task, &defaults).await;
            });
        }
    }

    /// Stop every task of the object. `true` once all of them exited; `false` if
    /// any had to be abandoned.
    pub async fn stop_object(&self, oid: &ObjectId) -> bool {
        let tasks: Vec<Task> = match lock(&self.objects).remove(oid) {
            Some(o) => o.tasks.into_values().collect(),
            None => return true,
        };
        if tasks.is_empty() {
            return true;
        }
        info!(object = %oid, count = tasks.len(), "stopping background tasks");
        let defaults = &self.shared.settings.background;
        join_all(tasks.into_iter().map(|t| terminate(t, defaults))).await.into_iter().all(|exited| exited)
    }

    /// Stop everything. Callers bound this with the exit timeout; whatever has not
    /// exited by then is abandoned with the process.
    pub async fn shutdown(&self) {
        let all: Vec<ObjectId> = lock(&self.objects).keys().cloned().collect();
        join_all(all.iter().map(|oid| self.stop_object(oid))).await;
    }

    fn spawn_daemon(&self, oid: &ObjectId, h: Arc<DaemonHandler>, entry: &ObjectTasks) -> Task {
        let stop = StopFlag::new();
        let span = tracing::info_span!("daemon", resource = %self.shared.resource.key, object = %oid, handler = %h.id);
        let join = tokio::spawn(
            run_daemon(self.shared.clone(), h.clone(), oid.clone(), stop.clone(), entry.body.subscribe(), entry.exited.clone())
                .instrument(span),
        );
        Task {
            handler: h.id.clone(),
            stop,
            join,
            blocking: h.callback.is_blocking(),
            cancellation_backoff: h.cancellation_backoff,
            cancellation_timeout: h.cancellation_timeout,
        }
    }

    fn spawn_timer(&self, oid: &ObjectId, h: Arc<TimerHandler>, entry: &ObjectTasks) -> Task {
        let stop = StopFlag::new();
        let span = tracing::info_span!("timer", resource = %self.shared.resource.key, object = %oid, handler = %h.id);
        let join = tokio::spawn(
            run_timer(
                self.shared.clone(),
                h.clone(),
                oid.clone(),
                stop.clone(),
                entry.body.subscribe(),
                entry.touched.subscribe(),
                entry.exited.clone(),
            )
            .instrument(span),
        );
        Task { handler: h.id.clone(), stop, join, blocking: h.callback.is_blocking(), cancellation_backoff: None, cancellation_timeout: None }
    }
}

/// The three-stage stop. Returns whether the task is gone.
async fn terminate(task: Task, defaults: &BackgroundSettings) -> bool {
    let Task { handler, stop, mut join, blocking, cancellation_backoff, cancellation_timeout } = task;
    stop.set();
    let backoff = cancellation_backoff.or(defaults.cancellation_backoff).unwrap_or_default();
    if tokio::time::timeout(backoff, &mut join).await.is_ok() {
        return true;
    }
    match cancellation_timeout.or(defaults.cancellation_timeout) {
        None => {
            debug!(handler = %handler, "waiting for task to exit");
            let _ = join.await;
            true
        }
        Some(limit) => {
            if !blocking {
                join.abort();
            }
            if tokio::time::timeout(limit, &mut join).await.is_ok() {
                return true;
            }
            counter!("daemons_abandoned_total", 1u64);
            warn!(handler = %handler, timeout_s = limit.as_secs_f64(), "task did not exit; abandoning it (resources may leak)");
            false
        }
    }
}

async fn run_daemon(
    shared: Arc<Shared>,
    h: Arc<DaemonHandler>,
    oid: ObjectId,
    stop: StopFlag,
    body: watch::Receiver<Snapshot>,
    exited: ExitSet,
) {
    if let Some(d) = h.initial_delay {
        if stop.sleep_or_stop(d).await {
            return;
        }
    }
    let mut retry = 0u32;
    loop {
        let ctx = DaemonContext::new(shared.resource.key.clone(), &h.id, stop.clone(), retry, body.clone());
        let handle = ctx.patch.clone();
        info!(retry, "daemon started");
        let result = invoke(&h.callback, ctx, &shared.pool).await;
        shared.flush(&oid, &body, handle.take()).await;
        if stop.is_set() {
            debug!("daemon stopped");
            return;
        }
        let (message, requested) = match classify(result, h.errors) {
            Verdict::Success(_) => {
                info!("daemon exited; it will not be restarted");
                lock(&exited).insert(h.id.clone());
                return;
            }
            Verdict::Fail(message) => {
                counter!("handler_failures_total", 1u64, "kind" => "permanent");
                error!(error = %message, "daemon failed permanently");
                lock(&exited).insert(h.id.clone());
                return;
            }
            Verdict::Ignore(message) => {
                warn!(error = %message, "daemon failed; error ignored");
                lock(&exited).insert(h.id.clone());
                return;
            }
            Verdict::Retry { message, delay } => (message, delay),
        };
        counter!("handler_failures_total", 1u64, "kind" => "temporary");
        retry += 1;
        if h.retries.map(|n| retry > n).unwrap_or(false) {
            error!(error = %message, retries = retry, "daemon exceeded its retries");
            lock(&exited).insert(h.id.clone());
            return;
        }
        let delay = requested.or(h.backoff).unwrap_or(shared.settings.handling.backoff);
        warn!(error = %message, delay_s = delay.as_secs_f64(), "daemon failed temporarily; restarting");
        if stop.sleep_or_stop(delay).await {
            return;
        }
    }
}

/// Until the next tick. Sharp timers keep a fixed grid from `anchor`.
fn next_tick(h: &TimerHandler, anchor: Instant) -> Duration {
    if !h.sharp {
        return h.interval;
    }
    let period = h.interval.as_nanos().max(1);
    let elapsed = anchor.elapsed().as_nanos();
    let next = (elapsed / period + 1) * period;
    Duration::from_nanos(u64::try_from(next - elapsed).unwrap_or(u64::MAX))
}

async fn run_timer(
    shared: Arc<Shared>,
    h: Arc<TimerHandler>,
    oid: ObjectId,
    stop: StopFlag,
    body: watch::Receiver<Snapshot>,
    touched: watch::Receiver<Instant>,
    exited: ExitSet,
) {
    if let Some(d) = h.initial_delay {
        if stop.sleep_or_stop(d).await {
            return;
        }
    }
    let anchor = Instant::now();
    loop {
        if let Some(idle) = h.idle {
            loop {
                let quiet = touched.borrow().elapsed();
                if quiet >= idle {
                    break;
                }
                if stop.sleep_or_stop(idle - quiet).await {
                    return;
                }
            }
        }
        let ctx = TimerContext {
            resource: shared.resource.key.clone(),
            handler_id: h.id.clone(),
            body: body.borrow().clone(),
            stopped: stop.clone(),
            patch: PatchHandle::new(),
        };
        let handle = ctx.patch.clone();
        counter!("timer_ticks_total", 1u64);
        let result = invoke(&h.callback, ctx, &shared.pool).await;
        shared.flush(&oid, &body, handle.take()).await;
        if stop.is_set() {
            return;
        }
        let wait = match classify(result, h.errors) {
            Verdict::Success(_) => next_tick(&h, anchor),
            Verdict::Ignore(message) => {
                warn!(error = %message, "timer failed; error ignored");
                next_tick(&h, anchor)
            }
            Verdict::Retry { message, delay } => {
                counter!("handler_failures_total", 1u64, "kind" => "temporary");
                let d = delay.or(h.backoff).unwrap_or_else(|| next_tick(&h, anchor));
                warn!(error = %message, delay_s = d.as_secs_f64(), "timer failed temporarily");
                d
            }
            Verdict::Fail(message) => {
                counter!("handler_failures_total", 1u64, "kind" => "permanent");
                error!(error = %message, "timer failed permanently; no more ticks for this object");
                lock(&exited).insert(h.id.clone());
                return;
            }
        };
        if stop.sleep_or_stop(wait).await {
            return;
        }
    }
}
