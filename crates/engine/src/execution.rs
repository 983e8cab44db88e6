//! Handler execution: the per-handler retry state machine and one pass over the
//! handlers selected for a cycle.
//!
//! A handler is `pending` until it succeeds or fails for good. Pending handlers
//! may be delayed (backoff or initial delay) until a wall-clock instant. Each pass
//! invokes the awake handlers the lifecycle picks, records their outcomes in the
//! cycle patch and reports when the next pass is due.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, histogram};
use orka_core::{diff_at, Clock, HandlerError, HandlerResult, Patch, Snapshot};
use orka_kubehub::{ResourceInfo, StoreClient};
use orka_persist::{ExecutionRecord, ProgressStorage};
use orka_registry::{Callback, ChangeContext, ChangeHandler, ErrorMode, PatchHandle};
use rand::seq::SliceRandom;
use serde_json::Value as Json;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::causation::Cause;
use crate::posting::{post_event, EventLevel};
use crate::settings::{HandlingSettings, Lifecycle, Settings};

fn chrono_from(d: Duration) -> chrono::Duration { chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)) }

/// Execution state of one handler within the current cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerState {
    pub record: ExecutionRecord,
}

impl HandlerState {
    /// State from a stored record; a record left by a cycle of another purpose
    /// does not count.
    pub fn from_record(record: Option<ExecutionRecord>, purpose: &str) -> Self {
        match record {
            Some(r) if r.purpose.as_deref() == Some(purpose) => Self { record: r },
            _ => Self { record: ExecutionRecord { purpose: Some(purpose.to_string()), ..Default::default() } },
        }
    }

    /// Never attempted nor scheduled in this cycle.
    pub fn is_fresh(&self) -> bool { self.record.started.is_none() }
    pub fn is_finished(&self) -> bool { self.record.is_finished() }
    pub fn retries(&self) -> u32 { self.record.retries }

    pub fn is_awake(&self, now: DateTime<Utc>) -> bool { self.record.delayed.map(|at| at <= now).unwrap_or(true) }

    /// Time left before the handler may run again (zero when awake).
    pub fn sleep(&self, clock: &Clock) -> Duration { self.record.delayed.map(|at| clock.until(at)).unwrap_or_default() }

    pub fn started(&self, now: DateTime<Utc>) -> DateTime<Utc> { self.record.started.unwrap_or(now) }

    /// Schedule the first attempt `d` from now.
    pub fn postponed(mut self, now: DateTime<Utc>, d: Duration) -> Self {
        self.record.started = Some(self.started(now));
        self.record.delayed = Some(now + chrono_from(d));
        self
    }

    pub fn succeeded(mut self, now: DateTime<Utc>) -> Self {
        self.attempted(now);
        self.record.success = true;
        self.record.delayed = None;
        self.record.message = None;
        self.record.stopped = Some(now);
        self
    }

    pub fn retried(mut self, now: DateTime<Utc>, delay: Duration, message: String) -> Self {
        self.attempted(now);
        self.record.delayed = Some(now + chrono_from(delay));
        self.record.message = Some(message);
        self
    }

    /// Terminal failure. `attempt` is false when the handler was not invoked
    /// (e.g. it timed out while waiting).
    pub fn failed(mut self, now: DateTime<Utc>, message: String, attempt: bool) -> Self {
        if attempt {
            self.attempted(now);
        } else {
            self.record.started = Some(self.started(now));
        }
        self.record.failure = true;
        self.record.delayed = None;
        self.record.message = Some(message);
        self.record.stopped = Some(now);
        self
    }

    fn attempted(&mut self, now: DateTime<Utc>) {
        self.record.started = Some(self.started(now));
        self.record.last_attempt = Some(now);
        self.record.retries += 1;
    }
}

/// A handler outcome after error-mode classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success(Option<Json>),
    Retry { message: String, delay: Option<Duration> },
    Fail(String),
    Ignore(String),
}

pub fn classify(result: HandlerResult, mode: ErrorMode) -> Verdict {
    match result {
        Ok(v) => Verdict::Success(v),
        Err(HandlerError::Temporary { message, delay }) => Verdict::Retry { message, delay },
        Err(HandlerError::Permanent(message)) => Verdict::Fail(message),
        Err(HandlerError::Other(e)) => {
            let message = format!("{:#}", e);
            match mode {
                ErrorMode::Temporary => Verdict::Retry { message, delay: None },
                ErrorMode::Permanent => Verdict::Fail(message),
                ErrorMode::Ignored => Verdict::Ignore(message),
            }
        }
    }
}

/// Run a callback in its lane: async callbacks inline, blocking ones on the
/// bounded pool. Panics become plain errors.
pub async fn invoke<C: Send + 'static>(callback: &Callback<C>, ctx: C, pool: &Arc<Semaphore>) -> HandlerResult {
    match callback {
        Callback::Async(f) => match AssertUnwindSafe(f(ctx)).catch_unwind().await {
            Ok(r) => r,
            Err(_) => Err(HandlerError::Other(anyhow!("handler panicked"))),
        },
        Callback::Blocking(f) => {
            let permit = Arc::clone(pool).acquire_owned().await.map_err(|_| anyhow!("worker pool closed"))?;
            let f = Arc::clone(f);
            match tokio::task::spawn_blocking(move || {
                let _permit = permit;
                f(ctx)
            })
            .await
            {
                Ok(r) => r,
                Err(e) => Err(HandlerError::Other(anyhow!("blocking handler failed: {}", e))),
            }
        }
    }
}

/// Indices (into `ready`) of the handlers to run in this pass. `ready` pairs each
/// awake pending handler with its retry count, in registration order.
pub fn select_handlers(lifecycle: Lifecycle, ready: &[(usize, u32)]) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    match lifecycle {
        Lifecycle::Asap => ready.iter().min_by_key(|(_, retries)| *retries).map(|(i, _)| *i).into_iter().collect(),
        Lifecycle::AllAtOnce => ready.iter().map(|(i, _)| *i).collect(),
        Lifecycle::OneByOne => ready.first().map(|(i, _)| *i).into_iter().collect(),
        Lifecycle::Randomized => ready.choose(&mut rng).map(|(i, _)| *i).into_iter().collect(),
        Lifecycle::Shuffled => {
            let mut all: Vec<usize> = ready.iter().map(|(i, _)| *i).collect();
            all.shuffle(&mut rng);
            all
        }
    }
}

/// What one pass left behind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PassResult {
    /// Every handler is terminal (succeeded, failed or ignored).
    pub done: bool,
    /// Until the earliest pending handler is due; zero when one can run now.
    pub delay: Option<Duration>,
    pub invoked: usize,
}

/// What a pass needs from its surroundings.
pub struct Execution<'a> {
    pub resource: &'a ResourceInfo,
    pub settings: &'a Settings,
    pub store: &'a dyn StoreClient,
    pub clock: &'a Clock,
    pub progress: &'a dyn ProgressStorage,
    pub pool: &'a Arc<Semaphore>,
}

fn retry_delay(h: &ChangeHandler, handling: &HandlingSettings, requested: Option<Duration>) -> Duration {
    requested.or(h.backoff).unwrap_or(handling.backoff)
}

impl Execution<'_> {
    async fn notify(&self, body: &Snapshot, level: EventLevel, reason: &str, message: &str) {
        post_event(self.store, &self.settings.posting, self.clock, self.resource, body, level, reason, message).await
    }

    fn context(&self, h: &ChangeHandler, cause: &Cause, body: &Snapshot, state: &HandlerState, now: DateTime<Utc>) -> ChangeContext {
        let (old, new, diff) = match &h.field {
            Some(field) => (
                cause.old.as_ref().and_then(|o| field.resolve(o)).cloned(),
                field.resolve(&cause.new).cloned(),
                diff_at(cause.old.as_ref(), Some(&cause.new), field),
            ),
            None => (cause.old.clone(), Some(cause.new.clone()), cause.diff.clone()),
        };
        let started = state.started(now);
        ChangeContext {
            resource: self.resource.key.clone(),
            handler_id: h.id.clone(),
            reason: cause.reported(),
            initial: cause.initial,
            body: body.clone(),
            old,
            new,
            diff,
            retry: state.retries(),
            started,
            runtime: (now - started).to_std().unwrap_or_default(),
            patch: PatchHandle::new(),
        }
    }

    /// Invoke one handler and fold its outcome into `patch`.
    async fn run_one(&self, h: &ChangeHandler, cause: &Cause, body: &Snapshot, state: HandlerState, patch: &mut Patch) -> HandlerState {
        let now = self.clock.now();
        let ctx = self.context(h, cause, body, &state, now);
        let handle = ctx.patch.clone();
        let reason = cause.reported();
        debug!(handler = %h.id, reason = %reason, retry = state.retries(), "invoking handler");
        counter!("handler_invocations_total", 1u64, "reason" => reason.as_str());
        let t0 = Instant::now();
        let result = invoke(&h.callback, ctx, self.pool).await;
        histogram!("handler_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        patch.extend(handle.take());

        let now = self.clock.now();
        let handling = &self.settings.handling;
        match classify(result, h.errors) {
            Verdict::Success(result) => {
                info!(handler = %h.id, reason = %reason, "handler succeeded");
                if let Some(v) = result {
                    patch.set_status(&h.id, v);
                }
                self.notify(body, EventLevel::Info, "Success", &format!("Handler '{}' succeeded.", h.id)).await;
                state.succeeded(now)
            }
            Verdict::Retry { message, delay } => {
                counter!("handler_failures_total", 1u64, "kind" => "temporary");
                let limit = h.retries.or(handling.retries);
                if limit.map(|n| state.retries() + 1 > n).unwrap_or(false) {
                    let message = format!("exceeded {} retries: {}", limit.unwrap_or_default(), message);
                    error!(handler = %h.id, reason = %reason, error = %message, "handler failed permanently");
                    self.notify(body, EventLevel::Error, "Failure", &format!("Handler '{}' failed permanently: {}", h.id, message))
                        .await;
                    return state.failed(now, message, true);
                }
                let delay = retry_delay(h, handling, delay);
                warn!(handler = %h.id, reason = %reason, error = %message, delay_s = delay.as_secs_f64(), "handler failed temporarily; will retry");
                self.notify(body, EventLevel::Warning, "Retrying", &format!("Handler '{}' failed temporarily: {}", h.id, message))
                    .await;
                state.retried(now, delay, message)
            }
            Verdict::Fail(message) => {
                counter!("handler_failures_total", 1u64, "kind" => "permanent");
                error!(handler = %h.id, reason = %reason, error = %message, "handler failed permanently");
                self.notify(body, EventLevel::Error, "Failure", &format!("Handler '{}' failed permanently: {}", h.id, message))
                    .await;
                state.failed(now, message, true)
            }
            Verdict::Ignore(message) => {
                counter!("handler_failures_total", 1u64, "kind" => "ignored");
                warn!(handler = %h.id, reason = %reason, error = %message, "handler failed; error ignored");
                state.failed(now, message, true)
            }
        }
    }
}

/// One pass over `handlers` for `cause`: schedule fresh delayed handlers, expire
/// timed-out ones, run what the lifecycle selects, store every changed record.
pub async fn execute_handlers_once(
    ex: &Execution<'_>,
    handlers: &[Arc<ChangeHandler>],
    cause: &Cause,
    body: &Snapshot,
    patch: &mut Patch,
) -> PassResult {
    let purpose = cause.reported();
    let now = ex.clock.now();
    let handling = &ex.settings.handling;
    let mut states: Vec<HandlerState> =
        handlers.iter().map(|h| HandlerState::from_record(ex.progress.fetch(body, &h.id), purpose.as_str())).collect();

    for (h, state) in handlers.iter().zip(states.iter_mut()) {
        if state.is_finished() {
            continue;
        }
        if state.is_fresh() {
            if let Some(d) = h.initial_delay {
                *state = std::mem::take(state).postponed(now, d);
                ex.progress.store(body, patch, &h.id, &state.record);
                continue;
            }
        }
        if let (Some(limit), Some(started)) = (h.timeout.or(handling.timeout), state.record.started) {
            if now - started > chrono_from(limit) {
                let message = format!("timed out after {:?}", limit);
                counter!("handler_failures_total", 1u64, "kind" => "timeout");
                error!(handler = %h.id, reason = %purpose, "handler timed out");
                ex.notify(body, EventLevel::Error, "Failure", &format!("Handler '{}' failed permanently: {}", h.id, message))
                    .await;
                *state = std::mem::take(state).failed(now, message, false);
                ex.progress.store(body, patch, &h.id, &state.record);
            }
        }
    }

    let ready: Vec<(usize, u32)> = states
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_finished() && s.is_awake(now))
        .map(|(i, s)| (i, s.retries()))
        .collect();
    let selected = select_handlers(ex.settings.execution.lifecycle, &ready);
    for &i in &selected {
        let h = &handlers[i];
        let next = ex.run_one(h, cause, body, std::mem::take(&mut states[i]), patch).await;
        ex.progress.store(body, patch, &h.id, &next.record);
        states[i] = next;
    }

    let pending: Vec<&HandlerState> = states.iter().filter(|s| !s.is_finished()).collect();
    PassResult {
        done: pending.is_empty(),
        delay: pending.iter().map(|s| s.sleep(ex.clock)).min(),
        invoked: selected.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use orka_core::ResourceKey;
    use orka_kubehub::MemoryStore;
    use orka_persist::{AnnotationsProgressStorage, DEFAULT_PREFIX};
    use serde_json::json;

    use crate::causation::detect_cause;

    fn key() -> ResourceKey { ResourceKey::new("orka.skelops.io", "v1", "widgets") }

    fn snapshot() -> Snapshot {
        Snapshot::new(json!({"metadata": {"name": "w", "namespace": "ns", "uid": "5b1d1e8e-1f7e-4a40-9b0a-000000000001"}, "spec": {"size": 1}}))
    }

    fn applied(body: &Snapshot, patch: &Patch) -> Snapshot {
        let mut raw = body.raw().clone();
        orka_core::merge_values(&mut raw, &patch.as_json());
        Snapshot::new(raw)
    }

    struct Fixture {
        info: ResourceInfo,
        settings: Settings,
        store: MemoryStore,
        clock: Clock,
        progress: AnnotationsProgressStorage,
        pool: Arc<Semaphore>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut settings = Settings::default();
            settings.posting.enabled = false;
            Self {
                info: ResourceInfo::new(key(), "Widget", true, false),
                settings,
                store: MemoryStore::new(),
                clock: Clock::new(),
                progress: AnnotationsProgressStorage::new(DEFAULT_PREFIX),
                pool: Arc::new(Semaphore::new(2)),
            }
        }

        fn ex(&self) -> Execution<'_> {
            Execution {
                resource: &self.info,
                settings: &self.settings,
                store: &self.store,
                clock: &self.clock,
                progress: &self.progress,
                pool: &self.pool,
            }
        }

        /// Run passes until done, sleeping for the requested delays; returns the body.
        async fn drive(&self, handlers: &[Arc<ChangeHandler>], mut body: Snapshot) -> Snapshot {
            let cause = detect_cause(None, &body, &json!({"spec": {"size": 1}}), false);
            loop {
                let mut patch = Patch::new();
                let pass = execute_handlers_once(&self.ex(), handlers, &cause, &body, &mut patch).await;
                body = applied(&body, &patch);
                if pass.done {
                    return body;
                }
                tokio::time::sleep(pass.delay.unwrap_or_default()).await;
            }
        }
    }

    fn counting(
        counter: Arc<AtomicU32>,
        outcome: impl Fn(u32) -> HandlerResult + Send + Sync + 'static,
    ) -> orka_registry::Callback<ChangeContext> {
        let outcome = Arc::new(outcome);
        orka_registry::Callback::from_async(move |ctx: ChangeContext| {
            let counter = counter.clone();
            let outcome = outcome.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                outcome(ctx.retry)
            }
        })
    }

    #[test]
    fn stale_purpose_starts_fresh() {
        let rec = ExecutionRecord { purpose: Some("update".into()), retries: 3, success: true, ..Default::default() };
        let state = HandlerState::from_record(Some(rec.clone()), "create");
        assert!(state.is_fresh());
        assert!(!state.is_finished());
        assert_eq!(HandlerState::from_record(Some(rec), "update").retries(), 3);
    }

    #[test]
    fn classification_follows_error_mode() {
        let other = || Err(HandlerError::Other(anyhow!("boom")));
        assert!(matches!(classify(other(), ErrorMode::Temporary), Verdict::Retry { delay: None, .. }));
        assert_eq!(classify(other(), ErrorMode::Permanent), Verdict::Fail("boom".into()));
        assert_eq!(classify(other(), ErrorMode::Ignored), Verdict::Ignore("boom".into()));
        assert_eq!(classify(Ok(Some(json!(1))), ErrorMode::Permanent), Verdict::Success(Some(json!(1))));
    }

    #[test]
    fn lifecycles_pick_as_documented() {
        let ready = [(0, 2), (1, 0), (2, 0)];
        assert_eq!(select_handlers(Lifecycle::Asap, &ready), vec![1]);
        assert_eq!(select_handlers(Lifecycle::OneByOne, &ready), vec![0]);
        assert_eq!(select_handlers(Lifecycle::AllAtOnce, &ready), vec![0, 1, 2]);
        assert_eq!(select_handlers(Lifecycle::Randomized, &ready).len(), 1);
        let mut shuffled = select_handlers(Lifecycle::Shuffled, &ready);
        shuffled.sort();
        assert_eq!(shuffled, vec![0, 1, 2]);
        assert!(select_handlers(Lifecycle::Asap, &[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_errors_back_off_then_succeed() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let h = Arc::new(ChangeHandler::on_create(
            key(),
            "create_fn",
            counting(calls.clone(), |retry| {
                if retry < 2 {
                    Err(HandlerError::temporary("not yet", Duration::from_secs(5)))
                } else {
                    Ok(Some(json!({"retry": retry})))
                }
            }),
        ));
        let t0 = tokio::time::Instant::now();
        let body = fx.drive(&[h], snapshot()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(t0.elapsed() >= Duration::from_secs(10));
        assert_eq!(body.status()["create_fn"], json!({"retry": 2}));
        let rec = fx.progress.fetch(&body, "create_fn").expect("record");
        assert!(rec.success);
        assert_eq!(rec.retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let h = Arc::new(ChangeHandler::on_create(key(), "p", counting(calls.clone(), |_| Err(HandlerError::permanent("bad spec")))));
        let body = fx.drive(&[h], snapshot()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let rec = fx.progress.fetch(&body, "p").expect("record");
        assert!(rec.failure);
        assert_eq!(rec.message.as_deref(), Some("bad spec"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_limit_bounds_invocations() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let h = ChangeHandler::on_create(key(), "r", counting(calls.clone(), |_| Err(HandlerError::retry("again"))))
            .retries(3)
            .backoff(Duration::from_secs(1));
        let body = fx.drive(&[Arc::new(h)], snapshot()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(fx.progress.fetch(&body, "r").expect("record").failure);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_without_invoking() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let h = ChangeHandler::on_create(key(), "t", counting(calls.clone(), |_| Err(HandlerError::retry("again"))))
            .timeout(Duration::from_secs(30))
            .backoff(Duration::from_secs(20));
        let body = fx.drive(&[Arc::new(h)], snapshot()).await;
        // attempts at 0s and 20s; at 40s the budget is gone
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let rec = fx.progress.fetch(&body, "t").expect("record");
        assert!(rec.failure);
        assert!(rec.message.unwrap_or_default().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_postpones_first_attempt() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let h = ChangeHandler::on_create(key(), "d", counting(calls.clone(), |_| Ok(None))).initial_delay(Duration::from_secs(7));
        let cause = detect_cause(None, &snapshot(), &json!({"spec": {"size": 1}}), false);
        let mut patch = Patch::new();
        let pass = execute_handlers_once(&fx.ex(), &[Arc::new(h)], &cause, &snapshot(), &mut patch).await;
        assert_eq!(pass.invoked, 0);
        assert!(!pass.done);
        assert_eq!(pass.delay, Some(Duration::from_secs(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn asap_runs_one_handler_per_pass() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicU32::new(0));
        let hs: Vec<_> = ["a", "b"]
            .iter()
            .map(|id| Arc::new(ChangeHandler::on_create(key(), id, counting(calls.clone(), |_| Ok(None)))))
            .collect();
        let cause = detect_cause(None, &snapshot(), &json!({"spec": {"size": 1}}), false);
        let mut patch = Patch::new();
        let pass = execute_handlers_once(&fx.ex(), &hs, &cause, &snapshot(), &mut patch).await;
        assert_eq!((pass.invoked, pass.done, pass.delay), (1, false, Some(Duration::ZERO)));
        let body = applied(&snapshot(), &patch);
        let mut patch = Patch::new();
        let pass = execute_handlers_once(&fx.ex(), &hs, &cause, &body, &mut patch).await;
        assert_eq!((pass.invoked, pass.done), (1, true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blocking_handlers_and_panics_are_contained() {
        let pool = Arc::new(Semaphore::new(1));
        let blocking: Callback<u32> = Callback::blocking(|n| Ok(Some(json!(n * 2))));
        assert_eq!(invoke(&blocking, 21, &pool).await.expect("ok"), Some(json!(42)));
        let panicking: Callback<u32> = Callback::from_async(|n: u32| async move {
            if n == 0 {
                panic!("nope");
            }
            Ok(None)
        });
        assert!(matches!(invoke(&panicking, 0, &pool).await, Err(HandlerError::Other(_))));
        assert_eq!(pool.available_permits(), 1);
    }
}
