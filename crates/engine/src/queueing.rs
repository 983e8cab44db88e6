//! Per-object serialization: one worker task per object, fed by the resource's
//! watch stream, processing that object's events strictly in arrival order.
//!
//! A worker coalesces bursts (only the latest body within the batch window is
//! processed), skips events older than what it already handled, re-enters its
//! object when the processor asks for a later pass, and retires after being idle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use orka_core::{ObjectId, Snapshot};
use orka_kubehub::{EventKind, RawEvent};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::processing::{Outcome, Processor};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Async locks keyed by object, shared by cycles and background task patches so
/// that no two writers patch the same object at once.
#[derive(Clone, Default)]
pub struct ObjectLocks(Arc<Mutex<FxHashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>>);

impl ObjectLocks {
    pub fn get(&self, oid: &ObjectId) -> Arc<tokio::sync::Mutex<()>> { lock(&self.0).entry(oid.clone()).or_default().clone() }

    pub fn forget(&self, oid: &ObjectId) { lock(&self.0).remove(oid); }

    pub fn len(&self) -> usize { lock(&self.0).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Numeric resourceVersion, when the store hands out numbers.
fn version(body: &serde_json::Value) -> Option<u64> {
    body.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str()).and_then(|v| v.parse().ok())
}

struct Worker {
    tx: mpsc::UnboundedSender<RawEvent>,
    join: JoinHandle<()>,
}

struct Inner {
    processor: Arc<Processor>,
    batch_window: Duration,
    idle_timeout: Duration,
    stop: CancellationToken,
    workers: Mutex<FxHashMap<ObjectId, Worker>>,
}

impl Inner {
    /// Leave the map unless an event slipped in meanwhile; that event is returned.
    fn retire(&self, oid: &ObjectId, rx: &mut mpsc::UnboundedReceiver<RawEvent>) -> Option<RawEvent> {
        let mut workers = lock(&self.workers);
        match rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(_) => {
                workers.remove(oid);
                None
            }
        }
    }
}

/// What a worker does next.
enum Input {
    Event(RawEvent),
    Rerun(Snapshot),
}

/// The per-resource set of object workers.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    pub fn new(processor: Arc<Processor>, batch_window: Duration, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                processor,
                batch_window,
                idle_timeout,
                stop: CancellationToken::new(),
                workers: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Live workers.
    pub fn len(&self) -> usize { lock(&self.inner.workers).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Route one watch event to its object's worker, starting one when needed.
    pub fn dispatch(&self, event: RawEvent) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        let oid = match ObjectId::from_body(&event.object) {
            Ok(oid) => oid,
            Err(e) => {
                counter!("events_dropped_total", 1u64, "why" => "unidentifiable");
                warn!(error = %e, "dropping event for an unidentifiable object");
                return;
            }
        };
        let mut workers = lock(&self.inner.workers);
        let event = match workers.get(&oid) {
            Some(w) => match w.tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(ev)) => ev,
            },
            None => event,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        let span = tracing::info_span!("object", object = %oid);
        let join = tokio::spawn(run_worker(self.inner.clone(), oid.clone(), rx).instrument(span));
        workers.insert(oid, Worker { tx, join });
    }

    /// Stop accepting events, let in-flight cycles finish within `exit_timeout`,
    /// then cancel whatever is left.
    pub async fn shutdown(&self, exit_timeout: Duration) {
        self.inner.stop.cancel();
        let joins: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain().map(|(_, w)| w.join).collect();
        if joins.is_empty() {
            return;
        }
        let aborts: Vec<_> = joins.iter().map(|j| j.abort_handle()).collect();
        if timeout(exit_timeout, join_all(joins)).await.is_err() {
            warn!(count = aborts.len(), "object workers did not finish in time; cancelling");
            for a in aborts {
                a.abort();
            }
        }
    }
}

/// Wait out the batch window after `first`, restarting it for every newer event;
/// the latest one wins but keeps the `initial` tag of anything it replaced.
async fn coalesce(first: RawEvent, rx: &mut mpsc::UnboundedReceiver<RawEvent>, window: Duration) -> RawEvent {
    let mut latest = first;
    let mut initial = latest.initial;
    if window.is_zero() {
        while let Ok(ev) = rx.try_recv() {
            initial |= ev.initial;
            latest = ev;
        }
        latest.initial = initial;
        return latest;
    }
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    initial |= ev.initial;
                    latest = ev;
                }
                None => break,
            },
            _ = sleep(window) => break,
        }
    }
    latest.initial = initial;
    latest
}

async fn run_worker(inner: Arc<Inner>, oid: ObjectId, mut rx: mpsc::UnboundedReceiver<RawEvent>) {
    let mut rerun: Option<(Instant, Snapshot)> = None;
    let mut handled: Option<u64> = None;
    loop {
        let input = match rerun.as_ref().map(|(at, _)| *at) {
            Some(at) => {
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Some(ev) => Input::Event(ev),
                        None => break,
                    },
                    _ = sleep_until(at) => match rerun.take() {
                        Some((_, body)) => Input::Rerun(body),
                        None => continue,
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    ev = timeout(inner.idle_timeout, rx.recv()) => match ev {
                        Ok(Some(ev)) => Input::Event(ev),
                        Ok(None) => break,
                        Err(_) => match inner.retire(&oid, &mut rx) {
                            Some(ev) => Input::Event(ev),
                            None => {
                                debug!("idle; retiring worker");
                                return;
                            }
                        },
                    },
                }
            }
        };

        let (kind, body, initial) = match input {
            Input::Rerun(body) => (EventKind::Modified, body, false),
            Input::Event(ev) => {
                let ev = coalesce(ev, &mut rx, inner.batch_window).await;
                let fresh = version(&ev.object);
                if ev.kind != EventKind::Deleted {
                    if let (Some(seen), Some(v)) = (handled, fresh) {
                        if v <= seen {
                            counter!("events_dropped_total", 1u64, "why" => "stale");
                            debug!(rv = v, handled = seen, "skipping stale event");
                            continue;
                        }
                    }
                }
                (ev.kind, Snapshot::new(ev.object), ev.initial)
            }
        };

        let Outcome { rerun: after, body: latest, frozen, gone } = inner.processor.process(&oid, kind, body, initial).await;
        if gone {
            break;
        }
        if frozen {
            // nothing was handled; whatever comes next must be looked at again
            handled = None;
            rerun = None;
            continue;
        }
        if let Some(latest) = latest {
            handled = version(latest.raw()).or(handled);
            rerun = after.map(|d| (Instant::now() + d, latest));
        } else {
            rerun = None;
        }
        if inner.stop.is_cancelled() {
            break;
        }
    }
    // A successor is only ever started once `rx` is dropped, so the entry is ours.
    lock(&inner.workers).remove(&oid);
}
