//! Resumable list+watch loop for one resource (optionally one namespace).
//!
//! list → watch from the list's version; bookmarks and events advance the resume
//! token; a clean closure re-watches at once; `Gone` forces a fresh listing; hard
//! failures back off exponentially (capped) before resubscribing. A tick on the
//! `relist` channel restarts with a fresh listing as well.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EventKind, RawEvent, ResourceInfo, StoreError, VaultError, WatchSource};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Server-side timeout for one watch connection.
    pub server_timeout: Option<Duration>,
    /// First delay after a hard failure; doubles per consecutive failure.
    pub reconnect_backoff: Duration,
    pub backoff_max: Duration,
    /// Consecutive hard failures tolerated before giving up; `None` = forever.
    pub max_reconnects: Option<u32>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            server_timeout: None,
            reconnect_backoff: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            max_reconnects: None,
        }
    }
}

impl WatchConfig {
    fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.reconnect_backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

enum Outcome {
    Stop,
    Relist,
    Rewatch,
}

async fn relist_requested(rx: &mut Option<watch::Receiver<u64>>) {
    if let Some(r) = rx.as_mut() {
        if r.changed().await.is_ok() {
            return;
        }
    }
    *rx = None;
    futures::future::pending::<()>().await
}

struct Backoff<'a> {
    cfg: &'a WatchConfig,
    failures: u32,
}

impl Backoff<'_> {
    /// Sleep before the next attempt; `Err` once the failure budget is spent.
    async fn wait(&mut self, err: StoreError, resource: &ResourceInfo, stop: &CancellationToken) -> Result<bool, StoreError> {
        if matches!(err, StoreError::Vault(VaultError::LoginFailed)) {
            return Err(err);
        }
        self.failures += 1;
        counter!("watch_reconnects_total", 1u64);
        if let Some(max) = self.cfg.max_reconnects {
            if self.failures > max {
                return Err(err);
            }
        }
        let delay = self.cfg.delay(self.failures);
        warn!(resource = %resource.key, error = %err, failures = self.failures, delay_ms = delay.as_millis() as u64, "watch failed; backing off");
        tokio::select! {
            _ = stop.cancelled() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }

    fn reset(&mut self) { self.failures = 0 }
}

/// Feed every object event of `resource` into `tx` until `stop` fires, the receiver
/// goes away, or hard failures exceed `max_reconnects`.
pub async fn stream_events(
    source: Arc<dyn WatchSource>,
    resource: ResourceInfo,
    namespace: Option<String>,
    cfg: WatchConfig,
    tx: mpsc::Sender<RawEvent>,
    stop: CancellationToken,
    mut relist: Option<watch::Receiver<u64>>,
) -> Result<(), StoreError> {
    let ns = namespace.as_deref();
    let mut backoff = Backoff { cfg: &cfg, failures: 0 };
    let mut initial = true;
    info!(resource = %resource.key, ns = ?ns, "watcher started");
    'listing: loop {
        if stop.is_cancelled() {
            break;
        }
        let listed = tokio::select! {
            _ = stop.cancelled() => break,
            r = source.list(&resource, ns) => r,
        };
        let listing = match listed {
            Ok(l) => l,
            Err(e) => {
                if !backoff.wait(e, &resource, &stop).await? {
                    break;
                }
                continue;
            }
        };
        backoff.reset();
        debug!(resource = %resource.key, count = listing.items.len(), rv = %listing.resource_version, "listed");
        for item in listing.items {
            let ev = if initial { RawEvent::listed(item) } else { RawEvent::new(EventKind::Added, item) };
            if tx.send(ev).await.is_err() {
                break 'listing;
            }
        }
        initial = false;
        let mut rv = listing.resource_version;

        loop {
            let opened = tokio::select! {
                _ = stop.cancelled() => break 'listing,
                _ = relist_requested(&mut relist) => continue 'listing,
                r = source.watch(&resource, ns, &rv, cfg.server_timeout) => r,
            };
            let mut events = match opened {
                Ok(s) => s,
                Err(StoreError::Gone(_)) => {
                    info!(resource = %resource.key, rv = %rv, "resource version expired; relisting");
                    counter!("watch_reconnects_total", 1u64);
                    continue 'listing;
                }
                Err(e) => {
                    if !backoff.wait(e, &resource, &stop).await? {
                        break 'listing;
                    }
                    continue;
                }
            };
            let outcome = loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break Outcome::Stop,
                    _ = relist_requested(&mut relist) => break Outcome::Relist,
                    n = events.next() => n,
                };
                match next {
                    None => break Outcome::Rewatch,
                    Some(Ok(ev)) => {
                        backoff.reset();
                        if let Some(v) = ev.resource_version() {
                            rv = v.to_string();
                        }
                        if ev.kind == EventKind::Bookmark {
                            continue;
                        }
                        if tx.send(ev).await.is_err() {
                            break Outcome::Stop;
                        }
                    }
                    Some(Err(StoreError::Gone(_))) => {
                        info!(resource = %resource.key, rv = %rv, "watch expired; relisting");
                        break Outcome::Relist;
                    }
                    Some(Err(e)) => {
                        if !backoff.wait(e, &resource, &stop).await? {
                            break Outcome::Stop;
                        }
                        break Outcome::Rewatch;
                    }
                }
            };
            match outcome {
                Outcome::Stop => break 'listing,
                Outcome::Relist => continue 'listing,
                Outcome::Rewatch => debug!(resource = %resource.key, rv = %rv, "watch closed; resuming"),
            }
        }
    }
    info!(resource = %resource.key, ns = ?ns, "watcher stopped");
    Ok(())
}

/// Object namespace as a watch event carries it.
pub fn event_namespace(object: &Json) -> Option<&str> {
    object.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str())
}
