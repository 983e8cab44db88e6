//! Orka engine: turns watch events into ordered, retried handler invocations.
//!
//! Per resource, watchers feed a dispatcher, the dispatcher feeds per-object
//! workers (`queueing`), and each worker runs processing cycles (`processing`)
//! that detect the cause, run handlers with retries (`execution`), keep the
//! finalizer and background tasks (`daemons`) in line and apply one patch per
//! cycle (`applying`). `peering` freezes the whole engine while a
//! higher-priority sibling is alive.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use orka_core::{Clock, ResourceKey};
use orka_kubehub::watching::event_namespace;
use orka_kubehub::{stream_events, Cluster, RawEvent, ResourceInfo, StoreClient, StoreError, VaultError, WatchSource};
use orka_registry::Registry;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod applying;
pub mod causation;
pub mod daemons;
pub mod execution;
pub mod finalizers;
pub mod peering;
pub mod posting;
pub mod processing;
pub mod queueing;
pub mod settings;

pub use applying::apply_patch;
pub use causation::{detect_cause, Cause};
pub use daemons::Supervisor;
pub use execution::{execute_handlers_once, select_handlers, HandlerState, PassResult};
pub use peering::{decide, Decision, PeerRecord, Peering, PeeringTarget};
pub use posting::{post_event, EventLevel};
pub use processing::{Outcome, Processor};
pub use queueing::{ObjectLocks, Queue};
pub use settings::{Lifecycle, NamespaceSelector, PeeringMode, ScopeSettings, Settings, TelemetrySettings};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("credentials: {0}")]
    Vault(#[from] VaultError),
    #[error("watching {resource} failed for good: {source}")]
    Fatal {
        resource: ResourceKey,
        #[source]
        source: StoreError,
    },
}

/// Namespaces to open watchers for; `None` is one cluster-wide watcher.
fn watch_targets(resource: &ResourceInfo, scope: &ScopeSettings, selector: &NamespaceSelector) -> Vec<Option<String>> {
    if !resource.namespaced || scope.clusterwide {
        return vec![None];
    }
    match selector.exact() {
        Some(names) => names.iter().cloned().map(Some).collect(),
        None => vec![None],
    }
}

async fn dispatch(mut rx: mpsc::Receiver<RawEvent>, queue: Queue, selector: NamespaceSelector) {
    while let Some(ev) = rx.recv().await {
        if selector.matches(event_namespace(&ev.object)) {
            queue.dispatch(ev);
        } else {
            counter!("events_dropped_total", 1u64, "why" => "namespace");
        }
    }
}

/// What runs for one resource.
struct Unit {
    key: ResourceKey,
    queue: Queue,
    supervisor: Arc<Supervisor>,
    dispatcher: JoinHandle<()>,
}

pub struct Engine {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    store: Arc<dyn StoreClient>,
    source: Arc<dyn WatchSource>,
    clock: Clock,
}

impl Engine {
    pub fn new<C: Cluster + 'static>(settings: Settings, registry: Registry, cluster: Arc<C>) -> Self {
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            store: cluster.clone(),
            source: cluster,
            clock: Clock::new(),
        }
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    /// Run until `stop` fires or every watcher has failed for good.
    ///
    /// On the way out: watchers stop first, then in-flight cycles and background
    /// tasks get `exit_timeout` each, then our peer record is withdrawn. The first
    /// fatal watcher error, if any, is returned.
    pub async fn run(self, stop: CancellationToken) -> Result<(), EngineError> {
        let settings = self.settings.clone();
        let selector = NamespaceSelector::compile(&settings.scope.namespaces)
            .map_err(|e| EngineError::Config(format!("namespace pattern: {}", e)))?;
        let keys = self.registry.resources();
        if keys.is_empty() {
            return Err(EngineError::Config("no handlers registered".into()));
        }
        let mut resources = Vec::with_capacity(keys.len());
        for key in &keys {
            resources.push(self.store.resolve(key).await?);
        }

        let background = CancellationToken::new();
        let (frozen, peering_task) = match Peering::connect(self.store.clone(), &settings.peering, self.clock.clone()).await? {
            Some(peering) => {
                // Decide before the first event is looked at.
                if let Err(e) = peering.heartbeat().await {
                    warn!(error = %e, "initial peering heartbeat failed");
                }
                let frozen = peering.frozen();
                let stop = background.clone();
                (frozen, Some(tokio::spawn(async move { peering.run(stop).await })))
            }
            None => (watch::channel(false).1, None),
        };
        let (relist_tx, relist_rx) = watch::channel(0u64);
        let relist_task = tokio::spawn(peering::relist_on_resume(frozen.clone(), relist_tx));

        let pool = Arc::new(Semaphore::new(settings.execution.max_workers.max(1)));
        let watch_stop = CancellationToken::new();
        let mut units = Vec::with_capacity(resources.len());
        let mut watchers = FuturesUnordered::new();
        for resource in resources {
            let locks = ObjectLocks::default();
            let supervisor = Arc::new(Supervisor::new(
                resource.clone(),
                self.registry.clone(),
                self.store.clone(),
                settings.clone(),
                pool.clone(),
                locks.clone(),
            ));
            let processor = Arc::new(Processor::new(
                resource.clone(),
                self.registry.clone(),
                self.store.clone(),
                settings.clone(),
                self.clock.clone(),
                supervisor.clone(),
                locks,
                pool.clone(),
                frozen.clone(),
            ));
            let queue = Queue::new(processor, settings.batching.batch_window, settings.batching.idle_timeout);
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            for namespace in watch_targets(&resource, &settings.scope, &selector) {
                let key = resource.key.clone();
                let task = tokio::spawn(stream_events(
                    self.source.clone(),
                    resource.clone(),
                    namespace,
                    settings.watching.config(),
                    tx.clone(),
                    watch_stop.clone(),
                    Some(relist_rx.clone()),
                ));
                watchers.push(async move { (key, task.await) });
            }
            let dispatcher = tokio::spawn(dispatch(rx, queue.clone(), selector.clone()));
            units.push(Unit { key: resource.key.clone(), queue, supervisor, dispatcher });
        }
        info!(resources = units.len(), watchers = watchers.len(), "engine started");

        let mut failure: Option<EngineError> = None;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                next = watchers.next() => match next {
                    None => break,
                    Some((key, Ok(Ok(())))) => debug!(resource = %key, "watcher ended"),
                    Some((key, Ok(Err(StoreError::Vault(e))))) => {
                        error!(resource = %key, error = %e, "cannot authenticate; stopping");
                        failure = Some(EngineError::Vault(e));
                        break;
                    }
                    Some((key, Ok(Err(e)))) => {
                        counter!("watchers_failed_total", 1u64, "resource" => key.to_string());
                        error!(resource = %key, error = %e, "watching failed for good; the resource is no longer processed");
                        failure.get_or_insert(EngineError::Fatal { resource: key, source: e });
                    }
                    Some((key, Err(e))) => error!(resource = %key, error = %e, "watcher task died"),
                },
            }
        }

        info!("engine stopping");
        watch_stop.cancel();
        while watchers.next().await.is_some() {}
        let exit = settings.batching.exit_timeout;
        for unit in &mut units {
            if let Err(e) = (&mut unit.dispatcher).await {
                warn!(resource = %unit.key, error = %e, "dispatcher task died");
            }
        }
        join_all(units.iter().map(|u| u.queue.shutdown(exit))).await;
        if tokio::time::timeout(exit, join_all(units.iter().map(|u| u.supervisor.shutdown()))).await.is_err() {
            warn!("background tasks did not stop in time; abandoning them");
        }
        background.cancel();
        if let Some(task) = peering_task {
            let _ = task.await;
        }
        relist_task.abort();
        info!("engine stopped");
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(namespaced: bool) -> ResourceInfo {
        ResourceInfo::new(ResourceKey::new("orka.skelops.io", "v1", "widgets"), "Widget", namespaced, false)
    }

    #[test]
    fn exact_namespaces_get_their_own_watchers() {
        let scope = ScopeSettings { namespaces: vec!["a".into(), "b".into()], clusterwide: false };
        let sel = NamespaceSelector::compile(&scope.namespaces).expect("compile");
        assert_eq!(watch_targets(&info(true), &scope, &sel), vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(watch_targets(&info(false), &scope, &sel), vec![None]);

        let globbed = ScopeSettings { namespaces: vec!["team-*".into()], clusterwide: false };
        let sel = NamespaceSelector::compile(&globbed.namespaces).expect("compile");
        assert_eq!(watch_targets(&info(true), &globbed, &sel), vec![None]);

        let wide = ScopeSettings { namespaces: vec!["a".into()], clusterwide: true };
        assert_eq!(watch_targets(&info(true), &wide, &NamespaceSelector::default()), vec![None]);
    }
}
