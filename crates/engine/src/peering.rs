//! Peering: sibling engine instances announce themselves in a shared object and
//! the lower-priority ones freeze while a higher-priority one is alive.
//!
//! Records live in the peering object's `status`, keyed by identity. Each
//! instance refreshes its own record well within its declared lifetime, clears
//! records that outlived theirs, and removes its own on the way out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use orka_core::{Clock, ResourceKey};
use orka_kubehub::{ResourceInfo, StoreClient, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::settings::{PeeringMode, PeeringSettings};
use crate::EngineError;

pub const PEERING_GROUP: &str = "orka.skelops.io";

/// The peering resource: cluster-scoped or namespaced flavour.
pub fn peering_resource(clusterwide: bool) -> ResourceKey {
    ResourceKey::new(PEERING_GROUP, "v1", if clusterwide { "clusterorkapeerings" } else { "orkapeerings" })
}

/// One instance's announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub priority: i64,
    /// Seconds the record stays valid after `lastseen`.
    pub lifetime: u64,
    pub lastseen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn deadline(&self) -> DateTime<Utc> { self.lastseen + chrono::Duration::seconds(self.lifetime.min(i64::MAX as u64) as i64) }

    pub fn is_alive(&self, now: DateTime<Utc>) -> bool { now < self.deadline() }
}

/// All records found in a peering object; malformed entries are skipped.
pub fn peers_of(body: &Json) -> BTreeMap<String, PeerRecord> {
    let Some(status) = body.get("status").and_then(|s| s.as_object()) else {
        return BTreeMap::new();
    };
    status
        .iter()
        .filter(|(_, v)| !v.is_null())
        .filter_map(|(id, v)| match serde_json::from_value::<PeerRecord>(v.clone()) {
            Ok(r) => Some((id.clone(), r)),
            Err(e) => {
                debug!(peer = %id, error = %e, "skipping malformed peer record");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Active,
    /// A live peer outranks us.
    Frozen { by: String },
    /// A live peer has our priority; nobody wins a tie.
    Conflict { with: String },
}

impl Decision {
    pub fn is_frozen(&self) -> bool { !matches!(self, Decision::Active) }
}

/// Freeze when any other live peer has a priority at least ours.
pub fn decide(identity: &str, priority: i64, peers: &BTreeMap<String, PeerRecord>, now: DateTime<Utc>) -> Decision {
    let rival = peers
        .iter()
        .filter(|(id, r)| id.as_str() != identity && r.is_alive(now) && r.priority >= priority)
        .max_by_key(|(_, r)| r.priority);
    match rival {
        None => Decision::Active,
        Some((id, r)) if r.priority > priority => Decision::Frozen { by: id.clone() },
        Some((id, _)) => Decision::Conflict { with: id.clone() },
    }
}

/// Where a peering object lives.
#[derive(Debug, Clone)]
pub struct PeeringTarget {
    pub resource: ResourceInfo,
    pub namespace: Option<String>,
    pub name: String,
}

impl PeeringTarget {
    fn subresource(&self) -> Option<&'static str> { self.resource.status_subresource.then_some("status") }

    /// Resolve the peering resource and fetch the object; `None` when either is missing.
    pub async fn locate(store: &dyn StoreClient, settings: &PeeringSettings) -> Result<Option<(Self, Json)>, StoreError> {
        let resource = match store.resolve(&peering_resource(settings.clusterwide)).await {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let namespace = if settings.clusterwide { None } else { settings.namespace.clone() };
        let target = Self { resource, namespace, name: settings.name.clone() };
        match store.get(&target.resource, target.namespace.as_deref(), &target.name).await {
            Ok(body) => Ok(Some((target, body))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, store: &dyn StoreClient) -> Result<BTreeMap<String, PeerRecord>, StoreError> {
        let body = store.get(&self.resource, self.namespace.as_deref(), &self.name).await?;
        Ok(peers_of(&body))
    }

    /// Set or clear records in one write; returns the peers as stored afterwards.
    pub async fn write(
        &self,
        store: &dyn StoreClient,
        records: impl IntoIterator<Item = (String, Option<PeerRecord>)>,
    ) -> Result<BTreeMap<String, PeerRecord>, StoreError> {
        let mut status = Map::new();
        for (id, record) in records {
            let value = match record {
                Some(r) => serde_json::to_value(r).map_err(|e| StoreError::Transport(e.to_string()))?,
                None => Json::Null,
            };
            status.insert(id, value);
        }
        let patch = json!({ "status": status });
        let body = store.merge_patch(&self.resource, self.namespace.as_deref(), &self.name, &patch, self.subresource()).await?;
        Ok(peers_of(&body))
    }
}

/// This instance's side of the protocol.
pub struct Peering {
    store: Arc<dyn StoreClient>,
    target: PeeringTarget,
    identity: String,
    priority: i64,
    lifetime: Duration,
    interval: Duration,
    clock: Clock,
    frozen: watch::Sender<bool>,
}

impl Peering {
    /// Set up peering per `settings.mode`. `None` means run standalone.
    pub async fn connect(store: Arc<dyn StoreClient>, settings: &PeeringSettings, clock: Clock) -> Result<Option<Self>, EngineError> {
        if settings.mode == PeeringMode::Standalone {
            return Ok(None);
        }
        match PeeringTarget::locate(store.as_ref(), settings).await? {
            Some((target, _)) => {
                info!(peering = %target.name, identity = %settings.identity, priority = settings.priority, "peering enabled");
                Ok(Some(Self {
                    store,
                    target,
                    identity: settings.identity.clone(),
                    priority: settings.priority,
                    lifetime: settings.lifetime,
                    interval: settings.interval(),
                    clock,
                    frozen: watch::channel(false).0,
                }))
            }
            None if settings.mode == PeeringMode::Required => {
                Err(EngineError::Config(format!("peering object '{}' not found and peering is required", settings.name)))
            }
            None => {
                warn!(peering = %settings.name, "peering object not found; running standalone");
                Ok(None)
            }
        }
    }

    pub fn identity(&self) -> &str { &self.identity }

    /// Follows the freeze state; starts unfrozen until the first heartbeat says otherwise.
    pub fn frozen(&self) -> watch::Receiver<bool> { self.frozen.subscribe() }

    fn record(&self) -> PeerRecord { PeerRecord { priority: self.priority, lifetime: self.lifetime.as_secs(), lastseen: self.clock.now() } }

    /// Refresh our record, clear expired ones, and decide.
    pub async fn heartbeat(&self) -> Result<Decision, StoreError> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .target
            .read(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|(id, r)| id != &self.identity && !r.is_alive(now))
            .map(|(id, _)| id)
            .collect();
        for id in &expired {
            info!(peer = %id, "peer record expired; removing it");
        }
        let mut writes: Vec<(String, Option<PeerRecord>)> = expired.into_iter().map(|id| (id, None)).collect();
        writes.push((self.identity.clone(), Some(self.record())));
        let peers = self.target.write(self.store.as_ref(), writes).await?;
        counter!("peering_heartbeats_total", 1u64);
        let decision = decide(&self.identity, self.priority, &peers, self.clock.now());
        self.apply(&decision);
        Ok(decision)
    }

    fn apply(&self, decision: &Decision) {
        let freeze = decision.is_frozen();
        let changed = self.frozen.send_if_modified(|f| {
            let changed = *f != freeze;
            *f = freeze;
            changed
        });
        match decision {
            Decision::Conflict { with } => {
                warn!(peer = %with, priority = self.priority, "another instance has the same priority; both stay frozen")
            }
            Decision::Frozen { by } if changed => info!(peer = %by, "freezing: a higher-priority instance is alive"),
            Decision::Active if changed => info!("resuming: no higher-priority instance is alive"),
            _ => {}
        }
    }

    /// Heartbeat until `stop`, then withdraw our record.
    pub async fn run(&self, stop: CancellationToken) {
        loop {
            if let Err(e) = self.heartbeat().await {
                counter!("peering_failures_total", 1u64);
                warn!(error = %e, "peering heartbeat failed");
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        self.clear().await;
    }

    /// Remove our own record.
    pub async fn clear(&self) {
        match self.target.write(self.store.as_ref(), [(self.identity.clone(), None)]).await {
            Ok(_) => debug!(identity = %self.identity, "peer record withdrawn"),
            Err(e) => warn!(error = %e, "failed to withdraw our peer record"),
        }
    }
}

/// Bump `relist` whenever `frozen` goes from true to false, so that everything
/// skipped while frozen is looked at again.
pub async fn relist_on_resume(mut frozen: watch::Receiver<bool>, relist: watch::Sender<u64>) {
    let mut was = *frozen.borrow_and_update();
    while frozen.changed().await.is_ok() {
        let now = *frozen.borrow_and_update();
        if was && !now {
            relist.send_modify(|n| *n += 1);
        }
        was = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orka_kubehub::MemoryStore;

    fn rec(priority: i64, lastseen: DateTime<Utc>) -> PeerRecord { PeerRecord { priority, lifetime: 60, lastseen } }

    fn peers(list: &[(&str, PeerRecord)]) -> BTreeMap<String, PeerRecord> {
        list.iter().map(|(id, r)| (id.to_string(), r.clone())).collect()
    }

    #[test]
    fn decision_table() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(61);
        let cases = [
            (peers(&[("me", rec(5, now))]), Decision::Active),
            (peers(&[("me", rec(5, now)), ("low", rec(1, now))]), Decision::Active),
            (peers(&[("me", rec(5, now)), ("high", rec(10, now))]), Decision::Frozen { by: "high".into() }),
            (peers(&[("me", rec(5, now)), ("high", rec(10, old))]), Decision::Active),
            (peers(&[("me", rec(5, now)), ("twin", rec(5, now))]), Decision::Conflict { with: "twin".into() }),
            (
                peers(&[("me", rec(5, now)), ("twin", rec(5, now)), ("high", rec(10, now))]),
                Decision::Frozen { by: "high".into() },
            ),
        ];
        for (peers, expected) in cases {
            assert_eq!(decide("me", 5, &peers, now), expected, "{:?}", peers.keys().collect::<Vec<_>>());
        }
    }

    #[test]
    fn malformed_records_are_skipped() {
        let body = json!({"status": {
            "a": {"priority": 1, "lifetime": 60, "lastseen": "2024-01-01T00:00:00Z"},
            "b": "garbage",
            "c": null,
        }});
        let peers = peers_of(&body);
        assert_eq!(peers.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    fn seeded(store: &MemoryStore) -> PeeringSettings {
        let info = ResourceInfo::new(peering_resource(true), "ClusterOrkaPeering", false, false);
        store.register(info.clone());
        store.put(&info.key, json!({"metadata": {"name": "default"}}));
        PeeringSettings { identity: "me".into(), priority: 5, ..Default::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_freezes_and_clears_expired_peers() {
        let store = Arc::new(MemoryStore::new());
        let settings = seeded(&store);
        let clock = Clock::new();
        let info = ResourceInfo::new(peering_resource(true), "ClusterOrkaPeering", false, false);
        let target = PeeringTarget { resource: info.clone(), namespace: None, name: "default".into() };
        let stale = PeerRecord { priority: 100, lifetime: 10, lastseen: clock.now() - chrono::Duration::seconds(30) };
        target.write(store.as_ref(), [("ghost".to_string(), Some(stale)), ("boss".to_string(), Some(rec(10, clock.now())))]).await.expect("seed");

        let peering = Peering::connect(store.clone(), &settings, clock.clone()).await.expect("connect").expect("peering on");
        let frozen = peering.frozen();
        assert_eq!(peering.heartbeat().await.expect("beat"), Decision::Frozen { by: "boss".into() });
        assert!(*frozen.borrow());
        let stored = peers_of(&store.object(&info.key, None, "default").expect("object"));
        assert!(stored.contains_key("me"));
        assert!(!stored.contains_key("ghost"));

        target.write(store.as_ref(), [("boss".to_string(), None)]).await.expect("boss leaves");
        assert_eq!(peering.heartbeat().await.expect("beat"), Decision::Active);
        assert!(!*frozen.borrow());

        peering.clear().await;
        assert!(peers_of(&store.object(&info.key, None, "default").expect("object")).is_empty());
    }

    #[tokio::test]
    async fn missing_object_depends_on_mode() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let clock = Clock::new();
        let auto = PeeringSettings::default();
        assert!(Peering::connect(store.clone(), &auto, clock.clone()).await.expect("auto").is_none());
        let required = PeeringSettings { mode: PeeringMode::Required, ..Default::default() };
        assert!(matches!(Peering::connect(store.clone(), &required, clock.clone()).await, Err(EngineError::Config(_))));
        let standalone = PeeringSettings { mode: PeeringMode::Standalone, ..Default::default() };
        assert!(Peering::connect(store, &standalone, clock).await.expect("standalone").is_none());
    }

    #[tokio::test]
    async fn unfreezing_requests_a_relist() {
        let (frozen_tx, frozen_rx) = watch::channel(true);
        let (relist_tx, mut relist_rx) = watch::channel(0u64);
        let task = tokio::spawn(relist_on_resume(frozen_rx, relist_tx));
        frozen_tx.send_replace(false);
        relist_rx.changed().await.expect("relist");
        assert_eq!(*relist_rx.borrow(), 1);
        drop(frozen_tx);
        task.await.expect("join");
    }
}
