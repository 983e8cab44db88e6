//! Credential vault: a pool of connection credentials shared by all outbound calls.
//!
//! Callers draw an entry at random from the highest-priority tier. An entry that
//! got a 401 is invalidated and never comes back under the same key. When the
//! pool runs dry, callers park in `wait_ready` while the `Authenticator` re-runs
//! every login provider; if none yields anything, the vault fails and every
//! parked caller gets `VaultError::LoginFailed`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use metrics::counter;
use rand::seq::SliceRandom;
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum VaultError {
    #[error("no login provider produced credentials")]
    LoginFailed,
    #[error("vault is depleted")]
    Depleted,
}

#[derive(Debug, Clone)]
pub struct VaultEntry<C> {
    pub key: String,
    pub item: C,
    pub priority: i32,
    pub expiration: Option<Instant>,
}

impl<C> VaultEntry<C> {
    pub fn new(key: &str, item: C) -> Self { Self { key: key.to_string(), item, priority: 0, expiration: None } }
    pub fn priority(mut self, priority: i32) -> Self { self.priority = priority; self }
    pub fn expires_at(mut self, at: Instant) -> Self { self.expiration = Some(at); self }

    fn is_expired(&self, now: Instant) -> bool { self.expiration.map(|e| e <= now).unwrap_or(false) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Depleted,
    Failed,
}

struct State<C> {
    entries: Vec<VaultEntry<C>>,
    invalid: FxHashSet<String>,
}

pub struct Vault<C> {
    state: Mutex<State<C>>,
    readiness: watch::Sender<Readiness>,
}

impl<C: Clone + Send + Sync + 'static> Default for Vault<C> {
    fn default() -> Self { Self::new() }
}

impl<C: Clone + Send + Sync + 'static> Vault<C> {
    pub fn new() -> Self {
        let (readiness, _) = watch::channel(Readiness::Depleted);
        Self { state: Mutex::new(State { entries: Vec::new(), invalid: FxHashSet::default() }), readiness }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<C>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn publish(&self, st: &State<C>) {
        let next = if st.entries.is_empty() { Readiness::Depleted } else { Readiness::Ready };
        self.readiness.send_if_modified(|cur| {
            if *cur == next || (*cur == Readiness::Failed && next == Readiness::Depleted) {
                return false;
            }
            *cur = next;
            true
        });
    }

    /// Add or replace entries. Keys that were invalidated before are ignored.
    pub fn populate(&self, entries: Vec<VaultEntry<C>>) {
        let mut st = self.lock();
        for e in entries {
            if st.invalid.contains(&e.key) {
                warn!(key = %e.key, "vault: ignoring previously invalidated credentials");
                continue;
            }
            st.entries.retain(|x| x.key != e.key);
            st.entries.push(e);
        }
        self.publish(&st);
    }

    /// Mark the entry unusable (typically after a 401). It is never resurrected.
    pub fn invalidate(&self, key: &str) {
        let mut st = self.lock();
        let before = st.entries.len();
        st.entries.retain(|x| x.key != key);
        st.invalid.insert(key.to_string());
        if st.entries.len() != before {
            counter!("vault_invalidations_total", 1u64);
            warn!(key = %key, remaining = st.entries.len(), "vault: credentials invalidated");
        }
        self.publish(&st);
    }

    /// Drop entries past their expiration.
    pub fn expire(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        let before = st.entries.len();
        st.entries.retain(|x| !x.is_expired(now));
        if st.entries.len() != before {
            info!(expired = before - st.entries.len(), "vault: credentials expired");
        }
        self.publish(&st);
    }

    /// Draw one entry at random from the highest-priority valid tier.
    pub fn select(&self) -> Option<(String, C)> {
        self.expire();
        let st = self.lock();
        let top = st.entries.iter().map(|e| e.priority).max()?;
        let tier: Vec<&VaultEntry<C>> = st.entries.iter().filter(|e| e.priority == top).collect();
        tier.choose(&mut rand::thread_rng()).map(|e| (e.key.clone(), e.item.clone()))
    }

    pub fn is_empty(&self) -> bool { self.lock().entries.is_empty() }

    /// Resolve once at least one entry is available.
    pub async fn wait_ready(&self) -> Result<(), VaultError> {
        let mut rx = self.readiness.subscribe();
        let seen = rx.wait_for(|r| *r != Readiness::Depleted).await.map_err(|_| VaultError::Depleted)?;
        match *seen {
            Readiness::Failed => Err(VaultError::LoginFailed),
            _ => Ok(()),
        }
    }

    /// Resolve once the vault holds nothing usable.
    pub async fn wait_depleted(&self) {
        let mut rx = self.readiness.subscribe();
        let _ = rx.wait_for(|r| *r == Readiness::Depleted).await;
    }

    /// Select, or wait for re-authentication and select again.
    pub async fn acquire(&self) -> Result<(String, C), VaultError> {
        loop {
            if let Some(found) = self.select() {
                return Ok(found);
            }
            self.wait_ready().await?;
        }
    }

    fn fail(&self) { self.readiness.send_replace(Readiness::Failed); }
}

#[async_trait]
pub trait LoginProvider<C>: Send + Sync {
    fn name(&self) -> &str;
    async fn login(&self) -> anyhow::Result<Vec<VaultEntry<C>>>;
}

/// Re-runs every login provider whenever the vault is depleted.
pub struct Authenticator<C> {
    vault: Arc<Vault<C>>,
    providers: Vec<Arc<dyn LoginProvider<C>>>,
}

impl<C: Clone + Send + Sync + 'static> Authenticator<C> {
    pub fn new(vault: Arc<Vault<C>>) -> Self { Self { vault, providers: Vec::new() } }

    pub fn provider(mut self, p: Arc<dyn LoginProvider<C>>) -> Self {
        self.providers.push(p);
        self
    }

    /// One login round over all providers; returns the number of entries obtained.
    pub async fn login_once(&self) -> usize {
        let mut got = 0usize;
        for p in self.providers.iter() {
            match p.login().await {
                Ok(entries) => {
                    info!(provider = %p.name(), entries = entries.len(), "vault: login done");
                    got += entries.len();
                    self.vault.populate(entries);
                }
                Err(e) => warn!(provider = %p.name(), error = %e, "vault: login failed"),
            }
        }
        got
    }

    /// Keep the vault populated until `stop` fires. Errors when a login round
    /// leaves the vault empty; parked callers are released with `LoginFailed`.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), VaultError> {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = self.vault.wait_depleted() => {}
            }
            self.login_once().await;
            if self.vault.is_empty() {
                self.vault.fail();
                return Err(VaultError::LoginFailed);
            }
        }
    }
}
