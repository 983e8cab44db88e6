//! Engine settings: one typed value handed to `Engine::new`.
//!
//! Defaults are usable as is. `Settings::from_env()` overlays `ORKA_*` variables on
//! top of them; the CLI maps its flags onto the same structure.

use std::net::SocketAddr;
use std::time::Duration;

use orka_kubehub::WatchConfig;
use orka_persist::{DiffBaseStorageKind, ProgressStorageKind, DEFAULT_PREFIX};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::posting::EventLevel;

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> { s.serialize_f64(d.as_secs_f64()) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(v) => Duration::try_from_secs_f64(v).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScopeSettings {
    /// Glob patterns (`*`, `?`); a leading `!` excludes. Empty means all namespaces.
    pub namespaces: Vec<String>,
    pub clusterwide: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeeringMode {
    /// No peering at all; never frozen.
    Standalone,
    /// Peer when the peering object exists, otherwise run standalone.
    #[default]
    Auto,
    /// Refuse to start without the peering object.
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeeringSettings {
    pub mode: PeeringMode,
    pub name: String,
    pub priority: i64,
    #[serde(with = "secs")]
    pub lifetime: Duration,
    pub clusterwide: bool,
    /// Namespace of the peering object when not cluster-wide.
    pub namespace: Option<String>,
    pub identity: String,
}

impl Default for PeeringSettings {
    fn default() -> Self {
        Self {
            mode: PeeringMode::default(),
            name: "default".into(),
            priority: 0,
            lifetime: Duration::from_secs(60),
            clusterwide: true,
            namespace: None,
            identity: default_identity(),
        }
    }
}

impl PeeringSettings {
    /// Refresh period: ahead of the declared lifetime so that peers never see us expire.
    pub fn interval(&self) -> Duration { self.lifetime.saturating_sub(Duration::from_secs(10)).max(Duration::from_secs(1)) }
}

fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| "orka".to_string());
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}@{}", host, &id[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchingSettings {
    #[serde(with = "opt_secs")]
    pub server_timeout: Option<Duration>,
    #[serde(with = "secs")]
    pub reconnect_backoff: Duration,
    #[serde(with = "secs")]
    pub backoff_max: Duration,
    pub max_reconnects: Option<u32>,
}

impl Default for WatchingSettings {
    fn default() -> Self {
        Self {
            server_timeout: None,
            reconnect_backoff: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            max_reconnects: None,
        }
    }
}

impl WatchingSettings {
    pub fn config(&self) -> WatchConfig {
        WatchConfig {
            server_timeout: self.server_timeout,
            reconnect_backoff: self.reconnect_backoff,
            backoff_max: self.backoff_max,
            max_reconnects: self.max_reconnects,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchingSettings {
    /// Events for one object arriving within this window are coalesced.
    #[serde(with = "secs")]
    pub batch_window: Duration,
    /// Per-object workers retire after this long without events.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Upper bound for in-flight cycles to finish on shutdown.
    #[serde(with = "secs")]
    pub exit_timeout: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(300),
            exit_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// One handler per pass, the one with the fewest retries first.
    #[default]
    Asap,
    AllAtOnce,
    /// One handler per pass, in registration order.
    OneByOne,
    /// One random handler per pass.
    Randomized,
    /// All handlers, in random order.
    Shuffled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Size of the pool running blocking callbacks.
    pub max_workers: usize,
    pub lifecycle: Lifecycle,
}

impl Default for ExecutionSettings {
    fn default() -> Self { Self { max_workers: 8, lifecycle: Lifecycle::default() } }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceSettings {
    pub prefix: String,
    /// Finalizer marker; defaults to `<prefix>/finalizer`.
    pub finalizer: Option<String>,
    pub progress_storage: ProgressStorageKind,
    pub diffbase_storage: DiffBaseStorageKind,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            finalizer: None,
            progress_storage: ProgressStorageKind::default(),
            diffbase_storage: DiffBaseStorageKind::default(),
        }
    }
}

impl PersistenceSettings {
    pub fn finalizer(&self) -> String { self.finalizer.clone().unwrap_or_else(|| format!("{}/finalizer", self.prefix)) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandlingSettings {
    /// Default retry limit for handlers that do not set one.
    pub retries: Option<u32>,
    #[serde(with = "secs")]
    pub backoff: Duration,
    #[serde(with = "opt_secs")]
    pub timeout: Option<Duration>,
}

impl Default for HandlingSettings {
    fn default() -> Self { Self { retries: None, backoff: Duration::from_secs(60), timeout: None } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackgroundSettings {
    #[serde(with = "opt_secs")]
    pub cancellation_backoff: Option<Duration>,
    #[serde(with = "opt_secs")]
    pub cancellation_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostingSettings {
    pub enabled: bool,
    pub level: EventLevel,
    pub reporting_component: String,
}

impl Default for PostingSettings {
    fn default() -> Self { Self { enabled: true, level: EventLevel::Info, reporting_component: "orka".into() } }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatchingSettings {
    /// Re-reads allowed when a transform patch hits a version conflict.
    pub conflict_retries: u32,
    /// Delay before a cycle whose patch could not be applied is retried.
    #[serde(with = "secs")]
    pub error_delay: Duration,
}

impl Default for PatchingSettings {
    fn default() -> Self { Self { conflict_retries: 5, error_delay: Duration::from_secs(1) } }
}

/// What the hosting binary sets up before the engine starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    /// `tracing_subscriber::EnvFilter` directives.
    pub log_filter: String,
    /// Where to serve Prometheus metrics; none when unset.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for TelemetrySettings {
    fn default() -> Self { Self { log_filter: "info".into(), metrics_addr: None } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub scope: ScopeSettings,
    pub peering: PeeringSettings,
    pub watching: WatchingSettings,
    pub batching: BatchingSettings,
    pub execution: ExecutionSettings,
    pub persistence: PersistenceSettings,
    pub handling: HandlingSettings,
    pub background: BackgroundSettings,
    pub posting: PostingSettings,
    pub patching: PatchingSettings,
    pub telemetry: TelemetrySettings,
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_enum<T: for<'de> Deserialize<'de>>(s: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(s.trim().to_ascii_lowercase())).ok()
}

fn secs_f64(s: &str) -> Option<Duration> { s.trim().parse::<f64>().ok().and_then(|v| Duration::try_from_secs_f64(v).ok()) }

impl Settings {
    /// Defaults overlaid with `ORKA_*` environment variables.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut s = Settings::default();
        if let Some(v) = get("ORKA_NAMESPACES") {
            s.scope.namespaces = v.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect();
        }
        if let Some(v) = get("ORKA_CLUSTERWIDE").and_then(|v| parse_bool(&v)) {
            s.scope.clusterwide = v;
        }
        if let Some(v) = get("ORKA_PEERING_MODE").and_then(|v| parse_enum(&v)) {
            s.peering.mode = v;
        }
        if let Some(v) = get("ORKA_PEERING_NAME") {
            s.peering.name = v;
        }
        if let Some(v) = get("ORKA_PEERING_NAMESPACE") {
            s.peering.namespace = Some(v);
            s.peering.clusterwide = false;
        }
        if let Some(v) = get("ORKA_PRIORITY").and_then(|v| v.trim().parse().ok()) {
            s.peering.priority = v;
        }
        if let Some(v) = get("ORKA_PEERING_LIFETIME_SECS").and_then(|v| secs_f64(&v)) {
            s.peering.lifetime = v;
        }
        if let Some(v) = get("ORKA_IDENTITY") {
            s.peering.identity = v;
        }
        if let Some(v) = get("ORKA_WATCH_TIMEOUT_SECS").and_then(|v| secs_f64(&v)) {
            s.watching.server_timeout = Some(v);
        }
        if let Some(v) = get("ORKA_RECONNECT_BACKOFF_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
            s.watching.reconnect_backoff = Duration::from_millis(v);
        }
        if let Some(v) = get("ORKA_WATCH_BACKOFF_MAX_SECS").and_then(|v| secs_f64(&v)) {
            s.watching.backoff_max = v;
        }
        if let Some(v) = get("ORKA_MAX_RECONNECTS").and_then(|v| v.trim().parse().ok()) {
            s.watching.max_reconnects = Some(v);
        }
        if let Some(v) = get("ORKA_BATCH_WINDOW_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
            s.batching.batch_window = Duration::from_millis(v);
        }
        if let Some(v) = get("ORKA_IDLE_TIMEOUT_SECS").and_then(|v| secs_f64(&v)) {
            s.batching.idle_timeout = v;
        }
        if let Some(v) = get("ORKA_EXIT_TIMEOUT_SECS").and_then(|v| secs_f64(&v)) {
            s.batching.exit_timeout = v;
        }
        if let Some(v) = get("ORKA_MAX_WORKERS").and_then(|v| v.trim().parse::<usize>().ok()) {
            s.execution.max_workers = v.max(1);
        }
        if let Some(v) = get("ORKA_LIFECYCLE").and_then(|v| parse_enum(&v.replace(['-', '_'], ""))) {
            s.execution.lifecycle = v;
        }
        if let Some(v) = get("ORKA_PREFIX") {
            s.persistence.prefix = v;
        }
        if let Some(v) = get("ORKA_FINALIZER") {
            s.persistence.finalizer = Some(v);
        }
        if let Some(v) = get("ORKA_PROGRESS_STORAGE").and_then(|v| parse_enum(&v)) {
            s.persistence.progress_storage = v;
        }
        if let Some(v) = get("ORKA_DIFFBASE_STORAGE").and_then(|v| parse_enum(&v)) {
            s.persistence.diffbase_storage = v;
        }
        if let Some(v) = get("ORKA_RETRIES").and_then(|v| v.trim().parse().ok()) {
            s.handling.retries = Some(v);
        }
        if let Some(v) = get("ORKA_BACKOFF_SECS").and_then(|v| secs_f64(&v)) {
            s.handling.backoff = v;
        }
        if let Some(v) = get("ORKA_TIMEOUT_SECS").and_then(|v| secs_f64(&v)) {
            s.handling.timeout = Some(v);
        }
        if let Some(v) = get("ORKA_CANCELLATION_BACKOFF_SECS").and_then(|v| secs_f64(&v)) {
            s.background.cancellation_backoff = Some(v);
        }
        if let Some(v) = get("ORKA_CANCELLATION_TIMEOUT_SECS").and_then(|v| secs_f64(&v)) {
            s.background.cancellation_timeout = Some(v);
        }
        if let Some(v) = get("ORKA_POSTING_ENABLED").and_then(|v| parse_bool(&v)) {
            s.posting.enabled = v;
        }
        if let Some(v) = get("ORKA_POSTING_LEVEL").and_then(|v| parse_enum(&v)) {
            s.posting.level = v;
        }
        if let Some(v) = get("ORKA_CONFLICT_RETRIES").and_then(|v| v.trim().parse().ok()) {
            s.patching.conflict_retries = v;
        }
        if let Some(v) = get("ORKA_LOG") {
            s.telemetry.log_filter = v;
        }
        if let Some(v) = get("ORKA_METRICS_ADDR").and_then(|v| v.trim().parse().ok()) {
            s.telemetry.metrics_addr = Some(v);
        }
        s
    }
}

/// Compiled namespace globs.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSelector {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    literal: Vec<String>,
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(glob.len() + 4);
    re.push('^');
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

impl NamespaceSelector {
    pub fn compile(patterns: &[String]) -> Result<Self, regex::Error> {
        let mut sel = Self::default();
        let mut all_literal = true;
        for p in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            match p.strip_prefix('!') {
                Some(ex) => {
                    all_literal = false;
                    sel.exclude.push(glob_to_regex(ex)?);
                }
                None => {
                    if p.contains(['*', '?']) {
                        all_literal = false;
                    } else {
                        sel.literal.push(p.to_string());
                    }
                    sel.include.push(glob_to_regex(p)?);
                }
            }
        }
        if !all_literal {
            sel.literal.clear();
        }
        Ok(sel)
    }

    /// Cluster-scoped objects (no namespace) always match.
    pub fn matches(&self, namespace: Option<&str>) -> bool {
        let ns = match namespace {
            Some(ns) => ns,
            None => return true,
        };
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(ns));
        included && !self.exclude.iter().any(|r| r.is_match(ns))
    }

    /// Namespaces to watch one by one, when every pattern is a plain name.
    /// `None` means watch cluster-wide and filter.
    pub fn exact(&self) -> Option<&[String]> { (!self.literal.is_empty()).then_some(self.literal.as_slice()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.peering.lifetime, Duration::from_secs(60));
        assert_eq!(s.peering.interval(), Duration::from_secs(50));
        assert_eq!(s.handling.backoff, Duration::from_secs(60));
        assert_eq!(s.patching.conflict_retries, 5);
        assert_eq!(s.persistence.finalizer(), "orka.skelops.io/finalizer");
        assert!(s.peering.identity.contains('@'));
    }

    #[test]
    fn env_overlay_parses_known_keys() {
        let env: HashMap<&str, &str> = [
            ("ORKA_NAMESPACES", "prod-*, !prod-canary"),
            ("ORKA_PEERING_MODE", "Standalone"),
            ("ORKA_PRIORITY", "100"),
            ("ORKA_BACKOFF_SECS", "2.5"),
            ("ORKA_LIFECYCLE", "all-at-once"),
            ("ORKA_PROGRESS_STORAGE", "status"),
            ("ORKA_POSTING_LEVEL", "warning"),
            ("ORKA_MAX_RECONNECTS", "not-a-number"),
            ("ORKA_LOG", "orka_engine=debug"),
            ("ORKA_METRICS_ADDR", "0.0.0.0:9100"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.scope.namespaces, vec!["prod-*", "!prod-canary"]);
        assert_eq!(s.peering.mode, PeeringMode::Standalone);
        assert_eq!(s.peering.priority, 100);
        assert_eq!(s.handling.backoff, Duration::from_millis(2500));
        assert_eq!(s.execution.lifecycle, Lifecycle::AllAtOnce);
        assert_eq!(s.persistence.progress_storage, ProgressStorageKind::Status);
        assert_eq!(s.posting.level, EventLevel::Warning);
        assert_eq!(s.watching.max_reconnects, None);
        assert_eq!(s.telemetry.log_filter, "orka_engine=debug");
        assert_eq!(s.telemetry.metrics_addr, Some(SocketAddr::from(([0, 0, 0, 0], 9100))));
    }

    #[test]
    fn unparsable_metrics_address_leaves_metrics_off() {
        let s = Settings::from_lookup(|k| (k == "ORKA_METRICS_ADDR").then(|| "localhost".to_string()));
        assert_eq!(s.telemetry.metrics_addr, None);
        assert_eq!(s.telemetry.log_filter, "info");
    }

    #[test]
    fn settings_roundtrip_through_json() {
        let mut s = Settings::default();
        s.handling.timeout = Some(Duration::from_secs(90));
        let v = serde_json::to_value(&s).expect("ser");
        assert_eq!(v["handling"]["backoff"], serde_json::json!(60.0));
        let back: Settings = serde_json::from_value(v).expect("de");
        assert_eq!(back, s);
        let partial: Settings = serde_json::from_value(serde_json::json!({"peering": {"priority": 7}})).expect("de");
        assert_eq!(partial.peering.priority, 7);
        assert_eq!(partial.peering.lifetime, Duration::from_secs(60));
    }

    #[test]
    fn namespace_globs_include_and_exclude() {
        let sel = NamespaceSelector::compile(&["prod-*".into(), "!prod-canary".into(), "stag?".into()]).expect("ok");
        assert!(sel.matches(Some("prod-eu")));
        assert!(!sel.matches(Some("prod-canary")));
        assert!(sel.matches(Some("stage")));
        assert!(!sel.matches(Some("dev")));
        assert!(sel.matches(None));
        assert!(sel.exact().is_none());

        let all = NamespaceSelector::compile(&[]).expect("ok");
        assert!(all.matches(Some("anything")));

        let plain = NamespaceSelector::compile(&["a".into(), "b.c".into()]).expect("ok");
        assert_eq!(plain.exact(), Some(&["a".to_string(), "b.c".to_string()][..]));
        assert!(!plain.matches(Some("bxc")));
    }
}
