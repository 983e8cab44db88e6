use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use orka_core::{ResourceKey, Snapshot};
use metrics_exporter_prometheus::PrometheusBuilder;
use orka_engine::{PeerRecord, PeeringTarget, Settings, TelemetrySettings};
use orka_kubehub::{Authenticator, InClusterLogin, KubeStore, StoreClient, Vault};
use orka_persist::{diffbase_storage, list_records, ExecutionRecord};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orkactl", version, about = "Orka operator engine tooling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Prefix of framework-owned annotations and finalizers
    #[arg(long = "prefix", global = true, env = "ORKA_PREFIX")]
    prefix: Option<String>,

    #[command(flatten)]
    peering: PeeringArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Which peering object to talk to; unset flags fall back to `ORKA_*` settings.
#[derive(Args, Debug)]
struct PeeringArgs {
    /// Name of the peering object
    #[arg(long = "peering", global = true)]
    name: Option<String>,

    /// Namespace of a namespaced peering object (default: the cluster-scoped one)
    #[arg(long = "peering-ns", global = true)]
    namespace: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the handler progress and last-handled state stored on one object
    Inspect {
        /// Resource key, e.g. "v1/configmaps" or "example.com/v1/widgets"
        key: String,
        /// Object name
        name: String,
        /// Object namespace
        #[arg(short = 'n', long = "ns")]
        namespace: Option<String>,
    },
    /// List, freeze or resume the peers of a peering object
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },
}

#[derive(Subcommand, Debug)]
enum PeersAction {
    /// Show every record and whether it is still alive
    List,
    /// Announce a peer that freezes every instance of lower or equal priority
    Freeze {
        /// Identity to announce under
        #[arg(long = "identity", default_value = "orkactl")]
        identity: String,
        /// Priority of the announcement
        #[arg(long = "priority", default_value_t = 100)]
        priority: i64,
        /// How long the freeze holds, in seconds
        #[arg(long = "lifetime", default_value_t = 3600)]
        lifetime: u64,
    },
    /// Withdraw a record written by `freeze`
    Resume {
        #[arg(long = "identity", default_value = "orkactl")]
        identity: String,
    },
}

fn init_tracing(telemetry: &TelemetrySettings) {
    let filter = EnvFilter::try_new(&telemetry.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(telemetry: &TelemetrySettings) {
    let Some(addr) = telemetry.metrics_addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not installed"),
    }
}

/// Environment settings with command-line flags on top.
fn settings(cli: &Cli) -> Settings {
    let mut s = Settings::from_env();
    if let Some(prefix) = &cli.prefix {
        s.persistence.prefix = prefix.clone();
    }
    if let Some(name) = &cli.peering.name {
        s.peering.name = name.clone();
    }
    if let Some(ns) = &cli.peering.namespace {
        s.peering.namespace = Some(ns.clone());
        s.peering.clusterwide = false;
    }
    s
}

async fn connect() -> Result<Arc<KubeStore>> {
    let vault = Arc::new(Vault::new());
    let auth = Authenticator::new(vault.clone()).provider(Arc::new(InClusterLogin));
    if auth.login_once().await == 0 {
        return Err(anyhow!("no usable cluster credentials (kubeconfig or service account)"));
    }
    Ok(Arc::new(KubeStore::new(vault)))
}

async fn inspect(store: &dyn StoreClient, settings: &Settings, output: Output, key: &str, name: &str, ns: Option<&str>) -> Result<()> {
    let key = ResourceKey::from_str(key)?;
    let resource = store.resolve(&key).await.with_context(|| format!("resolving {}", key))?;
    let body = Snapshot::new(store.get(&resource, ns, name).await.with_context(|| format!("reading {}", name))?);
    let persistence = &settings.persistence;
    let records = list_records(&body, &persistence.prefix);
    let diffbase = diffbase_storage(persistence.diffbase_storage, &persistence.prefix).fetch(&body);
    let finalizer = persistence.finalizer();
    info!(resource = %key, records = records.len(), "inspected");

    match output {
        Output::Json => {
            let records: BTreeMap<&str, &ExecutionRecord> = records.iter().map(|(k, r)| (k.as_str(), r)).collect();
            let out = json!({
                "finalizer": body.has_finalizer(&finalizer),
                "deleting": body.is_deletion_marked(),
                "records": records,
                "lastHandled": diffbase,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Output::Human => {
            println!("finalizer: {}", if body.has_finalizer(&finalizer) { "present" } else { "absent" });
            if body.is_deletion_marked() {
                println!("deletion requested");
            }
            if records.is_empty() {
                println!("no handler progress");
            }
            for (k, r) in &records {
                let state = if r.success {
                    "succeeded"
                } else if r.failure {
                    "failed"
                } else {
                    "pending"
                };
                let purpose = r.purpose.as_deref().unwrap_or("-");
                let msg = r.message.as_deref().unwrap_or("");
                println!("{} • {} • {} • retries={} {}", k, purpose, state, r.retries, msg);
                if let Some(at) = r.delayed {
                    println!("    next attempt at {}", at.to_rfc3339());
                }
            }
            match diffbase {
                Some(v) => println!("last handled:\n{}", serde_json::to_string_pretty(&v)?),
                None => println!("never handled"),
            }
        }
    }
    Ok(())
}

async fn peers(store: &dyn StoreClient, settings: &Settings, output: Output, action: PeersAction) -> Result<()> {
    let (target, _) = PeeringTarget::locate(store, &settings.peering)
        .await?
        .ok_or_else(|| anyhow!("peering object '{}' not found", settings.peering.name))?;
    let peers = match action {
        PeersAction::List => target.read(store).await?,
        PeersAction::Freeze { identity, priority, lifetime } => {
            let record = PeerRecord { priority, lifetime, lastseen: Utc::now() };
            info!(identity = %identity, priority, lifetime_s = lifetime, "freezing lower-priority peers");
            target.write(store, [(identity, Some(record))]).await?
        }
        PeersAction::Resume { identity } => {
            let known = target.read(store).await?;
            if !known.contains_key(&identity) {
                warn!(identity = %identity, "no such peer record; nothing to withdraw");
            }
            target.write(store, [(identity, None)]).await?
        }
    };
    let now = Utc::now();
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&peers)?),
        Output::Human => {
            if peers.is_empty() {
                println!("no peers");
            }
            for (id, r) in &peers {
                let state = if r.is_alive(now) { "alive" } else { "expired" };
                let left = (r.deadline() - now).num_seconds().max(0);
                println!("{} • priority={} • {} • {}s left", id, r.priority, state, left);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = settings(&cli);
    init_tracing(&settings.telemetry);
    init_metrics(&settings.telemetry);
    let store = connect().await?;

    match cli.command {
        Commands::Inspect { key, name, namespace } => {
            inspect(store.as_ref(), &settings, cli.output, &key, &name, namespace.as_deref()).await?
        }
        Commands::Peers { action } => peers(store.as_ref(), &settings, cli.output, action).await?,
    }
    Ok(())
}
