//! Kubernetes Events about handled objects. Fire-and-forget: a failed post is
//! logged and never affects processing.

use metrics::counter;
use orka_core::{Clock, Snapshot};
use orka_kubehub::{ResourceInfo, StoreClient};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::settings::PostingSettings;

const MAX_MESSAGE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl EventLevel {
    /// The Event `type`; the API only knows two.
    fn event_type(self) -> &'static str {
        match self {
            EventLevel::Debug | EventLevel::Info => "Normal",
            EventLevel::Warning | EventLevel::Error => "Warning",
        }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_MESSAGE {
        return message.to_string();
    }
    let mut cut = MAX_MESSAGE - 3;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut])
}

/// Post an Event about `body` when posting is enabled and `level` passes the threshold.
#[allow(clippy::too_many_arguments)]
pub async fn post_event(
    store: &dyn StoreClient,
    settings: &PostingSettings,
    clock: &Clock,
    resource: &ResourceInfo,
    body: &Snapshot,
    level: EventLevel,
    reason: &str,
    message: &str,
) {
    if !settings.enabled || level < settings.level {
        return;
    }
    let name = body.name().unwrap_or_default();
    let namespace = body.namespace().unwrap_or("default");
    let now = clock.now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    let event = json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": {"generateName": format!("{}.", name), "namespace": namespace},
        "involvedObject": {
            "apiVersion": resource.key.api_version(),
            "kind": resource.kind,
            "name": name,
            "namespace": body.namespace(),
            "uid": body.uid(),
            "resourceVersion": body.resource_version(),
        },
        "reason": reason,
        "message": truncate(message),
        "type": level.event_type(),
        "source": {"component": settings.reporting_component},
        "reportingComponent": settings.reporting_component,
        "firstTimestamp": now,
        "lastTimestamp": now,
        "count": 1,
    });
    match store.create(&ResourceInfo::events(), Some(namespace), &event).await {
        Ok(_) => counter!("events_posted_total", 1u64),
        Err(e) => debug!(resource = %resource.key, name = %name, error = %e, "failed to post event"),
    }
}
