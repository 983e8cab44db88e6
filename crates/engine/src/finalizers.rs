//! The framework's finalizer marker: added while the object needs guaranteed
//! deletion handling, removed once that handling is done.

use orka_core::{Patch, ResourceKey, Snapshot};
use orka_registry::Registry;

/// Whether the object needs our marker right now.
pub fn requires(registry: &Registry, resource: &ResourceKey, body: &Snapshot) -> bool {
    registry.requires_finalizer(resource, body)
}

/// Deletion was requested and our marker is holding the object in place.
pub fn is_blocked(body: &Snapshot, marker: &str) -> bool { body.is_deletion_marked() && body.has_finalizer(marker) }

/// Add the marker, keeping every foreign finalizer. No-op when already present.
pub fn add(body: &Snapshot, patch: &mut Patch, marker: &str) {
    if body.has_finalizer(marker) {
        return;
    }
    let mut list: Vec<String> = body.finalizers().into_iter().map(str::to_string).collect();
    list.push(marker.to_string());
    patch.set_finalizers(list);
}

/// Drop the marker, keeping every foreign finalizer. No-op when absent.
pub fn remove(body: &Snapshot, patch: &mut Patch, marker: &str) {
    if !body.has_finalizer(marker) {
        return;
    }
    let list: Vec<String> = body.finalizers().into_iter().filter(|f| *f != marker).map(str::to_string).collect();
    patch.set_finalizers(list);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MARKER: &str = "orka.skelops.io/finalizer";

    fn body(finalizers: serde_json::Value, deleting: bool) -> Snapshot {
        let mut raw = json!({"metadata": {"name": "w", "finalizers": finalizers}});
        if deleting {
            raw["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        }
        Snapshot::new(raw)
    }

    #[test]
    fn add_and_remove_keep_foreign_markers() {
        let b = body(json!(["other/keep"]), false);
        let mut p = Patch::new();
        add(&b, &mut p, MARKER);
        assert_eq!(p.as_json(), json!({"metadata": {"finalizers": ["other/keep", MARKER]}}));

        let b = body(json!(["other/keep", MARKER]), true);
        let mut p = Patch::new();
        remove(&b, &mut p, MARKER);
        assert_eq!(p.as_json(), json!({"metadata": {"finalizers": ["other/keep"]}}));
    }

    #[test]
    fn idempotent_when_nothing_to_do() {
        let mut p = Patch::new();
        add(&body(json!([MARKER]), false), &mut p, MARKER);
        remove(&body(json!([]), false), &mut p, MARKER);
        assert!(p.is_empty());
    }

    #[test]
    fn blocked_only_when_marked_and_holding() {
        assert!(is_blocked(&body(json!([MARKER]), true), MARKER));
        assert!(!is_blocked(&body(json!(["other"]), true), MARKER));
        assert!(!is_blocked(&body(json!([MARKER]), false), MARKER));
    }
}
