//! Cause detection: why are we looking at this object right now?

use orka_core::{diff, Diff, Snapshot};
use orka_registry::Reason;
use serde_json::Value as Json;

/// The classified reason for one processing pass plus what handlers get to see.
#[derive(Debug, Clone, PartialEq)]
pub struct Cause {
    pub reason: Reason,
    /// The object was in the startup listing and its first cycle is not over.
    pub initial: bool,
    /// Baseline essence (the last handled state), if any.
    pub old: Option<Json>,
    /// Current essence.
    pub new: Json,
    pub diff: Diff,
}

impl Cause {
    /// Reason as reported to handlers. A quiet object from the startup listing is a resume.
    pub fn reported(&self) -> Reason {
        if self.reason == Reason::Noop && self.initial {
            Reason::Resume
        } else {
            self.reason
        }
    }
}

/// Classify from the stored baseline, the current snapshot and its essence.
///
/// Deletion wins over everything. Without a baseline the object has never been
/// fully handled, so it is a creation even when found in the initial listing.
/// With a baseline the essence diff decides between update and no-op.
pub fn detect_cause(baseline: Option<&Json>, body: &Snapshot, essence: &Json, initial: bool) -> Cause {
    let d = diff(baseline, Some(essence));
    let reason = if body.is_deletion_marked() {
        Reason::Delete
    } else if baseline.is_none() {
        Reason::Create
    } else if d.is_empty() {
        Reason::Noop
    } else {
        Reason::Update
    };
    Cause { reason, initial, old: baseline.cloned(), new: essence.clone(), diff: d }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(spec: Json, deleting: bool) -> Snapshot {
        let mut raw = json!({"metadata": {"name": "w", "uid": "5b1d1e8e-1f7e-4a40-9b0a-000000000001"}, "spec": spec});
        if deleting {
            raw["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        }
        Snapshot::new(raw)
    }

    fn ess(spec: Json) -> Json { json!({"spec": spec}) }

    #[test]
    fn classification_table() {
        let base = ess(json!({"size": 1}));
        let cases = [
            (None, json!({"size": 1}), false, false, Reason::Create),
            (None, json!({"size": 1}), false, true, Reason::Create),
            (Some(base.clone()), json!({"size": 1}), false, false, Reason::Noop),
            (Some(base.clone()), json!({"size": 2}), false, false, Reason::Update),
            (Some(base.clone()), json!({"size": 2}), true, false, Reason::Delete),
            (None, json!({"size": 1}), true, false, Reason::Delete),
        ];
        for (baseline, spec, deleting, initial, expected) in cases {
            let body = snap(spec.clone(), deleting);
            let cause = detect_cause(baseline.as_ref(), &body, &ess(spec), initial);
            assert_eq!(cause.reason, expected, "baseline={:?} deleting={}", baseline, deleting);
        }
    }

    #[test]
    fn quiet_first_sighting_is_reported_as_resume() {
        let base = ess(json!({"size": 1}));
        let body = snap(json!({"size": 1}), false);
        let cause = detect_cause(Some(&base), &body, &base, true);
        assert_eq!(cause.reason, Reason::Noop);
        assert_eq!(cause.reported(), Reason::Resume);
        let later = detect_cause(Some(&base), &body, &base, false);
        assert_eq!(later.reported(), Reason::Noop);
    }

    #[test]
    fn same_inputs_same_cause() {
        let base = ess(json!({"size": 1, "color": "red"}));
        let body = snap(json!({"size": 3}), false);
        let a = detect_cause(Some(&base), &body, &ess(json!({"size": 3})), false);
        let b = detect_cause(Some(&base), &body, &ess(json!({"size": 3})), false);
        assert_eq!(a, b);
        assert_eq!(a.diff.len(), 2);
    }
}
