//! Structural diffs between two object bodies.
//!
//! Maps are compared key by key (old keys first, then new-only keys, each in
//! document order); lists and scalars are atomic and reported as a single
//! `change`. A missing key is not the same as a key holding `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::FieldPath;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Add,
    Change,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffOp {
    pub action: DiffAction,
    pub path: FieldPath,
    pub old: Option<Json>,
    pub new: Option<Json>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Diff(pub Vec<DiffOp>);

impl Diff {
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> std::slice::Iter<'_, DiffOp> { self.0.iter() }

    /// Whether any operation touches `path` or anything below/above it.
    pub fn touches(&self, path: &FieldPath) -> bool {
        self.0.iter().any(|op| {
            let n = op.path.len().min(path.len());
            op.path.segments()[..n] == path.segments()[..n]
        })
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = &'a DiffOp;
    type IntoIter = std::slice::Iter<'a, DiffOp>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

/// Diff two trees. An absent root map is treated as an empty map, so every
/// top-level key shows up as its own `add` (or `remove`).
pub fn diff(old: Option<&Json>, new: Option<&Json>) -> Diff {
    let mut ops = Vec::new();
    let empty = Json::Object(Map::new());
    match (old, new) {
        (None, Some(n @ Json::Object(_))) => walk(Some(&empty), Some(n), FieldPath::root(), &mut ops),
        (Some(o @ Json::Object(_)), None) => walk(Some(o), Some(&empty), FieldPath::root(), &mut ops),
        _ => walk(old, new, FieldPath::root(), &mut ops),
    }
    Diff(ops)
}

/// Diff restricted to one field; paths are relative to that field.
pub fn diff_at(old: Option<&Json>, new: Option<&Json>, field: &FieldPath) -> Diff {
    let o = old.and_then(|v| field.resolve(v));
    let n = new.and_then(|v| field.resolve(v));
    diff(o, n)
}

fn walk(old: Option<&Json>, new: Option<&Json>, path: FieldPath, ops: &mut Vec<DiffOp>) {
    match (old, new) {
        (None, None) => {}
        (None, Some(n)) => ops.push(DiffOp { action: DiffAction::Add, path, old: None, new: Some(n.clone()) }),
        (Some(o), None) => ops.push(DiffOp { action: DiffAction::Remove, path, old: Some(o.clone()), new: None }),
        (Some(o), Some(n)) if o == n => {}
        (Some(Json::Object(om)), Some(Json::Object(nm))) => {
            for (k, ov) in om.iter() {
                walk(Some(ov), nm.get(k), path.child(k), ops);
            }
            for (k, nv) in nm.iter() {
                if !om.contains_key(k) {
                    walk(None, Some(nv), path.child(k), ops);
                }
            }
        }
        (Some(o), Some(n)) => {
            ops.push(DiffOp { action: DiffAction::Change, path, old: Some(o.clone()), new: Some(n.clone()) })
        }
    }
}

/// Apply diff operations to a base tree. `None` stands for an absent tree, both
/// as input and as output (e.g. after a root-level `remove`).
pub fn apply_diff(base: Option<&Json>, diff: &Diff) -> Option<Json> {
    let mut out = base.cloned();
    for op in diff.iter() {
        match op.action {
            DiffAction::Add | DiffAction::Change => {
                let value = op.new.clone().unwrap_or(Json::Null);
                if op.path.is_root() {
                    out = Some(value);
                } else {
                    let root = out.get_or_insert_with(|| Json::Object(Map::new()));
                    set_path(root, op.path.segments(), value);
                }
            }
            DiffAction::Remove => {
                if op.path.is_root() {
                    out = None;
                } else if let Some(root) = out.as_mut() {
                    remove_path(root, op.path.segments());
                }
            }
        }
    }
    out
}

fn set_path(root: &mut Json, segs: &[String], value: Json) {
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        if !cur.is_object() {
            *cur = Json::Object(Map::new());
        }
        cur = match cur.as_object_mut() {
            Some(map) => map.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new())),
            None => return,
        };
    }
    if !cur.is_object() {
        *cur = Json::Object(Map::new());
    }
    if let (Some(map), Some(last)) = (cur.as_object_mut(), segs.last()) {
        map.insert(last.clone(), value);
    }
}

fn remove_path(root: &mut Json, segs: &[String]) {
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        cur = match cur.as_object_mut().and_then(|m| m.get_mut(seg)) {
            Some(next) => next,
            None => return,
        };
    }
    if let (Some(map), Some(last)) = (cur.as_object_mut(), segs.last()) {
        map.remove(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(d: &Diff) -> Vec<(DiffAction, String)> { d.iter().map(|o| (o.action, o.path.to_string())).collect() }

    #[test]
    fn absent_old_adds_every_top_level_key() {
        let d = diff(None, Some(&json!({"a": 1, "b": {"c": 2}})));
        assert_eq!(ops(&d), vec![(DiffAction::Add, "a".into()), (DiffAction::Add, "b".into())]);
        let d = diff(Some(&json!({"a": 1})), None);
        assert_eq!(ops(&d), vec![(DiffAction::Remove, "a".into())]);
    }

    #[test]
    fn keys_are_ordered_old_first_then_new_only() {
        let old = json!({"a": 1, "m": 1, "z": 1});
        let new = json!({"a": 2, "b": 2, "m": 1});
        let d = diff(Some(&old), Some(&new));
        assert_eq!(
            ops(&d),
            vec![(DiffAction::Change, "a".into()), (DiffAction::Remove, "z".into()), (DiffAction::Add, "b".into())]
        );
    }

    #[test]
    fn keys_follow_document_order() {
        let old = json!({"zeta": 1, "alpha": 1});
        let new = json!({"zeta": 2, "alpha": 2, "omega": 2, "beta": 2});
        let d = diff(Some(&old), Some(&new));
        assert_eq!(
            ops(&d),
            vec![
                (DiffAction::Change, "zeta".into()),
                (DiffAction::Change, "alpha".into()),
                (DiffAction::Add, "omega".into()),
                (DiffAction::Add, "beta".into()),
            ]
        );
    }

    #[test]
    fn lists_are_atomic_and_null_differs_from_absent() {
        let d = diff(Some(&json!({"l": [1, 2, 3]})), Some(&json!({"l": [1, 9]})));
        assert_eq!(d.len(), 1);
        assert_eq!(d.0[0].action, DiffAction::Change);
        assert_eq!(d.0[0].new, Some(json!([1, 9])));

        let d = diff(Some(&json!({"k": null})), Some(&json!({})));
        assert_eq!(ops(&d), vec![(DiffAction::Remove, "k".into())]);
        assert_eq!(d.0[0].old, Some(Json::Null));

        let d = diff(Some(&json!({})), Some(&json!({"k": null})));
        assert_eq!(ops(&d), vec![(DiffAction::Add, "k".into())]);
    }

    #[test]
    fn nested_changes_report_dotted_paths() {
        let old = json!({"spec": {"replicas": 1, "image": "a"}});
        let new = json!({"spec": {"replicas": 2, "image": "a", "paused": true}});
        let d = diff(Some(&old), Some(&new));
        assert_eq!(ops(&d), vec![(DiffAction::Change, "spec.replicas".into()), (DiffAction::Add, "spec.paused".into())]);
        assert!(d.touches(&FieldPath::parse("spec")));
        assert!(d.touches(&FieldPath::parse("spec.replicas.deep")));
        assert!(!d.touches(&FieldPath::parse("metadata")));
    }

    #[test]
    fn field_scoped_diff_is_relative_and_filtered() {
        let old = json!({"spec": {"a": {"x": 1}, "b": 1}});
        let new = json!({"spec": {"a": {"x": 2}, "b": 2}});
        let d = diff_at(Some(&old), Some(&new), &FieldPath::parse("spec.a"));
        assert_eq!(ops(&d), vec![(DiffAction::Change, "x".into())]);

        let unaffected = diff_at(Some(&old), Some(&new), &FieldPath::parse("spec.c"));
        assert!(unaffected.is_empty());

        let scalar = diff_at(Some(&old), Some(&new), &FieldPath::parse("spec.b"));
        assert_eq!(ops(&scalar), vec![(DiffAction::Change, "".into())]);
    }

    #[test]
    fn applying_a_diff_reproduces_the_target() {
        let cases = [
            (Some(json!({"a": 1, "b": {"c": [1, 2]}, "n": null})), Some(json!({"b": {"c": [3], "d": null}, "e": "x"}))),
            (None, Some(json!({"spec": {"x": 1}}))),
            (Some(json!({"spec": {"x": 1}})), None),
            (Some(json!(1)), Some(json!("s"))),
            (Some(json!({"a": {"b": 1}})), Some(json!({"a": 5}))),
        ];
        for (a, b) in cases {
            let d = diff(a.as_ref(), b.as_ref());
            let out = apply_diff(a.as_ref(), &d);
            let expected = match (&a, &b) {
                // a removed root map degrades to an empty map, not to absence
                (Some(Json::Object(_)), None) => Some(json!({})),
                _ => b.clone(),
            };
            assert_eq!(out, expected, "a={:?} b={:?}", a, b);
        }
    }
}
