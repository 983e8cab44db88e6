//! Orka core types: resource keys, object identities, snapshots, diffs and patches.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

pub mod body;
pub mod clock;
pub mod diff;
pub mod errors;
pub mod patch;

pub use body::{essence, Snapshot};
pub use clock::Clock;
pub use diff::{apply_diff, diff, diff_at, Diff, DiffAction, DiffOp};
pub use errors::{HandlerError, HandlerResult};
pub use patch::{merge_patch_between, merge_values, Patch, PatchParts, Transform};

pub type Uid = [u8; 16];

/// Identifies a watched resource type: `(group, version, plural)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl ResourceKey {
    pub fn new(group: &str, version: &str, plural: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), plural: plural.to_string() }
    }

    /// `apiVersion` as it appears in object bodies (`v1` or `group/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = anyhow::Error;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, plural] if !version.is_empty() && !plural.is_empty() => Ok(Self::new("", version, plural)),
            [group, version, plural] if !version.is_empty() && !plural.is_empty() => Ok(Self::new(group, version, plural)),
            _ => Err(anyhow::anyhow!("invalid resource key: {} (expect v1/plural or group/v1/plural)", key)),
        }
    }
}

/// Identifies one object across its lifetime. A recreated object gets a new uid
/// and therefore a different identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Uid,
}

impl ObjectId {
    pub fn from_body(raw: &serde_json::Value) -> anyhow::Result<Self> {
        let meta = raw.get("metadata").ok_or_else(|| anyhow::anyhow!("object missing metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("object missing metadata.name"))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let uid_str = meta
            .get("uid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("object missing metadata.uid"))?;
        Ok(Self { namespace, name, uid: to_uid(uid_str)? })
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

pub fn to_uid(uid_str: &str) -> anyhow::Result<Uid> {
    let u = Uuid::parse_str(uid_str).map_err(|e| anyhow::anyhow!("parsing metadata.uid as uuid: {}", e))?;
    Ok(*u.as_bytes())
}

/// Dotted path into an object body, e.g. `spec.replicas`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath(pub SmallVec<[String; 4]>);

impl FieldPath {
    pub fn root() -> Self { Self(SmallVec::new()) }

    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
    }

    pub fn is_root(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn segments(&self) -> &[String] { &self.0 }

    pub fn child(&self, key: &str) -> Self {
        let mut next = self.0.clone();
        next.push(key.to_string());
        Self(next)
    }

    /// Resolve the path inside a JSON tree; `None` when any segment is absent.
    pub fn resolve<'a>(&self, v: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut cur = v;
        for seg in self.0.iter() {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl<const N: usize> From<[&str; N]> for FieldPath {
    fn from(v: [&str; N]) -> Self { Self(v.iter().map(|s| s.to_string()).collect()) }
}

pub mod prelude {
    pub use super::{
        Clock, Diff, DiffAction, DiffOp, FieldPath, HandlerError, HandlerResult, ObjectId, Patch, ResourceKey,
        Snapshot, Uid,
    };
}
