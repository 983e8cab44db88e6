//! Turning one accumulated `Patch` into store calls.
//!
//! Order: transform-derived JSON patches first (guarded by a resourceVersion
//! `test`, re-read and recomputed on conflict), then the status merge, then the
//! main-body merge, then finalizers. Handler results live in `status` and the
//! records claiming them in the main body, so a failed status call leaves nothing
//! claimed. Finalizers go last because removing ours may let the object disappear.

use json_patch::{PatchOperation, TestOperation};
use metrics::counter;
use orka_core::{Patch, Snapshot};
use orka_kubehub::{ResourceInfo, StoreClient, StoreError};
use serde_json::Value as Json;
use tracing::debug;

fn is_status_path(path: &str) -> bool { path == "/status" || path.starts_with("/status/") }

fn rv_of(raw: &Json) -> Json {
    raw.get("metadata").and_then(|m| m.get("resourceVersion")).cloned().unwrap_or(Json::Null)
}

fn guarded(rv: Json, ops: Vec<PatchOperation>) -> json_patch::Patch {
    let mut all = Vec::with_capacity(ops.len() + 1);
    all.push(PatchOperation::Test(TestOperation { path: "/metadata/resourceVersion".to_string(), value: rv }));
    all.extend(ops);
    json_patch::Patch(all)
}

struct Target<'a> {
    store: &'a dyn StoreClient,
    resource: &'a ResourceInfo,
    namespace: Option<&'a str>,
    name: &'a str,
}

/// Which halves of the transform ops have landed, and the last answer.
#[derive(Default)]
struct Landed {
    status: bool,
    main: bool,
    latest: Option<Json>,
}

impl Target<'_> {
    /// One attempt: compute the JSON patch from `base` and send the halves that
    /// have not landed yet (status, then main).
    async fn send_transforms(&self, patch: &Patch, base: &Json, landed: &mut Landed) -> Result<(), StoreError> {
        let target = patch.transformed(base);
        let ops = json_patch::diff(base, &target).0;
        let (status_ops, main_ops): (Vec<_>, Vec<_>) = if self.resource.status_subresource {
            ops.into_iter().partition(|op| is_status_path(op_path(op)))
        } else {
            (Vec::new(), ops)
        };
        let mut rv = rv_of(base);
        for (ops, sub, done) in [(status_ops, Some("status"), &mut landed.status), (main_ops, None, &mut landed.main)] {
            if *done || ops.is_empty() {
                continue;
            }
            let out = self.store.json_patch(self.resource, self.namespace, self.name, &guarded(rv, ops), sub).await?;
            *done = true;
            rv = rv_of(&out);
            landed.latest = Some(out);
        }
        Ok(())
    }

    /// A re-read base already holds whatever half landed before the conflict;
    /// replaying it would apply the transforms twice.
    async fn apply_transforms(&self, patch: &Patch, body: &Snapshot, conflict_retries: u32) -> Result<Option<Json>, StoreError> {
        let mut base = body.raw().clone();
        let mut landed = Landed::default();
        let mut attempt = 0;
        loop {
            match self.send_transforms(patch, &base, &mut landed).await {
                Ok(()) => return Ok(landed.latest),
                Err(StoreError::Conflict(msg)) if attempt < conflict_retries => {
                    attempt += 1;
                    counter!("patch_conflicts_total", 1u64);
                    debug!(resource = %self.resource.key, name = %self.name, attempt, reason = %msg, "patch conflict; re-reading");
                    base = self.store.get(self.resource, self.namespace, self.name).await?;
                }
                Err(StoreError::Conflict(msg)) => {
                    counter!("patch_conflicts_total", 1u64);
                    return Err(StoreError::Conflict(msg));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, patch: &Patch, body: &Snapshot, conflict_retries: u32) -> Result<Option<Json>, StoreError> {
        let parts = patch.split(self.resource.status_subresource);
        let mut latest = None;
        if !patch.transforms().is_empty() {
            latest = self.apply_transforms(patch, body, conflict_retries).await?;
        }
        if let Some(status) = parts.status.as_ref() {
            latest = Some(self.store.merge_patch(self.resource, self.namespace, self.name, status, Some("status")).await?);
        }
        if let Some(main) = parts.main.as_ref() {
            latest = Some(self.store.merge_patch(self.resource, self.namespace, self.name, main, None).await?);
        }
        if let Some(fins) = parts.finalizers.as_ref() {
            latest = Some(self.store.merge_patch(self.resource, self.namespace, self.name, fins, None).await?);
        }
        Ok(latest)
    }
}

fn op_path(op: &PatchOperation) -> &str {
    match op {
        PatchOperation::Add(o) => &o.path,
        PatchOperation::Remove(o) => &o.path,
        PatchOperation::Replace(o) => &o.path,
        PatchOperation::Move(o) => &o.path,
        PatchOperation::Copy(o) => &o.path,
        PatchOperation::Test(o) => &o.path,
    }
}

/// Apply `patch` to the object `body` describes.
///
/// Returns the freshest body the store answered with (or `body` itself when there
/// was nothing to send), `None` when the object is gone. Anything else that fails
/// is returned so the caller can retry the whole cycle.
pub async fn apply_patch(
    store: &dyn StoreClient,
    resource: &ResourceInfo,
    body: &Snapshot,
    patch: &Patch,
    conflict_retries: u32,
) -> Result<Option<Snapshot>, StoreError> {
    if patch.is_empty() {
        return Ok(Some(body.clone()));
    }
    let name = match body.name() {
        Some(n) => n,
        None => return Err(StoreError::NotFound("object without metadata.name".into())),
    };
    let target = Target { store, resource, namespace: body.namespace(), name };
    match target.send(patch, body, conflict_retries).await {
        Ok(latest) => Ok(Some(latest.map(Snapshot::new).unwrap_or_else(|| body.clone()))),
        Err(StoreError::NotFound(msg)) => {
            debug!(resource = %resource.key, name = %name, reason = %msg, "object gone before patching");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
