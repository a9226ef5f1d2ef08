use serde_json::Value;

use crate::error::{CoreError, CoreResult, PrereqKind};
use crate::storage::RecordRow;

use super::{resolve_cid, PluginCtx};

/// `graph.listitem`. Ensures the creator and subject; if the
/// owning list isn't indexed yet, enqueues on that list's queue.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let list_uri = record
        .get("list")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("listitem.list missing".into()))?;
    let subject_did = record
        .get("subject")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("listitem.subject missing".into()))?;

    ctx.processor.ensure_subject_user(subject_did).await?;

    if ctx.storage.get_list(list_uri).await?.is_none() {
        return Err(CoreError::MissingPrerequisite {
            kind: PrereqKind::List,
            prereq: list_uri.to_string(),
        });
    }

    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_list_item(
            RecordRow {
                uri: uri.to_string(),
                cid,
                author_did: did.to_string(),
                created_at: ctx.now,
                indexed_at: ctx.now,
                record: record.clone(),
            },
            list_uri,
            subject_did,
        )
        .await
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    storage.delete_list_item(uri, owner_did).await
}
