use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::storage::RecordRow;

use super::{resolve_cid, PluginCtx};

/// `block`. Ensures the blocker; inserts the block.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let subject_did = record
        .get("subject")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("block.subject missing".into()))?;

    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_block(
            RecordRow {
                uri: uri.to_string(),
                cid,
                author_did: did.to_string(),
                created_at: ctx.now,
                indexed_at: ctx.now,
                record: record.clone(),
            },
            subject_did,
        )
        .await
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    storage.delete_block(uri, owner_did).await
}
