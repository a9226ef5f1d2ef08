use serde_json::Value;

use crate::error::CoreResult;
use crate::storage::RecordRow;

use super::{resolve_cid, PluginCtx};

/// `feed.postgate`. Keyed on the owning post's URI; no aggregation
/// side effect.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;
    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_post_gate(RecordRow {
            uri: uri.to_string(),
            cid,
            author_did: did.to_string(),
            created_at: ctx.now,
            indexed_at: ctx.now,
            record: record.clone(),
        })
        .await
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    storage.delete_post_gate(uri, owner_did).await
}
