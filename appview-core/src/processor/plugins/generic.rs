use serde_json::Value;

use crate::error::CoreResult;
use crate::storage::RecordRow;

use super::{resolve_cid, PluginCtx};

/// Fallback for collections with no dedicated handler last row.
/// Stores the raw record keyed by collection for later lookup, with no
/// aggregation or notification side effects.
pub async fn create(
    ctx: &PluginCtx<'_>,
    uri: &str,
    did: &str,
    cid: Option<&str>,
    record: &Value,
    collection: &str,
) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;
    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_generic_record(
            RecordRow {
                uri: uri.to_string(),
                cid,
                author_did: did.to_string(),
                created_at: ctx.now,
                indexed_at: ctx.now,
                record: record.clone(),
            },
            collection,
        )
        .await
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    storage.delete_generic_record(uri, owner_did).await
}
