use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::storage::{NotificationReason, NotificationRow, RecordRow};

use super::{resolve_cid, PluginCtx};

/// `follow`. Ensures the follower; inserts the follow; notifies
/// the followee if their user row is local.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let subject_did = record
        .get("subject")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("follow.subject missing".into()))?;

    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_follow(
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
        .await?;

    if ctx.storage.get_user(subject_did).await?.is_some() {
        ctx.storage
            .create_notification(NotificationRow {
                uri: format!("{}#notif", uri),
                recipient_did: subject_did.to_string(),
                author_did: did.to_string(),
                reason: NotificationReason::Follow,
                reason_subject: None,
                cid: None,
                created_at: ctx.now,
            })
            .await?;
    }

    Ok(())
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    storage.delete_follow(uri, owner_did).await
}
