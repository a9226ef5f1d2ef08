use serde_json::Value;

use crate::error::CoreResult;
use crate::sanitize::sanitize_opt_text;
use crate::storage::UserPatch;

use super::PluginCtx;

/// `actor.profile`. Resolves the DID's current handle (skipped during
/// bulk backfill) and upserts the user row with sanitized profile fields
/// and extracted avatar/banner CIDs.
pub async fn create(ctx: &PluginCtx<'_>, _uri: &str, did: &str, _cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    if !ctx.processor.is_bulk_mode() {
        if let Ok(resolved) = ctx.processor.identity().resolve(did).await {
            ctx.storage.upsert_user_handle(did, &resolved.handle).await?;
        }
    }

    let display_name = sanitize_opt_text(record.get("displayName").and_then(Value::as_str));
    let description = sanitize_opt_text(record.get("description").and_then(Value::as_str));
    let avatar_cid = record.get("avatar").and_then(crate::cid::extract_cid);
    let banner_cid = record.get("banner").and_then(crate::cid::extract_cid);

    ctx.storage
        .update_user(
            did,
            UserPatch {
                handle: None,
                display_name: Some(display_name),
                description: Some(description),
                avatar_cid: Some(avatar_cid),
                banner_cid: Some(banner_cid),
                profile_record: Some(Some(record.clone())),
            },
        )
        .await
}

// Profile records are never deleted independently of the user row — see
// `EventProcessor::process_delete`'s `app.bsky.actor.profile` arm.
