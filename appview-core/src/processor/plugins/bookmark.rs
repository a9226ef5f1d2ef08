use serde_json::Value;

use crate::error::{CoreError, CoreResult, PrereqKind};
use crate::storage::{AggregationField, RecordRow, ViewerStatePatch};

use super::{resolve_cid, PluginCtx};

/// `bookmark`. Increments `bookmarkCount` and upserts viewer-state
/// `bookmarked=true`. No notification.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let subject_uri = record
        .get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(|u| u.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("bookmark.subject.uri missing".into()))?;

    if ctx.storage.get_post(subject_uri).await?.is_none() {
        return Err(CoreError::MissingPrerequisite {
            kind: PrereqKind::Post,
            prereq: subject_uri.to_string(),
        });
    }

    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_bookmark(
            RecordRow {
                uri: uri.to_string(),
                cid,
                author_did: did.to_string(),
                created_at: ctx.now,
                indexed_at: ctx.now,
                record: record.clone(),
            },
            subject_uri,
        )
        .await?;

    ctx.storage
        .increment_post_aggregation(subject_uri, AggregationField::BookmarkCount, 1)
        .await?;

    ctx.storage
        .create_post_viewer_state(
            subject_uri,
            did,
            ViewerStatePatch {
                bookmarked: Some(true),
                ..Default::default()
            },
        )
        .await?;

    Ok(())
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    let Some(bookmark) = storage.get_bookmark(uri).await? else {
        return Ok(());
    };
    storage.delete_bookmark(uri, owner_did).await?;
    let subject_uri = bookmark
        .record
        .get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(|u| u.as_str());
    if let Some(subject_uri) = subject_uri {
        storage
            .increment_post_aggregation(subject_uri, AggregationField::BookmarkCount, -1)
            .await?;
        storage
            .create_post_viewer_state(
                subject_uri,
                owner_did,
                ViewerStatePatch {
                    bookmarked: Some(false),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}
