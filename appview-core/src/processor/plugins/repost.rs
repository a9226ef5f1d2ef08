use serde_json::Value;

use crate::error::{CoreError, CoreResult, PrereqKind};
use crate::storage::{
    AggregationField, FeedItemKind, FeedItemRow, NotificationReason, NotificationRow, RecordRow,
    ViewerStatePatch,
};

use super::{resolve_cid, PluginCtx};

/// `repost`. As `like`, but adds a feed-item row of type `repost`
/// whose originator is the reposter, and increments `repostCount`.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let subject_uri = record
        .get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(|u| u.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("repost.subject.uri missing".into()))?;

    let post = ctx.storage.get_post(subject_uri).await?;
    let Some(post) = post else {
        return Err(CoreError::MissingPrerequisite {
            kind: PrereqKind::Post,
            prereq: subject_uri.to_string(),
        });
    };

    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_repost(
            RecordRow {
                uri: uri.to_string(),
                cid: cid.clone(),
                author_did: did.to_string(),
                created_at: ctx.now,
                indexed_at: ctx.now,
                record: record.clone(),
            },
            subject_uri,
        )
        .await?;

    ctx.storage
        .increment_post_aggregation(subject_uri, AggregationField::RepostCount, 1)
        .await?;

    ctx.storage
        .create_post_viewer_state(
            subject_uri,
            did,
            ViewerStatePatch {
                repost_uri: Some(Some(uri.to_string())),
                ..Default::default()
            },
        )
        .await?;

    ctx.storage
        .create_feed_item(FeedItemRow {
            uri: uri.to_string(),
            post_uri: subject_uri.to_string(),
            originator_did: did.to_string(),
            kind: FeedItemKind::Repost,
            sort_at: ctx.now,
            cid,
        })
        .await?;

    if post.author_did != did {
        ctx.storage
            .create_notification(NotificationRow {
                uri: format!("{}#notif", uri),
                recipient_did: post.author_did,
                author_did: did.to_string(),
                reason: NotificationReason::Repost,
                reason_subject: Some(subject_uri.to_string()),
                cid: None,
                created_at: ctx.now,
            })
            .await?;
    }

    Ok(())
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    let Some(repost) = storage.get_repost(uri).await? else {
        return Ok(());
    };
    storage.delete_repost(uri, owner_did).await?;
    storage.delete_feed_item(uri).await?;
    let subject_uri = repost
        .record
        .get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(|u| u.as_str());
    if let Some(subject_uri) = subject_uri {
        storage
            .increment_post_aggregation(subject_uri, AggregationField::RepostCount, -1)
            .await?;
        storage
            .create_post_viewer_state(
                subject_uri,
                owner_did,
                ViewerStatePatch {
                    repost_uri: Some(None),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}
