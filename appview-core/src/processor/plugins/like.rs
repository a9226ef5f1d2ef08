use serde_json::Value;

use crate::error::{CoreError, CoreResult, PrereqKind};
use crate::storage::{AggregationField, NotificationReason, NotificationRow, RecordRow, ViewerStatePatch};

use super::{resolve_cid, PluginCtx};

/// `like`. Ensures the liker, enqueues the whole op on the subject
/// post's queue if the post isn't indexed yet, otherwise inserts the like,
/// bumps `likeCount`, upserts viewer state, and notifies the post's author
/// when local and distinct from the liker.
pub async fn create(ctx: &PluginCtx<'_>, uri: &str, did: &str, cid: Option<&str>, record: &Value) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let subject_uri = record
        .get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(|u| u.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("like.subject.uri missing".into()))?;

    let post = ctx.storage.get_post(subject_uri).await?;
    let Some(post) = post else {
        return Err(CoreError::MissingPrerequisite {
            kind: PrereqKind::Post,
            prereq: subject_uri.to_string(),
        });
    };

    let cid = resolve_cid(cid, did, uri, record);
    ctx.storage
        .create_like(
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
        .increment_post_aggregation(subject_uri, AggregationField::LikeCount, 1)
        .await?;

    ctx.storage
        .create_post_viewer_state(
            subject_uri,
            did,
            ViewerStatePatch {
                like_uri: Some(Some(uri.to_string())),
                ..Default::default()
            },
        )
        .await?;

    if post.author_did != did {
        ctx.storage
            .create_notification(NotificationRow {
                uri: format!("{}#notif", uri),
                recipient_did: post.author_did,
                author_did: did.to_string(),
                reason: NotificationReason::Like,
                reason_subject: Some(subject_uri.to_string()),
                cid: None,
                created_at: ctx.now,
            })
            .await?;
    }

    Ok(())
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    let Some(like) = storage.get_like(uri).await? else {
        return Ok(());
    };
    storage.delete_like(uri, owner_did).await?;
    let subject_uri = like
        .record
        .get("subject")
        .and_then(|s| s.get("uri"))
        .and_then(|u| u.as_str());
    if let Some(subject_uri) = subject_uri {
        storage
            .increment_post_aggregation(subject_uri, AggregationField::LikeCount, -1)
            .await?;
        storage
            .create_post_viewer_state(
                subject_uri,
                owner_did,
                ViewerStatePatch {
                    like_uri: Some(None),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}
