use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreResult;
use crate::storage::{
    AggregationField, FeedItemKind, FeedItemRow, NotificationReason, NotificationRow, RecordRow,
    Storage,
};

use super::{resolve_cid, PluginCtx};

fn parse_created_at(record: &Value, fallback: DateTime<Utc>) -> DateTime<Utc> {
    record
        .get("createdAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}

/// `post`. Ensures the author, inserts the post with its zeroed
/// aggregation row, handles reply bookkeeping (parent replyCount, root
/// thread-context), creates the feed item, fires reply/mention/quote
/// notifications for locally-known recipients, and flushes anything
/// queued against this post's URI.
pub async fn create(
    ctx: &PluginCtx<'_>,
    uri: &str,
    did: &str,
    cid: Option<&str>,
    record: &Value,
) -> CoreResult<()> {
    ctx.processor.ensure_user(did).await?;

    let cid = resolve_cid(cid, did, uri, record);
    let created_at = parse_created_at(record, ctx.now);

    ctx.storage
        .create_post(RecordRow {
            uri: uri.to_string(),
            cid: cid.clone(),
            author_did: did.to_string(),
            created_at,
            indexed_at: ctx.now,
            record: record.clone(),
        })
        .await?;

    ctx.storage.create_post_aggregation(uri).await?;

    if let Some(reply) = record.get("reply") {
        handle_reply(ctx, uri, did, reply).await;
    }

    ctx.storage
        .create_feed_item(FeedItemRow {
            uri: uri.to_string(),
            post_uri: uri.to_string(),
            originator_did: did.to_string(),
            kind: FeedItemKind::Post,
            sort_at: created_at,
            cid,
        })
        .await?;

    create_mention_notifications(ctx, uri, did, record).await;
    create_quote_notification(ctx, uri, did, record).await;

    ctx.processor.flush_post_dependents(uri).await;

    Ok(())
}

async fn handle_reply(ctx: &PluginCtx<'_>, uri: &str, author_did: &str, reply: &Value) {
    let Some(parent_uri) = reply.get("parent").and_then(|p| p.get("uri")).and_then(|u| u.as_str())
    else {
        return;
    };
    let root_uri = reply
        .get("root")
        .and_then(|r| r.get("uri"))
        .and_then(|u| u.as_str());

    if let Ok(true) = try_reply_bookkeeping(ctx.storage, uri, parent_uri, author_did, root_uri).await {
        ctx.processor
            .defer_reply_bookkeeping(uri, parent_uri, author_did, root_uri)
            .await;
    }
}

/// Attempt the reply's parent-side bookkeeping: bump the parent's
/// `replyCount`, notify its author, and record thread-context if the root
/// post is also indexed. Returns `Ok(true)` if the parent isn't indexed
/// yet — the caller should defer and retry once it is — `Ok(false)` once
/// bookkeeping has run (regardless of whether the notification/thread-
/// context sub-steps individually succeeded).
pub(crate) async fn try_reply_bookkeeping(
    storage: &dyn Storage,
    uri: &str,
    parent_uri: &str,
    author_did: &str,
    root_uri: Option<&str>,
) -> CoreResult<bool> {
    let Some(parent) = storage.get_post(parent_uri).await? else {
        return Ok(true);
    };

    if storage
        .increment_post_aggregation(parent_uri, AggregationField::ReplyCount, 1)
        .await
        .is_ok()
        && parent.author_did != author_did
    {
        let _ = storage
            .create_notification(NotificationRow {
                uri: format!("{}#reply", uri),
                recipient_did: parent.author_did.clone(),
                author_did: author_did.to_string(),
                reason: NotificationReason::Reply,
                reason_subject: Some(parent_uri.to_string()),
                cid: None,
                created_at: Utc::now(),
            })
            .await;
    }

    if let Some(root_uri) = root_uri {
        if storage.get_post(root_uri).await.ok().flatten().is_some() {
            let root_author_like_uri = storage.get_like_uri(author_did, root_uri).await.unwrap_or(None);
            let _ = storage.create_thread_context(uri, root_author_like_uri).await;
        }
    }

    Ok(false)
}

async fn create_mention_notifications(ctx: &PluginCtx<'_>, uri: &str, author_did: &str, record: &Value) {
    let Some(facets) = record.get("facets").and_then(|f| f.as_array()) else {
        return;
    };
    for facet in facets {
        let Some(features) = facet.get("features").and_then(|f| f.as_array()) else {
            continue;
        };
        for feature in features {
            let is_mention = feature
                .get("$type")
                .and_then(|t| t.as_str())
                .map(|t| t == "app.bsky.richtext.facet#mention")
                .unwrap_or(false);
            if !is_mention {
                continue;
            }
            let Some(recipient) = feature.get("did").and_then(|d| d.as_str()) else {
                continue;
            };
            if recipient == author_did {
                continue;
            }
            if ctx.storage.get_user(recipient).await.ok().flatten().is_some() {
                let _ = ctx
                    .storage
                    .create_notification(NotificationRow {
                        uri: format!("{}#mention-{}", uri, recipient),
                        recipient_did: recipient.to_string(),
                        author_did: author_did.to_string(),
                        reason: NotificationReason::Mention,
                        reason_subject: Some(uri.to_string()),
                        cid: None,
                        created_at: ctx.now,
                    })
                    .await;
            }
        }
    }
}

async fn create_quote_notification(ctx: &PluginCtx<'_>, uri: &str, author_did: &str, record: &Value) {
    let Some(quoted_uri) = record
        .get("embed")
        .and_then(|e| e.get("record"))
        .and_then(|r| r.get("record").or(Some(r)))
        .and_then(|r| r.get("uri"))
        .and_then(|u| u.as_str())
    else {
        return;
    };

    match ctx.storage.get_post(quoted_uri).await {
        Ok(Some(quoted)) => {
            let _ = ctx
                .storage
                .increment_post_aggregation(quoted_uri, AggregationField::QuoteCount, 1)
                .await;
            if quoted.author_did != author_did {
                let _ = ctx
                    .storage
                    .create_notification(NotificationRow {
                        uri: format!("{}#quote", uri),
                        recipient_did: quoted.author_did,
                        author_did: author_did.to_string(),
                        reason: NotificationReason::Quote,
                        reason_subject: Some(quoted_uri.to_string()),
                        cid: None,
                        created_at: ctx.now,
                    })
                    .await;
            }
        }
        _ => {}
    }
}

pub async fn delete(storage: &dyn crate::storage::Storage, uri: &str, owner_did: &str) -> CoreResult<()> {
    storage.delete_feed_item(uri).await?;
    storage.delete_post(uri, owner_did).await
}
