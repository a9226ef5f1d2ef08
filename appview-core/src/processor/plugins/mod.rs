pub mod block;
pub mod bookmark;
pub mod chat_declaration;
pub mod feed_generator;
pub mod follow;
pub mod generic;
pub mod label;
pub mod labeler_service;
pub mod like;
pub mod list;
pub mod list_block;
pub mod list_item;
pub mod notif_declaration;
pub mod post;
pub mod post_gate;
pub mod profile;
pub mod repost;
pub mod starter_pack;
pub mod status;
pub mod thread_gate;
pub mod verification;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreResult;
use crate::storage::Storage;

use super::EventProcessor;

/// Shared inputs every per-lexicon handler needs. Grounded in
/// `rsky_indexer::indexing::mod::RecordPlugin`'s signature
/// (`storage`/`options`/`record`), generalized here so a handler can also
/// call back into the processor for `ensure_user` and for triggering a
/// deferred-queue flush (both need an `Arc<EventProcessor>` to move into a
/// spawned replay closure).
pub struct PluginCtx<'a> {
    pub storage: &'a dyn Storage,
    pub processor: Arc<EventProcessor>,
    pub now: DateTime<Utc>,
}

/// Dispatch a create/update op to its per-lexicon handler by collection.
/// Unknown collections fall through to the generic-record table.
pub async fn dispatch_create(
    ctx: &PluginCtx<'_>,
    collection: &str,
    did: &str,
    path: &str,
    cid: Option<&str>,
    record: &Value,
) -> CoreResult<()> {
    let uri = format!("at://{}/{}", did, path);

    match collection {
        "app.bsky.feed.post" => post::create(ctx, &uri, did, cid, record).await,
        "app.bsky.feed.like" => like::create(ctx, &uri, did, cid, record).await,
        "app.bsky.feed.repost" => repost::create(ctx, &uri, did, cid, record).await,
        "app.bsky.bookmark" | "app.bsky.feed.bookmark" => {
            bookmark::create(ctx, &uri, did, cid, record).await
        }
        "app.bsky.graph.follow" => follow::create(ctx, &uri, did, cid, record).await,
        "app.bsky.graph.block" => block::create(ctx, &uri, did, cid, record).await,
        "app.bsky.graph.list" => list::create(ctx, &uri, did, cid, record).await,
        "app.bsky.graph.listitem" => list_item::create(ctx, &uri, did, cid, record).await,
        "app.bsky.graph.listblock" => list_block::create(ctx, &uri, did, cid, record).await,
        "app.bsky.actor.profile" => profile::create(ctx, &uri, did, cid, record).await,
        "app.bsky.feed.generator" => feed_generator::create(ctx, &uri, did, cid, record).await,
        "app.bsky.graph.starterpack" => starter_pack::create(ctx, &uri, did, cid, record).await,
        "app.bsky.labeler.service" => labeler_service::create(ctx, &uri, did, cid, record).await,
        "app.bsky.graph.verification" => verification::create(ctx, &uri, did, cid, record).await,
        "app.bsky.feed.threadgate" => thread_gate::create(ctx, &uri, did, cid, record).await,
        "app.bsky.feed.postgate" => post_gate::create(ctx, &uri, did, cid, record).await,
        "chat.bsky.actor.declaration" => chat_declaration::create(ctx, &uri, did, cid, record).await,
        "app.bsky.notification.declaration" => {
            notif_declaration::create(ctx, &uri, did, cid, record).await
        }
        "app.bsky.actor.status" => status::create(ctx, &uri, did, cid, record).await,
        "com.atproto.label.label" => label::apply(ctx, record).await,
        _ => generic::create(ctx, &uri, did, cid, record, collection).await,
    }
}

pub(crate) fn resolve_cid(explicit: Option<&str>, did: &str, path: &str, record: &Value) -> String {
    explicit
        .map(|s| s.to_string())
        .or_else(|| record.get("cid").and_then(|v| crate::cid::extract_cid(v)))
        .unwrap_or_else(|| {
            let body = record.to_string();
            crate::cid::synthesize_cid(&body, did, path)
        })
}
