use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::cursor::CursorState;
use crate::error::{CoreError, CoreResult};

use super::{
    AggregationField, FeedItemKind, FeedItemRow, NotificationReason, NotificationRow,
    PostAggregationRow, RecordRow, Storage, UserPatch, UserRow, UserSettingsRow, ViewerStatePatch,
};

/// Postgres-backed implementation of the storage contract, built the way
/// `rsky-indexer`'s plugins reach their pool: a `deadpool_postgres::Pool`
/// handed to every call, `client.execute`/`query_opt` with parameterized
/// SQL, unique/foreign-key violations surfaced via `tokio_postgres::Error`
/// and reclassified by `crate::error::classify_pg_error` at the call site
/// that needs to branch on them (`ensureUser`, the per-lexicon handlers).
pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> CoreResult<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }
}

fn user_from_row(row: &Row) -> UserRow {
    UserRow {
        did: row.get("did"),
        handle: row.get("handle"),
        display_name: row.get("display_name"),
        description: row.get("description"),
        avatar_cid: row.get("avatar_cid"),
        banner_cid: row.get("banner_cid"),
        profile_record: row.get("profile_record"),
        created_at: row.get("created_at"),
        indexed_at: row.get("indexed_at"),
    }
}

fn record_from_row(row: &Row) -> RecordRow {
    RecordRow {
        uri: row.get("uri"),
        cid: row.get("cid"),
        author_did: row.get("author_did"),
        created_at: row.get("created_at"),
        indexed_at: row.get("indexed_at"),
        record: row.get("record"),
    }
}

fn aggregation_field_column(field: AggregationField) -> &'static str {
    match field {
        AggregationField::LikeCount => "like_count",
        AggregationField::RepostCount => "repost_count",
        AggregationField::ReplyCount => "reply_count",
        AggregationField::BookmarkCount => "bookmark_count",
        AggregationField::QuoteCount => "quote_count",
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get_user(&self, did: &str) -> CoreResult<Option<UserRow>> {
        let client = self.client().await?;
        let row = client
            .query_opt("select * from users where did = $1", &[&did])
            .await
            .map_err(CoreError::from_pg)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn create_user(&self, row: UserRow) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into users (did, handle, display_name, description, avatar_cid, banner_cid, profile_record, created_at, indexed_at)
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &row.did,
                    &row.handle,
                    &row.display_name,
                    &row.description,
                    &row.avatar_cid,
                    &row.banner_cid,
                    &row.profile_record,
                    &row.created_at,
                    &row.indexed_at,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn update_user(&self, did: &str, patch: UserPatch) -> CoreResult<()> {
        let client = self.client().await?;
        if let Some(handle) = &patch.handle {
            client
                .execute("update users set handle = $1 where did = $2", &[handle, &did])
                .await
                .map_err(CoreError::from_pg)?;
        }
        if let Some(display_name) = &patch.display_name {
            client
                .execute(
                    "update users set display_name = $1 where did = $2",
                    &[display_name, &did],
                )
                .await
                .map_err(CoreError::from_pg)?;
        }
        if let Some(description) = &patch.description {
            client
                .execute(
                    "update users set description = $1 where did = $2",
                    &[description, &did],
                )
                .await
                .map_err(CoreError::from_pg)?;
        }
        if let Some(avatar_cid) = &patch.avatar_cid {
            client
                .execute(
                    "update users set avatar_cid = $1 where did = $2",
                    &[avatar_cid, &did],
                )
                .await
                .map_err(CoreError::from_pg)?;
        }
        if let Some(banner_cid) = &patch.banner_cid {
            client
                .execute(
                    "update users set banner_cid = $1 where did = $2",
                    &[banner_cid, &did],
                )
                .await
                .map_err(CoreError::from_pg)?;
        }
        if let Some(profile_record) = &patch.profile_record {
            client
                .execute(
                    "update users set profile_record = $1 where did = $2",
                    &[profile_record, &did],
                )
                .await
                .map_err(CoreError::from_pg)?;
        }
        Ok(())
    }

    async fn upsert_user_handle(&self, did: &str, handle: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "update users set handle = $1 where did = $2",
                &[&handle, &did],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn get_post(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        get_record(&self.client().await?, "posts", uri).await
    }

    async fn create_post(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "posts", &row).await
    }

    async fn delete_post(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "posts", uri, owner_did).await
    }

    async fn get_like(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        get_record(&self.client().await?, "likes", uri).await
    }

    async fn create_like(&self, row: RecordRow, subject_uri: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into likes (uri, cid, author_did, subject_uri, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &subject_uri,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_like(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "likes", uri, owner_did).await
    }

    async fn get_like_uri(&self, user_did: &str, post_uri: &str) -> CoreResult<Option<String>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "select uri from likes where author_did = $1 and subject_uri = $2",
                &[&user_did, &post_uri],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(row.map(|r| r.get("uri")))
    }

    async fn get_repost(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        get_record(&self.client().await?, "reposts", uri).await
    }

    async fn create_repost(&self, row: RecordRow, subject_uri: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into reposts (uri, cid, author_did, subject_uri, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &subject_uri,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_repost(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "reposts", uri, owner_did).await
    }

    async fn get_bookmark(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        get_record(&self.client().await?, "bookmarks", uri).await
    }

    async fn create_bookmark(&self, row: RecordRow, subject_uri: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into bookmarks (uri, cid, author_did, subject_uri, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &subject_uri,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_bookmark(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "bookmarks", uri, owner_did).await
    }

    async fn create_follow(&self, row: RecordRow, subject_did: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into follows (uri, cid, author_did, subject_did, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &subject_did,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_follow(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "follows", uri, owner_did).await
    }

    async fn create_block(&self, row: RecordRow, subject_did: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into blocks (uri, cid, author_did, subject_did, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &subject_did,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_block(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "blocks", uri, owner_did).await
    }

    async fn get_list(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        get_record(&self.client().await?, "lists", uri).await
    }

    async fn create_list(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "lists", &row).await
    }

    async fn delete_list(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "lists", uri, owner_did).await
    }

    async fn create_list_item(&self, row: RecordRow, list_uri: &str, subject_did: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into list_items (uri, cid, author_did, list_uri, subject_did, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &list_uri,
                    &subject_did,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_list_item(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "list_items", uri, owner_did).await
    }

    async fn create_list_block(&self, row: RecordRow, subject_did: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into list_blocks (uri, cid, author_did, subject_did, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &subject_did,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_list_block(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "list_blocks", uri, owner_did).await
    }

    async fn create_feed_generator(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "feed_generators", &row).await
    }

    async fn delete_feed_generator(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "feed_generators", uri, owner_did).await
    }

    async fn create_starter_pack(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "starter_packs", &row).await
    }

    async fn delete_starter_pack(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "starter_packs", uri, owner_did).await
    }

    async fn create_labeler_service(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "labeler_services", &row).await
    }

    async fn delete_labeler_service(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "labeler_services", uri, owner_did).await
    }

    async fn create_verification(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "verifications", &row).await
    }

    async fn delete_verification(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "verifications", uri, owner_did).await
    }

    async fn create_thread_gate(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "thread_gates", &row).await
    }

    async fn delete_thread_gate(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "thread_gates", uri, owner_did).await
    }

    async fn create_post_gate(&self, row: RecordRow) -> CoreResult<()> {
        insert_record(&self.client().await?, "post_gates", &row).await
    }

    async fn delete_post_gate(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "post_gates", uri, owner_did).await
    }

    async fn upsert_chat_declaration(&self, row: RecordRow) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into chat_declarations (author_did, uri, cid, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6)
                 on conflict (author_did) do update set
                   uri = excluded.uri, cid = excluded.cid, indexed_at = excluded.indexed_at, record = excluded.record",
                &[&row.author_did, &row.uri, &row.cid, &row.created_at, &row.indexed_at, &row.record],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_chat_declaration(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "chat_declarations", uri, owner_did).await
    }

    async fn upsert_notif_declaration(&self, row: RecordRow) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into notif_declarations (author_did, uri, cid, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6)
                 on conflict (author_did) do update set
                   uri = excluded.uri, cid = excluded.cid, indexed_at = excluded.indexed_at, record = excluded.record",
                &[&row.author_did, &row.uri, &row.cid, &row.created_at, &row.indexed_at, &row.record],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_notif_declaration(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "notif_declarations", uri, owner_did).await
    }

    async fn upsert_actor_status(&self, row: RecordRow) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into actor_statuses (author_did, uri, cid, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6)
                 on conflict (author_did) do update set
                   uri = excluded.uri, cid = excluded.cid, indexed_at = excluded.indexed_at, record = excluded.record",
                &[&row.author_did, &row.uri, &row.cid, &row.created_at, &row.indexed_at, &row.record],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_actor_status(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "actor_statuses", uri, owner_did).await
    }

    async fn create_generic_record(&self, row: RecordRow, collection: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into generic_records (uri, cid, author_did, collection, created_at, indexed_at, record)
                 values ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &row.uri,
                    &row.cid,
                    &row.author_did,
                    &collection,
                    &row.created_at,
                    &row.indexed_at,
                    &row.record,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_generic_record(&self, uri: &str, owner_did: &str) -> CoreResult<()> {
        delete_owned(&self.client().await?, "generic_records", uri, owner_did).await
    }

    async fn apply_label(&self, src: &str, uri: &str, val: &str, neg: bool, cts: DateTime<Utc>) -> CoreResult<()> {
        let client = self.client().await?;
        if neg {
            client
                .execute(
                    "delete from labels where src = $1 and uri = $2 and val = $3",
                    &[&src, &uri, &val],
                )
                .await
                .map_err(CoreError::from_pg)?;
        } else {
            client
                .execute(
                    "insert into labels (src, uri, val, created_at)
                     values ($1, $2, $3, $4)
                     on conflict (src, uri, val) do update set created_at = excluded.created_at",
                    &[&src, &uri, &val, &cts],
                )
                .await
                .map_err(CoreError::from_pg)?;
        }
        Ok(())
    }

    async fn create_post_aggregation(&self, post_uri: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into post_aggregations (post_uri, like_count, repost_count, reply_count, bookmark_count, quote_count)
                 values ($1, 0, 0, 0, 0, 0)
                 on conflict (post_uri) do nothing",
                &[&post_uri],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn increment_post_aggregation(
        &self,
        post_uri: &str,
        field: AggregationField,
        delta: i64,
    ) -> CoreResult<()> {
        let client = self.client().await?;
        let column = aggregation_field_column(field);
        let sql = format!(
            "update post_aggregations set {column} = {column} + $1 where post_uri = $2"
        );
        client
            .execute(&sql, &[&delta, &post_uri])
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn get_post_aggregations(
        &self,
        uris: &[String],
    ) -> CoreResult<HashMap<String, PostAggregationRow>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "select * from post_aggregations where post_uri = any($1)",
                &[&uris],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let post_uri: String = row.get("post_uri");
                (
                    post_uri.clone(),
                    PostAggregationRow {
                        post_uri,
                        like_count: row.get("like_count"),
                        repost_count: row.get("repost_count"),
                        reply_count: row.get("reply_count"),
                        bookmark_count: row.get("bookmark_count"),
                        quote_count: row.get("quote_count"),
                    },
                )
            })
            .collect())
    }

    async fn create_post_viewer_state(
        &self,
        post_uri: &str,
        viewer_did: &str,
        patch: ViewerStatePatch,
    ) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into post_viewer_states (post_uri, viewer_did, like_uri, repost_uri, bookmarked, thread_muted, reply_disabled, embedding_disabled, pinned)
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 on conflict (post_uri, viewer_did) do update set
                   like_uri = coalesce(excluded.like_uri, post_viewer_states.like_uri),
                   repost_uri = coalesce(excluded.repost_uri, post_viewer_states.repost_uri),
                   bookmarked = coalesce(excluded.bookmarked, post_viewer_states.bookmarked),
                   thread_muted = coalesce(excluded.thread_muted, post_viewer_states.thread_muted),
                   reply_disabled = coalesce(excluded.reply_disabled, post_viewer_states.reply_disabled),
                   embedding_disabled = coalesce(excluded.embedding_disabled, post_viewer_states.embedding_disabled),
                   pinned = coalesce(excluded.pinned, post_viewer_states.pinned)",
                &[
                    &post_uri,
                    &viewer_did,
                    &patch.like_uri.flatten(),
                    &patch.repost_uri.flatten(),
                    &patch.bookmarked.unwrap_or(false),
                    &patch.thread_muted.unwrap_or(false),
                    &patch.reply_disabled.unwrap_or(false),
                    &patch.embedding_disabled.unwrap_or(false),
                    &patch.pinned.unwrap_or(false),
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn create_feed_item(&self, row: FeedItemRow) -> CoreResult<()> {
        let client = self.client().await?;
        let kind = match row.kind {
            FeedItemKind::Post => "post",
            FeedItemKind::Repost => "repost",
        };
        client
            .execute(
                "insert into feed_items (uri, post_uri, originator_did, kind, sort_at, cid)
                 values ($1, $2, $3, $4, $5, $6)",
                &[&row.uri, &row.post_uri, &row.originator_did, &kind, &row.sort_at, &row.cid],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_feed_item(&self, uri: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute("delete from feed_items where uri = $1", &[&uri])
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn create_thread_context(&self, reply_post_uri: &str, root_author_like_uri: Option<String>) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into thread_contexts (reply_post_uri, root_author_like_uri)
                 values ($1, $2)
                 on conflict (reply_post_uri) do update set root_author_like_uri = excluded.root_author_like_uri",
                &[&reply_post_uri, &root_author_like_uri],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn create_notification(&self, row: NotificationRow) -> CoreResult<()> {
        let client = self.client().await?;
        let reason = match row.reason {
            NotificationReason::Like => "like",
            NotificationReason::Repost => "repost",
            NotificationReason::Follow => "follow",
            NotificationReason::Mention => "mention",
            NotificationReason::Reply => "reply",
            NotificationReason::Quote => "quote",
            NotificationReason::StarterpackJoined => "starterpack-joined",
        };
        client
            .execute(
                "insert into notifications (uri, recipient_did, author_did, reason, reason_subject, cid, is_read, created_at)
                 values ($1, $2, $3, $4, $5, $6, false, $7)",
                &[
                    &row.uri,
                    &row.recipient_did,
                    &row.author_did,
                    &reason,
                    &row.reason_subject,
                    &row.cid,
                    &row.created_at,
                ],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn delete_notifications_for_record(&self, subject_uri: &str) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "delete from notifications where reason_subject = $1",
                &[&subject_uri],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn get_firehose_cursor(&self, service: &str) -> CoreResult<Option<CursorState>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "select cursor, last_event_time from firehose_cursors where service = $1",
                &[&service],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(row.map(|r| CursorState {
            cursor: r.get("cursor"),
            last_event_time: r.get("last_event_time"),
        }))
    }

    async fn save_firehose_cursor(&self, service: &str, state: CursorState) -> CoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "insert into firehose_cursors (service, cursor, last_event_time)
                 values ($1, $2, $3)
                 on conflict (service) do update set cursor = excluded.cursor, last_event_time = excluded.last_event_time",
                &[&service, &state.cursor, &state.last_event_time],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(())
    }

    async fn get_user_settings(&self, did: &str) -> CoreResult<Option<UserSettingsRow>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "select did, data_collection_forbidden from user_settings where did = $1",
                &[&did],
            )
            .await
            .map_err(CoreError::from_pg)?;
        Ok(row.map(|r| UserSettingsRow {
            did: r.get("did"),
            data_collection_forbidden: r.get("data_collection_forbidden"),
        }))
    }
}

#[async_trait]
impl crate::cursor::CursorStore for PostgresStorage {
    async fn load(&self, service: &str) -> CoreResult<Option<CursorState>> {
        self.get_firehose_cursor(service).await
    }

    async fn save(&self, service: &str, state: CursorState) -> CoreResult<()> {
        self.save_firehose_cursor(service, state).await
    }
}

async fn get_record(
    client: &deadpool_postgres::Client,
    table: &str,
    uri: &str,
) -> CoreResult<Option<RecordRow>> {
    let sql = format!("select * from {table} where uri = $1");
    let row = client
        .query_opt(&sql, &[&uri])
        .await
        .map_err(CoreError::from_pg)?;
    Ok(row.as_ref().map(record_from_row))
}

async fn insert_record(
    client: &deadpool_postgres::Client,
    table: &str,
    row: &RecordRow,
) -> CoreResult<()> {
    let sql = format!(
        "insert into {table} (uri, cid, author_did, created_at, indexed_at, record) values ($1, $2, $3, $4, $5, $6)"
    );
    client
        .execute(
            &sql,
            &[
                &row.uri,
                &row.cid,
                &row.author_did,
                &row.created_at,
                &row.indexed_at,
                &row.record,
            ],
        )
        .await
        .map_err(CoreError::from_pg)?;
    Ok(())
}

/// Ownership-verified delete: the `WHERE` clause includes the caller's DID
/// so a delete can't be used to remove another DID's record by forging the
/// URI.
async fn delete_owned(
    client: &deadpool_postgres::Client,
    table: &str,
    uri: &str,
    owner_did: &str,
) -> CoreResult<()> {
    let sql = format!("delete from {table} where uri = $1 and author_did = $2");
    client
        .execute(&sql, &[&uri, &owner_did])
        .await
        .map_err(CoreError::from_pg)?;
    Ok(())
}
