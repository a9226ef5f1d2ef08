pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cursor::CursorState;
use crate::error::CoreResult;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar_cid: Option<String>,
    pub banner_cid: Option<String>,
    pub profile_record: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

impl UserRow {
    /// The placeholder handle assigned at creation time, ahead of
    /// background profile enrichment.
    pub const INVALID_HANDLE: &'static str = "handle.invalid";

    pub fn placeholder(did: &str, now: DateTime<Utc>) -> Self {
        Self {
            did: did.to_string(),
            handle: Self::INVALID_HANDLE.to_string(),
            display_name: None,
            description: None,
            avatar_cid: None,
            banner_cid: None,
            profile_record: None,
            created_at: now,
            indexed_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserPatch {
    pub handle: Option<String>,
    pub display_name: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub avatar_cid: Option<Option<String>>,
    pub banner_cid: Option<Option<String>>,
    pub profile_record: Option<Option<Value>>,
}

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    pub record: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationField {
    LikeCount,
    RepostCount,
    ReplyCount,
    BookmarkCount,
    QuoteCount,
}

#[derive(Debug, Clone, Default)]
pub struct PostAggregationRow {
    pub post_uri: String,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    pub bookmark_count: i64,
    pub quote_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ViewerStatePatch {
    pub like_uri: Option<Option<String>>,
    pub repost_uri: Option<Option<String>>,
    pub bookmarked: Option<bool>,
    pub thread_muted: Option<bool>,
    pub reply_disabled: Option<bool>,
    pub embedding_disabled: Option<bool>,
    pub pinned: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedItemKind {
    Post,
    Repost,
}

#[derive(Debug, Clone)]
pub struct FeedItemRow {
    pub uri: String,
    pub post_uri: String,
    pub originator_did: String,
    pub kind: FeedItemKind,
    pub sort_at: DateTime<Utc>,
    pub cid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    Like,
    Repost,
    Follow,
    Mention,
    Reply,
    Quote,
    StarterpackJoined,
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub uri: String,
    pub recipient_did: String,
    pub author_did: String,
    pub reason: NotificationReason,
    pub reason_subject: Option<String>,
    pub cid: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserSettingsRow {
    pub did: String,
    pub data_collection_forbidden: bool,
}

/// The downstream storage contract the core consumes. Every method that
/// inserts a uniquely-keyed row is expected to surface a code-bearing
/// error distinguishing unique-constraint conflicts (`23505`) from
/// foreign-key-reference failures (`23503`) — `CoreError::is_unique_violation`
/// / `is_foreign_key_violation` classify the result.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_user(&self, did: &str) -> CoreResult<Option<UserRow>>;
    async fn create_user(&self, row: UserRow) -> CoreResult<()>;
    async fn update_user(&self, did: &str, patch: UserPatch) -> CoreResult<()>;
    async fn upsert_user_handle(&self, did: &str, handle: &str) -> CoreResult<()>;

    async fn get_post(&self, uri: &str) -> CoreResult<Option<RecordRow>>;
    async fn create_post(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_post(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn get_like(&self, uri: &str) -> CoreResult<Option<RecordRow>>;
    async fn create_like(&self, row: RecordRow, subject_uri: &str) -> CoreResult<()>;
    async fn delete_like(&self, uri: &str, owner_did: &str) -> CoreResult<()>;
    async fn get_like_uri(&self, user_did: &str, post_uri: &str) -> CoreResult<Option<String>>;

    async fn get_repost(&self, uri: &str) -> CoreResult<Option<RecordRow>>;
    async fn create_repost(&self, row: RecordRow, subject_uri: &str) -> CoreResult<()>;
    async fn delete_repost(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn get_bookmark(&self, uri: &str) -> CoreResult<Option<RecordRow>>;
    async fn create_bookmark(&self, row: RecordRow, subject_uri: &str) -> CoreResult<()>;
    async fn delete_bookmark(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_follow(&self, row: RecordRow, subject_did: &str) -> CoreResult<()>;
    async fn delete_follow(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_block(&self, row: RecordRow, subject_did: &str) -> CoreResult<()>;
    async fn delete_block(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn get_list(&self, uri: &str) -> CoreResult<Option<RecordRow>>;
    async fn create_list(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_list(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_list_item(&self, row: RecordRow, list_uri: &str, subject_did: &str) -> CoreResult<()>;
    async fn delete_list_item(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_list_block(&self, row: RecordRow, subject_did: &str) -> CoreResult<()>;
    async fn delete_list_block(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_feed_generator(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_feed_generator(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_starter_pack(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_starter_pack(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_labeler_service(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_labeler_service(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_verification(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_verification(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_thread_gate(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_thread_gate(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_post_gate(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_post_gate(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn upsert_chat_declaration(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_chat_declaration(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn upsert_notif_declaration(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_notif_declaration(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn upsert_actor_status(&self, row: RecordRow) -> CoreResult<()>;
    async fn delete_actor_status(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn create_generic_record(&self, row: RecordRow, collection: &str) -> CoreResult<()>;
    async fn delete_generic_record(&self, uri: &str, owner_did: &str) -> CoreResult<()>;

    async fn apply_label(&self, src: &str, uri: &str, val: &str, neg: bool, cts: DateTime<Utc>) -> CoreResult<()>;

    async fn create_post_aggregation(&self, post_uri: &str) -> CoreResult<()>;
    async fn increment_post_aggregation(
        &self,
        post_uri: &str,
        field: AggregationField,
        delta: i64,
    ) -> CoreResult<()>;
    async fn get_post_aggregations(
        &self,
        uris: &[String],
    ) -> CoreResult<std::collections::HashMap<String, PostAggregationRow>>;

    async fn create_post_viewer_state(
        &self,
        post_uri: &str,
        viewer_did: &str,
        patch: ViewerStatePatch,
    ) -> CoreResult<()>;

    async fn create_feed_item(&self, row: FeedItemRow) -> CoreResult<()>;
    async fn delete_feed_item(&self, uri: &str) -> CoreResult<()>;

    async fn create_thread_context(&self, reply_post_uri: &str, root_author_like_uri: Option<String>) -> CoreResult<()>;

    async fn create_notification(&self, row: NotificationRow) -> CoreResult<()>;
    async fn delete_notifications_for_record(&self, subject_uri: &str) -> CoreResult<()>;

    async fn get_firehose_cursor(&self, service: &str) -> CoreResult<Option<CursorState>>;
    async fn save_firehose_cursor(&self, service: &str, state: CursorState) -> CoreResult<()>;

    async fn get_user_settings(&self, did: &str) -> CoreResult<Option<UserSettingsRow>>;
}
