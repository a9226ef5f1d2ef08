use std::collections::HashMap;
use std::sync::Arc;

use appview_core::deferred::DeferredOpReconciler;
use appview_core::error::{CoreError, CoreResult};
use appview_core::identity::IdentityResolver;
use appview_core::opt_out::OptOutCache;
use appview_core::processor::{CommitEvent, EventProcessor, OpAction, RepoOp};
use appview_core::storage::{
    AggregationField, FeedItemRow, NotificationRow, PostAggregationRow, RecordRow, Storage,
    UserPatch, UserRow, UserSettingsRow, ViewerStatePatch,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

/// Minimal in-process `Storage` standing in for Postgres, just enough to
/// drive the properties the test suite cares about: user dedupe, like/post
/// aggregation, opt-out, and cursor persistence.
#[derive(Default)]
struct InMemoryStorage {
    users: Mutex<HashMap<String, UserRow>>,
    settings: Mutex<HashMap<String, UserSettingsRow>>,
    posts: Mutex<HashMap<String, RecordRow>>,
    likes: Mutex<HashMap<String, RecordRow>>,
    aggregations: Mutex<HashMap<String, PostAggregationRow>>,
    notifications: Mutex<Vec<NotificationRow>>,
    feed_items: Mutex<HashMap<String, FeedItemRow>>,
    cursor: Mutex<HashMap<String, appview_core::cursor::CursorState>>,
}

fn unique_violation() -> CoreError {
    CoreError::Database(anyhow::anyhow!(
        "duplicate key value violates unique constraint (23505)"
    ))
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn get_user(&self, did: &str) -> CoreResult<Option<UserRow>> {
        Ok(self.users.lock().await.get(did).cloned())
    }

    async fn create_user(&self, row: UserRow) -> CoreResult<()> {
        let mut users = self.users.lock().await;
        if users.contains_key(&row.did) {
            return Err(unique_violation());
        }
        users.insert(row.did.clone(), row);
        Ok(())
    }

    async fn update_user(&self, did: &str, patch: UserPatch) -> CoreResult<()> {
        let mut users = self.users.lock().await;
        if let Some(row) = users.get_mut(did) {
            if let Some(handle) = patch.handle {
                row.handle = handle;
            }
            if let Some(display_name) = patch.display_name {
                row.display_name = display_name;
            }
            if let Some(description) = patch.description {
                row.description = description;
            }
            if let Some(avatar_cid) = patch.avatar_cid {
                row.avatar_cid = avatar_cid;
            }
            if let Some(banner_cid) = patch.banner_cid {
                row.banner_cid = banner_cid;
            }
            if let Some(profile_record) = patch.profile_record {
                row.profile_record = profile_record;
            }
        }
        Ok(())
    }

    async fn upsert_user_handle(&self, did: &str, handle: &str) -> CoreResult<()> {
        if let Some(row) = self.users.lock().await.get_mut(did) {
            row.handle = handle.to_string();
        }
        Ok(())
    }

    async fn get_post(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        Ok(self.posts.lock().await.get(uri).cloned())
    }

    async fn create_post(&self, row: RecordRow) -> CoreResult<()> {
        let mut posts = self.posts.lock().await;
        if posts.contains_key(&row.uri) {
            return Err(unique_violation());
        }
        posts.insert(row.uri.clone(), row);
        Ok(())
    }

    async fn delete_post(&self, uri: &str, _owner_did: &str) -> CoreResult<()> {
        self.posts.lock().await.remove(uri);
        Ok(())
    }

    async fn get_like(&self, uri: &str) -> CoreResult<Option<RecordRow>> {
        Ok(self.likes.lock().await.get(uri).cloned())
    }

    async fn create_like(&self, row: RecordRow, _subject_uri: &str) -> CoreResult<()> {
        let mut likes = self.likes.lock().await;
        if likes.contains_key(&row.uri) {
            return Err(unique_violation());
        }
        likes.insert(row.uri.clone(), row);
        Ok(())
    }

    async fn delete_like(&self, uri: &str, _owner_did: &str) -> CoreResult<()> {
        self.likes.lock().await.remove(uri);
        Ok(())
    }

    async fn get_like_uri(&self, _user_did: &str, _post_uri: &str) -> CoreResult<Option<String>> {
        Ok(None)
    }

    async fn get_repost(&self, _uri: &str) -> CoreResult<Option<RecordRow>> {
        Ok(None)
    }
    async fn create_repost(&self, _row: RecordRow, _subject_uri: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_repost(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn get_bookmark(&self, _uri: &str) -> CoreResult<Option<RecordRow>> {
        Ok(None)
    }
    async fn create_bookmark(&self, _row: RecordRow, _subject_uri: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_bookmark(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_follow(&self, _row: RecordRow, _subject_did: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_follow(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_block(&self, _row: RecordRow, _subject_did: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_block(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn get_list(&self, _uri: &str) -> CoreResult<Option<RecordRow>> {
        Ok(None)
    }
    async fn create_list(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_list(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_list_item(&self, _row: RecordRow, _list_uri: &str, _subject_did: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_list_item(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_list_block(&self, _row: RecordRow, _subject_did: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_list_block(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_feed_generator(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_feed_generator(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_starter_pack(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_starter_pack(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_labeler_service(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_labeler_service(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_verification(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_verification(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_thread_gate(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_thread_gate(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_post_gate(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_post_gate(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn upsert_chat_declaration(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_chat_declaration(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn upsert_notif_declaration(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_notif_declaration(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn upsert_actor_status(&self, _row: RecordRow) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_actor_status(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn create_generic_record(&self, _row: RecordRow, _collection: &str) -> CoreResult<()> {
        Ok(())
    }
    async fn delete_generic_record(&self, _uri: &str, _owner_did: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn apply_label(
        &self,
        _src: &str,
        _uri: &str,
        _val: &str,
        _neg: bool,
        _cts: chrono::DateTime<Utc>,
    ) -> CoreResult<()> {
        Ok(())
    }

    async fn create_post_aggregation(&self, post_uri: &str) -> CoreResult<()> {
        self.aggregations
            .lock()
            .await
            .entry(post_uri.to_string())
            .or_insert_with(|| PostAggregationRow {
                post_uri: post_uri.to_string(),
                ..Default::default()
            });
        Ok(())
    }

    async fn increment_post_aggregation(
        &self,
        post_uri: &str,
        field: AggregationField,
        delta: i64,
    ) -> CoreResult<()> {
        let mut aggs = self.aggregations.lock().await;
        let row = aggs.entry(post_uri.to_string()).or_insert_with(|| PostAggregationRow {
            post_uri: post_uri.to_string(),
            ..Default::default()
        });
        match field {
            AggregationField::LikeCount => row.like_count += delta,
            AggregationField::RepostCount => row.repost_count += delta,
            AggregationField::ReplyCount => row.reply_count += delta,
            AggregationField::BookmarkCount => row.bookmark_count += delta,
            AggregationField::QuoteCount => row.quote_count += delta,
        }
        Ok(())
    }

    async fn get_post_aggregations(
        &self,
        uris: &[String],
    ) -> CoreResult<HashMap<String, PostAggregationRow>> {
        let aggs = self.aggregations.lock().await;
        Ok(uris
            .iter()
            .filter_map(|u| aggs.get(u).map(|r| (u.clone(), r.clone())))
            .collect())
    }

    async fn create_post_viewer_state(
        &self,
        _post_uri: &str,
        _viewer_did: &str,
        _patch: ViewerStatePatch,
    ) -> CoreResult<()> {
        Ok(())
    }

    async fn create_feed_item(&self, row: FeedItemRow) -> CoreResult<()> {
        self.feed_items.lock().await.insert(row.uri.clone(), row);
        Ok(())
    }
    async fn delete_feed_item(&self, uri: &str) -> CoreResult<()> {
        self.feed_items.lock().await.remove(uri);
        Ok(())
    }

    async fn create_thread_context(&self, _reply_post_uri: &str, _root_author_like_uri: Option<String>) -> CoreResult<()> {
        Ok(())
    }

    async fn create_notification(&self, row: NotificationRow) -> CoreResult<()> {
        self.notifications.lock().await.push(row);
        Ok(())
    }
    async fn delete_notifications_for_record(&self, _subject_uri: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn get_firehose_cursor(&self, service: &str) -> CoreResult<Option<appview_core::cursor::CursorState>> {
        Ok(self.cursor.lock().await.get(service).cloned())
    }
    async fn save_firehose_cursor(&self, service: &str, state: appview_core::cursor::CursorState) -> CoreResult<()> {
        self.cursor.lock().await.insert(service.to_string(), state);
        Ok(())
    }

    async fn get_user_settings(&self, did: &str) -> CoreResult<Option<UserSettingsRow>> {
        Ok(self.settings.lock().await.get(did).cloned())
    }
}

fn processor() -> (Arc<EventProcessor>, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::default());
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let identity = IdentityResolver::new("https://plc.directory".to_string());
    let deferred = DeferredOpReconciler::new();
    let opt_out = OptOutCache::new();
    let processor = EventProcessor::new(dyn_storage, identity, deferred, opt_out, 8);
    (processor, storage)
}

fn post_record() -> serde_json::Value {
    json!({ "$type": "app.bsky.feed.post", "text": "hello", "createdAt": "2026-01-01T00:00:00Z" })
}

fn like_record(subject_uri: &str) -> serde_json::Value {
    json!({ "$type": "app.bsky.feed.like", "subject": { "uri": subject_uri, "cid": "bafycid" } })
}

/// S1: a like arrives before its subject post. It is queued; once the post
/// lands, the queue flushes and the aggregation row reflects exactly one
/// like. A duplicate delivery of the same like on reconnect is a no-op.
#[tokio::test]
async fn like_before_post_then_flush_then_idempotent_replay() {
    let (processor, storage) = processor();

    let post_uri = "at://did:plc:author/app.bsky.feed.post/1";
    let like_event = CommitEvent {
        repo: "did:plc:liker".to_string(),
        seq: 1,
        ops: vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.like/l1".to_string(),
            cid: Some("bafylike".to_string()),
            record: Some(like_record(post_uri)),
        }],
    };
    processor.process_commit(like_event.clone()).await;

    // Not yet indexed: no aggregation row exists for the post.
    assert!(storage
        .get_post_aggregations(&[post_uri.to_string()])
        .await
        .unwrap()
        .is_empty());

    let post_event = CommitEvent {
        repo: "did:plc:author".to_string(),
        seq: 2,
        ops: vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/1".to_string(),
            cid: Some("bafypost".to_string()),
            record: Some(post_record()),
        }],
    };
    processor.process_commit(post_event).await;

    let aggs = storage.get_post_aggregations(&[post_uri.to_string()]).await.unwrap();
    assert_eq!(aggs[post_uri].like_count, 1);

    // Redelivery of the same like is idempotent: the unique-violation path
    // swallows the duplicate insert, aggregation is unchanged.
    processor.process_commit(like_event).await;
    let aggs = storage.get_post_aggregations(&[post_uri.to_string()]).await.unwrap();
    assert_eq!(aggs[post_uri].like_count, 1);
}

/// A reply that arrives before its parent post doesn't lose its
/// `replyCount` bookkeeping: it's deferred on the parent's post-dependent
/// queue and flushed once the parent lands.
#[tokio::test]
async fn reply_before_parent_then_flush_increments_reply_count() {
    let (processor, storage) = processor();

    let parent_uri = "at://did:plc:author/app.bsky.feed.post/1";
    let reply_uri = "at://did:plc:replier/app.bsky.feed.post/2";
    let reply_event = CommitEvent {
        repo: "did:plc:replier".to_string(),
        seq: 1,
        ops: vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/2".to_string(),
            cid: Some("bafyreply".to_string()),
            record: Some(json!({
                "$type": "app.bsky.feed.post",
                "text": "re",
                "createdAt": "2026-01-01T00:00:01Z",
                "reply": {
                    "parent": { "uri": parent_uri, "cid": "bafyparent" },
                    "root": { "uri": parent_uri, "cid": "bafyparent" },
                },
            })),
        }],
    };
    processor.process_commit(reply_event).await;

    // The reply itself is indexed immediately, independent of its parent.
    assert!(storage.get_post(reply_uri).await.unwrap().is_some());
    assert!(storage
        .get_post_aggregations(&[parent_uri.to_string()])
        .await
        .unwrap()
        .is_empty());

    let post_event = CommitEvent {
        repo: "did:plc:author".to_string(),
        seq: 2,
        ops: vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/1".to_string(),
            cid: Some("bafypost".to_string()),
            record: Some(post_record()),
        }],
    };
    processor.process_commit(post_event).await;

    let aggs = storage.get_post_aggregations(&[parent_uri.to_string()]).await.unwrap();
    assert_eq!(aggs[parent_uri].reply_count, 1);
}

/// S2: many concurrent ops referencing a never-before-seen DID result in
/// exactly one `users` row with the placeholder handle.
#[tokio::test]
async fn concurrent_ensure_user_creates_exactly_once() {
    let (processor, storage) = processor();
    let did = "did:plc:newbie";

    // Only one concurrent caller per DID ever does the actual insert (the
    // Creator); every other caller loses the race and is told to come back
    // later via `MissingPrerequisite` rather than blocking.
    let mut handles = Vec::new();
    for _ in 0..64 {
        let processor = processor.clone();
        let did = did.to_string();
        handles.push(tokio::spawn(async move { processor.ensure_user(&did).await }));
    }
    let mut results: Vec<CoreResult<()>> = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }

    let oks = results.iter().filter(|r| r.is_ok()).count();
    let deferred = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.missing_prereq().is_some()))
        .count();
    assert_eq!(oks + deferred, 64);
    assert!(oks >= 1);

    let user = storage.get_user(did).await.unwrap().unwrap();
    assert_eq!(user.handle, UserRow::INVALID_HANDLE);
}

/// S4 (abridged): once a DID is marked opted-out in storage, no post
/// authored by it is persisted, even though the op is otherwise well formed.
#[tokio::test]
async fn opted_out_did_writes_nothing() {
    let (processor, storage) = processor();
    let did = "did:plc:private";
    storage.settings.lock().await.insert(
        did.to_string(),
        UserSettingsRow {
            did: did.to_string(),
            data_collection_forbidden: true,
        },
    );

    let event = CommitEvent {
        repo: did.to_string(),
        seq: 1,
        ops: vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/1".to_string(),
            cid: Some("bafypost".to_string()),
            record: Some(post_record()),
        }],
    };
    processor.process_commit(event).await;

    let uri = format!("at://{}/app.bsky.feed.post/1", did);
    assert!(storage.get_post(&uri).await.unwrap().is_none());
}
