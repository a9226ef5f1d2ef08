pub mod plugins;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::deferred::{DeferredOpReconciler, QueueKind};
use crate::error::{CoreError, CoreResult, PrereqKind};
use crate::identity::IdentityResolver;
use crate::metrics::{EVENTS_PROCESSED, OPS_BY_LEXICON, OPS_FAILED, USER_CREATIONS, USER_CREATION_DEDUPED};
use crate::opt_out::OptOutCache;
use crate::storage::{Storage, UserRow};

use self::plugins::PluginCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct RepoOp {
    pub action: OpAction,
    pub path: String,
    pub cid: Option<String>,
    pub record: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub repo: String,
    pub seq: i64,
    pub ops: Vec<RepoOp>,
}

/// Payload stashed in a deferred-op queue entry. `Op` replays the original
/// op through the same dispatch path; `ReplyBookkeeping` retries just a
/// reply's parent-side bookkeeping (replyCount/notification/thread-context)
/// without re-running the reply's own (already-successful) creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum DeferredPayload {
    Op {
        repo: String,
        path: String,
        action: String,
        cid: Option<String>,
        record: Option<Value>,
    },
    ReplyBookkeeping {
        uri: String,
        parent_uri: String,
        author_did: String,
        root_uri: Option<String>,
    },
}

impl DeferredPayload {
    fn from_op(repo: &str, op: &RepoOp) -> Self {
        DeferredPayload::Op {
            repo: repo.to_string(),
            path: op.path.clone(),
            action: match op.action {
                OpAction::Create => "create".to_string(),
                OpAction::Update => "update".to_string(),
                OpAction::Delete => "delete".to_string(),
            },
            cid: op.cid.clone(),
            record: op.record.clone(),
        }
    }
}

/// The heart of the core: dispatches per-record handlers by lexicon type,
/// maintains per-DID creation dedup, and drives the deferred-op reconciler.
/// Grounded in `rsky_indexer::indexing::IndexingService` (`index_record` /
/// `delete_record` / plugin registry) from `rsky-indexer/src/indexing/mod.rs`.
pub struct EventProcessor {
    storage: Arc<dyn Storage>,
    identity: Arc<IdentityResolver>,
    deferred: Arc<DeferredOpReconciler>,
    opt_out: OptOutCache,
    pending_user_creations: Mutex<HashSet<String>>,
    creation_semaphore: Arc<Semaphore>,
    /// Set during bulk repo backfill to suppress per-DID profile-enrichment
    /// fan-out.
    skip_pds_fetching: AtomicBool,
}

impl EventProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        identity: Arc<IdentityResolver>,
        deferred: Arc<DeferredOpReconciler>,
        opt_out: OptOutCache,
        max_concurrent_user_creations: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            identity,
            deferred,
            opt_out,
            pending_user_creations: Mutex::new(HashSet::new()),
            creation_semaphore: Arc::new(Semaphore::new(max_concurrent_user_creations)),
            skip_pds_fetching: AtomicBool::new(false),
        })
    }

    pub fn set_bulk_mode(&self, skip_pds_fetching: bool) {
        self.skip_pds_fetching.store(skip_pds_fetching, Ordering::Relaxed);
    }

    pub fn is_bulk_mode(&self) -> bool {
        self.skip_pds_fetching.load(Ordering::Relaxed)
    }

    /// Identity resolver — exposed so `plugins::profile` can resolve a
    /// DID's current handle when upserting a user row.
    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    /// `processCommit(event)`. Builds `uri`/`collection` per op and
    /// dispatches create/update/delete.
    pub async fn process_commit(self: &Arc<Self>, event: CommitEvent) {
        for op in event.ops {
            self.process_one(&event.repo, op).await;
        }
        EVENTS_PROCESSED.inc();
    }

    async fn process_one(self: &Arc<Self>, repo: &str, op: RepoOp) {
        let collection = op.path.split('/').next().unwrap_or("").to_string();

        if matches!(op.action, OpAction::Delete) {
            if let Err(e) = self.process_delete(repo, &op.path, &collection).await {
                warn!(repo, path = %op.path, error = %e, "delete handling failed");
                OPS_FAILED.with_label_values(&[&collection, "delete"]).inc();
            }
            return;
        }

        match self.try_process_op(repo, &op, &collection).await {
            Ok(()) => {
                OPS_BY_LEXICON.with_label_values(&[&collection, "create"]).inc();
            }
            Err(e) => {
                if let Some((kind, prereq)) = e.missing_prereq() {
                    let uri = format!("at://{}/{}", repo, op.path);
                    self.deferred
                        .enqueue(
                            kind.into(),
                            &prereq,
                            &uri,
                            serde_json::to_value(DeferredPayload::from_op(repo, &op))
                                .unwrap_or(Value::Null),
                        )
                        .await;
                    debug!(uri, prereq, ?kind, "op deferred pending prerequisite");
                } else {
                    warn!(repo, path = %op.path, error = %e, "op processing failed");
                    OPS_FAILED.with_label_values(&[&collection, "other"]).inc();
                }
            }
        }
    }

    /// Dispatch by `record.$type` / collection, after the opt-out gate.
    /// Unique-constraint violations are swallowed here (idempotent receive);
    /// everything else — including `CoreError::MissingPrerequisite` — is
    /// returned to the caller to enqueue or log.
    async fn try_process_op(self: &Arc<Self>, repo: &str, op: &RepoOp, collection: &str) -> CoreResult<()> {
        if self.is_opted_out(repo).await? {
            return Ok(());
        }

        let Some(record) = &op.record else {
            return Err(CoreError::InvalidRecord("create/update op missing record body".into()));
        };
        let sanitized = crate::sanitize::sanitize(record);
        if !crate::validate::validate(collection, &sanitized) {
            debug!(repo, collection, "dropping record failing lexicon validation");
            return Ok(());
        }

        let ctx = PluginCtx {
            storage: self.storage.as_ref(),
            processor: self.clone(),
            now: Utc::now(),
        };

        let result = plugins::dispatch_create(&ctx, collection, repo, &op.path, op.cid.as_deref(), &sanitized).await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_unique_violation() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// . For likes/reposts: cancel any pending queue entry, look up
    /// the subject before deleting, decrement aggregation, drop viewer
    /// state. For posts: discard (not replay) anything still queued against
    /// this post. Everything else is a simple ownership-verified delete.
    async fn process_delete(&self, repo: &str, path: &str, collection: &str) -> CoreResult<()> {
        let uri = format!("at://{}/{}", repo, path);

        match collection {
            "app.bsky.feed.post" => {
                // Pending ops targeted a now-deleted post; discard rather
                // than replay.
                self.deferred
                    .flush(QueueKind::PostDependent, &uri, |_op| async { Ok(false) })
                    .await;
                // If this post was itself a reply still waiting on its own
                // parent's bookkeeping, drop that too.
                self.deferred.cancel(QueueKind::PostDependent, &uri).await;
                plugins::post::delete(self.storage.as_ref(), &uri, repo).await?;
            }
            "app.bsky.feed.like" => {
                self.deferred.cancel(QueueKind::PostDependent, &uri).await;
                plugins::like::delete(self.storage.as_ref(), &uri, repo).await?;
            }
            "app.bsky.feed.repost" => {
                self.deferred.cancel(QueueKind::PostDependent, &uri).await;
                plugins::repost::delete(self.storage.as_ref(), &uri, repo).await?;
            }
            "app.bsky.bookmark" | "app.bsky.feed.bookmark" => {
                plugins::bookmark::delete(self.storage.as_ref(), &uri, repo).await?;
            }
            "app.bsky.graph.follow" => {
                self.deferred.cancel(QueueKind::UserDependent, &uri).await;
                self.storage.delete_follow(&uri, repo).await?;
            }
            "app.bsky.graph.block" => {
                self.storage.delete_block(&uri, repo).await?;
            }
            "app.bsky.graph.list" => {
                self.deferred
                    .flush(QueueKind::ListDependent, &uri, |_op| async { Ok(false) })
                    .await;
                self.storage.delete_list(&uri, repo).await?;
            }
            "app.bsky.graph.listitem" => {
                self.deferred.cancel(QueueKind::ListDependent, &uri).await;
                self.storage.delete_list_item(&uri, repo).await?;
            }
            "app.bsky.graph.listblock" => {
                self.storage.delete_list_block(&uri, repo).await?;
            }
            "app.bsky.actor.profile" => {
                // Profile records are never deleted independently of the
                // user row; nothing to do.
            }
            "app.bsky.feed.generator" => {
                self.storage.delete_feed_generator(&uri, repo).await?;
            }
            "app.bsky.graph.starterpack" => {
                self.storage.delete_starter_pack(&uri, repo).await?;
            }
            "app.bsky.labeler.service" => {
                self.storage.delete_labeler_service(&uri, repo).await?;
            }
            "app.bsky.graph.verification" => {
                self.storage.delete_verification(&uri, repo).await?;
            }
            "app.bsky.feed.threadgate" => {
                self.storage.delete_thread_gate(&uri, repo).await?;
            }
            "app.bsky.feed.postgate" => {
                self.storage.delete_post_gate(&uri, repo).await?;
            }
            "chat.bsky.actor.declaration" => {
                self.storage.delete_chat_declaration(&uri, repo).await?;
            }
            "app.bsky.notification.declaration" => {
                self.storage.delete_notif_declaration(&uri, repo).await?;
            }
            "app.bsky.actor.status" => {
                self.storage.delete_actor_status(&uri, repo).await?;
            }
            "com.atproto.label.label" => {
                // Label deletes arrive as negations through the create
                // path's `neg` flag, not as repo-op deletes; nothing here.
            }
            _ => {
                self.storage.delete_generic_record(&uri, repo).await?;
            }
        }

        self.storage.delete_notifications_for_record(&uri).await?;
        Ok(())
    }

    /// Consult the opt-out cache before any write attributed to `did`;
    /// falls back to storage on a cache miss and repopulates it.
    async fn is_opted_out(&self, did: &str) -> CoreResult<bool> {
        if let Some(cached) = self.opt_out.get(did).await {
            return Ok(cached);
        }
        let forbidden = self
            .storage
            .get_user_settings(did)
            .await?
            .map(|s| s.data_collection_forbidden)
            .unwrap_or(false);
        self.opt_out.set(did, forbidden).await;
        Ok(forbidden)
    }

    /// `ensureUser(D)` for an op's own actor. Deduplicates concurrent
    /// creations via a process-local pending set keyed by DID: the first
    /// caller for a DID becomes the Creator and does the actual bounded
    /// insert; any caller that arrives while that insert is in flight is a
    /// Follower and is deferred on `UserCreationDependent` rather than
    /// blocking — the deferred-op reconciler re-drives it once the Creator
    /// finishes.
    pub async fn ensure_user(self: &Arc<Self>, did: &str) -> CoreResult<()> {
        self.ensure_user_as(did, PrereqKind::UserCreation).await
    }

    /// As `ensure_user`, but for a DID an op merely references (e.g.
    /// `listItem`'s subject) rather than its own actor. A Follower here is
    /// deferred on `UserDependent` instead of `UserCreationDependent` —
    /// losing the creation race means "some other DID's row is still being
    /// created," not "my own creation is in flight."
    pub async fn ensure_subject_user(self: &Arc<Self>, did: &str) -> CoreResult<()> {
        self.ensure_user_as(did, PrereqKind::User).await
    }

    async fn ensure_user_as(self: &Arc<Self>, did: &str, follower_kind: PrereqKind) -> CoreResult<()> {
        if self.storage.get_user(did).await?.is_some() {
            return Ok(());
        }

        let is_creator = {
            let mut pending = self.pending_user_creations.lock().await;
            if pending.contains(did) {
                false
            } else {
                pending.insert(did.to_string());
                true
            }
        };

        if !is_creator {
            USER_CREATION_DEDUPED.inc();
            return Err(CoreError::MissingPrerequisite {
                kind: follower_kind,
                prereq: did.to_string(),
            });
        }

        let result = self.create_user_bounded(did).await;
        {
            let mut pending = self.pending_user_creations.lock().await;
            pending.remove(did);
        }
        if result.is_ok() {
            self.flush_pending_for_user(did).await;
        }
        result
    }

    async fn create_user_bounded(&self, did: &str) -> CoreResult<()> {
        let _permit = self
            .creation_semaphore
            .acquire()
            .await
            .expect("creation_semaphore is never closed");
        let row = UserRow::placeholder(did, Utc::now());
        match self.storage.create_user(row).await {
            Ok(()) => {
                USER_CREATIONS.inc();
                Ok(())
            }
            // A concurrent process created the row first; treat as success.
            Err(e) if e.is_unique_violation() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn flush_pending_for_user(self: &Arc<Self>, did: &str) {
        let this = self.clone();
        self.deferred
            .flush(QueueKind::UserDependent, did, move |op| {
                let this = this.clone();
                async move { this.replay(op.payload).await }
            })
            .await;

        let this = self.clone();
        self.deferred
            .flush(QueueKind::UserCreationDependent, did, move |op| {
                let this = this.clone();
                async move { this.replay(op.payload).await }
            })
            .await;
    }

    /// Flush ops blocked on `post_uri` (pending likes/reposts) — called by
    /// `plugins::post::create` after a post row lands.
    pub async fn flush_post_dependents(self: &Arc<Self>, post_uri: &str) {
        let this = self.clone();
        self.deferred
            .flush(QueueKind::PostDependent, post_uri, move |op| {
                let this = this.clone();
                async move { this.replay(op.payload).await }
            })
            .await;
    }

    /// Flush ops blocked on `list_uri` (pending list-items) — called by
    /// `plugins::list::create` after a list row lands.
    pub async fn flush_list_dependents(self: &Arc<Self>, list_uri: &str) {
        let this = self.clone();
        self.deferred
            .flush(QueueKind::ListDependent, list_uri, move |op| {
                let this = this.clone();
                async move { this.replay(op.payload).await }
            })
            .await;
    }

    /// Re-test each of the four queues' prerequisites against storage and
    /// flush any that now resolve. Public so a caller can run it
    /// periodically and after large backfill milestones, independent of
    /// the event-driven flush triggers (post/user/list creation).
    pub async fn retry_pending_operations(self: &Arc<Self>) {
        for post_uri in self.deferred.prereq_keys(QueueKind::PostDependent).await {
            if self.storage.get_post(&post_uri).await.ok().flatten().is_some() {
                self.flush_post_dependents(&post_uri).await;
            }
        }

        for list_uri in self.deferred.prereq_keys(QueueKind::ListDependent).await {
            if self.storage.get_list(&list_uri).await.ok().flatten().is_some() {
                self.flush_list_dependents(&list_uri).await;
            }
        }

        let mut user_dids = self.deferred.prereq_keys(QueueKind::UserDependent).await;
        user_dids.extend(self.deferred.prereq_keys(QueueKind::UserCreationDependent).await);
        user_dids.sort();
        user_dids.dedup();
        for did in user_dids {
            if self.storage.get_user(&did).await.ok().flatten().is_some() {
                self.flush_pending_for_user(&did).await;
            }
        }
    }

    /// Enqueue a reply's parent-side bookkeeping (replyCount/notification/
    /// thread-context) on the parent's post-dependent queue, for replies
    /// whose parent hasn't been indexed yet. Called by
    /// `plugins::post::create` instead of dropping the bookkeeping.
    pub async fn defer_reply_bookkeeping(
        self: &Arc<Self>,
        uri: &str,
        parent_uri: &str,
        author_did: &str,
        root_uri: Option<&str>,
    ) {
        let payload = serde_json::to_value(DeferredPayload::ReplyBookkeeping {
            uri: uri.to_string(),
            parent_uri: parent_uri.to_string(),
            author_did: author_did.to_string(),
            root_uri: root_uri.map(|s| s.to_string()),
        })
        .unwrap_or(Value::Null);
        self.deferred
            .enqueue(QueueKind::PostDependent, parent_uri, uri, payload)
            .await;
    }

    /// Replay a stashed deferred-op payload through the normal dispatch
    /// path. Returns `Ok(true)` if the prerequisite is still missing (the
    /// caller re-enqueues), `Ok(false)` on success, `Err` to drop with a
    /// log line — matches `DeferredOpReconciler::flush`'s replay contract.
    async fn replay(self: &Arc<Self>, payload: Value) -> anyhow::Result<bool> {
        let decoded: DeferredPayload = serde_json::from_value(payload)
            .map_err(|e| anyhow::anyhow!("corrupt deferred payload: {e}"))?;

        match decoded {
            DeferredPayload::Op { repo, path, action, cid, record } => {
                let op = RepoOp {
                    action: match action.as_str() {
                        "update" => OpAction::Update,
                        "delete" => OpAction::Delete,
                        _ => OpAction::Create,
                    },
                    path,
                    cid,
                    record,
                };
                let collection = op.path.split('/').next().unwrap_or("").to_string();

                match self.try_process_op(&repo, &op, &collection).await {
                    Ok(()) => Ok(false),
                    Err(e) => match e.missing_prereq() {
                        Some(_) => Ok(true),
                        None => Err(anyhow::anyhow!(e)),
                    },
                }
            }
            DeferredPayload::ReplyBookkeeping { uri, parent_uri, author_did, root_uri } => {
                plugins::post::try_reply_bookkeeping(
                    self.storage.as_ref(),
                    &uri,
                    &parent_uri,
                    &author_did,
                    root_uri.as_deref(),
                )
                .await
                .map_err(|e| anyhow::anyhow!(e))
            }
        }
    }
}
