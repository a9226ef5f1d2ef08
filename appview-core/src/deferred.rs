use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::metrics::{DEFERRED_EXPIRED, DEFERRED_QUEUE_DEPTH};

const TTL_HOURS: i64 = 24;

/// Which of the four queues an op belongs in, named after the prerequisite
/// kind it is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Pending likes/reposts, keyed by post URI.
    PostDependent,
    /// Pending user-ops, keyed by user DID.
    UserDependent,
    /// Pending list-items, keyed by list URI.
    ListDependent,
    /// Pending user-creation-ops, keyed by DID.
    UserCreationDependent,
}

impl From<crate::error::PrereqKind> for QueueKind {
    fn from(kind: crate::error::PrereqKind) -> Self {
        match kind {
            crate::error::PrereqKind::Post => QueueKind::PostDependent,
            crate::error::PrereqKind::User => QueueKind::UserDependent,
            crate::error::PrereqKind::List => QueueKind::ListDependent,
            crate::error::PrereqKind::UserCreation => QueueKind::UserCreationDependent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingOp {
    /// The op's own AT-URI, used for O(1) cancellation via the secondary
    /// index.
    pub op_uri: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

struct Queue {
    /// prerequisite URI/DID -> ordered list of ops blocked on it.
    by_prereq: HashMap<String, Vec<PendingOp>>,
    /// op URI -> prerequisite it is filed under, for O(1) cancel.
    prereq_of_op: HashMap<String, String>,
}

impl Queue {
    fn new() -> Self {
        Self {
            by_prereq: HashMap::new(),
            prereq_of_op: HashMap::new(),
        }
    }
}

/// Four symmetric queues with a secondary URI→prerequisite index. The
/// `len` counter is incremented/decremented alongside mutation rather
/// than recomputed by summing queue lengths on every access.
pub struct DeferredOpReconciler {
    post_dependent: Mutex<Queue>,
    user_dependent: Mutex<Queue>,
    list_dependent: Mutex<Queue>,
    user_creation_dependent: Mutex<Queue>,
    len: AtomicI64,
}

impl DeferredOpReconciler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            post_dependent: Mutex::new(Queue::new()),
            user_dependent: Mutex::new(Queue::new()),
            list_dependent: Mutex::new(Queue::new()),
            user_creation_dependent: Mutex::new(Queue::new()),
            len: AtomicI64::new(0),
        })
    }

    fn queue_for(&self, kind: QueueKind) -> &Mutex<Queue> {
        match kind {
            QueueKind::PostDependent => &self.post_dependent,
            QueueKind::UserDependent => &self.user_dependent,
            QueueKind::ListDependent => &self.list_dependent,
            QueueKind::UserCreationDependent => &self.user_creation_dependent,
        }
    }

    /// O(1); idempotent — returns silently (without re-enqueuing) if `op_uri`
    /// is already pending anywhere in this queue.
    pub async fn enqueue(&self, kind: QueueKind, prereq: &str, op_uri: &str, payload: Value) {
        let mut q = self.queue_for(kind).lock().await;
        if q.prereq_of_op.contains_key(op_uri) {
            return;
        }
        q.by_prereq
            .entry(prereq.to_string())
            .or_insert_with(Vec::new)
            .push(PendingOp {
                op_uri: op_uri.to_string(),
                payload,
                enqueued_at: Utc::now(),
            });
        q.prereq_of_op.insert(op_uri.to_string(), prereq.to_string());
        self.len.fetch_add(1, Ordering::Relaxed);
        DEFERRED_QUEUE_DEPTH.set(self.len.load(Ordering::Relaxed));
    }

    /// Removes the queue for `prereq` atomically — before replay — so an op
    /// that arrives concurrently with the flush is not silently dropped by a
    /// flusher still mid-loop over a stale snapshot.
    async fn take(&self, kind: QueueKind, prereq: &str) -> Vec<PendingOp> {
        let mut q = self.queue_for(kind).lock().await;
        match q.by_prereq.remove(prereq) {
            Some(ops) => {
                for op in &ops {
                    q.prereq_of_op.remove(&op.op_uri);
                }
                self.len.fetch_sub(ops.len() as i64, Ordering::Relaxed);
                DEFERRED_QUEUE_DEPTH.set(self.len.load(Ordering::Relaxed));
                ops
            }
            None => Vec::new(),
        }
    }

    /// Flush every op queued under `prereq`, replaying each through
    /// `replay`. `replay` returns `Ok(true)` if the prerequisite is still
    /// missing (re-enqueue), `Ok(false)` on success, `Err` on any other
    /// failure (dropped with a log line).
    pub async fn flush<F, Fut>(&self, kind: QueueKind, prereq: &str, mut replay: F)
    where
        F: FnMut(PendingOp) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<bool>>,
    {
        let ops = self.take(kind, prereq).await;
        for op in ops {
            let op_uri = op.op_uri.clone();
            match replay(op.clone()).await {
                Ok(true) => {
                    // Still missing its prerequisite; re-enqueue under the
                    // same key so a later flush picks it back up.
                    self.enqueue(kind, prereq, &op.op_uri, op.payload).await;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(op_uri = %op_uri, error = %e, "dropping deferred op on replay failure");
                }
            }
        }
    }

    /// Snapshot of every prerequisite currently blocking ops in `kind`'s
    /// queue, for callers that want to re-test each one against storage
    /// instead of waiting for the next natural flush trigger.
    pub async fn prereq_keys(&self, kind: QueueKind) -> Vec<String> {
        let q = self.queue_for(kind).lock().await;
        q.by_prereq.keys().cloned().collect()
    }

    /// O(1) cancellation via the secondary index, used when the op's own
    /// record is deleted before its prerequisite appeared.
    pub async fn cancel(&self, kind: QueueKind, op_uri: &str) {
        let mut q = self.queue_for(kind).lock().await;
        let Some(prereq) = q.prereq_of_op.remove(op_uri) else {
            return;
        };
        if let Some(ops) = q.by_prereq.get_mut(&prereq) {
            ops.retain(|o| o.op_uri != op_uri);
            if ops.is_empty() {
                q.by_prereq.remove(&prereq);
            }
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        DEFERRED_QUEUE_DEPTH.set(self.len.load(Ordering::Relaxed));
    }

    /// Every 60s (driven by the caller's `tokio::time::interval` loop), drop
    /// ops older than 24h and report the count expired.
    pub async fn sweep(&self) -> u64 {
        let cutoff = Utc::now() - ChronoDuration::hours(TTL_HOURS);
        let mut expired = 0u64;
        for kind in [
            QueueKind::PostDependent,
            QueueKind::UserDependent,
            QueueKind::ListDependent,
            QueueKind::UserCreationDependent,
        ] {
            let mut q = self.queue_for(kind).lock().await;
            let mut dropped_for_kind = 0usize;
            q.by_prereq.retain(|_prereq, ops| {
                let before = ops.len();
                ops.retain(|op| op.enqueued_at > cutoff);
                dropped_for_kind += before - ops.len();
                !ops.is_empty()
            });
            // prereq_of_op can't be rebuilt cheaply from by_prereq alone
            // without a pass, so rebuild it directly.
            q.prereq_of_op = q
                .by_prereq
                .iter()
                .flat_map(|(prereq, ops)| {
                    ops.iter().map(move |op| (op.op_uri.clone(), prereq.clone()))
                })
                .collect();
            expired += dropped_for_kind as u64;
        }
        if expired > 0 {
            self.len.fetch_sub(expired as i64, Ordering::Relaxed);
            DEFERRED_QUEUE_DEPTH.set(self.len.load(Ordering::Relaxed));
            DEFERRED_EXPIRED.inc_by(expired);
        }
        expired
    }

    pub fn len(&self) -> i64 {
        self.len.load(Ordering::Relaxed)
    }
}

impl Default for DeferredOpReconciler {
    fn default() -> Self {
        Self {
            post_dependent: Mutex::new(Queue::new()),
            user_dependent: Mutex::new(Queue::new()),
            list_dependent: Mutex::new(Queue::new()),
            user_creation_dependent: Mutex::new(Queue::new()),
            len: AtomicI64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn enqueue_is_idempotent_on_op_uri() {
        let r = DeferredOpReconciler::new();
        r.enqueue(
            QueueKind::PostDependent,
            "at://did:A/app.bsky.feed.post/1",
            "at://did:B/app.bsky.feed.like/1",
            json!({}),
        )
        .await;
        r.enqueue(
            QueueKind::PostDependent,
            "at://did:A/app.bsky.feed.post/1",
            "at://did:B/app.bsky.feed.like/1",
            json!({}),
        )
        .await;
        assert_eq!(r.len(), 1);
    }

    #[tokio::test]
    async fn flush_replays_and_drains() {
        let r = DeferredOpReconciler::new();
        r.enqueue(
            QueueKind::PostDependent,
            "at://did:A/app.bsky.feed.post/1",
            "at://did:B/app.bsky.feed.like/1",
            json!({"likeCount": 1}),
        )
        .await;
        let mut replayed = Vec::new();
        r.flush(
            QueueKind::PostDependent,
            "at://did:A/app.bsky.feed.post/1",
            |op| {
                replayed.push(op.op_uri.clone());
                async { Ok(false) }
            },
        )
        .await;
        assert_eq!(replayed, vec!["at://did:B/app.bsky.feed.like/1"]);
        assert_eq!(r.len(), 0);
    }

    #[tokio::test]
    async fn cancel_removes_single_op() {
        let r = DeferredOpReconciler::new();
        r.enqueue(
            QueueKind::UserDependent,
            "did:plc:a",
            "at://did:plc:b/app.bsky.graph.follow/1",
            json!({}),
        )
        .await;
        r.cancel(
            QueueKind::UserDependent,
            "at://did:plc:b/app.bsky.graph.follow/1",
        )
        .await;
        assert_eq!(r.len(), 0);
    }

    #[tokio::test]
    async fn sweep_expires_stale_entries() {
        let r = DeferredOpReconciler::new();
        {
            let mut q = r.post_dependent.lock().await;
            q.by_prereq.insert(
                "at://did:A/app.bsky.feed.post/1".to_string(),
                vec![PendingOp {
                    op_uri: "at://did:B/app.bsky.feed.like/1".to_string(),
                    payload: json!({}),
                    enqueued_at: Utc::now() - ChronoDuration::hours(25),
                }],
            );
            q.prereq_of_op.insert(
                "at://did:B/app.bsky.feed.like/1".to_string(),
                "at://did:A/app.bsky.feed.post/1".to_string(),
            );
        }
        r.len.store(1, Ordering::Relaxed);
        let expired = r.sweep().await;
        assert_eq!(expired, 1);
        assert_eq!(r.len(), 0);
    }
}
