use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Entry {
    forbidden: bool,
    cached_at: Instant,
}

/// In-memory `DID -> bool` cache consulted before any write attributed to
/// that DID. Invalidated on explicit settings-change notification or every
/// 5 minutes, whichever comes first — the same two-trigger shape as
/// `rsky_identity::IdResolver`'s cache invalidation (TTL plus an explicit
/// `invalidate` callback hook), generalized here to a plain boolean flag.
#[derive(Clone)]
pub struct OptOutCache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl OptOutCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the cached verdict if present and fresh. A cache miss means
    /// "unknown" — callers should consult storage's `getUserSettings` and
    /// call `set` with the result.
    pub async fn get(&self, did: &str) -> Option<bool> {
        let guard = self.inner.read().await;
        guard.get(did).and_then(|e| {
            if e.cached_at.elapsed() < REFRESH_INTERVAL {
                Some(e.forbidden)
            } else {
                None
            }
        })
    }

    pub async fn set(&self, did: &str, forbidden: bool) {
        let mut guard = self.inner.write().await;
        guard.insert(
            did.to_string(),
            Entry {
                forbidden,
                cached_at: Instant::now(),
            },
        );
    }

    /// Called when settings change for `did` so the next gate check
    /// re-fetches rather than serving a stale verdict for up to 5 minutes.
    pub async fn invalidate(&self, did: &str) {
        let mut guard = self.inner.write().await;
        guard.remove(did);
    }
}

impl Default for OptOutCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_set_then_hit() {
        let cache = OptOutCache::new();
        assert_eq!(cache.get("did:plc:a").await, None);
        cache.set("did:plc:a", true).await;
        assert_eq!(cache.get("did:plc:a").await, Some(true));
    }

    #[tokio::test]
    async fn invalidate_clears_entry() {
        let cache = OptOutCache::new();
        cache.set("did:plc:a", true).await;
        cache.invalidate("did:plc:a").await;
        assert_eq!(cache.get("did:plc:a").await, None);
    }
}
