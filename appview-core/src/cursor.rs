use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;

pub const SERVICE_FIREHOSE: &str = "firehose";
pub const SERVICE_BACKFILL: &str = "backfill";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub cursor: String,
    pub last_event_time: DateTime<Utc>,
}

impl CursorState {
    /// Backfill cursors embed the running event count: `"<seq>|<count>"`.
    /// Live cursors are just the bare sequence.
    pub fn with_count(seq: i64, events_processed: u64) -> String {
        format!("{}|{}", seq, events_processed)
    }

    pub fn parse_seq(cursor: &str) -> Option<i64> {
        cursor.split('|').next()?.parse().ok()
    }

    pub fn parse_events_processed(cursor: &str) -> Option<u64> {
        cursor.split('|').nth(1)?.parse().ok()
    }
}

/// Persists the last-processed firehose sequence and backfill progress,
/// keyed by service name. Implemented against Postgres in
/// `storage::postgres`, delegating to the `Storage` trait's own
/// `get_firehose_cursor` / `save_firehose_cursor` methods.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, service: &str) -> CoreResult<Option<CursorState>>;
    async fn save(&self, service: &str, state: CursorState) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_count_round_trips() {
        let c = CursorState::with_count(1000, 42);
        assert_eq!(CursorState::parse_seq(&c), Some(1000));
        assert_eq!(CursorState::parse_events_processed(&c), Some(42));
    }

    #[test]
    fn bare_seq_parses() {
        assert_eq!(CursorState::parse_seq("999995"), Some(999995));
        assert_eq!(CursorState::parse_events_processed("999995"), None);
    }
}
