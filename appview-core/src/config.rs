use std::env;

/// Ingestion core configuration, loaded from the environment the way
/// `rsky_indexer::IndexerConfig` / `rsky_backfiller::BackfillerConfig` are:
/// `env::var(...).unwrap_or_else(...)` with `.parse()` fallbacks, no config
/// file framework.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub relay_url: String,
    pub pds_host: Option<String>,
    pub max_concurrent_user_creations: usize,
    pub db_pool_max_size: usize,

    pub backfill_days: i64,
    pub backfill_batch_size: usize,
    pub backfill_batch_delay_ms: u64,
    pub backfill_max_concurrent: usize,
    pub backfill_max_memory_mb: u64,
    pub backfill_use_idle: bool,
    pub backfill_max_events_per_run: u64,

    pub dispatch_queue_capacity: usize,
    pub dispatch_queue_high_water_mark: usize,
    pub dispatch_queue_min_free_memory_mb: u64,

    pub appview_did: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/appview".to_string(),
            relay_url: "wss://bsky.network".to_string(),
            pds_host: None,
            max_concurrent_user_creations: 10,
            db_pool_max_size: 20,
            backfill_days: -1,
            backfill_batch_size: 5,
            backfill_batch_delay_ms: 2000,
            backfill_max_concurrent: 5,
            backfill_max_memory_mb: 2048,
            backfill_use_idle: false,
            backfill_max_events_per_run: 1_000_000,
            dispatch_queue_capacity: 100,
            dispatch_queue_high_water_mark: 10_000,
            dispatch_queue_min_free_memory_mb: 256,
            appview_did: None,
        }
    }
}

impl CoreConfig {
    /// Load configuration from the environment, falling back to the
    /// defaults above. Mirrors `load_config()` in
    /// `rsky-indexer/src/bin/indexer.rs`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            relay_url: env::var("RELAY_URL").unwrap_or(defaults.relay_url),
            pds_host: env::var("PDS_HOST").ok(),
            max_concurrent_user_creations: env::var("MAX_CONCURRENT_USER_CREATIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent_user_creations),
            db_pool_max_size: env::var("DB_POOL_MAX_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.db_pool_max_size),
            backfill_days: env::var("BACKFILL_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backfill_days),
            backfill_batch_size: env::var("BACKFILL_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backfill_batch_size),
            backfill_batch_delay_ms: env::var("BACKFILL_BATCH_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backfill_batch_delay_ms),
            backfill_max_concurrent: env::var("BACKFILL_MAX_CONCURRENT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backfill_max_concurrent),
            backfill_max_memory_mb: env::var("BACKFILL_MAX_MEMORY_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backfill_max_memory_mb),
            backfill_use_idle: env::var("BACKFILL_USE_IDLE")
                .ok()
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.backfill_use_idle),
            backfill_max_events_per_run: env::var("BACKFILL_MAX_EVENTS_PER_RUN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backfill_max_events_per_run),
            dispatch_queue_capacity: env::var("MAX_CONCURRENT_PROCESSING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.dispatch_queue_capacity),
            dispatch_queue_high_water_mark: env::var("DISPATCH_QUEUE_HIGH_WATER_MARK")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.dispatch_queue_high_water_mark),
            dispatch_queue_min_free_memory_mb: env::var("DISPATCH_QUEUE_MIN_FREE_MEMORY_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.dispatch_queue_min_free_memory_mb),
            appview_did: env::var("APPVIEW_DID").ok(),
        }
    }

    /// `-1` = no cutoff, `0` = disabled (skip everything), `N>0` = N-day window.
    pub fn backfill_cutoff(&self, now: chrono::DateTime<chrono::Utc>) -> BackfillCutoff {
        match self.backfill_days {
            d if d < 0 => BackfillCutoff::None,
            0 => BackfillCutoff::Disabled,
            d => BackfillCutoff::Since(now - chrono::Duration::days(d)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BackfillCutoff {
    None,
    Disabled,
    Since(chrono::DateTime<chrono::Utc>),
}

impl BackfillCutoff {
    pub fn skips(&self, created_at: chrono::DateTime<chrono::Utc>) -> bool {
        match self {
            BackfillCutoff::None => false,
            BackfillCutoff::Disabled => true,
            BackfillCutoff::Since(cutoff) => created_at < *cutoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_none_never_skips() {
        let cfg = CoreConfig {
            backfill_days: -1,
            ..CoreConfig::default()
        };
        let cutoff = cfg.backfill_cutoff(chrono::Utc::now());
        assert!(!cutoff.skips(chrono::DateTime::<chrono::Utc>::MIN_UTC));
    }

    #[test]
    fn cutoff_disabled_always_skips() {
        let cfg = CoreConfig {
            backfill_days: 0,
            ..CoreConfig::default()
        };
        let cutoff = cfg.backfill_cutoff(chrono::Utc::now());
        assert!(cutoff.skips(chrono::Utc::now()));
    }

    #[test]
    fn cutoff_window_skips_old_events() {
        let now = chrono::Utc::now();
        let cfg = CoreConfig {
            backfill_days: 7,
            ..CoreConfig::default()
        };
        let cutoff = cfg.backfill_cutoff(now);
        assert!(cutoff.skips(now - chrono::Duration::days(8)));
        assert!(!cutoff.skips(now - chrono::Duration::days(1)));
    }
}
