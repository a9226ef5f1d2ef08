use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EVENTS_PROCESSED: IntCounter = register_int_counter!(
        "appview_events_processed_total",
        "Total commit events processed by the event processor"
    )
    .unwrap();
    pub static ref EVENTS_SKIPPED: IntCounter = register_int_counter!(
        "appview_events_skipped_total",
        "Total events skipped by a backfill cutoff filter"
    )
    .unwrap();
    pub static ref OPS_BY_LEXICON: IntCounterVec = register_int_counter_vec!(
        "appview_ops_by_lexicon_total",
        "Ops processed, labeled by collection and action",
        &["collection", "action"]
    )
    .unwrap();
    pub static ref OPS_FAILED: IntCounterVec = register_int_counter_vec!(
        "appview_ops_failed_total",
        "Ops that failed, labeled by collection and error class",
        &["collection", "class"]
    )
    .unwrap();
    pub static ref DEFERRED_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "appview_deferred_queue_depth",
        "Total pending ops across all four deferred-op queues"
    )
    .unwrap();
    pub static ref DEFERRED_EXPIRED: IntCounter = register_int_counter!(
        "appview_deferred_expired_total",
        "Deferred ops dropped by the sweep for exceeding the 24h TTL"
    )
    .unwrap();
    pub static ref DISPATCH_ACTIVE: IntGauge = register_int_gauge!(
        "appview_dispatch_active",
        "Tasks currently running under the dispatch queue's semaphore"
    )
    .unwrap();
    pub static ref DISPATCH_BACKLOG: IntGauge = register_int_gauge!(
        "appview_dispatch_backlog",
        "Tasks waiting in the dispatch queue's FIFO backlog"
    )
    .unwrap();
    pub static ref DISPATCH_DROPPED: IntCounter = register_int_counter!(
        "appview_dispatch_dropped_total",
        "Tasks dropped by the dispatch queue's memory-triggered drop policy"
    )
    .unwrap();
    pub static ref USER_CREATIONS: IntCounter = register_int_counter!(
        "appview_user_creations_total",
        "Users created via ensureUser"
    )
    .unwrap();
    pub static ref USER_CREATION_DEDUPED: IntCounter = register_int_counter!(
        "appview_user_creation_deduped_total",
        "ensureUser calls that joined an in-flight creation instead of starting one"
    )
    .unwrap();
    pub static ref FIREHOSE_RECONNECTS: IntCounter = register_int_counter!(
        "appview_firehose_reconnects_total",
        "Firehose websocket reconnect attempts"
    )
    .unwrap();
    pub static ref BACKFILL_EVENTS: IntCounter = register_int_counter!(
        "appview_backfill_events_total",
        "Events processed by relay or repo backfill"
    )
    .unwrap();
}

/// Render the current state of the registry in text-exposition format, for
/// the `/metrics` route. Mirrors `rsky-indexer/src/metrics.rs::encode_metrics`.
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
