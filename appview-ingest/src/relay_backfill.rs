use std::sync::Arc;

use appview_core::config::{BackfillCutoff, CoreConfig};
use appview_core::cursor::{CursorState, CursorStore, SERVICE_BACKFILL};
use appview_core::metrics::{BACKFILL_EVENTS, EVENTS_SKIPPED};
use appview_core::processor::{CommitEvent, EventProcessor, OpAction, RepoOp};
use futures::StreamExt;
use rsky_lexicon::com::atproto::sync::SubscribeRepos;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};
use url::Url;

use crate::wire::{extract_record, read_frame};

fn subscribe_url(relay_url: &str, start_cursor: &str) -> Result<Url, url::ParseError> {
    let base = format!("{}/xrpc/com.atproto.sync.subscribeRepos", relay_url);
    let mut url = Url::parse(&base)?;
    url.set_query(Some(&format!("cursor={}", start_cursor)));
    Ok(url)
}

/// A second firehose subscription with an explicit `startCursor`,
/// resumed from the `backfill` cursor key (0 if none). Differs from the
/// live client by applying a historical cutoff filter, throttling in small
/// batches, guarding memory, and stopping at a hard event-count ceiling.
pub async fn run(config: CoreConfig, storage_cursor: Arc<dyn CursorStore>, processor: Arc<EventProcessor>) {
    let saved = storage_cursor.load(SERVICE_BACKFILL).await.ok().flatten();
    let resume = saved
        .as_ref()
        .and_then(|c| CursorState::parse_seq(&c.cursor))
        .unwrap_or(0);
    let mut events_processed = saved
        .as_ref()
        .and_then(|c| CursorState::parse_events_processed(&c.cursor))
        .unwrap_or(0);

    let url = match subscribe_url(&config.relay_url, &resume.to_string()) {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "invalid relay url, cannot start relay backfill");
            return;
        }
    };

    info!(%url, resume_seq = resume, "starting relay backfill");
    let (mut socket, _) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "relay backfill connect failed");
            return;
        }
    };

    let cutoff = config.backfill_cutoff(chrono::Utc::now());
    let mut since_batch: usize = 0;
    let mut since_memory_check: u64 = 0;
    let mut last_seq = resume;

    while let Some(msg) = socket.next().await {
        if events_processed >= config.backfill_max_events_per_run {
            info!(events_processed, "relay backfill hit MAX_EVENTS_PER_RUN, stopping");
            break;
        }

        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "relay backfill websocket error, stopping");
                break;
            }
        };
        let bytes = match msg {
            Message::Binary(b) => b,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match read_frame(&bytes) {
            Ok(Some(f)) => f,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "relay backfill failed to decode frame, skipping");
                continue;
            }
        };

        let SubscribeRepos::Commit(commit) = frame else {
            continue;
        };
        last_seq = commit.sequence;

        for op in &commit.operations {
            let Some(cid) = &op.cid else { continue };
            if op.action == "delete" {
                continue;
            }
            let record = match extract_record(&commit.blocks, cid).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %op.path, error = %e, "relay backfill failed to extract record");
                    continue;
                }
            };

            if skip_for_cutoff(&cutoff, &record) {
                EVENTS_SKIPPED.inc();
                continue;
            }

            let single_op = RepoOp {
                action: match op.action.as_str() {
                    "update" => OpAction::Update,
                    _ => OpAction::Create,
                },
                path: op.path.clone(),
                cid: Some(cid.clone()),
                record: Some(record),
            };
            processor
                .process_commit(CommitEvent {
                    repo: commit.repo.clone(),
                    seq: commit.sequence,
                    ops: vec![single_op],
                })
                .await;
            BACKFILL_EVENTS.inc();
            events_processed += 1;
        }

        since_batch += 1;
        if since_batch >= config.backfill_batch_size {
            since_batch = 0;
            tokio::time::sleep(std::time::Duration::from_millis(config.backfill_batch_delay_ms)).await;
        }

        since_memory_check += 1;
        if since_memory_check >= 100 {
            since_memory_check = 0;
            guard_memory(config.backfill_max_memory_mb).await;
        }

        if let Err(e) = storage_cursor
            .save(
                SERVICE_BACKFILL,
                CursorState {
                    cursor: CursorState::with_count(last_seq, events_processed),
                    last_event_time: chrono::Utc::now(),
                },
            )
            .await
        {
            warn!(error = %e, "failed to persist backfill cursor");
        }
    }

    info!(events_processed, last_seq, "relay backfill run ended");
}

fn skip_for_cutoff(cutoff: &BackfillCutoff, record: &serde_json::Value) -> bool {
    match cutoff {
        BackfillCutoff::None => false,
        BackfillCutoff::Disabled => true,
        BackfillCutoff::Since(_) => {
            let Some(created_at) = record
                .get("createdAt")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
            else {
                return false;
            };
            cutoff.skips(created_at)
        }
    }
}

/// Every 100 events, sample free memory; above the threshold
/// pause 5s, re-sample, pause a further 10s if still high. There is no GC to
/// invoke in Rust, so the pauses alone are the throttle.
async fn guard_memory(max_memory_mb: u64) {
    if !memory_above(max_memory_mb) {
        return;
    }
    warn!(max_memory_mb, "relay backfill memory guard tripped, pausing");
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    if memory_above(max_memory_mb) {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    }
}

fn memory_above(max_mb: u64) -> bool {
    let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
        return false;
    };
    let used_kb = (|| {
        let total = contents
            .lines()
            .find(|l| l.starts_with("MemTotal:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        let available = contents
            .lines()
            .find(|l| l.starts_with("MemAvailable:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(total.saturating_sub(available))
    })();
    match used_kb {
        Some(kb) => kb / 1024 > max_mb,
        None => false,
    }
}

