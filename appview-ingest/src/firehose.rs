use std::sync::Arc;
use std::time::Duration;

use appview_core::cursor::{CursorState, CursorStore, SERVICE_FIREHOSE};
use appview_core::metrics::FIREHOSE_RECONNECTS;
use appview_core::processor::{CommitEvent, EventProcessor, OpAction, RepoOp};
use appview_core::queue::DispatchQueue;
use appview_core::storage::Storage;
use futures::StreamExt;
use rsky_lexicon::com::atproto::sync::{SubscribeRepos, SubscribeReposCommitOperation};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use crate::wire::{extract_record, read_frame};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

fn subscribe_url(relay_url: &str, cursor: Option<&str>) -> Result<Url, url::ParseError> {
    let base = format!("{}/xrpc/com.atproto.sync.subscribeRepos", relay_url);
    let mut url = Url::parse(&base)?;
    if let Some(cursor) = cursor {
        url.set_query(Some(&format!("cursor={}", cursor)));
    }
    Ok(url)
}

/// Live firehose client. Connects with exponential backoff (1s,
/// doubling to a 30s ceiling, matching `rsky-firehose/src/main.rs`'s
/// reconnect loop, with an explicit doubling schedule), resumes
/// from the last saved cursor, and submits each commit through the
/// dispatch queue.
pub async fn run(
    relay_url: String,
    storage: Arc<dyn Storage>,
    cursor_store: Arc<dyn CursorStore>,
    processor: Arc<EventProcessor>,
    queue: Arc<DispatchQueue>,
) {
    let mut backoff = MIN_BACKOFF;

    loop {
        let cursor = cursor_store
            .load(SERVICE_FIREHOSE)
            .await
            .ok()
            .flatten()
            .map(|c| c.cursor);

        let url = match subscribe_url(&relay_url, cursor.as_deref()) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "invalid relay url, cannot start firehose client");
                return;
            }
        };

        info!(%url, "connecting to firehose");
        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                backoff = MIN_BACKOFF;
                run_connection(
                    socket,
                    storage.clone(),
                    cursor_store.clone(),
                    processor.clone(),
                    queue.clone(),
                )
                .await;
            }
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "firehose connect failed");
            }
        }

        FIREHOSE_RECONNECTS.inc();
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}

async fn run_connection(
    mut socket: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    storage: Arc<dyn Storage>,
    cursor_store: Arc<dyn CursorStore>,
    processor: Arc<EventProcessor>,
    queue: Arc<DispatchQueue>,
) {
    let mut last_flush = Instant::now();
    let mut last_seq: Option<i64> = None;

    while let Some(msg) = socket.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "firehose websocket error, reconnecting");
                break;
            }
        };

        let bytes = match msg {
            Message::Binary(b) => b,
            Message::Close(_) => {
                info!("firehose closed by relay");
                break;
            }
            _ => continue,
        };

        let frame = match read_frame(&bytes) {
            Ok(Some(f)) => f,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "failed to decode firehose frame, skipping");
                continue;
            }
        };

        match frame {
            SubscribeRepos::Commit(commit) => {
                last_seq = Some(commit.sequence);
                let processor = processor.clone();
                let repo = commit.repo.clone();
                let seq = commit.sequence;
                let ops = clone_ops(&commit.operations);
                let blocks = commit.blocks;

                queue.submit(async move {
                    let mut built = Vec::with_capacity(ops.len());
                    for op in ops {
                        built.push(build_op(&blocks, op).await);
                    }
                    processor
                        .process_commit(CommitEvent {
                            repo,
                            seq,
                            ops: built,
                        })
                        .await;
                });
            }
            SubscribeRepos::Handle(handle) => {
                last_seq = Some(handle.sequence);
                // #identity — upsert the DID's handle directly off the
                // wire, ahead of the next profile-record enrichment pass.
                if let Err(e) = storage.upsert_user_handle(&handle.did, &handle.handle).await {
                    warn!(did = %handle.did, error = %e, "failed to record identity update");
                }
            }
            SubscribeRepos::Tombstone(tombstone) => {
                last_seq = Some(tombstone.sequence);
                // No active/inactive flag on the user row; logged so an
                // operator can correlate with PDS state.
                info!(did = %tombstone.did, "firehose tombstone received");
            }
        }

        if let Some(seq) = last_seq {
            if last_flush.elapsed() >= CURSOR_FLUSH_INTERVAL {
                flush_cursor(&cursor_store, seq).await;
                last_flush = Instant::now();
            }
        }
    }

    if let Some(seq) = last_seq {
        flush_cursor(&cursor_store, seq).await;
    }
}

async fn flush_cursor(cursor_store: &Arc<dyn CursorStore>, seq: i64) {
    let state = CursorState {
        cursor: seq.to_string(),
        last_event_time: chrono::Utc::now(),
    };
    if let Err(e) = cursor_store.save(SERVICE_FIREHOSE, state).await {
        warn!(error = %e, "failed to flush firehose cursor");
    }
}

fn clone_ops(ops: &[SubscribeReposCommitOperation]) -> Vec<SubscribeReposCommitOperation> {
    ops.iter()
        .map(|op| SubscribeReposCommitOperation {
            path: op.path.clone(),
            action: op.action.clone(),
            cid: op.cid.clone(),
        })
        .collect()
}

async fn build_op(blocks: &[u8], op: SubscribeReposCommitOperation) -> RepoOp {
    let action = match op.action.as_str() {
        "create" => OpAction::Create,
        "update" => OpAction::Update,
        _ => OpAction::Delete,
    };

    let record = match (&action, &op.cid) {
        (OpAction::Delete, _) | (_, None) => None,
        (_, Some(cid)) => match extract_record(blocks, cid).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path = %op.path, error = %e, "failed to extract record from commit blocks");
                None
            }
        },
    };

    RepoOp {
        action,
        path: op.path,
        cid: op.cid,
        record,
    }
}
