use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use appview_core::cid::synthesize_cid;
use appview_core::config::{BackfillCutoff, CoreConfig};
use appview_core::identity::IdentityResolver;
use appview_core::metrics::BACKFILL_EVENTS;
use appview_core::processor::{CommitEvent, EventProcessor, OpAction, RepoOp};
use rsky_repo::car::read_car_with_root;
use rsky_repo::readable_repo::ReadableRepo;
use rsky_repo::storage::memory_blockstore::MemoryBlockstore;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};

use crate::wire::extract_record_from_blocks;

/// Single-DID path: resolve identity, fetch the CAR archive, load the
/// repo, walk the MST leaves, and submit each record as a synthetic
/// single-op commit event. Grounded in `rsky-wintermute`'s
/// `direct_index` binary, which fetches and walks a repo the same way,
/// and `rsky-indexer/src/bin/indexer.rs::run_one_off_indexing`.
pub async fn backfill_one(
    did: &str,
    identity: &IdentityResolver,
    processor: &Arc<EventProcessor>,
    cutoff: BackfillCutoff,
) -> Result<(usize, usize)> {
    let resolved = identity.resolve(did).await.context("identity resolution failed")?;

    let url = format!(
        "{}/xrpc/com.atproto.sync.getRepo?did={}",
        resolved.pds_endpoint, did
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("failed to build repo-fetch http client")?;
    let response = client.get(&url).send().await.context("repo fetch request failed")?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(anyhow!("repo fetch failed ({status}): {text}"));
    }
    let car_bytes = response.bytes().await.context("failed to read repo body")?.to_vec();

    let car = read_car_with_root(car_bytes).await.context("failed to parse repo CAR")?;
    let root = car.root;
    let blockstore = MemoryBlockstore::new(Some(car.blocks))
        .await
        .map_err(|e| anyhow!("failed to build blockstore: {e}"))?;
    let storage = Arc::new(RwLock::new(blockstore));
    let repo = ReadableRepo::load(storage, root)
        .await
        .map_err(|e| anyhow!("failed to load repo: {e}"))?;

    if repo.did() != did {
        return Err(anyhow!("DID mismatch: expected {did}, got {}", repo.did()));
    }

    let leaves = repo
        .data
        .list(None, None, None)
        .await
        .map_err(|e| anyhow!("failed to list repo records: {e}"))?;

    let storage_guard = repo.storage.read().await;
    let blocks = storage_guard
        .get_blocks(leaves.iter().map(|e| e.value).collect())
        .await
        .map_err(|e| anyhow!("failed to read repo blocks: {e}"))?
        .blocks;

    let mut indexed = 0usize;
    let mut skipped = 0usize;

    for entry in &leaves {
        let Some((collection, rkey)) = entry.key.split_once('/') else {
            skipped += 1;
            continue;
        };

        let record = match extract_record_from_blocks(&blocks, entry.value) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "failed to parse repo record");
                skipped += 1;
                continue;
            }
        };

        let created_at = record
            .get("createdAt")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        if let Some(created_at) = created_at {
            if cutoff.skips(created_at) {
                skipped += 1;
                continue;
            }
        }

        let path = format!("{collection}/{rkey}");
        let cid = entry.value.to_string();
        let cid = if cid.is_empty() {
            synthesize_cid(&record.to_string(), did, &path)
        } else {
            cid
        };

        processor
            .process_commit(CommitEvent {
                repo: did.to_string(),
                seq: 0,
                ops: vec![RepoOp {
                    action: OpAction::Create,
                    path,
                    cid: Some(cid),
                    record: Some(record),
                }],
            })
            .await;
        BACKFILL_EVENTS.inc();
        indexed += 1;
    }

    Ok((indexed, skipped))
}

/// CSV-driven bulk variant — one DID per line, optional header, grounded in
/// `rsky-indexer/src/bin/indexer.rs::run_bulk_indexing`.
pub async fn backfill_from_file(
    path: &str,
    identity: Arc<IdentityResolver>,
    processor: Arc<EventProcessor>,
    config: &CoreConfig,
) -> Result<()> {
    use std::io::{BufRead, BufReader};

    let file = std::fs::File::open(path).with_context(|| format!("cannot open {path}"))?;
    let reader = BufReader::new(file);
    let mut dids = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if n == 0 && (line.eq_ignore_ascii_case("did")) {
            continue;
        }
        if !line.starts_with("did:") {
            warn!(line = n + 1, value = line, "skipping invalid did in csv");
            continue;
        }
        dids.push(line.to_string());
    }

    info!(count = dids.len(), "loaded dids for bulk repo backfill");
    processor.set_bulk_mode(true);

    let cutoff = config.backfill_cutoff(chrono::Utc::now());
    let mut success = 0;
    let mut failure = 0;
    for (idx, did) in dids.iter().enumerate() {
        match backfill_one(did, &identity, &processor, cutoff).await {
            Ok((indexed, skipped)) => {
                success += 1;
                info!(did, indexed, skipped, progress = idx + 1, total = dids.len(), "repo backfilled");
            }
            Err(e) => {
                failure += 1;
                warn!(did, error = %e, "repo backfill failed for did, continuing");
            }
        }
    }

    info!(success, failure, "bulk repo backfill complete");
    Ok(())
}

/// Relay-driven bulk variant: walks `com.atproto.sync.listRepos`, processing
/// repos in chunks of `CONCURRENT_FETCHES` via a semaphore — grounded in
/// `rsky-backfiller::repo_backfiller::RepoBackfiller`'s semaphore-gated
/// concurrent-task pattern.
pub async fn backfill_from_relay(
    relay_url: &str,
    identity: Arc<IdentityResolver>,
    processor: Arc<EventProcessor>,
    config: &CoreConfig,
) -> Result<()> {
    processor.set_bulk_mode(true);
    let cutoff = config.backfill_cutoff(chrono::Utc::now());
    let semaphore = Arc::new(Semaphore::new(config.backfill_max_concurrent));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build listRepos http client")?;

    let mut cursor: Option<String> = None;
    loop {
        let mut url = format!("{}/xrpc/com.atproto.sync.listRepos?limit=1000", relay_url);
        if let Some(c) = &cursor {
            url.push_str(&format!("&cursor={c}"));
        }
        let page: rsky_lexicon::com::atproto::sync::ListReposOutput = client
            .get(&url)
            .send()
            .await
            .context("listRepos request failed")?
            .json()
            .await
            .context("listRepos response was not valid json")?;

        let mut tasks = Vec::new();
        for repo in page.repos {
            let semaphore = semaphore.clone();
            let identity = identity.clone();
            let processor = processor.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if let Err(e) = backfill_one(&repo.did, &identity, &processor, cutoff).await {
                    warn!(did = repo.did, error = %e, "relay-driven repo backfill failed, continuing");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(())
}
