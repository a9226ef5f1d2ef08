use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use lexicon_cid::Cid;
use rsky_repo::block_map::BlockMap;
use rsky_repo::car::read_car;
use rsky_repo::parse::get_and_parse_record;
use rsky_lexicon::com::atproto::sync::SubscribeRepos;
use serde::Deserialize;
use serde_json::Value;

/// Two-field frame header: `t` is the frame type tag, `op` the
/// operation code. Grounded in `rsky-firehose/src/firehose.rs::Header`.
#[derive(Debug, Deserialize)]
struct Header {
    #[serde(rename(deserialize = "t"))]
    type_: String,
    #[serde(rename(deserialize = "op"))]
    #[allow(dead_code)]
    operation: u8,
}

/// Decode one firehose binary frame. `#info` and `#sync` are decoded and
/// discarded (`Ok(None)`) rather than erroring, so the relay's harmless
/// housekeeping frames don't trip a reconnect.
pub fn read_frame(data: &[u8]) -> Result<Option<SubscribeRepos>> {
    let mut reader = Cursor::new(data);
    let header: Header = ciborium::de::from_reader(&mut reader)
        .map_err(|e| anyhow!("frame header decode failed: {e}"))?;

    let body = match header.type_.as_str() {
        "#commit" => SubscribeRepos::Commit(
            serde_ipld_dagcbor::from_reader(&mut reader)
                .map_err(|e| anyhow!("commit body decode failed: {e}"))?,
        ),
        "#handle" => SubscribeRepos::Handle(
            serde_ipld_dagcbor::from_reader(&mut reader)
                .map_err(|e| anyhow!("handle body decode failed: {e}"))?,
        ),
        "#tombstone" => SubscribeRepos::Tombstone(
            serde_ipld_dagcbor::from_reader(&mut reader)
                .map_err(|e| anyhow!("tombstone body decode failed: {e}"))?,
        ),
        "#info" | "#sync" => return Ok(None),
        other => {
            tracing::debug!(frame = other, "dropping unrecognized firehose frame type");
            return Ok(None);
        }
    };

    Ok(Some(body))
}

/// Parse a commit's embedded CAR block slice into a `BlockMap`, then resolve
/// one op's CID to its record, converting IPLD byte-link arrays into
/// `{"$link": ...}` the way `rsky-indexer/src/bin/indexer.rs`'s
/// `convert_record_to_ipld` does. Returns `Ok(None)` for an op with no CID
/// (e.g. a delete slipped in here by mistake) rather than erroring.
pub async fn extract_record(blocks: &[u8], cid_str: &str) -> Result<Value> {
    let blocks = read_car(blocks.to_vec())
        .await
        .context("failed to parse commit CAR blocks")?
        .blocks;
    let cid: Cid = cid_str.parse().context("invalid op cid")?;
    let parsed = get_and_parse_record(&blocks, cid).map_err(|e| anyhow!("record parse failed: {e}"))?;
    let raw = serde_json::to_value(&parsed.record).context("record is not representable as json")?;
    Ok(normalize_ipld(&raw))
}

/// Same conversion as above, against an already-materialized `BlockMap`
/// (repo-backfill's whole-repo block set rather than a single commit's).
pub fn extract_record_from_blocks(blocks: &BlockMap, cid: Cid) -> Result<Value> {
    let parsed = get_and_parse_record(blocks, cid).map_err(|e| anyhow!("record parse failed: {e}"))?;
    let raw = serde_json::to_value(&parsed.record).context("record is not representable as json")?;
    Ok(normalize_ipld(&raw))
}

/// A decoded DAG-CBOR record surfaces blob/link references as raw
/// byte-sequences (JSON number arrays here, since we go through
/// `serde_json::Value`); this recognizes a byte array that parses as a CID
/// and rewrites it to the `{"$link": "<cid>"}` shape `crate::cid::extract_cid`
/// (in appview-core) expects downstream.
fn normalize_ipld(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), normalize_ipld(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => {
            let looks_like_bytes = !arr.is_empty()
                && arr
                    .iter()
                    .all(|v| matches!(v, Value::Number(n) if n.as_u64().map_or(false, |b| b <= 255)));
            if looks_like_bytes {
                let bytes: Vec<u8> = arr.iter().filter_map(|v| v.as_u64().map(|n| n as u8)).collect();
                if let Ok(cid) = Cid::try_from(&bytes[..]) {
                    return serde_json::json!({ "$link": cid.to_string() });
                }
            }
            Value::Array(arr.iter().map(normalize_ipld).collect())
        }
        other => other.clone(),
    }
}
