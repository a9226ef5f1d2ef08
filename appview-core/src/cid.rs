use lexicon_cid::multihash::Multihash;
use lexicon_cid::Cid;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Well-known multihash code for sha2-256, and the default CIDv1 raw-binary
/// codec (0x55) used when synthesizing a CID for pre-MST backfill paths that
/// lose the original one. Matches the constants `rsky-indexer`'s
/// `convert_to_ipld_format` reconstructs a `Cid` with.
const SHA2_256_CODE: u64 = 0x12;
const RAW_CODEC: u64 = 0x55;
const DAG_CBOR_CODEC: u64 = 0x71;

/// Normalize the three blob-reference shapes observed in records into a
/// canonical content-address string. Returns `None` if `value` doesn't match
/// any recognized shape, or encodes the literal string `"undefined"`.
pub fn extract_cid(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            if s == "undefined" || s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        Value::Object(map) => {
            if let Some(r#ref) = map.get("ref") {
                return extract_from_ref(r#ref);
            }
            // Decoded-binary multihash object: { code, version, multihash }.
            if map.contains_key("multihash") {
                return extract_from_binary(map);
            }
            None
        }
        _ => None,
    }
}

fn extract_from_ref(r#ref: &Value) -> Option<String> {
    match r#ref {
        Value::String(s) if s != "undefined" && !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("$link")
            .and_then(|v| v.as_str())
            .filter(|s| *s != "undefined" && !s.is_empty())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn extract_from_binary(map: &serde_json::Map<String, Value>) -> Option<String> {
    let version = map.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
    let codec = map.get("code").and_then(|v| v.as_u64()).unwrap_or(RAW_CODEC);
    let mh = map.get("multihash")?.as_object()?;
    let mh_code = mh.get("code").and_then(|v| v.as_u64()).unwrap_or(SHA2_256_CODE);
    let digest = extract_digest_bytes(mh.get("digest")?)?;

    let multihash = Multihash::wrap(mh_code, &digest).ok()?;
    let cid = Cid::new(cid_version(version), codec, multihash).ok()?;
    Some(cid.to_string())
}

fn cid_version(v: u64) -> lexicon_cid::Version {
    if v == 0 {
        lexicon_cid::Version::V0
    } else {
        lexicon_cid::Version::V1
    }
}

/// Handles both a JS-style typed-array encoding (`{"0": 1, "1": 2, ...}`)
/// and a plain JSON array of byte values.
fn extract_digest_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Array(items) => items.iter().map(|v| v.as_u64().map(|n| n as u8)).collect(),
        Value::Object(map) => {
            let mut indices: Vec<(usize, u8)> = Vec::with_capacity(map.len());
            for (k, v) in map {
                let idx: usize = k.parse().ok()?;
                let byte = v.as_u64()? as u8;
                indices.push((idx, byte));
            }
            indices.sort_by_key(|(idx, _)| *idx);
            Some(indices.into_iter().map(|(_, b)| b).collect())
        }
        _ => None,
    }
}

/// Synthesize a deterministic CID-shaped identifier for records that arrive
/// without one (pre-MST backfill paths). Derived from
/// `SHA-256(record || did || path)`, wrapped as a CIDv1 dag-cbor identifier
/// so it round-trips through every code path that expects a `Cid`, but
/// remains clearly distinguishable from an authentic CID by callers that
/// track provenance separately.
pub fn synthesize_cid(record_json: &str, did: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record_json.as_bytes());
    hasher.update(did.as_bytes());
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();

    let multihash = Multihash::wrap(SHA2_256_CODE, &digest)
        .expect("sha2-256 digest is always within multihash size limits");
    let cid = Cid::new_v1(DAG_CBOR_CODEC, multihash);
    cid.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_string_passes_through() {
        assert_eq!(
            extract_cid(&json!("bafyreicid")),
            Some("bafyreicid".to_string())
        );
    }

    #[test]
    fn undefined_literal_is_none() {
        assert_eq!(extract_cid(&json!("undefined")), None);
    }

    #[test]
    fn ref_link_shape() {
        let v = json!({ "ref": { "$link": "bafyreilink" } });
        assert_eq!(extract_cid(&v), Some("bafyreilink".to_string()));
    }

    #[test]
    fn ref_string_shape() {
        let v = json!({ "ref": "bafyreistr" });
        assert_eq!(extract_cid(&v), Some("bafyreistr".to_string()));
    }

    #[test]
    fn unrecognized_shape_is_none() {
        assert_eq!(extract_cid(&json!({ "foo": "bar" })), None);
        assert_eq!(extract_cid(&json!(42)), None);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let a = synthesize_cid("{}", "did:plc:abc", "app.bsky.feed.post/1");
        let b = synthesize_cid("{}", "did:plc:abc", "app.bsky.feed.post/1");
        assert_eq!(a, b);
        let c = synthesize_cid("{}", "did:plc:abc", "app.bsky.feed.post/2");
        assert_ne!(a, c);
    }
}
