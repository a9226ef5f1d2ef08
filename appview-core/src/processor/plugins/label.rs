use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

use super::PluginCtx;

/// `com.atproto.label.label`. Applies a label: a negation (`neg:
/// true`) retracts a previously applied label, otherwise upserts it.
/// Labels arrive as standalone records on a labeler's own repo, not as a
/// per-lexicon `create`/`delete` op pair, so there is no matching `delete`.
pub async fn apply(ctx: &PluginCtx<'_>, record: &Value) -> CoreResult<()> {
    let src = record
        .get("src")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("label.src missing".into()))?;
    let uri = record
        .get("uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("label.uri missing".into()))?;
    let val = record
        .get("val")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::InvalidRecord("label.val missing".into()))?;
    let neg = record.get("neg").and_then(|v| v.as_bool()).unwrap_or(false);
    let cts = record
        .get("cts")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(ctx.now);

    ctx.storage.apply_label(src, uri, val, neg, cts).await
}
