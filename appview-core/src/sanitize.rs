use serde_json::Value;

/// Recursively strip disallowed byte sequences (currently just `U+0000`,
/// which Postgres's `text` type rejects outright with "invalid byte
/// sequence for encoding") from every string reachable in a JSON value.
///
/// This is the only transformation applied before persistence; HTML/SQL
/// sanitation is explicitly out of scope here (parameterized queries and the
/// read layer's escaping own that).
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), sanitize(v));
            }
            Value::Object(out)
        }
        // Number, Bool, Null pass through unchanged.
        other => other.clone(),
    }
}

fn sanitize_str(s: &str) -> String {
    if s.contains('\u{0000}') {
        s.replace('\u{0000}', "")
    } else {
        s.to_string()
    }
}

/// Sanitize an optional string field, leaving `None` as `None`.
pub fn sanitize_opt_text(value: Option<&str>) -> Option<String> {
    value.map(sanitize_str)
}

/// Sanitize a required string field, returning an empty string if absent
/// rather than failing the whole record — mirrors
/// `rsky_indexer::indexing::sanitize_text_required`'s permissive fallback.
pub fn sanitize_text_required(value: Option<&str>) -> String {
    value.map(sanitize_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_nul_from_nested_strings() {
        let input = json!({
            "text": "hello\u{0000}world",
            "nested": { "a": ["x\u{0000}", "y"] },
        });
        let out = sanitize(&input);
        assert_eq!(out["text"], json!("helloworld"));
        assert_eq!(out["nested"]["a"][0], json!("x"));
        assert_eq!(out["nested"]["a"][1], json!("y"));
    }

    #[test]
    fn leaves_non_strings_untouched() {
        let input = json!({ "count": 3, "ok": true, "missing": null });
        assert_eq!(sanitize(&input), input);
    }

    #[test]
    fn sanitize_text_required_defaults_to_empty() {
        assert_eq!(sanitize_text_required(None), "");
        assert_eq!(sanitize_text_required(Some("a\u{0000}b")), "ab");
    }
}
