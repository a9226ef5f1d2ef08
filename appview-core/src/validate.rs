use serde_json::Value;

/// A required field and the primitive JSON kind it must have.
struct Field {
    name: &'static str,
    kind: Kind,
}

#[derive(Clone, Copy)]
enum Kind {
    Str,
    Object,
    Array,
    Bool,
}

fn matches(value: &Value, kind: Kind) -> bool {
    match kind {
        Kind::Str => value.is_string(),
        Kind::Object => value.is_object(),
        Kind::Array => value.is_array(),
        Kind::Bool => value.is_boolean(),
    }
}

/// Permissive shape check: a record passes if every required field for its
/// declared lexicon is present with the right primitive kind. Optional
/// fields and unknown extra fields are never checked — the purpose is to
/// reject frames that would trip a downstream storage contract, not to
/// re-enforce the full protocol schema.
pub fn validate(lexicon: &str, record: &Value) -> bool {
    let Some(obj) = record.as_object() else {
        return false;
    };

    let required: &[Field] = match lexicon {
        "app.bsky.feed.post" => &[Field { name: "text", kind: Kind::Str }],
        "app.bsky.feed.like" => &[Field { name: "subject", kind: Kind::Object }],
        "app.bsky.feed.repost" => &[Field { name: "subject", kind: Kind::Object }],
        "app.bsky.bookmark" | "app.bsky.feed.bookmark" => {
            &[Field { name: "subject", kind: Kind::Object }]
        }
        "app.bsky.graph.follow" => &[Field { name: "subject", kind: Kind::Str }],
        "app.bsky.graph.block" => &[Field { name: "subject", kind: Kind::Str }],
        "app.bsky.graph.list" => &[
            Field { name: "name", kind: Kind::Str },
            Field { name: "purpose", kind: Kind::Str },
        ],
        "app.bsky.graph.listitem" => &[
            Field { name: "subject", kind: Kind::Str },
            Field { name: "list", kind: Kind::Str },
        ],
        "app.bsky.graph.listblock" => &[Field { name: "subject", kind: Kind::Str }],
        "app.bsky.actor.profile" => &[],
        "app.bsky.feed.generator" => &[
            Field { name: "did", kind: Kind::Str },
            Field { name: "displayName", kind: Kind::Str },
        ],
        "app.bsky.graph.starterpack" => &[
            Field { name: "name", kind: Kind::Str },
            Field { name: "list", kind: Kind::Str },
        ],
        "app.bsky.labeler.service" => &[Field { name: "policies", kind: Kind::Object }],
        "app.bsky.graph.verification" => &[
            Field { name: "subject", kind: Kind::Str },
            Field { name: "handle", kind: Kind::Str },
        ],
        "com.atproto.label.label" => &[
            Field { name: "src", kind: Kind::Str },
            Field { name: "uri", kind: Kind::Str },
            Field { name: "val", kind: Kind::Str },
        ],
        "app.bsky.feed.threadgate" => &[Field { name: "post", kind: Kind::Str }],
        "app.bsky.feed.postgate" => &[Field { name: "post", kind: Kind::Str }],
        "chat.bsky.actor.declaration" => &[Field { name: "allowIncoming", kind: Kind::Str }],
        "app.bsky.notification.declaration" => &[Field { name: "allowSubscriptions", kind: Kind::Str }],
        "app.bsky.actor.status" => &[Field { name: "status", kind: Kind::Str }],
        // Unknown lexicons are routed to the generic-record table; there is
        // no shape to validate against.
        _ => return true,
    };

    required.iter().all(|f| {
        obj.get(f.name)
            .map(|v| matches(v, f.kind))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_requires_text() {
        assert!(validate("app.bsky.feed.post", &json!({ "text": "hi" })));
        assert!(!validate("app.bsky.feed.post", &json!({})));
    }

    #[test]
    fn extra_fields_are_permitted() {
        assert!(validate(
            "app.bsky.feed.post",
            &json!({ "text": "hi", "extra": 123 })
        ));
    }

    #[test]
    fn like_requires_subject_object() {
        assert!(validate(
            "app.bsky.feed.like",
            &json!({ "subject": { "uri": "at://x", "cid": "y" } })
        ));
        assert!(!validate(
            "app.bsky.feed.like",
            &json!({ "subject": "not-an-object" })
        ));
    }

    #[test]
    fn unknown_lexicon_always_passes() {
        assert!(validate("com.example.unknownThing", &json!({ "anything": true })));
    }
}
