//! Downlink message construction for subscriber broadcast.
//!
//! Messages forwarded verbatim from the ASR are kept as loose JSON (the ASR's
//! payload shape isn't ours to constrain); messages synthesized locally
//! (status edges, deduplicated captions) are built with the helpers below so
//! every downlink message carries the same `type` discriminator and `ts`.

use chrono::Utc;
use serde_json::{json, Value};

/// Current time as an RFC3339 UTC timestamp, used for every downlink message.
#[must_use]
pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

/// Stamps `ts` onto `value` if it doesn't already have one.
pub fn ensure_ts(value: &mut Value) {
    if let Value::Object(map) = value {
        map.entry("ts").or_insert_with(|| json!(now_ts()));
    }
}

/// Builds a `type=status` message.
#[must_use]
pub fn status_message(state: &str, detail: &str) -> Value {
    json!({
        "type": "status",
        "state": state,
        "detail": detail,
        "ts": now_ts(),
    })
}

/// Builds a `type=caption` message.
#[must_use]
pub fn caption_message(text: &str, partial: bool) -> Value {
    json!({
        "type": "caption",
        "text": text,
        "partial": partial,
        "ts": now_ts(),
    })
}

/// Builds a `type=caption_translation` message.
#[must_use]
pub fn caption_translation_message(text: &str, partial: bool) -> Value {
    json!({
        "type": "caption_translation",
        "text": text,
        "partial": partial,
        "ts": now_ts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_has_expected_shape() {
        let msg = status_message("running", "ASR connected");
        assert_eq!(msg["type"], "status");
        assert_eq!(msg["state"], "running");
        assert_eq!(msg["detail"], "ASR connected");
        assert!(msg["ts"].is_string());
    }

    #[test]
    fn ensure_ts_does_not_overwrite_existing() {
        let mut msg = json!({"type": "caption", "text": "hi", "ts": "2020-01-01T00:00:00Z"});
        ensure_ts(&mut msg);
        assert_eq!(msg["ts"], "2020-01-01T00:00:00Z");
    }

    #[test]
    fn ensure_ts_stamps_when_absent() {
        let mut msg = json!({"type": "caption", "text": "hi"});
        ensure_ts(&mut msg);
        assert!(msg["ts"].is_string());
    }
}
