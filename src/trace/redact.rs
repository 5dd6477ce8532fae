//! Payload redaction and size capping for span request/response bodies.

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Replace the value of every sensitive key, at any depth.
///
/// Key comparison is case-insensitive.
pub fn redact(value: &Value, sensitive_fields: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let is_sensitive = sensitive_fields
                        .iter()
                        .any(|f| f.eq_ignore_ascii_case(key));
                    let v = if is_sensitive {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v, sensitive_fields)
                    };
                    (key.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| redact(v, sensitive_fields))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Keep a payload under `max_bytes` once serialized.
///
/// Oversized payloads become a string cut on a char boundary and suffixed
/// with the truncation marker.
pub fn truncate_payload(value: Value, max_bytes: usize) -> Value {
    let serialized = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if serialized.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes;
    while cut > 0 && !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}{}", &serialized[..cut], TRUNCATION_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Vec<String> {
        vec!["access_token".into(), "password".into()]
    }

    #[test]
    fn redacts_nested_keys_case_insensitively() {
        let input = json!({
            "user": "me",
            "Access_Token": "abc",
            "nested": {"password": "hunter2", "ok": 1},
            "list": [{"PASSWORD": "x"}, "plain"]
        });
        let out = redact(&input, &fields());
        assert_eq!(out["user"], "me");
        assert_eq!(out["Access_Token"], REDACTED);
        assert_eq!(out["nested"]["password"], REDACTED);
        assert_eq!(out["nested"]["ok"], 1);
        assert_eq!(out["list"][0]["PASSWORD"], REDACTED);
        assert_eq!(out["list"][1], "plain");
    }

    #[test]
    fn redacts_whole_subtree_under_sensitive_key() {
        let out = redact(&json!({"password": {"a": 1}}), &fields());
        assert_eq!(out["password"], REDACTED);
    }

    #[test]
    fn small_payload_untouched() {
        let v = json!({"a": 1});
        assert_eq!(truncate_payload(v.clone(), 1024), v);
    }

    #[test]
    fn truncates_on_char_boundary() {
        // "é" is two bytes; a cut at 3 would split the second one.
        let out = truncate_payload(Value::String("éééé".into()), 3);
        assert_eq!(out, Value::String(format!("é{TRUNCATION_MARKER}")));
    }

    #[test]
    fn truncates_serialized_objects() {
        let out = truncate_payload(json!({"body": "x".repeat(100)}), 10);
        let s = out.as_str().unwrap();
        assert!(s.ends_with(TRUNCATION_MARKER));
        assert!(s.starts_with("{\"body\":"));
    }
}
