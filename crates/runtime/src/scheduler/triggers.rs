//! Trigger action templates.
//!
//! Action templates support three substitutions:
//! - `{{payload}}`   — the entire payload, JSON-encoded
//! - `{{timestamp}}` — ISO 8601 UTC now
//! - `{{payload.KEY}}` — a top-level payload field, rendered as a bare
//!   string for scalars and JSON for anything nested

use chrono::Utc;
use serde_json::Value;

/// Interpolate a trigger action template against a fired payload.
pub fn interpolate(template: &str, payload: &Value) -> String {
    let mut out = template.replace(
        "{{timestamp}}",
        &Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    out = out.replace("{{payload}}", &payload.to_string());

    // {{payload.KEY}} substitutions.
    while let Some(start) = out.find("{{payload.") {
        let Some(end) = out[start..].find("}}") else {
            break;
        };
        let end = start + end;
        let key = &out[start + "{{payload.".len()..end];
        let replacement = payload
            .get(key)
            .map(render_value)
            .unwrap_or_default();
        out.replace_range(start..end + 2, &replacement);
    }
    out
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_substitution_is_full_json() {
        let payload = serde_json::json!({"event": "push", "count": 3});
        let out = interpolate("received: {{payload}}", &payload);
        assert!(out.starts_with("received: {"));
        assert!(out.contains("\"event\":\"push\""));
    }

    #[test]
    fn payload_key_substitution() {
        let payload = serde_json::json!({"repo": "osa", "commits": [1, 2]});
        let out = interpolate("deploy {{payload.repo}} with {{payload.commits}}", &payload);
        assert_eq!(out, "deploy osa with [1,2]");
    }

    #[test]
    fn missing_key_renders_empty() {
        let payload = serde_json::json!({"a": 1});
        assert_eq!(interpolate("x={{payload.missing}}!", &payload), "x=!");
    }

    #[test]
    fn timestamp_is_iso8601() {
        let out = interpolate("at {{timestamp}}", &serde_json::json!({}));
        let stamp = out.strip_prefix("at ").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn unterminated_placeholder_is_left_alone() {
        let payload = serde_json::json!({"a": 1});
        let out = interpolate("broken {{payload.a", &payload);
        assert_eq!(out, "broken {{payload.a");
    }
}
