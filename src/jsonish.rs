//! Tolerant ("jsonish") parsing of LLM output (§9 design notes). Model
//! output is close to JSON but rarely exact: wrapped in a code fence,
//! unquoted keys, trailing commas, or a bare `key=value` line. Failure is
//! a normal branch — callers route to `on_other`, not a hard error.
//!
//! Grounded in the teacher's `executor::parser::ResponseParser::extract_json`
//! code-fence stripping, generalized with additional repair passes.

use serde_json::Value;
use std::collections::BTreeMap;

/// Strip a ```json ... ``` / ``` ... ``` fence if present, else return the
/// largest `{...}` span, else the trimmed input unchanged.
fn extract_candidate(text: &str) -> &str {
    let trimmed = text.trim();

    for fence in ["```json", "```JSON", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                return after[..end].trim();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return trimmed[start..=end].trim();
        }
    }

    trimmed
}

/// Quote bare identifier keys: `{decision: retrieve}` -> `{"decision": "retrieve"}`
/// is NOT attempted for values (too ambiguous); only keys are repaired, and
/// only when not already quoted.
fn repair_unquoted_keys(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_string = !in_string;
            out.push(c);
            i += 1;
            continue;
        }
        if !in_string && (c == '{' || c == ',') {
            out.push(c);
            i += 1;
            // skip whitespace
            while i < chars.len() && chars[i].is_whitespace() {
                out.push(chars[i]);
                i += 1;
            }
            // bare identifier immediately followed by ':'
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            if i > start {
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    let ident: String = chars[start..i].iter().collect();
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.extend(&chars[start..i]);
                }
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Remove a trailing comma immediately before `}` or `]` (outside strings).
fn repair_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_string = !in_string;
            out.push(c);
            i += 1;
            continue;
        }
        if !in_string && c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Fallback for a single bare `key=value` line (e.g. `decision=retrieve`),
/// and for Python-literal booleans/`None` appearing where JSON expects
/// `true`/`false`/`null`.
fn parse_key_equals_value(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), Value::String(value.to_string()));
    Some(Value::Object(map))
}

fn normalize_python_literals(input: &str) -> String {
    // Whole-word replace of Python literals with JSON equivalents; cheap
    // and safe enough for model output that mixes the two dialects.
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    let is_boundary = |c: Option<char>| !matches!(c, Some(ch) if ch.is_alphanumeric() || ch == '_');
    while i < input.len() {
        let rest = &input[i..];
        let mut matched = false;
        for (literal, replacement) in [("True", "true"), ("False", "false"), ("None", "null")] {
            if rest.starts_with(literal) {
                let before_ok = i == 0 || is_boundary(input[..i].chars().last());
                let after_idx = i + literal.len();
                let after_ok = after_idx >= input.len() || is_boundary(input[after_idx..].chars().next());
                if before_ok && after_ok {
                    out.push_str(replacement);
                    i += literal.len();
                    matched = true;
                    break;
                }
            }
        }
        if matched {
            continue;
        }
        let ch = rest.chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    let _ = bytes;
    out
}

/// Best-effort parse of model output into a JSON value. Tries, in order:
/// direct `serde_json::from_str`, then fence-stripped + repaired, then a
/// bare `key=value` fallback. Returns `None` rather than erroring — the
/// caller routes to `on_other`.
pub fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
        return Some(v);
    }

    let candidate = extract_candidate(text);
    let candidate = normalize_python_literals(candidate);
    let candidate = repair_unquoted_keys(&candidate);
    let candidate = repair_trailing_commas(&candidate);
    if let Ok(v) = serde_json::from_str::<Value>(&candidate) {
        return Some(v);
    }

    parse_key_equals_value(text)
}

/// Extract a string field by trying each name in `keys` in order,
/// normalizing (trim + lowercase). Used by `json_decision_router`
/// (`decision`, `route`, `mode`) and `repeat_query_guard`'s query
/// extraction.
pub fn extract_string_field(value: &Value, keys: &[&str]) -> Option<String> {
    let obj = value.as_object()?;
    for key in keys {
        if let Some(v) = obj.get(*key) {
            if let Some(s) = v.as_str() {
                return Some(s.trim().to_lowercase());
            }
        }
    }
    None
}

/// Extract the object's keys as a sorted `BTreeMap`, used by
/// `search_nodes`'s query-parser hook to surface `parsed_filters`.
pub fn as_object_map(value: &Value) -> BTreeMap<String, Value> {
    value
        .as_object()
        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Serialize a `Value` as compact JSON with sorted keys, used by
/// `json_decision_router` to rewrite `last_model_response` after removing
/// routing keys (§4.5).
pub fn to_compact_sorted_json(value: &Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_strict_json_directly() {
        let v = parse_lenient(r#"{"decision":"retrieve"}"#).unwrap();
        assert_eq!(v, json!({"decision": "retrieve"}));
    }

    #[test]
    fn strips_code_fence() {
        let v = parse_lenient("```json\n{\"decision\": \"retrieve\"}\n```").unwrap();
        assert_eq!(v, json!({"decision": "retrieve"}));
    }

    #[test]
    fn repairs_unquoted_keys_and_trailing_comma() {
        let v = parse_lenient(r#"{decision: "retrieve", query: "class Foo",}"#).unwrap();
        assert_eq!(v, json!({"decision": "retrieve", "query": "class Foo"}));
    }

    #[test]
    fn falls_back_to_key_equals_value() {
        let v = parse_lenient("decision=retrieve").unwrap();
        assert_eq!(v, json!({"decision": "retrieve"}));
    }

    #[test]
    fn normalizes_python_literals() {
        let v = parse_lenient(r#"{use_cache: True, fallback: None}"#).unwrap();
        assert_eq!(v, json!({"use_cache": true, "fallback": null}));
    }

    #[test]
    fn unparseable_text_returns_none() {
        assert!(parse_lenient("not json at all, just prose").is_none());
    }

    #[test]
    fn extract_string_field_tries_keys_in_order() {
        let v = json!({"route": "Retrieve"});
        assert_eq!(
            extract_string_field(&v, &["decision", "route", "mode"]),
            Some("retrieve".to_string())
        );
    }

    #[test]
    fn compact_sorted_json_orders_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(to_compact_sorted_json(&v), r#"{"a":2,"b":1}"#);
    }
}
