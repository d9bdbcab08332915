//! Best-effort cleanup of model-produced JSON before strict parsing.

use serde_json::{Map, Value};

pub fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    let Some(open) = raw.find("```") else {
        return raw.to_string();
    };
    let after_open = &raw[open + 3..];
    let body = match after_open.rfind("```") {
        Some(close) => &after_open[..close],
        None => after_open,
    };
    let body = body.trim_start();
    let body = body
        .strip_prefix("json")
        .or_else(|| body.strip_prefix("JSON"))
        .unwrap_or(body);
    body.trim().to_string()
}

pub fn trim_to_outer_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Drops commas that directly precede `}` or `]`, ignoring string contents.
pub fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut scanner = StringScanner::default();
    for (idx, ch) in chars.iter().copied().enumerate() {
        if scanner.step(ch) {
            out.push(ch);
            continue;
        }
        if ch == ',' {
            let next = chars[idx + 1..].iter().find(|candidate| !candidate.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Wraps unquoted object keys (`{intent: "edit"}`) in double quotes.
pub fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut scanner = StringScanner::default();
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        idx += 1;
        if scanner.step(ch) {
            out.push(ch);
            continue;
        }
        out.push(ch);
        if ch != '{' && ch != ',' {
            continue;
        }

        while idx < chars.len() && chars[idx].is_whitespace() {
            out.push(chars[idx]);
            idx += 1;
        }
        let key_start = idx;
        if !chars
            .get(idx)
            .is_some_and(|first| first.is_ascii_alphabetic() || *first == '_')
        {
            continue;
        }
        while idx < chars.len()
            && (chars[idx].is_ascii_alphanumeric() || chars[idx] == '_' || chars[idx] == '-')
        {
            idx += 1;
        }
        let key: String = chars[key_start..idx].iter().collect();
        let followed_by_colon = chars[idx..]
            .iter()
            .find(|candidate| !candidate.is_whitespace())
            == Some(&':');
        if followed_by_colon {
            out.push('"');
            out.push_str(&key);
            out.push('"');
        } else {
            out.push_str(&key);
        }
    }
    out
}

/// Tracks whether the cursor sits inside a JSON string literal.
#[derive(Default)]
struct StringScanner {
    in_string: bool,
    escaped: bool,
}

impl StringScanner {
    /// Returns true when `ch` belongs to a string literal (quotes included).
    fn step(&mut self, ch: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == '"' {
                self.in_string = false;
            }
            return true;
        }
        if ch == '"' {
            self.in_string = true;
            return true;
        }
        false
    }
}

/// Tries the raw text first, then progressively repaired variants.
pub fn parse_json_object(text: &str) -> Result<Map<String, Value>, String> {
    let unfenced = strip_code_fence(text);
    if unfenced.is_empty() {
        return Err("empty response".to_string());
    }
    let mut candidates = vec![unfenced.clone()];
    if let Some(braced) = trim_to_outer_braces(&unfenced) {
        candidates.push(braced.to_string());
        candidates.push(quote_bare_keys(&remove_trailing_commas(braced)));
    }

    let mut last_error = String::from("no JSON object found");
    for candidate in candidates {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Object(object)) => return Ok(object),
            Ok(other) => last_error = format!("expected object, got {other}"),
            Err(err) => last_error = err.to_string(),
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_json_object, quote_bare_keys, remove_trailing_commas, strip_code_fence};

    #[test]
    fn fences_and_prose_are_removed() -> anyhow::Result<()> {
        let raw = "Sure! Here you go:\n```json\n{\"intent\": \"edit\", \"confidence\": 0.8}\n```\nAnything else?";
        assert_eq!(
            strip_code_fence(raw),
            "{\"intent\": \"edit\", \"confidence\": 0.8}"
        );
        let object = parse_json_object(raw).map_err(anyhow::Error::msg)?;
        assert_eq!(object.get("intent"), Some(&json!("edit")));
        Ok(())
    }

    #[test]
    fn trailing_commas_outside_strings_only() {
        assert_eq!(
            remove_trailing_commas(r#"{"a": [1, 2,], "b": "x,}",}"#),
            r#"{"a": [1, 2], "b": "x,}"}"#
        );
    }

    #[test]
    fn bare_keys_are_quoted() {
        assert_eq!(
            quote_bare_keys(r#"{intent: "crop", requiresFiles: true, "note": "a, b: c"}"#),
            r#"{"intent": "crop", "requiresFiles": true, "note": "a, b: c"}"#
        );
        assert_eq!(quote_bare_keys("[1, true, null]"), "[1, true, null]");
    }

    #[test]
    fn combined_repairs_parse() -> anyhow::Result<()> {
        let raw = "```\n{intent: 'x' }\n```";
        assert!(parse_json_object(raw).is_err());

        let raw = "noise {intent: \"upscale\", parameters: {},} trailing";
        let object = parse_json_object(raw).map_err(anyhow::Error::msg)?;
        assert_eq!(object.get("parameters"), Some(&json!({})));
        Ok(())
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(parse_json_object("[1, 2]").is_err());
        assert!(parse_json_object("   ").is_err());
    }
}
