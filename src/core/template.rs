//! `${{ path }}` expressions in step inputs, for-each lists and outputs.
//!
//! A path walks the template data with dots and brackets:
//! `args.region`, `step.fetch.body.items[0]`, `each.value.name`, `index`.
//! A string holding exactly one expression resolves to the referenced
//! JSON value with its type intact; expressions embedded in longer strings
//! are interpolated as text.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

fn pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

    PATTERN
        .get_or_init(|| Regex::new(r"\$\{\{\s*([^{}]*?)\s*\}\}"))
        .as_ref()
        .map_err(|e| OrchestratorError::internal(format!("Invalid template pattern: {}", e)))
}

/// Whether a string contains at least one expression
pub fn has_expression(s: &str) -> bool {
    pattern().map(|p| p.is_match(s)).unwrap_or(false)
}

/// Render every string inside `template` against `data`
pub fn render(template: &Value, data: &Value) -> Result<Value> {
    match template {
        Value::String(s) => render_str(s, data),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, data))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                rendered.insert(k.clone(), render(v, data)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(s: &str, data: &Value) -> Result<Value> {
    let pattern = pattern()?;

    if let Some(caps) = pattern.captures(s) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.len() == s.trim().len() {
            let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return lookup(data, path).cloned();
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in pattern.captures_iter(s) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        out.push_str(&to_text(lookup(data, path.as_str())?));
        last = whole.end();
    }
    out.push_str(&s[last..]);

    Ok(Value::String(out))
}

/// Render a condition and test the result for truthiness
pub fn condition(template: &Value, data: &Value) -> Result<bool> {
    Ok(is_truthy(&render(template, data)?))
}

/// `false`, `null`, `0`, empty strings and collections, and the strings
/// "false" and "0" are false. Everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve a dotted path against `data`
pub fn lookup<'a>(data: &'a Value, path: &str) -> Result<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Err(OrchestratorError::bad_request("Empty template expression"));
    }

    let unresolved = || OrchestratorError::bad_request(format!("Unresolved reference '{}'", path));

    let mut current = data;
    for part in path.split('.') {
        let (key, indexes) = split_indexes(part).ok_or_else(|| {
            OrchestratorError::bad_request(format!("Malformed reference '{}'", path))
        })?;

        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key).ok_or_else(unresolved)?,
                Value::Array(items) => {
                    let i: usize = key.parse().map_err(|_| unresolved())?;
                    items.get(i).ok_or_else(unresolved)?
                }
                _ => return Err(unresolved()),
            };
        }

        for i in indexes {
            current = current.get(i).ok_or_else(unresolved)?;
        }
    }

    Ok(current)
}

/// Split `items[0][2]` into `("items", [0, 2])`
fn split_indexes(part: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = part.find('[') else {
        return Some((part, Vec::new()));
    };

    let key = &part[..open];
    let mut indexes = Vec::new();
    let mut rest = &part[open..];

    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indexes.push(inner[..close].trim().parse().ok()?);
        rest = &inner[close + 1..];
    }

    Some((key, indexes))
}
