//! `${name}` placeholder substitution for action parameters.
//!
//! A string that consists of a single placeholder is replaced by the variable
//! value with its JSON type intact (`"${budget}"` -> `500`). Placeholders
//! embedded in longer strings are spliced in as text. Dotted names walk into
//! nested objects (`${trigger.name}`). Unknown names are left untouched so the
//! handler can decide what to do with them.

use serde_json::{Map, Value};

/// Substitute placeholders in every value of a parameter bag
pub fn substitute_params(params: &Map<String, Value>, variables: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| (key.clone(), substitute(value, variables)))
        .collect()
}

/// Recursively substitute placeholders in a JSON value
pub fn substitute(value: &Value, variables: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, variables)).collect()),
        Value::Object(map) => Value::Object(substitute_params(map, variables)),
        other => other.clone(),
    }
}

fn substitute_str(input: &str, variables: &Map<String, Value>) -> Value {
    // Whole-string placeholder keeps the variable's type
    if let Some(name) = whole_placeholder(input) {
        if let Some(found) = lookup(variables, name) {
            return found.clone();
        }
        return Value::String(input.to_string());
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(variables, name) {
                    Some(found) => out.push_str(&render(found)),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder, copy verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    Value::String(out)
}

fn whole_placeholder(input: &str) -> Option<&str> {
    let name = input.strip_prefix("${")?.strip_suffix('}')?;
    if name.is_empty() || name.contains('}') || name.contains("${") {
        return None;
    }
    Some(name)
}

/// Resolve a possibly dotted variable name
pub fn lookup<'a>(variables: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    // Exact keys win over path traversal, so "a.b" can be a flat key
    if let Some(found) = variables.get(name) {
        return Some(found);
    }

    let mut segments = name.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
