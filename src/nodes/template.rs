//! `{{ name }}` placeholder rendering shared by request nodes and the YAML codec.
//!
//! Placeholders resolve against a variable map with dotted-path lookup into
//! nested objects (`{{ user.profile.id }}`). Placeholders that do not resolve
//! are left intact so later layers can still see them.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

/// Regex matching `{{ path }}` placeholders.
pub fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-\.]+)\s*\}\}").expect("valid regex"))
}

/// Convert a JSON value to a string for substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

/// Look up a dotted path in the variable map.
pub fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    // Whole-key match first: variable names may themselves contain dots.
    if let Some(value) = vars.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render every resolvable placeholder in `input`.
pub fn render(input: &str, vars: &Map<String, Value>) -> String {
    render_with(input, |path| lookup(vars, path).map(value_to_string))
}

/// Render placeholders through a custom resolver; `None` leaves the placeholder intact.
pub fn render_with<F>(input: &str, mut resolve: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    if !input.contains("{{") {
        return input.to_string();
    }
    placeholder_regex()
        .replace_all(input, |caps: &regex_lite::Captures| {
            resolve(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}

/// Names referenced by placeholders in `input`, in order of appearance.
pub fn placeholders(input: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn has_placeholders(input: &str) -> bool {
    placeholder_regex().is_match(input)
}
