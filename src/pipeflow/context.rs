// SPDX-License-Identifier: MIT

//! Run context: the append-only key/value log shared by the nodes of a run
//!
//! Every completed node appends its output under its own id. Writes never
//! overwrite; lookups return the most recent value for a key, which is what
//! lets a loop body observe the output of its latest iteration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
    /// Node that produced the value
    #[serde(default)]
    pub node_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    entries: Vec<ContextEntry>,
    latest: HashMap<String, usize>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: Value, node_id: Option<&str>) {
        let key = key.into();
        self.latest.insert(key.clone(), self.entries.len());
        self.entries.push(ContextEntry {
            key,
            value,
            node_id: node_id.map(str::to_string),
            at: Utc::now(),
        });
    }

    /// Latest value for a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.latest.get(key).map(|&i| &self.entries[i].value)
    }

    /// Nested lookup using dot notation (e.g. `A.score`, `items.0.name`)
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    /// All values written under a key, oldest first
    pub fn history<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.key == key)
            .map(|e| &e.value)
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest value per key as a JSON object
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .latest
            .iter()
            .map(|(k, &i)| (k.clone(), self.entries[i].value.clone()))
            .collect();
        Value::Object(map)
    }

    /// Replace `{{path}}` placeholders with context values. Unknown paths
    /// render as empty strings.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let path = after[..end].trim();
                    match self.get_path(path) {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(Value::Null) | None => {}
                        Some(other) => out.push_str(&other.to_string()),
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_value_wins() {
        let mut ctx = RunContext::new();
        ctx.append("A", json!({"score": 0.2}), Some("A"));
        ctx.append("A", json!({"score": 0.9}), Some("A"));

        assert_eq!(ctx.get_path("A.score"), Some(&json!(0.9)));
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.history("A").count(), 2);
        assert_eq!(ctx.entries()[0].value, json!({"score": 0.2}));
    }

    #[test]
    fn test_get_path_nested_and_arrays() {
        let mut ctx = RunContext::new();
        ctx.append(
            "search",
            json!({"results": [{"title": "first"}, {"title": "second"}]}),
            Some("search"),
        );

        assert_eq!(
            ctx.get_path("search.results.1.title"),
            Some(&json!("second"))
        );
        assert_eq!(ctx.get_path("search.results.9.title"), None);
        assert_eq!(ctx.get_path("missing.field"), None);
    }

    #[test]
    fn test_to_json_uses_latest_values() {
        let mut ctx = RunContext::new();
        ctx.append("trigger", json!({"user": "ada"}), None);
        ctx.append("count", json!(1), Some("n"));
        ctx.append("count", json!(2), Some("n"));

        let json = ctx.to_json();
        assert_eq!(json["count"], 2);
        assert_eq!(json["trigger"]["user"], "ada");
    }

    #[test]
    fn test_render_template() {
        let mut ctx = RunContext::new();
        ctx.append("A", json!({"score": 0.8, "label": "hot"}), Some("A"));

        assert_eq!(
            ctx.render("Lead is {{ A.label }} ({{A.score}}){{missing}}"),
            "Lead is hot (0.8)"
        );
        assert_eq!(ctx.render("unterminated {{ A.label"), "unterminated {{ A.label");
    }
}
