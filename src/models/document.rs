//! Schemaless documents and equality filters.
//!
//! Every collection stores JSON objects. Fields are addressed by dotted
//! paths (`organization.id`), which is all the cascade plan needs to express
//! its predicates and updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored record.
pub type Document = Map<String, Value>;

/// Look up a dotted path inside a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
///
/// A non-object value sitting on an intermediate segment is replaced.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = doc;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Outcome of removing a value from an array field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// One or more elements were removed.
    Removed(usize),
    /// The array exists but held no matching element, or the field is absent.
    Unchanged,
    /// The field exists but is not an array.
    NotAnArray,
}

/// Remove every element equal to `value` from the array at `path`.
pub fn pull_from_path(doc: &mut Document, path: &str, value: &Value) -> PullOutcome {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return PullOutcome::Unchanged;
    };

    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment) {
            Some(Value::Object(next)) => current = next,
            Some(_) => return PullOutcome::NotAnArray,
            None => return PullOutcome::Unchanged,
        }
    }

    match current.get_mut(last) {
        Some(Value::Array(items)) => {
            let before = items.len();
            items.retain(|item| item != value);
            match before - items.len() {
                0 => PullOutcome::Unchanged,
                n => PullOutcome::Removed(n),
            }
        }
        Some(Value::Null) | None => PullOutcome::Unchanged,
        Some(_) => PullOutcome::NotAnArray,
    }
}

/// Conjunction of dotted-path equality conditions.
///
/// `null` matches both an explicit null and a missing field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    conditions: BTreeMap<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(path.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.conditions.iter()
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions
            .iter()
            .all(|(path, expected)| match get_path(doc, path) {
                Some(actual) => actual == expected,
                None => expected.is_null(),
            })
    }
}

impl FromIterator<(String, Value)> for Filter {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            conditions: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|(path, value)| format!("{path}={value}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Build a document from a `json!` object literal. Non-objects yield an empty document.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
