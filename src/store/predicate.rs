//! Payload predicate rendering.
//!
//! The SQL backend picks one strategy at construction from its declared
//! features. Every rendered fragment is a superset of the rows it stands
//! for: [`JsonPredicates`] uses SQLite's JSON functions and is exact for
//! keys expressible as a JSON path; [`PatternPredicates`] matches substrings
//! of the serialized payload and is never exact. The store re-checks rows in
//! process whenever a condition is not rendered exactly.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::PayloadCondition;
use crate::activity::{format_stamp, stamp_glob};

/// A rendered SQL boolean expression and its positional parameters.
///
/// Expressions never evaluate to NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    /// Expression text with `?` placeholders
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    /// Fragment with parameters.
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Constant true.
    pub fn always() -> Self {
        Self::new("1", Vec::new())
    }

    /// Logical negation.
    pub fn negate(self) -> Self {
        Self::new(format!("NOT ({})", self.sql), self.params)
    }

    /// Joins fragments with `OR`; an empty list renders as false.
    pub fn any(fragments: Vec<SqlFragment>) -> Self {
        if fragments.is_empty() {
            return Self::new("0", Vec::new());
        }
        let mut sql = Vec::with_capacity(fragments.len());
        let mut params = Vec::new();
        for fragment in fragments {
            sql.push(format!("({})", fragment.sql));
            params.extend(fragment.params);
        }
        Self::new(sql.join(" OR "), params)
    }
}

/// Strategy for rendering payload conditions.
///
/// Each primitive returns a fragment that holds at least for every row
/// where the named property holds. Negating such a fragment would drop
/// rows, so exclusions go through [`reject`](Self::reject).
pub trait PayloadPredicates: Send + Sync {
    /// True when [`select`](Self::select) and [`reject`](Self::reject)
    /// render this condition exactly.
    fn is_exact(&self, condition: &PayloadCondition) -> bool;

    /// The key may exist in the payload.
    fn key_present(&self, key: &str) -> SqlFragment;

    /// The key may be absent from the payload.
    fn key_absent(&self, key: &str) -> SqlFragment;

    /// The key may hold the given value.
    fn key_equals(&self, key: &str, value: &Value) -> SqlFragment;

    /// The key may hold a truthy value.
    fn key_truthy(&self, key: &str) -> SqlFragment;

    /// The key may be missing, off-shape or hold a stamp earlier than `before`.
    fn stamp_before(&self, key: &str, before: &str) -> SqlFragment;

    /// Rows where the condition may hold.
    fn select(&self, condition: &PayloadCondition) -> SqlFragment {
        match condition {
            PayloadCondition::KeyMissing(key) => self.key_absent(key),
            PayloadCondition::KeyEquals(key, value) => self.key_equals(key, value),
            PayloadCondition::KeyTruthy(key) => self.key_truthy(key),
            PayloadCondition::StampBefore { key, before } => {
                self.stamp_before(key, &format_stamp(*before))
            }
        }
    }

    /// Rows where the condition may fail.
    fn reject(&self, condition: &PayloadCondition) -> SqlFragment {
        if self.is_exact(condition) {
            return self.select(condition).negate();
        }
        match condition {
            PayloadCondition::KeyMissing(key) => self.key_present(key),
            _ => SqlFragment::always(),
        }
    }
}

/// Builds a JSON path for a top-level key, if the key can be expressed as one.
pub(crate) fn json_path(key: &str) -> Option<String> {
    if key.is_empty() || key.contains('"') || key.contains('\\') {
        None
    } else {
        Some(format!("$.\"{}\"", key))
    }
}

/// Native JSON rendering using `json_type`/`json_extract`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPredicates {
    fallback: PatternPredicates,
}

impl JsonPredicates {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadPredicates for JsonPredicates {
    fn is_exact(&self, condition: &PayloadCondition) -> bool {
        json_path(condition.key()).is_some()
    }

    fn key_present(&self, key: &str) -> SqlFragment {
        match json_path(key) {
            Some(path) => SqlFragment::new(
                "json_type(data, ?) IS NOT NULL",
                vec![SqlValue::Text(path)],
            ),
            None => self.fallback.key_present(key),
        }
    }

    fn key_absent(&self, key: &str) -> SqlFragment {
        match json_path(key) {
            Some(path) => SqlFragment::new("json_type(data, ?) IS NULL", vec![SqlValue::Text(path)]),
            None => self.fallback.key_absent(key),
        }
    }

    fn key_equals(&self, key: &str, value: &Value) -> SqlFragment {
        let Some(path) = json_path(key) else {
            return self.fallback.key_equals(key, value);
        };
        let path = SqlValue::Text(path);
        match value {
            Value::Null => SqlFragment::new("COALESCE(json_type(data, ?) = 'null', 0)", vec![path]),
            Value::Bool(b) => SqlFragment::new(
                "COALESCE(json_type(data, ?) = ?, 0)",
                vec![path, SqlValue::Text(b.to_string())],
            ),
            Value::String(s) => SqlFragment::new(
                "COALESCE(json_type(data, ?) = 'text' AND json_extract(data, ?) = ?, 0)",
                vec![path.clone(), path, SqlValue::Text(s.clone())],
            ),
            Value::Number(n) => {
                let bound = match n.as_i64() {
                    Some(i) => SqlValue::Integer(i),
                    None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
                };
                SqlFragment::new(
                    "COALESCE(json_type(data, ?) IN ('integer', 'real') AND json_extract(data, ?) = ?, 0)",
                    vec![path.clone(), path, bound],
                )
            }
            Value::Array(_) | Value::Object(_) => SqlFragment::new(
                "COALESCE(json_extract(data, ?) = json(?), 0)",
                vec![path, SqlValue::Text(value.to_string())],
            ),
        }
    }

    fn key_truthy(&self, key: &str) -> SqlFragment {
        match json_path(key) {
            Some(path) => SqlFragment::new(
                "COALESCE(json_extract(data, ?) IN (1, 'true', '1'), 0)",
                vec![SqlValue::Text(path)],
            ),
            None => self.fallback.key_truthy(key),
        }
    }

    fn stamp_before(&self, key: &str, before: &str) -> SqlFragment {
        match json_path(key) {
            Some(path) => SqlFragment::new(
                "COALESCE(json_type(data, ?) != 'text' OR NOT (json_extract(data, ?) GLOB ?) OR json_extract(data, ?) < ?, 1)",
                vec![
                    SqlValue::Text(path.clone()),
                    SqlValue::Text(path.clone()),
                    SqlValue::Text(stamp_glob()),
                    SqlValue::Text(path),
                    SqlValue::Text(before.to_string()),
                ],
            ),
            None => self.fallback.stamp_before(key, before),
        }
    }
}

/// Substring rendering over the serialized payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternPredicates;

impl PatternPredicates {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }

    fn contains(needle: String) -> SqlFragment {
        SqlFragment::new("instr(data, ?) > 0", vec![SqlValue::Text(needle)])
    }

    fn key_prefix(key: &str) -> String {
        format!("{}:", Value::String(key.to_string()))
    }
}

impl PayloadPredicates for PatternPredicates {
    fn is_exact(&self, _condition: &PayloadCondition) -> bool {
        false
    }

    fn key_present(&self, key: &str) -> SqlFragment {
        Self::contains(Self::key_prefix(key))
    }

    fn key_absent(&self, _key: &str) -> SqlFragment {
        // A nested key of the same name shows up in the text too.
        SqlFragment::always()
    }

    fn key_equals(&self, key: &str, value: &Value) -> SqlFragment {
        Self::contains(format!("{}{}", Self::key_prefix(key), value))
    }

    fn key_truthy(&self, key: &str) -> SqlFragment {
        let prefix = Self::key_prefix(key);
        SqlFragment::any(
            ["true", "1", "\"true\"", "\"1\""]
                .iter()
                .map(|v| Self::contains(format!("{}{}", prefix, v)))
                .collect(),
        )
    }

    fn stamp_before(&self, _key: &str, _before: &str) -> SqlFragment {
        // Timestamps cannot be compared as substrings; select everything.
        SqlFragment::always()
    }
}
