//! Activity persistence.
//!
//! This module provides:
//! - `ActivityStore`: the storage seam used by the sink, query engine and backfill
//! - `ActivityQuery`: a normalized, backend-neutral selection
//! - `MergePatch`: the only mutation allowed on a persisted record
//! - `MemoryStore` and `SqliteStore` backends
//!
//! # Merge semantics
//!
//! A merge never removes a key. Keys in `set_if_missing` are written only when
//! the stored payload lacks them; keys in `force` are always written. Every
//! backend applies a patch atomically, so concurrent merges of disjoint keys
//! all survive regardless of interleaving.

mod memory;
mod predicate;
mod sqlite;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::activity::{stamp_is_stale, ActivityRecord, Cursor, Payload};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use predicate::{JsonPredicates, PatternPredicates, PayloadPredicates, SqlFragment};
pub use sqlite::{JsonSupport, SqliteOptions, SqliteStore};

/// Capabilities a backend declares at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFeatures {
    /// Payload predicates are evaluated on the parsed document.
    ///
    /// When false, predicates are substring matches over the serialized
    /// payload and may over-select.
    pub json_payload: bool,
}

/// Condition over a record payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadCondition {
    /// The key is absent.
    KeyMissing(String),
    /// The key holds exactly this value.
    KeyEquals(String, Value),
    /// The key holds `true`, `1`, `"true"` or `"1"`.
    KeyTruthy(String),
    /// The key is absent, not stamp-shaped, or holds a stamp earlier than `before`.
    StampBefore {
        /// Payload key holding the stamp
        key: String,
        /// Cutoff
        before: DateTime<Utc>,
    },
}

impl PayloadCondition {
    /// Evaluates the condition against a payload.
    pub fn holds(&self, data: &Payload) -> bool {
        match self {
            PayloadCondition::KeyMissing(key) => !data.contains_key(key),
            PayloadCondition::KeyEquals(key, value) => data.get(key) == Some(value),
            PayloadCondition::KeyTruthy(key) => data.get(key).map_or(false, is_truthy),
            PayloadCondition::StampBefore { key, before } => match data.get(key) {
                Some(Value::String(raw)) => stamp_is_stale(raw, *before),
                _ => true,
            },
        }
    }

    /// Payload key the condition inspects.
    pub fn key(&self) -> &str {
        match self {
            PayloadCondition::KeyMissing(key)
            | PayloadCondition::KeyEquals(key, _)
            | PayloadCondition::KeyTruthy(key)
            | PayloadCondition::StampBefore { key, .. } => key,
        }
    }
}

/// Truthiness used for machine-activity data keys.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => s == "true" || s == "1",
        _ => false,
    }
}

/// Backend-neutral selection.
///
/// Built by the query engine from an `ActivityFilter`, or directly by the
/// backfill scanner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityQuery {
    /// Tenant equality
    pub tenant_id: Option<String>,
    /// Organization equality
    pub org_id: Option<String>,
    /// User equality (OR with `actor_id` when both set)
    pub user_id: Option<String>,
    /// Actor equality (OR with `user_id` when both set)
    pub actor_id: Option<String>,
    /// Verb membership, empty for any
    pub verbs: Vec<String>,
    /// Object type equality
    pub object_type: Option<String>,
    /// Object identifier equality
    pub object_id: Option<String>,
    /// Channel membership; `Some(empty)` matches nothing
    pub channels: Option<Vec<String>>,
    /// Channel exclusion
    pub exclude_channels: Vec<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
    /// ASCII-lowercased substring over verb, object type and object id
    pub keyword: Option<String>,
    /// At least one must hold; empty means no constraint
    pub require_any: Vec<PayloadCondition>,
    /// None may hold
    pub exclude_any: Vec<PayloadCondition>,
    /// Continue strictly after this position
    pub cursor: Option<Cursor>,
    /// Maximum rows returned by `list`
    pub limit: Option<usize>,
}

impl ActivityQuery {
    /// Evaluates every predicate except cursor and limit.
    pub fn matches(&self, record: &ActivityRecord) -> bool {
        if let Some(tenant) = &self.tenant_id {
            if &record.tenant_id != tenant {
                return false;
            }
        }
        if let Some(org) = &self.org_id {
            if &record.org_id != org {
                return false;
            }
        }
        match (&self.user_id, &self.actor_id) {
            (Some(user), Some(actor)) => {
                if &record.user_id != user && &record.actor_id != actor {
                    return false;
                }
            }
            (Some(user), None) if &record.user_id != user => return false,
            (None, Some(actor)) if &record.actor_id != actor => return false,
            _ => {}
        }
        if !self.verbs.is_empty() && !self.verbs.contains(&record.verb) {
            return false;
        }
        if self.object_type.as_ref().map_or(false, |t| &record.object_type != t) {
            return false;
        }
        if self.object_id.as_ref().map_or(false, |id| &record.object_id != id) {
            return false;
        }
        if let Some(channels) = &self.channels {
            if !channels.contains(&record.channel) {
                return false;
            }
        }
        if self.exclude_channels.contains(&record.channel) {
            return false;
        }
        if self.since.map_or(false, |since| record.created_at < since) {
            return false;
        }
        if self.until.map_or(false, |until| record.created_at >= until) {
            return false;
        }
        if let Some(keyword) = &self.keyword {
            let hit = [&record.verb, &record.object_type, &record.object_id]
                .iter()
                .any(|field| field.to_ascii_lowercase().contains(keyword.as_str()));
            if !hit {
                return false;
            }
        }
        if !self.require_any.is_empty() && !self.require_any.iter().any(|c| c.holds(&record.data)) {
            return false;
        }
        !self.exclude_any.iter().any(|c| c.holds(&record.data))
    }

    /// Copy of this query without cursor and limit, used for totals.
    pub fn without_pagination(&self) -> Self {
        Self {
            cursor: None,
            limit: None,
            ..self.clone()
        }
    }
}

/// Partial payload update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePatch {
    /// Written only when the stored payload lacks the key
    pub set_if_missing: Payload,
    /// Always written
    pub force: Payload,
}

impl MergePatch {
    /// Returns true if the patch carries no keys.
    pub fn is_empty(&self) -> bool {
        self.set_if_missing.is_empty() && self.force.is_empty()
    }

    /// Applies the patch in place, returning true if the payload changed.
    pub fn apply(&self, data: &mut Payload) -> bool {
        let mut changed = false;
        for (key, value) in &self.set_if_missing {
            if !data.contains_key(key) {
                data.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        for (key, value) in &self.force {
            if data.get(key) != Some(value) {
                data.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Storage seam for activity records.
///
/// Implementations must make `merge_data` atomic per record: a concurrent
/// merge on the same record must never observe or overwrite a stale copy.
pub trait ActivityStore: Send + Sync {
    /// Declared backend capabilities.
    fn features(&self) -> StoreFeatures;

    /// Persists a new record.
    ///
    /// # Errors
    ///
    /// `Conflict` when the identifier already exists.
    fn insert(&self, record: &ActivityRecord) -> Result<(), StoreError>;

    /// Loads one record.
    fn get(&self, id: &str) -> Result<Option<ActivityRecord>, StoreError>;

    /// Lists matching records in canonical order, honoring cursor and limit.
    fn list(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError>;

    /// Counts matching records, ignoring cursor and limit.
    fn count(&self, query: &ActivityQuery) -> Result<u64, StoreError>;

    /// Counts matching records per verb, ignoring cursor and limit.
    fn count_by_verb(&self, query: &ActivityQuery) -> Result<BTreeMap<String, u64>, StoreError>;

    /// Atomically merges a patch into a record's payload.
    ///
    /// # Errors
    ///
    /// `NotFound` when no record has the identifier.
    fn merge_data(&self, id: &str, patch: &MergePatch) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::NewActivity;
    use chrono::TimeZone;
    use serde_json::json;

    fn rec(data: serde_json::Value) -> ActivityRecord {
        let mut record = ActivityRecord::from_new(
            NewActivity::new("user.created")
                .with_user("u1")
                .with_actor("a1")
                .with_object("user", "U-42")
                .with_channel("settings"),
            "r1".into(),
            Utc.timestamp_opt(1000, 0).unwrap(),
        );
        record.data = data.as_object().cloned().unwrap_or_default();
        record
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("true")));
        assert!(is_truthy(&json!("1")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("yes")));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn stamp_before_treats_missing_as_stale() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cond = PayloadCondition::StampBefore {
            key: "enriched_at".into(),
            before: cutoff,
        };
        assert!(cond.holds(&Payload::new()));
        assert!(cond.holds(&rec(json!({"enriched_at": "2000-01-01T00:00:00.000000Z"})).data));
        assert!(!cond.holds(&rec(json!({"enriched_at": "2099-01-01T00:00:00.000000Z"})).data));
        assert!(cond.holds(&rec(json!({"enriched_at": 5})).data));
        assert!(cond.holds(&rec(json!({"enriched_at": "yesterday"})).data));
    }

    #[test]
    fn user_and_actor_are_or_matched() {
        let query = ActivityQuery {
            user_id: Some("nobody".into()),
            actor_id: Some("a1".into()),
            ..ActivityQuery::default()
        };
        assert!(query.matches(&rec(json!({}))));

        let query = ActivityQuery {
            user_id: Some("nobody".into()),
            ..ActivityQuery::default()
        };
        assert!(!query.matches(&rec(json!({}))));
    }

    #[test]
    fn keyword_is_case_insensitive() {
        let query = ActivityQuery {
            keyword: Some("u-42".into()),
            ..ActivityQuery::default()
        };
        assert!(query.matches(&rec(json!({}))));
    }

    #[test]
    fn keyword_folds_ascii_only() {
        let mut record = rec(json!({}));
        record.object_id = "ÜBER-7".into();
        let folded = |keyword: &str| ActivityQuery {
            keyword: Some(keyword.into()),
            ..ActivityQuery::default()
        };
        assert!(folded("Über-7").matches(&record));
        assert!(!folded("über").matches(&record));
    }

    #[test]
    fn empty_channel_set_matches_nothing() {
        let query = ActivityQuery {
            channels: Some(vec![]),
            ..ActivityQuery::default()
        };
        assert!(!query.matches(&rec(json!({}))));
    }

    #[test]
    fn exclusion_drops_machine_rows() {
        let query = ActivityQuery {
            exclude_any: vec![
                PayloadCondition::KeyEquals("actor_type".into(), json!("job")),
                PayloadCondition::KeyTruthy("is_machine".into()),
            ],
            ..ActivityQuery::default()
        };
        assert!(query.matches(&rec(json!({"actor_type": "user"}))));
        assert!(!query.matches(&rec(json!({"actor_type": "job"}))));
        assert!(!query.matches(&rec(json!({"is_machine": true}))));
        assert!(query.matches(&rec(json!({"is_machine": false}))));
    }

    #[test]
    fn merge_patch_never_overwrites_plain_keys() {
        let mut data = rec(json!({"actor_display": "Bob", "enriched_at": "old"})).data;
        let mut patch = MergePatch::default();
        patch.set_if_missing.insert("actor_display".into(), json!("Alice"));
        patch.set_if_missing.insert("object_display".into(), json!("Doc"));
        patch.force.insert("enriched_at".into(), json!("new"));

        assert!(patch.apply(&mut data));
        assert_eq!(data["actor_display"], json!("Bob"));
        assert_eq!(data["object_display"], json!("Doc"));
        assert_eq!(data["enriched_at"], json!("new"));
        assert!(!patch.apply(&mut data));
    }
}
