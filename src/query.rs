//! Filtered listing and aggregation.
//!
//! [`QueryEngine`] turns caller-facing filters into a normalized
//! [`ActivityQuery`] and runs it against the configured store. The
//! conversion is where channel precedence, deny-list subtraction and
//! machine-activity exclusion are resolved, so every backend sees the same
//! selection.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::{keys, ActivityFilter, ActivityStats, Cursor, MachineActivity, Page, StatsFilter};
use crate::error::Error;
use crate::store::{ActivityQuery, ActivityStore, PayloadCondition};

/// Page size used when a filter leaves `limit` at zero.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Upper bound on a requested page size.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Read side of the activity trail.
///
/// # Examples
///
/// ```
/// use activity_trail::{ActivityFilter, AppendSink, NewActivity, QueryEngine};
/// use activity_trail::store::MemoryStore;
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::new());
/// let sink = AppendSink::new(store.clone());
/// sink.log(NewActivity::new("user.created").with_tenant("t1", "o1")).unwrap();
/// sink.log(NewActivity::new("user.created").with_tenant("t2", "o1")).unwrap();
///
/// let engine = QueryEngine::new(store);
/// let page = engine.list_activity(&ActivityFilter::for_tenant("t1")).unwrap();
/// assert_eq!(page.total, 1);
/// assert!(!page.has_more);
/// ```
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn ActivityStore>,
}

impl fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("features", &self.store.features())
            .finish()
    }
}

impl QueryEngine {
    /// Creates an engine over a store.
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self { store }
    }

    /// Lists one page of matching records in canonical order.
    ///
    /// `total` counts every match regardless of cursor and limit.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an inverted time range, `Store` on backend failure.
    pub fn list_activity(&self, filter: &ActivityFilter) -> Result<Page, Error> {
        let limit = effective_limit(filter.limit);
        let mut query = list_query(filter)?;
        query.limit = Some(limit + 1);

        let mut records = self.store.list(&query)?;
        let has_more = records.len() > limit;
        records.truncate(limit);
        let next_cursor = if has_more {
            records.last().map(Cursor::of)
        } else {
            None
        };
        let total = self.store.count(&query.without_pagination())?;

        Ok(Page {
            records,
            total,
            has_more,
            next_cursor,
        })
    }

    /// Counts matching records, overall and per verb.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an inverted time range, `Store` on backend failure.
    pub fn activity_stats(&self, filter: &StatsFilter) -> Result<ActivityStats, Error> {
        let query = stats_query(filter)?;
        let by_verb = self.store.count_by_verb(&query)?;
        let total = by_verb.values().sum();
        Ok(ActivityStats { total, by_verb })
    }
}

fn effective_limit(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_PAGE_LIMIT,
        n => n.min(MAX_PAGE_LIMIT),
    }
}

/// Normalizes a listing filter.
pub(crate) fn list_query(filter: &ActivityFilter) -> Result<ActivityQuery, Error> {
    check_range(filter.since, filter.until)?;

    let requested = filter.requested_channels();
    let (channels, exclude_channels) = if requested.is_empty() {
        (None, non_empty(&filter.exclude_channels))
    } else {
        let remaining = requested
            .into_iter()
            .filter(|c| !filter.exclude_channels.contains(c))
            .collect();
        (Some(remaining), Vec::new())
    };

    let keyword = filter
        .keyword
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_ascii_lowercase);

    Ok(ActivityQuery {
        tenant_id: filter.scope.tenant_id.clone(),
        org_id: filter.scope.org_id.clone(),
        user_id: filter.user_id.clone(),
        actor_id: filter.actor_id.clone(),
        verbs: non_empty(&filter.verbs),
        object_type: filter.object_type.clone(),
        object_id: filter.object_id.clone(),
        channels,
        exclude_channels,
        since: filter.since,
        until: filter.until,
        keyword,
        exclude_any: machine_exclusions(&filter.machine),
        cursor: filter.cursor.clone(),
        ..ActivityQuery::default()
    })
}

/// Normalizes a stats filter.
pub(crate) fn stats_query(filter: &StatsFilter) -> Result<ActivityQuery, Error> {
    check_range(filter.since, filter.until)?;
    Ok(ActivityQuery {
        tenant_id: filter.scope.tenant_id.clone(),
        org_id: filter.scope.org_id.clone(),
        user_id: filter.user_id.clone(),
        actor_id: filter.actor_id.clone(),
        since: filter.since,
        until: filter.until,
        exclude_any: machine_exclusions(&filter.machine),
        ..ActivityQuery::default()
    })
}

fn check_range(
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<(), Error> {
    match (since, until) {
        (Some(since), Some(until)) if since > until => Err(Error::InvalidInput(format!(
            "since ({}) is after until ({})",
            since, until
        ))),
        _ => Ok(()),
    }
}

fn machine_exclusions(machine: &MachineActivity) -> Vec<PayloadCondition> {
    if !machine.excludes() {
        return Vec::new();
    }
    let by_type = machine
        .actor_types
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| PayloadCondition::KeyEquals(keys::ACTOR_TYPE.to_string(), Value::String(t.clone())));
    let by_flag = machine
        .data_keys
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| PayloadCondition::KeyTruthy(k.clone()));
    by_type.chain(by_flag).collect()
}

fn non_empty(values: &[String]) -> Vec<String> {
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityRecord, NewActivity, Scope};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn engine_with(records: Vec<ActivityRecord>) -> QueryEngine {
        let store = MemoryStore::new();
        for record in &records {
            store.insert(record).unwrap();
        }
        QueryEngine::new(Arc::new(store))
    }

    fn rec(id: &str, secs: i64, build: impl FnOnce(NewActivity) -> NewActivity) -> ActivityRecord {
        ActivityRecord::from_new(
            build(NewActivity::new("user.created").with_tenant("t1", "o1")),
            id.to_string(),
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        )
    }

    fn ids(page: &Page) -> Vec<&str> {
        page.records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(effective_limit(0), DEFAULT_PAGE_LIMIT);
        assert_eq!(effective_limit(10), 10);
        assert_eq!(effective_limit(10_000), MAX_PAGE_LIMIT);
    }

    #[test]
    fn pages_follow_cursor_and_keep_total() {
        let engine = engine_with((0..5).map(|i| rec(&format!("r{}", i), i, |a| a)).collect());
        let mut filter = ActivityFilter {
            limit: 2,
            ..ActivityFilter::for_tenant("t1")
        };

        let first = engine.list_activity(&filter).unwrap();
        assert_eq!(ids(&first), ["r4", "r3"]);
        assert_eq!(first.total, 5);
        assert!(first.has_more);

        filter.cursor = first.next_cursor.clone();
        let second = engine.list_activity(&filter).unwrap();
        assert_eq!(ids(&second), ["r2", "r1"]);
        assert_eq!(second.total, 5);

        filter.cursor = second.next_cursor.clone();
        let third = engine.list_activity(&filter).unwrap();
        assert_eq!(ids(&third), ["r0"]);
        assert!(!third.has_more);
        assert!(third.next_cursor.is_none());
    }

    #[test]
    fn scope_restricts_tenant_and_org() {
        let engine = engine_with(vec![
            rec("a", 1, |a| a),
            rec("b", 2, |a| a.with_tenant("t2", "o1")),
            rec("c", 3, |a| a.with_tenant("t1", "o2")),
        ]);
        let filter = ActivityFilter {
            scope: Scope::tenant("t1").with_org("o1"),
            ..ActivityFilter::default()
        };
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["a"]);
    }

    #[test]
    fn channel_set_minus_deny_list() {
        let engine = engine_with(vec![
            rec("a", 1, |a| a.with_channel("settings")),
            rec("b", 2, |a| a.with_channel("bulk")),
            rec("c", 3, |a| a.with_channel("auth")),
        ]);
        let filter = ActivityFilter {
            channel: Some("auth".into()),
            channels: vec!["settings".into(), "bulk".into()],
            exclude_channels: vec!["bulk".into()],
            ..ActivityFilter::for_tenant("t1")
        };
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["a"]);

        let query = list_query(&filter).unwrap();
        assert_eq!(query.channels, Some(vec!["settings".to_string()]));
    }

    #[test]
    fn exhausted_channel_set_matches_nothing() {
        let engine = engine_with(vec![rec("a", 1, |a| a.with_channel("bulk"))]);
        let filter = ActivityFilter {
            channels: vec!["bulk".into()],
            exclude_channels: vec!["bulk".into()],
            ..ActivityFilter::for_tenant("t1")
        };
        let page = engine.list_activity(&filter).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total, 0);
    }

    #[test]
    fn deny_list_alone_subtracts() {
        let engine = engine_with(vec![
            rec("a", 1, |a| a.with_channel("settings")),
            rec("b", 2, |a| a.with_channel("bulk")),
        ]);
        let filter = ActivityFilter {
            exclude_channels: vec!["bulk".into()],
            ..ActivityFilter::for_tenant("t1")
        };
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["a"]);
    }

    #[test]
    fn machine_activity_three_states() {
        let engine = engine_with(vec![
            rec("human", 1, |a| a.with_data("actor_type", "user")),
            rec("job", 2, |a| a.with_data("actor_type", "job")),
            rec("flagged", 3, |a| a.with_data("is_machine", "1")),
        ]);
        let mut filter = ActivityFilter::for_tenant("t1");
        filter.machine.actor_types = vec!["job".into()];
        filter.machine.data_keys = vec!["is_machine".into()];

        assert_eq!(engine.list_activity(&filter).unwrap().total, 3);
        filter.machine.include = Some(true);
        assert_eq!(engine.list_activity(&filter).unwrap().total, 3);
        filter.machine.include = Some(false);
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["human"]);
    }

    #[test]
    fn keyword_is_trimmed_and_lowercased() {
        let engine = engine_with(vec![
            rec("a", 1, |a| a.with_object("invite", "INV-9")),
            rec("b", 2, |a| a.with_object("user", "U-1")),
        ]);
        let filter = ActivityFilter {
            keyword: Some("  Inv-9 ".into()),
            ..ActivityFilter::for_tenant("t1")
        };
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["a"]);
    }

    #[test]
    fn time_range_is_half_open() {
        let engine = engine_with((0..4).map(|i| rec(&format!("r{}", i), i, |a| a)).collect());
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let filter = ActivityFilter {
            since: Some(base + Duration::seconds(1)),
            until: Some(base + Duration::seconds(3)),
            ..ActivityFilter::for_tenant("t1")
        };
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["r2", "r1"]);
    }

    #[test]
    fn inverted_range_is_invalid() {
        let engine = engine_with(Vec::new());
        let now = Utc::now();
        let filter = ActivityFilter {
            since: Some(now),
            until: Some(now - Duration::seconds(1)),
            ..ActivityFilter::default()
        };
        assert!(matches!(
            engine.list_activity(&filter),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn stats_group_by_verb_with_machine_filter() {
        let engine = engine_with(vec![
            rec("a", 1, |a| a),
            rec("b", 2, |a| a),
            rec("c", 3, |mut a| {
                a.verb = "role.assigned".into();
                a
            }),
            rec("d", 4, |a| a.with_data("actor_type", "task")),
        ]);
        let mut filter = StatsFilter {
            scope: Scope::tenant("t1"),
            ..StatsFilter::default()
        };
        let stats = engine.activity_stats(&filter).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_verb["user.created"], 3);

        filter.machine = MachineActivity {
            include: Some(false),
            actor_types: vec!["task".into()],
            data_keys: Vec::new(),
        };
        let stats = engine.activity_stats(&filter).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_verb["role.assigned"], 1);
    }

    #[test]
    fn user_and_actor_are_or_matched() {
        let engine = engine_with(vec![
            rec("mine", 1, |a| a.with_user("u1")),
            rec("by_me", 2, |a| a.with_actor("u1")),
            rec("other", 3, |a| a.with_user("u2").with_actor("u2")),
        ]);
        let filter = ActivityFilter {
            user_id: Some("u1".into()),
            actor_id: Some("u1".into()),
            ..ActivityFilter::for_tenant("t1")
        };
        assert_eq!(ids(&engine.list_activity(&filter).unwrap()), ["by_me", "mine"]);
    }

    #[test]
    fn machine_exclusions_render_conditions() {
        let machine = MachineActivity {
            include: Some(false),
            actor_types: vec!["job".into(), String::new()],
            data_keys: vec!["system_generated".into()],
        };
        assert_eq!(
            machine_exclusions(&machine),
            vec![
                PayloadCondition::KeyEquals("actor_type".into(), json!("job")),
                PayloadCondition::KeyTruthy("system_generated".into()),
            ]
        );
    }
}
