//! Read-side filters and result shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityRecord, Cursor};

/// Tenant and organization boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Tenant to restrict to, `None` for all tenants
    pub tenant_id: Option<String>,
    /// Organization to restrict to, `None` for all organizations
    pub org_id: Option<String>,
}

impl Scope {
    /// Scope covering one tenant.
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            org_id: None,
        }
    }

    /// Narrows the scope to one organization.
    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }
}

/// Machine-activity filter settings.
///
/// `include` is three-state: `None` leaves machine activity in,
/// `Some(true)` keeps it explicitly, `Some(false)` drops records whose
/// `actor_type` is listed or whose listed data key is truthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineActivity {
    /// Whether machine activity is included
    pub include: Option<bool>,
    /// `actor_type` values that mark machine activity
    pub actor_types: Vec<String>,
    /// Payload keys whose truthy value marks machine activity
    pub data_keys: Vec<String>,
}

impl MachineActivity {
    /// Returns true when machine activity must be filtered out.
    pub fn excludes(&self) -> bool {
        self.include == Some(false)
    }
}

/// Filter for listing activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityFilter {
    /// Tenant/org boundary
    pub scope: Scope,
    /// Match records about this user (OR with `actor_id` when both set)
    pub user_id: Option<String>,
    /// Match records performed by this actor (OR with `user_id` when both set)
    pub actor_id: Option<String>,
    /// Verbs to match, empty for any
    pub verbs: Vec<String>,
    /// Object type to match
    pub object_type: Option<String>,
    /// Object identifier to match
    pub object_id: Option<String>,
    /// Single channel; ignored when `channels` is non-empty
    pub channel: Option<String>,
    /// Channel set; takes precedence over `channel`
    pub channels: Vec<String>,
    /// Channels removed from the selection
    pub exclude_channels: Vec<String>,
    /// Inclusive lower bound on occurrence time
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on occurrence time
    pub until: Option<DateTime<Utc>>,
    /// Substring over verb and object fields; ASCII letters match case-insensitively
    pub keyword: Option<String>,
    /// Machine-activity settings
    pub machine: MachineActivity,
    /// Position to continue after
    pub cursor: Option<Cursor>,
    /// Page size, 0 for the engine default
    pub limit: usize,
}

impl ActivityFilter {
    /// Filter scoped to one tenant.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            scope: Scope::tenant(tenant_id),
            ..Self::default()
        }
    }

    /// Requested channels: the set when given, else the single channel.
    pub fn requested_channels(&self) -> Vec<String> {
        if !self.channels.is_empty() {
            self.channels.clone()
        } else {
            self.channel
                .iter()
                .filter(|c| !c.is_empty())
                .cloned()
                .collect()
        }
    }
}

/// Filter for activity statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsFilter {
    /// Tenant/org boundary
    pub scope: Scope,
    /// Match records about this user (OR with `actor_id` when both set)
    pub user_id: Option<String>,
    /// Match records performed by this actor
    pub actor_id: Option<String>,
    /// Inclusive lower bound on occurrence time
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on occurrence time
    pub until: Option<DateTime<Utc>>,
    /// Machine-activity settings
    pub machine: MachineActivity,
}

/// One page of activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Page {
    /// Records in canonical order
    pub records: Vec<ActivityRecord>,
    /// Count of all records matching the filter, ignoring pagination
    pub total: u64,
    /// Whether rows exist past this page
    pub has_more: bool,
    /// Cursor for the next page, set when `has_more`
    pub next_cursor: Option<Cursor>,
}

/// Aggregated counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityStats {
    /// Count of matching records
    pub total: u64,
    /// Counts keyed by verb
    pub by_verb: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_set_takes_precedence() {
        let filter = ActivityFilter {
            channel: Some("auth".into()),
            channels: vec!["settings".into(), "bulk".into()],
            ..ActivityFilter::default()
        };
        assert_eq!(filter.requested_channels(), vec!["settings", "bulk"]);
    }

    #[test]
    fn scalar_channel_used_alone() {
        let filter = ActivityFilter {
            channel: Some("auth".into()),
            ..ActivityFilter::default()
        };
        assert_eq!(filter.requested_channels(), vec!["auth"]);

        let empty = ActivityFilter {
            channel: Some(String::new()),
            ..ActivityFilter::default()
        };
        assert!(empty.requested_channels().is_empty());
    }

    #[test]
    fn machine_activity_is_three_state() {
        let mut machine = MachineActivity::default();
        assert!(!machine.excludes());
        machine.include = Some(true);
        assert!(!machine.excludes());
        machine.include = Some(false);
        assert!(machine.excludes());
    }
}
