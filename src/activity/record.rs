//! Activity record schema.
//!
//! An [`ActivityRecord`] is written once by the append sink and afterwards
//! only receives additive payload merges from the enrichment backfill.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured payload attached to a record.
///
/// Key order carries no meaning.
pub type Payload = serde_json::Map<String, Value>;

/// Payload keys with a fixed meaning across the trail.
pub mod keys {
    /// Human-readable actor name.
    pub const ACTOR_DISPLAY: &str = "actor_display";
    /// Actor email address.
    pub const ACTOR_EMAIL: &str = "actor_email";
    /// Actor identifier as captured in the payload.
    pub const ACTOR_ID: &str = "actor_id";
    /// Actor kind (`user`, `job`, `system`, ...).
    pub const ACTOR_TYPE: &str = "actor_type";
    /// Human-readable object name.
    pub const OBJECT_DISPLAY: &str = "object_display";
    /// Object type as captured in the payload.
    pub const OBJECT_TYPE: &str = "object_type";
    /// Object identifier as captured in the payload.
    pub const OBJECT_ID: &str = "object_id";
    /// Whether the object no longer exists.
    pub const OBJECT_DELETED: &str = "object_deleted";
    /// Timestamp of the last enrichment pass.
    pub const ENRICHED_AT: &str = "enriched_at";
    /// Version tag of the enricher that produced the last pass.
    pub const ENRICHER_VERSION: &str = "enricher_version";

    /// Keys the backfill engine overwrites on every write.
    pub const FORCE_KEYS: [&str; 2] = [ENRICHED_AT, ENRICHER_VERSION];
}

/// Default value stamped into `enricher_version`.
pub const DEFAULT_ENRICHER_VERSION: &str = "v1";

/// Normalizes a timestamp to the precision every backend stores.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Formats an enrichment stamp.
///
/// Fixed microsecond precision keeps lexical order equal to chronological
/// order, which the SQL predicates rely on.
pub fn format_stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Shape of a stamp written by [`format_stamp`]; `0` stands for any digit.
const STAMP_SHAPE: &[u8] = b"0000-00-00T00:00:00.000000Z";

/// Returns true if `raw` has exactly the shape [`format_stamp`] writes.
///
/// Only such stamps compare chronologically as strings. Anything else
/// (other offsets, other precisions, free text) counts as stale.
pub fn is_stamp_shaped(raw: &str) -> bool {
    raw.len() == STAMP_SHAPE.len()
        && raw.bytes().zip(STAMP_SHAPE).all(|(b, &shape)| {
            if shape == b'0' {
                b.is_ascii_digit()
            } else {
                b == shape
            }
        })
}

/// SQLite `GLOB` pattern accepting exactly the strings [`is_stamp_shaped`] accepts.
pub(crate) fn stamp_glob() -> String {
    STAMP_SHAPE
        .iter()
        .map(|&shape| {
            if shape == b'0' {
                "[0-9]".to_string()
            } else {
                char::from(shape).to_string()
            }
        })
        .collect()
}

/// Returns true if `raw` is missing the stamp shape or sorts before `before`.
pub fn stamp_is_stale(raw: &str, before: DateTime<Utc>) -> bool {
    !is_stamp_shaped(raw) || raw < format_stamp(before).as_str()
}

/// Write-side input for the append sink.
///
/// Identifier and timestamp are optional here; the sink fills them.
///
/// # Example
///
/// ```
/// use activity_trail::NewActivity;
///
/// let activity = NewActivity::new("user.lifecycle.transition")
///     .with_tenant("tenant-1", "org-1")
///     .with_actor("admin-7")
///     .with_object("user", "user-42")
///     .with_channel("settings")
///     .with_data("from", "active")
///     .with_data("to", "suspended");
///
/// assert_eq!(activity.verb, "user.lifecycle.transition");
/// assert_eq!(activity.data.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    /// Identifier, generated when absent
    pub id: Option<String>,
    /// User the action concerns
    pub user_id: String,
    /// Who performed the action
    pub actor_id: String,
    /// Tenant scope
    pub tenant_id: String,
    /// Organization scope
    pub org_id: String,
    /// Dot-delimited action name
    pub verb: String,
    /// Type of the object acted on
    pub object_type: String,
    /// Identifier of the object acted on
    pub object_id: String,
    /// Module tag
    pub channel: String,
    /// Origin IP address
    pub ip: String,
    /// Structured payload
    pub data: Payload,
    /// Occurrence time, defaults to now
    pub created_at: Option<DateTime<Utc>>,
}

impl NewActivity {
    /// Creates an activity for the given verb.
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            ..Self::default()
        }
    }

    /// Sets an explicit identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the user the action concerns.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Sets the actor.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    /// Sets tenant and organization scope.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self.org_id = org_id.into();
        self
    }

    /// Sets the object acted on.
    pub fn with_object(mut self, object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        self.object_type = object_type.into();
        self.object_id = object_id.into();
        self
    }

    /// Sets the channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the origin IP.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Adds a payload entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Sets the occurrence time.
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// A persisted activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Globally unique identifier
    pub id: String,
    /// User the action concerns
    pub user_id: String,
    /// Who performed the action
    pub actor_id: String,
    /// Tenant scope
    pub tenant_id: String,
    /// Organization scope
    pub org_id: String,
    /// Dot-delimited action name
    pub verb: String,
    /// Type of the object acted on
    pub object_type: String,
    /// Identifier of the object acted on
    pub object_id: String,
    /// Module tag
    pub channel: String,
    /// Origin IP address
    pub ip: String,
    /// Structured payload
    pub data: Payload,
    /// Occurrence time
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Builds a record from write-side input with the identifier and
    /// timestamp already resolved.
    pub(crate) fn from_new(activity: NewActivity, id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: activity.user_id,
            actor_id: activity.actor_id,
            tenant_id: activity.tenant_id,
            org_id: activity.org_id,
            verb: activity.verb,
            object_type: activity.object_type,
            object_id: activity.object_id,
            channel: activity.channel,
            ip: activity.ip,
            data: activity.data,
            created_at,
        }
    }

    /// Returns a payload value as a string, ignoring empty strings.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Actor identifier: the column, falling back to the payload.
    pub fn effective_actor_id(&self) -> Option<&str> {
        non_empty(&self.actor_id).or_else(|| self.data_str(keys::ACTOR_ID))
    }

    /// Object type and identifier: the columns, falling back to the payload.
    pub fn effective_object(&self) -> Option<(&str, &str)> {
        let object_type = non_empty(&self.object_type).or_else(|| self.data_str(keys::OBJECT_TYPE))?;
        let object_id = non_empty(&self.object_id).or_else(|| self.data_str(keys::OBJECT_ID))?;
        Some((object_type, object_id))
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(data: Payload) -> ActivityRecord {
        ActivityRecord::from_new(
            NewActivity::new("user.created"),
            "rec-1".to_string(),
            Utc::now(),
        )
        .with_payload(data)
    }

    impl ActivityRecord {
        fn with_payload(mut self, data: Payload) -> Self {
            self.data = data;
            self
        }
    }

    #[test]
    fn stamp_has_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1500);
        assert_eq!(format_stamp(a), "2024-01-01T00:00:00.000000Z");
        assert_eq!(format_stamp(b), "2024-01-01T00:00:00.001500Z");
        assert!(format_stamp(a) < format_stamp(b));
        assert!(is_stamp_shaped(&format_stamp(b)));
    }

    #[test]
    fn normalize_drops_nanoseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(normalize_timestamp(ts).timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn effective_actor_falls_back_to_payload() {
        let mut data = Payload::new();
        data.insert(keys::ACTOR_ID.into(), json!("u-9"));
        let rec = record(data);
        assert_eq!(rec.effective_actor_id(), Some("u-9"));
    }

    #[test]
    fn effective_object_requires_type_and_id() {
        let mut data = Payload::new();
        data.insert(keys::OBJECT_TYPE.into(), json!("role"));
        let rec = record(data.clone());
        assert_eq!(rec.effective_object(), None);

        data.insert(keys::OBJECT_ID.into(), json!("r-1"));
        let rec = record(data);
        assert_eq!(rec.effective_object(), Some(("role", "r-1")));
    }

    #[test]
    fn off_shape_stamps_are_stale() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(stamp_is_stale("yesterday", cutoff));
        assert!(stamp_is_stale("2030-01-01T00:00:00Z", cutoff));
        assert!(stamp_is_stale("2030-01-01T00:00:00.000000+00:00", cutoff));
        assert!(stamp_is_stale("2023-12-31T23:59:59.999999Z", cutoff));
        assert!(!stamp_is_stale("2024-01-01T00:00:00.000000Z", cutoff));
        assert!(!stamp_is_stale("2030-01-01T00:00:00.000000Z", cutoff));
    }

    #[test]
    fn glob_mirrors_shape() {
        let glob = stamp_glob();
        assert!(glob.starts_with("[0-9][0-9][0-9][0-9]-"));
        assert!(glob.ends_with(".[0-9][0-9][0-9][0-9][0-9][0-9]Z"));
        assert_eq!(glob.matches("[0-9]").count(), STAMP_SHAPE.iter().filter(|&&b| b == b'0').count());
    }
}
