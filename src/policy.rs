//! Role-aware filter construction.
//!
//! [`AccessPolicy`] rewrites caller-supplied filters so a query can only
//! reach what the caller is entitled to see:
//! - scope is pinned to the caller's tenant/org unless a superadmin may widen it
//! - non-admins only see their own activity
//! - requested channels are intersected with the allow-list and reduced by the deny-list
//! - machine activity is hidden from everyone but superadmins

use serde::{Deserialize, Serialize};

use crate::activity::{ActivityFilter, MachineActivity, Scope, StatsFilter};
use crate::error::{Violation, ViolationKind};
use crate::sanitizer::MetadataExposure;

/// The caller a request is evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier
    pub id: String,
    /// Actor kind, e.g. `user`; used as the role when none is set
    pub actor_type: String,
    /// Assigned role
    pub role: String,
    /// Home tenant
    pub tenant_id: String,
    /// Home organization
    pub org_id: String,
}

impl Actor {
    /// Creates an actor with an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets the actor kind.
    pub fn with_type(mut self, actor_type: impl Into<String>) -> Self {
        self.actor_type = actor_type.into();
        self
    }

    /// Sets the home tenant and organization.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self.org_id = org_id.into();
        self
    }
}

/// Access policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessPolicyConfig {
    /// Role names treated as admin
    pub admin_roles: Vec<String>,
    /// Role names treated as superadmin (implies admin)
    pub superadmin_roles: Vec<String>,
    /// Channels a caller may request; empty allows all
    pub allowed_channels: Vec<String>,
    /// Channels never returned
    pub denied_channels: Vec<String>,
    /// `actor_type` values marking machine activity
    pub machine_actor_types: Vec<String>,
    /// Payload keys whose truthy value marks machine activity
    pub machine_data_keys: Vec<String>,
    /// Role whose payload visibility follows `support_exposure`
    pub support_role: String,
    /// Payload exposure for the support role
    pub support_exposure: MetadataExposure,
    /// Strip the origin IP for everyone but superadmins
    pub redact_ip: bool,
    /// Restrict stats to the caller's own activity for non-admins
    pub stats_self_only: bool,
    /// Let superadmins keep the scope they requested
    pub allow_superadmin_scope_override: bool,
    /// Hide machine activity from everyone but superadmins
    pub hide_machine_activity: bool,
}

impl Default for AccessPolicyConfig {
    fn default() -> Self {
        Self {
            admin_roles: strings(&["admin", "owner"]),
            superadmin_roles: strings(&["superadmin", "root"]),
            allowed_channels: Vec::new(),
            denied_channels: Vec::new(),
            machine_actor_types: strings(&["job", "task", "system"]),
            machine_data_keys: strings(&["is_machine", "system_generated"]),
            support_role: "support".to_string(),
            support_exposure: MetadataExposure::Sanitized,
            redact_ip: true,
            stats_self_only: false,
            allow_superadmin_scope_override: false,
            hide_machine_activity: true,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Caller classification derived from the effective role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Ordinary caller
    Member,
    /// The configured support role
    Support,
    /// Admin alias
    Admin,
    /// Superadmin alias
    Superadmin,
}

impl Privilege {
    /// Admins and superadmins.
    pub fn is_admin(self) -> bool {
        matches!(self, Privilege::Admin | Privilege::Superadmin)
    }

    /// Superadmins only.
    pub fn is_superadmin(self) -> bool {
        self == Privilege::Superadmin
    }
}

/// Rewrites filters according to an [`AccessPolicyConfig`].
///
/// # Examples
///
/// ```
/// use activity_trail::{AccessPolicy, AccessPolicyConfig, ActivityFilter, Actor};
///
/// let policy = AccessPolicy::new(AccessPolicyConfig::default());
/// let alice = Actor::new("u1").with_role("member").with_tenant("t1", "o1");
///
/// let filter = policy.apply(Some(&alice), None, ActivityFilter::default()).unwrap();
/// assert_eq!(filter.scope.tenant_id.as_deref(), Some("t1"));
/// assert_eq!(filter.user_id.as_deref(), Some("u1"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    config: AccessPolicyConfig,
}

impl AccessPolicy {
    /// Creates a policy.
    pub fn new(config: AccessPolicyConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AccessPolicyConfig {
        &self.config
    }

    /// Effective role: the explicit role, else the actor's role, else its type.
    ///
    /// The result is trimmed and lowercased.
    pub fn effective_role(&self, actor: Option<&Actor>, role: Option<&str>) -> String {
        let explicit = role.map(str::trim).filter(|r| !r.is_empty());
        let from_actor = actor.and_then(|a| {
            [a.role.as_str(), a.actor_type.as_str()]
                .into_iter()
                .map(str::trim)
                .find(|r| !r.is_empty())
        });
        explicit.or(from_actor).unwrap_or_default().to_lowercase()
    }

    /// Classifies a caller.
    pub fn privilege(&self, actor: Option<&Actor>, role: Option<&str>) -> Privilege {
        let role = self.effective_role(actor, role);
        if role.is_empty() {
            return Privilege::Member;
        }
        if contains_role(&self.config.superadmin_roles, &role) {
            Privilege::Superadmin
        } else if contains_role(&self.config.admin_roles, &role) {
            Privilege::Admin
        } else if role == self.config.support_role.trim().to_lowercase() {
            Privilege::Support
        } else {
            Privilege::Member
        }
    }

    /// Constrains a listing filter to what the caller may see.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` without an actor
    /// - `MissingScope` when the actor has no tenant and may not widen scope
    /// - `ChannelNotAllowed` when no requested channel is on the allow-list
    /// - `ChannelDenied` when the deny-list removes every requested channel
    pub fn apply(
        &self,
        actor: Option<&Actor>,
        role: Option<&str>,
        mut filter: ActivityFilter,
    ) -> Result<ActivityFilter, Violation> {
        let actor = actor.ok_or_else(unauthenticated)?;
        let privilege = self.privilege(Some(actor), role);

        filter.scope = self.scope_for(actor, privilege, filter.scope)?;
        if !privilege.is_admin() {
            filter.user_id = Some(actor.id.clone());
            filter.actor_id = Some(actor.id.clone());
        }

        let channels = self.reconcile_channels(&filter)?;
        filter.channel = None;
        filter.channels = channels;
        for denied in normalized(&self.config.denied_channels) {
            if !filter.exclude_channels.contains(&denied) {
                filter.exclude_channels.push(denied);
            }
        }

        filter.machine = self.machine_for(privilege, filter.machine);

        tracing::debug!(
            target: "activity_policy",
            actor_id = %actor.id,
            privilege = ?privilege,
            tenant_id = ?filter.scope.tenant_id,
            channels = ?filter.channels,
            "listing filter constrained"
        );
        Ok(filter)
    }

    /// Constrains a stats filter.
    ///
    /// Scoping and machine-activity handling match [`apply`](Self::apply);
    /// self-restriction only happens when `stats_self_only` is on.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` or `MissingScope`, as for `apply`.
    pub fn apply_stats(
        &self,
        actor: Option<&Actor>,
        role: Option<&str>,
        mut filter: StatsFilter,
    ) -> Result<StatsFilter, Violation> {
        let actor = actor.ok_or_else(unauthenticated)?;
        let privilege = self.privilege(Some(actor), role);

        filter.scope = self.scope_for(actor, privilege, filter.scope)?;
        if self.config.stats_self_only && !privilege.is_admin() {
            filter.user_id = Some(actor.id.clone());
            filter.actor_id = Some(actor.id.clone());
        }
        filter.machine = self.machine_for(privilege, filter.machine);

        tracing::debug!(
            target: "activity_policy",
            actor_id = %actor.id,
            privilege = ?privilege,
            tenant_id = ?filter.scope.tenant_id,
            "stats filter constrained"
        );
        Ok(filter)
    }

    fn scope_for(&self, actor: &Actor, privilege: Privilege, requested: Scope) -> Result<Scope, Violation> {
        if privilege.is_superadmin() && self.config.allow_superadmin_scope_override {
            return Ok(requested);
        }
        if actor.tenant_id.trim().is_empty() {
            return Err(Violation::new(
                ViolationKind::MissingScope,
                format!("actor {} has no tenant", actor.id),
            ));
        }
        Ok(Scope {
            tenant_id: Some(actor.tenant_id.clone()),
            org_id: Some(actor.org_id.clone()).filter(|o| !o.trim().is_empty()),
        })
    }

    fn reconcile_channels(&self, filter: &ActivityFilter) -> Result<Vec<String>, Violation> {
        let requested = dedup(filter.requested_channels());
        let allowed = normalized(&self.config.allowed_channels);
        let denied = normalized(&self.config.denied_channels);

        let candidates = if allowed.is_empty() {
            requested
        } else if requested.is_empty() {
            allowed
        } else {
            let kept: Vec<String> = requested.into_iter().filter(|c| allowed.contains(c)).collect();
            if kept.is_empty() {
                return Err(Violation::new(
                    ViolationKind::ChannelNotAllowed,
                    "none of the requested channels is allowed",
                ));
            }
            kept
        };

        if candidates.is_empty() {
            return Ok(candidates);
        }
        let remaining: Vec<String> = candidates.into_iter().filter(|c| !denied.contains(c)).collect();
        if remaining.is_empty() {
            return Err(Violation::new(
                ViolationKind::ChannelDenied,
                "every requested channel is denied",
            ));
        }
        Ok(remaining)
    }

    fn machine_for(&self, privilege: Privilege, mut machine: MachineActivity) -> MachineActivity {
        if machine.actor_types.is_empty() {
            machine.actor_types = normalized(&self.config.machine_actor_types);
        }
        if machine.data_keys.is_empty() {
            machine.data_keys = normalized(&self.config.machine_data_keys);
        }
        if !privilege.is_superadmin() && self.config.hide_machine_activity {
            machine.include = Some(false);
        }
        machine
    }
}

fn unauthenticated() -> Violation {
    Violation::new(ViolationKind::Unauthenticated, "an actor is required")
}

fn contains_role(aliases: &[String], role: &str) -> bool {
    aliases.iter().any(|alias| alias.trim().eq_ignore_ascii_case(role))
}

fn normalized(values: &[String]) -> Vec<String> {
    dedup(
        values
            .iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
    )
}

/// Removes duplicates, keeping first occurrences in order.
fn dedup(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Actor {
        Actor::new("u1").with_role("member").with_tenant("t1", "o1")
    }

    fn policy_with(f: impl FnOnce(&mut AccessPolicyConfig)) -> AccessPolicy {
        let mut config = AccessPolicyConfig::default();
        f(&mut config);
        AccessPolicy::new(config)
    }

    #[test]
    fn requires_an_actor() {
        let err = AccessPolicy::default()
            .apply(None, None, ActivityFilter::default())
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::Unauthenticated);
    }

    #[test]
    fn requires_a_tenant() {
        let actor = Actor::new("u1").with_role("admin");
        let err = AccessPolicy::default()
            .apply(Some(&actor), None, ActivityFilter::default())
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::MissingScope);
    }

    #[test]
    fn role_resolution_order() {
        let policy = AccessPolicy::default();
        let actor = Actor::new("u1").with_role("Admin").with_type("user");
        assert_eq!(policy.effective_role(Some(&actor), Some(" ROOT ")), "root");
        assert_eq!(policy.effective_role(Some(&actor), None), "admin");
        assert_eq!(policy.effective_role(Some(&Actor::new("j").with_type("job")), None), "job");
        assert_eq!(policy.privilege(Some(&actor), Some("root")), Privilege::Superadmin);
        assert_eq!(policy.privilege(Some(&actor), None), Privilege::Admin);
        assert_eq!(policy.privilege(Some(&actor), Some("support")), Privilege::Support);
        assert_eq!(policy.privilege(None, None), Privilege::Member);
    }

    #[test]
    fn member_is_pinned_to_self_and_tenant() {
        let requested = ActivityFilter {
            scope: Scope::tenant("t2"),
            user_id: Some("someone-else".into()),
            ..ActivityFilter::default()
        };
        let filter = AccessPolicy::default()
            .apply(Some(&member()), None, requested)
            .unwrap();
        assert_eq!(filter.scope, Scope::tenant("t1").with_org("o1"));
        assert_eq!(filter.user_id.as_deref(), Some("u1"));
        assert_eq!(filter.actor_id.as_deref(), Some("u1"));
    }

    #[test]
    fn admin_keeps_requested_user() {
        let requested = ActivityFilter {
            user_id: Some("u9".into()),
            ..ActivityFilter::default()
        };
        let filter = AccessPolicy::default()
            .apply(Some(&member()), Some("owner"), requested)
            .unwrap();
        assert_eq!(filter.user_id.as_deref(), Some("u9"));
        assert_eq!(filter.actor_id, None);
        assert_eq!(filter.scope.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn superadmin_widens_only_when_enabled() {
        let requested = ActivityFilter::for_tenant("t2");
        let pinned = AccessPolicy::default()
            .apply(Some(&member()), Some("superadmin"), requested.clone())
            .unwrap();
        assert_eq!(pinned.scope.tenant_id.as_deref(), Some("t1"));

        let widened = policy_with(|c| c.allow_superadmin_scope_override = true)
            .apply(Some(&member()), Some("superadmin"), requested)
            .unwrap();
        assert_eq!(widened.scope.tenant_id.as_deref(), Some("t2"));
    }

    #[test]
    fn allow_and_deny_lists_reconcile() {
        let policy = policy_with(|c| {
            c.allowed_channels = strings(&["settings", "bulk"]);
            c.denied_channels = strings(&["bulk"]);
        });
        let requested = ActivityFilter {
            channels: strings(&["settings", "bulk", "settings"]),
            ..ActivityFilter::default()
        };
        let filter = policy.apply(Some(&member()), None, requested).unwrap();
        assert_eq!(filter.channels, vec!["settings"]);
        assert_eq!(filter.channel, None);
    }

    #[test]
    fn disallowed_channel_is_an_error() {
        let policy = policy_with(|c| c.allowed_channels = strings(&["settings"]));
        let requested = ActivityFilter {
            channel: Some("auth".into()),
            ..ActivityFilter::default()
        };
        let err = policy.apply(Some(&member()), None, requested).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ChannelNotAllowed);
    }

    #[test]
    fn denied_single_channel_is_an_error() {
        let policy = policy_with(|c| c.denied_channels = strings(&["bulk"]));
        let requested = ActivityFilter {
            channel: Some("bulk".into()),
            ..ActivityFilter::default()
        };
        let err = policy.apply(Some(&member()), None, requested).unwrap_err();
        assert_eq!(err.kind, ViolationKind::ChannelDenied);
    }

    #[test]
    fn allow_list_is_default_channel_set() {
        let policy = policy_with(|c| {
            c.allowed_channels = strings(&["settings", "bulk"]);
            c.denied_channels = strings(&["bulk"]);
        });
        let filter = policy
            .apply(Some(&member()), None, ActivityFilter::default())
            .unwrap();
        assert_eq!(filter.channels, vec!["settings"]);
    }

    #[test]
    fn deny_list_without_request_becomes_exclusion() {
        let policy = policy_with(|c| c.denied_channels = strings(&["bulk"]));
        let filter = policy
            .apply(Some(&member()), None, ActivityFilter::default())
            .unwrap();
        assert!(filter.channels.is_empty());
        assert_eq!(filter.exclude_channels, vec!["bulk"]);
    }

    #[test]
    fn machine_activity_hidden_except_for_superadmin() {
        let policy = AccessPolicy::default();
        let filter = policy
            .apply(Some(&member()), None, ActivityFilter::default())
            .unwrap();
        assert_eq!(filter.machine.include, Some(false));
        assert_eq!(filter.machine.actor_types, strings(&["job", "task", "system"]));
        assert_eq!(filter.machine.data_keys, strings(&["is_machine", "system_generated"]));

        let filter = policy
            .apply(Some(&member()), Some("root"), ActivityFilter::default())
            .unwrap();
        assert_eq!(filter.machine.include, None);
    }

    #[test]
    fn stats_self_only_applies_to_non_admins() {
        let policy = policy_with(|c| c.stats_self_only = true);
        let stats = policy
            .apply_stats(Some(&member()), None, StatsFilter::default())
            .unwrap();
        assert_eq!(stats.user_id.as_deref(), Some("u1"));
        assert_eq!(stats.scope.tenant_id.as_deref(), Some("t1"));

        let stats = policy
            .apply_stats(Some(&member()), Some("admin"), StatsFilter::default())
            .unwrap();
        assert_eq!(stats.user_id, None);

        let stats = AccessPolicy::default()
            .apply_stats(Some(&member()), None, StatsFilter::default())
            .unwrap();
        assert_eq!(stats.user_id, None);
        assert_eq!(stats.machine.include, Some(false));
    }

    #[test]
    fn config_deserializes_partially() {
        let config: AccessPolicyConfig = serde_json::from_str(
            r#"{"admin_roles": ["manager"], "support_exposure": "none", "redact_ip": false}"#,
        )
        .unwrap();
        assert_eq!(config.admin_roles, vec!["manager"]);
        assert_eq!(config.support_exposure, MetadataExposure::None);
        assert!(!config.redact_ip);
        assert_eq!(config.superadmin_roles, vec!["superadmin", "root"]);
    }
}
