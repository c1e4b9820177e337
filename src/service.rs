use std::sync::Arc;

use crate::activity::{ActivityFilter, ActivityStats, Page, StatsFilter};
use crate::config::TrailConfig;
use crate::error::Error;
use crate::policy::{AccessPolicy, Actor};
use crate::query::QueryEngine;
use crate::sanitizer::{RecordSanitizer, RuleMasker};
use crate::store::ActivityStore;

/// End-user entry point: policy, then query, then sanitization.
///
/// # Examples
///
/// ```
/// use activity_trail::{ActivityFilter, ActivityService, Actor, AppendSink, NewActivity, TrailConfig};
/// use activity_trail::store::MemoryStore;
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::new());
/// let sink = AppendSink::new(store.clone());
/// sink.log(NewActivity::new("user.created").with_tenant("t1", "o1").with_actor("u1")).unwrap();
/// sink.log(NewActivity::new("user.created").with_tenant("t2", "o1").with_actor("u1")).unwrap();
///
/// let service = ActivityService::new(store, &TrailConfig::default());
/// let alice = Actor::new("u1").with_role("member").with_tenant("t1", "o1");
/// let page = service.list_activity(Some(&alice), None, ActivityFilter::default()).unwrap();
/// assert_eq!(page.total, 1);
/// ```
#[derive(Debug, Clone)]
pub struct ActivityService {
    policy: AccessPolicy,
    query: QueryEngine,
    sanitizer: RecordSanitizer,
}

impl ActivityService {
    /// Builds the service from configuration.
    pub fn new(store: Arc<dyn ActivityStore>, config: &TrailConfig) -> Self {
        let policy = AccessPolicy::new(config.policy.clone());
        let sanitizer = RecordSanitizer::new(
            policy.clone(),
            Arc::new(RuleMasker::new(config.masking.clone())),
        );
        Self::from_parts(policy, QueryEngine::new(store), sanitizer)
    }

    /// Builds the service from prepared parts.
    pub fn from_parts(policy: AccessPolicy, query: QueryEngine, sanitizer: RecordSanitizer) -> Self {
        Self {
            policy,
            query,
            sanitizer,
        }
    }

    /// Lists the caller's visible activity, sanitized for the caller.
    ///
    /// # Errors
    ///
    /// `Violation` when the policy rejects the request, otherwise as for
    /// [`QueryEngine::list_activity`].
    pub fn list_activity(
        &self,
        actor: Option<&Actor>,
        role: Option<&str>,
        filter: ActivityFilter,
    ) -> Result<Page, Error> {
        let filter = self.policy.apply(actor, role, filter)?;
        let mut page = self.query.list_activity(&filter)?;
        page.records = self.sanitizer.sanitize(actor, role, page.records);
        Ok(page)
    }

    /// Aggregates the caller's visible activity.
    ///
    /// # Errors
    ///
    /// `Violation` when the policy rejects the request, otherwise as for
    /// [`QueryEngine::activity_stats`].
    pub fn activity_stats(
        &self,
        actor: Option<&Actor>,
        role: Option<&str>,
        filter: StatsFilter,
    ) -> Result<ActivityStats, Error> {
        let filter = self.policy.apply_stats(actor, role, filter)?;
        self.query.activity_stats(&filter)
    }
}
