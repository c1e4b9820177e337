use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::activity::{normalize_timestamp, ActivityRecord, NewActivity};
use crate::config::TrailConfig;
use crate::enrich::{Enricher, NoopEnricher};
use crate::error::Error;
use crate::store::ActivityStore;

/// Append-only writer for activity records.
///
/// `AppendSink` is the single write path into the trail. For every call to
/// [`log`](Self::log) it:
/// - rejects input without a verb
/// - fills a fresh identifier and the current time when absent
/// - runs the configured enricher
/// - persists exactly one row
///
/// An enricher failure never drops the event: the sink logs the error and
/// persists whatever record the enricher policy hands back (the original
/// for a fail-fast chain).
///
/// # Examples
///
/// ```
/// use activity_trail::{AppendSink, NewActivity};
/// use activity_trail::store::{ActivityStore, MemoryStore};
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::new());
/// let sink = AppendSink::new(store.clone());
///
/// let record = sink
///     .log(NewActivity::new("user.created").with_tenant("t1", "o1"))
///     .expect("should persist");
///
/// assert!(!record.id.is_empty());
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Clone)]
pub struct AppendSink {
    store: Arc<dyn ActivityStore>,
    enricher: Arc<dyn Enricher>,
}

impl AppendSink {
    /// Creates a sink without pre-write enrichment.
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self {
            store,
            enricher: Arc::new(NoopEnricher),
        }
    }

    /// Creates a sink running `enrichers` under the configured chain policy.
    pub fn from_config(
        store: Arc<dyn ActivityStore>,
        config: &TrailConfig,
        enrichers: impl IntoIterator<Item = Arc<dyn Enricher>>,
    ) -> Self {
        Self::new(store).with_enricher(Arc::new(config.enricher_chain(enrichers)))
    }

    /// Sets the pre-write enricher (or chain).
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Validates, completes, enriches and persists one activity.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` when the verb is blank, before or after enrichment
    /// - `Store` when the backend rejects the write; nothing is persisted
    pub fn log(&self, activity: NewActivity) -> Result<ActivityRecord, Error> {
        if activity.verb.trim().is_empty() {
            return Err(Error::InvalidInput("verb is required".into()));
        }

        let id = activity
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let created_at = normalize_timestamp(activity.created_at.unwrap_or_else(Utc::now));
        let record = ActivityRecord::from_new(activity, id, created_at);

        let record = match self.enricher.enrich(&record) {
            Ok(enriched) => enriched,
            Err(err) => {
                tracing::warn!(
                    target: "activity_sink",
                    record_id = %record.id,
                    enricher = %err.enricher,
                    error = %err.message,
                    "pre-write enrichment failed; persisting original record"
                );
                record
            }
        };
        if record.verb.trim().is_empty() {
            return Err(Error::InvalidInput("verb is required".into()));
        }
        if record.id.trim().is_empty() {
            return Err(Error::InvalidInput("identifier is required".into()));
        }

        self.store.insert(&record)?;
        tracing::debug!(
            target: "activity_sink",
            record_id = %record.id,
            verb = %record.verb,
            tenant_id = %record.tenant_id,
            "activity recorded"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::tests::{Broken, SetKey};
    use crate::enrich::{ChainPolicy, EnricherChain, EnrichError};
    use crate::error::StoreErrorKind;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn sink() -> (Arc<MemoryStore>, AppendSink) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), AppendSink::new(store))
    }

    #[test]
    fn blank_verb_is_rejected_without_side_effects() {
        let (store, sink) = sink();
        let err = sink.log(NewActivity::new("  ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn fills_identifier_and_timestamp() {
        let (store, sink) = sink();
        let before = Utc::now() - chrono::Duration::seconds(1);
        let record = sink.log(NewActivity::new("user.created")).unwrap();
        assert!(Uuid::parse_str(&record.id).is_ok());
        assert!(record.created_at >= before);
        assert_eq!(store.get(&record.id).unwrap(), Some(record));
    }

    #[test]
    fn keeps_supplied_identifier_and_timestamp() {
        let (_, sink) = sink();
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let record = sink
            .log(NewActivity::new("user.created").with_id("evt-1").at(at))
            .unwrap();
        assert_eq!(record.id, "evt-1");
        assert_eq!(record.created_at, normalize_timestamp(at));
    }

    #[test]
    fn identifiers_are_unique() {
        let (store, sink) = sink();
        let a = sink.log(NewActivity::new("user.created")).unwrap();
        let b = sink.log(NewActivity::new("user.created")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_identifier_propagates_store_error() {
        let (store, sink) = sink();
        sink.log(NewActivity::new("user.created").with_id("dup")).unwrap();
        let err = sink.log(NewActivity::new("user.created").with_id("dup")).unwrap_err();
        match err {
            Error::Store(e) => assert_eq!(e.kind(), StoreErrorKind::Conflict),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn enricher_runs_before_persistence() {
        let (store, sink) = sink();
        let sink = sink.with_enricher(Arc::new(SetKey("actor_display", "Alice")));
        let record = sink.log(NewActivity::new("user.created")).unwrap();
        let stored = store.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.data["actor_display"], json!("Alice"));
    }

    #[test]
    fn fail_fast_chain_persists_original() {
        let (store, sink) = sink();
        let chain = EnricherChain::new(ChainPolicy::FailFast)
            .with(Arc::new(SetKey("a", "1")))
            .with(Arc::new(Broken));
        let sink = sink.with_enricher(Arc::new(chain));
        let record = sink.log(NewActivity::new("user.created")).unwrap();
        assert!(store.get(&record.id).unwrap().unwrap().data.is_empty());
    }

    #[test]
    fn best_effort_chain_persists_intermediate() {
        let (store, sink) = sink();
        let chain = EnricherChain::new(ChainPolicy::BestEffort)
            .with(Arc::new(SetKey("a", "1")))
            .with(Arc::new(Broken));
        let sink = sink.with_enricher(Arc::new(chain));
        let record = sink.log(NewActivity::new("user.created")).unwrap();
        assert_eq!(store.get(&record.id).unwrap().unwrap().data["a"], json!("1"));
    }

    struct ClearVerb;

    impl Enricher for ClearVerb {
        fn name(&self) -> &str {
            "clear_verb"
        }

        fn enrich(&self, record: &ActivityRecord) -> Result<ActivityRecord, EnrichError> {
            let mut next = record.clone();
            next.verb.clear();
            Ok(next)
        }
    }

    #[test]
    fn enricher_cannot_blank_the_verb() {
        let (store, sink) = sink();
        let sink = sink.with_enricher(Arc::new(ClearVerb));
        assert!(sink.log(NewActivity::new("user.created")).is_err());
        assert!(store.is_empty());
    }
}
