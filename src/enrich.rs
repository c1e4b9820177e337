//! Record enrichers.
//!
//! An [`Enricher`] derives extra payload fields for a record. The append
//! sink runs one before persistence; the backfill engine runs one after
//! resolver merges. [`EnricherChain`] composes several with a chosen error
//! policy.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::activity::ActivityRecord;

/// Error raised by an enricher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("enricher {enricher} failed: {message}")]
pub struct EnrichError {
    /// Name of the failing enricher
    pub enricher: String,
    /// Failure detail
    pub message: String,
}

impl EnrichError {
    /// Creates a new enrich error.
    pub fn new(enricher: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            enricher: enricher.into(),
            message: message.into(),
        }
    }
}

/// Capability that derives payload fields for a record.
///
/// Implementations return a new record and leave the input untouched.
pub trait Enricher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Produces an enriched copy of the record.
    fn enrich(&self, record: &ActivityRecord) -> Result<ActivityRecord, EnrichError>;
}

/// Enricher that returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnricher;

impl Enricher for NoopEnricher {
    fn name(&self) -> &str {
        "noop"
    }

    fn enrich(&self, record: &ActivityRecord) -> Result<ActivityRecord, EnrichError> {
        Ok(record.clone())
    }
}

/// Error policy for an [`EnricherChain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicy {
    /// Stop at the first error and hand back the original record.
    #[default]
    FailFast,
    /// Log errors and continue from the last successful result.
    BestEffort,
}

impl fmt::Display for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainPolicy::FailFast => write!(f, "fail_fast"),
            ChainPolicy::BestEffort => write!(f, "best_effort"),
        }
    }
}

/// Ordered composition of enrichers.
///
/// # Example
///
/// ```
/// use activity_trail::enrich::{ChainPolicy, EnricherChain, NoopEnricher};
/// use std::sync::Arc;
///
/// let chain = EnricherChain::new(ChainPolicy::BestEffort)
///     .with(Arc::new(NoopEnricher));
/// assert_eq!(chain.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct EnricherChain {
    policy: ChainPolicy,
    enrichers: Vec<Arc<dyn Enricher>>,
}

impl EnricherChain {
    /// Creates an empty chain.
    pub fn new(policy: ChainPolicy) -> Self {
        Self {
            policy,
            enrichers: Vec::new(),
        }
    }

    /// Appends an enricher.
    pub fn with(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    /// Returns the error policy.
    pub fn policy(&self) -> ChainPolicy {
        self.policy
    }

    /// Number of enrichers in the chain.
    pub fn len(&self) -> usize {
        self.enrichers.len()
    }

    /// Returns true if the chain holds no enrichers.
    pub fn is_empty(&self) -> bool {
        self.enrichers.is_empty()
    }
}

impl fmt::Debug for EnricherChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.enrichers.iter().map(|e| e.name()).collect();
        f.debug_struct("EnricherChain")
            .field("policy", &self.policy)
            .field("enrichers", &names)
            .finish()
    }
}

impl Enricher for EnricherChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn enrich(&self, record: &ActivityRecord) -> Result<ActivityRecord, EnrichError> {
        let mut current = record.clone();
        for enricher in &self.enrichers {
            match enricher.enrich(&current) {
                Ok(next) => current = next,
                Err(err) => match self.policy {
                    ChainPolicy::FailFast => return Err(err),
                    ChainPolicy::BestEffort => {
                        tracing::warn!(
                            target: "activity_sink",
                            record_id = %record.id,
                            enricher = %err.enricher,
                            error = %err.message,
                            "enricher failed; continuing with last good result"
                        );
                    }
                },
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::activity::NewActivity;
    use chrono::Utc;
    use serde_json::json;

    /// Sets one payload key.
    pub(crate) struct SetKey(pub &'static str, pub &'static str);

    impl Enricher for SetKey {
        fn name(&self) -> &str {
            self.0
        }

        fn enrich(&self, record: &ActivityRecord) -> Result<ActivityRecord, EnrichError> {
            let mut next = record.clone();
            next.data.insert(self.0.to_string(), json!(self.1));
            Ok(next)
        }
    }

    /// Always fails.
    pub(crate) struct Broken;

    impl Enricher for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn enrich(&self, _record: &ActivityRecord) -> Result<ActivityRecord, EnrichError> {
            Err(EnrichError::new("broken", "directory offline"))
        }
    }

    fn record() -> ActivityRecord {
        ActivityRecord::from_new(NewActivity::new("user.created"), "r1".into(), Utc::now())
    }

    #[test]
    fn chain_applies_in_order() {
        let chain = EnricherChain::new(ChainPolicy::FailFast)
            .with(Arc::new(SetKey("a", "1")))
            .with(Arc::new(SetKey("b", "2")));
        let out = chain.enrich(&record()).unwrap();
        assert_eq!(out.data["a"], json!("1"));
        assert_eq!(out.data["b"], json!("2"));
    }

    #[test]
    fn fail_fast_stops_at_first_error() {
        let chain = EnricherChain::new(ChainPolicy::FailFast)
            .with(Arc::new(SetKey("a", "1")))
            .with(Arc::new(Broken))
            .with(Arc::new(SetKey("b", "2")));
        let err = chain.enrich(&record()).unwrap_err();
        assert_eq!(err.enricher, "broken");
    }

    #[test]
    fn best_effort_keeps_last_good_result() {
        let chain = EnricherChain::new(ChainPolicy::BestEffort)
            .with(Arc::new(SetKey("a", "1")))
            .with(Arc::new(Broken))
            .with(Arc::new(SetKey("b", "2")));
        let out = chain.enrich(&record()).unwrap();
        assert_eq!(out.data["a"], json!("1"));
        assert_eq!(out.data["b"], json!("2"));
    }

    #[test]
    fn noop_returns_input() {
        let input = record();
        assert_eq!(NoopEnricher.enrich(&input).unwrap(), input);
    }
}
