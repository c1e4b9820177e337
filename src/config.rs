use std::sync::Arc;

use serde::Deserialize;

use crate::backfill::BackfillConfig;
use crate::enrich::{ChainPolicy, Enricher, EnricherChain};
use crate::error::Error;
use crate::policy::AccessPolicyConfig;
use crate::sanitizer::MaskingRules;

/// Aggregate configuration for the activity trail.
///
/// Every section is optional; missing fields take their documented
/// defaults.
///
/// # Examples
///
/// ```
/// use activity_trail::TrailConfig;
///
/// let config = TrailConfig::from_json_str(r#"{
///     "policy": { "denied_channels": ["bulk"] },
///     "backfill": { "page_size": 500 }
/// }"#).unwrap();
///
/// assert_eq!(config.policy.denied_channels, vec!["bulk"]);
/// assert_eq!(config.backfill.page_size, 500);
/// assert_eq!(config.masking.max_depth, 32);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    /// Access policy
    pub policy: AccessPolicyConfig,
    /// Payload masking
    pub masking: MaskingRules,
    /// Enrichment backfill
    pub backfill: BackfillConfig,
    /// Error policy for the write-side enricher chain
    pub enrichment: ChainPolicy,
}

impl TrailConfig {
    /// Parses configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the document is malformed or has wrongly typed
    /// fields.
    pub fn from_json_str(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidInput(format!("invalid configuration: {}", e)))
    }

    /// Chains `enrichers` in order under the configured error policy.
    pub fn enricher_chain(&self, enrichers: impl IntoIterator<Item = Arc<dyn Enricher>>) -> EnricherChain {
        enrichers
            .into_iter()
            .fold(EnricherChain::new(self.enrichment), EnricherChain::with)
    }
}
