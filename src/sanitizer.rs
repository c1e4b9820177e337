use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::{ActivityRecord, Payload};
use crate::policy::{AccessPolicy, Actor, Privilege};

/// Payload visibility for the support role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataExposure {
    /// Payload is always removed
    None,
    /// Payload is masked like for any other caller
    #[default]
    Sanitized,
    /// Payload is returned verbatim
    All,
}

impl fmt::Display for MetadataExposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Sanitized => write!(f, "sanitized"),
            Self::All => write!(f, "all"),
        }
    }
}

/// How a matching value is rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskStrategy {
    /// Replace with the redaction text
    #[default]
    Redact,
    /// Keep the first character and the domain of an address
    Email,
}

/// One masking rule: keys containing `pattern` (case-insensitive) are masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRule {
    /// Substring matched against payload keys
    pub pattern: String,
    /// Rewrite applied to matching values
    #[serde(default)]
    pub strategy: MaskStrategy,
}

impl MaskRule {
    /// Rule that redacts matching values.
    pub fn redact(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            strategy: MaskStrategy::Redact,
        }
    }

    /// Rule that masks matching values as email addresses.
    pub fn email(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            strategy: MaskStrategy::Email,
        }
    }

    fn matches(&self, key: &str) -> bool {
        !self.pattern.is_empty() && key.to_lowercase().contains(&self.pattern.to_lowercase())
    }
}

/// Immutable masking configuration.
///
/// Rules are checked in order; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaskingRules {
    /// Ordered rules
    pub rules: Vec<MaskRule>,
    /// Replacement text for redacted values
    pub redaction: String,
    /// Deepest nesting walked before giving up
    pub max_depth: usize,
}

impl Default for MaskingRules {
    fn default() -> Self {
        Self {
            rules: vec![
                MaskRule::redact("password"),
                MaskRule::redact("passwd"),
                MaskRule::redact("secret"),
                MaskRule::redact("token"),
                MaskRule::redact("api_key"),
                MaskRule::redact("authorization"),
                MaskRule::redact("session"),
                MaskRule::email("email"),
            ],
            redaction: "[REDACTED]".to_string(),
            max_depth: 32,
        }
    }
}

/// Error raised when a payload cannot be masked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("masking failed: {message}")]
pub struct MaskError {
    message: String,
}

impl MaskError {
    /// Creates a mask error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Rewrites sensitive values in a payload.
pub trait PayloadMasker: Send + Sync {
    /// Returns a masked copy of the payload.
    ///
    /// # Errors
    ///
    /// Returns `MaskError` when the payload cannot be fully processed;
    /// callers must not fall back to the raw payload.
    fn mask(&self, data: &Payload) -> Result<Payload, MaskError>;
}

/// Masker driven by [`MaskingRules`].
///
/// # Examples
///
/// ```
/// use activity_trail::{PayloadMasker, RuleMasker};
/// use serde_json::json;
///
/// let masker = RuleMasker::default();
/// let data = json!({"password": "hunter2", "actor_email": "alice@example.com"});
/// let masked = masker.mask(data.as_object().unwrap()).unwrap();
///
/// assert_eq!(masked["password"], "[REDACTED]");
/// assert_eq!(masked["actor_email"], "a***@example.com");
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuleMasker {
    rules: MaskingRules,
}

impl RuleMasker {
    /// Creates a masker.
    pub fn new(rules: MaskingRules) -> Self {
        Self { rules }
    }

    /// Returns the rules.
    pub fn rules(&self) -> &MaskingRules {
        &self.rules
    }

    fn mask_map(&self, data: &Payload, depth: usize) -> Result<Payload, MaskError> {
        if depth > self.rules.max_depth {
            return Err(MaskError::new(format!(
                "payload nested deeper than {}",
                self.rules.max_depth
            )));
        }
        let mut out = Payload::new();
        for (key, value) in data {
            let masked = match self.rules.rules.iter().find(|r| r.matches(key)) {
                Some(rule) => self.rewrite(rule.strategy, value),
                None => self.mask_value(value, depth + 1)?,
            };
            out.insert(key.clone(), masked);
        }
        Ok(out)
    }

    fn mask_value(&self, value: &Value, depth: usize) -> Result<Value, MaskError> {
        match value {
            Value::Object(map) => Ok(Value::Object(self.mask_map(map, depth)?)),
            Value::Array(items) => {
                if depth > self.rules.max_depth {
                    return Err(MaskError::new(format!(
                        "payload nested deeper than {}",
                        self.rules.max_depth
                    )));
                }
                items
                    .iter()
                    .map(|item| self.mask_value(item, depth + 1))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            other => Ok(other.clone()),
        }
    }

    fn rewrite(&self, strategy: MaskStrategy, value: &Value) -> Value {
        match (strategy, value) {
            (MaskStrategy::Email, Value::String(address)) => match mask_email(address) {
                Some(masked) => Value::String(masked),
                None => Value::String(self.rules.redaction.clone()),
            },
            (_, Value::Null) => Value::Null,
            _ => Value::String(self.rules.redaction.clone()),
        }
    }
}

impl PayloadMasker for RuleMasker {
    fn mask(&self, data: &Payload) -> Result<Payload, MaskError> {
        self.mask_map(data, 0)
    }
}

/// `alice@example.com` becomes `a***@example.com`.
fn mask_email(address: &str) -> Option<String> {
    let (local, domain) = address.trim().split_once('@')?;
    let first = local.chars().next()?;
    if domain.is_empty() {
        return None;
    }
    Some(format!("{}***@{}", first, domain))
}

/// Output-side redaction for activity records.
///
/// - superadmins receive records untouched
/// - the support role gets the payload its exposure tier allows
/// - everyone else gets a masked payload
///
/// Everyone but superadmins loses the origin IP when `redact_ip` is on. A
/// masking failure yields an empty payload.
#[derive(Clone)]
pub struct RecordSanitizer {
    policy: AccessPolicy,
    masker: Arc<dyn PayloadMasker>,
}

impl fmt::Debug for RecordSanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSanitizer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RecordSanitizer {
    /// Creates a sanitizer with a custom masker.
    pub fn new(policy: AccessPolicy, masker: Arc<dyn PayloadMasker>) -> Self {
        Self { policy, masker }
    }

    /// Creates a sanitizer using [`RuleMasker`] with the given rules.
    pub fn with_rules(policy: AccessPolicy, rules: MaskingRules) -> Self {
        Self::new(policy, Arc::new(RuleMasker::new(rules)))
    }

    /// Applies role-dependent redaction to each record.
    pub fn sanitize(
        &self,
        actor: Option<&Actor>,
        role: Option<&str>,
        records: Vec<ActivityRecord>,
    ) -> Vec<ActivityRecord> {
        let privilege = self.policy.privilege(actor, role);
        if privilege.is_superadmin() {
            return records;
        }
        let config = self.policy.config();
        records
            .into_iter()
            .map(|mut record| {
                record.data = match privilege {
                    Privilege::Support => match config.support_exposure {
                        MetadataExposure::None => Payload::new(),
                        MetadataExposure::All => record.data,
                        MetadataExposure::Sanitized => self.masked(&record),
                    },
                    _ => self.masked(&record),
                };
                if config.redact_ip {
                    record.ip.clear();
                }
                record
            })
            .collect()
    }

    fn masked(&self, record: &ActivityRecord) -> Payload {
        match self.masker.mask(&record.data) {
            Ok(masked) => masked,
            Err(err) => {
                tracing::warn!(
                    target: "activity_policy",
                    record_id = %record.id,
                    error = %err,
                    "masking failed; dropping payload"
                );
                Payload::new()
            }
        }
    }
}
