//! Enrichment backfill.
//!
//! The engine scans historical records in canonical order, resolves actor
//! and object identifiers in tenant batches, and merges display fields into
//! each payload without ever replacing a value that is already there.
//!
//! # Selection
//!
//! A record is eligible when it lacks any configured required key, or when
//! its `enriched_at` stamp is older than the run's cutoff (a missing stamp
//! counts as old). Backends without JSON support over-select; every row is
//! re-checked in process before it is touched.
//!
//! # Writes
//!
//! Each write is a [`MergePatch`]: newly derived keys go in `set_if_missing`,
//! and only `enriched_at`/`enricher_version` are forced. A record with
//! nothing new that is not stale is skipped without a write, which makes a
//! second run over unchanged data a no-op. Because every write is additive
//! apart from the two stamp keys, overlapping runs converge.

mod job;
mod resolver;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::activity::{
    format_stamp, keys, normalize_timestamp, ActivityRecord, Cursor, Payload, Scope,
    DEFAULT_ENRICHER_VERSION,
};
use crate::cancel::Cancellation;
use crate::enrich::{Enricher, NoopEnricher};
use crate::error::Error;
use crate::logging::RunLog;
use crate::store::{ActivityQuery, ActivityStore, MergePatch, PayloadCondition};

pub use job::{BackfillJob, JobRunner, DEFAULT_SCHEDULE, JOB_NAME};
pub use resolver::{
    ActorInfo, ActorResolver, NoopResolver, ObjectInfo, ObjectKey, ObjectResolver, ResolveError,
};

/// Page size used when neither the input nor the config sets one.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Largest page the scanner will request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Clamps a requested batch size; zero selects the default.
pub fn normalize_batch_size(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_BATCH_SIZE,
        n => n.clamp(1, MAX_BATCH_SIZE),
    }
}

/// Source of the enrichment stamp.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Backfill settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// A record lacking any of these payload keys is eligible
    pub missing_keys: Vec<String>,
    /// Default page size
    pub page_size: usize,
    /// Value written to `enricher_version`
    pub enricher_version: String,
    /// Recurring schedule expression for the job handle
    pub schedule: String,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            missing_keys: vec![
                keys::ACTOR_DISPLAY.to_string(),
                keys::OBJECT_DISPLAY.to_string(),
            ],
            page_size: DEFAULT_BATCH_SIZE,
            enricher_version: DEFAULT_ENRICHER_VERSION.to_string(),
            schedule: DEFAULT_SCHEDULE.to_string(),
        }
    }
}

/// Parameters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillInput {
    /// Tenant/org boundary, empty for all
    pub scope: Scope,
    /// Page size, 0 for the configured default
    pub batch_size: usize,
    /// Records stamped before this instant are re-enriched
    pub enriched_before: Option<DateTime<Utc>>,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Run identifier used in logs
    pub run_id: String,
    /// Rows examined
    pub processed: u64,
    /// Rows written
    pub enriched: u64,
    /// Rows whose write failed
    pub failed: u64,
    /// Rows that needed no write
    pub skipped: u64,
    /// Pages scanned
    pub pages: u64,
}

/// Resolved information for one tenant on one page.
#[derive(Default)]
struct TenantInfo {
    actors: HashMap<String, ActorInfo>,
    objects: HashMap<ObjectKey, ObjectInfo>,
}

/// Idempotent enrichment engine.
///
/// # Examples
///
/// ```
/// use activity_trail::backfill::{BackfillEngine, BackfillInput};
/// use activity_trail::store::MemoryStore;
/// use activity_trail::{AppendSink, Cancellation, NewActivity};
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::new());
/// AppendSink::new(store.clone())
///     .log(NewActivity::new("user.created").with_tenant("t1", "o1"))
///     .unwrap();
///
/// let engine = BackfillEngine::builder().store(store).build().unwrap();
/// let report = engine
///     .execute(&BackfillInput::default(), &Cancellation::new())
///     .unwrap();
/// assert_eq!(report.processed, 1);
/// assert_eq!(report.enriched, 0);
/// ```
pub struct BackfillEngine {
    store: Arc<dyn ActivityStore>,
    actors: Arc<dyn ActorResolver>,
    objects: Arc<dyn ObjectResolver>,
    enricher: Arc<dyn Enricher>,
    clock: Arc<dyn Clock>,
    config: BackfillConfig,
}

impl std::fmt::Debug for BackfillEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillEngine")
            .field("enricher", &self.enricher.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackfillEngine {
    /// Starts a builder.
    pub fn builder() -> BackfillEngineBuilder {
        BackfillEngineBuilder::default()
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Current time according to the engine clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs one backfill pass.
    ///
    /// # Errors
    ///
    /// - `Cancelled`/`DeadlineExceeded` when the token fires; records already
    ///   written stay enriched
    /// - `Store` when a page scan fails
    ///
    /// Resolver and per-record write failures are logged and counted, never
    /// returned.
    pub fn execute(&self, input: &BackfillInput, cancel: &Cancellation) -> Result<BackfillReport, Error> {
        let run_id = Uuid::new_v4().to_string();
        let log = RunLog::new(&run_id);
        let mut report = BackfillReport {
            run_id: run_id.clone(),
            ..BackfillReport::default()
        };

        let page_size = normalize_batch_size(if input.batch_size == 0 {
            self.config.page_size
        } else {
            input.batch_size
        });
        let Some(mut selection) = self.selection(input) else {
            log.debug(format_args!("no missing keys and no cutoff; nothing to select"));
            return Ok(report);
        };
        selection.limit = Some(page_size);

        loop {
            // 1. Stop between pages
            if let Err(err) = cancel.check() {
                return Err(self.interrupted(&log, &report, err));
            }

            // 2. Scan one page behind the cursor
            let rows = self.store.list(&selection)?;
            report.pages += 1;
            if rows.is_empty() {
                break;
            }

            // 3. Resolve per tenant, once per page
            let info = self.resolve_page(&log, &rows, &selection);

            // 4. Merge per record
            for record in &rows {
                if let Err(err) = cancel.check() {
                    return Err(self.interrupted(&log, &report, err));
                }
                report.processed += 1;
                let tenant = info.get(record.tenant_id.as_str());
                self.process(&log, &mut report, &selection, input.enriched_before, record, tenant);
            }

            if rows.len() < page_size {
                break;
            }
            match rows.last() {
                Some(last) => selection.cursor = Some(Cursor::of(last)),
                None => break,
            }
        }

        log.info(format_args!(
            "backfill finished: processed={} enriched={} failed={} skipped={} pages={}",
            report.processed, report.enriched, report.failed, report.skipped, report.pages
        ));
        Ok(report)
    }

    fn selection(&self, input: &BackfillInput) -> Option<ActivityQuery> {
        let mut require_any: Vec<PayloadCondition> = self
            .config
            .missing_keys
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| PayloadCondition::KeyMissing(k.clone()))
            .collect();
        if let Some(before) = input.enriched_before {
            require_any.push(PayloadCondition::StampBefore {
                key: keys::ENRICHED_AT.to_string(),
                before,
            });
        }
        if require_any.is_empty() {
            return None;
        }
        Some(ActivityQuery {
            tenant_id: input.scope.tenant_id.clone(),
            org_id: input.scope.org_id.clone(),
            require_any,
            ..ActivityQuery::default()
        })
    }

    fn resolve_page<'r>(
        &self,
        log: &RunLog<'_>,
        rows: &'r [ActivityRecord],
        selection: &ActivityQuery,
    ) -> HashMap<&'r str, TenantInfo> {
        let mut groups: BTreeMap<&str, (BTreeSet<String>, BTreeSet<ObjectKey>)> = BTreeMap::new();
        for record in rows.iter().filter(|r| selection.matches(r)) {
            let (actors, objects) = groups.entry(record.tenant_id.as_str()).or_default();
            if let Some(actor_id) = record.effective_actor_id() {
                actors.insert(actor_id.to_string());
            }
            if let Some((object_type, object_id)) = record.effective_object() {
                objects.insert(ObjectKey::new(object_type, object_id));
            }
        }

        let mut resolved = HashMap::new();
        for (tenant, (actor_ids, object_keys)) in groups {
            let mut info = TenantInfo::default();
            if !actor_ids.is_empty() {
                let actor_ids: Vec<String> = actor_ids.into_iter().collect();
                match self.actors.resolve_actors(tenant, &actor_ids) {
                    Ok(found) => info.actors = found,
                    Err(err) => log.warn(format_args!(
                        "actor resolution failed for tenant {}: {}",
                        tenant, err
                    )),
                }
            }
            if !object_keys.is_empty() {
                let object_keys: Vec<ObjectKey> = object_keys.into_iter().collect();
                match self.objects.resolve_objects(tenant, &object_keys) {
                    Ok(found) => info.objects = found,
                    Err(err) => log.warn(format_args!(
                        "object resolution failed for tenant {}: {}",
                        tenant, err
                    )),
                }
            }
            resolved.insert(tenant, info);
        }
        resolved
    }

    fn process(
        &self,
        log: &RunLog<'_>,
        report: &mut BackfillReport,
        selection: &ActivityQuery,
        enriched_before: Option<DateTime<Utc>>,
        record: &ActivityRecord,
        info: Option<&TenantInfo>,
    ) {
        if !selection.matches(record) {
            report.skipped += 1;
            log.debug(format_args!("record {} not eligible on re-check", record.id));
            return;
        }

        let mut candidate = record.clone();
        if let Some(info) = info {
            fill_actor(&mut candidate, info);
            fill_object(&mut candidate, info);
        }
        let candidate = match self.enricher.enrich(&candidate) {
            Ok(enriched) => enriched,
            Err(err) => {
                log.warn(format_args!("enricher failed for record {}: {}", record.id, err));
                candidate
            }
        };

        let set_if_missing = missing_delta(&record.data, &candidate.data);
        let stale = enriched_before.map_or(false, |before| {
            PayloadCondition::StampBefore {
                key: keys::ENRICHED_AT.to_string(),
                before,
            }
            .holds(&record.data)
        });
        if set_if_missing.is_empty() && !stale {
            report.skipped += 1;
            log.debug(format_args!("record {} has nothing new", record.id));
            return;
        }

        let patch = MergePatch {
            set_if_missing,
            force: self.stamp(),
        };
        match self.store.merge_data(&record.id, &patch) {
            Ok(()) => {
                report.enriched += 1;
                tracing::debug!(
                    target: "activity_backfill",
                    run_id = %log.run_id(),
                    record_id = %record.id,
                    tenant_id = %record.tenant_id,
                    keys = patch.set_if_missing.len(),
                    "record enriched"
                );
            }
            Err(err) => {
                report.failed += 1;
                log.error(format_args!("merge failed for record {}: {}", record.id, err));
            }
        }
    }

    fn stamp(&self) -> Payload {
        let mut force = Payload::new();
        force.insert(
            keys::ENRICHED_AT.to_string(),
            Value::String(format_stamp(normalize_timestamp(self.clock.now()))),
        );
        force.insert(
            keys::ENRICHER_VERSION.to_string(),
            Value::String(self.config.enricher_version.clone()),
        );
        force
    }

    fn interrupted(&self, log: &RunLog<'_>, report: &BackfillReport, err: Error) -> Error {
        log.warn(format_args!(
            "backfill interrupted ({}): processed={} enriched={} failed={} skipped={} pages={}",
            err, report.processed, report.enriched, report.failed, report.skipped, report.pages
        ));
        err
    }
}

fn insert_missing(data: &mut Payload, key: &str, value: Value) {
    if !data.contains_key(key) {
        data.insert(key.to_string(), value);
    }
}

fn fill_actor(record: &mut ActivityRecord, info: &TenantInfo) {
    let Some(actor_id) = record.effective_actor_id().map(str::to_string) else {
        return;
    };
    let Some(actor) = info.actors.get(&actor_id) else {
        return;
    };
    let data = &mut record.data;
    if let Some(display) = &actor.display {
        insert_missing(data, keys::ACTOR_DISPLAY, Value::String(display.clone()));
    }
    if let Some(email) = &actor.email {
        insert_missing(data, keys::ACTOR_EMAIL, Value::String(email.clone()));
    }
    if let Some(actor_type) = &actor.actor_type {
        insert_missing(data, keys::ACTOR_TYPE, Value::String(actor_type.clone()));
    }
    insert_missing(data, keys::ACTOR_ID, Value::String(actor_id));
}

fn fill_object(record: &mut ActivityRecord, info: &TenantInfo) {
    let Some(key) = record
        .effective_object()
        .map(|(object_type, object_id)| ObjectKey::new(object_type, object_id))
    else {
        return;
    };
    let Some(object) = info.objects.get(&key) else {
        return;
    };
    let data = &mut record.data;
    if let Some(display) = &object.display {
        insert_missing(data, keys::OBJECT_DISPLAY, Value::String(display.clone()));
    }
    if let Some(deleted) = object.deleted {
        insert_missing(data, keys::OBJECT_DELETED, Value::Bool(deleted));
    }
    insert_missing(data, keys::OBJECT_TYPE, Value::String(key.object_type));
    insert_missing(data, keys::OBJECT_ID, Value::String(key.object_id));
}

/// Keys present in `after` but absent from `before`, minus the stamp keys.
fn missing_delta(before: &Payload, after: &Payload) -> Payload {
    after
        .iter()
        .filter(|(key, _)| !before.contains_key(key.as_str()))
        .filter(|(key, _)| !keys::FORCE_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Builder for [`BackfillEngine`].
#[derive(Default)]
pub struct BackfillEngineBuilder {
    store: Option<Arc<dyn ActivityStore>>,
    actors: Option<Arc<dyn ActorResolver>>,
    objects: Option<Arc<dyn ObjectResolver>>,
    enricher: Option<Arc<dyn Enricher>>,
    clock: Option<Arc<dyn Clock>>,
    config: BackfillConfig,
}

impl BackfillEngineBuilder {
    /// Sets the store to scan and update. Required.
    pub fn store(mut self, store: Arc<dyn ActivityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the actor resolver.
    pub fn actor_resolver(mut self, resolver: Arc<dyn ActorResolver>) -> Self {
        self.actors = Some(resolver);
        self
    }

    /// Sets the object resolver.
    pub fn object_resolver(mut self, resolver: Arc<dyn ObjectResolver>) -> Self {
        self.objects = Some(resolver);
        self
    }

    /// Sets the generic enricher run after resolver merges.
    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Sets the clock used for the enrichment stamp.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: BackfillConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// `NotConfigured("store")` when no store was supplied.
    pub fn build(self) -> Result<BackfillEngine, Error> {
        let store = self.store.ok_or(Error::NotConfigured("store"))?;
        Ok(BackfillEngine {
            store,
            actors: self.actors.unwrap_or_else(|| Arc::new(NoopResolver)),
            objects: self.objects.unwrap_or_else(|| Arc::new(NoopResolver)),
            enricher: self.enricher.unwrap_or_else(|| Arc::new(NoopEnricher)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
        })
    }
}
