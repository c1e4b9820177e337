//! Scheduler-facing handle for the backfill engine.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};

use super::{normalize_batch_size, BackfillEngine, BackfillInput, BackfillReport};
use crate::activity::Scope;
use crate::cancel::Cancellation;
use crate::error::Error;

/// Name under which the job registers with a scheduler.
pub const JOB_NAME: &str = "activity_enrichment_backfill";

/// Schedule used when none is configured.
pub const DEFAULT_SCHEDULE: &str = "@hourly";

/// Zero-argument entry point handed to a scheduler.
pub type JobRunner = Box<dyn Fn() -> Result<BackfillReport, Error> + Send + Sync>;

/// A recurring backfill run.
///
/// Each run gets its own [`Cancellation`], so cancelling or timing out one
/// run never affects the next scheduled one.
///
/// # Examples
///
/// ```
/// use activity_trail::backfill::{BackfillEngine, BackfillJob};
/// use activity_trail::store::MemoryStore;
/// use std::sync::Arc;
///
/// let engine = BackfillEngine::builder()
///     .store(Arc::new(MemoryStore::new()))
///     .build()
///     .unwrap();
/// let job = BackfillJob::new(Arc::new(engine)).with_batch_size(0);
///
/// assert_eq!(job.schedule(), "@hourly");
/// assert_eq!(job.batch_size(), 200);
/// assert!(job.run().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BackfillJob {
    engine: Arc<BackfillEngine>,
    scope: Scope,
    batch_size: usize,
    max_age: Option<Duration>,
    run_timeout: Option<StdDuration>,
}

impl BackfillJob {
    /// Creates a job over an engine using its configured page size.
    pub fn new(engine: Arc<BackfillEngine>) -> Self {
        let batch_size = normalize_batch_size(engine.config().page_size);
        Self {
            engine,
            scope: Scope::default(),
            batch_size,
            max_age: None,
            run_timeout: None,
        }
    }

    /// Restricts each run to a scope.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the page size, clamped to `[1, 1000]`; zero selects 200.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = normalize_batch_size(batch_size);
        self
    }

    /// Re-enriches records whose stamp is older than this age at run time.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Gives every run a deadline this long after it starts.
    pub fn with_run_timeout(mut self, timeout: StdDuration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Job name.
    pub fn name(&self) -> &'static str {
        JOB_NAME
    }

    /// Recurring schedule expression.
    pub fn schedule(&self) -> &str {
        let configured = self.engine.config().schedule.trim();
        if configured.is_empty() {
            DEFAULT_SCHEDULE
        } else {
            configured
        }
    }

    /// Effective page size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Runs one pass under a fresh token.
    pub fn run(&self) -> Result<BackfillReport, Error> {
        let cancel = match self.run_timeout {
            Some(timeout) => match Instant::now().checked_add(timeout) {
                Some(deadline) => Cancellation::with_deadline(deadline),
                None => Cancellation::new(),
            },
            None => Cancellation::new(),
        };
        self.run_with(&cancel)
    }

    /// Runs one pass under a caller-owned token.
    pub fn run_with(&self, cancel: &Cancellation) -> Result<BackfillReport, Error> {
        let input = BackfillInput {
            scope: self.scope.clone(),
            batch_size: self.batch_size,
            enriched_before: self.max_age.map(|age| cutoff(self.engine.now(), age)),
        };
        self.engine.execute(&input, cancel)
    }

    /// Wraps [`run`](Self::run) as a boxed closure.
    pub fn runner(self: Arc<Self>) -> JobRunner {
        Box::new(move || self.run())
    }
}

/// `now - age`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
