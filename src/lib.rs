//! Append-only activity trail for multi-tenant user management.
//!
//! This crate records actor actions as immutable events and serves them
//! back under a role-aware access policy:
//! - **Write**: [`AppendSink`] validates, completes and persists records,
//!   optionally running an [`Enricher`](enrich::Enricher) chain first
//! - **Read**: [`QueryEngine`] lists pages in reverse-chronological
//!   [`Cursor`] order and aggregates per-verb stats
//! - **Enrich**: [`BackfillEngine`](backfill::BackfillEngine) fills display
//!   fields on historical records through additive, idempotent merges
//! - **Protect**: [`AccessPolicy`] constrains filters and
//!   [`RecordSanitizer`] masks what comes back
//!
//! # Core Types
//!
//! - [`NewActivity`] / [`ActivityRecord`]: write-side input and persisted record
//! - [`ActivityFilter`] / [`StatsFilter`]: read-side selections
//! - [`ActivityStore`](store::ActivityStore): storage seam with in-memory and SQLite backends
//! - [`ActivityService`]: policy, query and sanitization composed for feeds
//!
//! # Examples
//!
//! ```
//! use activity_trail::backfill::{ActorInfo, ActorResolver, BackfillEngine, BackfillInput, ResolveError};
//! use activity_trail::store::{ActivityStore, MemoryStore};
//! use activity_trail::{AppendSink, Cancellation, NewActivity};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! struct Directory;
//!
//! impl ActorResolver for Directory {
//!     fn resolve_actors(
//!         &self,
//!         _tenant_id: &str,
//!         ids: &[String],
//!     ) -> Result<HashMap<String, ActorInfo>, ResolveError> {
//!         Ok(ids.iter().map(|id| (id.clone(), ActorInfo::display("Alice"))).collect())
//!     }
//! }
//!
//! let store = Arc::new(MemoryStore::new());
//! let record = AppendSink::new(store.clone())
//!     .log(NewActivity::new("user.created").with_tenant("t1", "o1").with_actor("u1"))
//!     .expect("should persist");
//!
//! let engine = BackfillEngine::builder()
//!     .store(store.clone())
//!     .actor_resolver(Arc::new(Directory))
//!     .build()
//!     .expect("store configured");
//! engine.execute(&BackfillInput::default(), &Cancellation::new()).unwrap();
//!
//! let stored = store.get(&record.id).unwrap().unwrap();
//! assert_eq!(stored.data["actor_display"], "Alice");
//! assert_eq!(stored.data["enricher_version"], "v1");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod activity;
pub mod backfill;
mod cancel;
mod config;
pub mod enrich;
mod error;
mod logging;
mod policy;
mod query;
mod sanitizer;
mod service;
mod sink;
pub mod store;

pub use activity::{
    ActivityFilter, ActivityRecord, ActivityStats, Cursor, MachineActivity, NewActivity, Page,
    Payload, Scope, StatsFilter,
};
pub use cancel::Cancellation;
pub use config::TrailConfig;
pub use error::{Error, StoreError, StoreErrorKind, Violation, ViolationKind};
pub use policy::{AccessPolicy, AccessPolicyConfig, Actor, Privilege};
pub use query::{QueryEngine, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
pub use sanitizer::{
    MaskError, MaskRule, MaskStrategy, MaskingRules, MetadataExposure, PayloadMasker,
    RecordSanitizer, RuleMasker,
};
pub use service::ActivityService;
pub use sink::AppendSink;
