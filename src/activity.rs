//! Activity data model.
//!
//! This module provides:
//! - `ActivityRecord`: the immutable persisted entry
//! - `NewActivity`: write-side input with optional identifier and timestamp
//! - `Cursor`: reverse-chronological pagination position
//! - Filters and result shapes for listing and statistics

mod cursor;
mod filter;
mod record;

pub use cursor::{canonical_order, Cursor};
pub use filter::{ActivityFilter, ActivityStats, MachineActivity, Page, Scope, StatsFilter};
pub(crate) use record::stamp_glob;
pub use record::{
    format_stamp, is_stamp_shaped, keys, normalize_timestamp, stamp_is_stale, ActivityRecord,
    NewActivity, Payload, DEFAULT_ENRICHER_VERSION,
};
