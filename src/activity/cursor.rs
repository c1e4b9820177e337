//! Reverse-chronological cursor pagination.
//!
//! Canonical order is `created_at` descending with `id` descending as the
//! tie-break. A cursor selects rows strictly older than its position:
//!
//! ```text
//! created_at < cursor.created_at
//!   OR (created_at = cursor.created_at AND id < cursor.id)
//! ```
//!
//! Rows appended after a scan started sort ahead of the cursor, so they can
//! never shift or duplicate rows already behind it.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ActivityRecord;
use crate::error::Error;

/// A pagination position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Occurrence time of the last row seen
    pub created_at: DateTime<Utc>,
    /// Identifier of the last row seen
    pub id: String,
}

impl Cursor {
    /// Creates a cursor at the given position.
    pub fn new(created_at: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }

    /// Cursor positioned at a record.
    pub fn of(record: &ActivityRecord) -> Self {
        Self::new(record.created_at, record.id.clone())
    }

    /// Returns true if the record lies strictly behind this cursor.
    pub fn admits(&self, record: &ActivityRecord) -> bool {
        record.created_at < self.created_at
            || (record.created_at == self.created_at && record.id < self.id)
    }

    /// Renders an opaque token for feed clients.
    ///
    /// ```
    /// use activity_trail::Cursor;
    /// use chrono::{TimeZone, Utc};
    ///
    /// let cursor = Cursor::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), "abc");
    /// let token = cursor.to_token();
    /// assert_eq!(Cursor::from_token(&token).unwrap(), cursor);
    /// ```
    pub fn to_token(&self) -> String {
        format!("{}:{}", self.created_at.timestamp_micros(), self.id)
    }

    /// Parses a token produced by [`Cursor::to_token`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for malformed tokens.
    pub fn from_token(token: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidInput(format!("malformed cursor token '{}'", token));
        let (micros, id) = token.split_once(':').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
        Ok(Self::new(created_at, id))
    }
}

/// Canonical feed order: newest first, larger identifier first on ties.
pub fn canonical_order(a: &ActivityRecord, b: &ActivityRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}
