//! In-memory activity store.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{ActivityQuery, ActivityStore, MergePatch, StoreFeatures};
use crate::activity::{canonical_order, ActivityRecord};
use crate::error::{StoreError, StoreErrorKind};

/// Activity store backed by a vector behind a read-write lock.
///
/// Predicates are evaluated on the parsed payload, so the store declares
/// JSON capability. Merges run under the write lock and are therefore
/// atomic per record.
///
/// # Example
///
/// ```
/// use activity_trail::store::{ActivityQuery, ActivityStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// assert!(store.is_empty());
/// assert!(store.list(&ActivityQuery::default()).unwrap().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<ActivityRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or(0)
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<ActivityRecord>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::with_message(StoreErrorKind::Backend, "record lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<ActivityRecord>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::with_message(StoreErrorKind::Backend, "record lock poisoned"))
    }
}

impl ActivityStore for MemoryStore {
    fn features(&self) -> StoreFeatures {
        StoreFeatures { json_payload: true }
    }

    fn insert(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        let mut records = self.write()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::with_message(
                StoreErrorKind::Conflict,
                format!("record {} already exists", record.id),
            ));
        }
        records.push(record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ActivityRecord>, StoreError> {
        Ok(self.read()?.iter().find(|r| r.id == id).cloned())
    }

    fn list(&self, query: &ActivityQuery) -> Result<Vec<ActivityRecord>, StoreError> {
        let records = self.read()?;
        let mut rows: Vec<ActivityRecord> = records
            .iter()
            .filter(|r| query.matches(r))
            .filter(|r| query.cursor.as_ref().map_or(true, |c| c.admits(r)))
            .cloned()
            .collect();
        drop(records);

        rows.sort_by(canonical_order);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn count(&self, query: &ActivityQuery) -> Result<u64, StoreError> {
        Ok(self.read()?.iter().filter(|r| query.matches(r)).count() as u64)
    }

    fn count_by_verb(&self, query: &ActivityQuery) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut counts = BTreeMap::new();
        for record in self.read()?.iter().filter(|r| query.matches(r)) {
            *counts.entry(record.verb.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn merge_data(&self, id: &str, patch: &MergePatch) -> Result<(), StoreError> {
        let mut records = self.write()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::with_message(StoreErrorKind::NotFound, id.to_string()))?;
        patch.apply(&mut record.data);
        Ok(())
    }
}
