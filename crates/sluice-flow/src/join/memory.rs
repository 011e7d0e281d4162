//! In-memory join repository for testing.
//!
//! This module provides [`InMemoryJoinRepository`], an in-memory
//! implementation of the [`JoinRepository`] trait. The map key plays the
//! role of the storage-level unique index, and the single state lock makes
//! each operation atomic, reproducing the duplicate/conflict signal a
//! document store raises for a locked entry.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::Did;

use super::{JoinEntry, JoinEntryDid, JoinEntryId, JoinRepository, UpsertOutcome};
use crate::error::{Error, Result};

/// In-memory join repository.
#[derive(Debug, Default)]
pub struct InMemoryJoinRepository {
    entries: Mutex<HashMap<JoinEntryId, JoinEntry>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("join repository lock poisoned")
}

impl InMemoryJoinRepository {
    /// Creates a new empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of open entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self) -> Result<usize> {
        let entries = self.entries.lock().map_err(poison_err)?;
        Ok(entries.len())
    }
}

#[async_trait]
impl JoinRepository for InMemoryJoinRepository {
    async fn upsert_and_lock(
        &self,
        id: &JoinEntryId,
        join_date: DateTime<Utc>,
        min_entries: usize,
        max_entries: usize,
        did: Did,
        index: u32,
    ) -> Result<UpsertOutcome> {
        let mut entries = self.entries.lock().map_err(poison_err)?;

        let outcome = match entries.get_mut(id) {
            None => {
                let entry = JoinEntry {
                    id: id.clone(),
                    locked: true,
                    locked_time: Some(Utc::now()),
                    join_date,
                    min_deltafile_entries: min_entries,
                    max_deltafile_entries: max_entries,
                    deltafile_entries: vec![JoinEntryDid { did, index }],
                };
                entries.insert(id.clone(), entry.clone());
                UpsertOutcome::Locked(entry)
            }
            Some(entry) if entry.locked => UpsertOutcome::Conflict,
            Some(entry) => {
                entry.locked = true;
                entry.locked_time = Some(Utc::now());
                entry.deltafile_entries.push(JoinEntryDid { did, index });
                UpsertOutcome::Locked(entry.clone())
            }
        };
        drop(entries);
        Ok(outcome)
    }

    async fn lock_one_before(&self, join_date: DateTime<Utc>) -> Result<Option<JoinEntry>> {
        let mut entries = self.entries.lock().map_err(poison_err)?;

        let overdue = entries
            .values_mut()
            .find(|entry| !entry.locked && entry.join_date < join_date);

        let result = overdue.map(|entry| {
            entry.locked = true;
            entry.locked_time = Some(Utc::now());
            entry.clone()
        });
        drop(entries);
        Ok(result)
    }

    async fn unlock(&self, id: &JoinEntryId) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(poison_err)?;

        let unlocked = match entries.get_mut(id) {
            Some(entry) if entry.locked => {
                entry.locked = false;
                entry.locked_time = None;
                true
            }
            _ => false,
        };
        drop(entries);
        Ok(unlocked)
    }

    async fn unlock_before(&self, lock_date: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().map_err(poison_err)?;

        let mut released = 0;
        for entry in entries.values_mut() {
            if entry.locked && entry.locked_time.is_some_and(|t| t < lock_date) {
                entry.locked = false;
                entry.locked_time = None;
                released += 1;
            }
        }
        drop(entries);
        Ok(released)
    }

    async fn delete(&self, id: &JoinEntryId) -> Result<Option<JoinEntry>> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let removed = entries.remove(id);
        drop(entries);
        Ok(removed)
    }

    async fn find(&self, id: &JoinEntryId) -> Result<Option<JoinEntry>> {
        let entries = self.entries.lock().map_err(poison_err)?;
        Ok(entries.get(id).cloned())
    }
}
