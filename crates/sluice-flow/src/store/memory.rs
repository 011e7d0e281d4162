//! In-memory DeltaFile store for testing.
//!
//! This module provides [`InMemoryDeltaFileStore`], a simple in-memory
//! implementation of the [`DeltaFileStore`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::Did;

use super::{CasResult, DeltaFileStore};
use crate::deltafile::{ActionState, DeltaFile, Stage};
use crate::error::{Error, Result};

/// In-memory DeltaFile store.
///
/// Provides a simple, thread-safe implementation of the [`DeltaFileStore`]
/// trait using `RwLock` for synchronization.
#[derive(Debug, Default)]
pub struct InMemoryDeltaFileStore {
    files: RwLock<HashMap<Did, DeltaFile>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("deltafile store lock poisoned")
}

impl InMemoryDeltaFileStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of DeltaFiles currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self) -> Result<usize> {
        let files = self.files.read().map_err(poison_err)?;
        Ok(files.len())
    }
}

#[async_trait]
impl DeltaFileStore for InMemoryDeltaFileStore {
    async fn get(&self, did: Did) -> Result<Option<DeltaFile>> {
        let result = {
            let files = self.files.read().map_err(poison_err)?;
            files.get(&did).cloned()
        };
        Ok(result)
    }

    async fn insert(&self, deltafile: &DeltaFile) -> Result<()> {
        let mut files = self.files.write().map_err(poison_err)?;
        if files.contains_key(&deltafile.did) {
            drop(files);
            return Err(Error::Core(sluice_core::Error::PreconditionFailed {
                message: format!("DeltaFile {} already exists", deltafile.did),
            }));
        }
        files.insert(deltafile.did, deltafile.clone());
        drop(files);
        Ok(())
    }

    async fn save(&self, deltafile: &mut DeltaFile) -> Result<CasResult> {
        let mut files = self.files.write().map_err(poison_err)?;

        let Some(stored) = files.get_mut(&deltafile.did) else {
            drop(files);
            return Ok(CasResult::NotFound);
        };

        if stored.version != deltafile.version {
            let actual = stored.version;
            drop(files);
            return Ok(CasResult::VersionConflict { actual });
        }

        deltafile.version += 1;
        *stored = deltafile.clone();
        drop(files);
        Ok(CasResult::Success {
            new_version: deltafile.version,
        })
    }

    async fn update_for_requeue(
        &self,
        now: DateTime<Utc>,
        requeue_after: Duration,
    ) -> Result<Vec<DeltaFile>> {
        let cutoff =
            now - chrono::Duration::from_std(requeue_after).unwrap_or(chrono::Duration::zero());

        let mut files = self.files.write().map_err(poison_err)?;
        let mut affected = Vec::new();

        for deltafile in files.values_mut() {
            let mut touched = false;
            for action in &mut deltafile.actions {
                if action.state == ActionState::Queued && action.modified < cutoff {
                    action.clear_errors();
                    action.modified = now;
                    touched = true;
                }
            }
            if touched {
                deltafile.modified = now;
                deltafile.version += 1;
                affected.push(deltafile.clone());
            }
        }
        drop(files);
        Ok(affected)
    }

    async fn find_for_delete(
        &self,
        created_before: Option<DateTime<Utc>>,
        completed_before: Option<DateTime<Utc>>,
        flow: Option<&str>,
    ) -> Result<Vec<DeltaFile>> {
        let files = self.files.read().map_err(poison_err)?;
        Ok(files
            .values()
            .filter(|df| df.stage != Stage::Delete)
            .filter(|df| flow.is_none_or(|f| df.source_info.flow == f))
            .filter(|df| {
                let aged = created_before.is_some_and(|cutoff| df.created < cutoff);
                let completed = completed_before
                    .is_some_and(|cutoff| df.stage == Stage::Complete && df.modified < cutoff);
                aged || completed
            })
            .cloned()
            .collect())
    }

    async fn find_purgeable(&self) -> Result<Vec<DeltaFile>> {
        let files = self.files.read().map_err(poison_err)?;
        Ok(files
            .values()
            .filter(|df| df.stage == Stage::Delete && df.terminal())
            .cloned()
            .collect())
    }

    async fn remove(&self, dids: &[Did]) -> Result<u64> {
        let mut files = self.files.write().map_err(poison_err)?;
        let mut removed = 0;
        for did in dids {
            if files.remove(did).is_some() {
                removed += 1;
            }
        }
        drop(files);
        Ok(removed)
    }
}
