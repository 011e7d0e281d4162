//! Pluggable persistence for DeltaFiles.
//!
//! The [`DeltaFileStore`] trait defines the persistence layer for DeltaFiles.
//! Join-entry persistence is handled separately by
//! [`crate::join::JoinRepository`].
//!
//! ## Design Principles
//!
//! - **CAS semantics**: saves are compare-and-swap on the DeltaFile `version`
//!   field, so a stale writer retries its whole operation instead of
//!   overwriting a concurrent one
//! - **Narrow queries**: the store exposes exactly the criteria queries the
//!   orchestrator and sweeps need, so the backing document store can be
//!   swapped for any engine with atomic find-and-modify
//! - **Testability**: an in-memory implementation backs the test suites

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::Did;

use crate::deltafile::DeltaFile;
use crate::error::Result;

/// Result of a compare-and-swap save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Save applied; the DeltaFile now carries `new_version`.
    Success {
        /// The version after the save.
        new_version: u64,
    },
    /// No DeltaFile with this id exists.
    NotFound,
    /// Version conflict (concurrent modification). Re-read and retry.
    VersionConflict {
        /// The version currently in the store.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the save was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns true if the DeltaFile was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Storage abstraction for DeltaFiles.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from worker
/// tasks and sweeps.
#[async_trait]
pub trait DeltaFileStore: Send + Sync {
    /// Gets a DeltaFile by id.
    ///
    /// Returns `None` if it does not exist.
    async fn get(&self, did: Did) -> Result<Option<DeltaFile>>;

    /// Inserts a new DeltaFile.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if a DeltaFile with this id already
    /// exists.
    async fn insert(&self, deltafile: &DeltaFile) -> Result<()>;

    /// Saves a DeltaFile if its `version` still matches the stored one.
    ///
    /// On success the stored version is incremented and `deltafile.version`
    /// is updated in place. A [`CasResult::VersionConflict`] means the
    /// caller's read is stale: re-read, re-apply, and save again.
    async fn save(&self, deltafile: &mut DeltaFile) -> Result<CasResult>;

    /// Reclaims stale queued work.
    ///
    /// Finds every action in QUEUED state whose `modified` is older than
    /// `now - requeue_after`, clears its stale error fields, stamps its
    /// `modified` to `now`, and returns the affected DeltaFiles so the
    /// caller can re-dispatch them. This is the single mechanism recovering
    /// work a worker claimed from the dispatch queue but never completed.
    async fn update_for_requeue(
        &self,
        now: DateTime<Utc>,
        requeue_after: Duration,
    ) -> Result<Vec<DeltaFile>>;

    /// Finds DeltaFiles eligible for deletion.
    ///
    /// Selects DeltaFiles not already in DELETE stage matching
    /// `(created < created_before)` **or** `(stage = COMPLETE and modified <
    /// completed_before)`, further filtered by `flow` when given: an OR
    /// across the two time criteria, AND with the optional flow filter.
    async fn find_for_delete(
        &self,
        created_before: Option<DateTime<Utc>>,
        completed_before: Option<DateTime<Utc>>,
        flow: Option<&str>,
    ) -> Result<Vec<DeltaFile>>;

    /// Finds DeltaFiles ready to purge: in DELETE stage with no action left
    /// in a non-terminal state.
    async fn find_purgeable(&self) -> Result<Vec<DeltaFile>>;

    /// Removes DeltaFiles by id, returning how many existed.
    async fn remove(&self, dids: &[Did]) -> Result<u64>;
}
