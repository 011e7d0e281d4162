//! Fan-in synchronization for join/collect actions.
//!
//! A join entry is a barrier accumulating DeltaFiles until a group is
//! complete, at which point one aggregated continuation is handed to the
//! dispatch queue. This module provides:
//!
//! - [`JoinEntry`] / [`JoinEntryId`] / [`JoinEntryDid`]: the barrier state
//! - [`JoinRepository`]: the storage contract, whose uniqueness and locking
//!   guarantees come from a storage-level unique index, not application
//!   logic alone
//! - [`JoinCoordinator`]: the poll-retry contribution protocol over the
//!   repository
//!
//! ## Locking
//!
//! Entry mutation is serialized per id by an exclusive, storage-enforced
//! lock. A writer colliding with a held lock receives a duplicate/conflict
//! signal and poll-retries with a short sleep, bounded by an overall
//! timeout rather than blocking indefinitely, so a crashed holder cannot
//! deadlock contributors. Crashed holders are recovered by the staleness sweep
//! ([`JoinRepository::unlock_before`]), never by liveness pings.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::Did;

use crate::config::JoinConfig;
use crate::error::{Error, Result};

/// Identity of a fan-in barrier: one join point of one flow, partitioned by
/// a group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEntryId {
    /// Flow the join point belongs to.
    pub flow: String,
    /// Join action name.
    pub action: String,
    /// Group key partitioning contributions (e.g., a metadata value).
    pub group_key: String,
}

impl JoinEntryId {
    /// Creates a join entry id.
    #[must_use]
    pub fn new(
        flow: impl Into<String>,
        action: impl Into<String>,
        group_key: impl Into<String>,
    ) -> Self {
        Self {
            flow: flow.into(),
            action: action.into(),
            group_key: group_key.into(),
        }
    }
}

impl fmt::Display for JoinEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.flow, self.action, self.group_key)
    }
}

/// One contribution to a join entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEntryDid {
    /// Contributing DeltaFile.
    pub did: Did,
    /// Contribution index, fixing the aggregate order regardless of arrival
    /// order.
    pub index: u32,
}

/// A fan-in barrier accumulating DeltaFiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEntry {
    /// Barrier identity.
    pub id: JoinEntryId,
    /// True while a writer holds the entry's exclusive lock.
    pub locked: bool,
    /// When the current lock was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_time: Option<DateTime<Utc>>,
    /// Deadline after which the sweep force-completes the group.
    pub join_date: DateTime<Utc>,
    /// Minimum contributions for a forced completion to aggregate rather
    /// than error.
    pub min_deltafile_entries: usize,
    /// Contribution count that completes the group.
    pub max_deltafile_entries: usize,
    /// Contributions in arrival order.
    pub deltafile_entries: Vec<JoinEntryDid>,
}

impl JoinEntry {
    /// Returns the contributions ordered by contribution index, giving the
    /// downstream join action a deterministic view of the group regardless
    /// of network or race timing.
    #[must_use]
    pub fn sorted_deltafile_entries(&self) -> Vec<JoinEntryDid> {
        let mut entries = self.deltafile_entries.clone();
        entries.sort_by_key(|e| (e.index, e.did));
        entries
    }

    /// Returns true if the group reached its completion count.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.deltafile_entries.len() >= self.max_deltafile_entries
    }

    /// Returns true if the group has enough contributions to aggregate.
    #[must_use]
    pub fn has_minimum(&self) -> bool {
        self.deltafile_entries.len() >= self.min_deltafile_entries
    }
}

/// Outcome of an upsert-and-lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The entry was created or appended to, and this caller holds its lock.
    Locked(JoinEntry),
    /// The entry is locked by another writer; poll-retry.
    Conflict,
}

impl UpsertOutcome {
    /// Returns true if this caller holds the lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Storage contract for join entries.
///
/// Implementations must enforce id uniqueness with a storage-level unique
/// index and provide atomic find-and-modify for the lock operations. At
/// most one writer holds an entry's lock at any instant.
#[async_trait]
pub trait JoinRepository: Send + Sync {
    /// Atomically creates the entry if absent and appends `(did, index)`,
    /// taking the entry's lock.
    ///
    /// Returns [`UpsertOutcome::Conflict`] when the entry is already locked,
    /// the storage layer's duplicate/conflict signal. The caller retries;
    /// it must never overwrite another contributor's entry.
    async fn upsert_and_lock(
        &self,
        id: &JoinEntryId,
        join_date: DateTime<Utc>,
        min_entries: usize,
        max_entries: usize,
        did: Did,
        index: u32,
    ) -> Result<UpsertOutcome>;

    /// Atomically finds and locks one unlocked entry whose forced-join
    /// deadline precedes `join_date`.
    async fn lock_one_before(&self, join_date: DateTime<Utc>) -> Result<Option<JoinEntry>>;

    /// Releases a held lock. Returns true if the entry existed and was
    /// locked.
    async fn unlock(&self, id: &JoinEntryId) -> Result<bool>;

    /// Releases every lock taken before `lock_date`, reclaiming locks from
    /// crashed holders. Returns how many were released.
    async fn unlock_before(&self, lock_date: DateTime<Utc>) -> Result<u64>;

    /// Removes an entry, returning it if it existed.
    async fn delete(&self, id: &JoinEntryId) -> Result<Option<JoinEntry>>;

    /// Returns an entry by id.
    async fn find(&self, id: &JoinEntryId) -> Result<Option<JoinEntry>>;
}

/// Outcome of a contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Contribution recorded; the group is still open.
    Pending {
        /// Contributions recorded so far.
        entries: usize,
    },
    /// This contribution completed the group. The entry has been removed;
    /// the caller owns the aggregate.
    Complete(JoinEntry),
}

/// The contribution protocol over a [`JoinRepository`].
pub struct JoinCoordinator {
    repository: Arc<dyn JoinRepository>,
    config: JoinConfig,
}

impl Clone for JoinCoordinator {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            config: self.config,
        }
    }
}

impl JoinCoordinator {
    /// Creates a coordinator over the given repository.
    #[must_use]
    pub fn new(repository: Arc<dyn JoinRepository>, config: JoinConfig) -> Self {
        Self { repository, config }
    }

    /// Contributes `(did, index)` to the identified group.
    ///
    /// Creates the entry on first contribution. If the entry is locked by a
    /// concurrent contributor, poll-retries every `retry_delay` until
    /// `acquire_timeout` elapses. When this contribution reaches
    /// `max_entries` the entry is removed and returned as
    /// [`JoinOutcome::Complete`]; the exclusive lock guarantees at most one
    /// contributor completes a group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JoinLockTimeout`] when the lock cannot be acquired
    /// within the configured budget, or a storage error.
    #[tracing::instrument(skip(self), fields(id = %id, did = %did, index = index))]
    pub async fn contribute(
        &self,
        id: &JoinEntryId,
        join_date: DateTime<Utc>,
        min_entries: usize,
        max_entries: usize,
        did: Did,
        index: u32,
    ) -> Result<JoinOutcome> {
        let started = tokio::time::Instant::now();

        let entry = loop {
            let outcome = self
                .repository
                .upsert_and_lock(id, join_date, min_entries, max_entries, did, index)
                .await?;

            match outcome {
                UpsertOutcome::Locked(entry) => break entry,
                UpsertOutcome::Conflict => {
                    if started.elapsed() >= self.config.acquire_timeout {
                        return Err(Error::JoinLockTimeout {
                            id: id.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        };

        if entry.is_complete() {
            self.repository.delete(id).await?;
            tracing::debug!(entries = entry.deltafile_entries.len(), "join group complete");
            Ok(JoinOutcome::Complete(entry))
        } else {
            let entries = entry.deltafile_entries.len();
            self.repository.unlock(id).await?;
            Ok(JoinOutcome::Pending { entries })
        }
    }

    /// Locks, removes, and returns one group whose forced-join deadline has
    /// passed. Used by the join sweep to force-complete groups that never
    /// reached their target count.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository fails.
    pub async fn take_overdue(&self, now: DateTime<Utc>) -> Result<Option<JoinEntry>> {
        let Some(entry) = self.repository.lock_one_before(now).await? else {
            return Ok(None);
        };
        self.repository.delete(&entry.id).await?;
        Ok(Some(entry))
    }

    /// Releases locks held longer than the configured staleness window,
    /// recovering from crashed holders without double-processing any entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository fails.
    pub async fn release_stale_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let staleness = chrono::Duration::from_std(self.config.lock_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.repository.unlock_before(now - staleness).await
    }
}
