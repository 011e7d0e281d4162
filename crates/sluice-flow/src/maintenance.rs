//! Background maintenance sweeps.
//!
//! Three independent sweeps reclaim stale or expired work:
//!
//! - [`RequeueSweep`]: recovers actions a worker claimed but never
//!   completed, and reports long-running executions past their expected
//!   duration
//! - [`DeleteSweep`]: marks aged-off units for deletion and purges the
//!   content of units whose delete action finished
//! - [`JoinSweep`]: force-completes join groups whose deadline passed and
//!   reclaims locks from crashed holders
//!
//! Each sweep exposes `run_once` for direct invocation and `run`, a
//! fixed-delay loop whose next delay is measured from the previous run's
//! completion, so a slow run never overlaps its own next trigger. Crashed or
//! hung workers never raise an explicit error anywhere; these sweeps are
//! the only mechanism that notices them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::SweepConfig;
use crate::error::Result;
use crate::join::JoinCoordinator;
use crate::orchestrator::Orchestrator;
use crate::queue::ActionQueue;
use crate::segment::ContentStore;
use crate::store::DeltaFileStore;

/// Policy name attributed to age-off deletions.
const AGE_OFF_POLICY: &str = "ageOff";

/// A per-item failure recorded by a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    /// Identifier of the item that failed.
    pub id: String,
    /// What went wrong.
    pub message: String,
}

/// Outcome of one requeue sweep run.
#[derive(Debug, Default, Serialize)]
pub struct RequeueSummary {
    /// DeltaFiles whose stale queued actions were reclaimed.
    pub reclaimed: usize,
    /// Envelopes newly re-enqueued.
    pub enqueued: u64,
    /// Executions running past their expected duration.
    pub long_running: usize,
    /// Per-item failures.
    pub errors: Vec<SweepError>,
}

/// Recovers work presumed lost to crashed or stalled workers.
pub struct RequeueSweep {
    store: Arc<dyn DeltaFileStore>,
    queue: ActionQueue,
    orchestrator: Arc<Orchestrator>,
    config: SweepConfig,
}

impl RequeueSweep {
    /// Creates a requeue sweep.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeltaFileStore>,
        queue: ActionQueue,
        orchestrator: Arc<Orchestrator>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrator,
            config,
        }
    }

    /// Runs one sweep pass at `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the reclaim query itself fails; per-item
    /// failures are collected in the summary instead.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RequeueSummary> {
        let mut summary = RequeueSummary::default();

        let reclaimed = self
            .store
            .update_for_requeue(now, self.config.requeue_after)
            .await?;
        summary.reclaimed = reclaimed.len();

        match self.orchestrator.redispatch(&reclaimed).await {
            Ok(enqueued) => summary.enqueued = enqueued,
            Err(error) => summary.errors.push(SweepError {
                id: "redispatch".to_string(),
                message: error.to_string(),
            }),
        }

        match self
            .queue
            .expired_long_running_tasks(now, self.config.long_running_after)
            .await
        {
            Ok(expired) => {
                summary.long_running = expired.len();
                for (execution_id, task) in expired {
                    tracing::warn!(
                        execution_id = %execution_id,
                        did = %task.did,
                        action = %task.action,
                        started_at = %task.started_at,
                        "execution exceeds expected duration"
                    );
                }
            }
            Err(error) => summary.errors.push(SweepError {
                id: "long-running".to_string(),
                message: error.to_string(),
            }),
        }

        Ok(summary)
    }

    /// Runs the sweep on its fixed-delay schedule until `shutdown` signals.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.run_once(Utc::now()).await {
                Ok(summary) => tracing::info!(?summary, "requeue sweep complete"),
                Err(error) => tracing::warn!(%error, "requeue sweep failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.requeue_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Outcome of one delete sweep run.
#[derive(Debug, Default, Serialize)]
pub struct DeleteSummary {
    /// DeltaFiles newly marked for deletion.
    pub marked: usize,
    /// DeltaFiles purged (content deleted, record removed).
    pub purged: u64,
    /// Stored objects deleted while purging.
    pub objects_deleted: u64,
    /// Per-item failures.
    pub errors: Vec<SweepError>,
}

/// Ages off old units and purges units whose delete action finished.
pub struct DeleteSweep {
    store: Arc<dyn DeltaFileStore>,
    content: ContentStore,
    orchestrator: Arc<Orchestrator>,
    config: SweepConfig,
}

impl DeleteSweep {
    /// Creates a delete sweep.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeltaFileStore>,
        content: ContentStore,
        orchestrator: Arc<Orchestrator>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            content,
            orchestrator,
            config,
        }
    }

    /// Runs one sweep pass at `now`: marks every unit matching the age-off
    /// criteria, then purges units already marked whose delete action
    /// completed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a selection query fails; per-item
    /// failures are collected in the summary instead.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DeleteSummary> {
        let mut summary = DeleteSummary::default();

        let created_cutoff = now
            - chrono::Duration::from_std(self.config.age_off)
                .unwrap_or_else(|_| chrono::Duration::days(14));
        let completed_cutoff = now
            - chrono::Duration::from_std(self.config.completed_age_off)
                .unwrap_or_else(|_| chrono::Duration::days(1));

        let eligible = self
            .store
            .find_for_delete(Some(created_cutoff), Some(completed_cutoff), None)
            .await?;

        for deltafile in eligible {
            match self
                .orchestrator
                .mark_for_delete(deltafile.did, AGE_OFF_POLICY)
                .await
            {
                Ok(()) => summary.marked += 1,
                Err(error) => summary.errors.push(SweepError {
                    id: deltafile.did.to_string(),
                    message: error.to_string(),
                }),
            }
        }

        for deltafile in self.store.find_purgeable().await? {
            match self.content.delete_all(deltafile.did).await {
                Ok(deleted) => {
                    summary.objects_deleted += deleted;
                    summary.purged += self.store.remove(&[deltafile.did]).await?;
                }
                Err(error) => summary.errors.push(SweepError {
                    id: deltafile.did.to_string(),
                    message: error.to_string(),
                }),
            }
        }

        Ok(summary)
    }

    /// Runs the sweep on its fixed-delay schedule until `shutdown` signals.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.run_once(Utc::now()).await {
                Ok(summary) => tracing::info!(?summary, "delete sweep complete"),
                Err(error) => tracing::warn!(%error, "delete sweep failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.delete_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Outcome of one join sweep run.
#[derive(Debug, Default, Serialize)]
pub struct JoinSummary {
    /// Join groups force-completed past their deadline.
    pub forced: usize,
    /// Stale locks reclaimed from presumed-crashed holders.
    pub locks_released: u64,
    /// Per-item failures.
    pub errors: Vec<SweepError>,
}

/// Forces overdue join groups and reclaims stale join locks.
pub struct JoinSweep {
    coordinator: JoinCoordinator,
    orchestrator: Arc<Orchestrator>,
    config: SweepConfig,
}

impl JoinSweep {
    /// Creates a join sweep.
    #[must_use]
    pub fn new(
        coordinator: JoinCoordinator,
        orchestrator: Arc<Orchestrator>,
        config: SweepConfig,
    ) -> Self {
        Self {
            coordinator,
            orchestrator,
            config,
        }
    }

    /// Runs one sweep pass at `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the overdue query fails; per-group
    /// failures are collected in the summary instead.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<JoinSummary> {
        let mut summary = JoinSummary::default();

        while let Some(entry) = self.coordinator.take_overdue(now).await? {
            let id = entry.id.to_string();
            match self.orchestrator.finish_join_group(entry).await {
                Ok(()) => summary.forced += 1,
                Err(error) => summary.errors.push(SweepError {
                    id,
                    message: error.to_string(),
                }),
            }
        }

        summary.locks_released = self.coordinator.release_stale_locks(now).await?;
        Ok(summary)
    }

    /// Runs the sweep on its fixed-delay schedule until `shutdown` signals.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.run_once(Utc::now()).await {
                Ok(summary) => tracing::info!(?summary, "join sweep complete"),
                Err(error) => tracing::warn!(%error, "join sweep failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.join_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
