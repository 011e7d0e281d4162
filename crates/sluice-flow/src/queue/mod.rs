//! Keyed dispatch queue for runnable action work.
//!
//! This module provides:
//!
//! - [`QueueBackend`]: trait mirroring the sorted-set/hash store contract
//!   the queue runs on (Redis-protocol compatible: `ZADD NX`, pipelined
//!   `ZADD`, `BZPOPMIN`, `HSET`/`HGETALL`/`HDEL`, `SCAN`)
//! - [`ActionEnvelope`]: the serializable work item handed to workers
//! - [`ActionQueue`]: the keyed, blocking multi-producer/multi-consumer
//!   queue, one logical queue per action-class key
//!
//! ## Design Principles
//!
//! - **Insert-if-absent**: puts are NX by item identity (the serialized
//!   envelope, which carries no timestamp), so redundant enqueues, and
//!   therefore at-least-once orchestration, are harmless
//! - **FIFO per key**: items are scored by enqueue time and taken
//!   lowest-score first
//! - **Bounded blocking**: `take` accepts a timeout and reports "no item"
//!   instead of blocking forever

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use sluice_core::Did;

use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Hash recording per-queue consumer heartbeats.
const HEARTBEAT_HASH: &str = "heartbeats";

/// Hash recording in-flight long-running executions.
const LONG_RUNNING_HASH: &str = "long-running-tasks";

/// Prefix namespacing sorted-set queue keys.
const QUEUE_KEY_PREFIX: &str = "queue:";

/// Returns the sorted-set key for an action-class queue.
#[must_use]
pub fn queue_key(action_class: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{action_class}")
}

/// A sorted-set member scheduled for insertion.
#[derive(Debug, Clone)]
pub struct ZEntry {
    /// Sorted-set key.
    pub key: String,
    /// Score; lower pops first.
    pub score: i64,
    /// Member payload.
    pub member: String,
}

/// Contract for the sorted-set/hash store backing the dispatch queue.
///
/// Store unavailability is a transient, retryable condition
/// ([`Error::QueueUnavailable`]); implementations must never silently drop
/// an accepted entry.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Adds `member` to the sorted set at `key` with `score`, only if the
    /// member is absent. Returns true if the member was added.
    async fn zadd_nx(&self, key: &str, score: i64, member: &str) -> Result<bool>;

    /// Adds every entry as one atomic pipeline, each insert-if-absent.
    /// Returns how many members were newly added.
    async fn zadd_nx_batch(&self, entries: Vec<ZEntry>) -> Result<u64>;

    /// Removes and returns the lowest-scored member across `keys`, blocking
    /// until one is available or `timeout` elapses.
    ///
    /// Returns `(key, member)`, or `None` on timeout. A `None` timeout
    /// blocks indefinitely.
    async fn bzpopmin(
        &self,
        keys: &[String],
        timeout: Option<Duration>,
    ) -> Result<Option<(String, String)>>;

    /// Sets a hash field.
    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()>;

    /// Returns all fields of a hash.
    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>>;

    /// Deletes a hash field.
    async fn hdel(&self, hash: &str, field: &str) -> Result<()>;

    /// Returns all sorted-set keys starting with `prefix`.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Envelope for one runnable action, serialized into the queue.
///
/// The envelope carries no timestamp: the enqueue time lives in the
/// sorted-set score, so the serialized envelope doubles as the
/// insert-if-absent identity. Re-enqueueing the same `(did, action)` while a
/// copy is still queued is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEnvelope {
    /// DeltaFile the action runs against.
    pub did: Did,
    /// Action name on the DeltaFile.
    pub action: String,
    /// Action class key selecting the logical queue.
    pub action_class: String,
    /// Flow the DeltaFile belongs to.
    pub flow: String,
    /// For an aggregated join continuation: every DeltaFile in the group,
    /// ordered by contribution index. Empty for ordinary work.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joined_dids: Vec<Did>,
}

impl ActionEnvelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new(
        did: Did,
        action: impl Into<String>,
        action_class: impl Into<String>,
        flow: impl Into<String>,
    ) -> Self {
        Self {
            did,
            action: action.into(),
            action_class: action_class.into(),
            flow: flow.into(),
            joined_dids: Vec::new(),
        }
    }

    /// Attaches the aggregated join group.
    #[must_use]
    pub fn with_joined_dids(mut self, joined_dids: Vec<Did>) -> Self {
        self.joined_dids = joined_dids;
        self
    }

    /// Returns the sorted-set key this envelope routes to.
    #[must_use]
    pub fn queue_key(&self) -> String {
        queue_key(&self.action_class)
    }
}

/// Result of a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutResult {
    /// The envelope was enqueued.
    Enqueued,
    /// An envelope with the same identity was already queued.
    Deduplicated,
}

impl PutResult {
    /// Returns true if the envelope was newly enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// A long-running execution recorded outside the queue.
///
/// Brackets an action's actual run so maintenance can detect executions
/// exceeding their expected duration independent of queue residency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongRunningTask {
    /// DeltaFile the execution runs against.
    pub did: Did,
    /// Action being executed.
    pub action: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
}

/// The keyed, blocking dispatch queue.
///
/// Wraps a [`QueueBackend`] with envelope serialization, heartbeat
/// liveness, and long-running-task tracking. Many producers and consumers
/// may share one `ActionQueue`.
pub struct ActionQueue {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
}

impl Clone for ActionQueue {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config,
        }
    }
}

impl ActionQueue {
    /// Creates a queue over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    /// Enqueues one envelope, insert-if-absent by identity, scored now.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn put(&self, envelope: &ActionEnvelope) -> Result<PutResult> {
        self.put_at(envelope, Utc::now()).await
    }

    /// Enqueues one envelope scored with an explicit enqueue time.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn put_at(
        &self,
        envelope: &ActionEnvelope,
        enqueued_at: DateTime<Utc>,
    ) -> Result<PutResult> {
        let member = encode(envelope)?;
        let added = self
            .backend
            .zadd_nx(
                &envelope.queue_key(),
                enqueued_at.timestamp_millis(),
                &member,
            )
            .await?;
        Ok(if added {
            PutResult::Enqueued
        } else {
            PutResult::Deduplicated
        })
    }

    /// Enqueues a batch as one atomic pipeline, all scored with the same
    /// enqueue time. Returns how many envelopes were newly enqueued.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn put_batch(&self, envelopes: &[ActionEnvelope]) -> Result<u64> {
        let now = Utc::now();
        let entries = envelopes
            .iter()
            .map(|e| {
                Ok(ZEntry {
                    key: e.queue_key(),
                    score: now.timestamp_millis(),
                    member: encode(e)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.backend.zadd_nx_batch(entries).await
    }

    /// Takes the lowest-scored envelope across the given action-class keys,
    /// blocking until one is available or `timeout` elapses.
    ///
    /// A timeout is "no work available", not an error.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable, or a
    /// serialization error for a corrupt member.
    pub async fn take(
        &self,
        action_classes: &[&str],
        timeout: Option<Duration>,
    ) -> Result<Option<ActionEnvelope>> {
        let keys: Vec<String> = action_classes.iter().map(|c| queue_key(c)).collect();
        match self.backend.bzpopmin(&keys, timeout).await? {
            Some((_, member)) => Ok(Some(decode(&member)?)),
            None => Ok(None),
        }
    }

    /// Records a consumer heartbeat for an action-class key.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn set_heartbeat(&self, action_class: &str) -> Result<()> {
        self.set_heartbeat_at(action_class, Utc::now()).await
    }

    /// Records a consumer heartbeat at a given time.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn set_heartbeat_at(&self, action_class: &str, now: DateTime<Utc>) -> Result<()> {
        self.backend
            .hset(HEARTBEAT_HASH, action_class, &now.to_rfc3339())
            .await
    }

    /// Returns the action-class keys whose heartbeat is newer than the
    /// configured staleness threshold: the queues with live consumers.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn get_recent_queues(&self) -> Result<Vec<String>> {
        self.get_recent_queues_at(Utc::now()).await
    }

    /// Returns the live queues judged at a given time.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn get_recent_queues_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let staleness = chrono::Duration::from_std(self.config.heartbeat_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let heartbeats = self.backend.hgetall(HEARTBEAT_HASH).await?;

        let mut live: Vec<String> = heartbeats
            .into_iter()
            .filter_map(|(key, stamp)| {
                DateTime::parse_from_rfc3339(&stamp)
                    .ok()
                    .map(|t| (key, t.with_timezone(&Utc)))
            })
            .filter(|(_, stamp)| now.signed_duration_since(*stamp) < staleness)
            .map(|(key, _)| key)
            .collect();
        live.sort();
        Ok(live)
    }

    /// Records the start of a long-running execution.
    ///
    /// Returns the execution id used to remove the record on completion.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn record_long_running_task(&self, task: &LongRunningTask) -> Result<String> {
        let execution_id = Ulid::new().to_string();
        let value = serde_json::to_string(task)
            .map_err(|e| Error::serialization(format!("long-running task: {e}")))?;
        self.backend
            .hset(LONG_RUNNING_HASH, &execution_id, &value)
            .await?;
        Ok(execution_id)
    }

    /// Removes a long-running execution record.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn remove_long_running_task(&self, execution_id: &str) -> Result<()> {
        self.backend.hdel(LONG_RUNNING_HASH, execution_id).await
    }

    /// Returns every recorded long-running execution.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn long_running_tasks(&self) -> Result<HashMap<String, LongRunningTask>> {
        let raw = self.backend.hgetall(LONG_RUNNING_HASH).await?;
        raw.into_iter()
            .map(|(id, value)| {
                let task = serde_json::from_str(&value)
                    .map_err(|e| Error::serialization(format!("long-running task {id}: {e}")))?;
                Ok((id, task))
            })
            .collect()
    }

    /// Returns executions running longer than `expected` as of `now`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn expired_long_running_tasks(
        &self,
        now: DateTime<Utc>,
        expected: Duration,
    ) -> Result<HashMap<String, LongRunningTask>> {
        let expected =
            chrono::Duration::from_std(expected).unwrap_or_else(|_| chrono::Duration::hours(1));
        Ok(self
            .long_running_tasks()
            .await?
            .into_iter()
            .filter(|(_, task)| now.signed_duration_since(task.started_at) > expected)
            .collect())
    }

    /// Returns every known queue key.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the backend is unavailable.
    pub async fn queue_names(&self) -> Result<Vec<String>> {
        let mut keys = self.backend.scan_keys(QUEUE_KEY_PREFIX).await?;
        keys.sort();
        Ok(keys)
    }
}

fn encode(envelope: &ActionEnvelope) -> Result<String> {
    serde_json::to_string(envelope)
        .map_err(|e| Error::serialization(format!("action envelope: {e}")))
}

fn decode(member: &str) -> Result<ActionEnvelope> {
    serde_json::from_str(member)
        .map_err(|e| Error::serialization(format!("action envelope: {e}")))
}
