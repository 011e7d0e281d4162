//! In-memory queue backend for testing.
//!
//! This module provides [`MemoryQueueBackend`], an in-memory implementation
//! of the [`QueueBackend`] trait with real blocking-pop semantics, suitable
//! for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Items are not visible across process
//!   boundaries

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{QueueBackend, ZEntry};
use crate::error::{Error, Result};

/// Internal state protected by a single lock.
///
/// Sorted sets order members by `(score, member)`; an empty set is removed,
/// matching the backing store's key semantics.
#[derive(Debug, Default)]
struct SharedState {
    sets: HashMap<String, BTreeSet<(i64, String)>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::QueueUnavailable {
        message: "queue lock poisoned".to_string(),
    }
}

/// In-memory sorted-set/hash store with blocking pop.
#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    state: Mutex<SharedState>,
    notify: Notify,
}

impl MemoryQueueBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the lowest-scored member across `keys`, if any.
    ///
    /// Score ties break toward the earlier key in `keys`.
    fn try_pop(&self, keys: &[String]) -> Result<Option<(String, String)>> {
        let mut state = self.state.lock().map_err(poison_err)?;

        let mut best: Option<(i64, String)> = None;
        for key in keys {
            if let Some(first) = state.sets.get(key).and_then(|set| set.first()) {
                if best.as_ref().is_none_or(|(score, _)| first.0 < *score) {
                    best = Some((first.0, key.clone()));
                }
            }
        }

        let Some((_, key)) = best else {
            drop(state);
            return Ok(None);
        };

        let set = state
            .sets
            .get_mut(&key)
            .ok_or_else(|| Error::QueueUnavailable {
                message: "sorted set vanished mid-pop".to_string(),
            })?;
        let entry = set.pop_first().ok_or_else(|| Error::QueueUnavailable {
            message: "sorted set emptied mid-pop".to_string(),
        })?;
        if set.is_empty() {
            state.sets.remove(&key);
        }
        drop(state);
        Ok(Some((key, entry.1)))
    }

    fn insert_nx(state: &mut SharedState, entry: &ZEntry) -> bool {
        let set = state.sets.entry(entry.key.clone()).or_default();
        if set.iter().any(|(_, member)| *member == entry.member) {
            return false;
        }
        set.insert((entry.score, entry.member.clone()));
        true
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn zadd_nx(&self, key: &str, score: i64, member: &str) -> Result<bool> {
        let added = {
            let mut state = self.state.lock().map_err(poison_err)?;
            Self::insert_nx(
                &mut state,
                &ZEntry {
                    key: key.to_string(),
                    score,
                    member: member.to_string(),
                },
            )
        };
        if added {
            self.notify.notify_waiters();
        }
        Ok(added)
    }

    async fn zadd_nx_batch(&self, entries: Vec<ZEntry>) -> Result<u64> {
        // One lock acquisition makes the batch a single atomic pipeline.
        let added = {
            let mut state = self.state.lock().map_err(poison_err)?;
            entries
                .iter()
                .filter(|entry| Self::insert_nx(&mut state, entry))
                .count() as u64
        };
        if added > 0 {
            self.notify.notify_waiters();
        }
        Ok(added)
    }

    async fn bzpopmin(
        &self,
        keys: &[String],
        timeout: Option<Duration>,
    ) -> Result<Option<(String, String)>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register for wakeups before checking state so an insert
            // between the check and the await is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop(keys)? {
                return Ok(Some(popped));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // Deadline passed; one final check covers an insert
                        // racing the timeout.
                        return self.try_pop(keys);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        drop(state);
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(fields) = state.hashes.get_mut(hash) {
            fields.remove(field);
            if fields.is_empty() {
                state.hashes.remove(hash);
            }
        }
        drop(state);
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .sets
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::{ActionEnvelope, ActionQueue, LongRunningTask, PutResult};
    use chrono::{TimeZone, Utc};
    use sluice_core::Did;
    use std::sync::Arc;

    fn queue() -> ActionQueue {
        ActionQueue::new(Arc::new(MemoryQueueBackend::new()), QueueConfig::default())
    }

    fn envelope(action: &str) -> ActionEnvelope {
        ActionEnvelope::new(Did::generate(), action, "transform", "flow-a")
    }

    #[tokio::test]
    async fn fifo_by_score() -> Result<()> {
        let queue = queue();
        let a = envelope("A");
        let b = envelope("B");

        let t0 = Utc.timestamp_millis_opt(1000).unwrap();
        let t1 = Utc.timestamp_millis_opt(1001).unwrap();

        // Enqueue out of order; scores decide.
        queue.put_at(&b, t1).await?;
        queue.put_at(&a, t0).await?;

        let first = queue.take(&["transform"], None).await?.unwrap();
        let second = queue.take(&["transform"], None).await?.unwrap();
        assert_eq!(first.action, "A");
        assert_eq!(second.action, "B");

        Ok(())
    }

    #[tokio::test]
    async fn put_is_insert_if_absent() -> Result<()> {
        let queue = queue();
        let item = envelope("A");

        assert_eq!(queue.put(&item).await?, PutResult::Enqueued);
        assert_eq!(queue.put(&item).await?, PutResult::Deduplicated);

        // Only one copy comes out.
        assert!(queue
            .take(&["transform"], Some(Duration::from_millis(10)))
            .await?
            .is_some());
        assert!(queue
            .take(&["transform"], Some(Duration::from_millis(10)))
            .await?
            .is_none());

        Ok(())
    }

    #[tokio::test]
    async fn dedup_key_released_after_take() -> Result<()> {
        let queue = queue();
        let item = envelope("A");

        queue.put(&item).await?;
        queue.take(&["transform"], None).await?;

        // Same identity can be enqueued again once consumed.
        assert_eq!(queue.put(&item).await?, PutResult::Enqueued);

        Ok(())
    }

    #[tokio::test]
    async fn take_times_out_with_no_item() -> Result<()> {
        let queue = queue();
        let taken = queue
            .take(&["transform"], Some(Duration::from_millis(20)))
            .await?;
        assert!(taken.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn take_blocks_until_put() -> Result<()> {
        let queue = Arc::new(queue());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .take(&["transform"], Some(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(&envelope("A")).await?;

        let taken = consumer.await.expect("consumer task panicked")?;
        assert_eq!(taken.unwrap().action, "A");

        Ok(())
    }

    #[tokio::test]
    async fn take_pops_lowest_score_across_keys() -> Result<()> {
        let queue = queue();
        let older = ActionEnvelope::new(Did::generate(), "Load", "load", "flow-a");
        let newer = envelope("A");

        let t0 = Utc.timestamp_millis_opt(500).unwrap();
        let t1 = Utc.timestamp_millis_opt(900).unwrap();
        queue.put_at(&newer, t1).await?;
        queue.put_at(&older, t0).await?;

        let first = queue.take(&["transform", "load"], None).await?.unwrap();
        assert_eq!(first.action, "Load");

        Ok(())
    }

    #[tokio::test]
    async fn put_batch_is_one_pipeline() -> Result<()> {
        let queue = queue();
        let a = envelope("A");
        let b = envelope("B");

        let added = queue.put_batch(&[a.clone(), b, a]).await?;
        assert_eq!(added, 2);

        Ok(())
    }

    #[tokio::test]
    async fn recent_queues_filters_stale_heartbeats() -> Result<()> {
        let queue = queue();
        let now = Utc::now();

        queue.set_heartbeat_at("transform", now).await?;
        queue
            .set_heartbeat_at("load", now - chrono::Duration::seconds(120))
            .await?;

        let live = queue.get_recent_queues_at(now).await?;
        assert_eq!(live, vec!["transform".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn long_running_tasks_roundtrip_and_expire() -> Result<()> {
        let queue = queue();
        let now = Utc::now();

        let quick = LongRunningTask {
            did: Did::generate(),
            action: "Transform".into(),
            started_at: now,
        };
        let slow = LongRunningTask {
            did: Did::generate(),
            action: "Load".into(),
            started_at: now - chrono::Duration::hours(2),
        };

        let quick_id = queue.record_long_running_task(&quick).await?;
        let slow_id = queue.record_long_running_task(&slow).await?;

        let all = queue.long_running_tasks().await?;
        assert_eq!(all.len(), 2);

        let expired = queue
            .expired_long_running_tasks(now, Duration::from_secs(3600))
            .await?;
        assert_eq!(expired.len(), 1);
        assert!(expired.contains_key(&slow_id));

        queue.remove_long_running_task(&slow_id).await?;
        queue.remove_long_running_task(&quick_id).await?;
        assert!(queue.long_running_tasks().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn queue_names_lists_active_queues() -> Result<()> {
        let queue = queue();
        queue.put(&envelope("A")).await?;
        queue
            .put(&ActionEnvelope::new(Did::generate(), "Load", "load", "flow-a"))
            .await?;

        assert_eq!(
            queue.queue_names().await?,
            vec!["queue:load".to_string(), "queue:transform".to_string()]
        );

        Ok(())
    }
}
