//! Typed configuration for orchestration components.
//!
//! All durations serialize through `humantime_serde`, so config files can
//! say `"30s"` or `"5m"` instead of raw integers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatch queue tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// How recent a queue heartbeat must be for the consumer to count as
    /// live.
    #[serde(with = "humantime_serde")]
    pub heartbeat_staleness: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness: Duration::from_secs(60),
        }
    }
}

/// Join coordination tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    /// Sleep between retries when a join entry is locked by another writer.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Overall budget for acquiring a contested join entry.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// How long a lock may be held before the sweep reclaims it from a
    /// presumed-crashed holder.
    #[serde(with = "humantime_serde")]
    pub lock_staleness: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            acquire_timeout: Duration::from_secs(30),
            lock_staleness: Duration::from_secs(300),
        }
    }
}

/// Maintenance sweep tuning.
///
/// Each interval is a fixed delay measured from the previous run's
/// completion, so a slow run never overlaps its own next trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepConfig {
    /// Delay between requeue sweep runs.
    #[serde(with = "humantime_serde")]
    pub requeue_interval: Duration,
    /// Age after which a QUEUED action is presumed lost and requeued.
    #[serde(with = "humantime_serde")]
    pub requeue_after: Duration,
    /// Delay between delete sweep runs.
    #[serde(with = "humantime_serde")]
    pub delete_interval: Duration,
    /// Age after which a DeltaFile is deleted regardless of stage.
    #[serde(with = "humantime_serde")]
    pub age_off: Duration,
    /// Age after which a COMPLETE DeltaFile is deleted.
    #[serde(with = "humantime_serde")]
    pub completed_age_off: Duration,
    /// Delay between join sweep runs.
    #[serde(with = "humantime_serde")]
    pub join_interval: Duration,
    /// Runtime after which a recorded long-running task counts as exceeded.
    #[serde(with = "humantime_serde")]
    pub long_running_after: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(30),
            requeue_after: Duration::from_secs(300),
            delete_interval: Duration::from_secs(300),
            age_off: Duration::from_secs(14 * 24 * 3600),
            completed_age_off: Duration::from_secs(24 * 3600),
            join_interval: Duration::from_secs(5),
            long_running_after: Duration::from_secs(3600),
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Staleness window after which a DISPATCHED action is dispatchable
    /// again (presumed lost worker).
    #[serde(with = "humantime_serde")]
    pub feed_timeout: Duration,
    /// Maximum compare-and-swap save attempts before a transient conflict
    /// surfaces as an error.
    pub max_save_attempts: u32,
    /// Name of the action queued when a unit is marked for deletion.
    pub delete_action: String,
    /// Action class routing the delete action's envelopes.
    pub delete_action_class: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            feed_timeout: Duration::from_secs(30),
            max_save_attempts: 10,
            delete_action: "DeleteContent".to_string(),
            delete_action_class: "delete".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let sweep = SweepConfig::default();
        assert!(sweep.requeue_after > sweep.requeue_interval);

        let join = JoinConfig::default();
        assert!(join.acquire_timeout > join.retry_delay);
    }

    #[test]
    fn durations_roundtrip_as_humantime() {
        let config = QueueConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("1m"));

        let parsed: QueueConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.heartbeat_staleness, config.heartbeat_staleness);
    }
}
