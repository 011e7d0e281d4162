//! DeltaFile lifecycle and action bookkeeping.
//!
//! This module provides:
//! - [`Stage`]: the pipeline stage a DeltaFile is in
//! - [`ActionState`]: the per-action state machine
//! - [`Action`]: one processing step's bookkeeping, with an append-only
//!   transition history
//! - [`DeltaFile`]: one ingested unit moving through the system
//!
//! ## State machine
//!
//! ```text
//!              ┌──────────────────── retry ────────────────────┐
//!              ▼                                               │
//!         ┌────────┐  worker took  ┌────────────┐         ┌─────────┐
//!     ───►│ QUEUED │──────────────►│ DISPATCHED │────────►│  ERROR  │
//!         └────────┘               └────────────┘         └─────────┘
//!              │  ▲     lost worker      │    │
//!              │  └──── reclaimed ───────┘    │
//!              │                              ▼
//!              │                        ┌──────────┐
//!              └───── short-circuit ───►│ COMPLETE │
//!                                       └──────────┘
//! ```
//!
//! Transitions are monotonic except the explicit re-queue paths: ERROR →
//! QUEUED (operator retry) and DISPATCHED → QUEUED (lost-worker reclaim).
//! Every state change is appended to the action's history; no operation
//! silently drops a transition.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::Did;

use crate::error::{Error, Result};
use crate::segment::Content;

/// Pipeline stage of a DeltaFile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Entering the system; transform actions run here.
    Ingress,
    /// Domain and enrichment actions run here.
    Enrich,
    /// Egress actions deliver the unit out of the system.
    Egress,
    /// All actions finished.
    Complete,
    /// Marked for deletion; awaiting purge.
    Delete,
}

impl Stage {
    /// Returns true if no further flow actions run in this stage.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Delete)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingress => write!(f, "INGRESS"),
            Self::Enrich => write!(f, "ENRICH"),
            Self::Egress => write!(f, "EGRESS"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Per-action state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    /// Queued for dispatch (or re-queued after retry/reclaim).
    Queued,
    /// A worker took the envelope and is presumed executing.
    Dispatched,
    /// Finished successfully.
    Complete,
    /// Finished with a reported error; retryable.
    Error,
}

impl ActionState {
    /// Returns true if this is a terminal state.
    ///
    /// ERROR is terminal for dispatch purposes but re-enterable via retry.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            // Queued -> Queued covers redundant queueAction calls, which are
            // defined to be harmless and history-recorded.
            Self::Queued => matches!(
                target,
                Self::Queued | Self::Dispatched | Self::Complete | Self::Error
            ),
            Self::Dispatched => matches!(
                target,
                Self::Dispatched | Self::Queued | Self::Complete | Self::Error
            ),
            Self::Error => matches!(target, Self::Queued),
            Self::Complete => false,
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Dispatched => write!(f, "DISPATCHED"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    /// State entered.
    pub state: ActionState,
    /// When the transition happened.
    pub time: DateTime<Utc>,
}

/// Bookkeeping for one named processing step of a DeltaFile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Action name, unique within the DeltaFile.
    pub name: String,
    /// Current state.
    pub state: ActionState,
    /// When the action record was created.
    pub created: DateTime<Utc>,
    /// When the action last changed.
    pub modified: DateTime<Utc>,
    /// Error cause reported by the action, if it errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_cause: Option<String>,
    /// Error context reported by the action, if it errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
    /// True if the action filtered the DeltaFile out of the flow.
    #[serde(default)]
    pub filtered: bool,
    /// Why the action filtered the DeltaFile, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_message: Option<String>,
    /// Append-only record of every state transition.
    pub history: Vec<ActionEvent>,
}

impl Action {
    /// Creates a new action in QUEUED state at `now`.
    #[must_use]
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state: ActionState::Queued,
            created: now,
            modified: now,
            error_cause: None,
            error_context: None,
            filtered: false,
            filter_message: None,
            history: vec![ActionEvent {
                state: ActionState::Queued,
                time: now,
            }],
        }
    }

    /// Returns true if the action is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to `target` at `now`, appending history and stamping
    /// `modified`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is invalid.
    pub fn set_state(&mut self, target: ActionState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("action {}", self.name),
            });
        }

        self.state = target;
        self.modified = now;
        self.history.push(ActionEvent {
            state: target,
            time: now,
        });
        Ok(())
    }

    /// Clears any recorded error fields.
    pub fn clear_errors(&mut self) {
        self.error_cause = None;
        self.error_context = None;
    }

    /// Returns true if the action is dispatchable at `now`: QUEUED, or
    /// DISPATCHED but unmodified for longer than `feed_timeout` (presumed
    /// lost worker).
    #[must_use]
    pub fn ready_for_dispatch(&self, feed_timeout: Duration, now: DateTime<Utc>) -> bool {
        match self.state {
            ActionState::Queued => true,
            ActionState::Dispatched => {
                let elapsed = now.signed_duration_since(self.modified);
                elapsed > chrono::Duration::from_std(feed_timeout).unwrap_or(chrono::Duration::MAX)
            }
            ActionState::Complete | ActionState::Error => false,
        }
    }
}

/// Source metadata recorded at ingest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Original filename of the ingested data.
    pub filename: String,
    /// Flow the unit was ingested into.
    pub flow: String,
    /// Arbitrary source metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SourceInfo {
    /// Creates source info for an ingested file.
    #[must_use]
    pub fn new(filename: impl Into<String>, flow: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            flow: flow.into(),
            metadata: HashMap::new(),
        }
    }
}

/// One ingested unit of data moving through the system.
///
/// Owned exclusively by the orchestrator and mutated only through the
/// operations below. Never deleted in place: a DeltaFile transitions to the
/// DELETE stage and is purged later by the delete sweep.
///
/// The `version` field is the optimistic-concurrency guard: the store's save
/// is a compare-and-swap on it, and a mismatch is a retryable conflict,
/// never a silent overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFile {
    /// Unique identifier.
    pub did: Did,
    /// Current pipeline stage.
    pub stage: Stage,
    /// Ordered action records, one per action name.
    pub actions: Vec<Action>,
    /// Source metadata recorded at ingest.
    pub source_info: SourceInfo,
    /// Content produced by each transform layer; the last entry is the
    /// current logical content.
    pub protocol_stack: Vec<Content>,
    /// Domain data recorded by load actions.
    #[serde(default)]
    pub domains: HashMap<String, String>,
    /// Enrichment data recorded by enrich actions.
    #[serde(default)]
    pub enrichment: HashMap<String, String>,
    /// When the unit was ingested.
    pub created: DateTime<Utc>,
    /// When the unit last changed.
    pub modified: DateTime<Utc>,
    /// Optimistic-concurrency version; incremented by every store save.
    pub version: u64,
}

impl DeltaFile {
    /// Creates a new DeltaFile in INGRESS stage at `now`.
    #[must_use]
    pub fn new(source_info: SourceInfo, content: Content, now: DateTime<Utc>) -> Self {
        Self::with_did(Did::generate(), source_info, content, now)
    }

    /// Creates a new DeltaFile with a caller-chosen id.
    ///
    /// Ingest generates the id first so content can be stored under the
    /// unit's own address before the record exists.
    #[must_use]
    pub fn with_did(did: Did, source_info: SourceInfo, content: Content, now: DateTime<Utc>) -> Self {
        Self {
            did,
            stage: Stage::Ingress,
            actions: Vec::new(),
            source_info,
            protocol_stack: vec![content],
            domains: HashMap::new(),
            enrichment: HashMap::new(),
            created: now,
            modified: now,
            version: 0,
        }
    }

    /// Returns the action with the given name.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    fn action_mut(&mut self, name: &str) -> Result<&mut Action> {
        let did = self.did;
        self.actions
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::ActionNotFound {
                name: name.to_string(),
                did,
            })
    }

    /// Returns the current logical content: the top of the protocol stack.
    #[must_use]
    pub fn last_content(&self) -> Option<&Content> {
        self.protocol_stack.last()
    }

    /// Returns the names of all QUEUED actions.
    #[must_use]
    pub fn queued_actions(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter(|a| a.state == ActionState::Queued)
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Returns true if no action remains in a non-terminal state.
    #[must_use]
    pub fn terminal(&self) -> bool {
        self.actions.iter().all(Action::is_terminal)
    }

    /// Returns true if any action is in ERROR state.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.actions.iter().any(|a| a.state == ActionState::Error)
    }

    /// Queues the named action at `now`.
    ///
    /// Idempotent: if an action with this name already exists it is
    /// transitioned (back) to QUEUED with a history entry appended;
    /// otherwise a new record is created. Exactly one Action record exists
    /// per name regardless of call count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the existing action has
    /// already completed.
    pub fn queue_action_at(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(action) = self.actions.iter_mut().find(|a| a.name == name) {
            action.set_state(ActionState::Queued, now)?;
        } else {
            self.actions.push(Action::new(name, now));
        }
        self.modified = now;
        Ok(())
    }

    /// Queues the named action now.
    ///
    /// # Errors
    ///
    /// See [`DeltaFile::queue_action_at`].
    pub fn queue_action(&mut self, name: &str) -> Result<()> {
        self.queue_action_at(name, Utc::now())
    }

    /// Records that a worker took the named action's envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionNotFound`] or an invalid-transition error.
    pub fn mark_dispatched_at(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.action_mut(name)?
            .set_state(ActionState::Dispatched, now)?;
        self.modified = now;
        Ok(())
    }

    /// Records that a worker took the named action's envelope, stamped now.
    ///
    /// # Errors
    ///
    /// See [`DeltaFile::mark_dispatched_at`].
    pub fn mark_dispatched(&mut self, name: &str) -> Result<()> {
        self.mark_dispatched_at(name, Utc::now())
    }

    /// Completes the named action at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionNotFound`] or an invalid-transition error.
    pub fn complete_action_at(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let action = self.action_mut(name)?;
        action.clear_errors();
        action.set_state(ActionState::Complete, now)?;
        self.modified = now;
        Ok(())
    }

    /// Completes the named action, stamped now.
    ///
    /// # Errors
    ///
    /// See [`DeltaFile::complete_action_at`].
    pub fn complete_action(&mut self, name: &str) -> Result<()> {
        self.complete_action_at(name, Utc::now())
    }

    /// Errors the named action at `now`, recording cause and context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionNotFound`] or an invalid-transition error.
    pub fn error_action_at(
        &mut self,
        name: &str,
        cause: impl Into<String>,
        context: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let action = self.action_mut(name)?;
        action.error_cause = Some(cause.into());
        action.error_context = Some(context.into());
        action.set_state(ActionState::Error, now)?;
        self.modified = now;
        Ok(())
    }

    /// Errors the named action, stamped now.
    ///
    /// # Errors
    ///
    /// See [`DeltaFile::error_action_at`].
    pub fn error_action(
        &mut self,
        name: &str,
        cause: impl Into<String>,
        context: impl Into<String>,
    ) -> Result<()> {
        self.error_action_at(name, cause, context, Utc::now())
    }

    /// Completes the named action as a filter at `now`: the unit leaves the
    /// flow, and the reason is recorded on the action.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionNotFound`] or an invalid-transition error.
    pub fn filter_action_at(
        &mut self,
        name: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let action = self.action_mut(name)?;
        action.filtered = true;
        action.filter_message = Some(message.into());
        action.set_state(ActionState::Complete, now)?;
        self.modified = now;
        Ok(())
    }

    /// Transitions every ERROR action back to QUEUED at `now`.
    ///
    /// Returns the names of the re-queued actions. Used for
    /// operator-triggered retry.
    pub fn retry_errors_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut requeued = Vec::new();
        for action in &mut self.actions {
            if action.state == ActionState::Error {
                action.clear_errors();
                // ERROR -> QUEUED is always a valid transition.
                let _ = action.set_state(ActionState::Queued, now);
                requeued.push(action.name.clone());
            }
        }
        if !requeued.is_empty() {
            self.modified = now;
        }
        requeued
    }

    /// Transitions every ERROR action back to QUEUED, stamped now.
    pub fn retry_errors(&mut self) -> Vec<String> {
        self.retry_errors_at(Utc::now())
    }

    /// Returns true if the named action is dispatchable at `now`.
    ///
    /// Staleness is judged on the action's own `modified` timestamp against
    /// `now - feed_timeout`; a stale DISPATCHED action is presumed lost.
    #[must_use]
    pub fn ready_for_dispatch(&self, name: &str, feed_timeout: Duration, now: DateTime<Utc>) -> bool {
        self.action(name)
            .is_some_and(|a| a.ready_for_dispatch(feed_timeout, now))
    }

    /// Marks the DeltaFile for deletion at `now`.
    ///
    /// Every non-terminal action other than `delete_action` is forced to
    /// ERROR with a policy-attributed message, the delete action is queued,
    /// and the stage becomes DELETE.
    ///
    /// # Errors
    ///
    /// Returns an invalid-transition error if the delete action exists and
    /// has already completed.
    pub fn mark_for_delete_at(
        &mut self,
        delete_action: &str,
        policy: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for action in &mut self.actions {
            if action.name != delete_action && !action.is_terminal() {
                action.error_cause = Some(format!("DeltaFile marked for deletion by policy {policy}"));
                action.error_context = None;
                action.set_state(ActionState::Error, now)?;
            }
        }

        self.queue_action_at(delete_action, now)?;
        self.stage = Stage::Delete;
        self.modified = now;
        Ok(())
    }

    /// Marks the DeltaFile for deletion, stamped now.
    ///
    /// # Errors
    ///
    /// See [`DeltaFile::mark_for_delete_at`].
    pub fn mark_for_delete(&mut self, delete_action: &str, policy: &str) -> Result<()> {
        self.mark_for_delete_at(delete_action, policy, Utc::now())
    }
}
