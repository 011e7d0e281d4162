//! Control flow: wiring the state machine, queue, and join coordinator.
//!
//! The orchestrator owns every DeltaFile mutation. An action completes →
//! the state machine records the result and decides the next queued
//! action(s) → either the dispatch queue is given a unit of work directly,
//! or, when the next action is a join point, the join coordinator
//! accumulates this DeltaFile until the group is complete and one
//! aggregated unit is handed to the queue.
//!
//! ## Concurrency
//!
//! Every DeltaFile write goes through a compare-and-swap retry loop: a
//! writer whose read is stale re-reads, re-applies, and saves again, up to
//! a bounded attempt count. Nothing here blocks except
//! [`Orchestrator::take_work`] (bounded by its timeout) and the join
//! coordinator's bounded poll-retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::Did;

use crate::action::{ActionInput, ActionResult, ReinjectChild};
use crate::config::OrchestratorConfig;
use crate::deltafile::{DeltaFile, SourceInfo, Stage};
use crate::error::{Error, Result};
use crate::join::{JoinCoordinator, JoinEntry, JoinEntryId, JoinOutcome};
use crate::queue::{ActionEnvelope, ActionQueue};
use crate::segment::{Content, ContentStore};
use crate::store::{CasResult, DeltaFileStore};

/// Metadata key carrying a unit's join contribution index.
pub const JOIN_INDEX_KEY: &str = "joinIndex";

/// Metadata key selecting a unit's join group.
pub const JOIN_GROUP_KEY: &str = "joinGroup";

/// Fan-in configuration for a join action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSpec {
    /// Contributions required before the group completes.
    pub max_entries: usize,
    /// Minimum contributions for a deadline-forced group to aggregate
    /// rather than error.
    pub min_entries: usize,
    /// How long a group may stay open before the sweep forces it.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

/// One step of a flow plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAction {
    /// Action name, unique within the flow.
    pub name: String,
    /// Action class selecting the dispatch queue.
    pub action_class: String,
    /// Present when this action is a fan-in join point.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
}

impl FlowAction {
    /// Creates an ordinary flow action.
    #[must_use]
    pub fn new(name: impl Into<String>, action_class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_class: action_class.into(),
            join: None,
        }
    }

    /// Makes this action a join point.
    #[must_use]
    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.join = Some(join);
        self
    }
}

/// The ordered action list of one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPlan {
    /// Flow name.
    pub flow: String,
    /// Actions in execution order.
    pub actions: Vec<FlowAction>,
}

impl FlowPlan {
    /// Creates a plan.
    #[must_use]
    pub fn new(flow: impl Into<String>, actions: Vec<FlowAction>) -> Self {
        Self {
            flow: flow.into(),
            actions,
        }
    }

    /// Returns the first action of the flow.
    #[must_use]
    pub fn first_action(&self) -> Option<&FlowAction> {
        self.actions.first()
    }

    /// Returns the action following `after`, if any.
    #[must_use]
    pub fn next_action(&self, after: &str) -> Option<&FlowAction> {
        let position = self.actions.iter().position(|a| a.name == after)?;
        self.actions.get(position + 1)
    }

    /// Returns the named action.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&FlowAction> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// The orchestration service.
pub struct Orchestrator {
    store: Arc<dyn DeltaFileStore>,
    queue: ActionQueue,
    joins: JoinCoordinator,
    content: ContentStore,
    plans: HashMap<String, FlowPlan>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeltaFileStore>,
        queue: ActionQueue,
        joins: JoinCoordinator,
        content: ContentStore,
        plans: Vec<FlowPlan>,
        config: OrchestratorConfig,
    ) -> Self {
        let plans = plans.into_iter().map(|p| (p.flow.clone(), p)).collect();
        Self {
            store,
            queue,
            joins,
            content,
            plans,
            config,
        }
    }

    fn plan(&self, flow: &str) -> Result<&FlowPlan> {
        self.plans
            .get(flow)
            .ok_or_else(|| Error::configuration(format!("no plan registered for flow {flow}")))
    }

    /// Ingests raw bytes: stores them as content under a fresh unit id,
    /// then proceeds as [`Orchestrator::ingress`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown or empty flow, or a
    /// storage/queue error.
    pub async fn ingress_bytes(
        &self,
        source_info: SourceInfo,
        data: bytes::Bytes,
    ) -> Result<Did> {
        let did = Did::generate();
        let content = self
            .content
            .save(did, data)
            .await?
            .with_name(source_info.filename.clone());
        self.ingress_with_did(did, source_info, content).await
    }

    /// Ingests a new unit referencing already-stored content: creates the
    /// DeltaFile, queues the flow's first action, and enqueues its envelope.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown or empty flow, or a
    /// storage/queue error.
    pub async fn ingress(&self, source_info: SourceInfo, content: Content) -> Result<Did> {
        self.ingress_with_did(Did::generate(), source_info, content)
            .await
    }

    #[tracing::instrument(skip(self, source_info, content), fields(did = %did, flow = %source_info.flow))]
    async fn ingress_with_did(
        &self,
        did: Did,
        source_info: SourceInfo,
        content: Content,
    ) -> Result<Did> {
        let plan = self.plan(&source_info.flow)?;
        let first = plan.first_action().ok_or_else(|| {
            Error::configuration(format!("flow {} has no actions", plan.flow))
        })?;
        let first = first.clone();

        let mut deltafile = DeltaFile::with_did(did, source_info, content, Utc::now());
        deltafile.queue_action(&first.name)?;

        self.store.insert(&deltafile).await?;
        self.enqueue(&deltafile, &first).await?;

        tracing::info!(did = %did, "ingested");
        Ok(did)
    }

    /// Feeds one unit of work to a worker: takes an envelope, skips any
    /// whose action is no longer dispatchable, marks the action DISPATCHED,
    /// and assembles the action's input.
    ///
    /// Blocks until work is available or `timeout` elapses; a timeout is
    /// "no work available", not an error.
    ///
    /// # Errors
    ///
    /// Returns a storage or queue error.
    pub async fn take_work(
        &self,
        action_classes: &[&str],
        timeout: Option<Duration>,
    ) -> Result<Option<(ActionEnvelope, ActionInput)>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let Some(envelope) = self.queue.take(action_classes, remaining).await? else {
                return Ok(None);
            };

            let Some(snapshot) = self.store.get(envelope.did).await? else {
                // The unit was purged while queued; drop the envelope.
                continue;
            };
            if !snapshot.ready_for_dispatch(&envelope.action, self.config.feed_timeout, Utc::now())
            {
                // Completed or already claimed by a live worker.
                continue;
            }

            let deltafile = self
                .update_deltafile(envelope.did, |df| df.mark_dispatched(&envelope.action))
                .await?;

            let input = ActionInput {
                source_info: deltafile.source_info.clone(),
                content: deltafile.last_content().cloned(),
                metadata: deltafile.source_info.metadata.clone(),
            };
            return Ok(Some((envelope, input)));
        }
    }

    /// Records an action's result and advances the flow.
    ///
    /// # Errors
    ///
    /// Returns a storage, queue, or join error; transient conflicts are
    /// retried internally up to the configured attempt budget.
    #[tracing::instrument(skip(self, result), fields(did = %envelope.did, action = %envelope.action))]
    pub async fn handle_result(
        &self,
        envelope: &ActionEnvelope,
        result: ActionResult,
    ) -> Result<()> {
        match result {
            ActionResult::Transform { content, metadata } => {
                let df = self
                    .update_deltafile(envelope.did, |df| {
                        let mut content = content.clone();
                        content.metadata.extend(metadata.clone());
                        df.protocol_stack.push(content);
                        df.complete_action(&envelope.action)
                    })
                    .await?;
                self.complete_group_members(envelope).await?;
                self.advance(&df, &envelope.action).await
            }
            ActionResult::Load { domains } => {
                let df = self
                    .update_deltafile(envelope.did, |df| {
                        df.domains.extend(domains.clone());
                        df.complete_action(&envelope.action)
                    })
                    .await?;
                self.complete_group_members(envelope).await?;
                self.advance(&df, &envelope.action).await
            }
            ActionResult::Enrich { enrichments } => {
                let df = self
                    .update_deltafile(envelope.did, |df| {
                        df.enrichment.extend(enrichments.clone());
                        df.complete_action(&envelope.action)
                    })
                    .await?;
                self.complete_group_members(envelope).await?;
                self.advance(&df, &envelope.action).await
            }
            ActionResult::Egress => {
                let df = self
                    .update_deltafile(envelope.did, |df| df.complete_action(&envelope.action))
                    .await?;
                self.complete_group_members(envelope).await?;
                self.advance(&df, &envelope.action).await
            }
            ActionResult::Error { cause, context } => {
                self.update_deltafile(envelope.did, |df| {
                    df.error_action(&envelope.action, cause.clone(), context.clone())
                })
                .await?;
                // The unit stays addressable and retryable; no advance.
                Ok(())
            }
            ActionResult::Filter { message } => {
                self.update_deltafile(envelope.did, |df| {
                    df.filter_action_at(&envelope.action, message.clone(), Utc::now())?;
                    df.stage = Stage::Complete;
                    Ok(())
                })
                .await?;
                Ok(())
            }
            ActionResult::Reinject { children } => {
                self.update_deltafile(envelope.did, |df| {
                    df.complete_action(&envelope.action)?;
                    df.stage = Stage::Complete;
                    Ok(())
                })
                .await?;
                self.reinject(envelope, children).await
            }
        }
    }

    /// Re-queues every errored action of a unit and re-enqueues their
    /// envelopes. Returns the re-queued action names.
    ///
    /// # Errors
    ///
    /// Returns a storage or queue error.
    #[tracing::instrument(skip(self), fields(did = %did))]
    pub async fn retry(&self, did: Did) -> Result<Vec<String>> {
        let deltafile = self
            .update_deltafile(did, |df| {
                df.retry_errors();
                Ok(())
            })
            .await?;

        let plan = self.plan(&deltafile.source_info.flow)?;
        let mut requeued = Vec::new();
        for name in deltafile.queued_actions() {
            if let Some(flow_action) = plan.action(name) {
                self.enqueue(&deltafile, flow_action).await?;
                requeued.push(name.to_string());
            }
        }
        Ok(requeued)
    }

    /// Marks a unit for deletion under `policy` and enqueues the delete
    /// action.
    ///
    /// # Errors
    ///
    /// Returns a storage or queue error.
    #[tracing::instrument(skip(self), fields(did = %did, policy = policy))]
    pub async fn mark_for_delete(&self, did: Did, policy: &str) -> Result<()> {
        let delete_action = self.config.delete_action.clone();
        let deltafile = self
            .update_deltafile(did, |df| {
                df.mark_for_delete(&delete_action, policy)
            })
            .await?;

        let envelope = ActionEnvelope::new(
            deltafile.did,
            delete_action.clone(),
            self.config.delete_action_class.clone(),
            deltafile.source_info.flow.clone(),
        );
        self.queue.put(&envelope).await?;
        Ok(())
    }

    /// Applies a delete policy across matching units: selects every
    /// non-DELETE-stage DeltaFile matching `(created < created_before)` or
    /// `(stage = COMPLETE and modified < completed_before)`, optionally
    /// restricted to one flow, and marks each for deletion under `policy`.
    ///
    /// Returns the ids of the units marked.
    ///
    /// # Errors
    ///
    /// Returns a storage or queue error.
    #[tracing::instrument(skip(self), fields(policy = policy))]
    pub async fn mark_for_delete_matching(
        &self,
        created_before: Option<DateTime<Utc>>,
        completed_before: Option<DateTime<Utc>>,
        flow: Option<&str>,
        policy: &str,
    ) -> Result<Vec<Did>> {
        let eligible = self
            .store
            .find_for_delete(created_before, completed_before, flow)
            .await?;

        let mut marked = Vec::with_capacity(eligible.len());
        for deltafile in eligible {
            self.mark_for_delete(deltafile.did, policy).await?;
            marked.push(deltafile.did);
        }
        Ok(marked)
    }

    /// Re-enqueues the envelopes for DeltaFiles reclaimed by the requeue
    /// sweep. Returns how many envelopes were newly enqueued.
    ///
    /// # Errors
    ///
    /// Returns a queue error; units whose flow has no plan are skipped.
    pub async fn redispatch(&self, reclaimed: &[DeltaFile]) -> Result<u64> {
        let mut envelopes = Vec::new();
        for deltafile in reclaimed {
            let Ok(plan) = self.plan(&deltafile.source_info.flow) else {
                tracing::warn!(
                    did = %deltafile.did,
                    flow = %deltafile.source_info.flow,
                    "skipping requeue for unit with no registered plan"
                );
                continue;
            };
            for name in deltafile.queued_actions() {
                if let Some(flow_action) = plan.action(name) {
                    envelopes.push(self.envelope_for(deltafile, flow_action));
                }
            }
        }
        self.queue.put_batch(&envelopes).await
    }

    /// Finishes a deadline-forced join group: aggregates it when the
    /// minimum was reached, otherwise errors the join action on every
    /// member.
    ///
    /// # Errors
    ///
    /// Returns a storage, queue, or configuration error.
    pub async fn finish_join_group(&self, entry: JoinEntry) -> Result<()> {
        let plan = self.plan(&entry.id.flow)?;
        let flow_action = plan.action(&entry.id.action).ok_or_else(|| {
            Error::configuration(format!(
                "flow {} has no action {}",
                entry.id.flow, entry.id.action
            ))
        })?;

        if entry.has_minimum() {
            self.enqueue_group(&entry, flow_action).await?;
            return Ok(());
        }

        let cause = format!(
            "join group {} timed out with {} of {} required entries",
            entry.id,
            entry.deltafile_entries.len(),
            entry.min_deltafile_entries
        );
        for member in entry.sorted_deltafile_entries() {
            self.update_deltafile(member.did, |df| {
                df.error_action(&entry.id.action, cause.clone(), entry.id.to_string())
            })
            .await?;
        }
        Ok(())
    }

    /// Applies `mutate` to a DeltaFile through the compare-and-swap retry
    /// loop, returning the saved state.
    async fn update_deltafile<F>(&self, did: Did, mut mutate: F) -> Result<DeltaFile>
    where
        F: FnMut(&mut DeltaFile) -> Result<()>,
    {
        let mut last_conflict = (0, 0);

        for _ in 0..self.config.max_save_attempts {
            let Some(mut deltafile) = self.store.get(did).await? else {
                return Err(Error::DeltaFileNotFound { did });
            };
            let expected = deltafile.version;
            mutate(&mut deltafile)?;

            match self.store.save(&mut deltafile).await? {
                CasResult::Success { .. } => return Ok(deltafile),
                CasResult::NotFound => return Err(Error::DeltaFileNotFound { did }),
                CasResult::VersionConflict { actual } => {
                    tracing::debug!(
                        did = %did,
                        expected,
                        actual,
                        "stale save, retrying"
                    );
                    last_conflict = (expected, actual);
                }
            }
        }

        Err(Error::VersionConflict {
            did,
            expected: last_conflict.0,
            actual: last_conflict.1,
        })
    }

    /// Advances the flow after a successful action: queues the next action,
    /// contributes to its join point, or completes the unit.
    async fn advance(&self, deltafile: &DeltaFile, completed: &str) -> Result<()> {
        if deltafile.stage == Stage::Delete {
            // A unit marked for deletion runs only its delete action; the
            // flow never resumes.
            return Ok(());
        }

        let plan = self.plan(&deltafile.source_info.flow)?;
        let Some(next) = plan.next_action(completed) else {
            self.update_deltafile(deltafile.did, |df| {
                df.stage = Stage::Complete;
                Ok(())
            })
            .await?;
            return Ok(());
        };
        let next = next.clone();

        let deltafile = self
            .update_deltafile(deltafile.did, |df| df.queue_action(&next.name))
            .await?;

        match &next.join {
            None => self.enqueue(&deltafile, &next).await,
            Some(spec) => self.contribute(&deltafile, &next, spec).await,
        }
    }

    /// Contributes a unit to a join point; a completed group hands one
    /// aggregated envelope to the queue.
    async fn contribute(
        &self,
        deltafile: &DeltaFile,
        flow_action: &FlowAction,
        spec: &JoinSpec,
    ) -> Result<()> {
        let metadata = &deltafile.source_info.metadata;
        let group_key = metadata
            .get(JOIN_GROUP_KEY)
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let index = metadata
            .get(JOIN_INDEX_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        let id = JoinEntryId::new(
            deltafile.source_info.flow.clone(),
            flow_action.name.clone(),
            group_key,
        );
        let join_date = Utc::now()
            + chrono::Duration::from_std(spec.max_age)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let outcome = self
            .joins
            .contribute(
                &id,
                join_date,
                spec.min_entries,
                spec.max_entries,
                deltafile.did,
                index,
            )
            .await?;

        match outcome {
            JoinOutcome::Pending { entries } => {
                tracing::debug!(id = %id, entries, "join group still open");
                Ok(())
            }
            JoinOutcome::Complete(entry) => self.enqueue_group(&entry, flow_action).await,
        }
    }

    /// Hands one aggregated envelope for a completed join group to the
    /// queue. The lead unit is the lowest contribution index.
    async fn enqueue_group(&self, entry: &JoinEntry, flow_action: &FlowAction) -> Result<()> {
        let members = entry.sorted_deltafile_entries();
        let lead = members
            .first()
            .ok_or_else(|| Error::storage(format!("join entry {} has no members", entry.id)))?;

        let envelope = ActionEnvelope::new(
            lead.did,
            flow_action.name.clone(),
            flow_action.action_class.clone(),
            entry.id.flow.clone(),
        )
        .with_joined_dids(members.iter().map(|m| m.did).collect());

        self.queue.put(&envelope).await?;
        Ok(())
    }

    /// Completes the join action on every non-lead member of an aggregated
    /// envelope.
    async fn complete_group_members(&self, envelope: &ActionEnvelope) -> Result<()> {
        for member in &envelope.joined_dids {
            if *member == envelope.did {
                continue;
            }
            self.update_deltafile(*member, |df| {
                df.complete_action(&envelope.action)?;
                df.stage = Stage::Complete;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Ingests the children of a reinjecting action, tagging each with its
    /// contribution index.
    async fn reinject(&self, envelope: &ActionEnvelope, children: Vec<ReinjectChild>) -> Result<()> {
        for (index, child) in children.into_iter().enumerate() {
            let mut source_info = SourceInfo::new(child.filename, child.flow);
            source_info
                .metadata
                .insert(JOIN_INDEX_KEY.to_string(), index.to_string());
            source_info
                .metadata
                .insert(JOIN_GROUP_KEY.to_string(), envelope.did.to_string());
            self.ingress(source_info, child.content).await?;
        }
        Ok(())
    }

    fn envelope_for(&self, deltafile: &DeltaFile, flow_action: &FlowAction) -> ActionEnvelope {
        ActionEnvelope::new(
            deltafile.did,
            flow_action.name.clone(),
            flow_action.action_class.clone(),
            deltafile.source_info.flow.clone(),
        )
    }

    async fn enqueue(&self, deltafile: &DeltaFile, flow_action: &FlowAction) -> Result<()> {
        let envelope = self.envelope_for(deltafile, flow_action);
        self.queue.put(&envelope).await?;
        Ok(())
    }
}
