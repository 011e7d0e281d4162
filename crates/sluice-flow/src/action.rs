//! The action execution contract.
//!
//! Actions are user-supplied processing steps executed by an external
//! harness; this crate consumes their results but never runs them. The
//! contract is a closed set of result variants; the orchestrator only
//! needs each variant's *effect*: a content delta, a metadata delta,
//! domain/enrichment data, an error cause, a filter reason, or a child-unit
//! fan-out.
//!
//! One parameterized abstraction replaces any deep action-class hierarchy:
//! an executor is `(context, params, input) -> ActionResult`, and "simple"
//! variants are just executors ignoring `params`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sluice_core::Did;

use crate::deltafile::SourceInfo;
use crate::error::Result;
use crate::segment::Content;

/// Execution context identifying the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    /// DeltaFile being processed.
    pub did: Did,
    /// Action name on the DeltaFile.
    pub action: String,
    /// Flow the DeltaFile belongs to.
    pub flow: String,
}

/// Input handed to an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInput {
    /// Source metadata recorded at ingest.
    pub source_info: SourceInfo,
    /// The content the action reads, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Accumulated metadata visible to the action.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A child unit produced by a reinjecting action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinjectChild {
    /// Filename for the child unit.
    pub filename: String,
    /// Flow the child is ingested into.
    pub flow: String,
    /// The child's content.
    pub content: Content,
}

/// The closed set of action results.
///
/// Every variant's effect on the DeltaFile is applied by the orchestrator;
/// actions themselves never touch DeltaFile state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionResult {
    /// New content replacing the top of the protocol stack, plus a metadata
    /// delta.
    Transform {
        /// Content produced by the transform.
        content: Content,
        /// Metadata to merge into the unit.
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    /// Domain data extracted by a load action.
    Load {
        /// Domain entries to merge.
        domains: HashMap<String, String>,
    },
    /// Enrichment data produced by an enrich action.
    Enrich {
        /// Enrichment entries to merge.
        enrichments: HashMap<String, String>,
    },
    /// The unit was delivered out of the system.
    Egress,
    /// The action failed; recorded on the Action record and retryable.
    Error {
        /// What failed.
        cause: String,
        /// Where/how it failed.
        context: String,
    },
    /// The unit does not apply to this flow and leaves it.
    Filter {
        /// Why the unit was filtered.
        message: String,
    },
    /// The action split the unit into child units to ingest.
    Reinject {
        /// Children to ingest.
        children: Vec<ReinjectChild>,
    },
}

/// Executes one action.
///
/// Implemented by the external action harness; `params` carries the
/// flow-configured action parameters.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Runs the action and returns its result variant.
    async fn execute(
        &self,
        context: &ActionContext,
        params: &serde_json::Value,
        input: ActionInput,
    ) -> Result<ActionResult>;
}
