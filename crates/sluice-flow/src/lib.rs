//! # sluice-flow
//!
//! Orchestration core for the Sluice data-routing engine.
//!
//! This crate routes ingested units ("DeltaFiles") through a graph of
//! pluggable processing actions, providing:
//!
//! - **State Machine**: per-unit lifecycle and action bookkeeping with an
//!   append-only transition history
//! - **Segment Model**: content-addressed, immutable byte-range references
//!   into object storage, with zero-copy slicing and splitting
//! - **Dispatch Queue**: keyed, blocking hand-off of runnable action work
//!   to workers over a sorted-set store
//! - **Join Coordination**: fan-in barriers combining several units into
//!   one continuation
//! - **Maintenance Sweeps**: periodic reclamation of work lost to crashed
//!   or stalled workers
//!
//! ## Guarantees
//!
//! - **No lost transitions**: every action state change is applied and
//!   recorded in history
//! - **No silent overwrites**: DeltaFile persistence is compare-and-swap on
//!   a version field; stale writers retry
//! - **No deadlocks**: every blocking operation is bounded by a timeout,
//!   and every lock is released by its holder or reclaimed by a sweep
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sluice_core::MemoryBackend;
//! use sluice_flow::config::{JoinConfig, OrchestratorConfig, QueueConfig};
//! use sluice_flow::error::Result;
//! use sluice_flow::join::memory::InMemoryJoinRepository;
//! use sluice_flow::join::JoinCoordinator;
//! use sluice_flow::orchestrator::{FlowAction, FlowPlan, Orchestrator};
//! use sluice_flow::queue::memory::MemoryQueueBackend;
//! use sluice_flow::queue::ActionQueue;
//! use sluice_flow::segment::ContentStore;
//! use sluice_flow::store::memory::InMemoryDeltaFileStore;
//!
//! # fn main() -> Result<()> {
//! let plan = FlowPlan::new(
//!     "passthrough",
//!     vec![
//!         FlowAction::new("Transform", "transform"),
//!         FlowAction::new("Egress", "egress"),
//!     ],
//! );
//!
//! let orchestrator = Orchestrator::new(
//!     Arc::new(InMemoryDeltaFileStore::new()),
//!     ActionQueue::new(Arc::new(MemoryQueueBackend::new()), QueueConfig::default()),
//!     JoinCoordinator::new(Arc::new(InMemoryJoinRepository::new()), JoinConfig::default()),
//!     ContentStore::new(Arc::new(MemoryBackend::new())),
//!     vec![plan],
//!     OrchestratorConfig::default(),
//! );
//! # let _ = orchestrator;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod config;
pub mod deltafile;
pub mod error;
pub mod join;
pub mod maintenance;
pub mod orchestrator;
pub mod queue;
pub mod segment;
pub mod splitter;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action::{ActionContext, ActionExecutor, ActionInput, ActionResult};
    pub use crate::config::{JoinConfig, OrchestratorConfig, QueueConfig, SweepConfig};
    pub use crate::deltafile::{Action, ActionState, DeltaFile, SourceInfo, Stage};
    pub use crate::error::{Error, Result};
    pub use crate::join::{JoinCoordinator, JoinEntry, JoinEntryId, JoinOutcome, JoinRepository};
    pub use crate::maintenance::{DeleteSweep, JoinSweep, RequeueSweep};
    pub use crate::orchestrator::{FlowAction, FlowPlan, JoinSpec, Orchestrator};
    pub use crate::queue::{ActionEnvelope, ActionQueue, PutResult, QueueBackend};
    pub use crate::segment::{calculate_total_size, Content, ContentStore, Segment};
    pub use crate::splitter::{SplitParameters, Splitter};
    pub use crate::store::{CasResult, DeltaFileStore};
}
