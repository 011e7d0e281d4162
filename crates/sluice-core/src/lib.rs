//! # sluice-core
//!
//! Foundation types for the Sluice data-routing engine.
//!
//! This crate provides the pieces every other Sluice crate builds on:
//!
//! - **Typed identifiers**: [`Did`] and [`SegmentId`] prevent mixing up
//!   DeltaFile and segment identifiers at compile time
//! - **Shared errors**: a structured [`Error`] type with a [`Result`] alias
//! - **Storage contract**: the [`StorageBackend`] trait over content-addressed
//!   object storage, with an in-memory backend for tests
//! - **Observability**: logging initialization and span constructors
//!
//! Higher-level orchestration (the DeltaFile state machine, dispatch queue,
//! and join coordination) lives in `sluice-flow`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

pub use error::{Error, Result};
pub use id::{Did, SegmentId};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend};
