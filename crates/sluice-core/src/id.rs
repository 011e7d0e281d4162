//! Strongly-typed identifiers for Sluice entities.
//!
//! All identifiers in Sluice are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Globally unique**: No coordination required for generation
//! - **Address-friendly**: The hex rendering feeds deterministic object-store
//!   shard paths
//!
//! # Example
//!
//! ```rust
//! use sluice_core::id::{Did, SegmentId};
//!
//! let did = Did::generate();
//! let segment = SegmentId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: Did = segment;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a DeltaFile.
///
/// A DeltaFile is the unit of ingested data tracked through the pipeline.
/// The `did` also prefixes every object-store address the unit's content is
/// written under, so deleting a DeltaFile can purge its content by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(Uuid);

impl Did {
    /// Generates a new unique DeltaFile ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a DeltaFile ID from a raw UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid DeltaFile ID '{s}': {e}"),
        })
    }
}

/// A unique identifier for an immutable content segment.
///
/// Segments are byte ranges written once into object storage and referenced
/// by any number of content values afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(Uuid);

impl SegmentId {
    /// Generates a new unique segment ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a segment ID from a raw UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SegmentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid segment ID '{s}': {e}"),
        })
    }
}
