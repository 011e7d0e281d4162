//! Content-addressed segment model.
//!
//! This module provides:
//! - [`Segment`]: an immutable, addressable byte range in object storage
//! - [`Content`]: a logical content value composed of segment references
//! - [`ContentStore`]: reads and writes content through a storage backend
//!
//! ## Design Principles
//!
//! - **Immutability**: segments are written once and never mutated in place;
//!   new logical values reference, slice, or append existing segments
//! - **Deterministic addressing**: object names shard on the DeltaFile ID so
//!   content distributes uniformly across object-store partitions and can be
//!   purged by prefix
//! - **Zero-copy slicing**: [`Content::subreference`] narrows a byte range
//!   without touching stored bytes

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use sluice_core::{Did, SegmentId, StorageBackend};

use crate::error::{Error, Result};

/// Number of leading `did` characters used as the shard directory.
const SHARD_PREFIX_LEN: usize = 3;

/// An immutable reference to a byte range of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Identifier of the stored object this segment points into.
    pub uuid: SegmentId,
    /// Byte offset within the stored object.
    pub offset: u64,
    /// Number of bytes referenced.
    pub size: u64,
    /// DeltaFile whose ingest produced the stored object.
    pub did: Did,
}

impl Segment {
    /// Creates a segment covering `size` bytes at `offset` of a stored object.
    #[must_use]
    pub const fn new(uuid: SegmentId, offset: u64, size: u64, did: Did) -> Self {
        Self {
            uuid,
            offset,
            size,
            did,
        }
    }

    /// Returns the object-store address of the bytes this segment references.
    #[must_use]
    pub fn object_name(&self) -> String {
        object_name(self.did, self.uuid)
    }
}

/// Returns the deterministic, sharded object-store address for a segment.
///
/// The first characters of the `did` form a prefix directory so writes
/// distribute uniformly across object-store partitions.
#[must_use]
pub fn object_name(did: Did, uuid: SegmentId) -> String {
    let did_str = did.to_string();
    let prefix = &did_str[..SHARD_PREFIX_LEN];
    format!("objects/{prefix}/{did_str}/{uuid}")
}

/// Returns the address prefix under which all of a DeltaFile's content lives.
///
/// Used by the delete sweep to purge content without enumerating segments.
#[must_use]
pub fn object_prefix(did: Did) -> String {
    let did_str = did.to_string();
    let prefix = &did_str[..SHARD_PREFIX_LEN];
    format!("objects/{prefix}/{did_str}/")
}

/// Computes the total stored size of a set of segments.
///
/// Segments are grouped by `(did, uuid)`; within each group, overlapping or
/// adjacent byte ranges are merged before summing, so bytes shared by
/// overlapping sub-references (a header stitched into several split chunks,
/// for example) are counted once.
#[must_use]
pub fn calculate_total_size(segments: &[Segment]) -> u64 {
    let mut ranges: HashMap<(Did, SegmentId), Vec<(u64, u64)>> = HashMap::new();
    for segment in segments {
        ranges
            .entry((segment.did, segment.uuid))
            .or_default()
            .push((segment.offset, segment.offset + segment.size));
    }

    let mut total = 0;
    for group in ranges.values_mut() {
        group.sort_unstable();
        let mut merged_end: Option<(u64, u64)> = None;
        for &(start, end) in group.iter() {
            match merged_end {
                Some((merged_start, prev_end)) if start <= prev_end => {
                    merged_end = Some((merged_start, prev_end.max(end)));
                }
                Some((merged_start, prev_end)) => {
                    total += prev_end - merged_start;
                    merged_end = Some((start, end));
                }
                None => merged_end = Some((start, end)),
            }
        }
        if let Some((merged_start, end)) = merged_end {
            total += end - merged_start;
        }
    }
    total
}

/// A logical content value: a named, typed sequence of segment references
/// whose bytes are the concatenation of the referenced ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Display name (e.g., the ingested filename or a chunk label).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Media type of the referenced bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Ordered segment references; logical bytes are their concatenation.
    pub segments: Vec<Segment>,
    /// Per-content metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Content {
    /// Creates a content value over the given segments.
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            name: None,
            media_type: None,
            segments,
            metadata: HashMap::new(),
        }
    }

    /// Sets the content name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the media type.
    #[must_use]
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Returns the logical size: the sum of the referenced range sizes.
    ///
    /// Unlike [`calculate_total_size`], overlap between references is counted
    /// every time it is referenced, because the logical byte sequence repeats
    /// it.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }

    /// Produces a new content value referencing `size` logical bytes starting
    /// at `offset`, without copying any stored data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] ([`sluice_core::Error::InvalidInput`]) if the
    /// requested range exceeds the logical size.
    pub fn subreference(
        &self,
        offset: u64,
        size: u64,
        name: Option<String>,
        media_type: Option<String>,
    ) -> Result<Self> {
        if offset + size > self.size() {
            return Err(Error::Core(sluice_core::Error::InvalidInput(format!(
                "subreference [{offset}, {}) exceeds content size {}",
                offset + size,
                self.size()
            ))));
        }

        let mut segments = Vec::new();
        let mut remaining_skip = offset;
        let mut remaining_take = size;

        for segment in &self.segments {
            if remaining_take == 0 {
                break;
            }
            if remaining_skip >= segment.size {
                remaining_skip -= segment.size;
                continue;
            }

            let start = segment.offset + remaining_skip;
            let available = segment.size - remaining_skip;
            let take = available.min(remaining_take);
            segments.push(Segment::new(segment.uuid, start, take, segment.did));

            remaining_skip = 0;
            remaining_take -= take;
        }

        Ok(Self {
            name,
            media_type: media_type.or_else(|| self.media_type.clone()),
            segments,
            metadata: self.metadata.clone(),
        })
    }
}

/// Reads and writes [`Content`] through an object-store backend.
pub struct ContentStore {
    backend: Arc<dyn StorageBackend>,
}

impl Clone for ContentStore {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl ContentStore {
    /// Creates a content store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Writes `data` as a new single-segment content value owned by `did`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub async fn save(&self, did: Did, data: Bytes) -> Result<Content> {
        let uuid = SegmentId::generate();
        let size = self.backend.put(&object_name(did, uuid), data).await?;
        Ok(Content::new(vec![Segment::new(uuid, 0, size, did)]))
    }

    /// Reads a content value's logical bytes: each referenced range in order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if any referenced object is missing or a
    /// range read fails.
    pub async fn load(&self, content: &Content) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(usize::try_from(content.size()).unwrap_or(0));
        for segment in &content.segments {
            let bytes = self
                .backend
                .get_range(&segment.object_name(), segment.offset, segment.size)
                .await?;
            buf.extend_from_slice(&bytes);
        }
        Ok(buf.freeze())
    }

    /// Deletes every stored object under a DeltaFile's content prefix.
    ///
    /// # Errors
    ///
    /// Returns a storage error if listing or deletion fails.
    pub async fn delete_all(&self, did: Did) -> Result<u64> {
        let objects = self.backend.list(&object_prefix(did), None).await?;
        let mut deleted = 0;
        for meta in objects {
            self.backend.delete(&meta.path).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
