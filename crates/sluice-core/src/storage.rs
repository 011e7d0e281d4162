//! Storage backend abstraction for object storage (S3, MinIO, local).
//!
//! This module defines the object-store contract the segment model is
//! realized against:
//!
//! - Whole-object and byte-range reads
//! - Idempotent delete
//! - Prefix listing with an optional modified-before filter, used by the
//!   delete sweep to find aged-off content
//!
//! Segments are immutable once written, so the contract needs no conditional
//! writes: an object is written exactly once under a deterministic address
//! and only ever read, referenced, or deleted afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification timestamp.
    pub last_modified: DateTime<Utc>,
}

/// Storage backend trait for object storage.
///
/// All storage backends (S3-compatible stores, the in-memory test backend)
/// implement this trait. The contract is designed for cloud object storage
/// semantics: immutable writes, ranged reads, idempotent deletes.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from worker
/// tasks; segments are immutable, so concurrent readers need no further
/// synchronization.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Writes an object, returning the number of bytes written.
    async fn put(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Reads an entire object.
    ///
    /// Returns [`Error::NotFound`] if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Reads `length` bytes of an object starting at `offset`.
    ///
    /// Returns [`Error::InvalidInput`] if `offset` exceeds the object length.
    /// The read is clamped to the object length when `offset + length`
    /// overruns it.
    async fn get_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix, optionally keeping only those
    /// last modified before `modified_before`.
    ///
    /// **Ordering**: results are returned in arbitrary order; callers
    /// requiring deterministic order should sort.
    async fn list(
        &self,
        prefix: &str,
        modified_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, StoredObject>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        Ok(objects.len())
    }

    /// Overrides an object's `last_modified` timestamp.
    ///
    /// Test helper for exercising modified-before listing without sleeping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the object doesn't exist.
    pub fn set_last_modified(&self, path: &str, last_modified: DateTime<Utc>) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        let object = objects
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))?;
        object.last_modified = last_modified;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, path: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        drop(objects);
        Ok(size)
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn get_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let data = self.get(path).await?;
        let len = data.len() as u64;

        if offset > len {
            return Err(Error::InvalidInput(format!(
                "range offset {offset} exceeds object length {len}"
            )));
        }

        let end = offset.saturating_add(length).min(len);
        let start = usize::try_from(offset).map_err(|_| {
            Error::InvalidInput(format!("range offset {offset} does not fit in memory"))
        })?;
        let end = usize::try_from(end)
            .map_err(|_| Error::InvalidInput(format!("range end {end} does not fit in memory")))?;
        Ok(data.slice(start..end))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        objects.remove(path);
        drop(objects);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        modified_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        Ok(objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .filter(|(_, o)| modified_before.is_none_or(|cutoff| o.last_modified < cutoff))
            .map(|(path, o)| ObjectMeta {
                path: path.clone(),
                size: o.data.len() as u64,
                last_modified: o.last_modified,
            })
            .collect())
    }
}
