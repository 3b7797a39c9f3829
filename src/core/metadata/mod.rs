// src/core/metadata/mod.rs

//! The metadata store gateway: versioned reads and writes, compare-and-set,
//! ephemeral session-bound nodes, and change notifications over a
//! hierarchical key space.
//!
//! The broker only ever talks to the [`MetadataStore`] trait; the bundled
//! [`MemoryMetadataStore`] backs single-process deployments and every test.

pub mod cache;
pub mod memory;
pub mod paths;
pub mod policies;

pub use cache::PoliciesCache;
pub use memory::MemoryMetadataStore;

use crate::core::DriftError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Identifies one live session with the store. Ephemeral nodes created under
/// a session vanish atomically when the session ends.
pub type SessionId = u64;

/// A value read from the store together with its write version.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub data: Bytes,
    pub version: u64,
}

/// The version precondition of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaVersion {
    /// Unconditional write.
    Any,
    /// The key must exist at exactly this version.
    Exact(u64),
    /// The key must not exist (compare-and-create).
    Absent,
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaEventKind {
    Created,
    Modified,
    Deleted,
}

/// A change notification. Watchers filter by path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEvent {
    pub path: String,
    pub kind: MetaEventKind,
}

/// The store abstraction. All operations are linearizable per key; the
/// compare-and-set `put` is the only concurrency-control primitive the rest
/// of the system needs.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Reads a key, returning the value with its version.
    async fn get(&self, path: &str) -> Result<Option<VersionedValue>, DriftError>;

    /// Writes a key, honoring the version precondition. Returns the new
    /// version. A failed precondition surfaces as `BadVersion` (or
    /// `AlreadyExists` for `MetaVersion::Absent`).
    async fn put(&self, path: &str, data: Bytes, expected: MetaVersion) -> Result<u64, DriftError>;

    /// Compare-and-creates an ephemeral key bound to `session`. Fails with
    /// `AlreadyExists` when a live key is already present.
    async fn put_ephemeral(
        &self,
        path: &str,
        data: Bytes,
        session: SessionId,
    ) -> Result<(), DriftError>;

    /// Deletes a key, honoring the version precondition. Deleting a missing
    /// key is a no-op.
    async fn delete(&self, path: &str, expected: MetaVersion) -> Result<(), DriftError>;

    /// Lists all keys under a path prefix, sorted.
    async fn children(&self, prefix: &str) -> Result<Vec<String>, DriftError>;

    /// Opens a new session for ephemeral nodes.
    async fn create_session(&self) -> Result<SessionId, DriftError>;

    /// Ends a session, atomically removing every ephemeral key it created.
    async fn end_session(&self, session: SessionId) -> Result<(), DriftError>;

    /// Subscribes to all change notifications.
    fn events(&self) -> broadcast::Receiver<MetaEvent>;
}
