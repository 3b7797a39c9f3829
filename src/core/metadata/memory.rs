// src/core/metadata/memory.rs

//! The in-memory [`MetadataStore`] implementation.
//!
//! Backs single-process clusters and the test suite. Per-key atomicity comes
//! from the `DashMap` entry API: a compare-and-set observes and replaces an
//! entry under that key's shard lock, which is exactly the contract the
//! ownership registry relies on.

use crate::core::DriftError;
use crate::core::metadata::{
    MetaEvent, MetaEventKind, MetaVersion, MetadataStore, SessionId, VersionedValue,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoreEntry {
    data: Bytes,
    version: u64,
    /// Present for ephemeral keys: the owning session.
    owner_session: Option<SessionId>,
}

/// An in-memory metadata store with versioned writes, ephemeral
/// session-bound keys, and change notifications.
#[derive(Debug)]
pub struct MemoryMetadataStore {
    entries: DashMap<String, StoreEntry>,
    /// Paths created ephemerally by each live session.
    sessions: DashMap<SessionId, Vec<String>>,
    next_session: AtomicU64,
    events_tx: broadcast::Sender<MetaEvent>,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            events_tx,
        }
    }

    fn notify(&self, path: &str, kind: MetaEventKind) {
        // Nobody listening is fine; ignore the send error.
        let _ = self.events_tx.send(MetaEvent {
            path: path.to_string(),
            kind,
        });
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, path: &str) -> Result<Option<VersionedValue>, DriftError> {
        Ok(self.entries.get(path).map(|e| VersionedValue {
            data: e.data.clone(),
            version: e.version,
        }))
    }

    async fn put(&self, path: &str, data: Bytes, expected: MetaVersion) -> Result<u64, DriftError> {
        match self.entries.entry(path.to_string()) {
            Entry::Occupied(mut occupied) => {
                match expected {
                    MetaVersion::Any => {}
                    MetaVersion::Exact(v) if occupied.get().version == v => {}
                    MetaVersion::Exact(_) => {
                        return Err(DriftError::BadVersion(path.to_string()));
                    }
                    MetaVersion::Absent => {
                        return Err(DriftError::AlreadyExists(path.to_string()));
                    }
                }
                let next = occupied.get().version + 1;
                occupied.insert(StoreEntry {
                    data,
                    version: next,
                    owner_session: occupied.get().owner_session,
                });
                self.notify(path, MetaEventKind::Modified);
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                if let MetaVersion::Exact(_) = expected {
                    return Err(DriftError::BadVersion(path.to_string()));
                }
                vacant.insert(StoreEntry {
                    data,
                    version: 0,
                    owner_session: None,
                });
                self.notify(path, MetaEventKind::Created);
                Ok(0)
            }
        }
    }

    async fn put_ephemeral(
        &self,
        path: &str,
        data: Bytes,
        session: SessionId,
    ) -> Result<(), DriftError> {
        if !self.sessions.contains_key(&session) {
            return Err(DriftError::SessionExpired);
        }
        match self.entries.entry(path.to_string()) {
            Entry::Occupied(_) => Err(DriftError::AlreadyExists(path.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(StoreEntry {
                    data,
                    version: 0,
                    owner_session: Some(session),
                });
                self.sessions
                    .entry(session)
                    .or_default()
                    .push(path.to_string());
                self.notify(path, MetaEventKind::Created);
                Ok(())
            }
        }
    }

    async fn delete(&self, path: &str, expected: MetaVersion) -> Result<(), DriftError> {
        match self.entries.entry(path.to_string()) {
            Entry::Occupied(occupied) => {
                if let MetaVersion::Exact(v) = expected
                    && occupied.get().version != v
                {
                    return Err(DriftError::BadVersion(path.to_string()));
                }
                occupied.remove();
                self.notify(path, MetaEventKind::Deleted);
                Ok(())
            }
            Entry::Vacant(_) => Ok(()),
        }
    }

    async fn children(&self, prefix: &str) -> Result<Vec<String>, DriftError> {
        let mut paths: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn create_session(&self) -> Result<SessionId, DriftError> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id, Vec::new());
        debug!("metadata session {id} opened");
        Ok(id)
    }

    async fn end_session(&self, session: SessionId) -> Result<(), DriftError> {
        let Some((_, paths)) = self.sessions.remove(&session) else {
            return Ok(());
        };
        for path in paths {
            // Only remove the key if it is still owned by this session: a
            // later claimant may have re-created it after an explicit delete.
            let removed = self
                .entries
                .remove_if(&path, |_, entry| entry.owner_session == Some(session))
                .is_some();
            if removed {
                self.notify(&path, MetaEventKind::Deleted);
            }
        }
        debug!("metadata session {session} ended");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<MetaEvent> {
        self.events_tx.subscribe()
    }
}
