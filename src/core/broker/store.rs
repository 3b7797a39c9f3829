// src/core/broker/store.rs

//! The message store boundary.
//!
//! The broker core only needs append, tail-aware reads, a last-position
//! probe, and truncation; durable ledger storage lives behind this trait.
//! [`MemoryTopicLog`] is the bundled implementation used by single-process
//! brokers and the test suite.

use crate::core::DriftError;
use crate::core::protocol::MessageMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

/// A message position within one topic partition. `(ledger_id, entry_id)`,
/// lexicographically ordered.
pub type Position = (u64, u64);

/// One stored entry: possibly a batch, stored exactly as produced.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub position: Position,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
}

/// The append/tail/seek surface the dispatch path runs against.
#[async_trait]
pub trait TopicStore: Send + Sync {
    /// Appends an entry, returning its position. Positions are strictly
    /// increasing.
    async fn append(&self, metadata: MessageMetadata, payload: Bytes)
    -> Result<Position, DriftError>;

    /// Reads up to `max` entries at or after `from`.
    async fn read_from(&self, from: Position, max: usize) -> Result<Vec<StoredEntry>, DriftError>;

    /// The position of the last appended entry, if any.
    async fn last_position(&self) -> Result<Option<Position>, DriftError>;

    /// The position one past the last entry: where the next append lands.
    async fn tail_position(&self) -> Result<Position, DriftError>;

    /// Drops entries up to and including `position`.
    async fn truncate(&self, position: Position) -> Result<(), DriftError>;

    /// Wakes when an entry lands at or after the caller's read position.
    fn tail_notify(&self) -> Arc<Notify>;
}

/// In-memory log. One ledger per topic; entry ids are append indexes.
pub struct MemoryTopicLog {
    ledger_id: u64,
    entries: RwLock<Vec<StoredEntry>>,
    /// Entry id of the first retained entry (advanced by truncation).
    first_entry: RwLock<u64>,
    notify: Arc<Notify>,
}

impl MemoryTopicLog {
    pub fn new(ledger_id: u64) -> Self {
        Self {
            ledger_id,
            entries: RwLock::new(Vec::new()),
            first_entry: RwLock::new(0),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl TopicStore for MemoryTopicLog {
    async fn append(
        &self,
        metadata: MessageMetadata,
        payload: Bytes,
    ) -> Result<Position, DriftError> {
        let position = {
            let mut entries = self.entries.write();
            let entry_id = *self.first_entry.read() + entries.len() as u64;
            let position = (self.ledger_id, entry_id);
            entries.push(StoredEntry {
                position,
                metadata,
                payload,
            });
            position
        };
        self.notify.notify_waiters();
        Ok(position)
    }

    async fn read_from(&self, from: Position, max: usize) -> Result<Vec<StoredEntry>, DriftError> {
        let entries = self.entries.read();
        let first = *self.first_entry.read();
        let start = if from.0 < self.ledger_id {
            0
        } else {
            from.1.saturating_sub(first) as usize
        };
        Ok(entries.iter().skip(start).take(max).cloned().collect())
    }

    async fn last_position(&self) -> Result<Option<Position>, DriftError> {
        Ok(self.entries.read().last().map(|e| e.position))
    }

    async fn tail_position(&self) -> Result<Position, DriftError> {
        let entries = self.entries.read();
        Ok((
            self.ledger_id,
            *self.first_entry.read() + entries.len() as u64,
        ))
    }

    async fn truncate(&self, position: Position) -> Result<(), DriftError> {
        if position.0 != self.ledger_id {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let mut first = self.first_entry.write();
        let drop_count = (position.1 + 1).saturating_sub(*first) as usize;
        let drop_count = drop_count.min(entries.len());
        entries.drain(..drop_count);
        *first += drop_count as u64;
        Ok(())
    }

    fn tail_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
