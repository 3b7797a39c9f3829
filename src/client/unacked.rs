// src/client/unacked.rs

//! Tracks delivered-but-unacknowledged message ids with a per-message TTL.
//!
//! The consumer adds ids as messages reach the application and removes them
//! on ack; a periodic sweep collects everything past its deadline so the
//! consumer can request redelivery. The tracker is also the client-side
//! backpressure gauge: flow permits stop while it holds more than the
//! configured cap.

use crate::core::protocol::MessageIdData;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct UnackedTracker {
    ack_timeout: Option<Duration>,
    entries: Mutex<HashMap<MessageIdData, Instant>>,
}

impl UnackedTracker {
    pub fn new(ack_timeout: Option<Duration>) -> Self {
        Self {
            ack_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Starts tracking a delivered message. Ids are tracked even without an
    /// ack timeout: the size cap (backpressure) still needs them.
    pub fn add(&self, id: MessageIdData) {
        self.entries.lock().insert(id, Instant::now());
    }

    /// Stops tracking an individually acknowledged message.
    pub fn remove(&self, id: &MessageIdData) {
        self.entries.lock().remove(id);
    }

    /// Stops tracking everything at or before the cumulatively acked
    /// position.
    pub fn remove_up_to(&self, position: (u64, u64)) {
        self.entries
            .lock()
            .retain(|id, _| id.position() > position);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Removes and returns every id whose TTL lapsed. They are expected to
    /// come back through redelivery, which re-adds them.
    pub fn take_expired(&self) -> Vec<MessageIdData> {
        let Some(timeout) = self.ack_timeout else {
            return Vec::new();
        };
        let mut entries = self.entries.lock();
        let expired: Vec<MessageIdData> = entries
            .iter()
            .filter(|(_, delivered)| delivered.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }
}
