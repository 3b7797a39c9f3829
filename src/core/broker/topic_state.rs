// src/core/broker/topic_state.rs

//! One topic as the owning broker sees it: the log, the attached producers,
//! the subscriptions, and the per-producer-name sequence map that powers
//! deduplication.

use crate::core::DriftError;
use crate::core::broker::store::{Position, TopicStore};
use crate::core::broker::subscription::Subscription;
use crate::core::protocol::{
    ClientCommand, Frame, InitialPosition, MessageMetadata, SubType,
};
use crate::core::topic::TopicName;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// A producer as registered on the broker: its stable name and the frame
/// sink of the connection that created it.
pub struct ProducerHandle {
    pub name: String,
    pub frames: tokio::sync::mpsc::UnboundedSender<Frame>,
}

/// The result of a publish: either a fresh position or the position of the
/// already persisted duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Persisted(Position),
    Duplicate(Position),
}

impl PublishOutcome {
    pub fn position(&self) -> Position {
        match self {
            PublishOutcome::Persisted(p) | PublishOutcome::Duplicate(p) => *p,
        }
    }
}

/// Broker-side state of one topic.
///
/// The sequence map and recovered-cursor map are shared with the topics hub
/// so they survive an unload/re-acquire cycle the way durable storage
/// would.
pub struct BrokerTopic {
    pub name: TopicName,
    store: Arc<dyn TopicStore>,
    pub subscriptions: DashMap<String, Arc<Subscription>>,
    pub producers: DashMap<u64, ProducerHandle>,
    /// producer name -> (last persisted sequence id, its position). Survives
    /// producer reconnects, which is what makes dedup work.
    sequences: Arc<DashMap<String, (u64, Position)>>,
    /// Cursor positions persisted when the topic was last evicted.
    recovered_cursors: Arc<DashMap<String, Position>>,
    terminated: Arc<AtomicBool>,
}

impl BrokerTopic {
    pub fn new(
        name: TopicName,
        store: Arc<dyn TopicStore>,
        sequences: Arc<DashMap<String, (u64, Position)>>,
        recovered_cursors: Arc<DashMap<String, Position>>,
    ) -> Self {
        Self {
            name,
            store,
            subscriptions: DashMap::new(),
            producers: DashMap::new(),
            sequences,
            recovered_cursors,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<dyn TopicStore> {
        &self.store
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The last persisted sequence id for a producer name, `-1` when the
    /// name has never published.
    pub fn last_sequence_id(&self, producer_name: &str) -> i64 {
        self.sequences
            .get(producer_name)
            .map_or(-1, |s| s.value().0 as i64)
    }

    /// Appends a message, suppressing duplicates: a sequence id at or below
    /// the last persisted one for the same producer name is not re-appended
    /// and resolves to the previously persisted position.
    pub async fn publish(
        &self,
        metadata: MessageMetadata,
        payload: Bytes,
    ) -> Result<PublishOutcome, DriftError> {
        if self.is_terminated() {
            return Err(DriftError::TopicTerminated);
        }
        let producer_name = metadata.producer_name.clone();
        let sequence_id = metadata.sequence_id;
        if let Some(existing) = self.sequences.get(&producer_name)
            && sequence_id <= existing.value().0
        {
            debug!(
                "suppressing duplicate seq {sequence_id} from '{producer_name}' on {}",
                self.name
            );
            return Ok(PublishOutcome::Duplicate(existing.value().1));
        }
        let position = self.store.append(metadata, payload).await?;
        self.sequences.insert(producer_name, (sequence_id, position));
        Ok(PublishOutcome::Persisted(position))
    }

    /// Gets or creates a subscription. A second consumer joining must match
    /// the existing mode while consumers are attached.
    pub async fn subscription(
        &self,
        name: &str,
        sub_type: SubType,
        initial_position: InitialPosition,
        start_message_id: Option<Position>,
    ) -> Result<Arc<Subscription>, DriftError> {
        if let Some(existing) = self.subscriptions.get(name) {
            let existing = existing.value().clone();
            if existing.sub_type != sub_type && existing.consumer_count() > 0 {
                return Err(DriftError::ConsumerBusy(format!(
                    "subscription '{name}' is already active with a different mode"
                )));
            }
            return Ok(existing);
        }
        let recovered = self.recovered_cursors.get(name).map(|p| *p.value());
        let start = match (start_message_id, recovered) {
            (Some(position), _) => position,
            // A previously persisted cursor wins over the initial-position
            // hint; the prior session's unacked messages get redelivered.
            (None, Some(position)) => position,
            (None, None) => match initial_position {
                InitialPosition::Earliest => {
                    let tail = self.store.tail_position().await?;
                    self.store
                        .read_from((tail.0, 0), 1)
                        .await?
                        .first()
                        .map_or((tail.0, 0), |e| e.position)
                }
                InitialPosition::Latest => self.store.tail_position().await?,
            },
        };
        let subscription = Subscription::new(
            name.to_string(),
            self.name.clone(),
            sub_type,
            self.store.clone(),
            self.terminated.clone(),
            start,
        );
        info!(
            "created subscription '{name}' ({sub_type:?}) on {} at {start:?}",
            self.name
        );
        self.subscriptions
            .insert(name.to_string(), subscription.clone());
        Ok(subscription)
    }

    /// Drops a subscription cursor entirely. Refused while consumers are
    /// still attached.
    pub fn unsubscribe(&self, name: &str) -> Result<(), DriftError> {
        let Some(existing) = self.subscriptions.get(name) else {
            return Err(DriftError::NotFound(format!("subscription '{name}'")));
        };
        if existing.consumer_count() > 0 {
            return Err(DriftError::PreconditionFailed(format!(
                "subscription '{name}' still has consumers"
            )));
        }
        drop(existing);
        if let Some((_, sub)) = self.subscriptions.remove(name) {
            sub.close();
        }
        Ok(())
    }

    /// Marks the topic terminated: producers fail from here on and
    /// consumers receive end-of-topic once drained.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        for sub in self.subscriptions.iter() {
            sub.value().notify_new_data();
        }
    }

    /// Sends close commands to every attached producer and consumer so
    /// clients reconnect and re-lookup, persists cursor positions, then
    /// stops the dispatchers. Used when the owning bundle unloads.
    pub fn disconnect_clients(&self) {
        for producer in self.producers.iter() {
            let _ = producer
                .value()
                .frames
                .send(Frame::command(ClientCommand::CloseProducer {
                    producer_id: *producer.key(),
                    request_id: 0,
                }));
        }
        self.producers.clear();
        for sub in self.subscriptions.iter() {
            self.recovered_cursors
                .insert(sub.key().clone(), sub.value().resume_position());
            sub.value().disconnect_consumers();
            sub.value().close();
        }
    }
}
