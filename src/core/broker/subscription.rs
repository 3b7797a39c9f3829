// src/core/broker/subscription.rs

//! Subscriptions and the dispatch path.
//!
//! A subscription is a named durable cursor with an unacked-range set and a
//! mode (`Exclusive`, `Shared`, `Failover`). One dispatcher task per
//! subscription pulls entries from the topic store and pushes them to
//! consumers holding flow permits. Acks may arrive out of order; the cursor
//! mark-delete point only advances over contiguously acknowledged
//! positions.

use crate::core::DriftError;
use crate::core::broker::store::{Position, StoredEntry, TopicStore};
use crate::core::protocol::{
    AckType, ClientCommand, Frame, MessageIdData, SubType,
};
use crate::core::topic::TopicName;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

/// A consumer as the broker sees it: an id, a frame sink towards its
/// connection, and its flow-permit balance.
pub struct ServerConsumer {
    pub id: u64,
    pub permits: AtomicI64,
    pub frames: mpsc::UnboundedSender<Frame>,
    /// The designated consumer of a failover subscription; always true for
    /// exclusive and shared.
    pub active: AtomicBool,
}

impl ServerConsumer {
    pub fn new(id: u64, frames: mpsc::UnboundedSender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            id,
            permits: AtomicI64::new(0),
            frames,
            active: AtomicBool::new(true),
        })
    }
}

struct SubInner {
    /// The first position this subscription covers; the mark-delete point
    /// can only start folding from here.
    start_position: Position,
    /// Next position to fetch from the store.
    read_position: Position,
    /// Everything at or before this position is acknowledged.
    mark_delete: Option<Position>,
    /// Acknowledged positions past the mark-delete point.
    individually_acked: BTreeSet<Position>,
    /// Delivered but not yet acknowledged: position to consumer id.
    in_flight: BTreeMap<Position, u64>,
    /// Positions queued for redelivery, served before the tail.
    redeliver: VecDeque<Position>,
    redelivery_counts: HashMap<Position, u32>,
    consumers: Vec<Arc<ServerConsumer>>,
    /// Round-robin cursor for shared dispatch.
    rr_index: usize,
    /// Durable ack properties, stored with the cursor.
    properties: HashMap<String, String>,
    /// Consumers already told the topic ended.
    end_notified: BTreeSet<u64>,
}

/// A named cursor plus its consumers and dispatcher.
pub struct Subscription {
    pub name: String,
    pub topic_name: TopicName,
    pub sub_type: SubType,
    store: Arc<dyn TopicStore>,
    terminated: Arc<AtomicBool>,
    inner: Mutex<SubInner>,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

enum DispatchStep {
    /// Deliver this entry to this consumer.
    Deliver {
        entry: StoredEntry,
        consumer: Arc<ServerConsumer>,
        redelivery_count: u32,
    },
    /// Nothing deliverable right now; wait for a wakeup.
    Idle,
    /// State changed under us; evaluate again.
    Again,
}

impl Subscription {
    pub fn new(
        name: String,
        topic_name: TopicName,
        sub_type: SubType,
        store: Arc<dyn TopicStore>,
        terminated: Arc<AtomicBool>,
        start_position: Position,
    ) -> Arc<Self> {
        let sub = Arc::new(Self {
            name,
            topic_name,
            sub_type,
            store,
            terminated,
            inner: Mutex::new(SubInner {
                start_position,
                read_position: start_position,
                mark_delete: None,
                individually_acked: BTreeSet::new(),
                in_flight: BTreeMap::new(),
                redeliver: VecDeque::new(),
                redelivery_counts: HashMap::new(),
                consumers: Vec::new(),
                rr_index: 0,
                properties: HashMap::new(),
                end_notified: BTreeSet::new(),
            }),
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(sub.clone().dispatch_loop());
        sub
    }

    /// Registers a consumer, enforcing the mode's multiplicity rules.
    pub fn add_consumer(&self, consumer: Arc<ServerConsumer>) -> Result<(), DriftError> {
        let mut inner = self.inner.lock();
        match self.sub_type {
            SubType::Exclusive if !inner.consumers.is_empty() => {
                return Err(DriftError::ConsumerBusy(format!(
                    "subscription '{}' is exclusive and already has a consumer",
                    self.name
                )));
            }
            SubType::Failover => {
                // Only the lowest-id consumer is active; the rest are hot
                // standby.
                consumer.active.store(inner.consumers.is_empty(), Ordering::SeqCst);
            }
            _ => {}
        }
        inner.consumers.push(consumer);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Removes a consumer; its unacknowledged deliveries go back to the
    /// redelivery queue.
    pub fn remove_consumer(&self, consumer_id: u64) {
        let mut inner = self.inner.lock();
        inner.consumers.retain(|c| c.id != consumer_id);
        inner.end_notified.remove(&consumer_id);
        if self.sub_type == SubType::Failover
            && !inner.consumers.iter().any(|c| c.active.load(Ordering::SeqCst))
            && let Some(next) = inner.consumers.iter().min_by_key(|c| c.id)
        {
            next.active.store(true, Ordering::SeqCst);
        }
        let orphaned: Vec<Position> = inner
            .in_flight
            .iter()
            .filter(|(_, owner)| **owner == consumer_id)
            .map(|(pos, _)| *pos)
            .collect();
        for pos in orphaned {
            inner.in_flight.remove(&pos);
            inner.redeliver.push_back(pos);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Applies an acknowledgement. Cumulative acks cover every position up
    /// to and including the given one; individual acks cover exactly the
    /// listed positions.
    pub fn ack(
        &self,
        ack_type: AckType,
        message_ids: &[MessageIdData],
        properties: &[(String, String)],
    ) -> Result<(), DriftError> {
        if ack_type == AckType::Cumulative && self.sub_type == SubType::Shared {
            return Err(DriftError::PreconditionFailed(
                "cumulative ack is not allowed on shared subscriptions".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        for (k, v) in properties {
            inner.properties.insert(k.clone(), v.clone());
        }
        match ack_type {
            AckType::Individual => {
                for id in message_ids {
                    let pos = id.position();
                    inner.in_flight.remove(&pos);
                    inner.redelivery_counts.remove(&pos);
                    inner.individually_acked.insert(pos);
                }
            }
            AckType::Cumulative => {
                let Some(up_to) = message_ids.iter().map(|id| id.position()).max() else {
                    return Ok(());
                };
                inner.in_flight.retain(|pos, _| *pos > up_to);
                inner.redelivery_counts.retain(|pos, _| *pos > up_to);
                inner.redeliver.retain(|pos| *pos > up_to);
                inner.individually_acked.retain(|pos| *pos > up_to);
                inner.mark_delete = Some(inner.mark_delete.map_or(up_to, |m| m.max(up_to)));
            }
        }
        Self::advance_mark_delete(&mut inner);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Moves the mark-delete point over contiguously acked positions.
    fn advance_mark_delete(inner: &mut SubInner) {
        while let Some(md) = inner.mark_delete {
            let next = (md.0, md.1 + 1);
            if inner.individually_acked.remove(&next) {
                inner.mark_delete = Some(next);
            } else {
                break;
            }
        }
        // With nothing mark-deleted yet, folding may only begin at the
        // subscription's start position; an out-of-order ack ahead of it
        // must not drag the cursor forward.
        if inner.mark_delete.is_none() && inner.individually_acked.remove(&inner.start_position) {
            inner.mark_delete = Some(inner.start_position);
            Self::advance_mark_delete(inner);
        }
    }

    /// Queues unacknowledged messages for redelivery. An empty id list means
    /// everything in flight for that consumer. Explicit id lists are only
    /// honored for shared subscriptions; other modes fall back to
    /// redelivering all.
    pub fn redeliver_unacknowledged(&self, consumer_id: u64, message_ids: &[MessageIdData]) {
        let mut inner = self.inner.lock();
        let positions: Vec<Position> = if message_ids.is_empty() || self.sub_type != SubType::Shared
        {
            inner
                .in_flight
                .iter()
                .filter(|(_, owner)| **owner == consumer_id)
                .map(|(pos, _)| *pos)
                .collect()
        } else {
            message_ids
                .iter()
                .map(|id| id.position())
                .filter(|pos| inner.in_flight.get(pos) == Some(&consumer_id))
                .collect()
        };
        for pos in positions {
            inner.in_flight.remove(&pos);
            inner.redeliver.push_back(pos);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Repositions the cursor, discarding all pending and in-flight state.
    pub fn seek(&self, position: Position) {
        let mut inner = self.inner.lock();
        inner.start_position = position;
        inner.read_position = position;
        inner.mark_delete = None;
        inner.individually_acked.clear();
        inner.in_flight.clear();
        inner.redeliver.clear();
        inner.redelivery_counts.clear();
        inner.end_notified.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Grants flow permits to a consumer.
    pub fn flow(&self, consumer_id: u64, permits: u32) {
        let inner = self.inner.lock();
        if let Some(consumer) = inner.consumers.iter().find(|c| c.id == consumer_id) {
            consumer.permits.fetch_add(i64::from(permits), Ordering::SeqCst);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// The number of delivered-but-unacked positions.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.inner.lock().properties.clone()
    }

    /// Where a re-created cursor resumes: right after the mark-delete
    /// point, so anything unacknowledged is redelivered.
    pub fn resume_position(&self) -> Position {
        let inner = self.inner.lock();
        inner
            .mark_delete
            .map_or(inner.start_position, |(l, e)| (l, e + 1))
    }

    pub fn notify_new_data(&self) {
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Sends `CloseConsumer` to every attached consumer, used when the
    /// owning bundle unloads so clients reconnect and re-lookup.
    pub fn disconnect_consumers(&self) {
        let inner = self.inner.lock();
        for consumer in &inner.consumers {
            let _ = consumer.frames.send(Frame::command(ClientCommand::CloseConsumer {
                consumer_id: consumer.id,
                request_id: 0,
            }));
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let tail = self.store.tail_notify();
        loop {
            // Register interest before evaluating so a wakeup between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            let tail_notified = tail.notified();
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match self.next_step().await {
                DispatchStep::Deliver {
                    entry,
                    consumer,
                    redelivery_count,
                } => self.deliver(entry, consumer, redelivery_count),
                DispatchStep::Again => continue,
                DispatchStep::Idle => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tail_notified => {}
                    }
                }
            }
        }
        debug!(
            "dispatcher for subscription '{}' on {} stopped",
            self.name, self.topic_name
        );
    }

    fn is_acked(inner: &SubInner, position: Position) -> bool {
        matches!(inner.mark_delete, Some(md) if position <= md)
            || inner.individually_acked.contains(&position)
    }

    async fn next_step(&self) -> DispatchStep {
        // Phase 1: pick a candidate position and consumer under the lock.
        let (position, from_redeliver, consumer) = {
            let mut inner = self.inner.lock();
            let Some(consumer) = Self::pick_consumer(&mut inner, self.sub_type) else {
                return DispatchStep::Idle;
            };
            match inner.redeliver.pop_front() {
                Some(pos) => {
                    // A position acked while it sat in the redelivery queue
                    // must not be delivered again.
                    if Self::is_acked(&inner, pos) {
                        return DispatchStep::Again;
                    }
                    (pos, true, consumer)
                }
                None => (inner.read_position, false, consumer),
            }
        };

        // Phase 2: fetch the entry without holding the lock. Only this
        // dispatcher mutates read_position, so the position stays valid.
        let entry = match self.store.read_from(position, 1).await {
            Ok(mut entries) if !entries.is_empty() => entries.remove(0),
            Ok(_) => {
                if from_redeliver {
                    // Truncated away underneath us; nothing left to deliver.
                    return DispatchStep::Again;
                }
                self.maybe_notify_end_of_topic();
                return DispatchStep::Idle;
            }
            Err(e) => {
                warn!(
                    "read failed on subscription '{}' of {}: {e}",
                    self.name, self.topic_name
                );
                return DispatchStep::Idle;
            }
        };
        if entry.position != position {
            if from_redeliver {
                // The requested entry was truncated away; drop it.
                return DispatchStep::Again;
            }
            // The store skipped over truncated entries; resync.
            let mut inner = self.inner.lock();
            inner.read_position = entry.position;
            return DispatchStep::Again;
        }

        // Phase 3: commit the delivery under the lock.
        let mut inner = self.inner.lock();
        if !from_redeliver {
            if inner.read_position != position {
                // A seek moved the cursor while we were reading.
                return DispatchStep::Again;
            }
            inner.read_position = (position.0, position.1 + 1);
        }
        let batch = entry.metadata.num_messages_in_batch.max(1);
        consumer
            .permits
            .fetch_sub(i64::from(batch), Ordering::SeqCst);
        inner.in_flight.insert(entry.position, consumer.id);
        let redelivery_count = if from_redeliver {
            let count = inner.redelivery_counts.entry(entry.position).or_insert(0);
            *count += 1;
            *count
        } else {
            0
        };
        DispatchStep::Deliver {
            entry,
            consumer,
            redelivery_count,
        }
    }

    fn pick_consumer(inner: &mut SubInner, sub_type: SubType) -> Option<Arc<ServerConsumer>> {
        match sub_type {
            SubType::Exclusive | SubType::Failover => inner
                .consumers
                .iter()
                .find(|c| c.active.load(Ordering::SeqCst) && c.permits.load(Ordering::SeqCst) > 0)
                .cloned(),
            SubType::Shared => {
                let n = inner.consumers.len();
                for offset in 0..n {
                    let idx = (inner.rr_index + offset) % n.max(1);
                    let candidate = &inner.consumers[idx];
                    if candidate.permits.load(Ordering::SeqCst) > 0 {
                        inner.rr_index = (idx + 1) % n;
                        return Some(candidate.clone());
                    }
                }
                None
            }
        }
    }

    fn deliver(&self, entry: StoredEntry, consumer: Arc<ServerConsumer>, redelivery_count: u32) {
        let partition = self
            .topic_name
            .partition_index()
            .map_or(-1, |i| i as i32);
        let message_id =
            MessageIdData::new(entry.position.0, entry.position.1).with_partition(partition);
        let frame = Frame::with_payload(
            ClientCommand::Message {
                consumer_id: consumer.id,
                message_id,
                redelivery_count,
            },
            entry.metadata,
            entry.payload,
        );
        if consumer.frames.send(frame).is_err() {
            // The connection is gone; requeue and drop the consumer.
            debug!(
                "consumer {} on '{}' disappeared mid-delivery",
                consumer.id, self.name
            );
            let mut inner = self.inner.lock();
            inner.in_flight.remove(&entry.position);
            inner.redeliver.push_back(entry.position);
            drop(inner);
            self.remove_consumer(consumer.id);
        }
    }

    fn maybe_notify_end_of_topic(&self) {
        if !self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.redeliver.is_empty() {
            return;
        }
        let pending: Vec<Arc<ServerConsumer>> = inner
            .consumers
            .iter()
            .filter(|c| !inner.end_notified.contains(&c.id))
            .cloned()
            .collect();
        for consumer in pending {
            let _ = consumer
                .frames
                .send(Frame::command(ClientCommand::ReachedEndOfTopic {
                    consumer_id: consumer.id,
                }));
            inner.end_notified.insert(consumer.id);
        }
    }
}
