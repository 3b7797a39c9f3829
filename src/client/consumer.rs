// src/client/consumer.rs

//! The single-topic consumer: receiver queue, flow control, batch
//! expansion, acknowledgement, the unacked tracker, and reconnect.
//!
//! Incoming MESSAGE frames land on the connection's reader task and are
//! expanded (batches, decompression, decryption) on the consumer's event
//! task before entering the bounded receiver queue; `receive()` only ever
//! touches that queue, so slow application code cannot stall I/O.

use crate::client::backoff::Backoff;
use crate::client::connection::{ClientCnx, ConsumerEvent};
use crate::client::lookup_service::LookupService;
use crate::client::unacked::UnackedTracker;
use crate::config::ClientConfig;
use crate::core::DriftError;
use crate::core::protocol::codec::parse_batch;
use crate::core::protocol::compression::decompress;
use crate::core::protocol::{
    AckType, ClientCommand, Frame, InitialPosition, MessageIdData, MessageMetadata, SubType,
};
use crate::core::topic::TopicName;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

/// What to do with an encrypted message when no key reader is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoFailureAction {
    /// Drop and log; the message stays unacknowledged.
    #[default]
    Fail,
    /// Acknowledge silently without delivering.
    Discard,
    /// Deliver the encrypted bytes as-is.
    Consume,
}

/// Decrypts message payloads; supplied by the application.
pub trait CryptoKeyReader: Send + Sync {
    fn decrypt(&self, encryption_keys: &[String], payload: &[u8]) -> Result<Bytes, DriftError>;
}

/// Consumer tuning knobs.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub sub_type: SubType,
    pub initial_position: InitialPosition,
    pub receiver_queue_size: usize,
    pub ack_timeout: Option<Duration>,
    /// Client-side backpressure: flow permits stop above this many
    /// delivered-but-unacked messages.
    pub max_unacked_messages: usize,
    pub crypto_key_reader: Option<Arc<dyn CryptoKeyReader>>,
    pub crypto_failure_action: CryptoFailureAction,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            sub_type: SubType::Exclusive,
            initial_position: InitialPosition::Latest,
            receiver_queue_size: 1000,
            ack_timeout: None,
            max_unacked_messages: 50_000,
            crypto_key_reader: None,
            crypto_failure_action: CryptoFailureAction::default(),
        }
    }
}

/// A message as handed to the application.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: TopicName,
    pub message_id: MessageIdData,
    pub payload: Bytes,
    pub partition_key: Option<String>,
    pub properties: Vec<(String, String)>,
    pub publish_time: u64,
    pub producer_name: String,
    pub redelivery_count: u32,
}

/// State shared between the consumer handle, its event task, and timers.
struct Shared {
    topic: TopicName,
    subscription: String,
    sub_type: SubType,
    receiver_queue_size: usize,
    max_unacked: usize,
    unacked: UnackedTracker,
    /// Remaining unacked batch indexes per entry; the entry-level ack goes
    /// out when the set empties.
    batch_ackers: Mutex<HashMap<(u64, u64), BTreeSet<i32>>>,
    cnx: Mutex<Option<(Arc<ClientCnx>, u64)>>,
    /// Logical messages handed to the application since the last FLOW.
    permits_owed: AtomicUsize,
    /// Set when the unacked cap paused flow; permits accumulate until acks
    /// drain the tracker.
    flow_paused: AtomicBool,
    terminated: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Shared {
    fn send_frame(&self, frame: Frame) -> Result<(), DriftError> {
        let guard = self.cnx.lock();
        match guard.as_ref() {
            Some((cnx, _)) => cnx.send_frame(frame),
            None => Err(DriftError::Disconnected),
        }
    }

    fn consumer_id(&self) -> Option<u64> {
        self.cnx.lock().as_ref().map(|(_, id)| *id)
    }

    /// Sends accumulated flow permits unless the unacked cap has the
    /// consumer paused.
    fn maybe_flow(&self) {
        if self.unacked.len() >= self.max_unacked {
            self.flow_paused.store(true, Ordering::SeqCst);
            return;
        }
        let was_paused = self.flow_paused.swap(false, Ordering::SeqCst);
        let threshold = if was_paused {
            1
        } else {
            (self.receiver_queue_size / 2).max(1)
        };
        let owed = self.permits_owed.load(Ordering::SeqCst);
        if owed >= threshold
            && let Some(id) = self.consumer_id()
        {
            let permits = self.permits_owed.swap(0, Ordering::SeqCst) as u32;
            if permits > 0 {
                let _ = self.send_frame(Frame::command(ClientCommand::Flow {
                    consumer_id: id,
                    message_permits: permits,
                }));
            }
        }
    }

    fn request_redelivery(&self, ids: Vec<MessageIdData>) {
        let Some(id) = self.consumer_id() else {
            return;
        };
        // Explicit id lists are only meaningful for shared subscriptions;
        // other modes redeliver everything.
        let message_ids = if self.sub_type == SubType::Shared {
            ids
        } else {
            Vec::new()
        };
        let _ = self.send_frame(Frame::command(
            ClientCommand::RedeliverUnacknowledgedMessages {
                consumer_id: id,
                message_ids,
            },
        ));
    }
}

/// A consumer on exactly one (partition) topic.
pub struct Consumer {
    options: ConsumerOptions,
    config: Arc<ClientConfig>,
    lookup: Arc<LookupService>,
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<ConsumerMessage>>,
}

impl Consumer {
    /// Subscribes to the topic and starts the event pipeline.
    pub async fn subscribe(
        lookup: Arc<LookupService>,
        config: Arc<ClientConfig>,
        topic: TopicName,
        subscription: String,
        options: ConsumerOptions,
    ) -> Result<Arc<Self>, DriftError> {
        let queue_size = options.receiver_queue_size.max(1);
        let (incoming_tx, incoming_rx) = mpsc::channel(queue_size);
        let shared = Arc::new(Shared {
            topic,
            subscription,
            sub_type: options.sub_type,
            receiver_queue_size: queue_size,
            max_unacked: options.max_unacked_messages,
            unacked: UnackedTracker::new(options.ack_timeout),
            batch_ackers: Mutex::new(HashMap::new()),
            cnx: Mutex::new(None),
            permits_owed: AtomicUsize::new(0),
            flow_paused: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let consumer = Arc::new(Self {
            options,
            config,
            lookup,
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
        });
        let events = consumer.attach().await?;
        tokio::spawn(consumer.clone().event_loop(events, incoming_tx));
        consumer.clone().spawn_ack_timeout_sweep();
        Ok(consumer)
    }

    /// Resolves the owner, registers the consumer on a pooled connection,
    /// and completes SUBSCRIBE. The broker resumes the cursor at its
    /// persisted position.
    async fn attach(&self) -> Result<mpsc::UnboundedReceiver<ConsumerEvent>, DriftError> {
        let broker = self.lookup.resolve(&self.shared.topic).await?;
        let cnx = self
            .lookup
            .pool()
            .get_connection(&broker.logical_address, &broker.physical_address)
            .await?;
        let consumer_id = cnx.new_entity_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        cnx.register_consumer(consumer_id, events_tx);
        let response = cnx
            .request(|request_id| ClientCommand::Subscribe {
                topic: self.shared.topic.to_string(),
                subscription: self.shared.subscription.clone(),
                sub_type: self.shared.sub_type,
                consumer_id,
                request_id,
                initial_position: self.options.initial_position,
                start_message_id: None,
            })
            .await;
        if let Err(e) = response {
            cnx.unregister_consumer(consumer_id);
            return Err(e);
        }
        // Anything tracked from the previous session comes back through
        // redelivery; start clean.
        self.shared.unacked.clear();
        self.shared.batch_ackers.lock().clear();
        self.shared.permits_owed.store(0, Ordering::SeqCst);
        self.shared.flow_paused.store(false, Ordering::SeqCst);
        *self.shared.cnx.lock() = Some((cnx.clone(), consumer_id));
        // Prime the broker with a full queue of permits.
        cnx.send_frame(Frame::command(ClientCommand::Flow {
            consumer_id,
            message_permits: self.shared.receiver_queue_size as u32,
        }))?;
        info!(
            "consumer on {} subscribed as '{}' ({:?})",
            self.shared.topic, self.shared.subscription, self.shared.sub_type
        );
        Ok(events_rx)
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConsumerEvent>,
        incoming_tx: mpsc::Sender<ConsumerMessage>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.shared.close_notify.notified() => break,
                event = events.recv() => event,
            };
            match event {
                Some(ConsumerEvent::Message {
                    message_id,
                    redelivery_count,
                    metadata,
                    payload,
                }) => {
                    self.handle_message(message_id, redelivery_count, metadata, payload, &incoming_tx)
                        .await;
                }
                Some(ConsumerEvent::ReachedEndOfTopic) => {
                    info!("{} reached end of topic", self.shared.topic);
                    self.shared.terminated.store(true, Ordering::SeqCst);
                    // Dropping the sender ends the queue after it drains;
                    // receive() then surfaces the termination.
                    break;
                }
                Some(ConsumerEvent::BrokerClosed) | Some(ConsumerEvent::Disconnected) | None => {
                    match self.reconnect().await {
                        Some(new_events) => events = new_events,
                        None => break,
                    }
                }
            }
        }
    }

    /// Expands one MESSAGE frame into logical messages and queues them.
    async fn handle_message(
        &self,
        message_id: MessageIdData,
        redelivery_count: u32,
        metadata: MessageMetadata,
        payload: Bytes,
        incoming_tx: &mpsc::Sender<ConsumerMessage>,
    ) {
        // Decrypt before anything else; without a reader the failure action
        // decides the message's fate.
        let payload = if metadata.is_encrypted() {
            match &self.options.crypto_key_reader {
                Some(reader) => {
                    match reader.decrypt(&metadata.encryption_keys, &payload) {
                        Ok(decrypted) => decrypted,
                        Err(e) => {
                            warn!("decryption failed for {message_id}: {e}");
                            return;
                        }
                    }
                }
                None => match self.options.crypto_failure_action {
                    CryptoFailureAction::Fail => {
                        warn!(
                            "dropping encrypted message {message_id}: no crypto key reader"
                        );
                        return;
                    }
                    CryptoFailureAction::Discard => {
                        debug!("discarding encrypted message {message_id}");
                        let _ = self.send_ack_ids(AckType::Individual, vec![message_id], Vec::new());
                        return;
                    }
                    // Deliver the encrypted bytes as-is, skipping
                    // decompression (sizes refer to the plaintext).
                    CryptoFailureAction::Consume => {
                        let msg = ConsumerMessage {
                            topic: self.shared.topic.clone(),
                            message_id,
                            payload,
                            partition_key: metadata.partition_key.clone(),
                            properties: metadata.properties.clone(),
                            publish_time: metadata.publish_time,
                            producer_name: metadata.producer_name.clone(),
                            redelivery_count,
                        };
                        let _ = incoming_tx.send(msg).await;
                        return;
                    }
                },
            }
        } else {
            payload
        };

        let decompressed =
            match decompress(metadata.compression, &payload, metadata.uncompressed_size) {
                Ok(data) => data,
                Err(e) => {
                    warn!("dropping undecodable message {message_id}: {e}");
                    return;
                }
            };

        if metadata.is_batch() {
            let entries = match parse_batch(decompressed, metadata.num_messages_in_batch) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("dropping malformed batch {message_id}: {e}");
                    return;
                }
            };
            self.shared.batch_ackers.lock().insert(
                message_id.position(),
                (0..entries.len() as i32).collect(),
            );
            for (index, (single, data)) in entries.into_iter().enumerate() {
                let msg = ConsumerMessage {
                    topic: self.shared.topic.clone(),
                    message_id: message_id.with_batch_index(index as i32),
                    payload: data,
                    partition_key: single.partition_key,
                    properties: single.properties,
                    publish_time: metadata.publish_time,
                    producer_name: metadata.producer_name.clone(),
                    redelivery_count,
                };
                if incoming_tx.send(msg).await.is_err() {
                    return;
                }
            }
        } else {
            let msg = ConsumerMessage {
                topic: self.shared.topic.clone(),
                message_id,
                payload: decompressed,
                partition_key: metadata.partition_key,
                properties: metadata.properties,
                publish_time: metadata.publish_time,
                producer_name: metadata.producer_name,
                redelivery_count,
            };
            let _ = incoming_tx.send(msg).await;
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Option<mpsc::UnboundedReceiver<ConsumerEvent>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        *self.shared.cnx.lock() = None;
        let mut backoff = Backoff::new(self.config.operation_timeout * 2);
        loop {
            tokio::time::sleep(backoff.next_delay()).await;
            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.attach().await {
                Ok(events) => return Some(events),
                Err(e) => {
                    debug!("consumer reconnect to {} failed: {e}", self.shared.topic);
                }
            }
        }
    }

    fn spawn_ack_timeout_sweep(self: Arc<Self>) {
        let Some(timeout) = self.options.ack_timeout else {
            return;
        };
        let tick = (timeout / 4).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = self.shared.close_notify.notified() => break,
                    _ = timer.tick() => {
                        if self.shared.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let expired = self.shared.unacked.take_expired();
                        if !expired.is_empty() {
                            debug!(
                                "{} messages past ack timeout on {}, requesting redelivery",
                                expired.len(),
                                self.shared.topic
                            );
                            self.shared.request_redelivery(expired);
                            self.shared.maybe_flow();
                        }
                    }
                }
            }
        });
    }

    /// Blocks until a message is available. Returns `TopicTerminated` once
    /// the topic ended and the queue drained, `AlreadyClosed` after
    /// `close()`.
    pub async fn receive(&self) -> Result<ConsumerMessage, DriftError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(msg) => {
                drop(incoming);
                self.shared.unacked.add(msg.message_id);
                self.shared.permits_owed.fetch_add(1, Ordering::SeqCst);
                self.shared.maybe_flow();
                Ok(msg)
            }
            None => {
                if self.shared.terminated.load(Ordering::SeqCst) {
                    Err(DriftError::TopicTerminated)
                } else {
                    Err(DriftError::AlreadyClosed("consumer".to_string()))
                }
            }
        }
    }

    /// `receive` bounded by a deadline.
    pub async fn receive_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ConsumerMessage, DriftError> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| DriftError::Timeout("receive".to_string()))?
    }

    fn send_ack_ids(
        &self,
        ack_type: AckType,
        message_ids: Vec<MessageIdData>,
        properties: Vec<(String, String)>,
    ) -> Result<(), DriftError> {
        let Some(id) = self.shared.consumer_id() else {
            return Err(DriftError::Disconnected);
        };
        self.shared.send_frame(Frame::command(ClientCommand::Ack {
            consumer_id: id,
            ack_type,
            message_ids,
            properties,
        }))
    }

    /// Individually acknowledges one message. Batch sub-messages are
    /// tracked locally; the entry-level ack goes out once every sub-message
    /// of the entry is acked.
    pub fn ack(&self, msg: &ConsumerMessage) -> Result<(), DriftError> {
        self.ack_with_properties(msg, Vec::new())
    }

    /// Individual ack carrying durable cursor properties.
    pub fn ack_with_properties(
        &self,
        msg: &ConsumerMessage,
        properties: Vec<(String, String)>,
    ) -> Result<(), DriftError> {
        self.shared.unacked.remove(&msg.message_id);
        let position = msg.message_id.position();
        if msg.message_id.batch_index >= 0 {
            let mut ackers = self.shared.batch_ackers.lock();
            if let Some(remaining) = ackers.get_mut(&position) {
                remaining.remove(&msg.message_id.batch_index);
                if !remaining.is_empty() {
                    self.shared.maybe_flow();
                    return Ok(());
                }
                ackers.remove(&position);
            }
        }
        let entry_id = MessageIdData::new(position.0, position.1)
            .with_partition(msg.message_id.partition);
        let result = self.send_ack_ids(AckType::Individual, vec![entry_id], properties);
        self.shared.maybe_flow();
        result
    }

    /// Cumulatively acknowledges everything up to and including the
    /// message. Only valid for exclusive-like subscription modes.
    pub fn ack_cumulative(&self, msg: &ConsumerMessage) -> Result<(), DriftError> {
        if self.shared.sub_type == SubType::Shared {
            return Err(DriftError::PreconditionFailed(
                "cumulative ack is not allowed on shared subscriptions".to_string(),
            ));
        }
        let position = msg.message_id.position();
        self.shared.unacked.remove_up_to(position);
        self.shared
            .batch_ackers
            .lock()
            .retain(|entry, _| *entry > position);
        let entry_id = MessageIdData::new(position.0, position.1)
            .with_partition(msg.message_id.partition);
        let result = self.send_ack_ids(AckType::Cumulative, vec![entry_id], Vec::new());
        self.shared.maybe_flow();
        result
    }

    /// Requests redelivery of everything unacknowledged.
    pub fn redeliver_unacknowledged(&self) {
        self.shared.unacked.clear();
        self.shared.request_redelivery(Vec::new());
    }

    /// Requests redelivery of specific message ids. Only shared
    /// subscriptions honor the id list; other modes redeliver everything.
    pub fn redeliver_messages(&self, ids: Vec<MessageIdData>) {
        for id in &ids {
            self.shared.unacked.remove(id);
        }
        let entry_ids = ids
            .into_iter()
            .map(|id| MessageIdData::new(id.ledger_id, id.entry_id).with_partition(id.partition))
            .collect();
        self.shared.request_redelivery(entry_ids);
    }

    /// Repositions the subscription cursor.
    pub async fn seek(&self, message_id: MessageIdData) -> Result<(), DriftError> {
        let (cnx, consumer_id) = self
            .shared
            .cnx
            .lock()
            .clone()
            .ok_or(DriftError::Disconnected)?;
        cnx.request(|request_id| ClientCommand::Seek {
            consumer_id,
            request_id,
            message_id,
        })
        .await?;
        self.shared.unacked.clear();
        self.shared.batch_ackers.lock().clear();
        Ok(())
    }

    /// Drops the subscription cursor on the broker, then closes.
    pub async fn unsubscribe(&self) -> Result<(), DriftError> {
        let (cnx, consumer_id) = self
            .shared
            .cnx
            .lock()
            .clone()
            .ok_or(DriftError::Disconnected)?;
        cnx.request(|request_id| ClientCommand::Unsubscribe {
            consumer_id,
            request_id,
        })
        .await?;
        self.close().await
    }

    /// Detaches from the broker; pending `receive()` calls fail once the
    /// queue drains.
    pub async fn close(&self) -> Result<(), DriftError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.close_notify.notify_waiters();
        let cnx = self.shared.cnx.lock().take();
        if let Some((cnx, consumer_id)) = cnx {
            let _ = cnx
                .request(|request_id| ClientCommand::CloseConsumer {
                    consumer_id,
                    request_id,
                })
                .await;
            cnx.unregister_consumer(consumer_id);
        }
        Ok(())
    }

    pub fn topic(&self) -> &TopicName {
        &self.shared.topic
    }

    pub fn subscription(&self) -> &str {
        &self.shared.subscription
    }

    /// Delivered-but-unacked count, the client-side backpressure gauge.
    pub fn unacked_count(&self) -> usize {
        self.shared.unacked.len()
    }
}
