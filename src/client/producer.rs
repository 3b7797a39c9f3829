// src/client/producer.rs

//! Producers: single-partition send pipeline with sequence ids, batching,
//! reconnect-with-dedup, and the partitioned producer with its message
//! router.
//!
//! Every message gets a monotone sequence id under the producer lock, so
//! send order equals sequence order equals broker-observed order. Pending
//! sends survive reconnects: they are retransmitted with their original
//! sequence ids and the broker suppresses whatever was already persisted.

use crate::client::backoff::Backoff;
use crate::client::connection::{ClientCnx, ProducerEvent};
use crate::client::lookup_service::LookupService;
use crate::config::ClientConfig;
use crate::core::DriftError;
use crate::core::bundle;
use crate::core::protocol::codec::serialize_batch;
use crate::core::protocol::compression::compress;
use crate::core::protocol::{
    ClientCommand, CompressionType, Frame, MAX_FRAME_SIZE, MessageIdData, MessageMetadata,
    ServerError, SingleMessageMetadata,
};
use crate::core::topic::TopicName;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

/// The largest message (or batch) payload accepted after the envelope is
/// accounted for.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE - 1024;

/// Producer tuning knobs.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Stable name for deduplication across reconnects; assigned by the
    /// broker when absent.
    pub producer_name: Option<String>,
    pub compression: CompressionType,
    pub batching_enabled: bool,
    pub batching_max_messages: usize,
    pub batching_max_publish_delay: Duration,
    /// Cap on sends awaiting a receipt.
    pub max_pending_messages: usize,
    /// Whether a full pending queue blocks the caller instead of failing.
    pub block_if_full: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            producer_name: None,
            compression: CompressionType::None,
            batching_enabled: false,
            batching_max_messages: 1000,
            batching_max_publish_delay: Duration::from_millis(10),
            max_pending_messages: 1000,
            block_if_full: false,
        }
    }
}

/// One message to publish.
#[derive(Debug, Clone, Default)]
pub struct ProducerMessage {
    pub payload: Bytes,
    pub key: Option<String>,
    pub properties: Vec<(String, String)>,
}

impl ProducerMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Connected,
    Reconnecting,
    Terminated,
    Closed,
}

type SendCompleter = oneshot::Sender<Result<MessageIdData, DriftError>>;

struct PendingSend {
    sequence_id: u64,
    frame: Frame,
    /// `(batch_index, completer)` per logical message in the frame.
    completers: Vec<(i32, SendCompleter)>,
}

struct BatchItem {
    single: SingleMessageMetadata,
    payload: Bytes,
    completer: SendCompleter,
}

struct Inner {
    state: ProducerState,
    cnx: Option<Arc<ClientCnx>>,
    producer_id: u64,
    producer_name: Option<String>,
    next_sequence: u64,
    pending: VecDeque<PendingSend>,
    batch: Vec<BatchItem>,
    batch_bytes: usize,
    /// Set when the open batch was started; the flush timer checks it.
    batch_epoch: u64,
}

/// A producer bound to exactly one (partition) topic.
pub struct PartitionProducer {
    topic: TopicName,
    options: ProducerOptions,
    config: Arc<ClientConfig>,
    lookup: Arc<LookupService>,
    inner: Mutex<Inner>,
    pending_permits: Arc<Semaphore>,
    /// Back-reference for the batch flush timer.
    self_ref: std::sync::Weak<PartitionProducer>,
}

impl PartitionProducer {
    /// Creates the producer and completes the PRODUCER handshake with the
    /// owning broker.
    pub async fn create(
        lookup: Arc<LookupService>,
        config: Arc<ClientConfig>,
        topic: TopicName,
        options: ProducerOptions,
    ) -> Result<Arc<Self>, DriftError> {
        let producer = Arc::new_cyclic(|weak| Self {
            pending_permits: Arc::new(Semaphore::new(options.max_pending_messages)),
            inner: Mutex::new(Inner {
                state: ProducerState::Reconnecting,
                cnx: None,
                producer_id: 0,
                producer_name: options.producer_name.clone(),
                next_sequence: 0,
                pending: VecDeque::new(),
                batch: Vec::new(),
                batch_bytes: 0,
                batch_epoch: 0,
            }),
            topic,
            options,
            config,
            lookup,
            self_ref: weak.clone(),
        });
        let events = producer.attach().await?;
        tokio::spawn(producer.clone().event_loop(events));
        Ok(producer)
    }

    /// Resolves the topic, obtains a pooled connection, and registers the
    /// producer on it. Returns the event stream of the new registration.
    async fn attach(&self) -> Result<mpsc::UnboundedReceiver<ProducerEvent>, DriftError> {
        let broker = self.lookup.resolve(&self.topic).await?;
        let cnx = self
            .lookup
            .pool()
            .get_connection(&broker.logical_address, &broker.physical_address)
            .await?;
        let producer_id = cnx.new_entity_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        cnx.register_producer(producer_id, events_tx);

        let requested_name = self.inner.lock().await.producer_name.clone();
        let response = cnx
            .request(|request_id| ClientCommand::Producer {
                topic: self.topic.to_string(),
                producer_id,
                request_id,
                producer_name: requested_name,
                encrypted: false,
            })
            .await;
        let (producer_name, last_sequence_id) = match response {
            Ok(ClientCommand::ProducerSuccess {
                producer_name,
                last_sequence_id,
                ..
            }) => (producer_name, last_sequence_id),
            Ok(_) => {
                cnx.unregister_producer(producer_id);
                return Err(DriftError::Protocol(
                    "unexpected response to PRODUCER".to_string(),
                ));
            }
            Err(e) => {
                cnx.unregister_producer(producer_id);
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        inner.producer_id = producer_id;
        inner.producer_name = Some(producer_name.clone());
        inner.cnx = Some(cnx.clone());
        inner.state = ProducerState::Connected;
        if inner.next_sequence == 0 && last_sequence_id >= 0 {
            // Resuming a stable name: continue the sequence where the
            // broker left off.
            inner.next_sequence = (last_sequence_id + 1) as u64;
        }
        // Retransmit everything unacknowledged; the broker suppresses
        // sequence ids it already persisted.
        for pending in inner.pending.iter_mut() {
            if let ClientCommand::Send { producer_id: id, .. } = &mut pending.frame.command {
                *id = producer_id;
            }
            let _ = cnx.send_frame(pending.frame.clone());
        }
        info!(
            "producer '{producer_name}' attached to {} (last seq {last_sequence_id})",
            self.topic
        );
        Ok(events_rx)
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ProducerEvent>) {
        loop {
            match events.recv().await {
                Some(ProducerEvent::Receipt {
                    sequence_id,
                    message_id,
                }) => self.handle_receipt(sequence_id, message_id).await,
                Some(ProducerEvent::SendFailed {
                    sequence_id,
                    error,
                    message,
                }) => {
                    if self.handle_send_failed(sequence_id, error, message).await {
                        break;
                    }
                }
                Some(ProducerEvent::BrokerClosed) | Some(ProducerEvent::Disconnected) | None => {
                    match self.reconnect().await {
                        Some(new_events) => events = new_events,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_receipt(&self, sequence_id: u64, message_id: MessageIdData) {
        let partition = self.partition_index();
        let mut inner = self.inner.lock().await;
        while let Some(front) = inner.pending.front() {
            if front.sequence_id > sequence_id {
                break;
            }
            let entry = inner.pending.pop_front().unwrap();
            self.pending_permits.add_permits(entry.completers.len());
            for (batch_index, completer) in entry.completers {
                let id = MessageIdData {
                    ledger_id: message_id.ledger_id,
                    entry_id: message_id.entry_id,
                    partition,
                    batch_index,
                };
                let _ = completer.send(Ok(id));
            }
        }
    }

    /// Returns true when the failure is terminal for the producer.
    async fn handle_send_failed(
        &self,
        sequence_id: u64,
        error: ServerError,
        message: String,
    ) -> bool {
        match error {
            ServerError::ChecksumError => {
                // Retransmit from the failed sequence; everything before it
                // was accepted.
                let inner = self.inner.lock().await;
                if let Some(cnx) = &inner.cnx {
                    for pending in inner.pending.iter() {
                        if pending.sequence_id >= sequence_id {
                            let _ = cnx.send_frame(pending.frame.clone());
                        }
                    }
                }
                debug!(
                    "checksum failure at seq {sequence_id} on {}, retransmitted tail",
                    self.topic
                );
                false
            }
            ServerError::TopicTerminatedError => {
                let mut inner = self.inner.lock().await;
                inner.state = ProducerState::Terminated;
                Self::fail_all_pending(&mut inner, &self.pending_permits, DriftError::TopicTerminated);
                warn!("{} terminated; producer is now unusable", self.topic);
                true
            }
            ServerError::ServiceNotReady => {
                // The bundle is mid-handover. Keep the send pending; the
                // close/reconnect cycle retransmits it against the next
                // owner.
                debug!(
                    "seq {sequence_id} on {} hit a broker in transition: {message}",
                    self.topic
                );
                false
            }
            _ => {
                let mut inner = self.inner.lock().await;
                if let Some(idx) = inner
                    .pending
                    .iter()
                    .position(|p| p.sequence_id == sequence_id)
                {
                    let entry = inner.pending.remove(idx).unwrap();
                    self.pending_permits.add_permits(entry.completers.len());
                    for (_, completer) in entry.completers {
                        let _ = completer
                            .send(Err(DriftError::Internal(message.clone())));
                    }
                }
                false
            }
        }
    }

    fn fail_all_pending(inner: &mut Inner, permits: &Semaphore, error: DriftError) {
        for entry in inner.pending.drain(..) {
            permits.add_permits(entry.completers.len());
            for (_, completer) in entry.completers {
                let _ = completer.send(Err(error.clone()));
            }
        }
        for item in inner.batch.drain(..) {
            permits.add_permits(1);
            let _ = item.completer.send(Err(error.clone()));
        }
        inner.batch_bytes = 0;
    }

    /// The reconnect loop: backoff with full jitter, bounded only by the
    /// producer being closed. Returns the new event stream, or `None` when
    /// the producer reached a terminal state.
    async fn reconnect(self: &Arc<Self>) -> Option<mpsc::UnboundedReceiver<ProducerEvent>> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ProducerState::Closed | ProducerState::Terminated => return None,
                _ => inner.state = ProducerState::Reconnecting,
            }
            inner.cnx = None;
        }
        let mut backoff = Backoff::new(self.config.operation_timeout * 2);
        loop {
            tokio::time::sleep(backoff.next_delay()).await;
            if matches!(
                self.inner.lock().await.state,
                ProducerState::Closed | ProducerState::Terminated
            ) {
                return None;
            }
            match self.attach().await {
                Ok(events) => return Some(events),
                Err(e) => {
                    debug!("producer reconnect to {} failed: {e}", self.topic);
                }
            }
        }
    }

    fn partition_index(&self) -> i32 {
        self.topic.partition_index().map_or(-1, |i| i as i32)
    }

    fn publish_time_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Sends one message and waits for its receipt.
    pub async fn send(&self, message: ProducerMessage) -> Result<MessageIdData, DriftError> {
        let receipt = self.send_async(message).await?;
        receipt.await.map_err(|_| DriftError::Disconnected)?
    }

    /// Enqueues one message, returning the future receipt. Blocks on a full
    /// pending queue only when `block_if_full` is set; otherwise fails
    /// immediately.
    pub async fn send_async(
        &self,
        message: ProducerMessage,
    ) -> Result<oneshot::Receiver<Result<MessageIdData, DriftError>>, DriftError> {
        {
            let inner = self.inner.lock().await;
            match inner.state {
                ProducerState::Terminated => return Err(DriftError::TopicTerminated),
                ProducerState::Closed => {
                    return Err(DriftError::AlreadyClosed("producer".to_string()));
                }
                _ => {}
            }
        }

        // Size limit: batching checks the raw payload before compression
        // (compression cannot rescue an oversize batch); the non-batched
        // path checks after compression.
        let prepared = if self.options.batching_enabled {
            if message.payload.len() > MAX_MESSAGE_SIZE {
                return Err(DriftError::InvalidMessage(format!(
                    "payload of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                    message.payload.len()
                )));
            }
            None
        } else {
            let compressed = compress(self.options.compression, &message.payload)?;
            if compressed.len() > MAX_MESSAGE_SIZE {
                return Err(DriftError::InvalidMessage(format!(
                    "compressed payload of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                    compressed.len()
                )));
            }
            Some(compressed)
        };

        let permit = if self.options.block_if_full {
            self.pending_permits
                .acquire()
                .await
                .map_err(|_| DriftError::AlreadyClosed("producer".to_string()))?
        } else {
            self.pending_permits
                .try_acquire()
                .map_err(|_| DriftError::ProducerQueueIsFull)?
        };
        // Ownership of the permit moves to the pending entry; it is
        // re-added when the send resolves.
        permit.forget();

        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        match prepared {
            Some(compressed) => {
                let uncompressed_size = message.payload.len() as u32;
                self.enqueue_single(&mut inner, message, compressed, uncompressed_size, tx);
            }
            None => self.enqueue_batched(&mut inner, message, tx),
        }
        Ok(rx)
    }

    fn enqueue_single(
        &self,
        inner: &mut Inner,
        message: ProducerMessage,
        compressed: Bytes,
        uncompressed_size: u32,
        completer: SendCompleter,
    ) {
        let sequence_id = inner.next_sequence;
        inner.next_sequence += 1;
        let metadata = MessageMetadata {
            producer_name: inner.producer_name.clone().unwrap_or_default(),
            sequence_id,
            publish_time: Self::publish_time_now(),
            partition_key: message.key,
            properties: message.properties,
            compression: self.options.compression,
            uncompressed_size,
            num_messages_in_batch: 0,
            encryption_keys: Vec::new(),
        };
        let frame = Frame::with_payload(
            ClientCommand::Send {
                producer_id: inner.producer_id,
                sequence_id,
                num_messages: 1,
            },
            metadata,
            compressed,
        );
        inner.pending.push_back(PendingSend {
            sequence_id,
            frame: frame.clone(),
            completers: vec![(-1, completer)],
        });
        if inner.state == ProducerState::Connected
            && let Some(cnx) = &inner.cnx
        {
            let _ = cnx.send_frame(frame);
        }
    }

    fn enqueue_batched(
        &self,
        inner: &mut Inner,
        message: ProducerMessage,
        completer: SendCompleter,
    ) {
        // Flush first if this message would push the batch over the frame
        // limit.
        if inner.batch_bytes + message.payload.len() > MAX_MESSAGE_SIZE
            && !inner.batch.is_empty()
        {
            self.flush_batch(inner);
        }
        inner.batch_bytes += message.payload.len();
        inner.batch.push(BatchItem {
            single: SingleMessageMetadata {
                partition_key: message.key,
                properties: message.properties,
            },
            payload: message.payload,
            completer,
        });
        if inner.batch.len() >= self.options.batching_max_messages {
            self.flush_batch(inner);
        } else if inner.batch.len() == 1 {
            // First message of a fresh batch arms the delay timer.
            inner.batch_epoch += 1;
            let epoch = inner.batch_epoch;
            let weak = self.self_ref.clone();
            let delay = self.options.batching_max_publish_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(producer) = weak.upgrade() else {
                    return;
                };
                let mut inner = producer.inner.lock().await;
                if inner.batch_epoch == epoch && !inner.batch.is_empty() {
                    producer.flush_batch(&mut inner);
                }
            });
        }
    }

    fn flush_batch(&self, inner: &mut Inner) {
        if inner.batch.is_empty() {
            return;
        }
        let items = std::mem::take(&mut inner.batch);
        inner.batch_bytes = 0;
        inner.batch_epoch += 1;

        let entries: Vec<(SingleMessageMetadata, Bytes)> = items
            .iter()
            .map(|item| (item.single.clone(), item.payload.clone()))
            .collect();
        let serialized = match serialize_batch(&entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                for item in items {
                    self.pending_permits.add_permits(1);
                    let _ = item.completer.send(Err(e.clone()));
                }
                return;
            }
        };
        let uncompressed_size = serialized.len() as u32;
        let compressed = match compress(self.options.compression, &serialized) {
            Ok(bytes) => bytes,
            Err(e) => {
                for item in items {
                    self.pending_permits.add_permits(1);
                    let _ = item.completer.send(Err(e.clone()));
                }
                return;
            }
        };

        let sequence_id = inner.next_sequence;
        inner.next_sequence += 1;
        let metadata = MessageMetadata {
            producer_name: inner.producer_name.clone().unwrap_or_default(),
            sequence_id,
            publish_time: Self::publish_time_now(),
            partition_key: None,
            properties: Vec::new(),
            compression: self.options.compression,
            uncompressed_size,
            num_messages_in_batch: items.len() as u32,
            encryption_keys: Vec::new(),
        };
        let frame = Frame::with_payload(
            ClientCommand::Send {
                producer_id: inner.producer_id,
                sequence_id,
                num_messages: items.len() as u32,
            },
            metadata,
            compressed,
        );
        let completers = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (i as i32, item.completer))
            .collect();
        inner.pending.push_back(PendingSend {
            sequence_id,
            frame: frame.clone(),
            completers,
        });
        if inner.state == ProducerState::Connected
            && let Some(cnx) = &inner.cnx
        {
            let _ = cnx.send_frame(frame);
        }
    }

    /// Flushes any open batch immediately.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        self.flush_batch(&mut inner);
    }

    /// Closes the producer: flushes, tells the broker, and fails anything
    /// still pending.
    pub async fn close(&self) -> Result<(), DriftError> {
        let mut inner = self.inner.lock().await;
        self.flush_batch(&mut inner);
        if inner.state == ProducerState::Closed {
            return Ok(());
        }
        inner.state = ProducerState::Closed;
        let cnx = inner.cnx.take();
        let producer_id = inner.producer_id;
        drop(inner);
        if let Some(cnx) = cnx {
            let _ = cnx
                .request(|request_id| ClientCommand::CloseProducer {
                    producer_id,
                    request_id,
                })
                .await;
            cnx.unregister_producer(producer_id);
        }
        let mut inner = self.inner.lock().await;
        Self::fail_all_pending(
            &mut inner,
            &self.pending_permits,
            DriftError::AlreadyClosed("producer".to_string()),
        );
        Ok(())
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }
}

/// Routing state of a partitioned producer.
struct RouterState {
    current: usize,
    last_switch: Instant,
}

/// The public producer: either a single topic or a partitioned fan-out with
/// a message router.
pub struct Producer {
    partitions: Vec<Arc<PartitionProducer>>,
    router: parking_lot::Mutex<RouterState>,
    batching_delay: Option<Duration>,
}

impl Producer {
    /// Creates a producer for a base topic: single when the topic is not
    /// partitioned, otherwise one sub-producer per partition.
    pub async fn create(
        lookup: Arc<LookupService>,
        config: Arc<ClientConfig>,
        topic: TopicName,
        options: ProducerOptions,
    ) -> Result<Self, DriftError> {
        let partition_count = lookup.partitioned_metadata(&topic).await?;
        let mut partitions = Vec::new();
        if partition_count == 0 {
            partitions.push(
                PartitionProducer::create(lookup, config, topic, options.clone()).await?,
            );
        } else {
            for i in 0..partition_count {
                partitions.push(
                    PartitionProducer::create(
                        lookup.clone(),
                        config.clone(),
                        topic.partition(i),
                        options.clone(),
                    )
                    .await?,
                );
            }
        }
        Ok(Self {
            partitions,
            router: parking_lot::Mutex::new(RouterState {
                current: 0,
                last_switch: Instant::now(),
            }),
            batching_delay: options
                .batching_enabled
                .then_some(options.batching_max_publish_delay),
        })
    }

    /// Picks the partition for a message: keyed messages hash to a stable
    /// partition; unkeyed ones round-robin, sticking to one partition per
    /// batching window to preserve batch locality.
    fn route(&self, message: &ProducerMessage) -> usize {
        let n = self.partitions.len();
        if n == 1 {
            return 0;
        }
        if let Some(key) = &message.key {
            return (bundle::hash_of_key(key) as usize) % n;
        }
        let mut router = self.router.lock();
        match self.batching_delay {
            Some(delay) => {
                if router.last_switch.elapsed() >= delay {
                    router.current = (router.current + 1) % n;
                    router.last_switch = Instant::now();
                }
            }
            None => {
                router.current = (router.current + 1) % n;
            }
        }
        router.current
    }

    pub async fn send(&self, message: ProducerMessage) -> Result<MessageIdData, DriftError> {
        let partition = self.route(&message);
        self.partitions[partition].send(message).await
    }

    pub async fn send_async(
        &self,
        message: ProducerMessage,
    ) -> Result<oneshot::Receiver<Result<MessageIdData, DriftError>>, DriftError> {
        let partition = self.route(&message);
        self.partitions[partition].send_async(message).await
    }

    pub async fn flush(&self) {
        for partition in &self.partitions {
            partition.flush().await;
        }
    }

    pub async fn close(&self) -> Result<(), DriftError> {
        for partition in &self.partitions {
            partition.close().await?;
        }
        Ok(())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
