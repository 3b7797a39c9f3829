// src/client/connection.rs

//! One multiplexed client connection to a broker.
//!
//! A `ClientCnx` owns the socket through a reader and a writer task, a
//! request/response correlation map keyed by `request_id`, and the event
//! channels of every producer and consumer registered on it. All writes
//! funnel through one channel so frames never interleave; all reads are
//! routed off the reader task without blocking it.

use crate::config::ClientConfig;
use crate::core::DriftError;
use crate::core::protocol::{
    ClientCommand, Frame, FrameCodec, MessageIdData, MessageMetadata, PROTOCOL_VERSION,
    ServerError,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Events delivered to a producer registered on a connection.
#[derive(Debug)]
pub enum ProducerEvent {
    Receipt {
        sequence_id: u64,
        message_id: MessageIdData,
    },
    SendFailed {
        sequence_id: u64,
        error: ServerError,
        message: String,
    },
    /// The broker closed the producer (unload, split); re-lookup and
    /// re-create.
    BrokerClosed,
    /// The connection died.
    Disconnected,
}

/// Events delivered to a consumer registered on a connection.
#[derive(Debug)]
pub enum ConsumerEvent {
    Message {
        message_id: MessageIdData,
        redelivery_count: u32,
        metadata: MessageMetadata,
        payload: Bytes,
    },
    BrokerClosed,
    ReachedEndOfTopic,
    Disconnected,
}

static CLIENT_VERSION: Lazy<String> =
    Lazy::new(|| format!("driftmq-{}", env!("CARGO_PKG_VERSION")));

/// Strips the `drift://` scheme off a broker service URL, yielding
/// `host:port`.
pub fn service_url_to_authority(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

/// A pooled, multiplexed connection to one logical broker.
pub struct ClientCnx {
    /// The broker identity this connection multiplexes for.
    pub logical_address: String,
    config: Arc<ClientConfig>,
    frames_tx: mpsc::UnboundedSender<Frame>,
    pending: DashMap<u64, oneshot::Sender<ClientCommand>>,
    producers: DashMap<u64, mpsc::UnboundedSender<ProducerEvent>>,
    consumers: DashMap<u64, mpsc::UnboundedSender<ConsumerEvent>>,
    lookup_permits: Semaphore,
    next_request_id: AtomicU64,
    next_entity_id: AtomicU64,
    closed: AtomicBool,
    close_notify: Arc<Notify>,
    /// `TooManyRequests` responses within the current one-minute window.
    rejects: Mutex<(Instant, u32)>,
}

impl ClientCnx {
    /// Establishes a connection: async DNS over every resolved address in
    /// order, TCP connect, then the CONNECT/CONNECTED handshake.
    pub async fn connect(
        logical_address: &str,
        physical_address: &str,
        config: Arc<ClientConfig>,
    ) -> Result<Arc<Self>, DriftError> {
        let authority = service_url_to_authority(physical_address).to_string();
        let mut last_err: Option<DriftError> = None;
        let mut stream = None;
        for addr in tokio::net::lookup_host(authority.as_str()).await? {
            match tokio::time::timeout(config.connection_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(socket)) => {
                    stream = Some(socket);
                    break;
                }
                Ok(Err(e)) => last_err = Some(e.into()),
                Err(_) => {
                    last_err = Some(DriftError::Timeout(format!("connecting to {addr}")))
                }
            }
        }
        let Some(stream) = stream else {
            return Err(last_err
                .unwrap_or_else(|| DriftError::Io(Arc::new(std::io::Error::other(format!(
                    "no addresses resolved for {authority}"
                ))))));
        };
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, FrameCodec);
        framed
            .send(Frame::command(ClientCommand::Connect {
                auth_method_name: None,
                auth_data: None,
                client_version: CLIENT_VERSION.clone(),
                protocol_version: PROTOCOL_VERSION,
                proxy_to_broker_address: (logical_address != physical_address)
                    .then(|| logical_address.to_string()),
            }))
            .await?;
        let handshake = tokio::time::timeout(config.connection_timeout, framed.next())
            .await
            .map_err(|_| DriftError::Timeout("waiting for CONNECTED".to_string()))?;
        match handshake {
            Some(Ok(Frame {
                command: ClientCommand::Connected { protocol_version },
                ..
            })) => {
                debug!("connected to {logical_address} (protocol {protocol_version})");
            }
            Some(Ok(frame)) => {
                return Err(DriftError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    frame.command.name()
                )));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(DriftError::Disconnected),
        }

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
        let cnx = Arc::new(Self {
            logical_address: logical_address.to_string(),
            lookup_permits: Semaphore::new(config.max_lookup_requests),
            config,
            frames_tx,
            pending: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            next_entity_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_notify: Arc::new(Notify::new()),
            rejects: Mutex::new((Instant::now(), 0)),
        });

        let (mut sink, mut stream) = framed.split();

        // Writer task: sole owner of the sink.
        let writer_close = cnx.close_notify.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_close.notified() => break,
                    frame = frames_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                if sink.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        // Reader task: routes every inbound frame to its waiter.
        let reader_cnx = cnx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cnx.close_notify.notified() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(frame)) => reader_cnx.route_frame(frame),
                            Some(Err(e)) => {
                                debug!("read error on {}: {e}", reader_cnx.logical_address);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            reader_cnx.mark_disconnected();
        });

        // Keep-alive pings while the connection is idle.
        let ping_cnx = cnx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(ping_cnx.config.keep_alive_interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = ping_cnx.close_notify.notified() => break,
                    _ = timer.tick() => {
                        if ping_cnx.is_closed()
                            || ping_cnx
                                .frames_tx
                                .send(Frame::command(ClientCommand::Ping))
                                .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        Ok(cnx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Allocates a producer/consumer id, monotone per connection.
    pub fn new_entity_id(&self) -> u64 {
        self.next_entity_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_producer(&self, id: u64, events: mpsc::UnboundedSender<ProducerEvent>) {
        self.producers.insert(id, events);
    }

    pub fn unregister_producer(&self, id: u64) {
        self.producers.remove(&id);
    }

    pub fn register_consumer(&self, id: u64, events: mpsc::UnboundedSender<ConsumerEvent>) {
        self.consumers.insert(id, events);
    }

    pub fn unregister_consumer(&self, id: u64) {
        self.consumers.remove(&id);
    }

    /// Fire-and-forget frame write (SEND, FLOW, ACK, redelivery).
    pub fn send_frame(&self, frame: Frame) -> Result<(), DriftError> {
        if self.is_closed() {
            return Err(DriftError::Disconnected);
        }
        self.frames_tx
            .send(frame)
            .map_err(|_| DriftError::Disconnected)
    }

    /// Sends a correlated request and awaits its response, bounded by the
    /// operation timeout. `Error` responses are mapped to typed failures.
    pub async fn request<F>(&self, build: F) -> Result<ClientCommand, DriftError>
    where
        F: FnOnce(u64) -> ClientCommand,
    {
        if self.is_closed() {
            return Err(DriftError::Disconnected);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        if self
            .frames_tx
            .send(Frame::command(build(request_id)))
            .is_err()
        {
            self.pending.remove(&request_id);
            return Err(DriftError::Disconnected);
        }
        let response = match tokio::time::timeout(self.config.operation_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(DriftError::Disconnected),
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(DriftError::Timeout(format!("request {request_id}")));
            }
        };
        match response {
            ClientCommand::Error { error, message, .. } => {
                self.note_server_error(error);
                Err(server_error_to_drift(error, &message))
            }
            other => Ok(other),
        }
    }

    /// A correlated lookup, bounded by the per-connection lookup semaphore:
    /// over the cap fails locally without any wire I/O.
    pub async fn lookup_request<F>(&self, build: F) -> Result<ClientCommand, DriftError>
    where
        F: FnOnce(u64) -> ClientCommand,
    {
        let Ok(_permit) = self.lookup_permits.try_acquire() else {
            return Err(DriftError::TooManyRequests);
        };
        self.request(build).await
    }

    /// Tracks backpressure-relevant server errors: a burst of
    /// `TooManyRequests` beyond the per-minute cap, or `ServiceNotReady`,
    /// closes the connection.
    fn note_server_error(&self, error: ServerError) {
        match error {
            ServerError::TooManyRequests => {
                let mut rejects = self.rejects.lock();
                if rejects.0.elapsed().as_secs() >= 60 {
                    *rejects = (Instant::now(), 0);
                }
                rejects.1 += 1;
                if rejects.1 >= self.config.max_rejected_requests_per_minute {
                    drop(rejects);
                    warn!(
                        "{}: too many rejected requests, closing connection",
                        self.logical_address
                    );
                    self.close();
                }
            }
            ServerError::ServiceNotReady => {
                info!(
                    "{}: broker not ready, closing connection",
                    self.logical_address
                );
                self.close();
            }
            _ => {}
        }
    }

    /// Closes the connection; every registered producer and consumer gets a
    /// disconnect event and enters its reconnect loop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
        // Dropping the senders fails every pending request with
        // `Disconnected`.
        self.pending.clear();
        for producer in self.producers.iter() {
            let _ = producer.value().send(ProducerEvent::Disconnected);
        }
        for consumer in self.consumers.iter() {
            let _ = consumer.value().send(ConsumerEvent::Disconnected);
        }
    }

    fn route_frame(&self, frame: Frame) {
        match frame.command {
            ClientCommand::Ping => {
                let _ = self.frames_tx.send(Frame::command(ClientCommand::Pong));
            }
            ClientCommand::Pong => {}
            ClientCommand::SendReceipt {
                producer_id,
                sequence_id,
                message_id,
            } => {
                if let Some(producer) = self.producers.get(&producer_id) {
                    let _ = producer.value().send(ProducerEvent::Receipt {
                        sequence_id,
                        message_id,
                    });
                }
            }
            ClientCommand::SendError {
                producer_id,
                sequence_id,
                error,
                message,
            } => {
                if let Some(producer) = self.producers.get(&producer_id) {
                    let _ = producer.value().send(ProducerEvent::SendFailed {
                        sequence_id,
                        error,
                        message,
                    });
                }
            }
            ClientCommand::CloseProducer { producer_id, .. } => {
                if let Some(producer) = self.producers.get(&producer_id) {
                    let _ = producer.value().send(ProducerEvent::BrokerClosed);
                }
            }
            ClientCommand::Message {
                consumer_id,
                message_id,
                redelivery_count,
            } => {
                let Some(payload) = frame.payload else {
                    debug!("MESSAGE without payload region for consumer {consumer_id}");
                    return;
                };
                if !payload.checksum_ok {
                    // A corrupted delivery is dropped; the ack timeout will
                    // redeliver it.
                    warn!("dropping corrupted MESSAGE for consumer {consumer_id}");
                    return;
                }
                if let Some(consumer) = self.consumers.get(&consumer_id) {
                    let _ = consumer.value().send(ConsumerEvent::Message {
                        message_id,
                        redelivery_count,
                        metadata: payload.metadata,
                        payload: payload.data,
                    });
                }
            }
            ClientCommand::CloseConsumer { consumer_id, .. } => {
                if let Some(consumer) = self.consumers.get(&consumer_id) {
                    let _ = consumer.value().send(ConsumerEvent::BrokerClosed);
                }
            }
            ClientCommand::ReachedEndOfTopic { consumer_id } => {
                if let Some(consumer) = self.consumers.get(&consumer_id) {
                    let _ = consumer.value().send(ConsumerEvent::ReachedEndOfTopic);
                }
            }
            other => {
                if let Some(request_id) = response_request_id(&other) {
                    if let Some((_, waiter)) = self.pending.remove(&request_id) {
                        let _ = waiter.send(other);
                    }
                } else {
                    debug!("unroutable frame {} dropped", other.name());
                }
            }
        }
    }
}

fn response_request_id(cmd: &ClientCommand) -> Option<u64> {
    match cmd {
        ClientCommand::LookupResponse { request_id, .. }
        | ClientCommand::PartitionedMetadataResponse { request_id, .. }
        | ClientCommand::ProducerSuccess { request_id, .. }
        | ClientCommand::Success { request_id }
        | ClientCommand::Error { request_id, .. }
        | ClientCommand::GetTopicsOfNamespaceResponse { request_id, .. } => Some(*request_id),
        _ => None,
    }
}

/// Maps a wire error code onto the typed error surface.
pub fn server_error_to_drift(error: ServerError, message: &str) -> DriftError {
    match error {
        ServerError::AuthenticationError | ServerError::AuthorizationError => {
            DriftError::Unauthorized(message.to_string())
        }
        ServerError::ConsumerBusy => DriftError::ConsumerBusy(message.to_string()),
        ServerError::TooManyRequests => DriftError::TooManyRequests,
        ServerError::ServiceNotReady => DriftError::ServiceNotReady(message.to_string()),
        ServerError::TopicTerminatedError => DriftError::TopicTerminated,
        ServerError::ChecksumError => DriftError::Checksum,
        ServerError::TopicNotFound => DriftError::NotFound(message.to_string()),
        ServerError::InvalidTopicName => DriftError::InvalidTopicName(message.to_string()),
        ServerError::MetadataError => DriftError::MetadataError(message.to_string()),
        ServerError::PersistenceError
        | ServerError::ProducerBlockedQuotaExceededError
        | ServerError::ProducerBlockedQuotaExceededException
        | ServerError::Unknown => DriftError::Internal(message.to_string()),
    }
}
