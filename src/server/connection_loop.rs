// src/server/connection_loop.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of one
//! client connection on the broker.
//!
//! The connection starts in handshake (only CONNECT is legal), then serves
//! commands until the peer disconnects, the broker shuts down, or the
//! keep-alive window lapses. Frames written back to the peer funnel through
//! one writer task so dispatchers and command handlers never interleave
//! partial writes.

use crate::core::DriftError;
use crate::core::broker::BrokerState;
use crate::core::broker::subscription::{ServerConsumer, Subscription};
use crate::core::bundle;
use crate::core::lookup::LookupAnswer;
use crate::core::metadata::policies::{AuthAction, NamespacePolicies};
use crate::core::ownership::BundleState;
use crate::core::protocol::{
    ClientCommand, Frame, FrameCodec, InitialPosition, LookupType, MessageIdData, MessagePayload,
    PROTOCOL_VERSION, ServerError, SubType,
};
use crate::core::topic::{NamespaceName, TopicName};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

static PRODUCER_NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-connection registration of a consumer.
struct ConsumerRegistration {
    subscription: Arc<Subscription>,
    topic: TopicName,
}

/// Per-connection registration of a producer.
struct ProducerRegistration {
    topic: TopicName,
    producer_name: String,
}

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler {
    state: Arc<BrokerState>,
    addr: SocketAddr,
    connection_id: u64,
    frames_tx: mpsc::UnboundedSender<Frame>,
    producers: HashMap<u64, ProducerRegistration>,
    consumers: HashMap<u64, ConsumerRegistration>,
    shutdown_rx: broadcast::Receiver<()>,
    handshaken: bool,
    /// The authenticated role of the connection, set by the handshake and
    /// consulted by every authorization decision.
    role: String,
}

impl ConnectionHandler {
    /// Runs a connection to completion. Consumes the socket.
    pub async fn run(state: Arc<BrokerState>, socket: TcpStream, addr: SocketAddr) {
        let connection_id = state.next_connection_id();
        let framed = Framed::new(socket, FrameCodec);
        let (mut sink, mut stream) = framed.split();

        // Single writer: dispatchers and command handlers send frames
        // through this channel; ordering towards the peer is channel order.
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let mut handler = Self {
            shutdown_rx: state.shutdown_tx.subscribe(),
            state,
            addr,
            connection_id,
            frames_tx,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            handshaken: false,
            role: String::new(),
        };
        debug!("connection {connection_id} from {addr} open");
        handler.state.load.update(|r| r.connections += 1);

        let mut ping_timer = tokio::time::interval(handler.state.dynamic.keep_alive_interval());
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval fires immediately once; swallow that tick.
        ping_timer.tick().await;
        let mut idle_intervals = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = handler.shutdown_rx.recv() => {
                    info!("connection {connection_id} closing: broker shutdown");
                    break;
                }
                _ = ping_timer.tick() => {
                    idle_intervals += 1;
                    if idle_intervals >= 3 {
                        warn!("connection {connection_id} closing: keep-alive window lapsed");
                        break;
                    }
                    if handler.handshaken {
                        let _ = handler.frames_tx.send(Frame::command(ClientCommand::Ping));
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(frame)) => {
                            idle_intervals = 0;
                            if let Err(e) = handler.process_frame(frame).await {
                                warn!("connection {connection_id} closing on error: {e}");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("connection {connection_id} read error: {e}");
                            break;
                        }
                        None => {
                            debug!("connection {connection_id} closed by peer");
                            break;
                        }
                    }
                }
            }
        }

        handler.cleanup();
        handler
            .state
            .load
            .update(|r| r.connections = r.connections.saturating_sub(1));
        writer.abort();
    }

    /// Deregisters everything this connection created; unacked deliveries
    /// go back to their subscriptions for redelivery.
    fn cleanup(&mut self) {
        for (consumer_id, reg) in self.consumers.drain() {
            reg.subscription.remove_consumer(consumer_id);
            debug!(
                "connection {} dropped consumer {consumer_id} on {}",
                self.connection_id, reg.topic
            );
        }
        for (producer_id, reg) in self.producers.drain() {
            if let Some(topic) = self.state.topics.get(&reg.topic) {
                topic.producers.remove(&producer_id);
            }
        }
    }

    fn send(&self, frame: Frame) {
        let _ = self.frames_tx.send(frame);
    }

    fn send_error(&self, request_id: u64, error: ServerError, message: impl Into<String>) {
        self.send(Frame::command(ClientCommand::Error {
            request_id,
            error,
            message: message.into(),
        }));
    }

    fn send_receipt_error(&self, producer_id: u64, sequence_id: u64, error: ServerError, message: String) {
        self.send(Frame::command(ClientCommand::SendError {
            producer_id,
            sequence_id,
            error,
            message,
        }));
    }

    async fn process_frame(&mut self, frame: Frame) -> Result<(), DriftError> {
        if !self.handshaken {
            return self.process_handshake(frame);
        }
        match frame.command {
            ClientCommand::Connect { .. } => Err(DriftError::Protocol(
                "duplicate CONNECT on established connection".to_string(),
            )),
            ClientCommand::Ping => {
                self.send(Frame::command(ClientCommand::Pong));
                Ok(())
            }
            ClientCommand::Pong => Ok(()),
            ClientCommand::Lookup {
                topic,
                request_id,
                authoritative,
            } => {
                self.handle_lookup(&topic, request_id, authoritative).await;
                Ok(())
            }
            ClientCommand::PartitionedMetadata { topic, request_id } => {
                self.handle_partitioned_metadata(&topic, request_id).await;
                Ok(())
            }
            ClientCommand::Producer {
                topic,
                producer_id,
                request_id,
                producer_name,
                encrypted,
            } => {
                self.handle_producer(&topic, producer_id, request_id, producer_name, encrypted)
                    .await;
                Ok(())
            }
            ClientCommand::Send {
                producer_id,
                sequence_id,
                num_messages: _,
            } => {
                self.handle_send(producer_id, sequence_id, frame.payload)
                    .await;
                Ok(())
            }
            ClientCommand::Subscribe {
                topic,
                subscription,
                sub_type,
                consumer_id,
                request_id,
                initial_position,
                start_message_id,
            } => {
                self.handle_subscribe(
                    &topic,
                    &subscription,
                    sub_type,
                    consumer_id,
                    request_id,
                    initial_position,
                    start_message_id,
                )
                .await;
                Ok(())
            }
            ClientCommand::Flow {
                consumer_id,
                message_permits,
            } => {
                if let Some(reg) = self.consumers.get(&consumer_id) {
                    reg.subscription.flow(consumer_id, message_permits);
                }
                Ok(())
            }
            ClientCommand::Ack {
                consumer_id,
                ack_type,
                message_ids,
                properties,
            } => {
                if let Some(reg) = self.consumers.get(&consumer_id)
                    && let Err(e) = reg.subscription.ack(ack_type, &message_ids, &properties)
                {
                    debug!("rejected ack from consumer {consumer_id}: {e}");
                }
                Ok(())
            }
            ClientCommand::RedeliverUnacknowledgedMessages {
                consumer_id,
                message_ids,
            } => {
                if let Some(reg) = self.consumers.get(&consumer_id) {
                    reg.subscription
                        .redeliver_unacknowledged(consumer_id, &message_ids);
                }
                Ok(())
            }
            ClientCommand::Seek {
                consumer_id,
                request_id,
                message_id,
            } => {
                match self.consumers.get(&consumer_id) {
                    Some(reg) => {
                        reg.subscription.seek(message_id.position());
                        self.send(Frame::command(ClientCommand::Success { request_id }));
                    }
                    None => self.send_error(
                        request_id,
                        ServerError::MetadataError,
                        format!("unknown consumer {consumer_id}"),
                    ),
                }
                Ok(())
            }
            ClientCommand::Unsubscribe {
                consumer_id,
                request_id,
            } => {
                self.handle_unsubscribe(consumer_id, request_id);
                Ok(())
            }
            ClientCommand::CloseProducer {
                producer_id,
                request_id,
            } => {
                if let Some(reg) = self.producers.remove(&producer_id)
                    && let Some(topic) = self.state.topics.get(&reg.topic)
                {
                    topic.producers.remove(&producer_id);
                }
                self.send(Frame::command(ClientCommand::Success { request_id }));
                Ok(())
            }
            ClientCommand::CloseConsumer {
                consumer_id,
                request_id,
            } => {
                if let Some(reg) = self.consumers.remove(&consumer_id) {
                    reg.subscription.remove_consumer(consumer_id);
                }
                self.send(Frame::command(ClientCommand::Success { request_id }));
                Ok(())
            }
            ClientCommand::GetTopicsOfNamespace {
                namespace,
                request_id,
            } => {
                self.handle_get_topics(&namespace, request_id).await;
                Ok(())
            }
            other => Err(DriftError::Protocol(format!(
                "unexpected {} from client",
                other.name()
            ))),
        }
    }

    fn process_handshake(&mut self, frame: Frame) -> Result<(), DriftError> {
        let ClientCommand::Connect {
            auth_method_name,
            auth_data,
            client_version,
            protocol_version,
            proxy_to_broker_address: _,
        } = frame.command
        else {
            return Err(DriftError::Protocol(format!(
                "expected CONNECT, got {}",
                frame.command.name()
            )));
        };
        let role = match self
            .state
            .auth
            .authenticate(auth_method_name.as_deref(), auth_data.as_deref())
        {
            Ok(role) => role,
            Err(e) => {
                self.send_error(0, ServerError::AuthenticationError, e.to_string());
                return Err(e);
            }
        };
        self.handshaken = true;
        info!(
            "connection {} from {} established (client {client_version}, role {role})",
            self.connection_id, self.addr
        );
        self.role = role;
        self.send(Frame::command(ClientCommand::Connected {
            protocol_version: PROTOCOL_VERSION.min(protocol_version),
        }));
        Ok(())
    }

    async fn handle_lookup(&self, topic: &str, request_id: u64, authoritative: bool) {
        let name = match TopicName::parse(topic) {
            Ok(name) => name,
            Err(e) => {
                self.send(Frame::command(ClientCommand::LookupResponse {
                    request_id,
                    response: LookupType::Failed,
                    broker_service_url: None,
                    broker_service_url_tls: None,
                    authoritative: false,
                    proxy_through_service_url: false,
                    error: Some(ServerError::InvalidTopicName),
                    message: Some(e.to_string()),
                }));
                return;
            }
        };
        // A missing namespace falls through: the engine reports it as a
        // metadata failure.
        if let Ok(policies) = self.policies_of(&name).await
            && let Err(e) =
                self.state
                    .authz
                    .authorize(&self.role, AuthAction::Lookup, &name, &policies)
        {
            self.send(Frame::command(ClientCommand::LookupResponse {
                request_id,
                response: LookupType::Failed,
                broker_service_url: None,
                broker_service_url_tls: None,
                authoritative: false,
                proxy_through_service_url: false,
                error: Some(ServerError::AuthorizationError),
                message: Some(e.to_string()),
            }));
            return;
        }
        let response = match self.state.lookup.lookup(&name, authoritative).await {
            LookupAnswer::Connect { broker_service_url } => ClientCommand::LookupResponse {
                request_id,
                response: LookupType::Connect,
                broker_service_url: Some(broker_service_url),
                broker_service_url_tls: None,
                authoritative: true,
                proxy_through_service_url: false,
                error: None,
                message: None,
            },
            LookupAnswer::Redirect {
                broker_service_url,
                authoritative,
                proxy_through_service_url,
            } => ClientCommand::LookupResponse {
                request_id,
                response: LookupType::Redirect,
                broker_service_url: Some(broker_service_url),
                broker_service_url_tls: None,
                authoritative,
                proxy_through_service_url,
                error: None,
                message: None,
            },
            LookupAnswer::Failed { error, message } => ClientCommand::LookupResponse {
                request_id,
                response: LookupType::Failed,
                broker_service_url: None,
                broker_service_url_tls: None,
                authoritative: false,
                proxy_through_service_url: false,
                error: Some(error),
                message: Some(message),
            },
        };
        self.send(Frame::command(response));
    }

    async fn handle_partitioned_metadata(&self, topic: &str, request_id: u64) {
        let response = match TopicName::parse(topic) {
            Ok(name) => match self.state.lookup.partitioned_metadata(&name).await {
                Ok(meta) => ClientCommand::PartitionedMetadataResponse {
                    request_id,
                    partitions: meta.partitions,
                    error: None,
                    message: None,
                },
                Err(e) => ClientCommand::PartitionedMetadataResponse {
                    request_id,
                    partitions: 0,
                    error: Some(ServerError::MetadataError),
                    message: Some(e.to_string()),
                },
            },
            Err(e) => ClientCommand::PartitionedMetadataResponse {
                request_id,
                partitions: 0,
                error: Some(ServerError::InvalidTopicName),
                message: Some(e.to_string()),
            },
        };
        self.send(Frame::command(response));
    }

    /// Reads the namespace policies of a topic, failing when the namespace
    /// is absent (or tombstoned).
    async fn policies_of(&self, topic: &TopicName) -> Result<Arc<NamespacePolicies>, DriftError> {
        let ns = topic.namespace();
        self.state
            .policies
            .get(&ns)
            .await?
            .ok_or_else(|| DriftError::NotFound(format!("namespace {ns}")))
    }

    /// Whether this broker currently owns the bundle the topic routes to.
    fn owns_topic(&self, topic: &TopicName, policies: &NamespacePolicies) -> bool {
        let ns = topic.namespace();
        let bundle = policies.bundles.find_bundle(bundle::hash_of(topic));
        self.state.ownership.local_state(&ns, &bundle) == Some(BundleState::Owned)
    }

    async fn handle_producer(
        &mut self,
        topic: &str,
        producer_id: u64,
        request_id: u64,
        producer_name: Option<String>,
        encrypted: bool,
    ) {
        let name = match TopicName::parse(topic) {
            Ok(name) => name,
            Err(e) => {
                self.send_error(request_id, ServerError::InvalidTopicName, e.to_string());
                return;
            }
        };
        let policies = match self.policies_of(&name).await {
            Ok(policies) => policies,
            Err(e) => {
                self.send_error(request_id, ServerError::MetadataError, e.to_string());
                return;
            }
        };
        if let Err(e) =
            self.state
                .authz
                .authorize(&self.role, AuthAction::Produce, &name, &policies)
        {
            self.send_error(request_id, ServerError::AuthorizationError, e.to_string());
            return;
        }
        if policies.encryption_required && !encrypted {
            self.send_error(
                request_id,
                ServerError::AuthorizationError,
                format!("namespace {} only accepts encrypted producers", name.namespace()),
            );
            return;
        }
        if !self.owns_topic(&name, &policies) {
            self.send_error(
                request_id,
                ServerError::ServiceNotReady,
                format!("broker does not own the bundle of {name}"),
            );
            return;
        }
        let broker_topic = match self.state.topics.get_or_create(&name).await {
            Ok(t) => t,
            Err(e) => {
                self.send_error(request_id, ServerError::PersistenceError, e.to_string());
                return;
            }
        };
        self.state
            .load
            .update(|r| r.topics = self.state.topics.resident_count() as u64);
        if broker_topic.is_terminated() {
            self.send_error(
                request_id,
                ServerError::TopicTerminatedError,
                format!("{name} is terminated"),
            );
            return;
        }
        let producer_name = producer_name.unwrap_or_else(|| {
            format!(
                "{}-{}",
                self.state.config.cluster_name,
                PRODUCER_NAME_SEQ.fetch_add(1, Ordering::SeqCst)
            )
        });
        let last_sequence_id = broker_topic.last_sequence_id(&producer_name);
        broker_topic.producers.insert(
            producer_id,
            crate::core::broker::topic_state::ProducerHandle {
                name: producer_name.clone(),
                frames: self.frames_tx.clone(),
            },
        );
        self.producers.insert(
            producer_id,
            ProducerRegistration {
                topic: name,
                producer_name: producer_name.clone(),
            },
        );
        self.send(Frame::command(ClientCommand::ProducerSuccess {
            request_id,
            producer_name,
            last_sequence_id,
        }));
    }

    async fn handle_send(
        &self,
        producer_id: u64,
        sequence_id: u64,
        payload: Option<MessagePayload>,
    ) {
        let Some(reg) = self.producers.get(&producer_id) else {
            self.send_receipt_error(
                producer_id,
                sequence_id,
                ServerError::MetadataError,
                format!("unknown producer {producer_id}"),
            );
            return;
        };
        let Some(payload) = payload else {
            self.send_receipt_error(
                producer_id,
                sequence_id,
                ServerError::Unknown,
                "SEND without payload region".to_string(),
            );
            return;
        };
        if !payload.checksum_ok {
            self.send_receipt_error(
                producer_id,
                sequence_id,
                ServerError::ChecksumError,
                "payload checksum mismatch".to_string(),
            );
            return;
        }
        let policies = match self.policies_of(&reg.topic).await {
            Ok(policies) => policies,
            Err(e) => {
                self.send_receipt_error(
                    producer_id,
                    sequence_id,
                    ServerError::MetadataError,
                    e.to_string(),
                );
                return;
            }
        };
        if let Err(e) =
            self.state
                .publish_hook
                .before_publish(&reg.topic, &policies, payload.data.len())
        {
            self.send_receipt_error(
                producer_id,
                sequence_id,
                ServerError::ProducerBlockedQuotaExceededError,
                e.to_string(),
            );
            return;
        }
        let Some(broker_topic) = self.state.topics.get(&reg.topic) else {
            self.send_receipt_error(
                producer_id,
                sequence_id,
                ServerError::ServiceNotReady,
                format!("{} is no longer resident", reg.topic),
            );
            return;
        };
        let mut metadata = payload.metadata;
        metadata.producer_name = reg.producer_name.clone();
        metadata.sequence_id = sequence_id;
        match broker_topic.publish(metadata, payload.data).await {
            Ok(outcome) => {
                let (ledger_id, entry_id) = outcome.position();
                let partition = reg.topic.partition_index().map_or(-1, |i| i as i32);
                self.send(Frame::command(ClientCommand::SendReceipt {
                    producer_id,
                    sequence_id,
                    message_id: MessageIdData::new(ledger_id, entry_id).with_partition(partition),
                }));
            }
            Err(DriftError::TopicTerminated) => {
                self.send_receipt_error(
                    producer_id,
                    sequence_id,
                    ServerError::TopicTerminatedError,
                    format!("{} is terminated", reg.topic),
                );
            }
            Err(e) => {
                self.send_receipt_error(
                    producer_id,
                    sequence_id,
                    ServerError::PersistenceError,
                    e.to_string(),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_subscribe(
        &mut self,
        topic: &str,
        subscription: &str,
        sub_type: SubType,
        consumer_id: u64,
        request_id: u64,
        initial_position: InitialPosition,
        start_message_id: Option<MessageIdData>,
    ) {
        let name = match TopicName::parse(topic) {
            Ok(name) => name,
            Err(e) => {
                self.send_error(request_id, ServerError::InvalidTopicName, e.to_string());
                return;
            }
        };
        let policies = match self.policies_of(&name).await {
            Ok(policies) => policies,
            Err(e) => {
                self.send_error(request_id, ServerError::MetadataError, e.to_string());
                return;
            }
        };
        let authorized = self
            .state
            .authz
            .authorize(&self.role, AuthAction::Consume, &name, &policies)
            .and_then(|()| {
                self.state
                    .authz
                    .authorize_subscription(&self.role, subscription, &policies)
            });
        if let Err(e) = authorized {
            self.send_error(request_id, ServerError::AuthorizationError, e.to_string());
            return;
        }
        if !self.owns_topic(&name, &policies) {
            self.send_error(
                request_id,
                ServerError::ServiceNotReady,
                format!("broker does not own the bundle of {name}"),
            );
            return;
        }
        let broker_topic = match self.state.topics.get_or_create(&name).await {
            Ok(t) => t,
            Err(e) => {
                self.send_error(request_id, ServerError::PersistenceError, e.to_string());
                return;
            }
        };
        self.state
            .load
            .update(|r| r.topics = self.state.topics.resident_count() as u64);
        let sub = match broker_topic
            .subscription(
                subscription,
                sub_type,
                initial_position,
                start_message_id.map(|id| id.position()),
            )
            .await
        {
            Ok(sub) => sub,
            Err(DriftError::ConsumerBusy(msg)) => {
                self.send_error(request_id, ServerError::ConsumerBusy, msg);
                return;
            }
            Err(e) => {
                self.send_error(request_id, ServerError::MetadataError, e.to_string());
                return;
            }
        };
        let consumer = ServerConsumer::new(consumer_id, self.frames_tx.clone());
        if let Err(e) = sub.add_consumer(consumer) {
            self.send_error(request_id, ServerError::ConsumerBusy, e.to_string());
            return;
        }
        self.consumers.insert(
            consumer_id,
            ConsumerRegistration {
                subscription: sub,
                topic: name,
            },
        );
        self.send(Frame::command(ClientCommand::Success { request_id }));
    }

    fn handle_unsubscribe(&mut self, consumer_id: u64, request_id: u64) {
        let Some(reg) = self.consumers.remove(&consumer_id) else {
            self.send_error(
                request_id,
                ServerError::MetadataError,
                format!("unknown consumer {consumer_id}"),
            );
            return;
        };
        reg.subscription.remove_consumer(consumer_id);
        let result = self
            .state
            .topics
            .get(&reg.topic)
            .map(|t| t.unsubscribe(&reg.subscription.name));
        match result {
            Some(Ok(())) | None => {
                self.send(Frame::command(ClientCommand::Success { request_id }));
            }
            Some(Err(e)) => {
                self.send_error(request_id, ServerError::MetadataError, e.to_string());
            }
        }
    }

    async fn handle_get_topics(&self, namespace: &str, request_id: u64) {
        let topics = match NamespaceName::parse(namespace) {
            Ok(ns) => match self.state.topics.topics_of_namespace(&ns).await {
                Ok(topics) => topics,
                Err(e) => {
                    debug!("topic listing for {namespace} failed: {e}");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        self.send(Frame::command(
            ClientCommand::GetTopicsOfNamespaceResponse { request_id, topics },
        ));
    }
}
