// src/core/protocol/commands.rs

//! The type-tagged commands of the binary protocol.
//!
//! Commands are serialized with `bincode` inside length-prefixed frames.
//! Correlation is by `request_id` for request/response pairs and by
//! `producer_id`/`consumer_id`/`sequence_id` for stream operations. Unknown
//! trailing bytes after a decoded command are ignored so older peers can
//! talk to newer ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The protocol revision spoken by this implementation. Both sides settle on
/// the minimum of the two advertised versions during the CONNECT handshake.
pub const PROTOCOL_VERSION: i32 = 2;

/// Identifies a message position: `(ledger_id, entry_id)` is
/// lexicographically ordered within one partition. `partition` and
/// `batch_index` are `-1` when not applicable.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct MessageIdData {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub batch_index: i32,
}

impl MessageIdData {
    pub fn new(ledger_id: u64, entry_id: u64) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition: -1,
            batch_index: -1,
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_batch_index(mut self, batch_index: i32) -> Self {
        self.batch_index = batch_index;
        self
    }

    /// The position with batch and partition qualifiers stripped, as stored
    /// by cursors.
    pub fn position(&self) -> (u64, u64) {
        (self.ledger_id, self.entry_id)
    }
}

impl fmt::Display for MessageIdData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.ledger_id, self.entry_id, self.partition, self.batch_index
        )
    }
}

/// Wire-level error codes carried by `Error`, `SendError` and the lookup
/// responses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ServerError {
    Unknown,
    AuthenticationError,
    AuthorizationError,
    ConsumerBusy,
    MetadataError,
    PersistenceError,
    ServiceNotReady,
    TooManyRequests,
    ProducerBlockedQuotaExceededError,
    ProducerBlockedQuotaExceededException,
    TopicTerminatedError,
    ChecksumError,
    TopicNotFound,
    InvalidTopicName,
}

/// The verdict of a lookup: connect here, go elsewhere, or give up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum LookupType {
    Connect,
    Redirect,
    Failed,
}

/// Subscription modes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum SubType {
    Exclusive,
    Shared,
    Failover,
}

/// Where a brand-new subscription cursor starts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum InitialPosition {
    Latest,
    Earliest,
}

/// Acknowledgement modes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum AckType {
    Individual,
    Cumulative,
}

/// Payload compression applied by producers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zstd,
}

/// Per-message metadata travelling between the command and the payload in
/// SEND/MESSAGE frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MessageMetadata {
    pub producer_name: String,
    pub sequence_id: u64,
    /// Milliseconds since the epoch at publish time.
    pub publish_time: u64,
    pub partition_key: Option<String>,
    pub properties: Vec<(String, String)>,
    pub compression: CompressionType,
    pub uncompressed_size: u32,
    /// `0` for a plain message; `> 0` marks a batch with that many
    /// sub-entries in the payload.
    pub num_messages_in_batch: u32,
    /// Present when the payload is encrypted; consumers without a key reader
    /// apply their configured crypto failure action.
    pub encryption_keys: Vec<String>,
}

impl MessageMetadata {
    pub fn is_batch(&self) -> bool {
        self.num_messages_in_batch > 0
    }

    pub fn is_encrypted(&self) -> bool {
        !self.encryption_keys.is_empty()
    }
}

/// Metadata of one sub-entry inside a batched payload. Each sub-entry is
/// laid out as `u32 meta-len; meta; u32 payload-len; payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SingleMessageMetadata {
    pub partition_key: Option<String>,
    pub properties: Vec<(String, String)>,
}

/// Every command of the protocol. The enum is the single source of truth
/// for what can travel on a connection in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ClientCommand {
    Connect {
        auth_method_name: Option<String>,
        auth_data: Option<Vec<u8>>,
        client_version: String,
        protocol_version: i32,
        /// Set by proxies: the broker the connection should be wired
        /// through to.
        proxy_to_broker_address: Option<String>,
    },
    Connected {
        protocol_version: i32,
    },
    Lookup {
        topic: String,
        request_id: u64,
        authoritative: bool,
    },
    LookupResponse {
        request_id: u64,
        response: LookupType,
        broker_service_url: Option<String>,
        broker_service_url_tls: Option<String>,
        authoritative: bool,
        /// When true the client must keep connecting through its original
        /// service URL and only change the logical broker.
        proxy_through_service_url: bool,
        error: Option<ServerError>,
        message: Option<String>,
    },
    PartitionedMetadata {
        topic: String,
        request_id: u64,
    },
    PartitionedMetadataResponse {
        request_id: u64,
        partitions: u32,
        error: Option<ServerError>,
        message: Option<String>,
    },
    Producer {
        topic: String,
        producer_id: u64,
        request_id: u64,
        producer_name: Option<String>,
        encrypted: bool,
    },
    ProducerSuccess {
        request_id: u64,
        producer_name: String,
        /// The last sequence id persisted for this producer name, used to
        /// suppress duplicates after reconnect. `-1` for a new producer.
        last_sequence_id: i64,
    },
    Send {
        producer_id: u64,
        sequence_id: u64,
        num_messages: u32,
    },
    SendReceipt {
        producer_id: u64,
        sequence_id: u64,
        message_id: MessageIdData,
    },
    SendError {
        producer_id: u64,
        sequence_id: u64,
        error: ServerError,
        message: String,
    },
    Subscribe {
        topic: String,
        subscription: String,
        sub_type: SubType,
        consumer_id: u64,
        request_id: u64,
        initial_position: InitialPosition,
        start_message_id: Option<MessageIdData>,
    },
    Success {
        request_id: u64,
    },
    Error {
        request_id: u64,
        error: ServerError,
        message: String,
    },
    Flow {
        consumer_id: u64,
        message_permits: u32,
    },
    Message {
        consumer_id: u64,
        message_id: MessageIdData,
        redelivery_count: u32,
    },
    Ack {
        consumer_id: u64,
        ack_type: AckType,
        message_ids: Vec<MessageIdData>,
        properties: Vec<(String, String)>,
    },
    RedeliverUnacknowledgedMessages {
        consumer_id: u64,
        /// Empty means "redeliver everything unacknowledged".
        message_ids: Vec<MessageIdData>,
    },
    Seek {
        consumer_id: u64,
        request_id: u64,
        message_id: MessageIdData,
    },
    Unsubscribe {
        consumer_id: u64,
        request_id: u64,
    },
    CloseProducer {
        producer_id: u64,
        request_id: u64,
    },
    CloseConsumer {
        consumer_id: u64,
        request_id: u64,
    },
    ReachedEndOfTopic {
        consumer_id: u64,
    },
    GetTopicsOfNamespace {
        namespace: String,
        request_id: u64,
    },
    GetTopicsOfNamespaceResponse {
        request_id: u64,
        topics: Vec<String>,
    },
    Ping,
    Pong,
}

impl ClientCommand {
    /// Whether this command type is followed by a metadata+payload region in
    /// its frame.
    pub fn carries_payload(&self) -> bool {
        matches!(
            self,
            ClientCommand::Send { .. } | ClientCommand::Message { .. }
        )
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Connect { .. } => "CONNECT",
            ClientCommand::Connected { .. } => "CONNECTED",
            ClientCommand::Lookup { .. } => "LOOKUP",
            ClientCommand::LookupResponse { .. } => "LOOKUP_RESPONSE",
            ClientCommand::PartitionedMetadata { .. } => "PARTITIONED_METADATA",
            ClientCommand::PartitionedMetadataResponse { .. } => "PARTITIONED_METADATA_RESPONSE",
            ClientCommand::Producer { .. } => "PRODUCER",
            ClientCommand::ProducerSuccess { .. } => "PRODUCER_SUCCESS",
            ClientCommand::Send { .. } => "SEND",
            ClientCommand::SendReceipt { .. } => "SEND_RECEIPT",
            ClientCommand::SendError { .. } => "SEND_ERROR",
            ClientCommand::Subscribe { .. } => "SUBSCRIBE",
            ClientCommand::Success { .. } => "SUCCESS",
            ClientCommand::Error { .. } => "ERROR",
            ClientCommand::Flow { .. } => "FLOW",
            ClientCommand::Message { .. } => "MESSAGE",
            ClientCommand::Ack { .. } => "ACK",
            ClientCommand::RedeliverUnacknowledgedMessages { .. } => "REDELIVER_UNACKNOWLEDGED",
            ClientCommand::Seek { .. } => "SEEK",
            ClientCommand::Unsubscribe { .. } => "UNSUBSCRIBE",
            ClientCommand::CloseProducer { .. } => "CLOSE_PRODUCER",
            ClientCommand::CloseConsumer { .. } => "CLOSE_CONSUMER",
            ClientCommand::ReachedEndOfTopic { .. } => "REACHED_END_OF_TOPIC",
            ClientCommand::GetTopicsOfNamespace { .. } => "GET_TOPICS_OF_NAMESPACE",
            ClientCommand::GetTopicsOfNamespaceResponse { .. } => {
                "GET_TOPICS_OF_NAMESPACE_RESPONSE"
            }
            ClientCommand::Ping => "PING",
            ClientCommand::Pong => "PONG",
        }
    }
}
