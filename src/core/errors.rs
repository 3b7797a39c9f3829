// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the broker
/// and the client library. Using `thiserror` allows for clean error
/// definitions and automatic `From` trait implementations.
///
/// Each variant corresponds to one kind in the error taxonomy: callers are
/// expected to match on the variant, not parse the message.
#[derive(Error, Debug, Clone)]
pub enum DriftError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Compare-and-set version conflict on a metadata write. Retried
    /// internally with a bounded number of attempts before surfacing.
    #[error("Metadata version conflict on '{0}'")]
    BadVersion(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Service not ready: {0}")]
    ServiceNotReady(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection lost")]
    Disconnected,

    #[error("Frame checksum mismatch")]
    Checksum,

    #[error("Topic has been terminated")]
    TopicTerminated,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid topic name '{0}'")]
    InvalidTopicName(String),

    #[error("Invalid bundles descriptor: {0}")]
    InvalidBundles(String),

    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    #[error("Producer send queue is full")]
    ProducerQueueIsFull,

    #[error("Consumer busy: {0}")]
    ConsumerBusy(String),

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Metadata store error: {0}")]
    MetadataError(String),

    #[error("Metadata store session expired")]
    SessionExpired,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriftError {
    /// Whether the failure is transient and the operation may be retried
    /// after a backoff. Routing answers (redirects) are not errors and are
    /// modeled as values, never as this type.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DriftError::TooManyRequests
                | DriftError::ServiceNotReady(_)
                | DriftError::Timeout(_)
                | DriftError::Disconnected
                | DriftError::BadVersion(_)
                | DriftError::MetadataError(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for DriftError {
    fn from(e: std::io::Error) -> Self {
        DriftError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for DriftError {
    fn from(e: serde_json::Error) -> Self {
        DriftError::MetadataError(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<bincode::error::EncodeError> for DriftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DriftError::Protocol(format!("command encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for DriftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DriftError::Protocol(format!("command decode error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for DriftError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DriftError::Timeout("deadline elapsed".to_string())
    }
}
