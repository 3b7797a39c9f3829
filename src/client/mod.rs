// src/client/mod.rs

//! The DriftMQ client library: connection pooling, topic resolution, and
//! the producer/consumer surfaces.

pub mod backoff;
pub mod connection;
pub mod consumer;
pub mod lookup_service;
pub mod multi_consumer;
pub mod pool;
pub mod producer;
pub mod unacked;

pub use consumer::{Consumer, ConsumerMessage, ConsumerOptions, CryptoFailureAction};
pub use lookup_service::LookupService;
pub use multi_consumer::{MultiConsumerOptions, MultiTopicConsumer};
pub use pool::ConnectionPool;
pub use producer::{Producer, ProducerMessage, ProducerOptions};

use crate::config::ClientConfig;
use crate::core::DriftError;
use crate::core::topic::TopicName;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`DriftClient`].
pub struct DriftClientBuilder {
    service_url: String,
    config: ClientConfig,
}

impl DriftClientBuilder {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            config: ClientConfig::default(),
        }
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn max_redirects(mut self, max_redirects: u32) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    pub fn max_connections_per_host(mut self, slots: usize) -> Self {
        self.config.max_connections_per_host = slots.max(1);
        self
    }

    pub fn build(self) -> DriftClient {
        let client_id = uuid::Uuid::new_v4();
        let config = Arc::new(self.config);
        let pool = ConnectionPool::new(config.clone());
        let lookup = Arc::new(LookupService::new(
            pool.clone(),
            config.clone(),
            self.service_url,
        ));
        tracing::debug!("client {client_id} created");
        DriftClient {
            client_id,
            config,
            pool,
            lookup,
        }
    }
}

/// A client process's entry point: owns the connection pool and the lookup
/// service every producer and consumer routes through.
pub struct DriftClient {
    /// Unique id of this client instance, used in diagnostics.
    client_id: uuid::Uuid,
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool>,
    lookup: Arc<LookupService>,
}

impl DriftClient {
    /// A client with default configuration against one bootstrap service
    /// URL.
    pub fn new(service_url: impl Into<String>) -> Self {
        DriftClientBuilder::new(service_url).build()
    }

    pub fn builder(service_url: impl Into<String>) -> DriftClientBuilder {
        DriftClientBuilder::new(service_url)
    }

    /// Creates a producer on a topic; partitioned topics get one
    /// sub-producer per partition behind the message router.
    pub async fn create_producer(
        &self,
        topic: &str,
        options: ProducerOptions,
    ) -> Result<Producer, DriftError> {
        let topic = TopicName::parse(topic)?;
        Producer::create(self.lookup.clone(), self.config.clone(), topic, options).await
    }

    /// Subscribes a single-topic consumer. The topic must not be
    /// partitioned; use [`DriftClient::subscribe_multi`] for partitioned
    /// fan-in.
    pub async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: ConsumerOptions,
    ) -> Result<Arc<Consumer>, DriftError> {
        let topic = TopicName::parse(topic)?;
        if self.lookup.partitioned_metadata(&topic).await? > 0 {
            return Err(DriftError::PreconditionFailed(format!(
                "{topic} is partitioned; subscribe with a multi-topic consumer"
            )));
        }
        Consumer::subscribe(
            self.lookup.clone(),
            self.config.clone(),
            topic,
            subscription.to_string(),
            options,
        )
        .await
    }

    /// Subscribes one aggregated consumer across several (possibly
    /// partitioned) topics.
    pub async fn subscribe_multi(
        &self,
        topics: &[&str],
        subscription: &str,
        options: MultiConsumerOptions,
    ) -> Result<Arc<MultiTopicConsumer>, DriftError> {
        let topics = topics
            .iter()
            .map(|t| TopicName::parse(t))
            .collect::<Result<Vec<_>, _>>()?;
        MultiTopicConsumer::subscribe_multi(
            self.lookup.clone(),
            self.config.clone(),
            topics,
            subscription.to_string(),
            options,
        )
        .await
    }

    /// Subscribes to every topic matching a pattern, with periodic
    /// rediscovery.
    pub async fn subscribe_pattern(
        &self,
        pattern: &str,
        subscription: &str,
        options: MultiConsumerOptions,
    ) -> Result<Arc<MultiTopicConsumer>, DriftError> {
        MultiTopicConsumer::subscribe_pattern(
            self.lookup.clone(),
            self.config.clone(),
            pattern,
            subscription.to_string(),
            options,
        )
        .await
    }

    /// The lookup service, exposed for partition metadata queries.
    pub fn lookup(&self) -> &Arc<LookupService> {
        &self.lookup
    }

    /// This client instance's unique id.
    pub fn client_id(&self) -> uuid::Uuid {
        self.client_id
    }

    /// Closes every pooled connection. Producers and consumers created from
    /// this client fail over to their reconnect loops or surface
    /// disconnection.
    pub fn close(&self) {
        self.pool.close_all();
    }
}
