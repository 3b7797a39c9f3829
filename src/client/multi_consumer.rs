// src/client/multi_consumer.rs

//! The multi-topic and pattern consumer.
//!
//! Composes any number of per-partition consumers into one delivery stream:
//! each sub-consumer pumps into a bounded shared queue; a pump whose push
//! would overflow the queue parks until the application drains it below
//! half. Acks and redelivery route back to the owning sub-consumer by
//! topic. In pattern mode, a periodic rediscovery task diffs the namespace
//! topic list against the current subscription set.

use crate::client::consumer::{Consumer, ConsumerMessage, ConsumerOptions};
use crate::client::lookup_service::LookupService;
use crate::config::ClientConfig;
use crate::core::DriftError;
use crate::core::protocol::MessageIdData;
use crate::core::topic::{NamespaceName, TopicName};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Tuning of the aggregation layer.
#[derive(Clone)]
pub struct MultiConsumerOptions {
    /// Applied to every sub-consumer.
    pub consumer: ConsumerOptions,
    /// Capacity of the aggregated queue; at least 2. Pumps pause at the
    /// cap and resume once the queue drains below half.
    pub shared_queue_size: usize,
    /// How often pattern subscriptions rediscover matching topics.
    pub pattern_discovery_period: Duration,
}

impl Default for MultiConsumerOptions {
    fn default() -> Self {
        Self {
            consumer: ConsumerOptions::default(),
            shared_queue_size: 1000,
            pattern_discovery_period: Duration::from_secs(60),
        }
    }
}

/// The bounded fan-in queue. Pushers park at capacity; the pop side wakes
/// them once the backlog drains below half.
struct SharedQueue {
    capacity: usize,
    queue: Mutex<VecDeque<ConsumerMessage>>,
    space: Notify,
    data: Notify,
}

impl SharedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            data: Notify::new(),
        }
    }

    async fn push(&self, msg: ConsumerMessage) {
        let mut msg = Some(msg);
        loop {
            let waiter = self.space.notified();
            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(msg.take().unwrap());
                    drop(queue);
                    self.data.notify_waiters();
                    return;
                }
            }
            // The queue is full: this pump is paused until a drain.
            waiter.await;
        }
    }

    async fn pop(&self) -> ConsumerMessage {
        loop {
            let waiter = self.data.notified();
            {
                let mut queue = self.queue.lock();
                if let Some(msg) = queue.pop_front() {
                    if queue.len() < self.capacity / 2 {
                        self.space.notify_waiters();
                    }
                    return msg;
                }
            }
            waiter.await;
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

struct SubEntry {
    consumer: Arc<Consumer>,
    pump: tokio::task::JoinHandle<()>,
}

/// A consumer over many topics (or a topic pattern), each potentially
/// partitioned.
pub struct MultiTopicConsumer {
    lookup: Arc<LookupService>,
    config: Arc<ClientConfig>,
    subscription: String,
    options: MultiConsumerOptions,
    queue: Arc<SharedQueue>,
    /// Keyed by the concrete (partition) topic.
    consumers: Mutex<HashMap<TopicName, SubEntry>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl MultiTopicConsumer {
    /// Subscribes to an explicit set of base topics.
    pub async fn subscribe_multi(
        lookup: Arc<LookupService>,
        config: Arc<ClientConfig>,
        topics: Vec<TopicName>,
        subscription: String,
        options: MultiConsumerOptions,
    ) -> Result<Arc<Self>, DriftError> {
        let consumer = Arc::new(Self {
            queue: Arc::new(SharedQueue::new(options.shared_queue_size)),
            lookup,
            config,
            subscription,
            options,
            consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        for topic in topics {
            consumer.subscribe_topic(&topic).await?;
        }
        Ok(consumer)
    }

    /// Subscribes to every topic of a namespace whose full name matches the
    /// pattern, rediscovering the set periodically. The namespace is taken
    /// from the pattern's `<domain>://<property>/<cluster>/<namespace>/`
    /// prefix; only the local part may contain regex.
    pub async fn subscribe_pattern(
        lookup: Arc<LookupService>,
        config: Arc<ClientConfig>,
        pattern: &str,
        subscription: String,
        options: MultiConsumerOptions,
    ) -> Result<Arc<Self>, DriftError> {
        let (ns, regex) = parse_pattern(pattern)?;
        let consumer = Arc::new(Self {
            queue: Arc::new(SharedQueue::new(options.shared_queue_size)),
            lookup,
            config,
            subscription,
            options,
            consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        consumer.rediscover(&ns, &regex).await?;
        let period = consumer.options.pattern_discovery_period;
        let task_consumer = consumer.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = task_consumer.close_notify.notified() => break,
                    _ = timer.tick() => {
                        if task_consumer.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = task_consumer.rediscover(&ns, &regex).await {
                            warn!("pattern rediscovery failed: {e}");
                        }
                    }
                }
            }
        });
        Ok(consumer)
    }

    /// Adds a base topic: one sub-consumer per partition (or one for an
    /// unpartitioned topic).
    pub async fn subscribe_topic(&self, topic: &TopicName) -> Result<(), DriftError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriftError::AlreadyClosed("consumer".to_string()));
        }
        let partition_count = self.lookup.partitioned_metadata(topic).await?;
        let partitions: Vec<TopicName> = if partition_count == 0 {
            vec![topic.clone()]
        } else {
            (0..partition_count).map(|i| topic.partition(i)).collect()
        };
        for partition in partitions {
            if self.consumers.lock().contains_key(&partition) {
                continue;
            }
            let sub = Consumer::subscribe(
                self.lookup.clone(),
                self.config.clone(),
                partition.clone(),
                self.subscription.clone(),
                self.options.consumer.clone(),
            )
            .await?;
            let queue = self.queue.clone();
            let pump_consumer = sub.clone();
            let pump = tokio::spawn(async move {
                loop {
                    match pump_consumer.receive().await {
                        Ok(msg) => queue.push(msg).await,
                        Err(e) => {
                            debug!(
                                "pump for {} stopping: {e}",
                                pump_consumer.topic()
                            );
                            break;
                        }
                    }
                }
            });
            self.consumers.lock().insert(
                partition,
                SubEntry {
                    consumer: sub,
                    pump,
                },
            );
        }
        Ok(())
    }

    /// Removes a base topic and all its partition sub-consumers.
    pub async fn unsubscribe_topic(&self, topic: &TopicName) -> Result<(), DriftError> {
        let victims: Vec<(TopicName, SubEntry)> = {
            let mut consumers = self.consumers.lock();
            let keys: Vec<TopicName> = consumers
                .keys()
                .filter(|t| t.base() == *topic)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| consumers.remove(&k).map(|e| (k, e)))
                .collect()
        };
        for (name, entry) in victims {
            entry.pump.abort();
            if let Err(e) = entry.consumer.close().await {
                debug!("closing sub-consumer {name} failed: {e}");
            }
            info!("dropped sub-consumer {name} from '{}'", self.subscription);
        }
        Ok(())
    }

    /// One pattern rediscovery round: subscribe what newly matches, drop
    /// what no longer exists or matches.
    async fn rediscover(&self, ns: &NamespaceName, regex: &Regex) -> Result<(), DriftError> {
        let listed = self.lookup.topics_of_namespace(ns).await?;
        let mut matched = Vec::new();
        for raw in listed {
            if !regex.is_match(&raw) {
                continue;
            }
            // Listings contain concrete partitions; diff on base topics so
            // partition expansion stays in one place.
            if let Ok(topic) = TopicName::parse(&raw) {
                let base = topic.base();
                if !matched.contains(&base) {
                    matched.push(base);
                }
            }
        }

        let current_bases: Vec<TopicName> = {
            let consumers = self.consumers.lock();
            let mut bases: Vec<TopicName> = consumers.keys().map(|t| t.base()).collect();
            bases.dedup();
            bases.sort_by_key(|t| t.to_string());
            bases.dedup();
            bases
        };

        for base in &matched {
            if !current_bases.contains(base) {
                info!("pattern matched new topic {base}");
                self.subscribe_topic(base).await?;
            }
        }
        for base in current_bases {
            if !matched.contains(&base) {
                info!("pattern no longer matches {base}");
                self.unsubscribe_topic(&base).await?;
            }
        }
        Ok(())
    }

    /// Receives the next message from any sub-consumer.
    pub async fn receive(&self) -> Result<ConsumerMessage, DriftError> {
        if self.closed.load(Ordering::SeqCst) && self.queue.len() == 0 {
            return Err(DriftError::AlreadyClosed("consumer".to_string()));
        }
        tokio::select! {
            msg = self.queue.pop() => Ok(msg),
            _ = self.close_notify.notified() => {
                Err(DriftError::AlreadyClosed("consumer".to_string()))
            }
        }
    }

    pub async fn receive_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ConsumerMessage, DriftError> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| DriftError::Timeout("receive".to_string()))?
    }

    /// Acknowledges by `(topic, message id)`, routing to the owning
    /// sub-consumer. Cumulative acknowledgement is not supported across
    /// topics.
    pub fn ack(&self, msg: &ConsumerMessage) -> Result<(), DriftError> {
        let consumers = self.consumers.lock();
        let entry = consumers.get(&msg.topic).ok_or_else(|| {
            DriftError::NotFound(format!("no sub-consumer for {}", msg.topic))
        })?;
        entry.consumer.ack(msg)
    }

    /// Requests redelivery of a set of `(topic, id)` pairs, grouped and
    /// dispatched per sub-consumer.
    pub fn redeliver_messages(&self, ids: Vec<(TopicName, MessageIdData)>) {
        let mut by_topic: HashMap<TopicName, Vec<MessageIdData>> = HashMap::new();
        for (topic, id) in ids {
            by_topic.entry(topic).or_default().push(id);
        }
        let consumers = self.consumers.lock();
        for (topic, ids) in by_topic {
            if let Some(entry) = consumers.get(&topic) {
                entry.consumer.redeliver_messages(ids);
            }
        }
    }

    /// The number of live sub-consumers (one per partition).
    pub fn num_consumers(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Closes every sub-consumer and the aggregation layer.
    pub async fn close(&self) -> Result<(), DriftError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_notify.notify_waiters();
        let entries: Vec<(TopicName, SubEntry)> = self.consumers.lock().drain().collect();
        for (name, entry) in entries {
            entry.pump.abort();
            if let Err(e) = entry.consumer.close().await {
                debug!("closing sub-consumer {name} failed: {e}");
            }
        }
        Ok(())
    }
}

/// Splits a topic pattern into its namespace and the compiled full-name
/// regex.
fn parse_pattern(pattern: &str) -> Result<(NamespaceName, Regex), DriftError> {
    let (_, rest) = pattern.split_once("://").ok_or_else(|| {
        DriftError::InvalidTopicName(format!("pattern '{pattern}' is missing the domain scheme"))
    })?;
    let parts: Vec<&str> = rest.splitn(4, '/').collect();
    if parts.len() != 4 {
        return Err(DriftError::InvalidTopicName(format!(
            "pattern '{pattern}' must cover <property>/<cluster>/<namespace>/<local>"
        )));
    }
    let ns = NamespaceName::new(parts[0], parts[1], parts[2])?;
    let regex = Regex::new(&format!("^{pattern}$"))
        .map_err(|e| DriftError::InvalidTopicName(format!("bad pattern '{pattern}': {e}")))?;
    Ok((ns, regex))
}
