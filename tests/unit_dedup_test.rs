use bytes::Bytes;
use dashmap::DashMap;
use driftmq::DriftClient;
use driftmq::client::{ConsumerOptions, ProducerMessage, ProducerOptions};
use driftmq::config::BrokerConfig;
use driftmq::core::broker::store::MemoryTopicLog;
use driftmq::core::broker::topic_state::{BrokerTopic, PublishOutcome};
use driftmq::core::metadata::MemoryMetadataStore;
use driftmq::core::protocol::{CompressionType, InitialPosition, MessageMetadata};
use driftmq::core::topic::{NamespaceName, TopicName};
use driftmq::server::BrokerServer;
use std::sync::Arc;
use std::time::Duration;

fn metadata(producer_name: &str, sequence_id: u64, size: u32) -> MessageMetadata {
    MessageMetadata {
        producer_name: producer_name.to_string(),
        sequence_id,
        publish_time: 0,
        partition_key: None,
        properties: Vec::new(),
        compression: CompressionType::None,
        uncompressed_size: size,
        num_messages_in_batch: 0,
        encryption_keys: Vec::new(),
    }
}

#[tokio::test]
async fn test_broker_topic_suppresses_old_sequence_ids() {
    let topic = TopicName::parse("persistent://p/c/n/t").unwrap();
    let broker_topic = BrokerTopic::new(
        topic,
        Arc::new(MemoryTopicLog::new(1)),
        Arc::new(DashMap::new()),
        Arc::new(DashMap::new()),
    );

    let first = broker_topic
        .publish(metadata("p1", 0, 1), Bytes::from_static(b"a"))
        .await
        .unwrap();
    assert_eq!(first, PublishOutcome::Persisted((1, 0)));
    let second = broker_topic
        .publish(metadata("p1", 1, 1), Bytes::from_static(b"b"))
        .await
        .unwrap();
    assert_eq!(second, PublishOutcome::Persisted((1, 1)));

    // Replaying sequence 1 (or anything lower) does not append again.
    let replay = broker_topic
        .publish(metadata("p1", 1, 1), Bytes::from_static(b"b"))
        .await
        .unwrap();
    assert_eq!(replay, PublishOutcome::Duplicate((1, 1)));
    let stale = broker_topic
        .publish(metadata("p1", 0, 1), Bytes::from_static(b"a"))
        .await
        .unwrap();
    assert!(matches!(stale, PublishOutcome::Duplicate(_)));

    // A different producer name has its own sequence space.
    let other = broker_topic
        .publish(metadata("p2", 0, 1), Bytes::from_static(b"c"))
        .await
        .unwrap();
    assert_eq!(other, PublishOutcome::Persisted((1, 2)));
    assert_eq!(broker_topic.last_sequence_id("p1"), 1);
    assert_eq!(broker_topic.last_sequence_id("p2"), 0);
    assert_eq!(broker_topic.last_sequence_id("unknown"), -1);
}

#[tokio::test]
async fn test_stable_producer_name_resumes_sequence_after_reconnect() {
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..BrokerConfig::default()
    };
    let meta = Arc::new(MemoryMetadataStore::new());
    let server = BrokerServer::start(config, meta).await.unwrap();
    let url = server.state.config.broker_service_url();
    server
        .state
        .create_namespace(&NamespaceName::parse("p/c/n").unwrap(), None)
        .await
        .unwrap();

    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let topic_str = "persistent://p/c/n/dedup";
    let options = ProducerOptions {
        producer_name: Some("stable-producer".to_string()),
        ..ProducerOptions::default()
    };

    let first = client.create_producer(topic_str, options.clone()).await.unwrap();
    for i in 0..5 {
        first
            .send(ProducerMessage::new(format!("s-{i}")))
            .await
            .unwrap();
    }
    first.close().await.unwrap();

    // The broker remembers the last persisted sequence for the name.
    let topic = TopicName::parse(topic_str).unwrap();
    let broker_topic = server.state.topics.get(&topic).unwrap();
    assert_eq!(broker_topic.last_sequence_id("stable-producer"), 4);

    // A new incarnation resumes after it; consumers see each payload once.
    let second = client.create_producer(topic_str, options).await.unwrap();
    for i in 5..8 {
        second
            .send(ProducerMessage::new(format!("s-{i}")))
            .await
            .unwrap();
    }
    assert_eq!(broker_topic.last_sequence_id("stable-producer"), 7);

    let consumer = client
        .subscribe(
            topic_str,
            "verify",
            ConsumerOptions {
                initial_position: InitialPosition::Earliest,
                ..ConsumerOptions::default()
            },
        )
        .await
        .unwrap();
    for i in 0..8 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(msg.payload, Bytes::from(format!("s-{i}")));
        consumer.ack(&msg).unwrap();
    }
    let extra = consumer.receive_timeout(Duration::from_millis(300)).await;
    assert!(extra.is_err(), "no duplicates reach consumers");

    server.shutdown().await;
}
