use driftmq::DriftClient;
use driftmq::client::{ConsumerOptions, MultiConsumerOptions, ProducerMessage, ProducerOptions};
use driftmq::config::BrokerConfig;
use driftmq::core::metadata::MemoryMetadataStore;
use driftmq::core::protocol::SubType;
use driftmq::core::topic::{NamespaceName, TopicName};
use driftmq::server::BrokerServer;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

async fn start_broker() -> (BrokerServer, String) {
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
    (server, url)
}

fn options() -> MultiConsumerOptions {
    MultiConsumerOptions {
        consumer: ConsumerOptions {
            sub_type: SubType::Shared,
            ..ConsumerOptions::default()
        },
        ..MultiConsumerOptions::default()
    }
}

#[tokio::test]
async fn test_aggregates_partitioned_and_plain_topics() {
    let (server, url) = start_broker().await;
    server
        .state
        .create_partitioned_topic(&TopicName::parse("persistent://p/c/n/par").unwrap(), 2)
        .await
        .unwrap();

    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let consumer = client
        .subscribe_multi(
            &["persistent://p/c/n/plain", "persistent://p/c/n/par"],
            "multi-sub",
            options(),
        )
        .await
        .unwrap();
    // One sub-consumer for the plain topic, two for the partitions.
    assert_eq!(consumer.num_consumers(), 3);

    let plain = client
        .create_producer("persistent://p/c/n/plain", ProducerOptions::default())
        .await
        .unwrap();
    let partitioned = client
        .create_producer("persistent://p/c/n/par", ProducerOptions::default())
        .await
        .unwrap();
    assert_eq!(partitioned.partition_count(), 2);

    let mut expected = BTreeSet::new();
    for i in 0..3 {
        let body = format!("plain-{i}");
        plain.send(ProducerMessage::new(body.clone())).await.unwrap();
        expected.insert(body);
    }
    for i in 0..4 {
        let body = format!("par-{i}");
        partitioned
            .send(ProducerMessage::new(body.clone()))
            .await
            .unwrap();
        expected.insert(body);
    }

    // All seven arrive through the one aggregated stream; acks route back
    // to the right sub-consumer by topic.
    let mut got = BTreeSet::new();
    for _ in 0..7 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        got.insert(String::from_utf8_lossy(&msg.payload).into_owned());
        consumer.ack(&msg).unwrap();
    }
    assert_eq!(got, expected);

    consumer.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_keyed_messages_stick_to_one_partition() {
    let (server, url) = start_broker().await;
    server
        .state
        .create_partitioned_topic(&TopicName::parse("persistent://p/c/n/keyed").unwrap(), 3)
        .await
        .unwrap();

    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let producer = client
        .create_producer("persistent://p/c/n/keyed", ProducerOptions::default())
        .await
        .unwrap();

    // Same key, same partition, every time.
    let mut partitions = BTreeSet::new();
    for i in 0..6 {
        let id = producer
            .send(ProducerMessage::new(format!("v{i}")).with_key("customer-42"))
            .await
            .unwrap();
        partitions.insert(id.partition);
    }
    assert_eq!(partitions.len(), 1);

    // Unkeyed messages spread across partitions.
    let mut spread = BTreeSet::new();
    for i in 0..9 {
        let id = producer
            .send(ProducerMessage::new(format!("u{i}")))
            .await
            .unwrap();
        spread.insert(id.partition);
    }
    assert!(spread.len() > 1, "round robin uses more than one partition");

    server.shutdown().await;
}

#[tokio::test]
async fn test_cumulative_ack_unsupported_across_topics() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let consumer = client
        .subscribe_multi(&["persistent://p/c/n/only"], "multi-sub", options())
        .await
        .unwrap();
    let producer = client
        .create_producer("persistent://p/c/n/only", ProducerOptions::default())
        .await
        .unwrap();
    producer.send(ProducerMessage::new("x")).await.unwrap();

    let msg = consumer
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    // The aggregator only exposes individual acks; the shared sub-consumer
    // refuses cumulative ones anyway.
    consumer.ack(&msg).unwrap();

    consumer.close().await.unwrap();
    server.shutdown().await;
}
