use driftmq::DriftClient;
use driftmq::client::{ConsumerOptions, ProducerMessage, ProducerOptions};
use driftmq::config::BrokerConfig;
use driftmq::core::metadata::MemoryMetadataStore;
use driftmq::core::protocol::SubType;
use driftmq::core::topic::NamespaceName;
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

#[tokio::test]
async fn test_unacked_messages_redeliver_after_timeout() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let topic = "persistent://p/c/n/redelivery";

    let consumer = client
        .subscribe(
            topic,
            "sub",
            ConsumerOptions {
                sub_type: SubType::Shared,
                ack_timeout: Some(Duration::from_millis(600)),
                ..ConsumerOptions::default()
            },
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(topic, ProducerOptions::default())
        .await
        .unwrap();

    for i in 0..20 {
        producer
            .send(ProducerMessage::new(format!("m-{i}")))
            .await
            .unwrap();
    }

    // First pass: receive everything, acknowledge nothing.
    let mut first_ids = BTreeSet::new();
    for _ in 0..20 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(msg.redelivery_count, 0);
        first_ids.insert(msg.message_id);
    }
    assert_eq!(first_ids.len(), 20);

    // After the ack timeout, the same twenty ids come back exactly once.
    let mut second_ids = BTreeSet::new();
    for _ in 0..20 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(msg.redelivery_count, 1);
        second_ids.insert(msg.message_id);
        // Acknowledge on the second pass to stop the cycle.
        consumer.ack(&msg).unwrap();
    }
    assert_eq!(first_ids, second_ids);

    // Nothing further: every message is acked now.
    let extra = consumer.receive_timeout(Duration::from_millis(400)).await;
    assert!(extra.is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn test_explicit_redelivery_request() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let topic = "persistent://p/c/n/explicit-redelivery";

    let consumer = client
        .subscribe(
            topic,
            "sub",
            ConsumerOptions {
                sub_type: SubType::Shared,
                ..ConsumerOptions::default()
            },
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(topic, ProducerOptions::default())
        .await
        .unwrap();
    for i in 0..5 {
        producer
            .send(ProducerMessage::new(format!("m-{i}")))
            .await
            .unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..5 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        ids.push(msg.message_id);
    }

    // Ask for two specific messages again.
    consumer.redeliver_messages(vec![ids[1], ids[3]]);
    let mut redelivered = BTreeSet::new();
    for _ in 0..2 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(msg.redelivery_count, 1);
        redelivered.insert(msg.message_id);
        consumer.ack(&msg).unwrap();
    }
    assert_eq!(
        redelivered,
        BTreeSet::from([ids[1], ids[3]]),
        "exactly the requested ids redeliver"
    );

    server.shutdown().await;
}
