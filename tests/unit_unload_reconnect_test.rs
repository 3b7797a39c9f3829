use driftmq::DriftClient;
use driftmq::client::{ConsumerOptions, ProducerMessage, ProducerOptions};
use driftmq::config::BrokerConfig;
use driftmq::core::bundle;
use driftmq::core::metadata::MemoryMetadataStore;
use driftmq::core::ownership::transition::SplitAlgorithm;
use driftmq::core::topic::{NamespaceName, TopicName};
use driftmq::server::BrokerServer;
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
async fn test_unload_triggers_transparent_reconnect() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let topic_str = "persistent://p/c/n/moving";
    let topic = TopicName::parse(topic_str).unwrap();
    let ns = topic.namespace();

    let consumer = client
        .subscribe(topic_str, "sub", ConsumerOptions::default())
        .await
        .unwrap();
    let producer = client
        .create_producer(topic_str, ProducerOptions::default())
        .await
        .unwrap();

    for i in 0..5 {
        producer
            .send(ProducerMessage::new(format!("pre-{i}")))
            .await
            .unwrap();
    }
    for i in 0..5 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(msg.payload, bytes::Bytes::from(format!("pre-{i}")));
        consumer.ack(&msg).unwrap();
    }

    // Admin unloads the bundle: clients get close commands, the claim
    // drops, and the next lookup reassigns it (to the same sole broker).
    let policies = server.state.policies.get(&ns).await.unwrap().unwrap();
    let target = policies.bundles.find_bundle(bundle::hash_of(&topic));
    server.state.transitions.unload(&ns, &target).await.unwrap();

    // Producing continues once the producer's reconnect loop lands.
    for i in 0..5 {
        producer
            .send(ProducerMessage::new(format!("post-{i}")))
            .await
            .unwrap();
    }
    // The consumer resumes from its persisted cursor: no loss, no
    // duplicates, order preserved.
    for i in 0..5 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(msg.payload, bytes::Bytes::from(format!("post-{i}")));
        consumer.ack(&msg).unwrap();
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_split_mid_stream_keeps_delivery_ordered() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let topic_str = "persistent://p/c/n/split-stream";
    let topic = TopicName::parse(topic_str).unwrap();
    let ns = topic.namespace();

    let consumer = client
        .subscribe(topic_str, "sub", ConsumerOptions::default())
        .await
        .unwrap();
    let producer = client
        .create_producer(topic_str, ProducerOptions::default())
        .await
        .unwrap();

    for i in 0..50 {
        producer
            .send(ProducerMessage::new(format!("n-{i}")))
            .await
            .unwrap();
    }

    // Split the owning bundle mid-stream: only routing changes, the topic
    // stays resident on the same broker.
    let policies = server.state.policies.get(&ns).await.unwrap().unwrap();
    let target = policies.bundles.find_bundle(bundle::hash_of(&topic));
    server
        .state
        .transitions
        .split(&ns, &target, SplitAlgorithm::RangeMidpoint, false)
        .await
        .unwrap();

    for i in 50..100 {
        producer
            .send(ProducerMessage::new(format!("n-{i}")))
            .await
            .unwrap();
    }

    // All 100 messages, in order, exactly once.
    for i in 0..100 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(msg.payload, bytes::Bytes::from(format!("n-{i}")));
        consumer.ack(&msg).unwrap();
    }
    let extra = consumer.receive_timeout(Duration::from_millis(300)).await;
    assert!(extra.is_err(), "no duplicate deliveries after the split");

    server.shutdown().await;
}
