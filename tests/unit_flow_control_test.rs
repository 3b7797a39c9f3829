use driftmq::DriftClient;
use driftmq::client::{ConsumerOptions, ProducerMessage, ProducerOptions};
use driftmq::config::BrokerConfig;
use driftmq::core::metadata::MemoryMetadataStore;
use driftmq::core::protocol::SubType;
use driftmq::core::topic::NamespaceName;
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
async fn test_unacked_cap_pauses_flow_and_acks_resume_it() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();
    let topic = "persistent://p/c/n/flow";

    const QUEUE: usize = 4;
    const MAX_UNACKED: usize = 4;
    let consumer = client
        .subscribe(
            topic,
            "sub",
            ConsumerOptions {
                sub_type: SubType::Shared,
                receiver_queue_size: QUEUE,
                max_unacked_messages: MAX_UNACKED,
                ..ConsumerOptions::default()
            },
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(topic, ProducerOptions::default())
        .await
        .unwrap();
    for i in 0..16 {
        producer
            .send(ProducerMessage::new(format!("f-{i}")))
            .await
            .unwrap();
    }

    // Without acks, delivery stalls: the client stops granting permits
    // once the unacked tracker hits the cap.
    let mut held = Vec::new();
    loop {
        match consumer.receive_timeout(Duration::from_millis(800)).await {
            Ok(msg) => held.push(msg),
            Err(_) => break,
        }
    }
    assert!(
        held.len() <= QUEUE + MAX_UNACKED,
        "delivered - acked must stay within receiverQueueSize + maxUnacked, got {}",
        held.len()
    );
    assert!(held.len() >= MAX_UNACKED, "the initial permit window delivers");
    assert_eq!(consumer.unacked_count(), held.len());

    // Acking drains the tracker and flow resumes until all 16 arrive.
    let mut received = held.len();
    for msg in &held {
        consumer.ack(msg).unwrap();
    }
    while received < 16 {
        let msg = consumer
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        consumer.ack(&msg).unwrap();
        received += 1;
    }
    assert_eq!(consumer.unacked_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_producer_queue_full_fails_fast_without_block() {
    let (server, url) = start_broker().await;
    let client = DriftClient::builder(&url)
        .operation_timeout(Duration::from_secs(5))
        .build();

    let producer = client
        .create_producer(
            "persistent://p/c/n/backpressure",
            ProducerOptions {
                max_pending_messages: 2,
                block_if_full: false,
                ..ProducerOptions::default()
            },
        )
        .await
        .unwrap();

    // Fire sends without awaiting receipts until the pending queue refuses.
    let mut receipts = Vec::new();
    let mut saw_full = false;
    for i in 0..64 {
        match producer
            .send_async(ProducerMessage::new(format!("p-{i}")))
            .await
        {
            Ok(receipt) => receipts.push(receipt),
            Err(driftmq::DriftError::ProducerQueueIsFull) => {
                saw_full = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(saw_full, "the bounded pending queue must eventually refuse");

    for receipt in receipts {
        receipt.await.unwrap().unwrap();
    }
    server.shutdown().await;
}
