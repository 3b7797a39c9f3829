use bytes::Bytes;
use driftmq::core::dynconfig::{BROKER_CONFIG_PATH, DynamicBrokerConfig};
use driftmq::core::metadata::{MemoryMetadataStore, MetaVersion, MetadataStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_typed_setters_apply_known_keys() {
    let dynamic = DynamicBrokerConfig::new(Duration::from_secs(60), Duration::from_secs(30));
    assert_eq!(dynamic.load_report_interval(), Duration::from_secs(60));

    dynamic
        .apply(
            "load_report_interval_ms",
            &serde_json::Value::from(5000u64),
        )
        .unwrap();
    assert_eq!(dynamic.load_report_interval(), Duration::from_secs(5));

    dynamic
        .apply("keep_alive_interval_ms", &serde_json::Value::from(1000u64))
        .unwrap();
    assert_eq!(dynamic.keep_alive_interval(), Duration::from_secs(1));

    // Unknown keys are ignored, wrongly typed values are rejected.
    dynamic
        .apply("no_such_setting", &serde_json::Value::from(1u64))
        .unwrap();
    assert!(
        dynamic
            .apply("load_report_interval_ms", &serde_json::Value::from("fast"))
            .is_err()
    );
}

#[tokio::test]
async fn test_watch_applies_record_updates() {
    let store = Arc::new(MemoryMetadataStore::new());
    let dynamic = Arc::new(DynamicBrokerConfig::new(
        Duration::from_secs(60),
        Duration::from_secs(30),
    ));
    dynamic.spawn_watcher(store.clone() as Arc<dyn MetadataStore>);

    store
        .put(
            BROKER_CONFIG_PATH,
            Bytes::from_static(b"{\"load_report_interval_ms\": 2500}"),
            MetaVersion::Any,
        )
        .await
        .unwrap();

    // The watcher applies asynchronously; poll briefly.
    for _ in 0..50 {
        if dynamic.load_report_interval() == Duration::from_millis(2500) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(dynamic.load_report_interval(), Duration::from_millis(2500));
    // The untouched field keeps its value.
    assert_eq!(dynamic.keep_alive_interval(), Duration::from_secs(30));
}
