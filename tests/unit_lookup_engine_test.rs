use bytes::Bytes;
use driftmq::core::bundle;
use driftmq::core::load::{LoadManager, LoadReport};
use driftmq::core::lookup::{LookupAnswer, LookupEngine};
use driftmq::core::metadata::policies::{ClusterDescriptor, NamespacePolicies};
use driftmq::core::metadata::{
    MemoryMetadataStore, MetaVersion, MetadataStore, PoliciesCache, paths,
};
use driftmq::core::bundle::BundlesDescriptor;
use driftmq::core::ownership::OwnershipRegistry;
use driftmq::core::protocol::ServerError;
use driftmq::core::topic::{NamespaceName, TopicName};
use std::collections::BTreeSet;
use std::sync::Arc;

struct TestBroker {
    ownership: Arc<OwnershipRegistry>,
    load: Arc<LoadManager>,
    engine: LookupEngine,
    broker_url: String,
}

async fn broker(store: &Arc<MemoryMetadataStore>, address: &str, cluster: &str) -> TestBroker {
    let session = store.create_session().await.unwrap();
    let broker_url = format!("drift://{address}");
    let ownership = Arc::new(OwnershipRegistry::new(
        store.clone(),
        session,
        broker_url.clone(),
        format!("http://{address}-web"),
    ));
    let load = Arc::new(LoadManager::new(
        store.clone(),
        session,
        address.to_string(),
        LoadReport::new(broker_url.clone(), format!("http://{address}-web")),
    ));
    load.publish().await.unwrap();
    let policies = PoliciesCache::new(store.clone() as Arc<dyn MetadataStore>);
    let engine = LookupEngine::new(
        store.clone(),
        policies,
        ownership.clone(),
        load.clone(),
        cluster.to_string(),
        broker_url.clone(),
    );
    TestBroker {
        ownership,
        load,
        engine,
        broker_url,
    }
}

async fn create_namespace(store: &Arc<MemoryMetadataStore>, ns: &NamespaceName) {
    let policies =
        NamespacePolicies::with_bundles(BundlesDescriptor::with_default_bundles(4).unwrap());
    store
        .put(
            &paths::policies_path(ns),
            Bytes::from(serde_json::to_vec(&policies).unwrap()),
            MetaVersion::Absent,
        )
        .await
        .unwrap();
}

fn topic() -> TopicName {
    TopicName::parse("persistent://p/west/n/t").unwrap()
}

#[tokio::test]
async fn test_missing_namespace_fails() {
    let store = Arc::new(MemoryMetadataStore::new());
    let b = broker(&store, "b1:6650", "west").await;
    match b.engine.lookup(&topic(), false).await {
        LookupAnswer::Failed { error, .. } => assert_eq!(error, ServerError::MetadataError),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_broker_assigns_itself_and_converges() {
    let store = Arc::new(MemoryMetadataStore::new());
    create_namespace(&store, &topic().namespace()).await;
    let b = broker(&store, "b1:6650", "west").await;

    // The sole broker is the leader and the least-loaded candidate.
    match b.engine.lookup(&topic(), false).await {
        LookupAnswer::Connect { broker_service_url } => {
            assert_eq!(broker_service_url, b.broker_url);
        }
        other => panic!("expected Connect, got {other:?}"),
    }
    // Fixed point: the same answer again, no new assignment.
    for _ in 0..3 {
        match b.engine.lookup(&topic(), false).await {
            LookupAnswer::Connect { broker_service_url } => {
                assert_eq!(broker_service_url, b.broker_url);
            }
            other => panic!("expected stable Connect, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_owned_elsewhere_redirects_authoritative() {
    let store = Arc::new(MemoryMetadataStore::new());
    let t = topic();
    create_namespace(&store, &t.namespace()).await;
    let b1 = broker(&store, "a1:6650", "west").await;
    let b2 = broker(&store, "b2:6650", "west").await;

    // b2 claims the bundle of t directly.
    let policies = NamespacePolicies::with_bundles(BundlesDescriptor::with_default_bundles(4).unwrap());
    let bundle = policies.bundles.find_bundle(bundle::hash_of(&t));
    b2.ownership.try_acquire(&t.namespace(), &bundle).await.unwrap();

    match b1.engine.lookup(&t, false).await {
        LookupAnswer::Redirect {
            broker_service_url,
            authoritative,
            ..
        } => {
            assert_eq!(broker_service_url, b2.broker_url);
            assert!(authoritative, "redirect to the owner is authoritative");
        }
        other => panic!("expected Redirect, got {other:?}"),
    }
    // The owner itself answers Connect.
    match b2.engine.lookup(&t, true).await {
        LookupAnswer::Connect { broker_service_url } => {
            assert_eq!(broker_service_url, b2.broker_url);
        }
        other => panic!("expected Connect, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unowned_non_leader_redirects_to_leader_without_spending_budget() {
    let store = Arc::new(MemoryMetadataStore::new());
    let t = topic();
    create_namespace(&store, &t.namespace()).await;
    // Leader is the lexicographically smallest live address: a1.
    let leader = broker(&store, "a1:6650", "west").await;
    let follower = broker(&store, "b2:6650", "west").await;

    match follower.engine.lookup(&t, false).await {
        LookupAnswer::Redirect {
            broker_service_url,
            authoritative,
            ..
        } => {
            assert_eq!(broker_service_url, leader.broker_url);
            assert!(!authoritative, "leader redirect keeps authoritative=false");
        }
        other => panic!("expected Redirect to leader, got {other:?}"),
    }
}

#[tokio::test]
async fn test_leader_assigns_least_loaded_peer() {
    let store = Arc::new(MemoryMetadataStore::new());
    let t = topic();
    create_namespace(&store, &t.namespace()).await;
    let leader = broker(&store, "a1:6650", "west").await;
    let light = broker(&store, "b2:6650", "west").await;

    // Make the leader look busy so the peer wins the placement.
    leader.load.update(|r| r.topics = 100);
    leader.load.publish().await.unwrap();

    match leader.engine.lookup(&t, false).await {
        LookupAnswer::Redirect {
            broker_service_url,
            authoritative,
            ..
        } => {
            assert_eq!(broker_service_url, light.broker_url);
            assert!(authoritative, "assignment redirect is authoritative");
        }
        other => panic!("expected Redirect to least-loaded, got {other:?}"),
    }

    // The designated broker, asked authoritatively, acquires and connects.
    match light.engine.lookup(&t, true).await {
        LookupAnswer::Connect { broker_service_url } => {
            assert_eq!(broker_service_url, light.broker_url);
        }
        other => panic!("expected Connect after assignment, got {other:?}"),
    }
    // And the claim is durable: the leader now redirects to the owner.
    match leader.engine.lookup(&t, false).await {
        LookupAnswer::Redirect {
            broker_service_url, ..
        } => assert_eq!(broker_service_url, light.broker_url),
        other => panic!("expected Redirect to owner, got {other:?}"),
    }
}

#[tokio::test]
async fn test_foreign_global_namespace_redirects_cross_cluster() {
    let store = Arc::new(MemoryMetadataStore::new());
    let t = TopicName::parse("persistent://p/global/n/t").unwrap();
    let ns = t.namespace();
    let mut policies =
        NamespacePolicies::with_bundles(BundlesDescriptor::with_default_bundles(4).unwrap());
    policies.replication_clusters = BTreeSet::from(["east".to_string()]);
    store
        .put(
            &paths::policies_path(&ns),
            Bytes::from(serde_json::to_vec(&policies).unwrap()),
            MetaVersion::Absent,
        )
        .await
        .unwrap();
    store
        .put(
            &paths::cluster_path("east"),
            Bytes::from(
                serde_json::to_vec(&ClusterDescriptor {
                    service_url: "http://east:8080".to_string(),
                    service_url_tls: None,
                    broker_service_url: "drift://east:6650".to_string(),
                    broker_service_url_tls: None,
                    peer_clusters: BTreeSet::new(),
                })
                .unwrap(),
            ),
            MetaVersion::Any,
        )
        .await
        .unwrap();

    let b = broker(&store, "b1:6650", "west").await;
    match b.engine.lookup(&t, false).await {
        LookupAnswer::Redirect {
            broker_service_url,
            authoritative,
            ..
        } => {
            assert_eq!(broker_service_url, "drift://east:6650");
            assert!(!authoritative);
        }
        other => panic!("expected cross-cluster Redirect, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_cluster_resolves_on_behalf() {
    let store = Arc::new(MemoryMetadataStore::new());
    let t = TopicName::parse("persistent://p/global/n/t").unwrap();
    let ns = t.namespace();
    let mut policies =
        NamespacePolicies::with_bundles(BundlesDescriptor::with_default_bundles(4).unwrap());
    policies.replication_clusters = BTreeSet::from(["east".to_string()]);
    store
        .put(
            &paths::policies_path(&ns),
            Bytes::from(serde_json::to_vec(&policies).unwrap()),
            MetaVersion::Absent,
        )
        .await
        .unwrap();
    // The local cluster declares east as a peer, so it may resolve east's
    // topics itself.
    store
        .put(
            &paths::cluster_path("west"),
            Bytes::from(
                serde_json::to_vec(&ClusterDescriptor {
                    service_url: "http://west:8080".to_string(),
                    service_url_tls: None,
                    broker_service_url: "drift://west:6650".to_string(),
                    broker_service_url_tls: None,
                    peer_clusters: BTreeSet::from(["east".to_string()]),
                })
                .unwrap(),
            ),
            MetaVersion::Any,
        )
        .await
        .unwrap();

    let b = broker(&store, "b1:6650", "west").await;
    // Resolving locally means the unowned flow runs: the sole broker
    // assigns itself.
    match b.engine.lookup(&t, false).await {
        LookupAnswer::Connect { broker_service_url } => {
            assert_eq!(broker_service_url, b.broker_url);
        }
        other => panic!("expected local resolution, got {other:?}"),
    }
}

#[tokio::test]
async fn test_partitioned_metadata_defaults_to_zero() {
    let store = Arc::new(MemoryMetadataStore::new());
    let b = broker(&store, "b1:6650", "west").await;
    let meta = b.engine.partitioned_metadata(&topic()).await.unwrap();
    assert_eq!(meta.partitions, 0);

    store
        .put(
            &paths::partitioned_topic_path(&topic()),
            Bytes::from_static(b"{\"partitions\":5}"),
            MetaVersion::Any,
        )
        .await
        .unwrap();
    let meta = b.engine.partitioned_metadata(&topic()).await.unwrap();
    assert_eq!(meta.partitions, 5);
}
