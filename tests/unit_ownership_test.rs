use driftmq::core::bundle::BundleRange;
use driftmq::core::metadata::{MemoryMetadataStore, MetaEventKind, MetadataStore};
use driftmq::core::ownership::{AcquireResult, BundleState, OwnershipRegistry};
use driftmq::core::topic::NamespaceName;
use std::sync::Arc;

async fn registry(
    store: &Arc<MemoryMetadataStore>,
    broker: &str,
) -> Arc<OwnershipRegistry> {
    let session = store.create_session().await.unwrap();
    Arc::new(OwnershipRegistry::new(
        store.clone(),
        session,
        format!("drift://{broker}"),
        format!("http://{broker}-web"),
    ))
}

fn ns() -> NamespaceName {
    NamespaceName::parse("p/c/n").unwrap()
}

#[tokio::test]
async fn test_acquire_then_lookup() {
    let store = Arc::new(MemoryMetadataStore::new());
    let registry = registry(&store, "b1:6650").await;
    let bundle = BundleRange::full();

    let result = registry.try_acquire(&ns(), &bundle).await.unwrap();
    assert_eq!(result, AcquireResult::Owned);
    assert_eq!(registry.local_state(&ns(), &bundle), Some(BundleState::Owned));

    let owner = registry.lookup(&ns(), &bundle).await.unwrap().unwrap();
    assert_eq!(owner.broker_service_url, "drift://b1:6650");
}

#[tokio::test]
async fn test_second_acquire_sees_already_owned() {
    let store = Arc::new(MemoryMetadataStore::new());
    let first = registry(&store, "b1:6650").await;
    let second = registry(&store, "b2:6650").await;
    let bundle = BundleRange::full();

    assert_eq!(first.try_acquire(&ns(), &bundle).await.unwrap(), AcquireResult::Owned);
    match second.try_acquire(&ns(), &bundle).await.unwrap() {
        AcquireResult::AlreadyOwned(owner) => {
            assert_eq!(owner.broker_service_url, "drift://b1:6650");
        }
        other => panic!("expected AlreadyOwned, got {other:?}"),
    }
    assert_eq!(second.local_state(&ns(), &bundle), None);
}

#[tokio::test]
async fn test_reacquire_own_surviving_claim() {
    let store = Arc::new(MemoryMetadataStore::new());
    let registry = registry(&store, "b1:6650").await;
    let bundle = BundleRange::full();
    assert_eq!(registry.try_acquire(&ns(), &bundle).await.unwrap(), AcquireResult::Owned);
    // A second acquire from the same broker is idempotent.
    assert_eq!(registry.try_acquire(&ns(), &bundle).await.unwrap(), AcquireResult::Owned);
}

#[tokio::test]
async fn test_release_clears_claim_and_is_noop_when_not_owned() {
    let store = Arc::new(MemoryMetadataStore::new());
    let registry = registry(&store, "b1:6650").await;
    let bundle = BundleRange::full();

    // Releasing something never acquired: no-op.
    registry.release(&ns(), &bundle).await.unwrap();

    registry.try_acquire(&ns(), &bundle).await.unwrap();
    registry.release(&ns(), &bundle).await.unwrap();
    assert!(registry.lookup(&ns(), &bundle).await.unwrap().is_none());
    assert_eq!(registry.local_state(&ns(), &bundle), None);
}

#[tokio::test]
async fn test_release_does_not_touch_foreign_claim() {
    let store = Arc::new(MemoryMetadataStore::new());
    let first = registry(&store, "b1:6650").await;
    let second = registry(&store, "b2:6650").await;
    let bundle = BundleRange::full();

    first.try_acquire(&ns(), &bundle).await.unwrap();
    // The losing acquire leaves no local state; a release afterwards must
    // not touch the foreign claim.
    let _ = second.try_acquire(&ns(), &bundle).await.unwrap();
    second.release(&ns(), &bundle).await.unwrap();
    let owner = first.lookup(&ns(), &bundle).await.unwrap().unwrap();
    assert_eq!(owner.broker_service_url, "drift://b1:6650");
}

#[tokio::test]
async fn test_session_loss_releases_all_claims() {
    let store = Arc::new(MemoryMetadataStore::new());
    let session = store.create_session().await.unwrap();
    let registry = Arc::new(OwnershipRegistry::new(
        store.clone(),
        session,
        "drift://b1:6650".to_string(),
        "http://b1-web".to_string(),
    ));
    let b1 = BundleRange::new(0, 0x8000_0000);
    let b2 = BundleRange::new(0x8000_0000, u32::MAX);
    registry.try_acquire(&ns(), &b1).await.unwrap();
    registry.try_acquire(&ns(), &b2).await.unwrap();

    store.end_session(session).await.unwrap();
    assert!(registry.lookup(&ns(), &b1).await.unwrap().is_none());
    assert!(registry.lookup(&ns(), &b2).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_acquire_exactly_one_owner() {
    let store = Arc::new(MemoryMetadataStore::new());
    let bundle = BundleRange::full();
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let registry = registry(&store, &format!("b{i}:6650")).await;
            registry.try_acquire(&ns(), &bundle).await.unwrap()
        }));
    }
    let mut owners = 0;
    let mut observed_owner = None;
    for handle in handles {
        match handle.await.unwrap() {
            AcquireResult::Owned => owners += 1,
            AcquireResult::AlreadyOwned(claim) => {
                // Every loser must observe the same winner.
                let url = claim.broker_service_url;
                match &observed_owner {
                    Some(existing) => assert_eq!(*existing, url),
                    None => observed_owner = Some(url),
                }
            }
        }
    }
    assert_eq!(owners, 1);
}

#[tokio::test]
async fn test_watch_reports_claim_lifecycle() {
    let store = Arc::new(MemoryMetadataStore::new());
    let registry = registry(&store, "b1:6650").await;
    let bundle = BundleRange::full();
    let mut watch = registry.watch(&ns(), &bundle);

    registry.try_acquire(&ns(), &bundle).await.unwrap();
    assert_eq!(watch.next().await, Some(MetaEventKind::Created));
    registry.release(&ns(), &bundle).await.unwrap();
    assert_eq!(watch.next().await, Some(MetaEventKind::Deleted));
}
