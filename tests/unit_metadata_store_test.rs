use bytes::Bytes;
use driftmq::core::DriftError;
use driftmq::core::metadata::{
    MemoryMetadataStore, MetaEventKind, MetaVersion, MetadataStore,
};

#[tokio::test]
async fn test_put_get_versioning() {
    let store = MemoryMetadataStore::new();
    let v0 = store
        .put("/policies/p/c/n", Bytes::from_static(b"one"), MetaVersion::Any)
        .await
        .unwrap();
    assert_eq!(v0, 0);
    let v1 = store
        .put("/policies/p/c/n", Bytes::from_static(b"two"), MetaVersion::Exact(0))
        .await
        .unwrap();
    assert_eq!(v1, 1);
    let read = store.get("/policies/p/c/n").await.unwrap().unwrap();
    assert_eq!(read.data, Bytes::from_static(b"two"));
    assert_eq!(read.version, 1);
}

#[tokio::test]
async fn test_cas_conflict_surfaces_bad_version() {
    let store = MemoryMetadataStore::new();
    store
        .put("/k", Bytes::from_static(b"a"), MetaVersion::Any)
        .await
        .unwrap();
    let err = store
        .put("/k", Bytes::from_static(b"b"), MetaVersion::Exact(9))
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::BadVersion(_)));

    // Exact on a missing key also conflicts.
    let err = store
        .put("/missing", Bytes::from_static(b"x"), MetaVersion::Exact(0))
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::BadVersion(_)));
}

#[tokio::test]
async fn test_compare_and_create() {
    let store = MemoryMetadataStore::new();
    store
        .put("/k", Bytes::from_static(b"a"), MetaVersion::Absent)
        .await
        .unwrap();
    let err = store
        .put("/k", Bytes::from_static(b"b"), MetaVersion::Absent)
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_delete_missing_is_noop() {
    let store = MemoryMetadataStore::new();
    store.delete("/nothing", MetaVersion::Any).await.unwrap();
}

#[tokio::test]
async fn test_ephemeral_vanishes_with_session() {
    let store = MemoryMetadataStore::new();
    let session = store.create_session().await.unwrap();
    store
        .put_ephemeral("/namespace/p/c/n/b", Bytes::from_static(b"owner"), session)
        .await
        .unwrap();
    assert!(store.get("/namespace/p/c/n/b").await.unwrap().is_some());

    store.end_session(session).await.unwrap();
    assert!(store.get("/namespace/p/c/n/b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ephemeral_create_conflicts() {
    let store = MemoryMetadataStore::new();
    let s1 = store.create_session().await.unwrap();
    let s2 = store.create_session().await.unwrap();
    store
        .put_ephemeral("/claim", Bytes::from_static(b"one"), s1)
        .await
        .unwrap();
    let err = store
        .put_ephemeral("/claim", Bytes::from_static(b"two"), s2)
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_ephemeral_requires_live_session() {
    let store = MemoryMetadataStore::new();
    let session = store.create_session().await.unwrap();
    store.end_session(session).await.unwrap();
    let err = store
        .put_ephemeral("/claim", Bytes::from_static(b"x"), session)
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::SessionExpired));
}

#[tokio::test]
async fn test_session_end_does_not_remove_reclaimed_key() {
    let store = MemoryMetadataStore::new();
    let s1 = store.create_session().await.unwrap();
    let s2 = store.create_session().await.unwrap();
    store
        .put_ephemeral("/claim", Bytes::from_static(b"one"), s1)
        .await
        .unwrap();
    // The first owner releases explicitly; a second session claims.
    store.delete("/claim", MetaVersion::Any).await.unwrap();
    store
        .put_ephemeral("/claim", Bytes::from_static(b"two"), s2)
        .await
        .unwrap();
    // Ending the first session must not take out the second claim.
    store.end_session(s1).await.unwrap();
    let read = store.get("/claim").await.unwrap().unwrap();
    assert_eq!(read.data, Bytes::from_static(b"two"));
}

#[tokio::test]
async fn test_children_lists_prefix_sorted() {
    let store = MemoryMetadataStore::new();
    for key in ["/clusters/west", "/clusters/east", "/policies/p"] {
        store
            .put(key, Bytes::from_static(b"{}"), MetaVersion::Any)
            .await
            .unwrap();
    }
    let clusters = store.children("/clusters/").await.unwrap();
    assert_eq!(clusters, vec!["/clusters/east", "/clusters/west"]);
}

#[tokio::test]
async fn test_watch_sees_lifecycle_events() {
    let store = MemoryMetadataStore::new();
    let mut events = store.events();
    store
        .put("/k", Bytes::from_static(b"a"), MetaVersion::Any)
        .await
        .unwrap();
    store
        .put("/k", Bytes::from_static(b"b"), MetaVersion::Any)
        .await
        .unwrap();
    store.delete("/k", MetaVersion::Any).await.unwrap();

    let e1 = events.recv().await.unwrap();
    assert_eq!((e1.path.as_str(), e1.kind), ("/k", MetaEventKind::Created));
    let e2 = events.recv().await.unwrap();
    assert_eq!(e2.kind, MetaEventKind::Modified);
    let e3 = events.recv().await.unwrap();
    assert_eq!(e3.kind, MetaEventKind::Deleted);
}

#[tokio::test]
async fn test_concurrent_compare_and_create_has_one_winner() {
    let store = std::sync::Arc::new(MemoryMetadataStore::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let session = store.create_session().await.unwrap();
            store
                .put_ephemeral("/contended", Bytes::from(format!("claimant-{i}")), session)
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
