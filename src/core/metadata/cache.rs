// src/core/metadata/cache.rs

//! A coherent read-through cache for namespace policies.
//!
//! Lookups are hot-path reads of the bundles descriptor, so policies are
//! cached per namespace and invalidated by store change notifications.
//! Entries are `Arc`-shared snapshots: a reader keeps its snapshot while an
//! invalidation swaps the slot underneath it.

use crate::core::DriftError;
use crate::core::metadata::paths;
use crate::core::metadata::policies::NamespacePolicies;
use crate::core::metadata::{MetaVersion, MetadataStore};
use crate::core::topic::NamespaceName;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many compare-and-set attempts a policy mutation makes before the
/// conflict is surfaced to the caller.
pub const MAX_CAS_ATTEMPTS: usize = 5;

pub struct PoliciesCache {
    store: Arc<dyn MetadataStore>,
    cache: DashMap<NamespaceName, Arc<NamespacePolicies>>,
}

impl PoliciesCache {
    pub fn new(store: Arc<dyn MetadataStore>) -> Arc<Self> {
        let cache = Arc::new(Self {
            store,
            cache: DashMap::new(),
        });
        cache.clone().spawn_invalidation_task();
        cache
    }

    /// Reads the policies of a namespace through the cache. A deleted
    /// (tombstoned) namespace reads as absent.
    pub async fn get(
        &self,
        ns: &NamespaceName,
    ) -> Result<Option<Arc<NamespacePolicies>>, DriftError> {
        if let Some(cached) = self.cache.get(ns) {
            return Ok(Some(cached.value().clone()));
        }
        let Some(value) = self.store.get(&paths::policies_path(ns)).await? else {
            return Ok(None);
        };
        let policies: NamespacePolicies = serde_json::from_slice(&value.data)?;
        if policies.deleted {
            return Ok(None);
        }
        let shared = Arc::new(policies);
        self.cache.insert(ns.clone(), shared.clone());
        Ok(Some(shared))
    }

    /// Mutates the policies of a namespace under compare-and-set, retrying a
    /// bounded number of times on version conflicts. The mutation closure
    /// runs against a fresh read each attempt.
    pub async fn update<F>(&self, ns: &NamespaceName, mutate: F) -> Result<(), DriftError>
    where
        F: Fn(&mut NamespacePolicies) -> Result<(), DriftError>,
    {
        let path = paths::policies_path(ns);
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.get(&path).await? else {
                return Err(DriftError::NotFound(format!("namespace {ns}")));
            };
            let mut policies: NamespacePolicies = serde_json::from_slice(&current.data)?;
            mutate(&mut policies)?;
            let encoded = Bytes::from(serde_json::to_vec(&policies)?);
            match self
                .store
                .put(&path, encoded, MetaVersion::Exact(current.version))
                .await
            {
                Ok(_) => {
                    // Drop the stale snapshot now rather than waiting for
                    // the notification to arrive.
                    self.cache.remove(ns);
                    return Ok(());
                }
                Err(DriftError::BadVersion(_)) => {
                    debug!("policies CAS conflict on {ns}, attempt {attempt}");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DriftError::BadVersion(path))
    }

    /// Creates the policy record of a new namespace.
    pub async fn create(
        &self,
        ns: &NamespaceName,
        policies: &NamespacePolicies,
    ) -> Result<(), DriftError> {
        let encoded = Bytes::from(serde_json::to_vec(policies)?);
        self.store
            .put(&paths::policies_path(ns), encoded, MetaVersion::Absent)
            .await?;
        Ok(())
    }

    fn spawn_invalidation_task(self: Arc<Self>) {
        let mut events = self.store.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(rest) = event.path.strip_prefix("/policies/")
                            && let Ok(ns) = NamespaceName::parse(rest)
                        {
                            self.cache.remove(&ns);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Missed notifications: the cache can no longer tell
                        // which namespaces changed, so drop everything.
                        warn!("policies watch lagged by {n} events, clearing cache");
                        self.cache.clear();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
