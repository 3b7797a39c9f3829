// src/core/ownership/mod.rs

//! The bundle ownership registry.
//!
//! Ownership of a bundle is an ephemeral claim in the metadata store, keyed
//! by the bundle identity and bound to the owning broker's store session:
//! when the session dies, every claim of that broker vanishes atomically.
//! The claim write is a compare-and-create, which is what enforces the
//! at-most-one-owner invariant; no in-process lock is involved.

pub mod transition;

use crate::core::DriftError;
use crate::core::bundle::BundleRange;
use crate::core::metadata::{
    MetaEventKind, MetaVersion, MetadataStore, SessionId, paths,
};
use crate::core::topic::NamespaceName;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The value of an ownership claim: where to reach the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipClaim {
    pub broker_service_url: String,
    pub web_service_url: String,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireResult {
    /// This broker now owns the bundle.
    Owned,
    /// Another broker holds the claim.
    AlreadyOwned(OwnershipClaim),
}

/// The local lifecycle of a bundle on this broker.
///
/// `Unowned -> Acquiring -> Owned -> Releasing -> Unowned`, with the side
/// transition `Owned -> Splitting` while a split is in flight. Bundles with
/// no entry are `Unowned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Acquiring,
    Owned,
    Releasing,
    Splitting,
}

pub type BundleKey = (NamespaceName, BundleRange);

/// Tracks which bundles this broker owns, backed by ephemeral claims in the
/// metadata store.
pub struct OwnershipRegistry {
    store: Arc<dyn MetadataStore>,
    session: SessionId,
    self_claim: OwnershipClaim,
    local: DashMap<BundleKey, BundleState>,
}

impl OwnershipRegistry {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        session: SessionId,
        broker_service_url: String,
        web_service_url: String,
    ) -> Self {
        Self {
            store,
            session,
            self_claim: OwnershipClaim {
                broker_service_url,
                web_service_url,
            },
            local: DashMap::new(),
        }
    }

    pub fn self_claim(&self) -> &OwnershipClaim {
        &self.self_claim
    }

    /// The local transition state of a bundle, if any.
    pub fn local_state(&self, ns: &NamespaceName, bundle: &BundleRange) -> Option<BundleState> {
        self.local
            .get(&(ns.clone(), bundle.clone()))
            .map(|s| *s.value())
    }

    /// All bundles currently owned (or transitioning) on this broker.
    pub fn local_bundles(&self) -> Vec<BundleKey> {
        self.local.iter().map(|e| e.key().clone()).collect()
    }

    pub(crate) fn set_local_state(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
        state: BundleState,
    ) {
        self.local.insert((ns.clone(), *bundle), state);
    }

    pub(crate) fn clear_local_state(&self, ns: &NamespaceName, bundle: &BundleRange) {
        self.local.remove(&(ns.clone(), *bundle));
    }

    /// Attempts to claim a bundle via compare-and-create. At most one broker
    /// observes `Owned` for a bundle at any instant.
    pub async fn try_acquire(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
    ) -> Result<AcquireResult, DriftError> {
        let key = (ns.clone(), *bundle);
        self.local.entry(key.clone()).or_insert(BundleState::Acquiring);

        let path = paths::ownership_path(ns, bundle);
        let data = Bytes::from(serde_json::to_vec(&self.self_claim)?);
        match self.store.put_ephemeral(&path, data, self.session).await {
            Ok(()) => {
                self.local.insert(key, BundleState::Owned);
                info!("acquired ownership of {ns}/{bundle}");
                Ok(AcquireResult::Owned)
            }
            Err(DriftError::AlreadyExists(_)) => {
                self.local.remove(&key);
                match self.lookup(ns, bundle).await? {
                    Some(owner) if owner == self.self_claim => {
                        // Our own claim from a previous acquisition survived.
                        self.local.insert(key, BundleState::Owned);
                        Ok(AcquireResult::Owned)
                    }
                    Some(owner) => Ok(AcquireResult::AlreadyOwned(owner)),
                    // The competing claim vanished between the create and
                    // the read; the caller re-runs the lookup.
                    None => Err(DriftError::MetadataError(format!(
                        "ownership of {ns}/{bundle} changed mid-acquire"
                    ))),
                }
            }
            Err(e) => {
                self.local.remove(&key);
                Err(e)
            }
        }
    }

    /// Reads the current owner of a bundle, if any.
    pub async fn lookup(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
    ) -> Result<Option<OwnershipClaim>, DriftError> {
        let path = paths::ownership_path(ns, bundle);
        match self.store.get(&path).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value.data)?)),
            None => Ok(None),
        }
    }

    /// Releases a bundle claim. Releasing a bundle this broker does not own
    /// is a no-op.
    pub async fn release(&self, ns: &NamespaceName, bundle: &BundleRange) -> Result<(), DriftError> {
        let key = (ns.clone(), *bundle);
        if self.local.get(&key).is_none() {
            debug!("release of {ns}/{bundle} skipped: not locally owned");
            return Ok(());
        }
        self.local.insert(key.clone(), BundleState::Releasing);

        let path = paths::ownership_path(ns, bundle);
        // Only delete our own claim; a foreign claim means the store already
        // reassigned the bundle (e.g. after a session bounce).
        match self.lookup(ns, bundle).await? {
            Some(owner) if owner == self.self_claim => {
                self.store.delete(&path, MetaVersion::Any).await?;
                info!("released ownership of {ns}/{bundle}");
            }
            Some(_) => warn!("skipping release of {ns}/{bundle}: owned by another broker"),
            None => {}
        }
        self.local.remove(&key);
        Ok(())
    }

    /// Releases every bundle this broker holds, used on graceful shutdown.
    pub async fn release_all(&self) -> Result<(), DriftError> {
        for (ns, bundle) in self.local_bundles() {
            self.release(&ns, &bundle).await?;
        }
        Ok(())
    }

    /// Watches ownership changes of one bundle.
    pub fn watch(&self, ns: &NamespaceName, bundle: &BundleRange) -> OwnershipWatch {
        OwnershipWatch {
            path: paths::ownership_path(ns, bundle),
            events: self.store.events(),
        }
    }
}

/// A subscription to the ownership changes of a single bundle.
pub struct OwnershipWatch {
    path: String,
    events: tokio::sync::broadcast::Receiver<crate::core::metadata::MetaEvent>,
}

impl OwnershipWatch {
    /// Waits for the next change to the watched claim. Returns `None` when
    /// the store shuts down.
    pub async fn next(&mut self) -> Option<MetaEventKind> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.path == self.path => return Some(event.kind),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
