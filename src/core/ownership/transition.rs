// src/core/ownership/transition.rs

//! Bundle transitions: unload and split.
//!
//! Both operations move a bundle through the local lifecycle while keeping
//! the global invariant intact: no observer may ever see the old bundle and
//! a new sub-bundle owned at the same time. The ordering that guarantees it:
//! the policies compare-and-set lands first, then the old claim is dropped,
//! and only then are sub-bundle claims created.

use crate::core::DriftError;
use crate::core::bundle::BundleRange;
use crate::core::metadata::PoliciesCache;
use crate::core::ownership::{AcquireResult, BundleState, OwnershipRegistry};
use crate::core::topic::NamespaceName;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// How the split point of a bundle is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitAlgorithm {
    /// Midpoint of the hash range.
    #[default]
    RangeMidpoint,
    /// Median of the hashes of the topics currently in the bundle, so each
    /// half carries roughly the same topic count.
    TopicCountEqually,
}

/// The broker-side hook the transition machine drives: evicting the clients
/// of a bundle before its claim is dropped, and enumerating resident topic
/// hashes for count-based splits.
#[async_trait]
pub trait BundleTopics: Send + Sync {
    /// Closes all producers, consumers and subscriptions on topics in the
    /// bundle (clients receive `CloseProducer`/`CloseConsumer` and will
    /// re-lookup), then flushes durable state.
    async fn evict_bundle(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
    ) -> Result<(), DriftError>;

    /// Ring positions of the topics currently resident in the bundle.
    async fn topic_hashes(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
    ) -> Result<Vec<u32>, DriftError>;
}

/// Orchestrates bundle unload and split on the owning broker.
pub struct BundleTransitions {
    policies: Arc<PoliciesCache>,
    ownership: Arc<OwnershipRegistry>,
    topics: Arc<dyn BundleTopics>,
}

impl BundleTransitions {
    pub fn new(
        policies: Arc<PoliciesCache>,
        ownership: Arc<OwnershipRegistry>,
        topics: Arc<dyn BundleTopics>,
    ) -> Self {
        Self {
            policies,
            ownership,
            topics,
        }
    }

    /// Unloads an owned bundle: evicts its clients, then drops the claim so
    /// the next lookup reassigns it. While the bundle is `Releasing`,
    /// lookups answer with a non-authoritative redirect instead of
    /// `Connect`.
    pub async fn unload(&self, ns: &NamespaceName, bundle: &BundleRange) -> Result<(), DriftError> {
        match self.ownership.local_state(ns, bundle) {
            Some(BundleState::Owned) => {}
            other => {
                return Err(DriftError::PreconditionFailed(format!(
                    "cannot unload {ns}/{bundle}: local state {other:?}"
                )));
            }
        }
        self.ownership
            .set_local_state(ns, bundle, BundleState::Releasing);
        info!("unloading bundle {ns}/{bundle}");

        if let Err(e) = self.topics.evict_bundle(ns, bundle).await {
            // Roll back so the bundle keeps serving rather than wedging.
            self.ownership.set_local_state(ns, bundle, BundleState::Owned);
            return Err(e);
        }
        self.ownership.release(ns, bundle).await
    }

    /// Splits an owned bundle in two. The namespace bundles descriptor is
    /// updated first via compare-and-set (bounded retries inside the
    /// policies cache), then ownership moves from the old bundle to the new
    /// halves. With `unload_after`, the new halves are immediately released
    /// so the next lookup spreads them across the cluster.
    pub async fn split(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
        algorithm: SplitAlgorithm,
        unload_after: bool,
    ) -> Result<(BundleRange, BundleRange), DriftError> {
        match self.ownership.local_state(ns, bundle) {
            Some(BundleState::Owned) => {}
            other => {
                return Err(DriftError::PreconditionFailed(format!(
                    "cannot split {ns}/{bundle}: local state {other:?}"
                )));
            }
        }
        self.ownership
            .set_local_state(ns, bundle, BundleState::Splitting);

        let point = match self.split_point(ns, bundle, algorithm).await {
            Ok(point) => point,
            Err(e) => {
                self.ownership.set_local_state(ns, bundle, BundleState::Owned);
                return Err(e);
            }
        };
        let lower = BundleRange::new(bundle.lo, point);
        let upper = BundleRange::new(point, bundle.hi);
        info!("splitting bundle {ns}/{bundle} into {lower} and {upper}");

        // Step 1: the descriptor change. After this lands, every fresh
        // lookup routes against the new halves.
        let update = self
            .policies
            .update(ns, |policies| {
                policies.bundles = policies.bundles.split(bundle, point)?;
                Ok(())
            })
            .await;
        if let Err(e) = update {
            self.ownership.set_local_state(ns, bundle, BundleState::Owned);
            return Err(e);
        }

        // Step 2: ownership handover. The old claim must be gone before any
        // sub-bundle claim exists.
        self.ownership.release(ns, bundle).await?;
        for half in [&lower, &upper] {
            match self.ownership.try_acquire(ns, half).await {
                Ok(AcquireResult::Owned) => {
                    if unload_after {
                        self.ownership.release(ns, half).await?;
                    }
                }
                Ok(AcquireResult::AlreadyOwned(owner)) => {
                    warn!(
                        "sub-bundle {ns}/{half} was claimed by {} during split",
                        owner.broker_service_url
                    );
                }
                Err(e) => {
                    // Leave the half unowned; the next lookup assigns it.
                    warn!("failed to acquire sub-bundle {ns}/{half} after split: {e}");
                }
            }
        }
        Ok((lower, upper))
    }

    async fn split_point(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
        algorithm: SplitAlgorithm,
    ) -> Result<u32, DriftError> {
        match algorithm {
            SplitAlgorithm::RangeMidpoint => Ok(bundle.midpoint()),
            SplitAlgorithm::TopicCountEqually => {
                let mut hashes = self.topics.topic_hashes(ns, bundle).await?;
                if hashes.len() < 2 {
                    // Too few topics to balance; fall back to the midpoint.
                    return Ok(bundle.midpoint());
                }
                hashes.sort_unstable();
                let median = hashes[hashes.len() / 2];
                if median <= bundle.lo || median >= bundle.hi {
                    return Ok(bundle.midpoint());
                }
                Ok(median)
            }
        }
    }
}
