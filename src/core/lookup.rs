// src/core/lookup.rs

//! The lookup engine: resolves a topic name to the broker that owns its
//! bundle.
//!
//! Any broker can answer a lookup. The answer is a value, never an error
//! used for control flow: `Connect` (the asked broker owns the bundle),
//! `Redirect` (ask that broker instead), or `Failed`. Unowned bundles are
//! assigned by the designated leader so concurrent lookups cannot race two
//! brokers into claiming the same bundle; the `authoritative` flag caps how
//! often a client can be bounced.

use crate::core::DriftError;
use crate::core::bundle::{self, BundleRange};
use crate::core::load::LoadManager;
use crate::core::metadata::policies::{ClusterDescriptor, PartitionedTopicMetadata};
use crate::core::metadata::{MetadataStore, PoliciesCache, paths};
use crate::core::ownership::{AcquireResult, BundleState, OwnershipRegistry};
use crate::core::protocol::ServerError;
use crate::core::topic::TopicName;
use std::sync::Arc;
use tracing::{debug, info};

/// The routing answer of one lookup request.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupAnswer {
    Connect {
        broker_service_url: String,
    },
    Redirect {
        broker_service_url: String,
        authoritative: bool,
        /// Keep connecting through the original service URL and only switch
        /// the logical broker; set when a proxy fronts the cluster.
        proxy_through_service_url: bool,
    },
    Failed {
        error: ServerError,
        message: String,
    },
}

impl LookupAnswer {
    fn failed(error: ServerError, message: impl Into<String>) -> Self {
        LookupAnswer::Failed {
            error,
            message: message.into(),
        }
    }
}

/// Per-broker lookup engine.
pub struct LookupEngine {
    store: Arc<dyn MetadataStore>,
    policies: Arc<PoliciesCache>,
    ownership: Arc<OwnershipRegistry>,
    load: Arc<LoadManager>,
    /// The cluster this broker belongs to.
    cluster_name: String,
    broker_service_url: String,
}

impl LookupEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        policies: Arc<PoliciesCache>,
        ownership: Arc<OwnershipRegistry>,
        load: Arc<LoadManager>,
        cluster_name: String,
        broker_service_url: String,
    ) -> Self {
        Self {
            store,
            policies,
            ownership,
            load,
            cluster_name,
            broker_service_url,
        }
    }

    /// Resolves a topic to its owner. `authoritative` is the client-supplied
    /// flag: true means a previous responder designated this broker as the
    /// assigner.
    pub async fn lookup(&self, topic: &TopicName, authoritative: bool) -> LookupAnswer {
        let ns = topic.namespace();
        let policies = match self.policies.get(&ns).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                return LookupAnswer::failed(
                    ServerError::MetadataError,
                    format!("namespace {ns} does not exist"),
                );
            }
            Err(e) => {
                return LookupAnswer::failed(ServerError::MetadataError, e.to_string());
            }
        };

        // Cross-cluster routing for global namespaces this cluster does not
        // replicate: resolve here only on behalf of a peer, otherwise hand
        // the client to a replication cluster.
        if topic.is_global() && !policies.replication_clusters.contains(&self.cluster_name) {
            match self.cross_cluster_answer(&policies.replication_clusters).await {
                CrossCluster::ResolveLocally => {}
                CrossCluster::Answer(answer) => return answer,
            }
        }

        let hash = bundle::hash_of(topic);
        let bundle = policies.bundles.find_bundle(hash);
        debug!("lookup {topic}: hash 0x{hash:08x} -> bundle {bundle}");

        // A bundle mid-unload or mid-split must not answer Connect; bounce
        // the client without consuming its authoritative budget.
        if matches!(
            self.ownership.local_state(&ns, &bundle),
            Some(BundleState::Releasing) | Some(BundleState::Splitting)
        ) {
            return self.redirect_to_leader().await;
        }

        match self.ownership.lookup(&ns, &bundle).await {
            Ok(Some(owner)) => {
                if owner.broker_service_url == self.broker_service_url {
                    LookupAnswer::Connect {
                        broker_service_url: self.broker_service_url.clone(),
                    }
                } else {
                    LookupAnswer::Redirect {
                        broker_service_url: owner.broker_service_url,
                        authoritative: true,
                        proxy_through_service_url: false,
                    }
                }
            }
            Ok(None) => self.assign_unowned(topic, &bundle, authoritative).await,
            Err(e) => LookupAnswer::failed(ServerError::MetadataError, e.to_string()),
        }
    }

    /// The unowned-bundle branch: non-authoritative requests go to the
    /// leader; the leader (or an authoritative request) assigns the
    /// least-loaded broker.
    async fn assign_unowned(
        &self,
        topic: &TopicName,
        bundle: &BundleRange,
        authoritative: bool,
    ) -> LookupAnswer {
        let reports = match self.load.live_brokers().await {
            Ok(reports) => reports,
            Err(e) => return LookupAnswer::failed(ServerError::MetadataError, e.to_string()),
        };
        let Some((leader_addr, leader_report)) = LoadManager::leader(&reports) else {
            return LookupAnswer::failed(
                ServerError::ServiceNotReady,
                "no live brokers in the load-report set",
            );
        };
        let self_is_leader = *leader_addr == self.load.broker_address();

        if !authoritative && !self_is_leader {
            // Deterministic assignment happens on the leader; send the
            // client there without spending its authoritative budget.
            return LookupAnswer::Redirect {
                broker_service_url: leader_report.broker_service_url.clone(),
                authoritative: false,
                proxy_through_service_url: false,
            };
        }

        let Some((candidate_addr, candidate_report)) = LoadManager::least_loaded(&reports) else {
            return LookupAnswer::failed(
                ServerError::ServiceNotReady,
                "no live brokers in the load-report set",
            );
        };

        if *candidate_addr == self.load.broker_address() {
            let ns = topic.namespace();
            match self.ownership.try_acquire(&ns, bundle).await {
                Ok(AcquireResult::Owned) => {
                    info!("assigned bundle {ns}/{bundle} to self during lookup of {topic}");
                    LookupAnswer::Connect {
                        broker_service_url: self.broker_service_url.clone(),
                    }
                }
                Ok(AcquireResult::AlreadyOwned(owner)) => LookupAnswer::Redirect {
                    broker_service_url: owner.broker_service_url,
                    authoritative: true,
                    proxy_through_service_url: false,
                },
                Err(e) => LookupAnswer::failed(ServerError::MetadataError, e.to_string()),
            }
        } else {
            LookupAnswer::Redirect {
                broker_service_url: candidate_report.broker_service_url.clone(),
                authoritative: true,
                proxy_through_service_url: false,
            }
        }
    }

    async fn redirect_to_leader(&self) -> LookupAnswer {
        let reports = match self.load.live_brokers().await {
            Ok(reports) => reports,
            Err(e) => return LookupAnswer::failed(ServerError::MetadataError, e.to_string()),
        };
        match LoadManager::leader(&reports) {
            Some((addr, report)) if *addr != self.load.broker_address() => {
                LookupAnswer::Redirect {
                    broker_service_url: report.broker_service_url.clone(),
                    authoritative: false,
                    proxy_through_service_url: false,
                }
            }
            // This broker is the leader (or alone); the client must retry
            // once the transition finishes.
            _ => LookupAnswer::failed(
                ServerError::ServiceNotReady,
                "bundle ownership is in transition",
            ),
        }
    }

    /// Decides the cross-cluster answer for a global namespace this cluster
    /// does not replicate.
    async fn cross_cluster_answer(
        &self,
        replication_clusters: &std::collections::BTreeSet<String>,
    ) -> CrossCluster {
        if replication_clusters.is_empty() {
            return CrossCluster::Answer(LookupAnswer::failed(
                ServerError::MetadataError,
                "global namespace has no replication clusters",
            ));
        }

        // If any replication cluster is a peer of ours, this broker resolves
        // on the peer's behalf.
        if let Ok(Some(own)) = self.cluster(&self.cluster_name).await
            && replication_clusters
                .iter()
                .any(|c| own.peer_clusters.contains(c))
        {
            return CrossCluster::ResolveLocally;
        }

        // Otherwise redirect to the first replication cluster with a
        // resolvable descriptor.
        for name in replication_clusters {
            if let Ok(Some(descriptor)) = self.cluster(name).await {
                return CrossCluster::Answer(LookupAnswer::Redirect {
                    broker_service_url: descriptor.broker_service_url,
                    authoritative: false,
                    proxy_through_service_url: false,
                });
            }
        }
        CrossCluster::Answer(LookupAnswer::failed(
            ServerError::MetadataError,
            "no reachable replication cluster",
        ))
    }

    async fn cluster(&self, name: &str) -> Result<Option<ClusterDescriptor>, DriftError> {
        match self.store.get(&paths::cluster_path(name)).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value.data)?)),
            None => Ok(None),
        }
    }

    /// Reads the partitioned-topic metadata of a base topic; absent means
    /// not partitioned.
    pub async fn partitioned_metadata(
        &self,
        topic: &TopicName,
    ) -> Result<PartitionedTopicMetadata, DriftError> {
        match self.store.get(&paths::partitioned_topic_path(topic)).await? {
            Some(value) => Ok(serde_json::from_slice(&value.data)?),
            None => Ok(PartitionedTopicMetadata { partitions: 0 }),
        }
    }
}

enum CrossCluster {
    ResolveLocally,
    Answer(LookupAnswer),
}
