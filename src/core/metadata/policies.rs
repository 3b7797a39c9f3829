// src/core/metadata/policies.rs

//! Versioned records persisted in the metadata store: namespace policies,
//! cluster descriptors, local overrides, and partitioned-topic metadata.
//! All of them are JSON values mutated only through compare-and-set on the
//! record's store version.

use crate::core::bundle::BundlesDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What a role is allowed to do in a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    Produce,
    Consume,
    Lookup,
}

/// How subscription names are authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionAuthMode {
    #[default]
    None,
    Prefix,
}

/// Retention of acknowledged messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub size_mb: i64,
    pub time_minutes: i64,
}

/// Durability parameters handed to the storage layer when a topic's ledger
/// is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistencePolicy {
    pub ensemble_size: u32,
    pub write_quorum: u32,
    pub ack_quorum: u32,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            ensemble_size: 2,
            write_quorum: 2,
            ack_quorum: 2,
        }
    }
}

/// Per-namespace dispatch throttle overrides, consumed by the dispatch-rate
/// hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRate {
    pub msgs_per_second: u64,
    pub bytes_per_second: u64,
}

/// What happens when a subscription backlog exceeds its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogRetentionPolicy {
    #[default]
    ProducerRequestHold,
    ProducerException,
    ConsumerBacklogEviction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogQuota {
    pub limit_bytes: i64,
    pub policy: BacklogRetentionPolicy,
}

/// The versioned policy record of a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespacePolicies {
    pub bundles: BundlesDescriptor,
    /// Clusters the namespace is replicated to; relevant for global
    /// namespaces.
    #[serde(default)]
    pub replication_clusters: BTreeSet<String>,
    #[serde(default)]
    pub message_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub deduplication_enabled: bool,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub persistence: PersistencePolicy,
    #[serde(default)]
    pub dispatch_rate: Option<DispatchRate>,
    #[serde(default)]
    pub backlog_quota: Option<BacklogQuota>,
    #[serde(default)]
    pub subscription_auth_mode: SubscriptionAuthMode,
    #[serde(default)]
    pub encryption_required: bool,
    /// Role name to granted actions.
    #[serde(default)]
    pub auth_policies: BTreeMap<String, BTreeSet<AuthAction>>,
    /// Tombstone set before the record is removed; lookups treat a deleted
    /// namespace as absent.
    #[serde(default)]
    pub deleted: bool,
}

impl NamespacePolicies {
    pub fn with_bundles(bundles: BundlesDescriptor) -> Self {
        Self {
            bundles,
            replication_clusters: BTreeSet::new(),
            message_ttl_seconds: None,
            deduplication_enabled: false,
            retention: RetentionPolicy::default(),
            persistence: PersistencePolicy::default(),
            dispatch_rate: None,
            backlog_quota: None,
            subscription_auth_mode: SubscriptionAuthMode::default(),
            encryption_required: false,
            auth_policies: BTreeMap::new(),
            deleted: false,
        }
    }
}

/// Cluster-local overrides; currently the locally assigned bundle layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPolicies {
    pub bundles: BundlesDescriptor,
}

/// The descriptor of one cluster, used for cross-cluster redirects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub service_url: String,
    #[serde(default)]
    pub service_url_tls: Option<String>,
    pub broker_service_url: String,
    #[serde(default)]
    pub broker_service_url_tls: Option<String>,
    /// Clusters whose topics this cluster may resolve on behalf of.
    #[serde(default)]
    pub peer_clusters: BTreeSet<String>,
}

/// Metadata of a partitioned topic. `partitions == 0` means the topic is
/// not partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedTopicMetadata {
    pub partitions: u32,
}
