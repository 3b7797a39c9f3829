// src/core/broker/mod.rs

//! Broker-side runtime state: the topics hub, the pluggable auth and
//! publish-hook seams, and the container wiring every core component
//! together for the server loop.

pub mod store;
pub mod subscription;
pub mod topic_state;

use crate::config::BrokerConfig;
use crate::core::DriftError;
use crate::core::broker::store::{MemoryTopicLog, Position, TopicStore};
use crate::core::broker::topic_state::BrokerTopic;
use crate::core::bundle::{self, BundleRange};
use crate::core::load::{LoadManager, LoadReport};
use crate::core::lookup::LookupEngine;
use crate::core::metadata::policies::{AuthAction, NamespacePolicies, SubscriptionAuthMode};
use crate::core::metadata::{MetaVersion, MetadataStore, PoliciesCache, SessionId, paths};
use crate::core::ownership::transition::{BundleTopics, BundleTransitions};
use crate::core::ownership::OwnershipRegistry;
use crate::core::topic::{NamespaceName, TopicDomain, TopicName};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::info;

/// Pluggable identity verification for the CONNECT handshake. Returns the
/// authenticated role.
pub trait AuthProvider: Send + Sync {
    fn authenticate(
        &self,
        method: Option<&str>,
        data: Option<&[u8]>,
    ) -> Result<String, DriftError>;
}

/// The default verifier: every connection is the anonymous role.
pub struct AllowAllAuth;

impl AuthProvider for AllowAllAuth {
    fn authenticate(
        &self,
        _method: Option<&str>,
        _data: Option<&[u8]>,
    ) -> Result<String, DriftError> {
        Ok("anonymous".to_string())
    }
}

/// The authorization decision: whether an authenticated role may perform an
/// action on a topic, evaluated against the namespace's policies at the
/// lookup, producer-create and subscribe dispatch points.
pub trait AuthorizationProvider: Send + Sync {
    fn authorize(
        &self,
        role: &str,
        action: AuthAction,
        topic: &TopicName,
        policies: &NamespacePolicies,
    ) -> Result<(), DriftError>;

    /// Validates a subscription name for the role under the namespace's
    /// subscription-auth mode. Permissive unless overridden.
    fn authorize_subscription(
        &self,
        _role: &str,
        _subscription: &str,
        _policies: &NamespacePolicies,
    ) -> Result<(), DriftError> {
        Ok(())
    }
}

/// The default decision: every role may do everything.
pub struct AllowAllAuthorization;

impl AuthorizationProvider for AllowAllAuthorization {
    fn authorize(
        &self,
        _role: &str,
        _action: AuthAction,
        _topic: &TopicName,
        _policies: &NamespacePolicies,
    ) -> Result<(), DriftError> {
        Ok(())
    }
}

/// Enforces the namespace's per-role action grants and its
/// subscription-auth mode.
pub struct PolicyAuthorization;

impl AuthorizationProvider for PolicyAuthorization {
    fn authorize(
        &self,
        role: &str,
        action: AuthAction,
        topic: &TopicName,
        policies: &NamespacePolicies,
    ) -> Result<(), DriftError> {
        let granted = policies
            .auth_policies
            .get(role)
            .is_some_and(|actions| actions.contains(&action));
        if granted {
            Ok(())
        } else {
            Err(DriftError::Unauthorized(format!(
                "role '{role}' is not granted {action:?} on {topic}"
            )))
        }
    }

    fn authorize_subscription(
        &self,
        role: &str,
        subscription: &str,
        policies: &NamespacePolicies,
    ) -> Result<(), DriftError> {
        match policies.subscription_auth_mode {
            SubscriptionAuthMode::None => Ok(()),
            SubscriptionAuthMode::Prefix if subscription.starts_with(role) => Ok(()),
            SubscriptionAuthMode::Prefix => Err(DriftError::Unauthorized(format!(
                "subscription '{subscription}' must be prefixed with role '{role}'"
            ))),
        }
    }
}

/// Hook invoked on the publish path before an append, carrying the
/// namespace's resolved policies. Dispatch-rate limiting, backlog quotas,
/// retention and deduplication policy enforcement plug in here.
pub trait PublishInterceptor: Send + Sync {
    fn before_publish(
        &self,
        topic: &TopicName,
        policies: &NamespacePolicies,
        payload_size: usize,
    ) -> Result<(), DriftError>;
}

/// The default hook: everything is admitted.
pub struct AdmitAll;

impl PublishInterceptor for AdmitAll {
    fn before_publish(
        &self,
        _topic: &TopicName,
        _policies: &NamespacePolicies,
        _payload_size: usize,
    ) -> Result<(), DriftError> {
        Ok(())
    }
}

/// The durable half of a topic: survives eviction of the resident state the
/// way ledger storage would.
#[derive(Clone)]
struct DurableTopicState {
    log: Arc<MemoryTopicLog>,
    sequences: Arc<DashMap<String, (u64, Position)>>,
    cursors: Arc<DashMap<String, Position>>,
}

/// The registry of topics resident on this broker.
pub struct TopicsHub {
    resident: DashMap<TopicName, Arc<BrokerTopic>>,
    durable: DashMap<TopicName, DurableTopicState>,
    meta: Arc<dyn MetadataStore>,
    next_ledger: AtomicU64,
}

impl TopicsHub {
    pub fn new(meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            resident: DashMap::new(),
            durable: DashMap::new(),
            meta,
            next_ledger: AtomicU64::new(1),
        }
    }

    /// Returns the resident topic, materializing it (and its existence
    /// marker in the metadata store) on first use.
    pub async fn get_or_create(&self, topic: &TopicName) -> Result<Arc<BrokerTopic>, DriftError> {
        if let Some(existing) = self.resident.get(topic) {
            return Ok(existing.value().clone());
        }
        let durable = self
            .durable
            .entry(topic.clone())
            .or_insert_with(|| DurableTopicState {
                log: Arc::new(MemoryTopicLog::new(
                    self.next_ledger.fetch_add(1, Ordering::SeqCst),
                )),
                sequences: Arc::new(DashMap::new()),
                cursors: Arc::new(DashMap::new()),
            })
            .clone();
        let created = Arc::new(BrokerTopic::new(
            topic.clone(),
            durable.log.clone() as Arc<dyn TopicStore>,
            durable.sequences,
            durable.cursors,
        ));
        let resident = self
            .resident
            .entry(topic.clone())
            .or_insert(created)
            .clone();
        self.meta
            .put(
                &paths::topic_path(topic),
                Bytes::from(topic.to_string()),
                MetaVersion::Any,
            )
            .await?;
        Ok(resident)
    }

    pub fn get(&self, topic: &TopicName) -> Option<Arc<BrokerTopic>> {
        self.resident.get(topic).map(|t| t.value().clone())
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Removes a topic's existence marker, used by deletion.
    pub async fn delete_marker(&self, topic: &TopicName) -> Result<(), DriftError> {
        if let Some((_, resident)) = self.resident.remove(topic) {
            resident.disconnect_clients();
        }
        self.durable.remove(topic);
        self.meta
            .delete(&paths::topic_path(topic), MetaVersion::Any)
            .await
    }

    /// The full topic names currently existing under a namespace, cluster
    /// wide, from the metadata markers.
    pub async fn topics_of_namespace(
        &self,
        ns: &NamespaceName,
    ) -> Result<Vec<String>, DriftError> {
        let mut out = Vec::new();
        for domain in [TopicDomain::Persistent, TopicDomain::NonPersistent] {
            for path in self.meta.children(&paths::topics_prefix(domain, ns)).await? {
                if let Some(value) = self.meta.get(&path).await? {
                    out.push(String::from_utf8_lossy(&value.data).into_owned());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Evicts every resident topic whose hash falls in the bundle,
    /// disconnecting its clients. Durable state stays behind for the next
    /// owner.
    pub fn evict(&self, ns: &NamespaceName, bundle: &BundleRange) {
        let victims: Vec<TopicName> = self
            .resident
            .iter()
            .filter(|t| t.key().namespace() == *ns && bundle.contains(bundle::hash_of(t.key())))
            .map(|t| t.key().clone())
            .collect();
        for name in victims {
            if let Some((_, topic)) = self.resident.remove(&name) {
                info!("evicting topic {name} for bundle {bundle} handover");
                topic.disconnect_clients();
            }
        }
    }
}

#[async_trait]
impl BundleTopics for TopicsHub {
    async fn evict_bundle(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
    ) -> Result<(), DriftError> {
        self.evict(ns, bundle);
        Ok(())
    }

    async fn topic_hashes(
        &self,
        ns: &NamespaceName,
        bundle: &BundleRange,
    ) -> Result<Vec<u32>, DriftError> {
        Ok(self
            .resident
            .iter()
            .filter(|t| t.key().namespace() == *ns)
            .map(|t| bundle::hash_of(t.key()))
            .filter(|h| bundle.contains(*h))
            .collect())
    }
}

/// Everything a server connection needs, wired once at startup.
pub struct BrokerState {
    /// The unique hexadecimal run id of this broker instance.
    pub broker_id: String,
    pub config: Arc<BrokerConfig>,
    pub meta: Arc<dyn MetadataStore>,
    pub policies: Arc<PoliciesCache>,
    pub ownership: Arc<OwnershipRegistry>,
    pub load: Arc<LoadManager>,
    pub lookup: Arc<LookupEngine>,
    pub transitions: Arc<BundleTransitions>,
    pub topics: Arc<TopicsHub>,
    pub auth: Arc<dyn AuthProvider>,
    pub authz: Arc<dyn AuthorizationProvider>,
    pub publish_hook: Arc<dyn PublishInterceptor>,
    pub dynamic: Arc<crate::core::dynconfig::DynamicBrokerConfig>,
    pub shutdown_tx: broadcast::Sender<()>,
    session: SessionId,
    next_session_id: AtomicU64,
}

impl BrokerState {
    /// Builds the broker runtime against a metadata store.
    pub async fn initialize(
        config: Arc<BrokerConfig>,
        meta: Arc<dyn MetadataStore>,
    ) -> Result<Arc<Self>, DriftError> {
        let session = meta.create_session().await?;
        let broker_url = config.broker_service_url();
        let web_url = config.web_service_url();

        let ownership = Arc::new(OwnershipRegistry::new(
            meta.clone(),
            session,
            broker_url.clone(),
            web_url.clone(),
        ));
        let load = Arc::new(LoadManager::new(
            meta.clone(),
            session,
            config.advertised_socket_address(),
            LoadReport::new(broker_url.clone(), web_url),
        ));
        load.publish().await?;
        let dynamic = Arc::new(crate::core::dynconfig::DynamicBrokerConfig::new(
            config.load_report_interval,
            config.keep_alive_interval,
        ));
        dynamic.spawn_watcher(meta.clone());
        let _ = load.spawn_publisher(dynamic.clone());

        let policies = PoliciesCache::new(meta.clone());
        let lookup = Arc::new(LookupEngine::new(
            meta.clone(),
            policies.clone(),
            ownership.clone(),
            load.clone(),
            config.cluster_name.clone(),
            broker_url,
        ));
        let topics = Arc::new(TopicsHub::new(meta.clone()));
        let transitions = Arc::new(BundleTransitions::new(
            policies.clone(),
            ownership.clone(),
            topics.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);
        let broker_id = hex::encode(rand::random::<[u8; 20]>());
        info!(
            "broker {broker_id} initialized as {} in cluster '{}'",
            config.broker_service_url(),
            config.cluster_name
        );

        Ok(Arc::new(Self {
            broker_id,
            config,
            meta,
            policies,
            ownership,
            load,
            lookup,
            transitions,
            topics,
            auth: Arc::new(AllowAllAuth),
            authz: Arc::new(AllowAllAuthorization),
            publish_hook: Arc::new(AdmitAll),
            dynamic,
            shutdown_tx,
            session,
            next_session_id: AtomicU64::new(1),
        }))
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a namespace with the default bundle layout (or an explicit
    /// one).
    pub async fn create_namespace(
        &self,
        ns: &NamespaceName,
        bundles: Option<crate::core::bundle::BundlesDescriptor>,
    ) -> Result<(), DriftError> {
        let bundles = match bundles {
            Some(b) => b,
            None => crate::core::bundle::BundlesDescriptor::with_default_bundles(
                self.config.default_bundle_count,
            )?,
        };
        let policies = crate::core::metadata::policies::NamespacePolicies::with_bundles(bundles);
        self.policies.create(ns, &policies).await
    }

    /// Registers (or replaces) a cluster descriptor.
    pub async fn create_cluster(
        &self,
        name: &str,
        descriptor: &crate::core::metadata::policies::ClusterDescriptor,
    ) -> Result<(), DriftError> {
        self.meta
            .put(
                &paths::cluster_path(name),
                Bytes::from(serde_json::to_vec(descriptor)?),
                MetaVersion::Any,
            )
            .await?;
        Ok(())
    }

    /// Declares a topic partitioned with the given partition count.
    pub async fn create_partitioned_topic(
        &self,
        topic: &TopicName,
        partitions: u32,
    ) -> Result<(), DriftError> {
        let meta = crate::core::metadata::policies::PartitionedTopicMetadata { partitions };
        self.meta
            .put(
                &paths::partitioned_topic_path(topic),
                Bytes::from(serde_json::to_vec(&meta)?),
                MetaVersion::Absent,
            )
            .await?;
        Ok(())
    }

    /// Graceful shutdown: unload every owned bundle so clients re-lookup,
    /// then end the metadata session (dropping any remaining ephemera) and
    /// stop the connection loops.
    pub async fn shutdown(&self) {
        for (ns, bundle) in self.ownership.local_bundles() {
            if let Err(e) = self.transitions.unload(&ns, &bundle).await {
                tracing::warn!("unload of {ns}/{bundle} during shutdown failed: {e}");
            }
        }
        if let Err(e) = self.meta.end_session(self.session).await {
            tracing::warn!("ending metadata session failed: {e}");
        }
        let _ = self.shutdown_tx.send(());
    }
}
