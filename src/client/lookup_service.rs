// src/client/lookup_service.rs

//! Client-side topic resolution: the redirect-following lookup loop,
//! partitioned metadata, and namespace topic listing.

use crate::client::connection::server_error_to_drift;
use crate::client::pool::ConnectionPool;
use crate::config::ClientConfig;
use crate::core::DriftError;
use crate::core::protocol::{ClientCommand, LookupType, ServerError};
use crate::core::topic::{NamespaceName, TopicName};
use std::sync::Arc;
use tracing::debug;

/// Where a resolved topic lives: the logical broker identity plus the
/// physical address to dial (differs when proxied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBroker {
    pub logical_address: String,
    pub physical_address: String,
}

pub struct LookupService {
    pool: Arc<ConnectionPool>,
    config: Arc<ClientConfig>,
    /// The bootstrap service URL every resolution starts from.
    service_url: String,
}

impl LookupService {
    pub fn new(pool: Arc<ConnectionPool>, config: Arc<ClientConfig>, service_url: String) -> Self {
        Self {
            pool,
            config,
            service_url,
        }
    }

    /// Resolves a topic to its owning broker, following redirects up to the
    /// configured cap. The `authoritative` flag starts false and flips when
    /// a responder designates the next hop as the assigner.
    pub async fn resolve(&self, topic: &TopicName) -> Result<ResolvedBroker, DriftError> {
        let topic_str = topic.to_string();
        let mut target = self.service_url.clone();
        let mut physical = self.service_url.clone();
        let mut authoritative = false;

        for attempt in 0..self.config.max_redirects {
            let cnx = self.pool.get_connection(&target, &physical).await?;
            let response = cnx
                .lookup_request(|request_id| ClientCommand::Lookup {
                    topic: topic_str.clone(),
                    request_id,
                    authoritative,
                })
                .await?;
            let ClientCommand::LookupResponse {
                response,
                broker_service_url,
                authoritative: response_authoritative,
                proxy_through_service_url,
                error,
                message,
                ..
            } = response
            else {
                return Err(DriftError::Protocol(
                    "lookup answered with a non-lookup response".to_string(),
                ));
            };
            match response {
                LookupType::Connect => {
                    let logical = broker_service_url.ok_or_else(|| {
                        DriftError::Protocol("Connect response without broker URL".to_string())
                    })?;
                    // Proxied deployments keep dialing the original service
                    // URL and only change the multiplexing identity.
                    let physical = if proxy_through_service_url {
                        self.service_url.clone()
                    } else {
                        logical.clone()
                    };
                    return Ok(ResolvedBroker {
                        logical_address: logical,
                        physical_address: physical,
                    });
                }
                LookupType::Redirect => {
                    let next = broker_service_url.ok_or_else(|| {
                        DriftError::Protocol("Redirect response without broker URL".to_string())
                    })?;
                    debug!(
                        "lookup {topic_str}: redirect {attempt} -> {next} (authoritative {response_authoritative})"
                    );
                    authoritative = response_authoritative;
                    physical = if proxy_through_service_url {
                        self.service_url.clone()
                    } else {
                        next.clone()
                    };
                    target = next;
                }
                LookupType::Failed => {
                    let error = error.unwrap_or(ServerError::Unknown);
                    return Err(server_error_to_drift(
                        error,
                        message.as_deref().unwrap_or("lookup failed"),
                    ));
                }
            }
        }
        Err(DriftError::LookupFailed(format!(
            "max redirects ({}) exhausted resolving {topic_str}",
            self.config.max_redirects
        )))
    }

    /// Fetches the partition count of a base topic; `0` means not
    /// partitioned.
    pub async fn partitioned_metadata(&self, topic: &TopicName) -> Result<u32, DriftError> {
        let cnx = self
            .pool
            .get_connection(&self.service_url, &self.service_url)
            .await?;
        let response = cnx
            .lookup_request(|request_id| ClientCommand::PartitionedMetadata {
                topic: topic.to_string(),
                request_id,
            })
            .await?;
        match response {
            ClientCommand::PartitionedMetadataResponse {
                partitions,
                error: None,
                ..
            } => Ok(partitions),
            ClientCommand::PartitionedMetadataResponse {
                error: Some(error),
                message,
                ..
            } => Err(server_error_to_drift(
                error,
                message.as_deref().unwrap_or("partitioned metadata failed"),
            )),
            _ => Err(DriftError::Protocol(
                "unexpected response to partitioned metadata".to_string(),
            )),
        }
    }

    /// Lists the topics currently existing under a namespace.
    pub async fn topics_of_namespace(
        &self,
        ns: &NamespaceName,
    ) -> Result<Vec<String>, DriftError> {
        let cnx = self
            .pool
            .get_connection(&self.service_url, &self.service_url)
            .await?;
        let response = cnx
            .lookup_request(|request_id| ClientCommand::GetTopicsOfNamespace {
                namespace: ns.to_string(),
                request_id,
            })
            .await?;
        match response {
            ClientCommand::GetTopicsOfNamespaceResponse { topics, .. } => Ok(topics),
            _ => Err(DriftError::Protocol(
                "unexpected response to namespace topic listing".to_string(),
            )),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}
