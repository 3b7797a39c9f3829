// src/config.rs

//! Broker and client configuration: loading from TOML, defaulting, and
//! validation.

use crate::core::ownership::transition::SplitAlgorithm;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The scheme of broker service URLs.
pub const BROKER_URL_SCHEME: &str = "drift";

/// Broker-side configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    /// The cluster this broker belongs to.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Address the listener binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the binary protocol listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port of the admin/web endpoint, used in web service URLs.
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Address advertised to peers and clients; falls back to `host`.
    #[serde(default)]
    pub advertised_address: Option<String>,
    /// How many bundles a namespace gets when created without an explicit
    /// descriptor.
    #[serde(default = "default_bundle_count")]
    pub default_bundle_count: u32,
    /// How split points are chosen.
    #[serde(default)]
    pub split_algorithm: SplitAlgorithm,
    /// How often the ephemeral load report is refreshed.
    #[serde(with = "humantime_serde", default = "default_load_report_interval")]
    pub load_report_interval: Duration,
    /// Idle interval between keep-alive pings on server connections.
    #[serde(with = "humantime_serde", default = "default_keep_alive_interval")]
    pub keep_alive_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            host: default_host(),
            port: default_port(),
            web_port: default_web_port(),
            advertised_address: None,
            default_bundle_count: default_bundle_count(),
            split_algorithm: SplitAlgorithm::default(),
            load_report_interval: default_load_report_interval(),
            keep_alive_interval: default_keep_alive_interval(),
        }
    }
}

impl BrokerConfig {
    /// Loads and validates a broker configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: BrokerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(anyhow!("cluster_name cannot be empty"));
        }
        if self.default_bundle_count == 0 {
            return Err(anyhow!("default_bundle_count must be at least 1"));
        }
        Ok(())
    }

    /// The advertised host, falling back to the bind host.
    pub fn advertised_host(&self) -> &str {
        self.advertised_address.as_deref().unwrap_or(&self.host)
    }

    /// `host:port` as published in load reports and ownership claims.
    pub fn advertised_socket_address(&self) -> String {
        format!("{}:{}", self.advertised_host(), self.port)
    }

    /// The binary-protocol URL clients connect to.
    pub fn broker_service_url(&self) -> String {
        format!("{BROKER_URL_SCHEME}://{}", self.advertised_socket_address())
    }

    /// The admin endpoint URL published in ownership claims.
    pub fn web_service_url(&self) -> String {
        format!("http://{}:{}", self.advertised_host(), self.web_port)
    }
}

/// Client-side configuration shared by all producers and consumers of one
/// client instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Deadline of every async operation (lookups, creates, sends).
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub operation_timeout: Duration,
    /// TCP connect + handshake deadline.
    #[serde(with = "humantime_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Bound on the lookup redirect chain.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    /// Connection slots per logical broker address.
    #[serde(default = "default_connections_per_host")]
    pub max_connections_per_host: usize,
    /// Concurrent in-flight lookups allowed per connection.
    #[serde(default = "default_max_lookup_requests")]
    pub max_lookup_requests: usize,
    /// `TooManyRequests` responses tolerated per minute before the
    /// connection is closed.
    #[serde(default = "default_max_rejects_per_minute")]
    pub max_rejected_requests_per_minute: u32,
    /// Idle interval between keep-alive pings.
    #[serde(with = "humantime_serde", default = "default_keep_alive_interval")]
    pub keep_alive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: default_operation_timeout(),
            connection_timeout: default_connection_timeout(),
            max_redirects: default_max_redirects(),
            max_connections_per_host: default_connections_per_host(),
            max_lookup_requests: default_max_lookup_requests(),
            max_rejected_requests_per_minute: default_max_rejects_per_minute(),
            keep_alive_interval: default_keep_alive_interval(),
        }
    }
}

fn default_cluster_name() -> String {
    "standalone".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6650
}
fn default_web_port() -> u16 {
    8080
}
fn default_bundle_count() -> u32 {
    4
}
fn default_load_report_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_operation_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_redirects() -> u32 {
    10
}
fn default_connections_per_host() -> usize {
    1
}
fn default_max_lookup_requests() -> usize {
    5000
}
fn default_max_rejects_per_minute() -> u32 {
    50
}
