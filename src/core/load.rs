// src/core/load.rs

//! Broker load reports and the deterministic placement decisions built on
//! them: least-loaded broker selection for unowned bundles, and the leader
//! used to serialize assignments.

use crate::core::DriftError;
use crate::core::metadata::{MetadataStore, SessionId, paths};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// The ephemeral load report each broker publishes under
/// `/loadbalance/brokers/<address>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub broker_service_url: String,
    pub web_service_url: String,
    pub topics: u64,
    pub bundles: u64,
    pub connections: u64,
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
}

impl LoadReport {
    pub fn new(broker_service_url: String, web_service_url: String) -> Self {
        Self {
            broker_service_url,
            web_service_url,
            topics: 0,
            bundles: 0,
            connections: 0,
            msg_rate_in: 0.0,
            msg_rate_out: 0.0,
        }
    }

    /// A stable scalar load score. The exact weighting is internal; what
    /// matters is that every broker computes the same ordering from the same
    /// report set within one lookup.
    pub fn load_score(&self) -> f64 {
        self.bundles as f64 * 10.0
            + self.topics as f64
            + self.connections as f64 * 0.1
            + self.msg_rate_in
            + self.msg_rate_out
    }
}

/// Publishes this broker's report and reads the cluster-wide report set.
pub struct LoadManager {
    store: Arc<dyn MetadataStore>,
    session: SessionId,
    broker_address: String,
    report: RwLock<LoadReport>,
    published: RwLock<bool>,
}

impl LoadManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        session: SessionId,
        broker_address: String,
        report: LoadReport,
    ) -> Self {
        Self {
            store,
            session,
            broker_address,
            report: RwLock::new(report),
            published: RwLock::new(false),
        }
    }

    /// Mutates the local report; the next publish pushes it out.
    pub fn update<F: FnOnce(&mut LoadReport)>(&self, f: F) {
        f(&mut self.report.write());
    }

    /// Writes the current report to the store. The first write creates the
    /// ephemeral node bound to the broker session; later writes update it in
    /// place.
    pub async fn publish(&self) -> Result<(), DriftError> {
        let path = paths::load_report_path(&self.broker_address);
        let data = Bytes::from(serde_json::to_vec(&*self.report.read())?);
        let already_published = *self.published.read();
        if already_published {
            self.store
                .put(&path, data, crate::core::metadata::MetaVersion::Any)
                .await?;
        } else {
            self.store.put_ephemeral(&path, data, self.session).await?;
            *self.published.write() = true;
        }
        Ok(())
    }

    /// Spawns the periodic report publisher. The interval is re-read from
    /// the dynamic configuration on every cycle so updates apply without a
    /// restart.
    pub fn spawn_publisher(
        self: &Arc<Self>,
        dynamic: Arc<crate::core::dynconfig::DynamicBrokerConfig>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(dynamic.load_report_interval()).await;
                if let Err(e) = manager.publish().await {
                    warn!("failed to publish load report: {e}");
                }
            }
        })
    }

    /// Reads all live broker reports, keyed by broker address, sorted by
    /// address.
    pub async fn live_brokers(&self) -> Result<Vec<(String, LoadReport)>, DriftError> {
        let mut out = Vec::new();
        for path in self
            .store
            .children(paths::LOADBALANCE_BROKERS_PREFIX)
            .await?
        {
            let Some(value) = self.store.get(&path).await? else {
                continue;
            };
            let addr = path
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            match serde_json::from_slice::<LoadReport>(&value.data) {
                Ok(report) => out.push((addr, report)),
                Err(e) => debug!("ignoring malformed load report at {path}: {e}"),
            }
        }
        Ok(out)
    }

    /// The designated assigner: the lexicographically smallest live broker
    /// address. Every broker computes the same answer from the same report
    /// set, which stands in for the external leader election this module
    /// assumes.
    pub fn leader(reports: &[(String, LoadReport)]) -> Option<&(String, LoadReport)> {
        reports.iter().min_by(|a, b| a.0.cmp(&b.0))
    }

    /// The least-loaded broker: lowest load score, ties broken by
    /// lexicographic address so the choice is a pure function of the report
    /// set.
    pub fn least_loaded(reports: &[(String, LoadReport)]) -> Option<&(String, LoadReport)> {
        reports.iter().min_by(|a, b| {
            a.1.load_score()
                .partial_cmp(&b.1.load_score())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        })
    }

    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }
}
