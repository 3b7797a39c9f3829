// src/client/pool.rs

//! The client connection pool.
//!
//! Keyed by logical broker address, each key holding up to
//! `max_connections_per_host` slots; a random slot is picked per request to
//! spread load. When a proxy fronts the brokers, the logical address (the
//! broker identity used for multiplexing) differs from the physical address
//! (where TCP actually connects); both routes to the same logical broker
//! share the same slot table.

use crate::client::connection::ClientCnx;
use crate::config::ClientConfig;
use crate::core::DriftError;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

type SlotKey = (String, usize);

pub struct ConnectionPool {
    config: Arc<ClientConfig>,
    slots: DashMap<SlotKey, Arc<OnceCell<Arc<ClientCnx>>>>,
}

impl ConnectionPool {
    pub fn new(config: Arc<ClientConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            slots: DashMap::new(),
        })
    }

    /// Returns a healthy connection to the logical broker, creating one if
    /// the chosen slot is empty or its connection died. Slot creation races
    /// resolve through the cell: only one attempt dials, the rest await it.
    pub async fn get_connection(
        &self,
        logical_address: &str,
        physical_address: &str,
    ) -> Result<Arc<ClientCnx>, DriftError> {
        let slot = if self.config.max_connections_per_host > 1 {
            rand::thread_rng().gen_range(0..self.config.max_connections_per_host)
        } else {
            0
        };
        let key = (logical_address.to_string(), slot);

        // One retry: a cached connection that died is evicted and replaced.
        for _ in 0..2 {
            let cell = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();
            let cnx = cell
                .get_or_try_init(|| {
                    debug!("opening connection to {logical_address} via {physical_address}");
                    ClientCnx::connect(logical_address, physical_address, self.config.clone())
                })
                .await?;
            if !cnx.is_closed() {
                return Ok(cnx.clone());
            }
            self.slots.remove(&key);
        }
        Err(DriftError::Disconnected)
    }

    /// Drops a slot, e.g. after observing its connection dead.
    pub fn evict(&self, logical_address: &str) {
        self.slots.retain(|(addr, _), _| addr != logical_address);
    }

    /// Closes every pooled connection.
    pub fn close_all(&self) {
        for slot in self.slots.iter() {
            if let Some(cnx) = slot.value().get() {
                cnx.close();
            }
        }
        self.slots.clear();
    }
}
