// src/core/dynconfig.rs

//! Runtime-adjustable broker settings.
//!
//! A fixed, explicit list of fields can be changed while the broker runs by
//! writing a JSON object to the `/admin/broker-service-configuration`
//! record; a watch applies each known key through its typed setter. Unknown
//! keys are ignored so newer tooling can talk to older brokers.

use crate::core::DriftError;
use crate::core::metadata::{MetaEventKind, MetadataStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// The record the update watch listens on.
pub const BROKER_CONFIG_PATH: &str = "/admin/broker-service-configuration";

/// The dynamically updatable subset of the broker configuration. Everything
/// else requires a restart.
#[derive(Debug)]
pub struct DynamicBrokerConfig {
    load_report_interval_ms: AtomicU64,
    keep_alive_interval_ms: AtomicU64,
}

impl DynamicBrokerConfig {
    pub fn new(load_report_interval: Duration, keep_alive_interval: Duration) -> Self {
        Self {
            load_report_interval_ms: AtomicU64::new(load_report_interval.as_millis() as u64),
            keep_alive_interval_ms: AtomicU64::new(keep_alive_interval.as_millis() as u64),
        }
    }

    /// How often the load report publisher pushes; read on every cycle.
    pub fn load_report_interval(&self) -> Duration {
        Duration::from_millis(self.load_report_interval_ms.load(Ordering::SeqCst))
    }

    pub fn set_load_report_interval(&self, interval: Duration) {
        self.load_report_interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::SeqCst);
    }

    /// Idle ping interval; picked up by every newly accepted connection.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.load(Ordering::SeqCst))
    }

    pub fn set_keep_alive_interval(&self, interval: Duration) {
        self.keep_alive_interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::SeqCst);
    }

    /// Applies one `key = value` update through the matching typed setter.
    pub fn apply(&self, key: &str, value: &serde_json::Value) -> Result<(), DriftError> {
        let millis = |value: &serde_json::Value| {
            value.as_u64().ok_or_else(|| {
                DriftError::PreconditionFailed(format!(
                    "dynamic setting '{key}' expects an integer millisecond value"
                ))
            })
        };
        match key {
            "load_report_interval_ms" => {
                self.set_load_report_interval(Duration::from_millis(millis(value)?));
            }
            "keep_alive_interval_ms" => {
                self.set_keep_alive_interval(Duration::from_millis(millis(value)?));
            }
            other => {
                warn!("ignoring unknown dynamic setting '{other}'");
            }
        }
        Ok(())
    }

    /// Applies every key of a configuration record.
    pub fn apply_record(&self, data: &[u8]) -> Result<(), DriftError> {
        let record: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(data)?;
        for (key, value) in &record {
            self.apply(key, value)?;
        }
        Ok(())
    }

    /// Watches the broker-service-configuration record and applies updates
    /// as they land.
    pub fn spawn_watcher(self: &Arc<Self>, store: Arc<dyn MetadataStore>) {
        let dynamic = self.clone();
        let mut events = store.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event)
                        if event.path == BROKER_CONFIG_PATH
                            && event.kind != MetaEventKind::Deleted =>
                    {
                        match store.get(BROKER_CONFIG_PATH).await {
                            Ok(Some(value)) => {
                                if let Err(e) = dynamic.apply_record(&value.data) {
                                    warn!("rejected dynamic configuration update: {e}");
                                } else {
                                    info!("applied dynamic configuration update");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("failed to read dynamic configuration: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
