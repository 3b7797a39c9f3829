// src/server/mod.rs

//! The broker's TCP front: listener setup and the accept loop.

pub mod connection_loop;

pub use connection_loop::ConnectionHandler;

use crate::config::BrokerConfig;
use crate::core::DriftError;
use crate::core::broker::BrokerState;
use crate::core::metadata::MetadataStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// A running broker: its shared state and the address it listens on.
pub struct BrokerServer {
    pub state: Arc<BrokerState>,
    pub local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl BrokerServer {
    /// Binds the listener, initializes the broker runtime against the given
    /// metadata store, and spawns the accept loop. Binding before
    /// initialization lets `port = 0` configurations (tests) advertise the
    /// actual ephemeral port.
    pub async fn start(
        mut config: BrokerConfig,
        meta: Arc<dyn MetadataStore>,
    ) -> Result<Self, DriftError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        config.port = local_addr.port();
        info!(
            "broker listening on {local_addr}, advertised as {}",
            config.broker_service_url()
        );

        let state = BrokerState::initialize(Arc::new(config), meta).await?;
        let accept_state = state.clone();
        let mut shutdown_rx = state.shutdown_tx.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("accept loop stopping");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, addr)) => {
                                if let Err(e) = socket.set_nodelay(true) {
                                    error!("failed to set TCP_NODELAY for {addr}: {e}");
                                }
                                let conn_state = accept_state.clone();
                                tokio::spawn(async move {
                                    ConnectionHandler::run(conn_state, socket, addr).await;
                                });
                            }
                            Err(e) => {
                                error!("accept failed: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            state,
            local_addr,
            accept_task,
        })
    }

    /// Gracefully shuts the broker down: bundles unload, the metadata
    /// session ends, connections drain.
    pub async fn shutdown(self) {
        self.state.shutdown().await;
        let _ = self.accept_task.await;
    }
}
