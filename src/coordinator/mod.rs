//! Coordinator: placement, membership and the blob directory
//!
//! Clients talk to the client port, storage nodes to the cluster port. All
//! cluster bookkeeping lives in one `ClusterState` behind a `RwLock`; the
//! monitor holds the write lock for a whole pass.

pub mod blob_log;
pub mod client_rpc;
pub mod cluster_rpc;
pub mod cluster_state;
pub mod intents;
pub mod monitor;
pub mod placement;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use crate::protocol::{
    BlobId, BlockId, Connection, ForwardBlock, HeartbeatMsg, HeartbeatResponse, NodeId,
    WireError, MONITOR_INTERVAL, NODE_TIMEOUT,
};

pub use blob_log::{BlobLog, BlobLogError};
pub use cluster_state::{ClusterState, Membership};
pub use intents::{DeletionIntents, ReplicationIntents};
pub use monitor::MonitorReport;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Blob log error: {0}")]
    BlobLog(#[from] BlobLogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub client_addr: String,
    pub cluster_addr: String,
    pub replication_factor: usize,
    pub blob_log_path: PathBuf,
    pub monitor_interval: Duration,
    /// Silence after which a storage node is forgotten.
    pub node_timeout: Duration,
    pub debug: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            client_addr: "0.0.0.0:5050".to_string(),
            cluster_addr: "0.0.0.0:5051".to_string(),
            replication_factor: 2,
            blob_log_path: PathBuf::from("metadata.log"),
            monitor_interval: MONITOR_INTERVAL,
            node_timeout: NODE_TIMEOUT,
            debug: false,
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    state: RwLock<ClusterState>,
    blob_log: Mutex<BlobLog>,
    client_addr: SocketAddr,
    cluster_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Coordinator {
    pub async fn start(config: CoordinatorConfig) -> Result<Arc<Self>, CoordinatorError> {
        Self::start_with_state(ClusterState::new(config.replication_factor), config).await
    }

    /// Start around a prepared state, e.g. one with a seeded RNG.
    pub async fn start_with_state(
        state: ClusterState,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let blob_log = BlobLog::load(&config.blob_log_path)?;

        let client_listener = TcpListener::bind(&config.client_addr).await?;
        let cluster_listener = TcpListener::bind(&config.cluster_addr).await?;
        let client_addr = client_listener.local_addr()?;
        let cluster_addr = cluster_listener.local_addr()?;
        log::info!("Accepting client connections on {}", client_addr);
        log::info!("Accepting storage node connections on {}", cluster_addr);

        let (shutdown_tx, _) = broadcast::channel(1);
        let coordinator = Arc::new(Self {
            config,
            state: RwLock::new(state),
            blob_log: Mutex::new(blob_log),
            client_addr,
            cluster_addr,
            shutdown_tx,
        });

        coordinator.spawn_accept_loop(client_listener, |c, conn| {
            tokio::spawn(client_rpc::serve(c, conn));
        });
        coordinator.spawn_accept_loop(cluster_listener, |c, conn| {
            tokio::spawn(cluster_rpc::serve(c, conn));
        });
        coordinator.spawn_monitor();

        Ok(coordinator)
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Direct access to the cluster view, for inspection.
    pub fn state(&self) -> &RwLock<ClusterState> {
        &self.state
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run one monitor pass now.
    pub async fn monitor_pass(&self) -> MonitorReport {
        let mut state = self.state.write().await;
        state.reconcile(Instant::now(), self.config.node_timeout)
    }

    pub fn create_blob(&self) -> BlobId {
        ClusterState::new_blob_id()
    }

    pub async fn append(&self, blob: &BlobId) -> ForwardBlock {
        self.state.write().await.generate_block(blob, Instant::now())
    }

    pub async fn commit(&self, blob: &BlobId, blocks: &[BlockId]) -> Result<(), CoordinatorError> {
        self.blob_log.lock().await.append(blob, blocks)?;
        Ok(())
    }

    pub async fn get_blob(&self, blob: &BlobId) -> Vec<BlockId> {
        self.blob_log.lock().await.get(blob)
    }

    pub async fn get_block(&self, block: &BlockId) -> Vec<String> {
        self.state.read().await.get_block(block)
    }

    pub async fn register(&self, addr: &str, blocks: &[BlockId]) -> NodeId {
        self.state.write().await.register(addr, blocks, Instant::now())
    }

    pub async fn heartbeat(&self, msg: &HeartbeatMsg) -> HeartbeatResponse {
        self.state.write().await.heartbeat(msg, Instant::now())
    }

    fn spawn_accept_loop<F>(self: &Arc<Self>, listener: TcpListener, serve: F)
    where
        F: Fn(Arc<Self>, Connection) + Send + 'static,
    {
        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, _)) => {
                            let conn = Connection::new(stream, coordinator.config.debug);
                            serve(Arc::clone(&coordinator), conn);
                        }
                        Err(e) => log::warn!("Accept error: {}", e),
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        log::debug!("Monitor checking system..");
                        let report = coordinator.monitor_pass().await;
                        if !report.is_quiet() {
                            log::info!(
                                "Monitor: {} evicted, {} replications, {} deletions, {} moves",
                                report.evicted.len(),
                                report.replications.len(),
                                report.deletions.len(),
                                report.moves.len()
                            );
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}
