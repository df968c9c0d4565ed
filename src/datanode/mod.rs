//! Storage node: holds block replicas and keeps the coordinator informed
//!
//! A `DataNode` owns its block store, the per-block intent gate and the
//! queues feeding heartbeats and the forwarder. `start` binds the listener and
//! spawns the background tasks: accept loop, heartbeat, integrity checker and
//! forwarding worker.

pub mod block_intents;
pub mod block_store;
pub mod forwarder;
pub mod heartbeat;
pub mod integrity;
pub mod pending;
pub mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::MissedTickBehavior;

use crate::protocol::{
    BlockId, Connection, ForwardBlock, NodeId, WireError, HEARTBEAT_INTERVAL, INTEGRITY_INTERVAL,
};

pub use block_intents::{BlockIntents, BlockState, LockError, ReadGuard};
pub use block_store::{BlockStore, StagedBlock, StoreError};
pub use integrity::IntegrityError;
pub use pending::PendingBlocks;

#[derive(Error, Debug)]
pub enum DataNodeError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't forward block to any of: {}", .0.join(" "))]
    NoReachablePeer(Vec<String>),
}

/// Configuration for one storage node process.
#[derive(Clone, Debug)]
pub struct DataNodeConfig {
    pub data_dir: PathBuf,
    /// Port 0 lets the OS choose.
    pub listen_addr: String,
    /// Cluster port of the coordinator.
    pub coordinator_addr: String,
    pub heartbeat_interval: Duration,
    pub integrity_interval: Duration,
    /// Log every RPC frame.
    pub debug: bool,
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("_data"),
            listen_addr: "0.0.0.0:0".to_string(),
            coordinator_addr: "127.0.0.1:5051".to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            integrity_interval: INTEGRITY_INTERVAL,
            debug: false,
        }
    }
}

pub struct DataNode {
    config: DataNodeConfig,
    addr: SocketAddr,
    store: BlockStore,
    intents: BlockIntents,
    /// Held for a whole heartbeat tick: one report in flight per node.
    node_id: Mutex<Option<NodeId>>,
    new_blocks: PendingBlocks,
    dead_blocks: PendingBlocks,
    forward_tx: mpsc::UnboundedSender<ForwardBlock>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DataNode {
    /// Prepare the data directory, bind the listener and spawn every
    /// background task.
    pub async fn start(config: DataNodeConfig) -> Result<Arc<Self>, DataNodeError> {
        let store = BlockStore::new(&config.data_dir);
        store.init().await?;

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Accepting connections on {}", addr);

        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let node = Arc::new(Self {
            config,
            addr,
            store,
            intents: BlockIntents::new(),
            node_id: Mutex::new(None),
            new_blocks: PendingBlocks::new(),
            dead_blocks: PendingBlocks::new(),
            forward_tx,
            shutdown_tx,
        });

        let on_disk = node.store.read_block_list().await?;
        let present = node.intents.reinit_present(&on_disk);
        log::info!("Found {} blocks on disk", present.len());

        node.spawn_accept_loop(listener);
        node.spawn_heartbeat();
        node.spawn_integrity_checker();
        node.spawn_forwarder(forward_rx);

        Ok(node)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &DataNodeConfig {
        &self.config
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn intents(&self) -> &BlockIntents {
        &self.intents
    }

    pub async fn node_id(&self) -> Option<NodeId> {
        self.node_id.lock().await.clone()
    }

    /// Blocks received but not yet acknowledged by the coordinator.
    pub fn pending_new_blocks(&self) -> Vec<BlockId> {
        self.new_blocks.snapshot()
    }

    /// Blocks removed but not yet acknowledged by the coordinator.
    pub fn pending_dead_blocks(&self) -> Vec<BlockId> {
        self.dead_blocks.snapshot()
    }

    /// End the accept loop and all background tasks.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub(crate) fn have_block(&self, block: BlockId) {
        self.new_blocks.push(block);
    }

    /// Delete a block through the delete lock and queue it as dead for the
    /// next heartbeat. Storage errors are logged; the next integrity pass or
    /// registration reconciles whatever is left on disk.
    pub async fn remove_block(&self, block: &BlockId) {
        log::info!("Removing block '{}'", block);
        self.intents.lock_delete(block).await;
        if let Err(e) = self.store.delete_block(block).await {
            log::warn!("Deleting block '{}': {}", block, e);
        }
        self.intents.commit_delete(block);
        self.dead_blocks.push(block.clone());
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, _)) => {
                            let conn = Connection::new(stream, node.config.debug);
                            tokio::spawn(session::serve(Arc::clone(&node), conn));
                        }
                        Err(e) => log::warn!("Accept error: {}", e),
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = node.heartbeat_tick().await {
                            log::warn!("Heartbeat error: {}", e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_integrity_checker(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.integrity_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        node.check_integrity().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_forwarder(self: &Arc<Self>, jobs: mpsc::UnboundedReceiver<ForwardBlock>) {
        let node = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(node.run_forwarder(jobs, shutdown));
    }
}
