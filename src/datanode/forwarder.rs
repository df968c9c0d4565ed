//! Pushes local blocks to other storage nodes
//!
//! Jobs come from two producers: pipeline continuation after a confirmed
//! receive, and replicate instructions in heartbeat responses. A single worker
//! drains them in order.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::protocol::{BlockId, Connection, DataRequest, ForwardBlock};

use super::{DataNode, DataNodeError};

impl DataNode {
    /// Queue a block for sending to `job.nodes`. `job.size` is ignored; the
    /// size of the local copy is used.
    pub fn enqueue_forward(&self, job: ForwardBlock) {
        if self.forward_tx.send(job).is_err() {
            log::warn!("Forwarder is gone, dropping job");
        }
    }

    pub(crate) async fn run_forwarder(
        self: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<ForwardBlock>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => {
                        if let Err(e) = self.send_block(&job.block_id, &job.nodes).await {
                            log::warn!("Forwarding block '{}' failed: {}", job.block_id, e);
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Send one local block to the first reachable node in `peers`, which
    /// carries it on to the rest. Returns the address that took the block.
    pub async fn send_block(&self, block: &BlockId, peers: &[String]) -> Result<String, DataNodeError> {
        let _guard = self.intents.read_guard(block)?;

        let mut target = None;
        for (i, addr) in peers.iter().enumerate() {
            match Connection::connect(addr, self.config.debug).await {
                Ok(conn) => {
                    target = Some((i, conn));
                    break;
                }
                Err(e) => log::warn!("Couldn't reach {} for block '{}': {}", addr, block, e),
            }
        }
        let (chosen, mut conn) = target.ok_or_else(|| DataNodeError::NoReachablePeer(peers.to_vec()))?;
        let remaining: Vec<String> = peers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, addr)| addr.clone())
            .collect();

        let size = self.store.block_size(block).await?;
        let header = ForwardBlock {
            block_id: block.clone(),
            nodes: remaining,
            size,
        };
        conn.call::<_, ()>(&DataRequest::Forward(header)).await?;
        self.store.read_block(block, conn.writer_mut()).await?;

        let checksum = self.store.read_checksum(block).await?;
        conn.call::<_, ()>(&DataRequest::Confirm(checksum.trim().to_string()))
            .await?;

        log::info!("Forwarded block '{}' to {}", block, peers[chosen]);
        Ok(peers[chosen].clone())
    }
}
