//! Registration and periodic reports to the coordinator

use std::sync::Arc;

use crate::protocol::{
    ClusterRequest, Connection, HeartbeatMsg, HeartbeatResponse, NodeId, RegistrationMsg,
};

use super::{DataNode, DataNodeError};

impl DataNode {
    /// One heartbeat round. Registers first if the node has no identity yet.
    ///
    /// Queued block deltas are only dropped once the coordinator accepted
    /// them, so a failed round is simply repeated by the next one.
    pub async fn heartbeat_tick(self: &Arc<Self>) -> Result<(), DataNodeError> {
        let mut node_id = self.node_id.lock().await;

        let mut conn = match Connection::connect(&self.config.coordinator_addr, self.config.debug).await {
            Ok(conn) => conn,
            Err(e) => {
                if node_id.take().is_some() {
                    log::warn!("Lost coordinator at {}", self.config.coordinator_addr);
                }
                return Err(e.into());
            }
        };

        let id = match node_id.as_ref() {
            Some(id) => id.clone(),
            None => {
                *node_id = Some(self.register(&mut conn).await?);
                return Ok(());
            }
        };

        let msg = HeartbeatMsg {
            node_id: id,
            space_used: self.intents.present_count(),
            new_blocks: self.new_blocks.snapshot(),
            dead_blocks: self.dead_blocks.snapshot(),
        };
        let response: HeartbeatResponse = conn.call(&ClusterRequest::Heartbeat(msg.clone())).await?;

        if response.need_to_register {
            log::info!("Coordinator forgot node {}, re-registering", msg.node_id);
            *node_id = None;
            return Ok(());
        }

        self.new_blocks.commit(msg.new_blocks.len());
        self.dead_blocks.commit(msg.dead_blocks.len());

        for block in response.invalidate_blocks {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.remove_block(&block).await });
        }
        for job in response.to_replicate {
            log::info!("Replicating block '{}' to {}", job.block_id, job.nodes.join(" "));
            self.enqueue_forward(job);
        }

        Ok(())
    }

    /// Rescan the disk and announce every present block.
    async fn register(&self, conn: &mut Connection) -> Result<NodeId, DataNodeError> {
        let on_disk = self.store.read_block_list().await?;
        let blocks = self.intents.reinit_present(&on_disk);
        let msg = RegistrationMsg {
            addr: self.addr.to_string(),
            blocks,
        };
        let id: NodeId = conn.call(&ClusterRequest::Register(msg)).await?;
        log::info!("Registered with ID: {}", id);
        Ok(id)
    }
}
