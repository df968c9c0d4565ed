//! The coordinator's view of the cluster
//!
//! Membership, the two block location indices and the pending intents. All
//! of it is in memory and rebuilt from registrations after a restart. The
//! indices are always updated as a pair.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use uuid::Uuid;

use super::intents::{DeletionIntents, ReplicationIntents};
use super::placement::{rank_nodes, Order};
use crate::protocol::{
    BlobId, BlockId, ForwardBlock, HeartbeatMsg, HeartbeatResponse, NodeId, MAX_BLOCK_SIZE,
};

#[derive(Debug, Clone)]
pub struct Membership {
    pub addr: String,
    pub last_seen: Instant,
    /// Present-block count from the node's last report.
    pub reported: i64,
    pub registered_at: DateTime<Utc>,
}

pub struct ClusterState {
    pub(super) nodes: HashMap<NodeId, Membership>,
    pub(super) block_nodes: HashMap<BlockId, HashSet<NodeId>>,
    pub(super) node_blocks: HashMap<NodeId, HashSet<BlockId>>,
    pub(super) replication: ReplicationIntents,
    pub(super) deletion: DeletionIntents,
    pub(super) replication_factor: usize,
    pub(super) rng: StdRng,
}

impl ClusterState {
    pub fn new(replication_factor: usize) -> Self {
        Self::with_rng(replication_factor, StdRng::from_entropy())
    }

    /// Reproducible tie breaking, for tests.
    pub fn with_seed(replication_factor: usize, seed: u64) -> Self {
        Self::with_rng(replication_factor, StdRng::seed_from_u64(seed))
    }

    fn with_rng(replication_factor: usize, rng: StdRng) -> Self {
        Self {
            nodes: HashMap::new(),
            block_nodes: HashMap::new(),
            node_blocks: HashMap::new(),
            replication: ReplicationIntents::new(),
            deletion: DeletionIntents::new(),
            replication_factor,
            rng,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn new_blob_id() -> BlobId {
        BlobId::from(Uuid::new_v4().to_string())
    }

    /// Admit a storage node under a fresh identity. An older registration at
    /// the same address belongs to a process that has since restarted and is
    /// forgotten.
    pub fn register(&mut self, addr: &str, blocks: &[BlockId], now: Instant) -> NodeId {
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, m)| m.addr == addr)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            log::info!("Node at {} re-registered, forgetting {}", addr, id);
            self.forget_node(&id);
        }

        let id = NodeId::from(format!("node-{}", Uuid::new_v4()));
        self.nodes.insert(
            id.clone(),
            Membership {
                addr: addr.to_string(),
                last_seen: now,
                reported: blocks.len() as i64,
                registered_at: Utc::now(),
            },
        );
        self.has_blocks(&id, blocks);
        id
    }

    /// Apply a heartbeat and collect the node's pending commands.
    pub fn heartbeat(&mut self, msg: &HeartbeatMsg, now: Instant) -> HeartbeatResponse {
        let Some(member) = self.nodes.get_mut(&msg.node_id) else {
            return HeartbeatResponse {
                need_to_register: true,
                ..Default::default()
            };
        };
        member.last_seen = now;
        member.reported = msg.space_used as i64;

        self.has_blocks(&msg.node_id, &msg.new_blocks);
        self.doesnt_have_blocks(&msg.node_id, &msg.dead_blocks);

        let invalidate_blocks = self.deletion.get(&msg.node_id, now);
        let to_replicate = self
            .replication
            .get(&msg.node_id, now)
            .into_iter()
            .map(|(block, targets)| ForwardBlock {
                block_id: block,
                nodes: self.addresses(&targets),
                size: 0,
            })
            .collect();

        HeartbeatResponse {
            need_to_register: false,
            invalidate_blocks,
            to_replicate,
        }
    }

    pub fn has_blocks(&mut self, node: &NodeId, blocks: &[BlockId]) {
        for block in blocks {
            self.replication.done(node, block);
            self.block_nodes
                .entry(block.clone())
                .or_default()
                .insert(node.clone());
            self.node_blocks
                .entry(node.clone())
                .or_default()
                .insert(block.clone());
        }
    }

    pub fn doesnt_have_blocks(&mut self, node: &NodeId, blocks: &[BlockId]) {
        for block in blocks {
            self.deletion.done(node, block);
            if let Some(holders) = self.block_nodes.get_mut(block) {
                holders.remove(node);
                if holders.is_empty() {
                    self.block_nodes.remove(block);
                }
            }
            if let Some(held) = self.node_blocks.get_mut(node) {
                held.remove(block);
                if held.is_empty() {
                    self.node_blocks.remove(node);
                }
            }
        }
    }

    /// Drop a node and every location entry pointing at it.
    pub fn forget_node(&mut self, node: &NodeId) {
        self.nodes.remove(node);
        if let Some(held) = self.node_blocks.remove(node) {
            for block in held {
                if let Some(holders) = self.block_nodes.get_mut(&block) {
                    holders.remove(node);
                    if holders.is_empty() {
                        self.block_nodes.remove(&block);
                    }
                }
            }
        }
    }

    /// Addresses of the live nodes holding `block`.
    pub fn get_block(&self, block: &BlockId) -> Vec<String> {
        let mut holders: Vec<&NodeId> = self
            .block_nodes
            .get(block)
            .map(|h| h.iter().collect())
            .unwrap_or_default();
        holders.sort();
        holders
            .into_iter()
            .filter_map(|n| self.nodes.get(n).map(|m| m.addr.clone()))
            .collect()
    }

    /// Name a new block of `blob` and choose where the client should send it.
    /// The chosen nodes count the block against their utilization until they
    /// report it.
    pub fn generate_block(&mut self, blob: &BlobId, now: Instant) -> ForwardBlock {
        let block = BlockId::from(format!("{}:{}", blob, Uuid::new_v4()));
        let targets: Vec<NodeId> = self
            .least_used_nodes(now)
            .into_iter()
            .take(self.replication_factor)
            .collect();
        let nodes = self.addresses(&targets);
        self.replication.add(block.clone(), None, targets, now);
        ForwardBlock {
            block_id: block,
            nodes,
            size: MAX_BLOCK_SIZE,
        }
    }

    /// Reported count plus incoming replications minus pending deletions.
    pub fn utilization(&self, node: &NodeId, now: Instant) -> i64 {
        let reported = self.nodes.get(node).map_or(0, |m| m.reported);
        reported + self.replication.count(node, now) as i64 - self.deletion.count(node, now) as i64
    }

    pub fn least_used_nodes(&mut self, now: Instant) -> Vec<NodeId> {
        let nodes = self.node_ids();
        self.rank(nodes, Order::LeastUsedFirst, now)
    }

    pub fn most_used_nodes(&mut self, now: Instant) -> Vec<NodeId> {
        let nodes = self.node_ids();
        self.rank(nodes, Order::MostUsedFirst, now)
    }

    pub(super) fn rank(&mut self, nodes: Vec<NodeId>, order: Order, now: Instant) -> Vec<NodeId> {
        let utilization: HashMap<NodeId, i64> = nodes
            .iter()
            .map(|n| (n.clone(), self.utilization(n, now)))
            .collect();
        rank_nodes(nodes, &utilization, order, &mut self.rng)
    }

    fn addresses(&self, nodes: &[NodeId]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|n| self.nodes.get(n).map(|m| m.addr.clone()))
            .collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn membership(&self, node: &NodeId) -> Option<&Membership> {
        self.nodes.get(node)
    }

    pub fn holders(&self, block: &BlockId) -> HashSet<NodeId> {
        self.block_nodes.get(block).cloned().unwrap_or_default()
    }

    pub fn blocks_of(&self, node: &NodeId) -> HashSet<BlockId> {
        self.node_blocks.get(node).cloned().unwrap_or_default()
    }

    pub fn replication_intents(&self) -> &ReplicationIntents {
        &self.replication
    }

    pub fn deletion_intents(&self) -> &DeletionIntents {
        &self.deletion
    }
}
