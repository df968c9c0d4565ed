//! Periodic reconciliation of the cluster view
//!
//! One pass evicts silent nodes, then repairs replication counts and, only if
//! that created nothing, balances load by copying blocks from nodes above the
//! average to nodes below it. The resulting extra replica is trimmed by a
//! later repair pass from the most used holder.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::cluster_state::ClusterState;
use super::placement::Order;
use crate::protocol::{BlockId, NodeId};

/// What one pass decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub evicted: Vec<NodeId>,
    pub replications: Vec<BlockId>,
    pub deletions: Vec<BlockId>,
    /// (block, from, to)
    pub moves: Vec<(BlockId, NodeId, NodeId)>,
}

impl MonitorReport {
    pub fn is_quiet(&self) -> bool {
        self.evicted.is_empty()
            && self.replications.is_empty()
            && self.deletions.is_empty()
            && self.moves.is_empty()
    }
}

impl ClusterState {
    pub fn reconcile(&mut self, now: Instant, node_timeout: Duration) -> MonitorReport {
        let mut report = MonitorReport {
            evicted: self.evict_silent_nodes(now, node_timeout),
            ..Default::default()
        };
        self.repair_replication(now, &mut report);
        if report.replications.is_empty() && report.deletions.is_empty() {
            self.balance_load(now, &mut report);
        }
        report
    }

    pub fn evict_silent_nodes(&mut self, now: Instant, node_timeout: Duration) -> Vec<NodeId> {
        let mut silent: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.last_seen) > node_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        silent.sort();
        for id in &silent {
            if let Some(m) = self.nodes.get(id) {
                log::info!(
                    "Forgetting absent node {} at {} (registered {})",
                    id,
                    m.addr,
                    m.registered_at.to_rfc3339()
                );
            }
            self.forget_node(id);
        }
        silent
    }

    /// Create intents for every block whose replica count is off and that
    /// has nothing in flight.
    pub fn repair_replication(&mut self, now: Instant, report: &mut MonitorReport) {
        let mut blocks: Vec<BlockId> = self.block_nodes.keys().cloned().collect();
        blocks.sort();

        for block in blocks {
            if self.replication.in_progress(&block, now) || self.deletion.in_progress(&block, now) {
                continue;
            }
            let holders = self.holders(&block);
            let factor = self.replication_factor;

            if holders.len() > factor {
                let delete_from: Vec<NodeId> = self
                    .most_used_nodes(now)
                    .into_iter()
                    .filter(|n| holders.contains(n))
                    .take(holders.len() - factor)
                    .collect();
                if delete_from.is_empty() {
                    continue;
                }
                log::info!("Block '{}' is over-replicated, deleting from {:?}", block, delete_from);
                if self.deletion.add(block.clone(), delete_from, now) {
                    report.deletions.push(block);
                }
            } else if !holders.is_empty() && holders.len() < factor {
                let forward_to: Vec<NodeId> = self
                    .least_used_nodes(now)
                    .into_iter()
                    .filter(|n| !holders.contains(n))
                    .take(factor - holders.len())
                    .collect();
                if forward_to.is_empty() {
                    log::debug!("Block '{}' is under-replicated, no spare nodes", block);
                    continue;
                }
                log::info!("Block '{}' is under-replicated, replicating to {:?}", block, forward_to);
                let mut available_from: Vec<NodeId> = holders.into_iter().collect();
                available_from.sort();
                if self.replication.add(block.clone(), Some(available_from), forward_to, now) {
                    report.replications.push(block);
                }
            }
        }
    }

    /// Copy blocks from nodes above the average reported load to nodes below
    /// it. Each scheduled move lowers the donor's reported load for the rest
    /// of the pass so the loop terminates; the real values are restored at
    /// the end.
    pub fn balance_load(&mut self, now: Instant, report: &mut MonitorReport) {
        if self.nodes.is_empty() {
            return;
        }
        let total: i64 = self.nodes.values().map(|m| m.reported).sum();
        let average = total / self.nodes.len() as i64;

        let mut below: Vec<NodeId> = Vec::new();
        let mut above: Vec<NodeId> = Vec::new();
        for (id, member) in &self.nodes {
            if member.reported < average {
                below.push(id.clone());
            } else if member.reported > average {
                above.push(id.clone());
            }
        }

        let mut offsets: HashMap<NodeId, i64> = HashMap::new();
        while !below.is_empty() && !above.is_empty() {
            below = self.rank(below, Order::LeastUsedFirst, now);
            above = self.rank(above, Order::MostUsedFirst, now);
            let donor = above[0].clone();

            if let Some((block, target)) = self.pick_move(&donor, &below, now) {
                let mut holders: Vec<NodeId> = self.holders(&block).into_iter().collect();
                holders.sort();
                log::info!("Move block '{}' from {} to {}", block, donor, target);
                self.replication.add(block.clone(), Some(holders), vec![target.clone()], now);
                if self.utilization(&target, now) >= average {
                    below.retain(|n| n != &target);
                }
                report.moves.push((block, donor.clone(), target));
            }

            *offsets.entry(donor.clone()).or_default() += 1;
            if let Some(member) = self.nodes.get_mut(&donor) {
                member.reported -= 1;
            }
            if self.utilization(&donor, now) <= average {
                above.retain(|n| n != &donor);
            }
        }

        for (id, offset) in offsets {
            if let Some(member) = self.nodes.get_mut(&id) {
                member.reported += offset;
            }
        }
    }

    /// First (target, block) pair where the target lacks a block of the
    /// donor and the block has nothing in flight.
    fn pick_move(&mut self, donor: &NodeId, targets: &[NodeId], now: Instant) -> Option<(BlockId, NodeId)> {
        let mut candidates: Vec<BlockId> = self.blocks_of(donor).into_iter().collect();
        candidates.sort();

        for target in targets {
            for block in &candidates {
                let already_there = self
                    .node_blocks
                    .get(target)
                    .map_or(false, |held| held.contains(block));
                if already_there {
                    continue;
                }
                if self.replication.in_progress(block, now) || self.deletion.in_progress(block, now) {
                    continue;
                }
                return Some((block.clone(), target.clone()));
            }
        }
        None
    }
}
