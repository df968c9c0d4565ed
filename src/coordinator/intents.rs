//! Leased bookkeeping of replications and deletions the coordinator started
//!
//! An intent stays in progress for one lease after it was created, or after
//! its command was handed to a storage node. Expired intents are pruned by
//! `in_progress`, which lets the monitor create a fresh one.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{BlockId, NodeId, INTENT_LEASE};

fn alive(started_at: Instant, now: Instant, lease: Duration) -> bool {
    now.saturating_duration_since(started_at) < lease
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationIntent {
    /// Holders that may send the block. `None` for a block the client is
    /// still writing; nobody is asked to forward it.
    pub available_from: Option<Vec<NodeId>>,
    pub forward_to: Vec<NodeId>,
    pub started_at: Instant,
    pub command_sent: bool,
}

#[derive(Debug)]
pub struct ReplicationIntents {
    intents: HashMap<BlockId, ReplicationIntent>,
    lease: Duration,
}

impl Default for ReplicationIntents {
    fn default() -> Self {
        Self::with_lease(INTENT_LEASE)
    }
}

impl ReplicationIntents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            intents: HashMap::new(),
            lease,
        }
    }

    /// Record a replication. Returns false, leaving the existing intent
    /// untouched, if one is still in progress for this block.
    pub fn add(
        &mut self,
        block: BlockId,
        available_from: Option<Vec<NodeId>>,
        forward_to: Vec<NodeId>,
        now: Instant,
    ) -> bool {
        if self.in_progress(&block, now) {
            log::warn!("Already replicating block '{}'", block);
            return false;
        }
        self.intents.insert(
            block,
            ReplicationIntent {
                available_from,
                forward_to,
                started_at: now,
                command_sent: false,
            },
        );
        true
    }

    pub fn in_progress(&mut self, block: &BlockId, now: Instant) -> bool {
        match self.intents.get(block) {
            Some(intent) if alive(intent.started_at, now, self.lease) => true,
            Some(_) => {
                self.intents.remove(block);
                false
            }
            None => false,
        }
    }

    /// Commands for `node`: every unsent intent it can serve. Handing one out
    /// marks it sent and restarts its lease.
    pub fn get(&mut self, node: &NodeId, now: Instant) -> Vec<(BlockId, Vec<NodeId>)> {
        let mut actions = Vec::new();
        for (block, intent) in self.intents.iter_mut() {
            if intent.command_sent {
                continue;
            }
            let serves = intent
                .available_from
                .as_ref()
                .map_or(false, |from| from.contains(node));
            if serves {
                intent.command_sent = true;
                intent.started_at = now;
                actions.push((block.clone(), intent.forward_to.clone()));
            }
        }
        actions.sort_by(|a, b| a.0.cmp(&b.0));
        actions
    }

    /// `node` now holds `block`; the intent ends once every target does.
    pub fn done(&mut self, node: &NodeId, block: &BlockId) {
        let finished = match self.intents.get_mut(block) {
            Some(intent) => {
                intent.forward_to.retain(|n| n != node);
                intent.forward_to.is_empty()
            }
            None => false,
        };
        if finished {
            self.intents.remove(block);
        }
    }

    /// Blocks about to land on `node`, counted against its utilization.
    pub fn count(&self, node: &NodeId, now: Instant) -> usize {
        self.intents
            .values()
            .filter(|i| alive(i.started_at, now, self.lease) && i.forward_to.contains(node))
            .count()
    }

    pub fn intent(&self, block: &BlockId) -> Option<&ReplicationIntent> {
        self.intents.get(block)
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionIntent {
    pub node: NodeId,
    pub started_at: Instant,
    pub command_sent: bool,
}

#[derive(Debug)]
pub struct DeletionIntents {
    intents: HashMap<BlockId, Vec<DeletionIntent>>,
    lease: Duration,
}

impl Default for DeletionIntents {
    fn default() -> Self {
        Self::with_lease(INTENT_LEASE)
    }
}

impl DeletionIntents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            intents: HashMap::new(),
            lease,
        }
    }

    /// Record deletion of `block` from each of `nodes`. Returns false if a
    /// deletion of this block is still in progress.
    pub fn add(&mut self, block: BlockId, nodes: Vec<NodeId>, now: Instant) -> bool {
        if self.in_progress(&block, now) {
            log::warn!("Already deleting block '{}'", block);
            return false;
        }
        let intents = nodes
            .into_iter()
            .map(|node| DeletionIntent {
                node,
                started_at: now,
                command_sent: false,
            })
            .collect();
        self.intents.insert(block, intents);
        true
    }

    pub fn in_progress(&mut self, block: &BlockId, now: Instant) -> bool {
        let lease = self.lease;
        let Some(intents) = self.intents.get_mut(block) else {
            return false;
        };
        intents.retain(|i| alive(i.started_at, now, lease));
        if intents.is_empty() {
            self.intents.remove(block);
            return false;
        }
        true
    }

    /// Blocks `node` should delete now. Marks them sent and restarts their
    /// lease.
    pub fn get(&mut self, node: &NodeId, now: Instant) -> Vec<BlockId> {
        let mut blocks = Vec::new();
        for (block, intents) in self.intents.iter_mut() {
            for intent in intents.iter_mut() {
                if !intent.command_sent && &intent.node == node {
                    intent.command_sent = true;
                    intent.started_at = now;
                    blocks.push(block.clone());
                }
            }
        }
        blocks.sort();
        blocks
    }

    pub fn done(&mut self, node: &NodeId, block: &BlockId) {
        let finished = match self.intents.get_mut(block) {
            Some(intents) => {
                intents.retain(|i| &i.node != node);
                intents.is_empty()
            }
            None => false,
        };
        if finished {
            self.intents.remove(block);
        }
    }

    /// Blocks about to leave `node`, subtracted from its utilization.
    pub fn count(&self, node: &NodeId, now: Instant) -> usize {
        self.intents
            .values()
            .flatten()
            .filter(|i| &i.node == node && alive(i.started_at, now, self.lease))
            .count()
    }

    pub fn intents(&self, block: &BlockId) -> Option<&[DeletionIntent]> {
        self.intents.get(block).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn block(s: &str) -> BlockId {
        BlockId::from(s)
    }

    #[test]
    fn test_replication_lease_expiry() {
        let t0 = Instant::now();
        let mut intents = ReplicationIntents::new();
        let b = block("blob:1");

        assert!(intents.add(b.clone(), Some(vec![node("a")]), vec![node("b")], t0));
        assert!(intents.in_progress(&b, t0 + Duration::from_secs(19)));
        assert!(!intents.add(b.clone(), None, vec![node("c")], t0 + Duration::from_secs(5)));

        assert!(!intents.in_progress(&b, t0 + Duration::from_secs(21)));
        assert!(intents.is_empty());
        assert!(intents.add(b.clone(), Some(vec![node("a")]), vec![node("c")], t0 + Duration::from_secs(21)));
    }

    #[test]
    fn test_get_marks_sent_and_renews_lease() {
        let t0 = Instant::now();
        let mut intents = ReplicationIntents::new();
        let b = block("blob:1");
        intents.add(b.clone(), Some(vec![node("a"), node("b")]), vec![node("c")], t0);

        assert!(intents.get(&node("c"), t0).is_empty());

        let t1 = t0 + Duration::from_secs(15);
        let actions = intents.get(&node("a"), t1);
        assert_eq!(actions, vec![(b.clone(), vec![node("c")])]);
        // Sent once; the other holder is not asked again.
        assert!(intents.get(&node("b"), t1).is_empty());

        // Lease restarted at t1.
        assert!(intents.in_progress(&b, t0 + Duration::from_secs(30)));
        assert!(!intents.in_progress(&b, t1 + Duration::from_secs(20)));
    }

    #[test]
    fn test_client_writes_are_never_dispatched() {
        let t0 = Instant::now();
        let mut intents = ReplicationIntents::new();
        let b = block("blob:new");
        intents.add(b.clone(), None, vec![node("a"), node("b")], t0);

        assert!(intents.get(&node("a"), t0).is_empty());
        assert_eq!(intents.count(&node("a"), t0), 1);
        assert_eq!(intents.count(&node("a"), t0 + Duration::from_secs(20)), 0);
    }

    #[test]
    fn test_done_removes_targets_then_intent() {
        let t0 = Instant::now();
        let mut intents = ReplicationIntents::new();
        let b = block("blob:1");
        intents.add(b.clone(), None, vec![node("a"), node("b")], t0);

        intents.done(&node("a"), &b);
        assert_eq!(intents.intent(&b).unwrap().forward_to, vec![node("b")]);
        intents.done(&node("x"), &b);
        assert!(intents.intent(&b).is_some());
        intents.done(&node("b"), &b);
        assert!(intents.intent(&b).is_none());
        // Unknown block is a no-op.
        intents.done(&node("b"), &b);
    }

    #[test]
    fn test_deletion_lifecycle() {
        let t0 = Instant::now();
        let mut intents = DeletionIntents::new();
        let b = block("blob:1");

        assert!(intents.add(b.clone(), vec![node("a"), node("b")], t0));
        assert!(!intents.add(b.clone(), vec![node("c")], t0));
        assert_eq!(intents.count(&node("a"), t0), 1);

        assert_eq!(intents.get(&node("a"), t0), vec![b.clone()]);
        assert!(intents.get(&node("a"), t0).is_empty());

        intents.done(&node("a"), &b);
        assert!(intents.in_progress(&b, t0));
        intents.done(&node("b"), &b);
        assert!(!intents.in_progress(&b, t0));
        assert!(intents.is_empty());
    }

    #[test]
    fn test_deletion_lease_expiry() {
        let t0 = Instant::now();
        let mut intents = DeletionIntents::new();
        let b = block("blob:1");
        intents.add(b.clone(), vec![node("a")], t0);

        assert!(intents.in_progress(&b, t0 + Duration::from_secs(19)));
        assert_eq!(intents.count(&node("a"), t0 + Duration::from_secs(21)), 0);
        assert!(!intents.in_progress(&b, t0 + Duration::from_secs(21)));
        assert!(intents.add(b, vec![node("a")], t0 + Duration::from_secs(21)));
    }
}
