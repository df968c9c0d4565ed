//! Block deltas waiting to be reported in a heartbeat
//!
//! A heartbeat takes a snapshot of the queue and commits it only after the
//! coordinator accepted the report, so a failed or rejected heartbeat loses
//! nothing. Items pushed while a heartbeat is in flight stay queued.

use std::sync::{Mutex, MutexGuard};

use crate::protocol::BlockId;

#[derive(Debug, Default)]
pub struct PendingBlocks {
    items: Mutex<Vec<BlockId>>,
}

impl PendingBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, Vec<BlockId>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, block: BlockId) {
        self.items().push(block);
    }

    /// Everything queued right now, without removing it.
    pub fn snapshot(&self) -> Vec<BlockId> {
        self.items().clone()
    }

    /// Drop the first `count` items, i.e. a snapshot the coordinator accepted.
    pub fn commit(&self, count: usize) {
        let mut items = self.items();
        let count = count.min(items.len());
        items.drain(..count);
    }
}
