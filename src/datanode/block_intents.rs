//! Per-block gate serializing receive, read and delete on one storage node
//!
//! Rules:
//! - a block that is not yet installed can be neither read nor deleted
//! - a received block replaces the stored copy only after the readers
//!   already inside have left; new readers wait out the swap
//! - a block marked for deletion rejects new readers and new receives
//!   immediately, and the deleter waits for readers and receives in flight
//! - the delete mark survives any receive that finishes during the wait
//! - unrelated blocks never wait on each other

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

use crate::protocol::BlockId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Can't lock block {0} for reading")]
    CannotLock(BlockId),

    #[error("Block {0} is being deleted")]
    BeingDeleted(BlockId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Absent,
    Receiving,
    Present,
    Deleting,
}

#[derive(Debug)]
struct BlockEntry {
    present: bool,
    deleting: bool,
    /// Receives between `lock_receive` and their commit or abort.
    receivers: usize,
    /// Receives waiting for, or holding, the install slot.
    installers: usize,
    installing: bool,
    readers: usize,
    changed: Arc<Notify>,
}

impl Default for BlockEntry {
    fn default() -> Self {
        Self {
            present: false,
            deleting: false,
            receivers: 0,
            installers: 0,
            installing: false,
            readers: 0,
            changed: Arc::new(Notify::new()),
        }
    }
}

impl BlockEntry {
    fn readable(&self) -> bool {
        self.present && !self.deleting && self.installers == 0
    }

    fn idle(&self) -> bool {
        !self.present
            && !self.deleting
            && self.receivers == 0
            && self.installers == 0
            && self.readers == 0
    }

    fn state(&self) -> BlockState {
        if self.deleting {
            BlockState::Deleting
        } else if self.present {
            BlockState::Present
        } else if self.receivers > 0 {
            BlockState::Receiving
        } else {
            BlockState::Absent
        }
    }
}

#[derive(Debug, Default)]
pub struct BlockIntents {
    blocks: Mutex<HashMap<BlockId, BlockEntry>>,
}

impl BlockIntents {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<BlockId, BlockEntry>> {
        // Entries stay consistent even if a holder panicked mid-update.
        self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `update` to the entry, wake waiters and drop the entry once
    /// nothing refers to it any more.
    fn release(&self, block: &BlockId, update: impl FnOnce(&mut BlockEntry)) {
        let mut blocks = self.entries();
        if let Some(entry) = blocks.get_mut(block) {
            update(entry);
            entry.changed.notify_waiters();
            if entry.idle() {
                blocks.remove(block);
            }
        }
    }

    /// Wait until `ready` holds for the entry. `ready` runs under the map
    /// lock and may claim the entry as it returns true.
    async fn wait_for(&self, block: &BlockId, mut ready: impl FnMut(&mut BlockEntry) -> bool) {
        loop {
            let changed = {
                let mut blocks = self.entries();
                let entry = blocks.entry(block.clone()).or_default();
                if ready(entry) {
                    return;
                }
                Arc::clone(&entry.changed)
            };

            let notified = changed.notified();
            tokio::pin!(notified);
            // Register before checking again so a release in between is not missed.
            notified.as_mut().enable();
            {
                let mut blocks = self.entries();
                let entry = blocks.entry(block.clone()).or_default();
                if !Arc::ptr_eq(&entry.changed, &changed) {
                    continue;
                }
                if ready(entry) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Start receiving a block. A repeated receive of a stored block is a
    /// retried replication; the stored copy stays readable until the new
    /// one is installed.
    pub fn lock_receive(&self, block: &BlockId) -> Result<(), LockError> {
        let mut blocks = self.entries();
        let entry = blocks.entry(block.clone()).or_default();
        if entry.deleting {
            return Err(LockError::BeingDeleted(block.clone()));
        }
        entry.receivers += 1;
        Ok(())
    }

    /// Take the exclusive right to swap the received bytes into place.
    /// New readers are turned away at once; returns when the readers
    /// already inside have left.
    pub async fn lock_install(&self, block: &BlockId) {
        self.entries().entry(block.clone()).or_default().installers += 1;
        self.wait_for(block, |entry| {
            if entry.installing || entry.readers > 0 {
                return false;
            }
            entry.installing = true;
            true
        })
        .await;
    }

    /// Give the install slot back without committing.
    pub fn unlock_install(&self, block: &BlockId) {
        self.release(block, |entry| {
            if entry.installing {
                entry.installing = false;
                entry.installers = entry.installers.saturating_sub(1);
            }
        });
    }

    /// The received block is in place. Also releases the install slot.
    /// A pending delete mark is kept.
    pub fn commit_receive(&self, block: &BlockId) {
        self.entries().entry(block.clone()).or_default();
        self.release(block, |entry| {
            if entry.installing {
                entry.installing = false;
                entry.installers = entry.installers.saturating_sub(1);
            }
            entry.receivers = entry.receivers.saturating_sub(1);
            entry.present = true;
        });
    }

    /// Give up on a receive. A copy stored before it is untouched; the
    /// caller removes the staged bytes.
    pub fn abort_receive(&self, block: &BlockId) {
        self.release(block, |entry| {
            entry.receivers = entry.receivers.saturating_sub(1);
        });
    }

    pub fn lock_read(&self, block: &BlockId) -> Result<(), LockError> {
        let mut blocks = self.entries();
        match blocks.get_mut(block) {
            Some(entry) if entry.readable() => {
                entry.readers += 1;
                Ok(())
            }
            _ => Err(LockError::CannotLock(block.clone())),
        }
    }

    /// Like `lock_read`, but the lock is released when the guard drops.
    pub fn read_guard(&self, block: &BlockId) -> Result<ReadGuard<'_>, LockError> {
        self.lock_read(block)?;
        Ok(ReadGuard {
            intents: self,
            block: block.clone(),
        })
    }

    pub fn unlock_read(&self, block: &BlockId) {
        self.release(block, |entry| {
            entry.readers = entry.readers.saturating_sub(1);
        });
    }

    /// Mark the block for deletion, then wait until every reader and every
    /// receive that got in before the mark has left.
    pub async fn lock_delete(&self, block: &BlockId) {
        self.wait_for(block, |entry| {
            entry.deleting = true;
            entry.readers == 0 && entry.receivers == 0
        })
        .await;
    }

    /// Forget the block after its file is gone.
    pub fn commit_delete(&self, block: &BlockId) {
        if let Some(entry) = self.entries().remove(block) {
            entry.changed.notify_waiters();
        }
    }

    /// Mark blocks found on disk as present, leaving blocks that are mid
    /// install or mid delete alone. Returns the blocks now present.
    pub fn reinit_present(&self, on_disk: &[BlockId]) -> Vec<BlockId> {
        let mut blocks = self.entries();
        let mut present = Vec::with_capacity(on_disk.len());
        for block in on_disk {
            let entry = blocks.entry(block.clone()).or_default();
            if !entry.deleting && entry.installers == 0 {
                entry.present = true;
            }
            if entry.present && !entry.deleting {
                present.push(block.clone());
            } else if entry.idle() {
                blocks.remove(block);
            }
        }
        present
    }

    pub fn state(&self, block: &BlockId) -> BlockState {
        self.entries()
            .get(block)
            .map(|e| e.state())
            .unwrap_or(BlockState::Absent)
    }

    pub fn readers(&self, block: &BlockId) -> usize {
        self.entries().get(block).map(|e| e.readers).unwrap_or(0)
    }

    /// Blocks stored and not marked for deletion, for integrity scans.
    pub fn present_blocks(&self) -> Vec<BlockId> {
        let mut present: Vec<BlockId> = self
            .entries()
            .iter()
            .filter(|(_, e)| e.state() == BlockState::Present)
            .map(|(id, _)| id.clone())
            .collect();
        present.sort();
        present
    }

    /// Utilization reported to the coordinator.
    pub fn present_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|e| e.state() == BlockState::Present)
            .count()
    }
}

/// Read lock on one block, released on drop.
pub struct ReadGuard<'a> {
    intents: &'a BlockIntents,
    block: BlockId,
}

impl ReadGuard<'_> {
    pub fn block(&self) -> &BlockId {
        &self.block
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.intents.unlock_read(&self.block);
    }
}
