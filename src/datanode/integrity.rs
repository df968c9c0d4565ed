//! Background verification of stored blocks against their checksums

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{checksum_from_str, BlockId};

use super::{DataNode, StoreError};

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("checksum unavailable: {0}")]
    MissingChecksum(StoreError),

    #[error("unreadable checksum {0:?}")]
    UnreadableChecksum(String),

    #[error("block unreadable: {0}")]
    UnreadableBlock(StoreError),

    #[error("stored checksum {stored}, computed {computed}")]
    Mismatch { stored: u32, computed: u32 },
}

impl DataNode {
    /// Verify every present block and remove the corrupt ones in the
    /// background. Blocks that can't be read-locked right now are skipped.
    /// Returns the blocks found corrupt.
    pub async fn check_integrity(self: &Arc<Self>) -> Vec<BlockId> {
        let mut corrupt = Vec::new();

        for block in self.intents.present_blocks() {
            let guard = match self.intents.read_guard(&block) {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            let verdict = self.verify_block(&block).await;
            drop(guard);

            if let Err(e) = verdict {
                log::warn!("Block '{}' failed integrity check: {}", block, e);
                corrupt.push(block);
            }
        }

        for block in &corrupt {
            let node = Arc::clone(self);
            let block = block.clone();
            tokio::spawn(async move { node.remove_block(&block).await });
        }
        corrupt
    }

    pub async fn verify_block(&self, block: &BlockId) -> Result<(), IntegrityError> {
        let text = self
            .store
            .read_checksum(block)
            .await
            .map_err(IntegrityError::MissingChecksum)?;
        let stored = checksum_from_str(&text)
            .ok_or_else(|| IntegrityError::UnreadableChecksum(text.trim().to_string()))?;
        let computed = self
            .store
            .local_checksum(block)
            .await
            .map_err(IntegrityError::UnreadableBlock)?;
        if stored != computed {
            return Err(IntegrityError::Mismatch { stored, computed });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datanode::{BlockState, DataNodeConfig};
    use std::time::Duration;

    async fn start_node(dir: &tempfile::TempDir) -> Arc<DataNode> {
        let config = DataNodeConfig {
            data_dir: dir.path().to_path_buf(),
            listen_addr: "127.0.0.1:0".to_string(),
            coordinator_addr: "127.0.0.1:1".to_string(),
            heartbeat_interval: Duration::from_secs(3600),
            integrity_interval: Duration::from_secs(3600),
            debug: false,
        };
        DataNode::start(config).await.unwrap()
    }

    async fn seed(node: &DataNode, block: &BlockId, data: &[u8], with_sidecar: bool) {
        let checksum = node
            .store
            .write_block(block, data.len() as u64, &mut &data[..])
            .await
            .unwrap();
        if with_sidecar {
            node.store.write_checksum_value(block, checksum).await.unwrap();
        }
        node.intents.commit_receive(block);
    }

    async fn wait_absent(node: &DataNode, block: &BlockId) {
        for _ in 0..200 {
            if node.intents.state(block) == BlockState::Absent {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("block {} was never removed", block);
    }

    #[tokio::test]
    async fn test_corrupt_and_unsealed_blocks_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let node = start_node(&dir).await;

        let good = BlockId::from("blob:good");
        let flipped = BlockId::from("blob:flipped");
        let unsealed = BlockId::from("blob:unsealed");
        seed(&node, &good, b"fine", true).await;
        seed(&node, &flipped, b"data", true).await;
        seed(&node, &unsealed, b"nosum", false).await;

        let path = node.store.blocks_directory().join(flipped.as_str());
        tokio::fs::write(&path, b"dat4").await.unwrap();

        let corrupt = node.check_integrity().await;
        assert_eq!(corrupt, vec![flipped.clone(), unsealed.clone()]);

        wait_absent(&node, &flipped).await;
        wait_absent(&node, &unsealed).await;
        assert_eq!(node.intents.state(&good), BlockState::Present);
        assert!(!node.store.has_block_file(&flipped).await);

        let mut dead = node.pending_dead_blocks();
        dead.sort();
        assert_eq!(dead, vec![flipped, unsealed]);
        node.stop();
    }

    #[tokio::test]
    async fn test_blocks_being_received_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let node = start_node(&dir).await;
        let block = BlockId::from("blob:incoming");
        node.intents.lock_receive(&block).unwrap();

        // A stored copy mid swap has a stale sidecar on purpose.
        let swapping = BlockId::from("blob:swapping");
        seed(&node, &swapping, b"old", true).await;
        node.store.write_checksum_value(&swapping, crc32fast::hash(b"new")).await.unwrap();
        node.intents.lock_receive(&swapping).unwrap();
        node.intents.lock_install(&swapping).await;

        assert!(node.check_integrity().await.is_empty());
        assert_eq!(node.intents.state(&block), BlockState::Receiving);
        assert_eq!(node.intents.state(&swapping), BlockState::Present);
        node.stop();
    }
}
