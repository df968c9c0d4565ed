//! Durable blob to block-list mapping
//!
//! An append-only file of JSON lines, one per committed block, replayed into
//! an in-memory index on load. Lookups are exact-key only.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{BlobId, BlockId};

#[derive(Error, Debug)]
pub enum BlobLogError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Corrupt record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobRecord {
    blob: BlobId,
    block: BlockId,
    committed_at: DateTime<Utc>,
}

pub struct BlobLog {
    path: PathBuf,
    blobs: HashMap<BlobId, Vec<BlockId>>,
}

impl BlobLog {
    /// Replay the log at `path`, creating it if missing.
    ///
    /// A malformed final line is the remainder of an interrupted append and
    /// is ignored. A malformed line anywhere else is an error.
    pub fn load(path: &Path) -> Result<Self, BlobLogError> {
        let mut blobs: HashMap<BlobId, Vec<BlockId>> = HashMap::new();

        if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| BlobLogError::IoError(e.to_string()))?;
            let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            for (i, line) in lines.iter().enumerate() {
                match serde_json::from_str::<BlobRecord>(line) {
                    Ok(record) => blobs.entry(record.blob).or_default().push(record.block),
                    Err(e) if i + 1 == lines.len() => {
                        log::warn!("Ignoring truncated last record in '{}': {}", path.display(), e);
                    }
                    Err(e) => {
                        return Err(BlobLogError::Corrupt {
                            line: i + 1,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        } else if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| BlobLogError::IoError(e.to_string()))?;
            }
        }

        log::info!("Persistent storage at '{}' ({} blobs)", path.display(), blobs.len());
        Ok(Self {
            path: path.to_path_buf(),
            blobs,
        })
    }

    /// Record the blocks of `blob`, in order, after any already recorded.
    pub fn append(&mut self, blob: &BlobId, blocks: &[BlockId]) -> Result<(), BlobLogError> {
        let committed_at = Utc::now();
        let mut buf = String::new();
        for block in blocks {
            let record = BlobRecord {
                blob: blob.clone(),
                block: block.clone(),
                committed_at,
            };
            let line = serde_json::to_string(&record)
                .map_err(|e| BlobLogError::SerializationError(e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BlobLogError::IoError(e.to_string()))?;
        file.write_all(buf.as_bytes())
            .map_err(|e| BlobLogError::IoError(e.to_string()))?;
        file.sync_data().map_err(|e| BlobLogError::IoError(e.to_string()))?;

        self.blobs
            .entry(blob.clone())
            .or_default()
            .extend(blocks.iter().cloned());
        Ok(())
    }

    /// Blocks of `blob` in commit order; empty if unknown.
    pub fn get(&self, blob: &BlobId) -> Vec<BlockId> {
        self.blobs.get(blob).cloned().unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(v: &[&str]) -> Vec<BlockId> {
        v.iter().map(|s| BlockId::from(*s)).collect()
    }

    #[test]
    fn test_append_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.log");
        let blob = BlobId::from("b1");

        let mut log = BlobLog::load(&path).unwrap();
        assert!(log.get(&blob).is_empty());
        log.append(&blob, &blocks(&["b1:x", "b1:y"])).unwrap();
        log.append(&BlobId::from("b2"), &blocks(&["b2:z"])).unwrap();
        assert_eq!(log.get(&blob), blocks(&["b1:x", "b1:y"]));

        let reloaded = BlobLog::load(&path).unwrap();
        assert_eq!(reloaded.get(&blob), blocks(&["b1:x", "b1:y"]));
        assert_eq!(reloaded.get(&BlobId::from("b2")), blocks(&["b2:z"]));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_lookup_is_exact_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BlobLog::load(&dir.path().join("m.log")).unwrap();
        log.append(&BlobId::from("abc"), &blocks(&["abc:1"])).unwrap();
        assert!(log.get(&BlobId::from("ab")).is_empty());
        assert!(log.get(&BlobId::from("abc ")).is_empty());
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.log");
        let mut log = BlobLog::load(&path).unwrap();
        log.append(&BlobId::from("a"), &blocks(&["a:1"])).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"blob\":\"a\",\"blo").unwrap();

        let reloaded = BlobLog::load(&path).unwrap();
        assert_eq!(reloaded.get(&BlobId::from("a")), blocks(&["a:1"]));
    }

    #[test]
    fn test_corrupt_middle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.log");
        std::fs::write(&path, "garbage\n{\"also\":\"bad\"}\n").unwrap();
        assert!(matches!(
            BlobLog::load(&path),
            Err(BlobLogError::Corrupt { line: 1, .. })
        ));
    }
}
