//! Filesystem persistence for block bytes and their CRC32 sidecars
//!
//! Layout under the data directory:
//! `blocks/<block id>` holds the bytes, `meta/<block id>.crc32` the checksum
//! as a decimal string. Receives land in `incoming/` first and are renamed
//! into `blocks/` once confirmed. No locking here; callers go through
//! `BlockIntents`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use uuid::Uuid;

use crate::protocol::{checksum_to_string, BlockId, CHUNK_SIZE};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    #[error("Invalid block id: {0}")]
    InvalidBlockId(String),
}

/// Received bytes waiting in `incoming/` for their block to be installed.
#[derive(Debug)]
pub struct StagedBlock {
    block: BlockId,
    path: PathBuf,
    checksum: u32,
}

impl StagedBlock {
    pub fn block(&self) -> &BlockId {
        &self.block
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

#[derive(Debug, Clone)]
pub struct BlockStore {
    data_dir: PathBuf,
}

impl BlockStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Create the block and checksum directories. Receives left over from
    /// a previous run were never confirmed and are dropped.
    pub async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.blocks_directory()).await?;
        fs::create_dir_all(self.meta_directory()).await?;
        if fs::metadata(self.incoming_directory()).await.is_ok() {
            fs::remove_dir_all(self.incoming_directory()).await?;
        }
        fs::create_dir_all(self.incoming_directory()).await?;
        log::info!("Block storage in directory '{}'", self.blocks_directory().display());
        Ok(())
    }

    pub fn blocks_directory(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn meta_directory(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    pub fn incoming_directory(&self) -> PathBuf {
        self.data_dir.join("incoming")
    }

    fn block_filename(&self, block: &BlockId) -> Result<PathBuf, StoreError> {
        validate_block_id(block)?;
        Ok(self.blocks_directory().join(block.as_str()))
    }

    fn checksum_filename(&self, block: &BlockId) -> Result<PathBuf, StoreError> {
        validate_block_id(block)?;
        Ok(self.meta_directory().join(format!("{}.crc32", block)))
    }

    pub async fn block_size(&self, block: &BlockId) -> Result<u64, StoreError> {
        let meta = fs::metadata(self.block_filename(block)?).await?;
        Ok(meta.len())
    }

    /// Stream exactly `size` bytes from `reader` into a new block file and
    /// return their CRC32. Early EOF is an error; the partial file stays for
    /// the caller to remove.
    pub async fn write_block<R>(
        &self,
        block: &BlockId,
        size: u64,
        reader: &mut R,
    ) -> Result<u32, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = File::create(self.block_filename(block)?).await?;
        copy_exact(&mut file, size, reader).await
    }

    /// Like `write_block`, but into a fresh file under `incoming/`. The
    /// stored copy, if any, is untouched until `install_block`. A failed
    /// transfer leaves nothing behind.
    pub async fn stage_block<R>(
        &self,
        block: &BlockId,
        size: u64,
        reader: &mut R,
    ) -> Result<StagedBlock, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        validate_block_id(block)?;
        let path = self.incoming_directory().join(Uuid::new_v4().to_string());
        let mut file = File::create(&path).await?;

        match copy_exact(&mut file, size, reader).await {
            Ok(checksum) => Ok(StagedBlock {
                block: block.clone(),
                path,
                checksum,
            }),
            Err(e) => {
                drop(file);
                if let Err(rm) = fs::remove_file(&path).await {
                    log::debug!("Removing staged '{}': {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }

    /// Write the sidecar and move the staged bytes over the block file.
    pub async fn install_block(&self, staged: &StagedBlock) -> Result<(), StoreError> {
        self.write_checksum_value(&staged.block, staged.checksum).await?;
        fs::rename(&staged.path, self.block_filename(&staged.block)?).await?;
        Ok(())
    }

    /// Drop staged bytes that will not be installed.
    pub async fn discard_staged(&self, staged: &StagedBlock) {
        if let Err(e) = fs::remove_file(&staged.path).await {
            log::debug!("Discarding staged '{}': {}", staged.block, e);
        }
    }

    /// Stream the whole stored block into `writer`. Returns the byte count.
    pub async fn read_block<W>(&self, block: &BlockId, writer: &mut W) -> Result<u64, StoreError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut file = File::open(self.block_filename(block)?).await?;
        let copied = tokio::io::copy(&mut file, writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    /// Recompute the CRC32 of the bytes currently on disk.
    pub async fn local_checksum(&self, block: &BlockId) -> Result<u32, StoreError> {
        let mut file = File::open(self.block_filename(block)?).await?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    pub async fn read_checksum(&self, block: &BlockId) -> Result<String, StoreError> {
        Ok(fs::read_to_string(self.checksum_filename(block)?).await?)
    }

    pub async fn write_checksum(&self, block: &BlockId, checksum: &str) -> Result<(), StoreError> {
        fs::write(self.checksum_filename(block)?, checksum.as_bytes()).await?;
        Ok(())
    }

    /// Convenience for writers that hold the numeric checksum.
    pub async fn write_checksum_value(&self, block: &BlockId, checksum: u32) -> Result<(), StoreError> {
        self.write_checksum(block, &checksum_to_string(checksum)).await
    }

    /// Every block file currently on disk.
    pub async fn read_block_list(&self) -> Result<Vec<BlockId>, StoreError> {
        let mut entries = fs::read_dir(self.blocks_directory()).await?;
        let mut blocks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                blocks.push(BlockId::from(name));
            }
        }
        blocks.sort();
        Ok(blocks)
    }

    /// Remove the block file and its sidecar. Both removals are attempted;
    /// failures are logged and the first one is returned. Nothing is rolled
    /// back.
    pub async fn delete_block(&self, block: &BlockId) -> Result<(), StoreError> {
        let block_result = fs::remove_file(self.block_filename(block)?).await;
        if let Err(e) = &block_result {
            log::warn!("Removing block file '{}': {}", block, e);
        }
        let checksum_result = fs::remove_file(self.checksum_filename(block)?).await;
        if let Err(e) = &checksum_result {
            log::warn!("Removing checksum of '{}': {}", block, e);
        }
        block_result?;
        checksum_result?;
        Ok(())
    }

    pub async fn has_block_file(&self, block: &BlockId) -> bool {
        match self.block_filename(block) {
            Ok(path) => fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }
}

async fn copy_exact<R>(file: &mut File, size: u64, reader: &mut R) -> Result<u32, StoreError>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = size;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(StoreError::ShortTransfer {
                expected: size,
                actual: size - remaining,
            });
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;

    Ok(hasher.finalize())
}

/// Block ids become file names, so they must stay inside the directory.
pub fn validate_block_id(block: &BlockId) -> Result<(), StoreError> {
    let s = block.as_str();
    if s.is_empty() || s == "." || s == ".." || s.contains('/') || s.contains('\\') || s.contains('\0') {
        return Err(StoreError::InvalidBlockId(s.to_string()));
    }
    Ok(())
}
