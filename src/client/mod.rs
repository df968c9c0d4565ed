//! Typed clients for the coordinator and storage nodes
//!
//! `upload` and `download` drive a whole blob through the cluster; the CLI
//! and the scenario tests use them.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    checksum_to_string, BlobId, BlockId, ClientRequest, Connection, DataRequest, ForwardBlock,
    WireError, CHUNK_SIZE, ERR_NO_READ_LOCK,
};

/// Pause before retrying a block that is momentarily locked or unplaced.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);
/// Attempts per block before `download` gives up.
pub const DOWNLOAD_ATTEMPTS: usize = 50;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't connect to any storage node in: {}", .0.join(" "))]
    NoDataNode(Vec<String>),

    #[error("Block '{0}' is not available")]
    Unavailable(BlockId),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },
}

/// Session on the coordinator's client port.
pub struct CoordinatorClient {
    conn: Connection,
}

impl CoordinatorClient {
    pub async fn connect(addr: &str, debug: bool) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::connect(addr, debug).await?,
        })
    }

    pub async fn create_blob(&mut self) -> Result<BlobId, ClientError> {
        Ok(self.conn.call(&ClientRequest::CreateBlob).await?)
    }

    /// Ask for the next block of the open blob and where to send it.
    pub async fn append(&mut self) -> Result<ForwardBlock, ClientError> {
        Ok(self.conn.call(&ClientRequest::Append).await?)
    }

    pub async fn commit(&mut self) -> Result<(), ClientError> {
        Ok(self.conn.call(&ClientRequest::Commit).await?)
    }

    pub async fn get_blob(&mut self, blob: &BlobId) -> Result<Vec<BlockId>, ClientError> {
        Ok(self.conn.call(&ClientRequest::GetBlob(blob.clone())).await?)
    }

    pub async fn get_block(&mut self, block: &BlockId) -> Result<Vec<String>, ClientError> {
        Ok(self.conn.call(&ClientRequest::GetBlock(block.clone())).await?)
    }
}

/// Session on a storage node.
pub struct DataNodeClient {
    conn: Connection,
}

impl DataNodeClient {
    pub async fn connect(addr: &str, debug: bool) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Connection::connect(addr, debug).await?,
        })
    }

    /// Dial the first reachable address. Returns the client and the other
    /// addresses, in order, for the pipeline header.
    pub async fn connect_first(addrs: &[String], debug: bool) -> Result<(Self, Vec<String>), ClientError> {
        for (i, addr) in addrs.iter().enumerate() {
            match Self::connect(addr, debug).await {
                Ok(client) => {
                    let rest = addrs
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, a)| a.clone())
                        .collect();
                    return Ok((client, rest));
                }
                Err(e) => log::warn!("Couldn't reach storage node {}: {}", addr, e),
            }
        }
        Err(ClientError::NoDataNode(addrs.to_vec()))
    }

    /// Send a block: header, exactly `header.size` bytes from `reader`, then
    /// the checksum. Returns the CRC32 of the bytes sent.
    pub async fn put_block<R>(&mut self, header: &ForwardBlock, reader: &mut R) -> Result<u32, ClientError>
    where
        R: AsyncRead + Unpin,
    {
        self.conn
            .call::<_, ()>(&DataRequest::Forward(header.clone()))
            .await?;

        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = header.size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(ClientError::ShortRead {
                    expected: header.size,
                    actual: header.size - remaining,
                });
            }
            hasher.update(&buf[..n]);
            self.conn.writer_mut().write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        self.conn.writer_mut().flush().await?;

        let checksum = hasher.finalize();
        self.conn
            .call::<_, ()>(&DataRequest::Confirm(checksum_to_string(checksum)))
            .await?;
        Ok(checksum)
    }

    /// Fetch a block into `writer`. Returns the byte count.
    pub async fn get_block<W>(&mut self, block: &BlockId, writer: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let size: u64 = self.conn.call(&DataRequest::Get(block.clone())).await?;
        let mut payload = self.conn.reader_mut().take(size);
        let copied = tokio::io::copy(&mut payload, writer).await?;
        if copied != size {
            return Err(ClientError::ShortRead {
                expected: size,
                actual: copied,
            });
        }
        writer.flush().await?;
        Ok(copied)
    }
}

/// Store `size` bytes from `reader` as a new blob and return its id.
pub async fn upload<R>(coordinator: &str, reader: &mut R, size: u64, debug: bool) -> Result<BlobId, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut client = CoordinatorClient::connect(coordinator, debug).await?;
    let blob = client.create_blob().await?;

    let mut left = size;
    while left > 0 {
        let placement = client.append().await?;
        let block_size = placement.size.min(left);

        let (mut node, forward_to) = DataNodeClient::connect_first(&placement.nodes, debug).await?;
        let header = ForwardBlock {
            block_id: placement.block_id.clone(),
            nodes: forward_to,
            size: block_size,
        };
        let checksum = node.put_block(&header, reader).await?;
        log::info!("Uploaded block '{}' with checksum {}", header.block_id, checksum);
        left -= block_size;
    }

    client.commit().await?;
    Ok(blob)
}

/// Write every block of `blob`, in order, into `writer`. Returns the byte
/// count.
pub async fn download<W>(coordinator: &str, blob: &BlobId, writer: &mut W, debug: bool) -> Result<u64, ClientError>
where
    W: AsyncWrite + Unpin,
{
    let mut client = CoordinatorClient::connect(coordinator, debug).await?;
    let blocks = client.get_blob(blob).await?;

    let mut total = 0;
    for block in &blocks {
        total += download_block(&mut client, block, writer, debug).await?;
    }
    Ok(total)
}

async fn download_block<W>(
    client: &mut CoordinatorClient,
    block: &BlockId,
    writer: &mut W,
    debug: bool,
) -> Result<u64, ClientError>
where
    W: AsyncWrite + Unpin,
{
    for _ in 0..DOWNLOAD_ATTEMPTS {
        for addr in client.get_block(block).await? {
            let mut node = match DataNodeClient::connect(&addr, debug).await {
                Ok(node) => node,
                Err(e) => {
                    log::warn!("Couldn't reach {} for block '{}': {}", addr, block, e);
                    continue;
                }
            };
            match node.get_block(block, writer).await {
                Ok(n) => return Ok(n),
                Err(ClientError::Wire(e)) if e.is_remote(ERR_NO_READ_LOCK) => {
                    log::debug!("Block '{}' is locked at {}", block, addr);
                }
                Err(e) => return Err(e),
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
    Err(ClientError::Unavailable(block.clone()))
}
