//! One connection to a storage node
//!
//! A session starts ready to accept `Forward` or `Get`. `Forward` moves it to
//! awaiting a `Confirm`; after `Confirm` the session is done. `Get` keeps the
//! session where it was, so one connection can fetch several blocks.
//!
//! Forwarded bytes are staged and only replace the stored block once the
//! checksum matches and the readers of the old copy have left.

use std::sync::Arc;

use crate::protocol::{
    checksum_from_str, BlockId, Connection, DataRequest, ForwardBlock, WireError,
    ERR_BAD_SIZE, ERR_CHECKSUM_MISMATCH, ERR_METHOD_NOT_ACCEPTED, ERR_NO_READ_LOCK,
    ERR_SESSION_STATE, MAX_BLOCK_SIZE,
};

use super::block_store::validate_block_id;
use super::{DataNode, DataNodeError, StagedBlock};

enum SessionState {
    Start,
    ReadyToConfirm {
        staged: StagedBlock,
        forward_to: Vec<String>,
    },
    Done,
}

pub(crate) async fn serve(node: Arc<DataNode>, mut conn: Connection) {
    if let Err(e) = run(&node, &mut conn).await {
        log::warn!("Session with {} ended: {}", conn.peer(), e);
    }
}

async fn run(node: &DataNode, conn: &mut Connection) -> Result<(), DataNodeError> {
    let mut state = SessionState::Start;
    let result = handle_requests(node, conn, &mut state).await;

    if let SessionState::ReadyToConfirm { staged, .. } = &state {
        log::warn!("Block '{}' from {} was never confirmed", staged.block(), conn.peer());
        discard(node, staged).await;
    }
    result
}

async fn handle_requests(
    node: &DataNode,
    conn: &mut Connection,
    state: &mut SessionState,
) -> Result<(), DataNodeError> {
    while !matches!(state, SessionState::Done) {
        let request = match conn.recv::<DataRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(WireError::Decode(e)) => {
                log::warn!("Undecodable request from {}: {}", conn.peer(), e);
                conn.reply_err(ERR_METHOD_NOT_ACCEPTED).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let current = std::mem::replace(state, SessionState::Done);
        *state = match (request, current) {
            (DataRequest::Forward(header), SessionState::Start) => {
                receive_block(node, conn, header).await?
            }
            (
                DataRequest::Confirm(checksum),
                SessionState::ReadyToConfirm { staged, forward_to },
            ) => confirm_block(node, conn, staged, forward_to, &checksum).await?,
            (DataRequest::Get(block), SessionState::Start) => {
                serve_get(node, conn, &block).await?;
                SessionState::Start
            }
            (request, current) => {
                log::warn!("Rejected {:?} from {}: wrong session state", request, conn.peer());
                *state = current;
                conn.reply_err(ERR_SESSION_STATE).await?;
                std::mem::replace(state, SessionState::Done)
            }
        };
    }

    Ok(())
}

/// Accept a block header and stage the payload on disk.
async fn receive_block(
    node: &DataNode,
    conn: &mut Connection,
    header: ForwardBlock,
) -> Result<SessionState, DataNodeError> {
    let ForwardBlock { block_id: block, nodes, size } = header;

    if size == 0 || size > MAX_BLOCK_SIZE {
        log::warn!("Rejected block '{}' of size {}", block, size);
        conn.reply_err(ERR_BAD_SIZE).await?;
        return Ok(SessionState::Start);
    }
    if let Err(e) = validate_block_id(&block) {
        conn.reply_err(&e.to_string()).await?;
        return Ok(SessionState::Start);
    }
    if let Err(e) = node.intents.lock_receive(&block) {
        log::warn!("Rejected block '{}': {}", block, e);
        conn.reply_err(&e.to_string()).await?;
        return Ok(SessionState::Start);
    }
    if let Err(e) = conn.reply_ok(()).await {
        node.intents.abort_receive(&block);
        return Err(e.into());
    }

    log::info!("Receiving block '{}' ({} bytes) from {}", block, size, conn.peer());
    match node.store.stage_block(&block, size, conn.reader_mut()).await {
        Ok(staged) => Ok(SessionState::ReadyToConfirm {
            staged,
            forward_to: nodes,
        }),
        Err(e) => {
            node.intents.abort_receive(&block);
            Err(e.into())
        }
    }
}

async fn confirm_block(
    node: &DataNode,
    conn: &mut Connection,
    staged: StagedBlock,
    forward_to: Vec<String>,
    remote: &str,
) -> Result<SessionState, DataNodeError> {
    let block = staged.block().clone();
    if checksum_from_str(remote) != Some(staged.checksum()) {
        log::warn!(
            "Checksum mismatch for block '{}': sender {}, received {}",
            block,
            remote.trim(),
            staged.checksum()
        );
        discard(node, &staged).await;
        conn.reply_err(ERR_CHECKSUM_MISMATCH).await?;
        return Ok(SessionState::Done);
    }

    node.intents.lock_install(&block).await;
    if let Err(e) = node.store.install_block(&staged).await {
        node.intents.unlock_install(&block);
        discard(node, &staged).await;
        conn.reply_err(&e.to_string()).await?;
        return Err(e.into());
    }
    node.intents.commit_receive(&block);
    node.have_block(block.clone());
    log::info!("Stored block '{}'", block);

    if !forward_to.is_empty() {
        node.enqueue_forward(ForwardBlock {
            block_id: block,
            nodes: forward_to,
            size: 0,
        });
    }

    conn.reply_ok(()).await?;
    Ok(SessionState::Done)
}

async fn serve_get(node: &DataNode, conn: &mut Connection, block: &BlockId) -> Result<(), DataNodeError> {
    let _guard = match node.intents.read_guard(block) {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("{}", e);
            conn.reply_err(ERR_NO_READ_LOCK).await?;
            return Ok(());
        }
    };

    let size = match node.store.block_size(block).await {
        Ok(size) => size,
        Err(e) => {
            conn.reply_err(&e.to_string()).await?;
            return Ok(());
        }
    };

    conn.reply_ok(size).await?;
    node.store.read_block(block, conn.writer_mut()).await?;
    log::info!("Sent block '{}' to {}", block, conn.peer());
    Ok(())
}

/// Drop a receive that never completed. A copy stored earlier stays.
async fn discard(node: &DataNode, staged: &StagedBlock) {
    node.store.discard_staged(staged).await;
    node.intents.abort_receive(staged.block());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datanode::{BlockState, DataNodeConfig};
    use crate::protocol::checksum_to_string;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_node() -> (tempfile::TempDir, Arc<DataNode>) {
        let dir = tempfile::tempdir().unwrap();
        let config = DataNodeConfig {
            data_dir: dir.path().to_path_buf(),
            listen_addr: "127.0.0.1:0".to_string(),
            // Nothing listens here; heartbeats just fail.
            coordinator_addr: "127.0.0.1:1".to_string(),
            heartbeat_interval: Duration::from_secs(3600),
            integrity_interval: Duration::from_secs(3600),
            debug: false,
        };
        let node = DataNode::start(config).await.unwrap();
        (dir, node)
    }

    async fn connect(node: &DataNode) -> Connection {
        Connection::connect(&node.addr().to_string(), false).await.unwrap()
    }

    fn header(block: &BlockId, size: u64) -> DataRequest {
        DataRequest::Forward(ForwardBlock {
            block_id: block.clone(),
            nodes: vec![],
            size,
        })
    }

    #[tokio::test]
    async fn test_forward_confirm_then_get() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:1");
        let data = b"hello block".to_vec();

        let mut conn = connect(&node).await;
        conn.call::<_, ()>(&header(&block, data.len() as u64)).await.unwrap();
        conn.writer_mut().write_all(&data).await.unwrap();
        let checksum = checksum_to_string(crc32fast::hash(&data));
        conn.call::<_, ()>(&DataRequest::Confirm(checksum.clone())).await.unwrap();

        assert_eq!(node.intents.state(&block), BlockState::Present);
        assert_eq!(node.pending_new_blocks(), vec![block.clone()]);
        assert_eq!(node.store.read_checksum(&block).await.unwrap(), checksum);

        let mut conn = connect(&node).await;
        let size: u64 = conn.call(&DataRequest::Get(block.clone())).await.unwrap();
        assert_eq!(size, data.len() as u64);
        let mut out = vec![0u8; size as usize];
        conn.reader_mut().read_exact(&mut out).await.unwrap();
        assert_eq!(out, data);

        // Session still accepts a second Get.
        let again: u64 = conn.call(&DataRequest::Get(block.clone())).await.unwrap();
        assert_eq!(again, size);
        node.stop();
    }

    #[tokio::test]
    async fn test_oversized_forward_creates_nothing() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:huge");

        let mut conn = connect(&node).await;
        let err = conn
            .call::<_, ()>(&header(&block, MAX_BLOCK_SIZE + 1))
            .await
            .unwrap_err();
        assert!(err.is_remote(ERR_BAD_SIZE));
        let err = conn.call::<_, ()>(&header(&block, 0)).await.unwrap_err();
        assert!(err.is_remote(ERR_BAD_SIZE));

        assert!(!node.store.has_block_file(&block).await);
        assert_eq!(node.intents.state(&block), BlockState::Absent);
        node.stop();
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_block() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:bad");

        let mut conn = connect(&node).await;
        conn.call::<_, ()>(&header(&block, 4)).await.unwrap();
        conn.writer_mut().write_all(b"abcd").await.unwrap();
        let wrong = checksum_to_string(crc32fast::hash(b"abce"));
        let err = conn
            .call::<_, ()>(&DataRequest::Confirm(wrong))
            .await
            .unwrap_err();
        assert!(err.is_remote(ERR_CHECKSUM_MISMATCH));

        assert!(!node.store.has_block_file(&block).await);
        assert!(node.pending_new_blocks().is_empty());

        let mut conn = connect(&node).await;
        let err = conn
            .call::<_, u64>(&DataRequest::Get(block.clone()))
            .await
            .unwrap_err();
        assert!(err.is_remote(ERR_NO_READ_LOCK));
        node.stop();
    }

    #[tokio::test]
    async fn test_out_of_order_requests_are_rejected() {
        let (_dir, node) = start_node().await;
        let mut conn = connect(&node).await;

        let err = conn
            .call::<_, ()>(&DataRequest::Confirm("1".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_remote(ERR_SESSION_STATE));

        conn.writer_mut().write_all(b"{\"method\":\"Nope\"}\n").await.unwrap();
        let reply: crate::protocol::Reply<()> = conn.recv().await.unwrap().unwrap();
        assert_eq!(reply, Err(ERR_METHOD_NOT_ACCEPTED.to_string()));

        let err = conn
            .call::<_, u64>(&DataRequest::Get(BlockId::from("missing")))
            .await
            .unwrap_err();
        assert!(err.is_remote(ERR_NO_READ_LOCK));
        node.stop();
    }

    #[tokio::test]
    async fn test_truncated_transfer_leaves_no_block() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:cut");

        let mut conn = connect(&node).await;
        conn.call::<_, ()>(&header(&block, 1000)).await.unwrap();
        conn.writer_mut().write_all(&[7u8; 100]).await.unwrap();
        drop(conn);

        for _ in 0..100 {
            if node.intents.state(&block) == BlockState::Absent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.intents.state(&block), BlockState::Absent);
        assert!(!node.store.has_block_file(&block).await);
        node.stop();
    }

    #[tokio::test]
    async fn test_disconnect_before_confirm_discards_block() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:unconfirmed");

        let mut conn = connect(&node).await;
        conn.call::<_, ()>(&header(&block, 3)).await.unwrap();
        conn.writer_mut().write_all(b"xyz").await.unwrap();
        conn.writer_mut().flush().await.unwrap();
        assert_eq!(node.intents.state(&block), BlockState::Receiving);
        drop(conn);

        for _ in 0..100 {
            if node.intents.state(&block) == BlockState::Absent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.intents.state(&block), BlockState::Absent);
        assert!(!node.store.has_block_file(&block).await);
        assert!(node.pending_new_blocks().is_empty());
        let mut incoming = tokio::fs::read_dir(node.store.incoming_directory()).await.unwrap();
        assert!(incoming.next_entry().await.unwrap().is_none());
        node.stop();
    }

    // ---------------------------------------------------------------------------
    // Repeated receives of a stored block
    // ---------------------------------------------------------------------------

    async fn put(node: &DataNode, block: &BlockId, data: &[u8]) -> Result<(), WireError> {
        let mut conn = connect(node).await;
        conn.call::<_, ()>(&header(block, data.len() as u64)).await?;
        conn.writer_mut().write_all(data).await?;
        let checksum = checksum_to_string(crc32fast::hash(data));
        conn.call::<_, ()>(&DataRequest::Confirm(checksum)).await
    }

    async fn get(conn: &mut Connection, block: &BlockId) -> Option<Vec<u8>> {
        let size: u64 = conn.call(&DataRequest::Get(block.clone())).await.ok()?;
        let mut out = vec![0u8; size as usize];
        conn.reader_mut().read_exact(&mut out).await.unwrap();
        Some(out)
    }

    #[tokio::test]
    async fn test_failed_retry_keeps_stored_copy() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:dup");
        put(&node, &block, b"abc").await.unwrap();

        let mut conn = connect(&node).await;
        conn.call::<_, ()>(&header(&block, 3)).await.unwrap();
        conn.writer_mut().write_all(b"abd").await.unwrap();
        let err = conn
            .call::<_, ()>(&DataRequest::Confirm(checksum_to_string(crc32fast::hash(b"abc"))))
            .await
            .unwrap_err();
        assert!(err.is_remote(ERR_CHECKSUM_MISMATCH));

        assert_eq!(node.intents.state(&block), BlockState::Present);
        assert!(node.pending_dead_blocks().is_empty());
        let mut conn = connect(&node).await;
        assert_eq!(get(&mut conn, &block).await.unwrap(), b"abc");
        assert!(node.verify_block(&block).await.is_ok());
        node.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_waits_for_reader_of_stored_copy() {
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:busy");
        // Larger than the socket buffers, so the reader holds its lock.
        let old = vec![b'A'; 24 << 20];
        let new = vec![b'B'; 24 << 20];
        put(&node, &block, &old).await.unwrap();

        // Announce the old copy, then leave its bytes unread for now.
        let mut reader = connect(&node).await;
        let size: u64 = reader.call(&DataRequest::Get(block.clone())).await.unwrap();
        assert_eq!(size, old.len() as u64);

        let retry = {
            let node = Arc::clone(&node);
            let block = block.clone();
            let new = new.clone();
            tokio::spawn(async move { put(&node, &block, &new).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!retry.is_finished());

        let mut out = vec![0u8; size as usize];
        reader.reader_mut().read_exact(&mut out).await.unwrap();
        assert!(out == old);

        retry.await.unwrap().unwrap();
        let mut conn = connect(&node).await;
        assert!(get(&mut conn, &block).await.unwrap() == new);
        assert!(node.verify_block(&block).await.is_ok());
        node.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_forward_get_delete_never_serves_partial_block() {
        const BLOCK_LEN: usize = 64 * 1024;
        let (_dir, node) = start_node().await;
        let block = BlockId::from("blob:contended");
        let contents: Vec<Vec<u8>> = (0..4u8).map(|i| vec![b'a' + i; BLOCK_LEN]).collect();

        let mut tasks = Vec::new();
        for data in contents.clone() {
            let node = Arc::clone(&node);
            let block = block.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    // Refused while a delete is pending; that's fine.
                    let _ = put(&node, &block, &data).await;
                }
                0usize
            }));
        }
        for _ in 0..4 {
            let node = Arc::clone(&node);
            let block = block.clone();
            let contents = contents.clone();
            tasks.push(tokio::spawn(async move {
                let mut conn = connect(&node).await;
                let mut served = 0;
                for _ in 0..200 {
                    if let Some(out) = get(&mut conn, &block).await {
                        assert!(contents.contains(&out), "served a block nobody committed");
                        served += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                served
            }));
        }
        {
            let node = Arc::clone(&node);
            let block = block.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    node.remove_block(&block).await;
                }
                0
            }));
        }

        let mut served = 0;
        for task in tasks {
            served += task.await.unwrap();
        }
        assert!(served > 0);

        // Whatever survived is consistent with its checksum.
        if node.intents.state(&block) == BlockState::Present {
            assert!(node.verify_block(&block).await.is_ok());
        }
        let mut incoming = tokio::fs::read_dir(node.store.incoming_directory()).await.unwrap();
        assert!(incoming.next_entry().await.unwrap().is_none());
        node.stop();
    }
}
