//! Client-facing session on the coordinator
//!
//! `CreateBlob` opens a write; `Append` hands out one block placement at a
//! time and `Commit` records the blocks handed out, in order. Lookups are
//! allowed whenever no write is open.

use std::sync::Arc;

use crate::protocol::{
    BlobId, BlockId, ClientRequest, Connection, WireError, ERR_METHOD_NOT_ACCEPTED,
    ERR_SESSION_STATE,
};

use super::{Coordinator, CoordinatorError};

enum ClientSession {
    Idle,
    Writing { blob: BlobId, blocks: Vec<BlockId> },
}

pub(crate) async fn serve(coordinator: Arc<Coordinator>, mut conn: Connection) {
    if let Err(e) = run(&coordinator, &mut conn).await {
        log::warn!("Client session with {} ended: {}", conn.peer(), e);
    }
}

async fn run(coordinator: &Coordinator, conn: &mut Connection) -> Result<(), CoordinatorError> {
    let mut session = ClientSession::Idle;

    loop {
        let request = match conn.recv::<ClientRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(WireError::Decode(e)) => {
                log::warn!("Undecodable request from {}: {}", conn.peer(), e);
                conn.reply_err(ERR_METHOD_NOT_ACCEPTED).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        session = match (request, session) {
            (ClientRequest::CreateBlob, ClientSession::Idle) => {
                let blob = coordinator.create_blob();
                log::info!("Created blob '{}' for {}", blob, conn.peer());
                conn.reply_ok(&blob).await?;
                ClientSession::Writing { blob, blocks: Vec::new() }
            }
            (ClientRequest::Append, ClientSession::Writing { blob, mut blocks }) => {
                let placement = coordinator.append(&blob).await;
                blocks.push(placement.block_id.clone());
                conn.reply_ok(&placement).await?;
                ClientSession::Writing { blob, blocks }
            }
            (ClientRequest::Commit, ClientSession::Writing { blob, blocks }) => {
                match coordinator.commit(&blob, &blocks).await {
                    Ok(()) => {
                        log::info!("Committed blob '{}' ({} blocks) for {}", blob, blocks.len(), conn.peer());
                        conn.reply_ok(()).await?;
                    }
                    Err(e) => {
                        log::error!("Committing blob '{}': {}", blob, e);
                        conn.reply_err(&e.to_string()).await?;
                    }
                }
                ClientSession::Idle
            }
            (ClientRequest::GetBlob(blob), ClientSession::Idle) => {
                let blocks = coordinator.get_blob(&blob).await;
                conn.reply_ok(&blocks).await?;
                ClientSession::Idle
            }
            (ClientRequest::GetBlock(block), ClientSession::Idle) => {
                let addrs = coordinator.get_block(&block).await;
                conn.reply_ok(&addrs).await?;
                ClientSession::Idle
            }
            (request, current) => {
                log::warn!("Rejected {:?} from {}: wrong session state", request, conn.peer());
                conn.reply_err(ERR_SESSION_STATE).await?;
                current
            }
        };
    }

    Ok(())
}
