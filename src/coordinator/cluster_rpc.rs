//! Storage-node-facing session on the coordinator

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::protocol::{ClusterRequest, Connection, WireError, ERR_METHOD_NOT_ACCEPTED};

use super::{Coordinator, CoordinatorError};

pub(crate) async fn serve(coordinator: Arc<Coordinator>, mut conn: Connection) {
    if let Err(e) = run(&coordinator, &mut conn).await {
        log::warn!("Cluster session with {} ended: {}", conn.peer(), e);
    }
}

async fn run(coordinator: &Coordinator, conn: &mut Connection) -> Result<(), CoordinatorError> {
    loop {
        let request = match conn.recv::<ClusterRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(WireError::Decode(e)) => {
                log::warn!("Undecodable request from {}: {}", conn.peer(), e);
                conn.reply_err(ERR_METHOD_NOT_ACCEPTED).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match request {
            ClusterRequest::Register(msg) => {
                let addr = advertised_addr(&msg.addr, conn.peer_addr());
                let id = coordinator.register(&addr, &msg.blocks).await;
                log::info!(
                    "Storage node '{}' registered at {} with {} blocks",
                    id,
                    addr,
                    msg.blocks.len()
                );
                conn.reply_ok(&id).await?;
            }
            ClusterRequest::Heartbeat(msg) => {
                let response = coordinator.heartbeat(&msg).await;
                if response.need_to_register {
                    log::info!("Heartbeat from unknown node '{}'", msg.node_id);
                }
                conn.reply_ok(&response).await?;
            }
        }
    }
}

/// The address other parties should dial. A node listening on a wildcard
/// address is reached at the IP its registration came from.
pub fn advertised_addr(advertised: &str, peer: Option<SocketAddr>) -> String {
    match (advertised.parse::<SocketAddr>(), peer) {
        (Ok(addr), Some(peer)) if addr.ip().is_unspecified() => {
            SocketAddr::new(peer.ip(), addr.port()).to_string()
        }
        (Ok(addr), None) if addr.ip().is_unspecified() => {
            SocketAddr::new(IpAddr::from([127, 0, 0, 1]), addr.port()).to_string()
        }
        _ => advertised.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_address_takes_peer_ip() {
        let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        assert_eq!(advertised_addr("0.0.0.0:7000", Some(peer)), "10.1.2.3:7000");
        assert_eq!(advertised_addr("[::]:7000", Some(peer)), "10.1.2.3:7000");
        assert_eq!(advertised_addr("0.0.0.0:7000", None), "127.0.0.1:7000");
    }

    #[test]
    fn test_concrete_address_is_kept() {
        let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        assert_eq!(advertised_addr("192.168.0.9:7000", Some(peer)), "192.168.0.9:7000");
        assert_eq!(advertised_addr("storage-1:7000", Some(peer)), "storage-1:7000");
    }
}
