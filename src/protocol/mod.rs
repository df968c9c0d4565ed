//! Wire-level types shared by the coordinator, storage nodes and clients
//!
//! Identifiers are opaque strings. Every request family is a typed enum that
//! serializes as `{"method": ..., "params": ...}`; replies are `Reply<T>`.

pub mod wire;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use wire::{Connection, Reply, WireError};

/// Largest block a storage node accepts (128 MiB).
pub const MAX_BLOCK_SIZE: u64 = 128 * 1024 * 1024;
/// Buffer size used when streaming block bytes.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Longest JSON frame accepted, newline included. Registration block lists
/// are the largest frames.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How long a replication or deletion intent stays in progress.
pub const INTENT_LEASE: Duration = Duration::from_secs(20);
/// Silence after which the coordinator forgets a storage node.
pub const NODE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(3);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const INTEGRITY_INTERVAL: Duration = Duration::from_secs(5);

// Error texts callers match on.
pub const ERR_SESSION_STATE: &str = "Not allowed in current session state";
pub const ERR_BAD_SIZE: &str = "Bad size";
pub const ERR_CHECKSUM_MISMATCH: &str = "Checksum doesn't match";
pub const ERR_NO_READ_LOCK: &str = "Couldn't get read lock";
pub const ERR_METHOD_NOT_ACCEPTED: &str = "Method not accepted";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Names one block. By convention `<blob>:<uuid>`, never parsed.
    BlockId
);
string_id!(
    /// Names a logical object made of an ordered list of blocks.
    BlobId
);
string_id!(
    /// Coordinator-assigned identity of a registered storage node.
    NodeId
);

/// "Send this block to these nodes". Used for client placement answers,
/// pipeline headers and replicate instructions alike.
///
/// `size` is 0 in replicate instructions from the coordinator; the sending
/// node fills it in from its local copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardBlock {
    pub block_id: BlockId,
    pub nodes: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationMsg {
    pub addr: String,
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub node_id: NodeId,
    pub space_used: usize,
    pub new_blocks: Vec<BlockId>,
    pub dead_blocks: Vec<BlockId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub need_to_register: bool,
    pub invalidate_blocks: Vec<BlockId>,
    pub to_replicate: Vec<ForwardBlock>,
}

/// Requests a client sends to the coordinator's client port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ClientRequest {
    CreateBlob,
    Append,
    Commit,
    GetBlob(BlobId),
    GetBlock(BlockId),
}

/// Requests a storage node sends to the coordinator's cluster port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ClusterRequest {
    Register(RegistrationMsg),
    Heartbeat(HeartbeatMsg),
}

/// Requests served by a storage node to clients and peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum DataRequest {
    /// Header of an incoming block; exactly `size` raw bytes follow the reply.
    Forward(ForwardBlock),
    /// Sender's CRC32 of the bytes just streamed, as a decimal string.
    Confirm(String),
    /// Reply carries the block size, then the raw bytes follow.
    Get(BlockId),
}

pub fn checksum_to_string(checksum: u32) -> String {
    checksum.to_string()
}

pub fn checksum_from_str(s: &str) -> Option<u32> {
    s.trim().parse::<u32>().ok()
}
