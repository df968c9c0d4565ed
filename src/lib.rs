// blockhive - Replicated block storage cluster

pub mod client;
pub mod coordinator;
pub mod datanode;
pub mod protocol;
