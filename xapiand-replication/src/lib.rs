pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod payload;
pub mod prefix;
pub mod replicator;
pub mod serial;

pub use client::RemoteClient;
pub use error::{Error, Result};
pub use message::{ReplicationMessageType, RemoteMessageType, RemoteReplyType};
pub use replicator::ReplicationClient;

/// Remote protocol version. Clients reject a mismatched major.
pub const REMOTE_PROTOCOL_MAJOR_VERSION: u8 = 39;
pub const REMOTE_PROTOCOL_MINOR_VERSION: u8 = 0;
