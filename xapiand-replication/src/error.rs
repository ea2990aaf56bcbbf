pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network: {0}")]
    Io(#[from] std::io::Error),
    #[error("network timeout")]
    NetworkTimeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("remote protocol major version mismatch: peer {found}, expected {expected}")]
    ProtocolVersionMismatch { found: u8, expected: u8 },
    #[error("bad message: {0}")]
    BadMessage(&'static str),
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("unknown reply type {0:#04x}")]
    UnknownReplyType(u8),
    #[error("unexpected reply {found:?} to {request}")]
    UnexpectedReply {
        request: &'static str,
        found: crate::message::RemoteReplyType,
    },
    #[error("remote exception: {message}")]
    Remote {
        type_code: u8,
        context: String,
        message: String,
    },
    #[error("replication stream out of order")]
    ReplicationOutOfOrder,
    #[error(transparent)]
    Wal(#[from] xapiand_wal::Error),
}
