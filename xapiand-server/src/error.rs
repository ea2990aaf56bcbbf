pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open database: {0}")]
    CheckoutError(String),
    #[error("timed out waiting for a database handle")]
    CheckoutTimeout,
    #[error("database is corrupt: {0}")]
    DatabaseCorrupt(String),
    #[error("database WAL error: {0}")]
    DatabaseWalError(xapiand_wal::Error),
    #[error("no space left on device")]
    StorageFull,

    #[error("network: {0}")]
    NetworkError(#[from] std::io::Error),
    #[error("network timeout")]
    NetworkTimeout,
    #[error("remote protocol major version mismatch ({found} != {expected})")]
    ProtocolVersionMismatch { found: u8, expected: u8 },
    #[error("datagram from a different cluster")]
    ClusterNameMismatch,
    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("no endpoints resolved for `{0}`")]
    EndpointUnresolved(String),
    #[error("no such node `{0}`")]
    NoSuchNode(String),
    #[error("node name `{0}` already taken")]
    NodeNameConflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("document {0} not found")]
    DocNotFound(u64),
    #[error("server is shutting down")]
    ShuttingDown,
    // For bugs and invariant violations only; never recovered from.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<xapiand_wal::Error> for Error {
    fn from(err: xapiand_wal::Error) -> Self {
        match err {
            xapiand_wal::Error::StorageFull => Error::StorageFull,
            xapiand_wal::Error::Corrupt { tx_id } => {
                Error::DatabaseCorrupt(format!("bad WAL record at tx {tx_id}"))
            }
            other => Error::DatabaseWalError(other),
        }
    }
}

impl From<xapiand_replication::Error> for Error {
    fn from(err: xapiand_replication::Error) -> Self {
        use xapiand_replication::Error as Repl;
        match err {
            Repl::Io(err) => Error::NetworkError(err),
            Repl::NetworkTimeout => Error::NetworkTimeout,
            Repl::ProtocolVersionMismatch { found, expected } => {
                Error::ProtocolVersionMismatch { found, expected }
            }
            Repl::Wal(err) => err.into(),
            other => Error::BadMessage(other.to_string()),
        }
    }
}

impl Error {
    /// Code carried by `Exception` replies on the wire.
    pub fn exception_type_code(&self) -> u8 {
        match self {
            Error::InvalidArgument(_) => 1,
            Error::DocNotFound(_) => 2,
            Error::CheckoutError(_) => 3,
            Error::CheckoutTimeout => 4,
            Error::DatabaseCorrupt(_) => 5,
            Error::DatabaseWalError(_) => 6,
            Error::StorageFull => 7,
            Error::ShuttingDown => 8,
            _ => 0,
        }
    }

    /// Whether a remote connection may keep serving after reporting
    /// this error as an `Exception` reply. Anything else destroys the
    /// connection.
    pub fn is_recoverable_on_connection(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::DocNotFound(_)
                | Error::CheckoutError(_)
                | Error::CheckoutTimeout
                | Error::DatabaseCorrupt(_)
                | Error::DatabaseWalError(_)
                | Error::StorageFull
        )
    }
}
