use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no space left writing WAL entry")]
    StorageFull,
    #[error("invalid WAL file header in {0}")]
    InvalidHeader(PathBuf),
    #[error("unsupported WAL version {0}")]
    UnsupportedVersion(u16),
    #[error("WAL uuid mismatch: expected {expected}, found {found}")]
    UuidMismatch {
        expected: uuid::Uuid,
        found: uuid::Uuid,
    },
    #[error("WAL file {path} is not contiguous: expected base tx {expected}, found {found}")]
    NotContiguous {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("corrupt WAL entry at tx {tx_id}")]
    Corrupt { tx_id: u64 },
    #[error("unknown WAL op code {0}")]
    UnknownOp(u8),
    #[error("WAL is read-only")]
    ReadOnly,
    #[error("WAL is closed")]
    Closed,
}
