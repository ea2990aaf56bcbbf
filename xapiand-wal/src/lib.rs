pub mod entry;
pub mod error;
pub mod segment;
mod sync;
pub mod wal;

pub use entry::{WalEntry, WalOp};
pub use error::{Error, Result};
pub use wal::{Wal, WalOptions, WalReplay};

/// Size in bytes past which the current WAL file is rotated.
pub const WAL_FILE_MAX_SIZE: u64 = 8 * 1024 * 1024;

/// Entry count past which the current WAL file is rotated.
pub const WAL_FILE_MAX_ENTRIES: u64 = 1016;

/// Records are zero-padded so every entry starts on this boundary.
pub const WAL_ALIGNMENT: u64 = 8;
