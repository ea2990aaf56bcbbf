use bytes::Bytes;
use xxhash_rust::xxh32::Xxh32;

use crate::error::{Error, Result};
use crate::WAL_ALIGNMENT;

/// Fixed bytes of a record besides the payload: tx_id (8) + op (1).
pub const ENTRY_FIXED_LEN: u32 = 9;

/// Upper bound accepted for a single record body. Anything larger read
/// back from disk is treated as corruption rather than attempted.
pub const ENTRY_MAX_LEN: u32 = 32 * 1024 * 1024;

/// Operations recorded in the log. The u8 value is the on-disk code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalOp {
    AddDoc = 0,
    DeleteDoc = 1,
    DeleteTerm = 2,
    ReplaceDoc = 3,
    ReplaceTerm = 4,
    SetMeta = 5,
    AddSpelling = 6,
    RemoveSpelling = 7,
    Commit = 8,
}

impl WalOp {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for WalOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(WalOp::AddDoc),
            1 => Ok(WalOp::DeleteDoc),
            2 => Ok(WalOp::DeleteTerm),
            3 => Ok(WalOp::ReplaceDoc),
            4 => Ok(WalOp::ReplaceTerm),
            5 => Ok(WalOp::SetMeta),
            6 => Ok(WalOp::AddSpelling),
            7 => Ok(WalOp::RemoveSpelling),
            8 => Ok(WalOp::Commit),
            other => Err(Error::UnknownOp(other)),
        }
    }
}

/// A single decoded log record. Cloning is cheap, the payload is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub tx_id: u64,
    pub op: WalOp,
    pub payload: Bytes,
}

impl WalEntry {
    pub fn new(tx_id: u64, op: WalOp, payload: impl Into<Bytes>) -> Self {
        Self {
            tx_id,
            op,
            payload: payload.into(),
        }
    }

    pub fn checksum(&self) -> u32 {
        checksum(self.tx_id, self.op.as_u8(), &self.payload)
    }

    /// Total bytes the record occupies on disk, padding included.
    pub fn record_len(&self) -> u64 {
        record_len(self.payload.len())
    }

    /// Appends the record to `buf`: `{len, tx_id, op, payload, checksum}`
    /// zero-padded to the alignment boundary.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let len = ENTRY_FIXED_LEN + self.payload.len() as u32;
        let start = buf.len();
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.push(self.op.as_u8());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum().to_le_bytes());
        let written = (buf.len() - start) as u64;
        let padded = written.next_multiple_of(WAL_ALIGNMENT);
        buf.resize(start + padded as usize, 0);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.record_len() as usize);
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes one record from the front of `data`, returning the entry
    /// and the padded number of bytes it consumed. `None` means a clean
    /// end of data (no record starts here); `Err(Corrupt)` means a
    /// record starts here but does not check out.
    pub fn decode(data: &[u8]) -> Result<Option<(WalEntry, u64)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(data[..4].try_into().unwrap());
        if len == 0 {
            // Padding or pre-zeroed tail.
            return Ok(None);
        }
        if len < ENTRY_FIXED_LEN || len > ENTRY_MAX_LEN {
            return Err(Error::Corrupt { tx_id: 0 });
        }
        let record = record_len(len as usize - ENTRY_FIXED_LEN as usize);
        if (data.len() as u64) < record {
            // A record starts here but was cut short.
            return Err(Error::Corrupt { tx_id: 0 });
        }
        let tx_id = u64::from_le_bytes(data[4..12].try_into().unwrap());
        let op_code = data[12];
        let payload_end = 4 + len as usize;
        let payload = &data[13..payload_end];
        let stored =
            u32::from_le_bytes(data[payload_end..payload_end + 4].try_into().unwrap());
        if stored != checksum(tx_id, op_code, payload) {
            return Err(Error::Corrupt { tx_id });
        }
        let op = WalOp::try_from(op_code).map_err(|_| Error::Corrupt { tx_id })?;
        let entry = WalEntry {
            tx_id,
            op,
            payload: Bytes::copy_from_slice(payload),
        };
        Ok(Some((entry, record)))
    }
}

pub fn checksum(tx_id: u64, op: u8, payload: &[u8]) -> u32 {
    let mut hasher = Xxh32::new(0);
    hasher.update(&tx_id.to_le_bytes());
    hasher.update(&[op]);
    hasher.update(payload);
    hasher.digest()
}

/// On-disk size of a record with the given payload length.
pub fn record_len(payload_len: usize) -> u64 {
    let raw = 4 + ENTRY_FIXED_LEN as u64 + payload_len as u64 + 4;
    raw.next_multiple_of(WAL_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let entry = WalEntry::new(42, WalOp::ReplaceDoc, &b"hello world"[..]);
        let buf = entry.encode();
        assert_eq!(buf.len() as u64 % WAL_ALIGNMENT, 0);
        let (decoded, consumed) = WalEntry::decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len() as u64);
        assert_eq!(decoded, entry);
    }

    #[test]
    fn empty_payload_round_trip() {
        let entry = WalEntry::new(0, WalOp::Commit, Bytes::new());
        let (decoded, _) = WalEntry::decode(&entry.encode()).unwrap().unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn bit_flip_is_corrupt() {
        let entry = WalEntry::new(7, WalOp::AddDoc, &b"payload"[..]);
        let buf = entry.encode();
        for bit in 0..8 {
            let mut flipped = buf.clone();
            flipped[14] ^= 1 << bit; // inside the payload
            assert!(matches!(
                WalEntry::decode(&flipped),
                Err(Error::Corrupt { .. })
            ));
        }
        // Flipping the stored checksum is just as fatal.
        let mut flipped = buf.clone();
        let checksum_at = 4 + 9 + entry.payload.len();
        flipped[checksum_at] ^= 0x80;
        assert!(matches!(
            WalEntry::decode(&flipped),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn zero_len_is_clean_end() {
        assert!(WalEntry::decode(&[0u8; 16]).unwrap().is_none());
        assert!(WalEntry::decode(&[]).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let entry = WalEntry::new(1, WalOp::SetMeta, &b"0123456789"[..]);
        let buf = entry.encode();
        assert!(WalEntry::decode(&buf[..buf.len() - 8]).is_err());
    }
}
