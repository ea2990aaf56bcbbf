use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::entry::WalEntry;
use crate::error::{Error, Result};

pub const WAL_MAGIC: u32 = u32::from_le_bytes(*b"XAPW");
pub const WAL_VERSION: u16 = 1;

/// Fixed 32-byte file header. All integers little-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct SegmentHeader {
    magic: U32,
    version: U16,
    flags: U16,
    uuid: [u8; 16],
    base_tx_id: U64,
}

pub const HEADER_LEN: u64 = size_of::<SegmentHeader>() as u64;

impl SegmentHeader {
    fn new(uuid: Uuid, base_tx_id: u64) -> Self {
        Self {
            magic: WAL_MAGIC.into(),
            version: WAL_VERSION.into(),
            flags: 0.into(),
            uuid: *uuid.as_bytes(),
            base_tx_id: base_tx_id.into(),
        }
    }

    fn check(&self, path: &Path, expected_uuid: Option<Uuid>) -> Result<()> {
        if self.magic.get() != WAL_MAGIC {
            return Err(Error::InvalidHeader(path.to_path_buf()));
        }
        if self.version.get() != WAL_VERSION {
            return Err(Error::UnsupportedVersion(self.version.get()));
        }
        if let Some(expected) = expected_uuid {
            let found = Uuid::from_bytes(self.uuid);
            if found != expected {
                return Err(Error::UuidMismatch { expected, found });
            }
        }
        Ok(())
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid)
    }

    pub fn base_tx_id(&self) -> u64 {
        self.base_tx_id.get()
    }
}

pub fn file_name(base_tx_id: u64) -> String {
    format!("wal.{base_tx_id}")
}

pub fn parse_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal.")?.parse().ok()
}

/// The index uuid stamped in the first WAL file of `dir`, if any file
/// exists yet.
pub fn stored_uuid(dir: &Path) -> Result<Option<Uuid>> {
    let files = match list(dir) {
        Ok(files) => files,
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let Some((_, path)) = files.first() else {
        return Ok(None);
    };
    let mut file = OpenOptions::new().read(true).open(path)?;
    let mut header = SegmentHeader::new_zeroed();
    let mut buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut buf)
        .map_err(|_| Error::InvalidHeader(path.clone()))?;
    header.as_bytes_mut().copy_from_slice(&buf);
    header.check(path, None)?;
    Ok(Some(header.uuid()))
}

/// WAL files in `dir`, sorted by base tx id.
pub fn list(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        if let Some(base) = name.to_str().and_then(parse_file_name) {
            found.push((base, dirent.path()));
        }
    }
    found.sort_unstable_by_key(|(base, _)| *base);
    Ok(found)
}

/// One `wal.<base_tx_id>` file. The scanned suffix past `len` is never
/// considered part of the log.
pub struct Segment {
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    /// End offset of the last good record.
    len: u64,
    entries: u64,
    last_tx_id: Option<u64>,
}

impl Segment {
    /// Creates a fresh file; fails if it already exists.
    pub fn create(dir: &Path, uuid: Uuid, base_tx_id: u64) -> Result<Self> {
        let path = dir.join(file_name(base_tx_id));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let header = SegmentHeader::new(uuid, base_tx_id);
        file.write_all(header.as_bytes())?;
        Ok(Self {
            path,
            file,
            header,
            len: HEADER_LEN,
            entries: 0,
            last_tx_id: None,
        })
    }

    /// Opens and scans an existing file. Scanning stops at the first bad
    /// record; `corrupt()` on the outcome tells whether a truncation
    /// point was found before end of file.
    pub fn open(path: &Path, writable: bool, expected_uuid: Option<Uuid>) -> Result<(Self, Scan)> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let mut header = SegmentHeader::new_zeroed();
        let mut header_buf = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header_buf)
            .map_err(|_| Error::InvalidHeader(path.to_path_buf()))?;
        header.as_bytes_mut().copy_from_slice(&header_buf);
        header.check(path, expected_uuid)?;

        let mut segment = Self {
            path: path.to_path_buf(),
            file,
            header,
            len: HEADER_LEN,
            entries: 0,
            last_tx_id: None,
        };
        let scan = segment.scan()?;
        Ok((segment, scan))
    }

    /// Walks every record after the header, validating checksums and tx
    /// contiguity, and leaves `len`/`entries`/`last_tx_id` at the last
    /// good boundary.
    fn scan(&mut self) -> Result<Scan> {
        let mut data = Vec::new();
        self.file.seek(SeekFrom::Start(HEADER_LEN))?;
        self.file.read_to_end(&mut data)?;

        let mut offset = 0u64;
        let mut next_tx = self.header.base_tx_id();
        let mut corrupt = false;
        loop {
            match WalEntry::decode(&data[offset as usize..]) {
                Ok(Some((entry, consumed))) => {
                    if entry.tx_id != next_tx {
                        corrupt = true;
                        break;
                    }
                    offset += consumed;
                    next_tx += 1;
                    self.entries += 1;
                    self.last_tx_id = Some(entry.tx_id);
                }
                Ok(None) => {
                    // Clean end; anything left over is padding/zeroes.
                    corrupt = data[offset as usize..].iter().any(|b| *b != 0);
                    break;
                }
                Err(_) => {
                    corrupt = true;
                    break;
                }
            }
        }
        self.len = HEADER_LEN + offset;
        Ok(Scan {
            corrupt,
            good_len: self.len,
        })
    }

    /// Appends one record. On any write failure the file is rolled back
    /// to the previous boundary so no partial record survives.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let buf = entry.encode();
        self.file.seek(SeekFrom::Start(self.len))?;
        if let Err(err) = self.file.write_all(&buf) {
            let _ = self.file.set_len(self.len);
            if err.kind() == std::io::ErrorKind::StorageFull {
                return Err(Error::StorageFull);
            }
            return Err(err.into());
        }
        self.len += buf.len() as u64;
        self.entries += 1;
        self.last_tx_id = Some(entry.tx_id);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Discards every record past `tx_id` (which may be below this
    /// file's base, discarding everything).
    pub fn truncate_to(&mut self, tx_id: u64) -> Result<()> {
        let keep = (tx_id + 1).saturating_sub(self.header.base_tx_id());
        let entries = self.read_entries(None)?.0;
        let mut len = HEADER_LEN;
        for entry in entries.iter().take(keep as usize) {
            len += entry.record_len();
        }
        self.file.set_len(len)?;
        self.file.sync_data()?;
        self.len = len;
        self.entries = keep.min(entries.len() as u64);
        self.last_tx_id = if self.entries == 0 {
            None
        } else {
            Some(self.header.base_tx_id() + self.entries - 1)
        };
        Ok(())
    }

    /// Truncates the file at the last good boundary found by the scan.
    pub fn truncate_at_scan(&mut self) -> Result<()> {
        self.file.set_len(self.len)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads back the good records, optionally only those past
    /// `since_tx_id`. The bool reports whether the read stopped at a
    /// bad record rather than the end.
    pub fn read_entries(&self, since_tx_id: Option<u64>) -> Result<(Vec<WalEntry>, bool)> {
        let mut data = vec![0u8; (self.len - HEADER_LEN) as usize];
        read_exact_at(&self.file, &mut data, HEADER_LEN)?;
        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut stopped = false;
        while (offset as usize) < data.len() {
            match WalEntry::decode(&data[offset as usize..]) {
                Ok(Some((entry, consumed))) => {
                    offset += consumed;
                    if since_tx_id.map_or(true, |since| entry.tx_id > since) {
                        entries.push(entry);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    stopped = true;
                    break;
                }
            }
        }
        Ok((entries, stopped))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn base_tx_id(&self) -> u64 {
        self.header.base_tx_id()
    }

    pub fn last_tx_id(&self) -> Option<u64> {
        self.last_tx_id
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scan {
    pub corrupt: bool,
    pub good_len: u64,
}

fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)?;
    }
    #[cfg(not(unix))]
    {
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::WalOp;

    fn tmp() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn create_append_reopen() {
        let dir = tmp();
        let uuid = Uuid::new_v4();
        let mut segment = Segment::create(dir.path(), uuid, 0).unwrap();
        for tx in 0..10 {
            segment
                .append(&WalEntry::new(tx, WalOp::AddDoc, format!("doc{tx}")))
                .unwrap();
        }
        segment.sync().unwrap();
        let path = segment.path().to_path_buf();
        drop(segment);

        let (segment, scan) = Segment::open(&path, false, Some(uuid)).unwrap();
        assert!(!scan.corrupt);
        assert_eq!(segment.entries(), 10);
        assert_eq!(segment.last_tx_id(), Some(9));
        let (entries, stopped) = segment.read_entries(Some(4)).unwrap();
        assert!(!stopped);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].tx_id, 5);
    }

    #[test]
    fn uuid_mismatch_rejected() {
        let dir = tmp();
        let segment = Segment::create(dir.path(), Uuid::new_v4(), 0).unwrap();
        let path = segment.path().to_path_buf();
        drop(segment);
        assert!(matches!(
            Segment::open(&path, false, Some(Uuid::new_v4())),
            Err(Error::UuidMismatch { .. })
        ));
    }

    #[test]
    fn scan_stops_at_flipped_bit() {
        let dir = tmp();
        let uuid = Uuid::new_v4();
        let mut segment = Segment::create(dir.path(), uuid, 100).unwrap();
        let mut boundaries = Vec::new();
        for tx in 100..105 {
            segment
                .append(&WalEntry::new(tx, WalOp::ReplaceDoc, format!("body-{tx}")))
                .unwrap();
            boundaries.push(segment.len());
        }
        segment.sync().unwrap();
        let path = segment.path().to_path_buf();
        drop(segment);

        // Flip one payload bit inside the fourth record.
        let mut raw = std::fs::read(&path).unwrap();
        let offset = boundaries[2] as usize + 16;
        raw[offset] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        let (mut segment, scan) = Segment::open(&path, true, Some(uuid)).unwrap();
        assert!(scan.corrupt);
        assert_eq!(segment.entries(), 3);
        assert_eq!(segment.last_tx_id(), Some(102));
        segment.truncate_at_scan().unwrap();
        assert_eq!(scan.good_len, boundaries[2]);
    }
}
