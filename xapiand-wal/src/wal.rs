use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;
use xxhash_rust::xxh32::Xxh32;

use crate::entry::{WalEntry, WalOp};
use crate::error::{Error, Result};
use crate::segment::{self, Segment};
use crate::sync::GroupSync;
use crate::{WAL_FILE_MAX_ENTRIES, WAL_FILE_MAX_SIZE};

#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Group-commit window. Zero (the default) fsyncs every write on its
    /// own; a non-zero window lets appends landing within it share one
    /// fsync. Writes never return before the fsync covering them.
    pub sync_window: Duration,
    pub max_file_size: u64,
    pub max_file_entries: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_window: Duration::ZERO,
            max_file_size: WAL_FILE_MAX_SIZE,
            max_file_entries: WAL_FILE_MAX_ENTRIES,
        }
    }
}

struct Sealed {
    base_tx_id: u64,
    last_tx_id: u64,
    path: PathBuf,
}

struct Writer {
    current: Segment,
    sealed: Vec<Sealed>,
    next_tx_id: u64,
}

enum State {
    Writable(Writer),
    ReadOnly,
    Closed,
}

/// The write-ahead log of one shard: a directory of `wal.<base_tx_id>`
/// files. A writable `Wal` owns its files exclusively; read-only
/// instances (replication, recovery streaming) open independent
/// descriptors and never mutate.
pub struct Wal {
    dir: PathBuf,
    uuid: Uuid,
    options: WalOptions,
    sync: GroupSync,
    state: Mutex<State>,
    /// First tx discarded by recovery truncation at open, if any.
    truncated_from: Option<u64>,
}

impl Wal {
    /// Opens (creating if writable) the log in `dir` for the index
    /// identified by `uuid`. A writable open scans every file, truncates
    /// at the first bad record and deletes everything beyond it.
    pub fn open(dir: &Path, uuid: Uuid, writable: bool, options: WalOptions) -> Result<Self> {
        if writable {
            std::fs::create_dir_all(dir)?;
        }
        let mut wal = Self {
            dir: dir.to_path_buf(),
            uuid,
            sync: GroupSync::new(options.sync_window),
            options,
            state: Mutex::new(State::ReadOnly),
            truncated_from: None,
        };
        if writable {
            let writer = wal.recover()?;
            *wal.state.get_mut() = State::Writable(writer);
        }
        Ok(wal)
    }

    /// Walks the files in base order, validating headers, checksums and
    /// contiguity. The first bad boundary truncates its file and deletes
    /// every later file; there is no attempt to skip over bad records.
    fn recover(&mut self) -> Result<Writer> {
        let files = segment::list(&self.dir)?;
        if files.is_empty() {
            let current = Segment::create(&self.dir, self.uuid, 0)?;
            return Ok(Writer {
                current,
                sealed: Vec::new(),
                next_tx_id: 0,
            });
        }

        let mut sealed = Vec::new();
        let mut expected_base: Option<u64> = None;
        let mut good: Option<Segment> = None;
        let mut drop_from: Option<usize> = None;

        for (index, (base, path)) in files.iter().enumerate() {
            if expected_base.is_some_and(|expected| *base != expected) {
                tracing::warn!(
                    path = %path.display(),
                    "WAL file is not contiguous with its predecessor, discarding from here"
                );
                drop_from = Some(index);
                break;
            }
            let (mut opened, scan) = Segment::open(path, true, Some(self.uuid))?;
            if scan.corrupt {
                let from = opened.last_tx_id().map(|tx| tx + 1).unwrap_or(*base);
                tracing::warn!(
                    path = %path.display(),
                    from,
                    "corrupt WAL record, truncating at last good boundary"
                );
                opened.truncate_at_scan()?;
                self.truncated_from = Some(from);
                if let Some(prev) = good.replace(opened) {
                    sealed.push(seal_info(prev));
                }
                drop_from = Some(index + 1);
                break;
            }
            expected_base = Some(opened.last_tx_id().map(|tx| tx + 1).unwrap_or(*base));
            if let Some(prev) = good.replace(opened) {
                sealed.push(seal_info(prev));
            }
        }

        if let Some(from) = drop_from {
            for (_, path) in &files[from..] {
                tracing::warn!(path = %path.display(), "removing discarded WAL file");
                std::fs::remove_file(path)?;
            }
            if self.truncated_from.is_none() {
                // Whole files were dropped without an in-file truncation.
                self.truncated_from = files.get(from).map(|(base, _)| *base);
            }
        }

        let current = good.expect("at least one WAL file was opened");
        let next_tx_id = current
            .last_tx_id()
            .map(|tx| tx + 1)
            .unwrap_or_else(|| current.base_tx_id());
        Ok(Writer {
            current,
            sealed,
            next_tx_id,
        })
    }

    /// Appends one operation, durable on return, and yields its tx id.
    #[tracing::instrument(skip(self, payload), fields(dir = %self.dir.display()))]
    pub fn write(&self, op: WalOp, payload: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        let writer = match &mut *state {
            State::Writable(writer) => writer,
            State::ReadOnly => return Err(Error::ReadOnly),
            State::Closed => return Err(Error::Closed),
        };

        let tx_id = writer.next_tx_id;
        if writer.current.entries() >= self.options.max_file_entries
            || writer.current.len() >= self.options.max_file_size
        {
            self.rotate(writer, tx_id)?;
        }

        let entry = WalEntry::new(tx_id, op, payload.to_vec());
        writer.current.append(&entry)?;
        writer.next_tx_id = tx_id + 1;
        self.sync.write_durable(writer.current.file())?;
        Ok(tx_id)
    }

    /// Seals the current file (fsync + close) and starts
    /// `wal.<next_tx_id>`.
    fn rotate(&self, writer: &mut Writer, next_tx_id: u64) -> Result<()> {
        writer.current.sync()?;
        let fresh = Segment::create(&self.dir, self.uuid, next_tx_id)?;
        let prior = std::mem::replace(&mut writer.current, fresh);
        tracing::debug!(base = prior.base_tx_id(), next = next_tx_id, "rotated WAL file");
        writer.sealed.push(seal_info(prior));
        Ok(())
    }

    /// Streams back every entry with `tx_id > since_tx_id` (`None`
    /// replays everything). Opens its own descriptors, so it is safe
    /// concurrently with the writer; it observes whatever is on disk.
    /// Replay stops silently at the first bad record.
    pub fn replay(&self, since_tx_id: Option<u64>) -> Result<WalReplay> {
        WalReplay::open(&self.dir, self.uuid, since_tx_id)
    }

    /// Discards every entry with `tx_id > tx_id` and re-anchors the
    /// writer there.
    pub fn truncate_to(&self, tx_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let writer = match &mut *state {
            State::Writable(writer) => writer,
            State::ReadOnly => return Err(Error::ReadOnly),
            State::Closed => return Err(Error::Closed),
        };

        let prior_next = writer.next_tx_id;
        if writer.current.base_tx_id() > tx_id {
            // The current file and any sealed file based past the
            // target hold nothing worth keeping.
            std::fs::remove_file(writer.current.path())?;
            let mut keep = None;
            while let Some(prev) = writer.sealed.pop() {
                if prev.base_tx_id > tx_id {
                    std::fs::remove_file(&prev.path)?;
                } else {
                    keep = Some(prev);
                    break;
                }
            }
            writer.current = match keep {
                Some(prev) => Segment::open(&prev.path, true, Some(self.uuid))?.0,
                None => Segment::create(&self.dir, self.uuid, tx_id + 1)?,
            };
        }
        if writer.current.base_tx_id() <= tx_id {
            writer.current.truncate_to(tx_id)?;
        }
        // A target at or past the head leaves the log untouched.
        writer.next_tx_id = prior_next.min(tx_id + 1);
        Ok(())
    }

    /// Discards the whole log and restarts it empty at tx 0. Used when
    /// recovery finds no committed entry to anchor on, and when a full
    /// replication pull replaces the shard.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        let writer = match &mut *state {
            State::Writable(writer) => writer,
            State::ReadOnly => return Err(Error::ReadOnly),
            State::Closed => return Err(Error::Closed),
        };
        std::fs::remove_file(writer.current.path())?;
        for sealed in writer.sealed.drain(..) {
            std::fs::remove_file(&sealed.path)?;
        }
        writer.current = Segment::create(&self.dir, self.uuid, 0)?;
        writer.next_tx_id = 0;
        Ok(())
    }

    /// XXH32 over the raw bytes of every WAL file in base order.
    pub fn checksum(&self) -> Result<u32> {
        let files = segment::list(&self.dir)?;
        let mut hasher = Xxh32::new(0);
        let mut buf = [0u8; 8192];
        for (_, path) in files {
            let mut file = File::open(path)?;
            loop {
                let read = file.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
            }
        }
        Ok(hasher.digest())
    }

    /// Fsyncs and releases the writer. Further writes fail with
    /// `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let State::Writable(writer) = &*state {
            writer.current.sync()?;
        }
        *state = State::Closed;
        Ok(())
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tx id the next write will be assigned.
    pub fn next_tx_id(&self) -> u64 {
        match &*self.state.lock() {
            State::Writable(writer) => writer.next_tx_id,
            _ => 0,
        }
    }

    /// Last committed tx id, if any entry exists.
    pub fn last_tx_id(&self) -> Option<u64> {
        match &*self.state.lock() {
            State::Writable(writer) => writer
                .current
                .last_tx_id()
                .or_else(|| writer.sealed.last().map(|sealed| sealed.last_tx_id)),
            _ => None,
        }
    }

    /// First tx discarded by recovery truncation during open, if the
    /// log had a bad tail.
    pub fn truncated_from(&self) -> Option<u64> {
        self.truncated_from
    }
}

fn seal_info(segment: Segment) -> Sealed {
    Sealed {
        base_tx_id: segment.base_tx_id(),
        last_tx_id: segment.last_tx_id().unwrap_or_else(|| segment.base_tx_id()),
        path: segment.path().to_path_buf(),
    }
}

/// Read-only iterator over the log, one file at a time.
pub struct WalReplay {
    segments: VecDeque<(u64, PathBuf)>,
    pending: VecDeque<WalEntry>,
    since_tx_id: Option<u64>,
    uuid: Uuid,
    next_expected: Option<u64>,
    stopped: bool,
    failed: bool,
}

impl WalReplay {
    fn open(dir: &Path, uuid: Uuid, since_tx_id: Option<u64>) -> Result<Self> {
        let segments = match segment::list(dir) {
            Ok(files) => files.into(),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                VecDeque::new()
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            segments,
            pending: VecDeque::new(),
            since_tx_id,
            uuid,
            next_expected: None,
            stopped: false,
            failed: false,
        })
    }

    /// Whether iteration ended at a bad record rather than the end of
    /// the log.
    pub fn stopped_at_corruption(&self) -> bool {
        self.stopped
    }

    fn refill(&mut self) -> Result<bool> {
        while self.pending.is_empty() {
            let Some((base, path)) = self.segments.pop_front() else {
                return Ok(false);
            };
            if self.next_expected.is_some_and(|expected| base != expected) {
                self.stopped = true;
                return Ok(false);
            }
            let (segment, scan) = Segment::open(&path, false, Some(self.uuid))?;
            let (entries, _) = segment.read_entries(self.since_tx_id)?;
            self.next_expected = Some(
                segment
                    .last_tx_id()
                    .map(|tx| tx + 1)
                    .unwrap_or(base),
            );
            self.pending = entries.into();
            if scan.corrupt {
                self.stopped = true;
                self.segments.clear();
                break;
            }
        }
        Ok(!self.pending.is_empty())
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(entry) = self.pending.pop_front() {
            return Some(Ok(entry));
        }
        match self.refill() {
            Ok(true) => self.pending.pop_front().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
