use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use xapiand_replication::payload::MutationOutcome;
use xapiand_replication::serial::Reader;
use xapiand_wal::{segment, Wal, WalEntry, WalOp, WalOptions};

use crate::endpoint::Endpoints;
use crate::error::{Error, Result};
use crate::index::{Docid, Document, FederatedIndex, Index, MemoryIndex};

/// Result of journaling one operation.
#[derive(Debug, Clone, Copy)]
pub struct Applied {
    pub outcome: MutationOutcome,
    /// Docid produced by AddDoc/ReplaceTerm, when any.
    pub docid: Option<Docid>,
}

/// An opened shard (or read-only federation of shards): the index
/// engine handle plus, for a local writable shard, its WAL. Checked in
/// and out of the pool; exclusively owned while checked out.
pub struct Database {
    endpoints: Endpoints,
    hash: u64,
    writable: bool,
    flags: u64,
    reopen_generation: u64,
    dir: Option<PathBuf>,
    uuid: Mutex<Uuid>,
    index: Arc<dyn Index>,
    /// Concrete engine of a writable shard, for replication resets.
    engine: Option<Arc<MemoryIndex>>,
    wal: Mutex<Option<Wal>>,
    wal_options: WalOptions,
    mastery: AtomicI64,
    poisoned: AtomicBool,
    /// Set when recovery lost committed data: the shard serves reads
    /// but refuses writes until resynchronized.
    forced_read_only: AtomicBool,
    last_commit_tx: Mutex<Option<u64>>,
    last_used: Mutex<std::time::Instant>,
}

impl Database {
    /// Opens one local shard writable: WAL recovery first, then replay
    /// of the committed log into a fresh engine state.
    pub fn open_writable(
        endpoints: Endpoints,
        hash: u64,
        flags: u64,
        reopen_generation: u64,
        dir: &Path,
        wal_options: WalOptions,
    ) -> Result<Self> {
        let endpoint = endpoints
            .first()
            .ok_or_else(|| Error::CheckoutError("no endpoint".into()))?;
        if !endpoint.is_local() {
            return Err(Error::CheckoutError(format!(
                "writable endpoint {endpoint} is not on this node"
            )));
        }
        if endpoints.len() != 1 {
            return Err(Error::InvalidArgument(
                "a writable database references exactly one endpoint".into(),
            ));
        }

        std::fs::create_dir_all(dir).map_err(|err| Error::CheckoutError(err.to_string()))?;
        let uuid = match segment::stored_uuid(dir)? {
            Some(uuid) => uuid,
            None => Uuid::new_v4(),
        };
        let wal = Wal::open(dir, uuid, true, wal_options.clone())?;
        let lost_tail = wal.truncated_from();

        let engine = Arc::new(MemoryIndex::new(uuid));
        let mut last_commit_tx = None;
        let mut last_seen_tx = None;
        for entry in wal.replay(None)? {
            let entry = entry?;
            last_seen_tx = Some(entry.tx_id);
            apply_to_index(engine.as_ref(), entry.op, &entry.payload)?;
            if entry.op == WalOp::Commit {
                last_commit_tx = Some(entry.tx_id);
            }
        }

        // Entries past the last commit were aborted mid-flight; drop
        // them from both the engine state and the log.
        if last_seen_tx != last_commit_tx {
            engine.cancel()?;
            match last_commit_tx {
                Some(tx) => wal.truncate_to(tx)?,
                None => wal.reset()?,
            }
        } else if last_commit_tx.is_some() {
            engine.commit()?;
        }

        let forced_read_only = match (lost_tail, last_commit_tx) {
            // Truncation that cut below a committed point lost durable
            // data: contain the damage, serve reads only.
            (Some(from), Some(commit)) => from <= commit,
            _ => false,
        };
        if forced_read_only {
            tracing::error!(
                dir = %dir.display(),
                "WAL recovery lost committed entries; shard is read-only until resynchronized"
            );
        }

        let mastery = read_mastery(dir);
        Ok(Self {
            endpoints,
            hash,
            writable: true,
            flags,
            reopen_generation,
            dir: Some(dir.to_path_buf()),
            uuid: Mutex::new(uuid),
            index: engine.clone(),
            engine: Some(engine),
            wal: Mutex::new(Some(wal)),
            wal_options,
            mastery: AtomicI64::new(mastery),
            poisoned: AtomicBool::new(false),
            forced_read_only: AtomicBool::new(forced_read_only),
            last_commit_tx: Mutex::new(last_commit_tx),
            last_used: Mutex::new(std::time::Instant::now()),
        })
    }

    /// Opens a read-only handle over one or more local shards; the
    /// first path is opened and the rest are added to the federation.
    pub fn open_read_only(
        endpoints: Endpoints,
        hash: u64,
        flags: u64,
        reopen_generation: u64,
        dirs: &[PathBuf],
    ) -> Result<Self> {
        if dirs.is_empty() {
            return Err(Error::CheckoutError("no endpoint".into()));
        }
        let mut children: Vec<Arc<dyn Index>> = Vec::with_capacity(dirs.len());
        let mut mastery = 0;
        for dir in dirs {
            let uuid = segment::stored_uuid(dir)?
                .ok_or_else(|| Error::CheckoutError(format!("no shard at {}", dir.display())))?;
            let index = Arc::new(MemoryIndex::new(uuid));
            let wal = Wal::open(dir, uuid, false, WalOptions::default())?;
            let mut pending: Vec<WalEntry> = Vec::new();
            for entry in wal.replay(None)? {
                let entry = entry?;
                let is_commit = entry.op == WalOp::Commit;
                pending.push(entry);
                if is_commit {
                    for entry in pending.drain(..) {
                        apply_to_index(index.as_ref(), entry.op, &entry.payload)?;
                    }
                }
            }
            // Whatever is left after the last commit is uncommitted;
            // readers never observe it.
            children.push(index);
            mastery = mastery.max(read_mastery(dir));
        }

        let uuid = children[0].uuid();
        let index: Arc<dyn Index> = if children.len() == 1 {
            children.pop().expect("one child")
        } else {
            Arc::new(FederatedIndex::new(children))
        };
        Ok(Self {
            endpoints,
            hash,
            writable: false,
            flags,
            reopen_generation,
            dir: None,
            uuid: Mutex::new(uuid),
            index,
            engine: None,
            wal: Mutex::new(None),
            wal_options: WalOptions::default(),
            mastery: AtomicI64::new(mastery),
            poisoned: AtomicBool::new(false),
            forced_read_only: AtomicBool::new(false),
            last_commit_tx: Mutex::new(None),
            last_used: Mutex::new(std::time::Instant::now()),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn reopen_generation(&self) -> u64 {
        self.reopen_generation
    }

    pub fn index(&self) -> &dyn Index {
        self.index.as_ref()
    }

    /// Shard identity: the uuid stamped in the WAL headers.
    pub fn uuid(&self) -> Uuid {
        *self.uuid.lock()
    }

    pub fn mastery_level(&self) -> i64 {
        self.mastery.load(Ordering::Relaxed)
    }

    pub fn set_mastery_level(&self, level: i64) -> Result<()> {
        self.mastery.store(level, Ordering::Relaxed);
        if let Some(dir) = &self.dir {
            write_mastery(dir, level)?;
        }
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    /// Marks the handle unfit for pooling; check-in destroys it.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Relaxed);
    }

    pub fn is_forced_read_only(&self) -> bool {
        self.forced_read_only.load(Ordering::Relaxed)
    }

    pub fn last_commit_tx(&self) -> Option<u64> {
        *self.last_commit_tx.lock()
    }

    pub fn last_used(&self) -> std::time::Instant {
        *self.last_used.lock()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = std::time::Instant::now();
    }

    pub fn wal_next_tx_id(&self) -> Option<u64> {
        self.wal.lock().as_ref().map(|wal| wal.next_tx_id())
    }

    pub fn wal_last_tx_id(&self) -> Option<u64> {
        self.wal.lock().as_ref().and_then(|wal| wal.last_tx_id())
    }

    pub fn wal_checksum(&self) -> Result<u32> {
        match self.wal.lock().as_ref() {
            Some(wal) => Ok(wal.checksum()?),
            None => Err(Error::InvalidArgument("database has no WAL".into())),
        }
    }

    /// Journals one operation and applies it to the engine in the same
    /// critical section. On an engine failure the operation is rolled
    /// back entirely; the WAL tail is truncated at the last commit.
    pub fn apply(&self, op: WalOp, payload: &[u8]) -> Result<Applied> {
        self.check_writable()?;
        let wal_guard = self.wal.lock();
        let wal = wal_guard
            .as_ref()
            .ok_or_else(|| Error::InternalError("writable database without WAL".into()))?;

        let tx_id = wal.write(op, payload)?;
        let docid = match apply_to_index(self.index.as_ref(), op, payload) {
            Ok(docid) => docid,
            Err(err) => {
                self.rollback_locked(wal);
                return Err(err);
            }
        };
        if op == WalOp::Commit {
            *self.last_commit_tx.lock() = Some(tx_id);
            self.index.commit()?;
            let level = self.mastery_level() + 1;
            self.set_mastery_level(level)?;
        }
        Ok(Applied {
            outcome: MutationOutcome {
                tx_id,
                committed: op == WalOp::Commit,
            },
            docid,
        })
    }

    /// Applies a replicated entry verbatim; the local log must be
    /// exactly contiguous with the stream.
    pub fn apply_replicated(&self, entry: &WalEntry) -> Result<()> {
        let next = self
            .wal_next_tx_id()
            .ok_or_else(|| Error::InternalError("writable database without WAL".into()))?;
        if next != entry.tx_id {
            return Err(Error::InternalError(format!(
                "replicated entry {} does not extend local log at {next}",
                entry.tx_id,
            )));
        }
        let applied = self.apply(entry.op, &entry.payload)?;
        debug_assert_eq!(applied.outcome.tx_id, entry.tx_id);
        Ok(())
    }

    /// Discards everything since the last commit.
    pub fn cancel(&self) -> Result<()> {
        self.check_writable()?;
        let wal_guard = self.wal.lock();
        let wal = wal_guard
            .as_ref()
            .ok_or_else(|| Error::InternalError("writable database without WAL".into()))?;
        self.index.cancel()?;
        match *self.last_commit_tx.lock() {
            Some(tx) => wal.truncate_to(tx)?,
            None => wal.reset()?,
        }
        Ok(())
    }

    /// Commits the open batch.
    pub fn commit(&self) -> Result<MutationOutcome> {
        self.apply(WalOp::Commit, &[]).map(|applied| applied.outcome)
    }

    /// Replaces the shard wholesale for a full replication pull: a
    /// fresh WAL under the remote shard's identity and an empty engine.
    pub fn resync_to(&self, uuid: Uuid) -> Result<()> {
        if !self.writable {
            return Err(Error::InvalidArgument("database is read-only".into()));
        }
        let dir = self
            .dir
            .clone()
            .ok_or_else(|| Error::InternalError("local shard without directory".into()))?;
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| Error::InternalError("writable database without engine".into()))?;

        let mut wal_guard = self.wal.lock();
        if let Some(wal) = wal_guard.take() {
            wal.close()?;
        }
        for (_, path) in segment::list(&dir)? {
            std::fs::remove_file(path)
                .map_err(|err| Error::InternalError(format!("cannot drop WAL file: {err}")))?;
        }
        engine.clear();
        *wal_guard = Some(Wal::open(&dir, uuid, true, self.wal_options.clone())?);
        *self.uuid.lock() = uuid;
        *self.last_commit_tx.lock() = None;
        self.forced_read_only.store(false, Ordering::Relaxed);
        self.set_mastery_level(0)?;
        Ok(())
    }

    /// Fsyncs and closes the WAL; the handle cannot write afterwards.
    /// Used on the shutdown drain.
    pub fn flush(&self) -> Result<()> {
        if let Some(wal) = self.wal.lock().as_ref() {
            wal.close()?;
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::InvalidArgument("database is read-only".into()));
        }
        if self.is_forced_read_only() {
            return Err(Error::DatabaseCorrupt(
                "shard is read-only after losing committed WAL entries".into(),
            ));
        }
        Ok(())
    }

    fn rollback_locked(&self, wal: &Wal) {
        let rolled_back = self.index.cancel().and_then(|()| {
            match *self.last_commit_tx.lock() {
                Some(tx) => wal.truncate_to(tx).map_err(Error::from),
                None => wal.reset().map_err(Error::from),
            }
        });
        if let Err(err) = rolled_back {
            tracing::error!(%err, "rollback after failed apply also failed; poisoning handle");
            self.poison();
        }
    }
}

/// Decodes a journaled payload and applies it to the engine. Shared by
/// the live write path, recovery replay and replication injection.
pub fn apply_to_index(index: &dyn Index, op: WalOp, payload: &[u8]) -> Result<Option<Docid>> {
    let mut reader = Reader::new(payload);
    let docid = match op {
        WalOp::AddDoc => {
            let doc = Document::decode_from(&mut reader)?;
            Some(index.add_document(&doc)?)
        }
        WalOp::DeleteDoc => {
            let docid = reader.length().map_err(bad)?;
            index.delete_document(docid)?;
            None
        }
        WalOp::DeleteTerm => {
            let term = reader.string().map_err(bad)?;
            index.delete_document_term(term)?;
            None
        }
        WalOp::ReplaceDoc => {
            let docid = reader.length().map_err(bad)?;
            let doc = Document::decode_from(&mut reader)?;
            index.replace_document(docid, &doc)?;
            Some(docid)
        }
        WalOp::ReplaceTerm => {
            let term = reader.string().map_err(bad)?.to_vec();
            let doc = Document::decode_from(&mut reader)?;
            Some(index.replace_document_term(&term, &doc)?)
        }
        WalOp::SetMeta => {
            let key = reader.string().map_err(bad)?.to_vec();
            let value = reader.string().map_err(bad)?;
            index.set_metadata(&key, value)?;
            None
        }
        WalOp::AddSpelling => {
            let freq = reader.length().map_err(bad)?;
            let word = reader.string().map_err(bad)?;
            index.add_spelling(word, freq)?;
            None
        }
        WalOp::RemoveSpelling => {
            let freq = reader.length().map_err(bad)?;
            let word = reader.string().map_err(bad)?;
            index.remove_spelling(word, freq)?;
            None
        }
        WalOp::Commit => None,
    };
    Ok(docid)
}

fn bad(err: xapiand_replication::Error) -> Error {
    Error::BadMessage(format!("bad WAL payload: {err}"))
}

fn mastery_path(dir: &Path) -> PathBuf {
    dir.join("mastery")
}

fn read_mastery(dir: &Path) -> i64 {
    std::fs::read_to_string(mastery_path(dir))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

fn write_mastery(dir: &Path, level: i64) -> Result<()> {
    std::fs::write(mastery_path(dir), format!("{level}\n"))
        .map_err(|err| Error::InternalError(format!("cannot persist mastery: {err}")))
}

/// Mastery of a shard directory, `None` when no shard lives there.
/// This is what the local node announces in `DbUpdated`.
pub fn shard_mastery(dir: &Path) -> Option<i64> {
    match segment::list(dir) {
        Ok(files) if !files.is_empty() => Some(read_mastery(dir)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    fn writable(dir: &Path) -> Database {
        let endpoints = Endpoints::single(Endpoint::local("/idx"));
        let hash = endpoints.key_hash(true);
        Database::open_writable(endpoints, hash, 0, 0, dir, WalOptions::default()).unwrap()
    }

    fn hello_doc(id: u64) -> Vec<u8> {
        let doc = Document::with_data(&b"{ \"message\" : \"Hello world\"}"[..])
            .add_term(b"hello".to_vec(), 1)
            .add_term(format!("QK{id}").into_bytes(), 1);
        let mut payload = Vec::new();
        xapiand_replication::serial::put_string(&mut payload, format!("QK{id}").as_bytes());
        payload.extend_from_slice(&doc.encode());
        payload
    }

    #[test]
    fn write_then_reopen_replays_into_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = writable(dir.path());
            for id in 1..=10 {
                db.apply(WalOp::ReplaceTerm, &hello_doc(id)).unwrap();
                db.commit().unwrap();
            }
            assert_eq!(db.index().doc_count(), 10);
        }
        let db = writable(dir.path());
        assert_eq!(db.index().doc_count(), 10);
        assert_eq!(db.index().term_freq(b"hello"), 10);
        assert_eq!(db.mastery_level(), 10);
    }

    #[test]
    fn uncommitted_tail_is_discarded_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = writable(dir.path());
            db.apply(WalOp::ReplaceTerm, &hello_doc(1)).unwrap();
            db.commit().unwrap();
            // This write never commits.
            db.apply(WalOp::ReplaceTerm, &hello_doc(2)).unwrap();
        }
        let db = writable(dir.path());
        assert_eq!(db.index().doc_count(), 1);
        // The aborted entry is gone from the log too.
        assert_eq!(db.wal_next_tx_id(), Some(2));
    }

    #[test]
    fn cancel_discards_open_batch() {
        let dir = tempfile::tempdir().unwrap();
        let db = writable(dir.path());
        db.apply(WalOp::ReplaceTerm, &hello_doc(1)).unwrap();
        db.commit().unwrap();
        db.apply(WalOp::ReplaceTerm, &hello_doc(2)).unwrap();
        db.cancel().unwrap();
        assert_eq!(db.index().doc_count(), 1);
        let next = db.wal_next_tx_id().unwrap();
        let applied = db.apply(WalOp::ReplaceTerm, &hello_doc(3)).unwrap();
        assert_eq!(applied.outcome.tx_id, next);
    }

    #[test]
    fn read_only_open_observes_committed_state_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = writable(dir.path());
        db.apply(WalOp::ReplaceTerm, &hello_doc(1)).unwrap();
        db.commit().unwrap();
        db.apply(WalOp::ReplaceTerm, &hello_doc(2)).unwrap();
        // Not committed, and the writer is still alive: a reader
        // opening now must not see doc 2.
        let endpoints = Endpoints::single(Endpoint::local("/idx"));
        let hash = endpoints.key_hash(false);
        let reader =
            Database::open_read_only(endpoints, hash, 0, 0, &[dir.path().to_path_buf()])
                .unwrap();
        assert_eq!(reader.index().doc_count(), 1);
        assert!(reader.apply(WalOp::Commit, &[]).is_err());
    }

    #[test]
    fn resync_adopts_remote_identity() {
        let dir = tempfile::tempdir().unwrap();
        let db = writable(dir.path());
        db.apply(WalOp::ReplaceTerm, &hello_doc(1)).unwrap();
        db.commit().unwrap();

        let remote_uuid = Uuid::new_v4();
        db.resync_to(remote_uuid).unwrap();
        assert_eq!(db.uuid(), remote_uuid);
        assert_eq!(db.index().doc_count(), 0);
        assert_eq!(db.wal_next_tx_id(), Some(0));
        assert_eq!(db.mastery_level(), 0);

        // Replicated entries stream in from tx 0 under the new uuid.
        let entry = WalEntry::new(0, WalOp::ReplaceTerm, hello_doc(9));
        db.apply_replicated(&entry).unwrap();
        assert_eq!(db.index().doc_count(), 1);
    }

    #[test]
    fn shard_mastery_only_for_existing_shards() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(shard_mastery(dir.path()), None);
        let db = writable(dir.path());
        db.apply(WalOp::ReplaceTerm, &hello_doc(1)).unwrap();
        db.commit().unwrap();
        drop(db);
        assert_eq!(shard_mastery(dir.path()), Some(1));
    }
}
