use std::path::Path;
use std::time::Duration;

use uuid::Uuid;
use xapiand_wal::{Wal, WalEntry, WalOp, WalOptions};

const DOC: &[u8] = b"{ \"message\" : \"Hello world\"}";

fn open_writable(dir: &Path, uuid: Uuid) -> Wal {
    Wal::open(dir, uuid, true, WalOptions::default()).unwrap()
}

fn collect(wal: &Wal, since: Option<u64>) -> Vec<WalEntry> {
    wal.replay(since).unwrap().map(|e| e.unwrap()).collect()
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for dirent in std::fs::read_dir(src).unwrap() {
        let dirent = dirent.unwrap();
        std::fs::copy(dirent.path(), dst.join(dirent.file_name())).unwrap();
    }
}

fn dir_files_equal(a: &Path, b: &Path) -> bool {
    let mut names: Vec<_> = std::fs::read_dir(a)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    names.sort();
    let mut other: Vec<_> = std::fs::read_dir(b)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    other.sort();
    if names != other {
        return false;
    }
    names.iter().all(|name| {
        std::fs::read(a.join(name)).unwrap() == std::fs::read(b.join(name)).unwrap()
    })
}

#[test]
fn replay_round_trips_written_ops() {
    let dir = tempfile::tempdir().unwrap();
    let wal = open_writable(dir.path(), Uuid::new_v4());

    let ops = [
        (WalOp::AddDoc, &b"first"[..]),
        (WalOp::ReplaceTerm, &b"QKsecond"[..]),
        (WalOp::SetMeta, &b"schema"[..]),
        (WalOp::DeleteDoc, &b"3"[..]),
        (WalOp::Commit, &b""[..]),
    ];
    for (op, payload) in &ops {
        wal.write(*op, payload).unwrap();
    }

    let replayed = collect(&wal, None);
    assert_eq!(replayed.len(), ops.len());
    for (tx, (entry, (op, payload))) in replayed.iter().zip(&ops).enumerate() {
        assert_eq!(entry.tx_id, tx as u64);
        assert_eq!(entry.op, *op);
        assert_eq!(&entry.payload[..], *payload);
    }

    let suffix = collect(&wal, Some(2));
    assert_eq!(suffix.len(), 2);
    assert_eq!(suffix[0].tx_id, 3);
}

#[test]
fn rotation_splits_at_1016_entries() {
    let dir = tempfile::tempdir().unwrap();
    let wal = open_writable(dir.path(), Uuid::new_v4());
    for _ in 0..1020 {
        wal.write(WalOp::ReplaceDoc, DOC).unwrap();
    }

    assert!(dir.path().join("wal.0").exists());
    assert!(dir.path().join("wal.1016").exists());
    assert_eq!(wal.last_tx_id(), Some(1019));

    let replayed = collect(&wal, None);
    assert_eq!(replayed.len(), 1020);
    assert_eq!(replayed.last().unwrap().tx_id, 1019);
}

#[test]
fn restored_snapshot_is_byte_identical_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let shard = dir.path().join("shard");
    let restored = dir.path().join("restored");
    let uuid = Uuid::new_v4();

    let wal = open_writable(&shard, uuid);
    for _ in 0..1020 {
        wal.write(WalOp::ReplaceDoc, DOC).unwrap();
    }
    wal.close().unwrap();

    copy_dir(&shard, &restored);

    // Reopening a clean log must recover without rewriting anything.
    let reopened = open_writable(&restored, uuid);
    assert_eq!(reopened.truncated_from(), None);
    assert_eq!(reopened.next_tx_id(), 1020);
    drop(reopened);

    assert!(dir_files_equal(&shard, &restored));

    let original = open_writable(&shard, uuid);
    let restored_wal = open_writable(&restored, uuid);
    assert_eq!(
        original.checksum().unwrap(),
        restored_wal.checksum().unwrap()
    );
}

#[test]
fn corrupt_tail_is_truncated_and_later_files_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = Uuid::new_v4();
    let wal = open_writable(dir.path(), uuid);
    for _ in 0..1020 {
        wal.write(WalOp::AddDoc, DOC).unwrap();
    }
    wal.close().unwrap();

    // Flip one payload bit inside record 500 of the first file. Records
    // for DOC are 48 bytes after the 32-byte header.
    let target = dir.path().join("wal.0");
    let mut raw = std::fs::read(&target).unwrap();
    raw[32 + 500 * 48 + 20] ^= 0x10;
    std::fs::write(&target, &raw).unwrap();

    let recovered = open_writable(dir.path(), uuid);
    assert_eq!(recovered.truncated_from(), Some(500));
    assert!(!dir.path().join("wal.1016").exists());
    assert_eq!(recovered.next_tx_id(), 500);

    let replayed = collect(&recovered, None);
    assert_eq!(replayed.len(), 500);
    for (tx, entry) in replayed.iter().enumerate() {
        assert_eq!(entry.tx_id, tx as u64);
        assert_eq!(&entry.payload[..], DOC);
    }
}

#[test]
fn truncate_to_rewinds_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = Uuid::new_v4();
    let wal = open_writable(dir.path(), uuid);
    for _ in 0..1020 {
        wal.write(WalOp::AddDoc, DOC).unwrap();
    }

    wal.truncate_to(1000).unwrap();
    assert_eq!(wal.next_tx_id(), 1001);
    assert!(!dir.path().join("wal.1016").exists());
    assert_eq!(collect(&wal, None).len(), 1001);

    // Writes continue contiguously after the rewind.
    let tx = wal.write(WalOp::Commit, b"").unwrap();
    assert_eq!(tx, 1001);
}

#[test]
fn grouped_sync_window_still_durable_per_write() {
    let dir = tempfile::tempdir().unwrap();
    let options = WalOptions {
        sync_window: Duration::from_millis(2),
        ..WalOptions::default()
    };
    let wal = Wal::open(dir.path(), Uuid::new_v4(), true, options).unwrap();
    for tx in 0..20 {
        assert_eq!(wal.write(WalOp::AddDoc, DOC).unwrap(), tx);
    }
    assert_eq!(collect(&wal, None).len(), 20);
}

#[test]
fn read_only_wal_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = Uuid::new_v4();
    let wal = open_writable(dir.path(), uuid);
    wal.write(WalOp::AddDoc, DOC).unwrap();
    wal.close().unwrap();

    let reader = Wal::open(dir.path(), uuid, false, WalOptions::default()).unwrap();
    assert!(reader.write(WalOp::AddDoc, DOC).is_err());
    assert_eq!(collect(&reader, None).len(), 1);
}
