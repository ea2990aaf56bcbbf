use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xapiand_server::endpoint::{Endpoint, Endpoints};
use xapiand_server::index::Document;
use xapiand_server::pool::{DatabasePool, PoolOptions};
use xapiand_server::Error;
use xapiand_wal::WalOp;

fn pool(dir: &Path) -> Arc<DatabasePool> {
    Arc::new(DatabasePool::new(dir, PoolOptions::default()))
}

fn endpoints(path: &str) -> Endpoints {
    Endpoints::single(Endpoint::local(path))
}

fn hello_payload(id: u64) -> Vec<u8> {
    let doc = Document::with_data(&b"{ \"message\" : \"Hello world\"}"[..])
        .add_term(b"hello".to_vec(), 1)
        .add_term(format!("QK{id}").into_bytes(), 1);
    let mut payload = Vec::new();
    xapiand_replication::serial::put_string(&mut payload, format!("QK{id}").as_bytes());
    payload.extend_from_slice(&doc.encode());
    payload
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for dirent in std::fs::read_dir(src).unwrap() {
        let dirent = dirent.unwrap();
        std::fs::copy(dirent.path(), dst.join(dirent.file_name())).unwrap();
    }
}

fn files_identical(a: &Path, b: &Path) -> bool {
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
    names == other
        && names.iter().all(|name| {
            std::fs::read(a.join(name)).unwrap() == std::fs::read(b.join(name)).unwrap()
        })
}

/// The WAL restore scenario: index 1020 documents, snapshot the shard,
/// open a pool against the snapshot and verify the restored shard is
/// byte-identical, WAL file boundaries (`wal.0`, `wal.1016` at entry
/// 1016) included.
#[test]
fn restored_shard_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let restored_data = dir.path().join("restored");

    let source = pool(&data);
    let endpoints = endpoints("/wal-restore");
    let handle = source.checkout(&endpoints, true, 0).unwrap();
    for id in 1..=1020u64 {
        handle.apply(WalOp::ReplaceTerm, &hello_payload(id)).unwrap();
    }
    handle.commit().unwrap();
    source.checkin(handle);

    let shard_dir = source.shard_dir("/wal-restore");
    assert!(shard_dir.join("wal.1016").exists());

    let restored_shard = restored_data.join("wal-restore");
    copy_dir(&shard_dir, &restored_shard);

    // Opening the restored shard replays the log; a clean log must not
    // be rewritten.
    let restored = pool(&restored_data);
    let handle = restored.checkout(&endpoints, true, 0).unwrap();
    assert_eq!(handle.index().doc_count(), 1020);
    assert_eq!(handle.index().term_freq(b"hello"), 1020);
    let restored_checksum = handle.wal_checksum().unwrap();
    restored.checkin(handle);

    assert!(files_identical(&shard_dir, &restored_shard));

    let handle = source.checkout(&endpoints, true, 0).unwrap();
    assert_eq!(handle.wal_checksum().unwrap(), restored_checksum);
    source.checkin(handle);
}

/// With k concurrent writable checkouts on one key, at most one is
/// outstanding at any instant, timeouts surface without leaking the
/// slot, and everyone eventually finishes.
#[test]
fn at_most_one_writer_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(dir.path());
    let endpoints = endpoints("/contended");

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for worker in 0..8u64 {
            let pool = pool.clone();
            let endpoints = endpoints.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            let completed = completed.clone();
            let timed_out = timed_out.clone();
            scope.spawn(move || {
                match pool.checkout_with_timeout(
                    &endpoints,
                    true,
                    0,
                    Duration::from_millis(2000),
                ) {
                    Ok(handle) => {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        handle
                            .apply(WalOp::ReplaceTerm, &hello_payload(worker))
                            .unwrap();
                        handle.commit().unwrap();
                        std::thread::sleep(Duration::from_millis(10));
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        pool.checkin(handle);
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(Error::CheckoutTimeout) => {
                        timed_out.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(other) => panic!("unexpected checkout error: {other}"),
                }
            });
        }
    });

    assert_eq!(peak.load(Ordering::SeqCst), 1, "two writers were live at once");
    assert_eq!(
        completed.load(Ordering::SeqCst) + timed_out.load(Ordering::SeqCst),
        8
    );
    // Timeouts must not have leaked the writable slot.
    let handle = pool
        .checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(500))
        .unwrap();
    pool.checkin(handle);
}

/// Scenario 4: two writers race with a 100 ms timeout; exactly one
/// wins, and checking it back in promptly serves a third request.
#[test]
fn concurrent_writable_checkout_with_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(dir.path());
    let endpoints = endpoints("/race");

    let first = pool
        .checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(100))
        .unwrap();

    let loser = {
        let pool = pool.clone();
        let endpoints = endpoints.clone();
        std::thread::spawn(move || {
            pool.checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(100))
                .err()
        })
    };
    assert!(matches!(
        loser.join().unwrap(),
        Some(Error::CheckoutTimeout)
    ));

    pool.checkin(first);
    let third = pool
        .checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(100))
        .unwrap();
    pool.checkin(third);
}

/// Readers federate multiple shards; writable groups must not.
#[test]
fn read_only_federation_over_two_shards() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(dir.path());

    for (path, id) in [("/fed/a", 1u64), ("/fed/b", 2u64)] {
        let endpoints = endpoints(path);
        let handle = pool.checkout(&endpoints, true, 0).unwrap();
        handle.apply(WalOp::ReplaceTerm, &hello_payload(id)).unwrap();
        handle.commit().unwrap();
        pool.checkin(handle);
    }

    let mut group = Endpoints::new();
    group.add(Endpoint::local("/fed/a"));
    group.add(Endpoint::local("/fed/b"));

    let reader = pool.checkout(&group, false, 0).unwrap();
    assert_eq!(reader.index().doc_count(), 2);
    assert_eq!(reader.index().term_freq(b"hello"), 2);
    pool.checkin(reader);

    assert!(matches!(
        pool.checkout(&group, true, 0),
        Err(Error::InvalidArgument(_))
    ));
}
