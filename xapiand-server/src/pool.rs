use std::collections::VecDeque;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use xapiand_wal::WalOptions;

use crate::database::Database;
use crate::endpoint::{Endpoint, Endpoints};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Read-only handles allowed per key; writable keys always cap at
    /// one.
    pub limit: usize,
    /// Idle handles kept per queue; a check-in finding this many idle
    /// destroys the handle instead of pooling it.
    pub threshold: usize,
    pub checkout_timeout: Duration,
    pub wal: WalOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 5,
            checkout_timeout: Duration::from_secs(30),
            wal: WalOptions::default(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    idle: VecDeque<Arc<Database>>,
    outstanding: usize,
    /// outstanding + idle; never exceeds the queue limit.
    total: usize,
    /// Replication is populating the shard; writable checkouts wait.
    replicating: bool,
    /// Bumped on invalidation; handles from older generations are
    /// reopened instead of reused.
    generation: u64,
}

/// One `(hash, writable)` key: its idle handles and waiters.
pub struct DatabaseQueue {
    hash: u64,
    writable: bool,
    endpoints: Endpoints,
    limit: usize,
    threshold: usize,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl DatabaseQueue {
    fn new(hash: u64, writable: bool, endpoints: Endpoints, options: &PoolOptions) -> Self {
        Self {
            hash,
            writable,
            endpoints,
            limit: if writable { 1 } else { options.limit },
            threshold: if writable { 1 } else { options.threshold.max(1) },
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        }
    }

    fn checkin(&self, database: Arc<Database>) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if database.is_poisoned() {
            tracing::warn!(hash = self.hash, "destroying poisoned database handle");
            state.total -= 1;
        } else if database.reopen_generation() != state.generation {
            state.total -= 1;
        } else if state.idle.len() >= self.threshold {
            // Under pressure the queue sheds handles rather than
            // hoarding them.
            state.total -= 1;
        } else {
            state.idle.push_back(database);
        }
        self.cond.notify_one();
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}

/// Process-wide table of database queues, keyed by
/// `Endpoints::key_hash`.
pub struct DatabasePool {
    base_dir: PathBuf,
    options: PoolOptions,
    queues: Mutex<HashMap<u64, Arc<DatabaseQueue>>>,
    shutdown: AtomicBool,
}

impl DatabasePool {
    pub fn new(base_dir: impl Into<PathBuf>, options: PoolOptions) -> Self {
        Self {
            base_dir: base_dir.into(),
            options,
            queues: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Filesystem directory of a shard path.
    pub fn shard_dir(&self, path: &str) -> PathBuf {
        self.base_dir.join(path.trim_start_matches('/'))
    }

    fn queue(&self, endpoints: &Endpoints, writable: bool) -> Arc<DatabaseQueue> {
        let hash = endpoints.key_hash(writable);
        let mut queues = self.queues.lock();
        queues
            .entry(hash)
            .or_insert_with(|| {
                Arc::new(DatabaseQueue::new(
                    hash,
                    writable,
                    endpoints.clone(),
                    &self.options,
                ))
            })
            .clone()
    }

    pub fn checkout(
        &self,
        endpoints: &Endpoints,
        writable: bool,
        flags: u64,
    ) -> Result<CheckedOut> {
        self.checkout_with_timeout(endpoints, writable, flags, self.options.checkout_timeout)
    }

    /// The checkout algorithm: reuse an idle handle, open a new one
    /// while under the limit, otherwise wait on the queue's condvar up
    /// to `timeout`.
    pub fn checkout_with_timeout(
        &self,
        endpoints: &Endpoints,
        writable: bool,
        flags: u64,
        timeout: Duration,
    ) -> Result<CheckedOut> {
        if endpoints.is_empty() {
            return Err(Error::InvalidArgument("empty endpoint group".into()));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let queue = self.queue(endpoints, writable);
        self.checkout_on_queue(&queue, endpoints, writable, flags, timeout, false)
    }

    fn checkout_on_queue(
        &self,
        queue: &Arc<DatabaseQueue>,
        endpoints: &Endpoints,
        writable: bool,
        flags: u64,
        timeout: Duration,
        for_replication: bool,
    ) -> Result<CheckedOut> {
        let deadline = Instant::now() + timeout;
        let mut state = queue.state.lock();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::ShuttingDown);
            }
            if for_replication || !(writable && state.replicating) {
                // Idle handles from stale generations are transparently
                // reopened rather than returned.
                while let Some(database) = state.idle.pop_front() {
                    if database.reopen_generation() == state.generation {
                        state.outstanding += 1;
                        database.touch();
                        return Ok(CheckedOut::new(queue.clone(), database));
                    }
                    tracing::debug!(hash = queue.hash, "dropping stale idle handle");
                    state.total -= 1;
                    drop(database);
                }
                if state.total < queue.limit {
                    state.total += 1;
                    state.outstanding += 1;
                    let generation = state.generation;
                    drop(state);
                    match self.open_database(endpoints, writable, flags, generation) {
                        Ok(database) => {
                            return Ok(CheckedOut::new(queue.clone(), Arc::new(database)))
                        }
                        Err(err) => {
                            let mut state = queue.state.lock();
                            state.total -= 1;
                            state.outstanding -= 1;
                            queue.cond.notify_one();
                            return Err(err);
                        }
                    }
                }
            }
            if queue.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::CheckoutTimeout);
            }
        }
    }

    /// Returns a handle to its queue. Poisoned handles are destroyed,
    /// one waiter is woken either way.
    pub fn checkin(&self, mut handle: CheckedOut) {
        handle.return_to_queue();
    }

    fn open_database(
        &self,
        endpoints: &Endpoints,
        writable: bool,
        flags: u64,
        generation: u64,
    ) -> Result<Database> {
        let hash = endpoints.key_hash(writable);
        if writable {
            let endpoint = endpoints
                .first()
                .ok_or_else(|| Error::CheckoutError("no endpoint".into()))?;
            let dir = self.shard_dir(&endpoint.path);
            Database::open_writable(
                endpoints.clone(),
                hash,
                flags,
                generation,
                &dir,
                self.options.wal.clone(),
            )
        } else {
            // Highest mastery first, ties by node name, so the most
            // authoritative replica is the federation's first shard.
            let mut ordered: Vec<&Endpoint> = endpoints.iter().collect();
            ordered.sort_by(|a, b| {
                b.mastery_level
                    .cmp(&a.mastery_level)
                    .then_with(|| a.node_name.cmp(&b.node_name))
            });
            let mut dirs = Vec::with_capacity(ordered.len());
            for endpoint in ordered {
                if !endpoint.is_local() {
                    return Err(Error::CheckoutError(format!(
                        "endpoint {endpoint} is not on this node; open it remotely"
                    )));
                }
                dirs.push(self.shard_dir(&endpoint.path));
            }
            Database::open_read_only(endpoints.clone(), hash, flags, generation, &dirs)
        }
    }

    /// Marks a shard as being populated by replication. Writable
    /// checkouts block until the guard drops; the drop also invalidates
    /// every open generation for the endpoints.
    pub fn begin_replication(&self, endpoints: &Endpoints, flags: u64) -> Result<ReplicationGuard> {
        let queue = self.queue(endpoints, true);
        {
            let mut state = queue.state.lock();
            if state.replicating {
                return Err(Error::CheckoutError(
                    "shard is already being replicated".into(),
                ));
            }
            state.replicating = true;
        }
        // Take the writable slot like any writer; the flag above keeps
        // other writable checkouts queued even between our checkouts.
        match self.checkout_on_queue(
            &queue,
            endpoints,
            true,
            flags,
            self.options.checkout_timeout,
            true,
        ) {
            Ok(handle) => Ok(ReplicationGuard {
                pool: self,
                queue,
                handle: Some(handle),
            }),
            Err(err) => {
                queue.state.lock().replicating = false;
                queue.cond.notify_all();
                Err(err)
            }
        }
    }

    /// Bumps the reopen generation of both modes of an endpoint group;
    /// stale handles are reopened at their next checkout.
    pub fn invalidate(&self, endpoints: &Endpoints) {
        let queues = self.queues.lock();
        for writable in [false, true] {
            let hash = endpoints.key_hash(writable);
            if let Some(queue) = queues.get(&hash) {
                let mut state = queue.state.lock();
                state.generation += 1;
                queue.cond.notify_all();
            }
        }
    }

    /// Detaches every idle handle, leaving their slots free. Used by
    /// the shutdown path to flush WALs on the fsynchers pool.
    pub fn drain_idle(&self) -> Vec<Arc<Database>> {
        let queues = self.queues.lock();
        let mut drained = Vec::new();
        for queue in queues.values() {
            let mut state = queue.state.lock();
            let dropped = state.idle.len();
            state.total -= dropped;
            drained.extend(state.idle.drain(..));
        }
        drained
    }

    /// Rejects new checkouts, wakes all waiters and drops idle handles.
    /// Outstanding handles drain through their normal check-in.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let queues = self.queues.lock();
        for queue in queues.values() {
            let mut state = queue.state.lock();
            let dropped = state.idle.len();
            state.total -= dropped;
            state.idle.clear();
            queue.cond.notify_all();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Queue bookkeeping for a key, mostly for diagnostics.
    pub fn queue_of(&self, endpoints: &Endpoints, writable: bool) -> Option<Arc<DatabaseQueue>> {
        self.queues
            .lock()
            .get(&endpoints.key_hash(writable))
            .cloned()
    }
}

/// An exclusively owned, checked-out database handle. Dropping it
/// without going through [`DatabasePool::checkin`] still returns it to
/// the queue, with a leak warning.
pub struct CheckedOut {
    queue: Arc<DatabaseQueue>,
    database: Option<Arc<Database>>,
    explicit: bool,
}

impl CheckedOut {
    fn new(queue: Arc<DatabaseQueue>, database: Arc<Database>) -> Self {
        Self {
            queue,
            database: Some(database),
            explicit: false,
        }
    }

    fn return_to_queue(&mut self) {
        self.explicit = true;
        if let Some(database) = self.database.take() {
            self.queue.checkin(database);
        }
    }

    /// Marks the handle as poisoned; check-in destroys it instead of
    /// pooling it.
    pub fn poison(&self) {
        if let Some(database) = &self.database {
            database.poison();
        }
    }

    /// Shares the underlying database so work can run on a committer
    /// thread while this handle stays exclusively checked out.
    pub fn share(&self) -> Arc<Database> {
        self.database.as_ref().expect("handle already returned").clone()
    }
}

impl Deref for CheckedOut {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        self.database.as_ref().expect("handle already returned")
    }
}

impl Drop for CheckedOut {
    fn drop(&mut self) {
        if let Some(database) = self.database.take() {
            if !self.explicit {
                tracing::warn!(
                    hash = self.queue.hash,
                    "database handle dropped without check-in; reclaiming"
                );
            }
            self.queue.checkin(database);
        }
    }
}

/// Exclusive access to a shard while replication repopulates it.
pub struct ReplicationGuard<'a> {
    pool: &'a DatabasePool,
    queue: Arc<DatabaseQueue>,
    handle: Option<CheckedOut>,
}

impl ReplicationGuard<'_> {
    pub fn database(&self) -> &Database {
        self.handle.as_ref().expect("guard still active")
    }
}

impl Drop for ReplicationGuard<'_> {
    fn drop(&mut self) {
        let endpoints = self.queue.endpoints.clone();
        if let Some(mut handle) = self.handle.take() {
            // The pulled state must not be served from pre-pull
            // handles.
            handle.poison();
            handle.return_to_queue();
        }
        {
            let mut state = self.queue.state.lock();
            state.replicating = false;
        }
        self.pool.invalidate(&endpoints);
        self.queue.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &Path) -> DatabasePool {
        DatabasePool::new(dir, PoolOptions::default())
    }

    fn endpoints() -> Endpoints {
        Endpoints::single(Endpoint::local("/idx/books"))
    }

    #[test]
    fn writable_is_exclusive_with_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let endpoints = endpoints();

        let first = pool
            .checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(100))
            .unwrap();
        let second = pool.checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(100));
        assert!(matches!(second, Err(Error::CheckoutTimeout)));

        pool.checkin(first);
        let third = pool
            .checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(100))
            .unwrap();
        pool.checkin(third);
    }

    #[test]
    fn timeout_does_not_leak_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let endpoints = endpoints();

        let held = pool.checkout(&endpoints, true, 0).unwrap();
        for _ in 0..3 {
            let denied =
                pool.checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(20));
            assert!(matches!(denied, Err(Error::CheckoutTimeout)));
        }
        let queue = pool.queue_of(&endpoints, true).unwrap();
        assert_eq!(queue.outstanding(), 1);
        pool.checkin(held);
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(queue.idle(), 1);
    }

    #[test]
    fn poisoned_handles_are_not_pooled() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let endpoints = endpoints();

        let handle = pool.checkout(&endpoints, true, 0).unwrap();
        handle.poison();
        pool.checkin(handle);
        let queue = pool.queue_of(&endpoints, true).unwrap();
        assert_eq!(queue.idle(), 0);

        // The slot is free again: a new handle opens cleanly.
        let fresh = pool.checkout(&endpoints, true, 0).unwrap();
        pool.checkin(fresh);
    }

    #[test]
    fn invalidate_reopens_idle_handles() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let endpoints = endpoints();

        let handle = pool.checkout(&endpoints, true, 0).unwrap();
        pool.checkin(handle);
        pool.invalidate(&endpoints);

        let handle = pool.checkout(&endpoints, true, 0).unwrap();
        assert_eq!(handle.reopen_generation(), 1);
        pool.checkin(handle);
    }

    #[test]
    fn shutdown_rejects_new_checkouts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let endpoints = endpoints();
        let handle = pool.checkout(&endpoints, true, 0).unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.checkout(&endpoints, true, 0),
            Err(Error::ShuttingDown)
        ));
        // Outstanding work still drains.
        pool.checkin(handle);
    }

    #[test]
    fn replication_blocks_writable_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let endpoints = endpoints();

        let guard = pool.begin_replication(&endpoints, 0).unwrap();
        let denied = pool.checkout_with_timeout(&endpoints, true, 0, Duration::from_millis(50));
        assert!(matches!(denied, Err(Error::CheckoutTimeout)));
        drop(guard);

        let handle = pool.checkout(&endpoints, true, 0).unwrap();
        assert_eq!(handle.reopen_generation(), 1);
        pool.checkin(handle);
    }
}
