use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of OS threads fed by a crossbeam channel. CPU-bound
/// phases (WAL fsync, index mutation, replication pulls) run here, off
/// the event-loop threads. Shutdown is drain-mode: queued jobs finish,
/// new ones are rejected.
pub struct TaskPool {
    name: &'static str,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(name: &'static str, threads: usize) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn worker thread");
            workers.push(handle);
        }
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let tx = self.tx.lock();
        match &*tx {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| Error::ShuttingDown),
            None => Err(Error::ShuttingDown),
        }
    }

    /// Closes the queue and waits for in-flight jobs to finish.
    pub fn shutdown(&self) {
        let sender = self.tx.lock().take();
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(pool = self.name, "worker thread panicked");
            }
        }
    }
}

/// The three dedicated pools of the concurrency model.
pub struct WorkerPools {
    /// Serialized per shard by handle exclusivity; parallel across
    /// shards.
    pub committers: TaskPool,
    pub fsynchers: TaskPool,
    pub updaters: TaskPool,
}

impl WorkerPools {
    pub fn new(committers: usize, fsynchers: usize, updaters: usize) -> Self {
        Self {
            committers: TaskPool::new("committer", committers),
            fsynchers: TaskPool::new("fsyncher", fsynchers),
            updaters: TaskPool::new("updater", updaters),
        }
    }

    pub fn shutdown(&self) {
        self.committers.shutdown();
        self.fsynchers.shutdown();
        self.updaters.shutdown();
    }
}

impl Default for WorkerPools {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(4);
        Self::new(cpus, 2, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_and_drain_on_shutdown() {
        let pool = TaskPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn spawn_after_shutdown_is_rejected() {
        let pool = TaskPool::new("test", 1);
        pool.shutdown();
        assert!(matches!(pool.spawn(|| {}), Err(Error::ShuttingDown)));
    }
}
