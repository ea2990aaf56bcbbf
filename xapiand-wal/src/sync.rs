use std::fs::File;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// Durability gate for appends. With a zero window every append is
/// fsynced on its own; with a non-zero window the caller that finds no
/// sync in flight becomes the leader, waits out the window so late
/// appends ride along, and fsyncs once for everything appended so far.
/// A write call never returns before the fsync covering it completes.
pub(crate) struct GroupSync {
    window: Duration,
    state: Mutex<SyncState>,
    cond: Condvar,
}

#[derive(Default)]
struct SyncState {
    appended: u64,
    synced: u64,
    syncing: bool,
}

impl GroupSync {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(SyncState::default()),
            cond: Condvar::new(),
        }
    }

    /// Registers a completed append and blocks until it is durable.
    pub(crate) fn write_durable(&self, file: &File) -> Result<()> {
        if self.window.is_zero() {
            file.sync_data()?;
            return Ok(());
        }

        let my_gen = {
            let mut state = self.state.lock();
            state.appended += 1;
            state.appended
        };

        loop {
            let mut state = self.state.lock();
            if state.synced >= my_gen {
                return Ok(());
            }
            if !state.syncing {
                state.syncing = true;
                drop(state);

                std::thread::sleep(self.window);
                let covered = self.state.lock().appended;
                let outcome = file.sync_data();

                let mut state = self.state.lock();
                state.syncing = false;
                if outcome.is_ok() {
                    state.synced = state.synced.max(covered);
                }
                self.cond.notify_all();
                outcome?;
            } else {
                self.cond.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_syncs_inline() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("f")).unwrap();
        let sync = GroupSync::new(Duration::ZERO);
        sync.write_durable(&file).unwrap();
    }

    #[test]
    fn windowed_appends_all_become_durable() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("f")).unwrap();
        let sync = GroupSync::new(Duration::from_millis(5));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| sync.write_durable(&file).unwrap());
            }
        });
    }
}
