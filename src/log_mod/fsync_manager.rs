//! Group commit.
//!
//! The first thread that needs an fsync becomes the leader and performs it on
//! behalf of everybody. Threads arriving while the leader is busy wait for it
//! to finish; if the leader's fsync did not cover them, one of them leads the
//! next round, which then covers the whole waiting group with a single fsync.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::common::{Lsn, Result};

#[derive(Debug, Default)]
struct FsyncState {
    leader_active: bool,
    waiters: u64,
}

#[derive(Debug, Default)]
pub struct FsyncStats {
    pub requests: AtomicU64,
    pub fsyncs: AtomicU64,
    pub group_waits: AtomicU64,
}

pub struct FSyncManager {
    state: Mutex<FsyncState>,
    done: Condvar,
    // Every entry below this packed LSN is durable
    synced_end: AtomicU64,
    stats: FsyncStats,
}

impl FSyncManager {
    pub fn new(synced_end: Lsn) -> Self {
        Self {
            state: Mutex::new(FsyncState::default()),
            done: Condvar::new(),
            synced_end: AtomicU64::new(synced_end.as_u64()),
            stats: FsyncStats::default(),
        }
    }

    pub fn synced_end(&self) -> Lsn {
        Lsn::from_u64(self.synced_end.load(Ordering::Acquire))
    }

    pub fn is_synced(&self, lsn: Lsn) -> bool {
        lsn.as_u64() < self.synced_end.load(Ordering::Acquire)
    }

    /// Records that everything before `end` became durable by other means,
    /// such as a file being synced on rotation.
    pub fn mark_synced(&self, end: Lsn) {
        self.synced_end.fetch_max(end.as_u64(), Ordering::AcqRel);
    }

    /// Makes the entry at `lsn` durable. `do_sync` writes out the log and
    /// fsyncs it, returning the end of the log it covered.
    pub fn sync<F>(&self, lsn: Lsn, do_sync: F) -> Result<()>
    where
        F: Fn() -> Result<Lsn>,
    {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if self.is_synced(lsn) {
            return Ok(());
        }

        let mut state = self.state.lock();
        loop {
            if self.is_synced(lsn) {
                return Ok(());
            }

            if state.leader_active {
                state.waiters += 1;
                self.stats.group_waits.fetch_add(1, Ordering::Relaxed);
                self.done.wait(&mut state);
                continue;
            }

            state.leader_active = true;
            drop(state);

            let result = do_sync();

            state = self.state.lock();
            state.leader_active = false;
            state.waiters = 0;
            if let Ok(end) = &result {
                self.synced_end.fetch_max(end.as_u64(), Ordering::AcqRel);
                self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
            }
            self.done.notify_all();
            result?;
        }
    }

    pub fn requests(&self) -> u64 {
        self.stats.requests.load(Ordering::Relaxed)
    }

    pub fn fsyncs(&self) -> u64 {
        self.stats.fsyncs.load(Ordering::Relaxed)
    }

    pub fn group_waits(&self) -> u64 {
        self.stats.group_waits.load(Ordering::Relaxed)
    }
}
