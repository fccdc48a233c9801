use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::{DatabaseID, LogTreeError, Result, TransactionID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Read, LockMode::Read))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "READ"),
            LockMode::Write => write!(f, "WRITE"),
        }
    }
}

/// Record identity a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockTarget {
    pub db: DatabaseID,
    pub key: Vec<u8>,
}

impl LockTarget {
    pub fn new(db: DatabaseID, key: &[u8]) -> Self {
        Self { db, key: key.to_vec() }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.db, String::from_utf8_lossy(&self.key))
    }
}

/// How a granted lock relates to what the transaction already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    New,
    /// A READ lock was upgraded to WRITE
    Promotion,
    /// The transaction already held a sufficient lock
    Existing,
}

#[derive(Debug)]
struct LockRequest {
    txn: TransactionID,
    mode: LockMode,
    ticket: u64,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<TransactionID, LockMode>,
    waiters: VecDeque<LockRequest>,
}

impl LockEntry {
    fn conflicts(&self, txn: TransactionID, mode: LockMode) -> bool {
        self.holders
            .iter()
            .any(|(holder, held)| *holder != txn && !held.is_compatible_with(&mode))
    }

    fn is_first_waiter(&self, ticket: u64) -> bool {
        self.waiters.front().map_or(false, |request| request.ticket == ticket)
    }

    fn is_free(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<LockTarget, LockEntry>,
    owned: HashMap<TransactionID, HashSet<LockTarget>>,
    next_ticket: u64,
}

impl LockTable {
    fn grant(&mut self, txn: TransactionID, target: &LockTarget, mode: LockMode) {
        if let Some(entry) = self.entries.get_mut(target) {
            entry.holders.insert(txn, mode);
        }
        self.owned.entry(txn).or_default().insert(target.clone());
    }

    fn remove_if_free(&mut self, target: &LockTarget) {
        if self.entries.get(target).map_or(false, LockEntry::is_free) {
            self.entries.remove(target);
        }
    }
}

#[derive(Debug, Default)]
struct LockStats {
    requests: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    promotions: AtomicU64,
    releases: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStatsSnapshot {
    pub requests: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub promotions: u64,
    pub releases: u64,
    pub locked_targets: usize,
}

impl fmt::Display for LockStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Locks:")?;
        writeln!(f, "  Requests: {}", self.requests)?;
        writeln!(f, "  Waits: {}", self.waits)?;
        writeln!(f, "  Timeouts: {}", self.timeouts)?;
        writeln!(f, "  Promotions: {}", self.promotions)?;
        writeln!(f, "  Releases: {}", self.releases)?;
        writeln!(f, "  Locked targets: {}", self.locked_targets)
    }
}

/// Record lock table. Waiters queue FIFO per target and are woken through a
/// single condvar whenever anything is released; every wait is bounded by a
/// timeout. The table latch is never held across I/O.
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    stats: LockStats,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            stats: LockStats::default(),
        }
    }

    /// Acquires `mode` on `target`, waiting up to `timeout`.
    pub fn lock(&self, txn: TransactionID, target: &LockTarget, mode: LockMode, timeout: Duration) -> Result<LockGrant> {
        self.acquire(txn, target, mode, Some(timeout))
    }

    /// Acquires `mode` on `target` only if that is possible right away.
    pub fn lock_no_wait(&self, txn: TransactionID, target: &LockTarget, mode: LockMode) -> Result<LockGrant> {
        self.acquire(txn, target, mode, None)
    }

    fn acquire(
        &self,
        txn: TransactionID,
        target: &LockTarget,
        mode: LockMode,
        wait: Option<Duration>,
    ) -> Result<LockGrant> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock();
        let entry = table.entries.entry(target.clone()).or_default();

        let held = entry.holders.get(&txn).copied();
        if held == Some(LockMode::Write) || (held.is_some() && mode == LockMode::Read) {
            return Ok(LockGrant::Existing);
        }
        let promotion = held.is_some();
        let grant = if promotion {
            LockGrant::Promotion
        } else {
            LockGrant::New
        };

        if !entry.conflicts(txn, mode) && (promotion || entry.waiters.is_empty()) {
            table.grant(txn, target, mode);
            if promotion {
                self.stats.promotions.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(grant);
        }

        let Some(timeout) = wait else {
            table.remove_if_free(target);
            return Err(LogTreeError::LockNotAvailable {
                txn,
                target: target.to_string(),
                mode: mode.to_string(),
            });
        };

        let ticket = table.next_ticket;
        table.next_ticket += 1;
        let request = LockRequest { txn, mode, ticket };
        let entry = table.entries.entry(target.clone()).or_default();
        // A promotion only waits for the other readers to leave
        if promotion {
            entry.waiters.push_front(request);
        } else {
            entry.waiters.push_back(request);
        }
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
        debug!("{} waiting for {} lock on {}", txn, mode, target);

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let timed_out = self.released.wait_until(&mut table, deadline).timed_out();

            let grantable = table
                .entries
                .get(target)
                .map_or(false, |entry| entry.is_first_waiter(ticket) && !entry.conflicts(txn, mode));
            if grantable {
                if let Some(entry) = table.entries.get_mut(target) {
                    entry.waiters.pop_front();
                }
                table.grant(txn, target, mode);
                if promotion {
                    self.stats.promotions.fetch_add(1, Ordering::Relaxed);
                }
                // The next waiter may be compatible too
                self.released.notify_all();
                return Ok(grant);
            }

            if timed_out || Instant::now() >= deadline {
                if let Some(entry) = table.entries.get_mut(target) {
                    entry.waiters.retain(|request| request.ticket != ticket);
                }
                table.remove_if_free(target);
                self.released.notify_all();
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);

                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("{} timed out after {}ms waiting for {} lock on {}", txn, waited_ms, mode, target);
                return Err(LogTreeError::LockTimeout {
                    txn,
                    target: target.to_string(),
                    mode: mode.to_string(),
                    waited_ms,
                });
            }
        }
    }

    pub fn release(&self, txn: TransactionID, target: &LockTarget) -> bool {
        let mut table = self.table.lock();
        let released = table
            .entries
            .get_mut(target)
            .map_or(false, |entry| entry.holders.remove(&txn).is_some());
        if released {
            if let Some(owned) = table.owned.get_mut(&txn) {
                owned.remove(target);
            }
            table.remove_if_free(target);
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
            self.released.notify_all();
        }
        released
    }

    /// Releases every lock `txn` holds. Returns how many were released.
    pub fn release_all(&self, txn: TransactionID) -> usize {
        let mut table = self.table.lock();
        let targets = table.owned.remove(&txn).unwrap_or_default();
        for target in &targets {
            if let Some(entry) = table.entries.get_mut(target) {
                entry.holders.remove(&txn);
            }
            table.remove_if_free(target);
        }
        if !targets.is_empty() {
            self.stats
                .releases
                .fetch_add(targets.len() as u64, Ordering::Relaxed);
            self.released.notify_all();
        }
        targets.len()
    }

    pub fn held_mode(&self, txn: TransactionID, target: &LockTarget) -> Option<LockMode> {
        self.table
            .lock()
            .entries
            .get(target)
            .and_then(|entry| entry.holders.get(&txn).copied())
    }

    pub fn is_write_locked(&self, target: &LockTarget) -> bool {
        self.table.lock().entries.get(target).map_or(false, |entry| {
            entry.holders.values().any(|mode| *mode == LockMode::Write)
        })
    }

    pub fn is_locked(&self, target: &LockTarget) -> bool {
        self.table
            .lock()
            .entries
            .get(target)
            .map_or(false, |entry| !entry.holders.is_empty())
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            promotions: self.stats.promotions.load(Ordering::Relaxed),
            releases: self.stats.releases.load(Ordering::Relaxed),
            locked_targets: self.table.lock().entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn target(key: &str) -> LockTarget {
        LockTarget::new(DatabaseID(1), key.as_bytes())
    }

    #[test]
    fn test_readers_share_writer_excludes() {
        let locks = LockManager::new();
        let t1 = TransactionID(1);
        let t2 = TransactionID(2);

        assert_eq!(locks.lock_no_wait(t1, &target("a"), LockMode::Read).unwrap(), LockGrant::New);
        assert_eq!(locks.lock_no_wait(t2, &target("a"), LockMode::Read).unwrap(), LockGrant::New);
        assert!(matches!(
            locks.lock_no_wait(t2, &target("a"), LockMode::Write),
            Err(LogTreeError::LockNotAvailable { .. })
        ));

        locks.release_all(t1);
        assert_eq!(
            locks.lock_no_wait(t2, &target("a"), LockMode::Write).unwrap(),
            LockGrant::Promotion
        );
        assert!(locks.is_write_locked(&target("a")));
        assert_eq!(locks.lock_no_wait(t2, &target("a"), LockMode::Read).unwrap(), LockGrant::Existing);
    }

    #[test]
    fn test_timeout_is_bounded() {
        let locks = LockManager::new();
        locks.lock_no_wait(TransactionID(1), &target("k"), LockMode::Write).unwrap();

        let start = Instant::now();
        let result = locks.lock(TransactionID(2), &target("k"), LockMode::Write, Duration::from_millis(100));
        let elapsed = start.elapsed();
        assert!(matches!(result, Err(LogTreeError::LockTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(locks.stats().timeouts, 1);

        // The timed out request left nothing behind
        locks.release_all(TransactionID(1));
        assert_eq!(locks.stats().locked_targets, 0);
    }

    #[test]
    fn test_waiter_is_granted_on_release() {
        let locks = Arc::new(LockManager::new());
        locks.lock_no_wait(TransactionID(1), &target("k"), LockMode::Write).unwrap();

        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.lock(TransactionID(2), &target("k"), LockMode::Write, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(locks.release_all(TransactionID(1)), 1);

        assert_eq!(waiter.join().unwrap().unwrap(), LockGrant::New);
        assert_eq!(locks.held_mode(TransactionID(2), &target("k")), Some(LockMode::Write));
    }

    #[test]
    fn test_waiters_are_fifo() {
        let locks = Arc::new(LockManager::new());
        locks.lock_no_wait(TransactionID(1), &target("k"), LockMode::Write).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for txn in 2..5u64 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                locks
                    .lock(TransactionID(txn), &target("k"), LockMode::Write, Duration::from_secs(5))
                    .unwrap();
                order.lock().push(txn);
                thread::sleep(Duration::from_millis(10));
                locks.release_all(TransactionID(txn));
            }));
            // Stagger arrivals so the queue order is known
            thread::sleep(Duration::from_millis(30));
        }
        locks.release_all(TransactionID(1));
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3, 4]);
    }
}
