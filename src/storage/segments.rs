//! # Segment Locks
//!
//! Record-level concurrency control. Recids are spread over a fixed number of
//! segments (`recid & (segments - 1)`), each guarded by one read/write lock:
//!
//! - `get` holds the segment read lock
//! - `put`, `update`, `delete` and `compare_and_swap` hold the write lock
//! - commit, rollback, compaction and verification hold every write lock
//!
//! ## Lock Hierarchy
//!
//! ```text
//! 1. Segment locks, in ascending segment order when more than one is held
//! 2. The structural lock (allocator state), for short critical sections
//! ```
//!
//! The structural lock is never held while waiting for a segment lock.
//! `close` takes only the structural lock, so it cannot deadlock against a
//! thread parked on a segment.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Counters for monitoring segment contention.
#[derive(Debug, Default)]
pub struct LockStats {
    pub acquired: AtomicU64,
    pub contended: AtomicU64,
}

impl LockStats {
    fn record(&self, contended: bool) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
pub(crate) struct SegmentLocks {
    locks: Box<[RwLock<()>]>,
    mask: u64,
    stats: LockStats,
}

impl SegmentLocks {
    /// `count` must be a power of two.
    pub fn new(count: usize) -> Self {
        debug_assert!(count.is_power_of_two());
        Self {
            locks: (0..count).map(|_| RwLock::new(())).collect(),
            mask: count as u64 - 1,
            stats: LockStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    fn segment(&self, recid: u64) -> &RwLock<()> {
        &self.locks[(recid & self.mask) as usize]
    }

    pub fn read(&self, recid: u64) -> RwLockReadGuard<'_, ()> {
        let lock = self.segment(recid);
        if let Some(guard) = lock.try_read() {
            self.stats.record(false);
            return guard;
        }
        self.stats.record(true);
        lock.read()
    }

    pub fn write(&self, recid: u64) -> RwLockWriteGuard<'_, ()> {
        let lock = self.segment(recid);
        if let Some(guard) = lock.try_write() {
            self.stats.record(false);
            return guard;
        }
        self.stats.record(true);
        lock.write()
    }

    /// Every segment, in ascending order.
    pub fn write_all(&self) -> Vec<RwLockWriteGuard<'_, ()>> {
        self.locks.iter().map(|lock| lock.write()).collect()
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn recids_map_onto_segments() {
        let locks = SegmentLocks::new(4);

        assert!(std::ptr::eq(locks.segment(1), locks.segment(5)));
        assert!(!std::ptr::eq(locks.segment(1), locks.segment(2)));
        assert_eq!(locks.len(), 4);
    }

    #[test]
    fn different_segments_do_not_block() {
        let locks = SegmentLocks::new(4);
        let _a = locks.write(1);
        let _b = locks.write(2);
        let _c = locks.read(3);

        assert_eq!(locks.stats().contended.load(Ordering::Relaxed), 0);
        assert_eq!(locks.stats().acquired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn readers_share_a_segment() {
        let locks = SegmentLocks::new(2);
        let _a = locks.read(1);
        let _b = locks.read(3);

        assert_eq!(locks.stats().contended.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn writer_waits_for_reader() {
        let locks = Arc::new(SegmentLocks::new(2));
        let guard = locks.read(1);

        let handle = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let _w = locks.write(1);
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(guard);
        handle.join().unwrap();

        assert_eq!(locks.stats().contended.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn write_all_covers_every_segment() {
        let locks = SegmentLocks::new(8);
        let guards = locks.write_all();

        assert_eq!(guards.len(), 8);
        assert!(locks.segment(3).try_read().is_none());
    }
}
