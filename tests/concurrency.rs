//! # Concurrency Tests
//!
//! Many threads sharing one store:
//! 1. Compare-and-swap counters lose no increments
//! 2. Parallel writers on distinct recids never see each other's values
//! 3. Commit and compaction run while other threads keep writing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recstore::{Store, StoreConfig, StoreDirect, StoreWal, VolumeKind};

const THREADS: usize = 8;

fn direct() -> Arc<dyn Store> {
    Arc::new(StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap())
}

fn wal() -> Arc<dyn Store> {
    Arc::new(StoreWal::open(VolumeKind::Memory, StoreConfig::default()).unwrap())
}

fn read_counter(store: &dyn Store, recid: u64) -> Option<Vec<u8>> {
    store.get(recid).unwrap()
}

fn decode(value: &Option<Vec<u8>>) -> u64 {
    value
        .as_deref()
        .map(|bytes| u64::from_le_bytes(bytes.try_into().unwrap()))
        .unwrap_or(0)
}

mod cas_tests {
    use super::*;

    fn cas_counter_loses_no_increment(store: Arc<dyn Store>) {
        let counter = store.preallocate().unwrap();
        let applied = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&store);
                let applied = Arc::clone(&applied);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    for _ in 0..500 {
                        let delta = rng.gen_range(1..10u64);
                        let current = read_counter(&*store, counter);
                        let next = (decode(&current) + delta).to_le_bytes();
                        if store
                            .compare_and_swap(counter, current.as_deref(), Some(&next[..]))
                            .unwrap()
                        {
                            applied.fetch_add(delta, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total = decode(&read_counter(&*store, counter));
        assert_eq!(
            total,
            applied.load(Ordering::Relaxed),
            "counter SHOULD equal the sum of successful swaps"
        );
        assert!(total > 0);
    }

    #[test]
    fn direct_store_cas_counter() {
        cas_counter_loses_no_increment(direct());
    }

    #[test]
    fn wal_store_cas_counter() {
        cas_counter_loses_no_increment(wal());
    }

    #[test]
    fn retrying_cas_counts_every_increment() {
        let store = direct();
        let counter = store.put(&0u64.to_le_bytes()).unwrap();

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..200 {
                        loop {
                            let current = read_counter(&*store, counter);
                            let next = (decode(&current) + 1).to_le_bytes();
                            if store
                                .compare_and_swap(counter, current.as_deref(), Some(&next[..]))
                                .unwrap()
                            {
                                break;
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(decode(&read_counter(&*store, counter)), (THREADS * 200) as u64);
    }
}

mod writer_tests {
    use super::*;

    fn owned_value(thread: usize, round: usize, len: usize) -> Vec<u8> {
        let mut value = vec![(thread * 31 + round) as u8; len];
        value[..8.min(len)].copy_from_slice(&(thread as u64).to_le_bytes()[..8.min(len)]);
        value
    }

    fn parallel_writers(store: Arc<dyn Store>) {
        thread::scope(|s| {
            for t in 0..THREADS {
                let store = &store;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(100 + t as u64);
                    let mut mine: Vec<(u64, Vec<u8>)> = Vec::new();
                    for round in 0..300 {
                        let len = if rng.gen_ratio(1, 40) {
                            rng.gen_range(70_000..150_000)
                        } else {
                            rng.gen_range(8..600)
                        };
                        let value = owned_value(t, round, len);
                        match rng.gen_range(0..4) {
                            0 | 1 => mine.push((store.put(&value).unwrap(), value)),
                            2 if !mine.is_empty() => {
                                let i = rng.gen_range(0..mine.len());
                                store.update(mine[i].0, &value).unwrap();
                                mine[i].1 = value;
                            }
                            3 if !mine.is_empty() => {
                                let (recid, _) = mine.swap_remove(rng.gen_range(0..mine.len()));
                                store.delete(recid).unwrap();
                            }
                            _ => {}
                        }
                        for (recid, value) in &mine {
                            if rng.gen_ratio(1, 8) {
                                assert_eq!(
                                    store.get(*recid).unwrap().as_deref(),
                                    Some(&value[..]),
                                    "thread {t} SHOULD read its own last write"
                                );
                            }
                        }
                    }
                });
            }
        });

        store.verify().unwrap();
        assert_eq!(store.calculate_free_size().unwrap(), store.tracked_free_size());
    }

    #[test]
    fn direct_store_parallel_writers() {
        parallel_writers(direct());
    }

    #[test]
    fn wal_store_parallel_writers() {
        parallel_writers(wal());
    }

    #[test]
    fn single_segment_still_serializes_correctly() {
        let store: Arc<dyn Store> = Arc::new(
            StoreDirect::open(VolumeKind::Memory, StoreConfig::default().with_segment_count(1))
                .unwrap(),
        );
        parallel_writers(Arc::clone(&store));
        assert_eq!(store.stats().segments, 1);
    }
}

mod maintenance_tests {
    use super::*;

    #[test]
    fn commits_interleave_with_writers() {
        let store = wal();
        let recids: Vec<u64> = (0..THREADS)
            .map(|_| store.put(&0u64.to_le_bytes()).unwrap())
            .collect();

        thread::scope(|s| {
            for (t, &recid) in recids.iter().enumerate() {
                let store = &store;
                s.spawn(move || {
                    for i in 1..=300u64 {
                        store.update(recid, &(i * 1000 + t as u64).to_le_bytes()).unwrap();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..20 {
                    store.commit().unwrap();
                }
            });
        });
        store.commit().unwrap();

        for (t, &recid) in recids.iter().enumerate() {
            assert_eq!(decode(&store.get(recid).unwrap()), 300_000 + t as u64);
        }
        store.verify().unwrap();
    }

    #[test]
    fn compaction_runs_alongside_writers() {
        let store = direct();
        let filler: Vec<u64> = (0..200)
            .map(|i| store.put(&vec![i as u8; 2_000]).unwrap())
            .collect();
        for recid in filler.iter().step_by(2) {
            store.delete(*recid).unwrap();
        }
        let recids: Vec<u64> = (0..THREADS)
            .map(|_| store.put(&0u64.to_le_bytes()).unwrap())
            .collect();

        thread::scope(|s| {
            for &recid in &recids {
                let store = &store;
                s.spawn(move || {
                    for i in 1..=200u64 {
                        store.update(recid, &i.to_le_bytes()).unwrap();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..3 {
                    store.compact().unwrap();
                }
            });
        });

        for &recid in &recids {
            assert_eq!(decode(&store.get(recid).unwrap()), 200);
        }
        for (i, recid) in filler.iter().enumerate().skip(1).step_by(2) {
            assert_eq!(store.get(*recid).unwrap().unwrap(), vec![i as u8; 2_000]);
        }
        store.verify().unwrap();
    }
}
