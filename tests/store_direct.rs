//! # Direct Store Tests
//!
//! Record operations against `StoreDirect` on every volume backend:
//! 1. Round-trip of payloads around the linked-record threshold
//! 2. Delete-then-access and recid reuse
//! 3. Free-space accounting under a random workload
//! 4. Persistence across close and reopen

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recstore::config::MAX_RECORD_SIZE;
use recstore::{Store, StoreConfig, StoreDirect, StoreErrorExt, VolumeKind};
use tempfile::tempdir;

fn payload(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

mod round_trip_tests {
    use super::*;

    const SIZES: &[usize] = &[
        0,
        1,
        15,
        16,
        17,
        4096,
        MAX_RECORD_SIZE - 1,
        MAX_RECORD_SIZE,
        MAX_RECORD_SIZE + 1,
        2 * MAX_RECORD_SIZE,
        1_000_000,
        1_500_000,
    ];

    fn check_sizes(store: &dyn Store) {
        let mut rng = StdRng::seed_from_u64(7);
        let stored: Vec<(u64, Vec<u8>)> = SIZES
            .iter()
            .map(|&len| {
                let data = payload(&mut rng, len);
                (store.put(&data).unwrap(), data)
            })
            .collect();

        for (recid, data) in &stored {
            assert_eq!(
                store.get(*recid).unwrap().as_deref(),
                Some(&data[..]),
                "payload of {} bytes SHOULD read back unchanged",
                data.len()
            );
        }
        store.verify().unwrap();
    }

    #[test]
    fn memory_volume_round_trips_every_size() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        check_sizes(&store);
    }

    #[test]
    fn mapped_file_round_trips_every_size() {
        let dir = tempdir().unwrap();
        let store =
            StoreDirect::open(VolumeKind::mapped(dir.path().join("store.db")), StoreConfig::default())
                .unwrap();
        check_sizes(&store);
    }

    #[test]
    fn random_access_file_round_trips_every_size() {
        let dir = tempdir().unwrap();
        let store =
            StoreDirect::open(VolumeKind::file(dir.path().join("store.db")), StoreConfig::default())
                .unwrap();
        check_sizes(&store);
    }

    #[test]
    fn update_moves_between_single_and_linked() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let recid = store.put(b"small").unwrap();

        for len in [200_000, 10, MAX_RECORD_SIZE + 8, 0, 70_000] {
            let data = payload(&mut rng, len);
            store.update(recid, &data).unwrap();
            assert_eq!(store.get(recid).unwrap().unwrap(), data);
            assert_eq!(store.calculate_free_size().unwrap(), store.tracked_free_size());
        }
        store.verify().unwrap();
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn deleted_recid_is_void_and_reused() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let r1 = store.put(b"aa").unwrap();
        let r2 = store.put(b"bb").unwrap();

        store.delete(r1).unwrap();

        assert!(store.get(r1).unwrap_err().is_void_access());
        assert!(store.delete(r1).unwrap_err().is_void_access());
        assert_eq!(store.put(b"cc").unwrap(), r1);
        assert_eq!(store.get(r1).unwrap().unwrap(), b"cc");
        assert_eq!(store.get(r2).unwrap().unwrap(), b"bb");
    }

    #[test]
    fn preallocated_slot_is_absent_until_updated() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let recid = store.preallocate().unwrap();

        assert_eq!(store.get(recid).unwrap(), None);
        store.update(recid, b"now set").unwrap();
        assert_eq!(store.get(recid).unwrap().unwrap(), b"now set");
    }

    #[test]
    fn cas_fills_and_clears_slots() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let recid = store.preallocate().unwrap();

        assert!(!store.compare_and_swap(recid, Some(&b"x"[..]), Some(&b"y"[..])).unwrap());
        assert!(store.compare_and_swap(recid, None, Some(&b"first"[..])).unwrap());
        assert!(store.compare_and_swap(recid, Some(&b"first"[..]), None).unwrap());
        assert_eq!(store.get(recid).unwrap(), None);
        assert_eq!(store.get_all_recids().unwrap().count(), 1);
    }

    #[test]
    fn cas_by_uses_caller_equality() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let recid = store.put(b"Hello").unwrap();
        let ignore_case = |a: Option<&[u8]>, b: Option<&[u8]>| match (a, b) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (a, b) => a == b,
        };

        assert!(store
            .compare_and_swap_by(recid, Some(&b"HELLO"[..]), Some(&b"bye"[..]), &ignore_case)
            .unwrap());
        assert_eq!(store.get(recid).unwrap().unwrap(), b"bye");
    }

    #[test]
    fn all_recids_lists_live_slots_in_order() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let ids: Vec<u64> = (0..20u8).map(|i| store.put(&[i]).unwrap()).collect();
        for recid in ids.iter().filter(|r| *r % 3 == 0) {
            store.delete(*recid).unwrap();
        }

        let expected: Vec<u64> = ids.iter().copied().filter(|r| r % 3 != 0).collect();
        let first: Vec<u64> = store.get_all_recids().unwrap().map(Result::unwrap).collect();
        let second: Vec<u64> = store.get_all_recids().unwrap().map(Result::unwrap).collect();
        assert_eq!(first, expected);
        assert_eq!(second, expected, "iteration SHOULD restart on every call");
    }
}

mod accounting_tests {
    use super::*;

    #[test]
    fn random_workload_keeps_free_size_exact() {
        let store = StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut live: Vec<(u64, Vec<u8>)> = Vec::new();

        for step in 0..2_000 {
            let len = if rng.gen_ratio(1, 50) {
                rng.gen_range(MAX_RECORD_SIZE..3 * MAX_RECORD_SIZE)
            } else {
                rng.gen_range(0..2_000)
            };
            match rng.gen_range(0..10) {
                0..=4 => {
                    let data = payload(&mut rng, len);
                    live.push((store.put(&data).unwrap(), data));
                }
                5..=7 if !live.is_empty() => {
                    let i = rng.gen_range(0..live.len());
                    let data = payload(&mut rng, len);
                    store.update(live[i].0, &data).unwrap();
                    live[i].1 = data;
                }
                8..=9 if !live.is_empty() => {
                    let (recid, _) = live.swap_remove(rng.gen_range(0..live.len()));
                    store.delete(recid).unwrap();
                }
                _ => {}
            }
            if step % 100 == 0 {
                assert_eq!(
                    store.calculate_free_size().unwrap(),
                    store.tracked_free_size(),
                    "free size SHOULD match the buckets at step {step}"
                );
            }
        }

        assert_eq!(store.calculate_free_size().unwrap(), store.tracked_free_size());
        for (recid, data) in &live {
            assert_eq!(store.get(*recid).unwrap().as_deref(), Some(&data[..]));
        }
        store.verify().unwrap();
    }
}

mod persistence_tests {
    use super::*;

    fn reopen_keeps_records(kind: VolumeKind) {
        let mut rng = StdRng::seed_from_u64(3);
        let records: Vec<Vec<u8>> = (0..100)
            .map(|i| payload(&mut rng, (i * 997) % 80_000))
            .collect();

        let (ids, deleted, free) = {
            let store = StoreDirect::open(kind.clone(), StoreConfig::default()).unwrap();
            let ids: Vec<u64> = records.iter().map(|r| store.put(r).unwrap()).collect();
            let deleted = ids[10];
            store.delete(deleted).unwrap();
            let free = store.tracked_free_size();
            store.close().unwrap();
            (ids, deleted, free)
        };

        let store = StoreDirect::open(kind, StoreConfig::default()).unwrap();
        assert_eq!(store.tracked_free_size(), free);
        for (recid, data) in ids.iter().zip(&records) {
            if *recid == deleted {
                assert!(store.get(*recid).unwrap_err().is_void_access());
            } else {
                assert_eq!(store.get(*recid).unwrap().as_deref(), Some(&data[..]));
            }
        }
        assert_eq!(store.put(b"reused").unwrap(), deleted);
        store.verify().unwrap();
    }

    #[test]
    fn mapped_file_survives_reopen() {
        let dir = tempdir().unwrap();
        reopen_keeps_records(VolumeKind::mapped(dir.path().join("store.db")));
    }

    #[test]
    fn random_access_file_survives_reopen() {
        let dir = tempdir().unwrap();
        reopen_keeps_records(VolumeKind::file(dir.path().join("store.db")));
    }

    #[test]
    fn dropping_the_store_closes_it() {
        let dir = tempdir().unwrap();
        let kind = VolumeKind::file(dir.path().join("store.db"));
        let recid = {
            let store = StoreDirect::open(kind.clone(), StoreConfig::default()).unwrap();
            store.put(b"kept by drop").unwrap()
        };

        let store = StoreDirect::open(kind, StoreConfig::default()).unwrap();
        assert_eq!(store.get(recid).unwrap().unwrap(), b"kept by drop");
    }

    #[test]
    fn read_only_open_of_file() {
        let dir = tempdir().unwrap();
        let kind = VolumeKind::mapped(dir.path().join("store.db"));
        let recid = {
            let store = StoreDirect::open(kind.clone(), StoreConfig::default()).unwrap();
            store.put(b"read me").unwrap()
        };

        let store = StoreDirect::open(kind, StoreConfig::default().with_read_only(true)).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.get(recid).unwrap().unwrap(), b"read me");
        assert!(store.update(recid, b"no").is_err());
    }
}
