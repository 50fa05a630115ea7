//! # Direct Store
//!
//! `StoreDirect` writes straight to its volume. There is no transaction log:
//! `commit` refreshes the checksums and syncs, `rollback` is not supported,
//! and a process killed between commits may leave the volume failing its
//! checksums on the next open.
//!
//! ```ignore
//! let store = StoreDirect::open(VolumeKind::mapped("./records.db"), StoreConfig::default())?;
//! let recid = store.put(b"hello")?;
//! store.commit()?;
//! ```

use std::sync::Arc;

use eyre::{bail, Result};
use tracing::{debug, warn};

use crate::config::{StoreConfig, VolumeKind};
use crate::error::StoreError;
use crate::storage::header;
use crate::storage::io::{DirectIo, StoreIo};
use crate::storage::{validate_header, verify_checksums, Bucket, StoreCore, StoreType};
use crate::store::{Store, StoreStats};
use crate::volume::Volume;

pub struct StoreDirect {
    core: StoreCore<DirectIo>,
    kind: Option<VolumeKind>,
    sync_on_commit: bool,
}

impl StoreDirect {
    /// Opens the store at `kind`, formatting the volume if it is empty.
    pub fn open(kind: VolumeKind, config: StoreConfig) -> Result<Self> {
        let volume = kind.open(config.read_only())?;
        Self::assemble(volume, Some(kind), &config)
    }

    /// Opens the store over a caller-provided volume.
    pub fn with_volume(volume: Arc<dyn Volume>, config: StoreConfig) -> Result<Self> {
        Self::assemble(volume, None, &config)
    }

    fn assemble(
        volume: Arc<dyn Volume>,
        kind: Option<VolumeKind>,
        config: &StoreConfig,
    ) -> Result<Self> {
        let read_only = config.read_only() || volume.is_read_only();
        let config = config.clone().with_read_only(read_only);
        let io = DirectIo::new(Arc::clone(&volume));

        let core = if volume.length() == 0 {
            if read_only {
                bail!("cannot create a store on a read-only volume");
            }
            let core = StoreCore::create(io, StoreType::Direct, &config)?;
            volume.sync()?;
            core
        } else {
            let features = validate_header(&*volume, StoreType::Direct, &config)?;
            verify_checksums(&*volume, features)?;
            StoreCore::assemble(io, StoreType::Direct, features, &config)?
        };

        Ok(Self {
            core,
            kind,
            sync_on_commit: config.sync_on_commit(),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }

    /// Values currently pushed onto `bucket`, in pop order.
    pub fn debug_long_stack_values(&self, bucket: Bucket) -> Result<Vec<u64>> {
        self.core.long_stack_values(bucket)
    }

    pub fn debug_max_recid(&self) -> u64 {
        self.core.max_recid()
    }

    /// Writes checksums for the current state. Callers hold the structural
    /// lock.
    fn seal(&self, file_tail: u64, sync: bool) -> Result<()> {
        let volume = self.core.io.volume();
        header::write_checksums(&*volume, self.core.features, file_tail)?;
        if sync {
            volume.sync()?;
        }
        Ok(())
    }
}

impl Store for StoreDirect {
    fn put(&self, data: &[u8]) -> Result<u64> {
        self.core.put(data)
    }

    fn get(&self, recid: u64) -> Result<Option<Vec<u8>>> {
        self.core.get(recid)
    }

    fn update(&self, recid: u64, data: &[u8]) -> Result<()> {
        self.core.update(recid, data)
    }

    fn delete(&self, recid: u64) -> Result<()> {
        self.core.delete(recid)
    }

    fn compare_and_swap_by(
        &self,
        recid: u64,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        eq: &dyn Fn(Option<&[u8]>, Option<&[u8]>) -> bool,
    ) -> Result<bool> {
        self.core.compare_and_swap_by(recid, expected, new, eq)
    }

    fn preallocate(&self) -> Result<u64> {
        self.core.preallocate()
    }

    fn commit(&self) -> Result<()> {
        self.core.check_writable()?;
        let _segments = self.core.segments.write_all();
        let state = self.core.structural.lock();
        self.seal(state.file_tail, self.sync_on_commit)?;
        debug!(max_recid = state.max_recid, "direct store committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.core.check_open()?;
        Err(StoreError::RollbackUnsupported.into())
    }

    fn compact(&self) -> Result<()> {
        self.core.compact(self.kind.as_ref())
    }

    fn verify(&self) -> Result<()> {
        self.core.verify()
    }

    fn get_all_recids(&self) -> Result<Box<dyn Iterator<Item = Result<u64>> + '_>> {
        Ok(Box::new(self.core.recids()?))
    }

    /// Takes only the structural lock, so a thread parked on a segment lock
    /// cannot block it.
    fn close(&self) -> Result<()> {
        if !self.core.mark_closed() {
            return Ok(());
        }
        if !self.core.is_read_only() {
            let state = self.core.structural.lock();
            self.seal(state.file_tail, true)?;
        }
        debug!("direct store closed");
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.core.stats()
    }

    fn calculate_free_size(&self) -> Result<u64> {
        self.core.calculate_free_size()
    }

    fn tracked_free_size(&self) -> u64 {
        self.core.tracked_free_size()
    }
}

impl Drop for StoreDirect {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close direct store: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorExt;
    use crate::volume::MemoryVolume;

    fn store() -> StoreDirect {
        StoreDirect::open(VolumeKind::Memory, StoreConfig::default()).unwrap()
    }

    #[test]
    fn recid_reuse_scenario() {
        let store = store();
        let r1 = store.put(b"aa").unwrap();
        let r2 = store.put(b"bb").unwrap();
        assert_ne!(r1, r2);

        store.delete(r1).unwrap();
        assert_eq!(store.put(b"cc").unwrap(), r1);

        assert_eq!(store.get(r1).unwrap().unwrap(), b"cc");
        assert_eq!(store.get(r2).unwrap().unwrap(), b"bb");
    }

    #[test]
    fn rollback_is_unsupported() {
        let store = store();
        let err = store.rollback().unwrap_err();

        assert_eq!(err.store_error(), Some(&StoreError::RollbackUnsupported));
    }

    #[test]
    fn close_is_idempotent() {
        let store = store();
        let recid = store.put(b"x").unwrap();
        store.close().unwrap();
        store.close().unwrap();

        assert_eq!(store.get(recid).unwrap_err().store_error(), Some(&StoreError::Closed));
        assert_eq!(store.put(b"y").unwrap_err().store_error(), Some(&StoreError::Closed));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let volume = Arc::new(MemoryVolume::new());
        let recid = {
            let store =
                StoreDirect::with_volume(Arc::clone(&volume) as Arc<dyn Volume>, StoreConfig::default())
                    .unwrap();
            store.put(b"frozen").unwrap()
        };

        let store = StoreDirect::with_volume(
            volume,
            StoreConfig::default().with_read_only(true),
        )
        .unwrap();

        assert_eq!(store.get(recid).unwrap().unwrap(), b"frozen");
        assert_eq!(store.put(b"x").unwrap_err().store_error(), Some(&StoreError::ReadOnly));
        assert_eq!(store.commit().unwrap_err().store_error(), Some(&StoreError::ReadOnly));
        assert!(store.delete(recid).unwrap_err().store_error() == Some(&StoreError::ReadOnly));
    }

    #[test]
    fn empty_read_only_volume_cannot_be_formatted() {
        let volume = Arc::new(MemoryVolume::from_bytes(Vec::new(), true));

        assert!(StoreDirect::with_volume(volume, StoreConfig::default()).is_err());
    }

    #[test]
    fn stats_track_allocation() {
        let store = store();
        let empty = store.stats();
        let recid = store.put(&[1u8; 100]).unwrap();
        store.delete(recid).unwrap();

        let stats = store.stats();
        assert_eq!(empty.max_recid, 0);
        assert_eq!(stats.max_recid, 1);
        assert_eq!(stats.free_size, 112);
        assert_eq!(stats.index_pages, 1);
        assert!(stats.data_tail > empty.data_tail);
        assert!(stats.segment_locks_acquired >= 2);
    }

    #[test]
    fn free_recids_are_visible_for_diagnostics() {
        let store = store();
        let ids: Vec<u64> = (0..3).map(|_| store.put(b"v").unwrap()).collect();
        store.delete(ids[0]).unwrap();
        store.delete(ids[2]).unwrap();

        assert_eq!(
            store.debug_long_stack_values(Bucket::Recid).unwrap(),
            vec![ids[2], ids[0]]
        );
        assert_eq!(store.debug_max_recid(), 3);
    }
}
