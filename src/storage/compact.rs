//! # Compaction
//!
//! Compaction rebuilds the store into a fresh, dense layout and swaps it in.
//!
//! ## Algorithm
//!
//! ```text
//! 1. hold every segment write lock, then the structural lock
//! 2. format an empty target volume with the same store type and features
//! 3. grow the target index table to cover max_recid
//! 4. for recid in 1..=max_recid, reachable when its archive flag is set:
//!      stored      -> copy payload (following chunk chains), packed by bump
//!      absent      -> absent slot, no data
//!      void        -> DELETED slot, recid queued as free
//! 5. push the free recids, highest first, so the lowest is reused first
//! 6. refresh checksums, sync, swap the target in, reload allocator state
//! ```
//!
//! Recids are stable: every live recid keeps its number and value. Only the
//! data region and the long stacks change.
//!
//! ## Swapping
//!
//! | Volume                    | Target                | Swap                          |
//! |---------------------------|-----------------------|-------------------------------|
//! | file or mapped file       | `<path>.compact`      | rename over `<path>`          |
//! | `VolumeKind::Memory`      | new `MemoryVolume`    | replace the volume handle     |
//! | caller-provided volume    | new `MemoryVolume`    | `StoreIo::install_image`      |
//!
//! A WAL store installs the image by logging every page of it under one
//! commit marker before copying, so a torn copy is finished by replay.
//!
//! Readers and writers are blocked for the duration and resume on the new
//! layout.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::debug;

use super::allocator::{AllocState, Allocator};
use super::engine::StoreCore;
use super::header;
use super::index::{IndexEntry, IndexTable, SlotState};
use super::io::{DirectIo, StoreIo};
use super::record;
use crate::config::{VolumeKind, HEAD_FILE_TAIL};
use crate::volume::{MemoryVolume, Volume};

impl<IO: StoreIo> StoreCore<IO> {
    /// Compacts the store. `kind` is how the base volume was opened, `None`
    /// for a caller-provided volume. Buffered writes must already be applied
    /// to the base volume.
    pub fn compact(&self, kind: Option<&VolumeKind>) -> Result<()> {
        self.check_writable()?;
        let _segments = self.segments.write_all();
        let mut state = self.structural.lock();
        self.compact_locked(kind, &mut state)
    }

    /// Compaction body. Callers hold every segment lock and pass the
    /// structural state they locked.
    pub fn compact_locked(&self, kind: Option<&VolumeKind>, state: &mut AllocState) -> Result<()> {
        let (file_tail, max_recid) = (state.file_tail, state.max_recid);
        debug!(file_tail, max_recid, "compaction started");

        match kind {
            Some(VolumeKind::Memory) => {
                let target: Arc<dyn Volume> = Arc::new(MemoryVolume::new());
                self.compact_into(max_recid, &target)?;
                self.seal(&*target)?;
                self.io.replace_volume(target);
            }
            Some(kind) => {
                let sibling = kind.sibling("compact");
                let target = sibling.create_empty()?;
                self.compact_into(max_recid, &target)?;
                self.seal(&*target)?;

                if let (Some(tmp), Some(path)) = (sibling.path(), kind.path()) {
                    std::fs::rename(tmp, path).wrap_err_with(|| {
                        format!("failed to move '{}' over '{}'", tmp.display(), path.display())
                    })?;
                }
                self.io.replace_volume(target);
            }
            None => {
                let image: Arc<dyn Volume> = Arc::new(MemoryVolume::new());
                self.compact_into(max_recid, &image)?;
                self.seal(&*image)?;
                self.io.install_image(&*image)?;
            }
        }

        self.reload(state)?;
        debug!(
            before = file_tail,
            after = state.file_tail,
            free_size = state.free_size,
            "compaction finished"
        );
        Ok(())
    }

    /// Writes the compacted layout of this store into the empty `target`.
    fn compact_into(&self, max_recid: u64, target: &Arc<dyn Volume>) -> Result<()> {
        header::create(&**target, self.store_type, self.features)?;

        let target_io = DirectIo::new(Arc::clone(target));
        let index = IndexTable::new();
        let mut state = AllocState::load(&target_io)?;
        let mut alloc = Allocator::new(&target_io, &mut state, &index);
        alloc.set_max_recid(max_recid)?;

        let mut void = Vec::new();
        for recid in 1..=max_recid {
            let slot = self.read_slot(recid)?;
            let entry = match slot {
                SlotState::Void => {
                    void.push(recid);
                    IndexEntry::deleted()
                }
                SlotState::Absent => IndexEntry::absent(),
                SlotState::Plain { .. } | SlotState::Linked { .. } => {
                    let data = record::read(&self.io, recid, slot)?.unwrap_or_default();
                    let chunks = record::allocate(&mut alloc, data.len())?;
                    record::write(&target_io, recid, &chunks, &data)?
                }
            };
            target_io.put_long(index.recid_to_offset(recid)?, entry.pack())?;
        }

        for recid in void.into_iter().rev() {
            alloc.release_recid(recid)?;
        }
        alloc.finish()
    }

    fn seal(&self, volume: &dyn Volume) -> Result<()> {
        header::write_checksums(volume, self.features, volume.get_long(HEAD_FILE_TAIL)?)?;
        volume.sync()
    }
}
