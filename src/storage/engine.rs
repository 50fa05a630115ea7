//! # Record Engine
//!
//! `StoreCore` implements the record operations over any [`StoreIo`]. The
//! direct store runs it on the volume itself, the WAL store on a buffering
//! overlay; everything about layout, allocation and locking lives here.
//!
//! ## Operation Outline
//!
//! ```text
//! put(data)      structural: alloc recid, mark slot absent
//!                segment W:  structural: allocate chunks
//!                            copy bytes, write slot
//! update(r, d)   segment W:  same allocation class -> overwrite in place
//!                            otherwise allocate new, write slot,
//!                            structural: release old chunks
//! delete(r)      segment W:  write DELETED slot,
//!                            structural: release chunks, push recid
//! cas(r, e, n)   segment W:  read, compare, then as update
//! get(r)         segment R:  read slot, follow chunks
//! ```
//!
//! A structural section always ends with `Allocator::finish`, so free-size
//! accounting is exact whenever the structural lock is free.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::Result;
use parking_lot::Mutex;
use tracing::debug;

use super::allocator::{allocation_size, calculate_free_size, AllocState, Allocator};
use super::header::{self, Features, HeaderPrefix, StoreType};
use super::index::{IndexEntry, IndexTable, SlotState};
use super::io::StoreIo;
use super::long_stack::{self, Bucket};
use super::record;
use super::segments::SegmentLocks;
use crate::config::{StoreConfig, HEAD_FILE_TAIL, MAX_RECORD_SIZE};
use crate::error::StoreError;
use crate::store::StoreStats;
use crate::volume::Volume;

pub(crate) struct StoreCore<IO: StoreIo> {
    pub io: IO,
    pub index: IndexTable,
    pub structural: Mutex<AllocState>,
    pub segments: SegmentLocks,
    pub features: Features,
    pub store_type: StoreType,
    max_recid: AtomicU64,
    read_only: bool,
    closed: AtomicBool,
}

/// Checks the header of an existing volume against the requested options.
pub(crate) fn validate_header(
    volume: &dyn Volume,
    store_type: StoreType,
    config: &StoreConfig,
) -> Result<Features> {
    HeaderPrefix::read(volume)?.validate(store_type, Features::from_config(config))
}

pub(crate) fn verify_checksums(volume: &dyn Volume, features: Features) -> Result<()> {
    let file_tail = volume.get_long(HEAD_FILE_TAIL)?;
    header::verify_checksums(volume, features, file_tail)
}

impl<IO: StoreIo> StoreCore<IO> {
    /// Formats the empty volume behind `io` and opens it.
    pub fn create(io: IO, store_type: StoreType, config: &StoreConfig) -> Result<Self> {
        let features = Features::from_config(config);
        let volume = io.volume();
        header::create(&*volume, store_type, features)?;
        header::write_checksums(&*volume, features, volume.get_long(HEAD_FILE_TAIL)?)?;
        Self::assemble(io, store_type, features, config)
    }

    /// Loads allocator state and the index table. The header must already be
    /// validated.
    pub fn assemble(
        io: IO,
        store_type: StoreType,
        features: Features,
        config: &StoreConfig,
    ) -> Result<Self> {
        let state = AllocState::load(&io)?;
        let index = IndexTable::load(&io, state.file_tail)?;
        if state.max_recid > index.capacity() {
            return Err(StoreError::corruption(format!(
                "max recid {} exceeds index capacity {}",
                state.max_recid,
                index.capacity()
            ))
            .into());
        }
        debug!(
            store_type = store_type.name(),
            max_recid = state.max_recid,
            file_tail = state.file_tail,
            index_pages = index.page_count(),
            "store opened"
        );

        Ok(Self {
            io,
            index,
            max_recid: AtomicU64::new(state.max_recid),
            structural: Mutex::new(state),
            segments: SegmentLocks::new(config.segment_count()),
            features,
            store_type,
            read_only: config.read_only(),
            closed: AtomicBool::new(false),
        })
    }

    /// Re-reads allocator state and the index table from `io`. Callers hold
    /// every lock.
    pub fn reload(&self, state: &mut AllocState) -> Result<()> {
        *state = AllocState::load(&self.io)?;
        self.index
            .reset_from(IndexTable::load(&self.io, state.file_tail)?);
        self.max_recid.store(state.max_recid, Ordering::Release);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }

    pub fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(StoreError::ReadOnly.into());
        }
        Ok(())
    }

    /// Marks the store closed. Returns false if it already was.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn with_allocator<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Allocator<'_, IO>) -> Result<R>,
    {
        let mut state = self.structural.lock();
        self.with_allocator_locked(&mut state, f)
    }

    pub fn with_allocator_locked<R, F>(&self, state: &mut AllocState, f: F) -> Result<R>
    where
        F: FnOnce(&mut Allocator<'_, IO>) -> Result<R>,
    {
        let out = {
            let mut alloc = Allocator::new(&self.io, state, &self.index);
            let out = f(&mut alloc)?;
            alloc.finish()?;
            out
        };
        self.max_recid.store(state.max_recid, Ordering::Release);
        Ok(out)
    }

    pub fn max_recid(&self) -> u64 {
        self.max_recid.load(Ordering::Acquire)
    }

    pub fn read_slot(&self, recid: u64) -> Result<SlotState> {
        if recid == 0 || recid > self.max_recid() {
            return Ok(SlotState::Void);
        }
        SlotState::decode(self.io.get_long(self.index.recid_to_offset(recid)?)?)
    }

    fn write_slot(&self, recid: u64, entry: IndexEntry) -> Result<()> {
        self.io
            .put_long(self.index.recid_to_offset(recid)?, entry.pack())
    }

    fn live_slot(&self, recid: u64) -> Result<SlotState> {
        match self.read_slot(recid)? {
            SlotState::Void => Err(StoreError::VoidAccess { recid }.into()),
            state => Ok(state),
        }
    }

    /// Allocates space for `value` and points the slot at it. Does not free
    /// what the slot held before.
    fn store_value(&self, recid: u64, value: Option<&[u8]>) -> Result<()> {
        let entry = match value {
            None => IndexEntry::absent(),
            Some(data) => {
                let chunks = if data.is_empty() {
                    record::Chunks::new()
                } else {
                    self.with_allocator(|alloc| record::allocate(alloc, data.len()))?
                };
                record::write(&self.io, recid, &chunks, data)?
            }
        };
        self.write_slot(recid, entry)
    }

    fn replace(&self, recid: u64, old: SlotState, new: Option<&[u8]>) -> Result<()> {
        if let (SlotState::Plain { size, offset }, Some(data)) = (old, new) {
            let fits = size > 0
                && !data.is_empty()
                && data.len() <= MAX_RECORD_SIZE
                && allocation_size(size as usize) == allocation_size(data.len());
            if fits {
                self.io.put_data(offset, recid, data)?;
                return self.write_slot(recid, IndexEntry::stored(data.len() as u16, offset, false));
            }
        }

        let old_chunks = record::chunks(&self.io, old)?;
        self.store_value(recid, new)?;
        if !old_chunks.is_empty() {
            self.with_allocator(|alloc| record::release(alloc, &old_chunks))?;
        }
        Ok(())
    }

    pub fn get(&self, recid: u64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let _segment = self.segments.read(recid);
        record::read(&self.io, recid, self.read_slot(recid)?)
    }

    /// Takes a recid and marks its slot absent in the same structural
    /// section, so a whole-store pass never sees a taken recid that is
    /// still listed as free or void.
    fn allocate_recid(&self) -> Result<u64> {
        self.with_allocator(|alloc| {
            let recid = alloc.alloc_recid()?;
            alloc
                .io
                .put_long(alloc.index.recid_to_offset(recid)?, IndexEntry::absent().pack())?;
            Ok(recid)
        })
    }

    pub fn put(&self, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let recid = self.allocate_recid()?;
        let _segment = self.segments.write(recid);
        self.store_value(recid, Some(data))?;
        Ok(recid)
    }

    pub fn preallocate(&self) -> Result<u64> {
        self.check_writable()?;
        self.allocate_recid()
    }

    pub fn update(&self, recid: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let _segment = self.segments.write(recid);
        let old = self.live_slot(recid)?;
        self.replace(recid, old, Some(data))
    }

    pub fn delete(&self, recid: u64) -> Result<()> {
        self.check_writable()?;
        let _segment = self.segments.write(recid);
        let old = self.live_slot(recid)?;
        let chunks = record::chunks(&self.io, old)?;

        self.write_slot(recid, IndexEntry::deleted())?;
        self.with_allocator(|alloc| {
            record::release(alloc, &chunks)?;
            alloc.release_recid(recid)
        })
    }

    pub fn compare_and_swap_by<F>(
        &self,
        recid: u64,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        eq: F,
    ) -> Result<bool>
    where
        F: Fn(Option<&[u8]>, Option<&[u8]>) -> bool,
    {
        self.check_writable()?;
        let _segment = self.segments.write(recid);
        let old = self.live_slot(recid)?;
        let current = record::read(&self.io, recid, old)?;
        if !eq(current.as_deref(), expected) {
            return Ok(false);
        }
        self.replace(recid, old, new)?;
        Ok(true)
    }

    pub fn recids(&self) -> Result<RecidIter<'_, IO>> {
        self.check_open()?;
        Ok(RecidIter {
            core: self,
            next: 1,
            end: self.max_recid(),
            failed: false,
        })
    }

    pub fn calculate_free_size(&self) -> Result<u64> {
        let _state = self.structural.lock();
        calculate_free_size(&self.io)
    }

    pub fn tracked_free_size(&self) -> u64 {
        self.structural.lock().free_size
    }

    pub fn long_stack_values(&self, bucket: Bucket) -> Result<Vec<u64>> {
        let _state = self.structural.lock();
        long_stack::values(&self.io, bucket)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.structural.lock();
        let locks = self.segments.stats();
        StoreStats {
            file_tail: state.file_tail,
            data_tail: state.data_tail,
            max_recid: state.max_recid,
            free_size: state.free_size,
            index_pages: self.index.page_count(),
            segments: self.segments.len(),
            segment_locks_acquired: locks.acquired.load(Ordering::Relaxed),
            segment_locks_contended: locks.contended.load(Ordering::Relaxed),
        }
    }
}

/// Lazily yields every recid whose slot is live (stored or preallocated).
/// The upper bound is fixed when iteration starts.
pub(crate) struct RecidIter<'a, IO: StoreIo> {
    core: &'a StoreCore<IO>,
    next: u64,
    end: u64,
    failed: bool,
}

impl<IO: StoreIo> Iterator for RecidIter<'_, IO> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.next <= self.end {
            let recid = self.next;
            self.next += 1;
            let _segment = self.core.segments.read(recid);
            match self.core.read_slot(recid) {
                Ok(state) if state.is_live() => return Some(Ok(recid)),
                Ok(_) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
