//! # Space and Recid Allocation
//!
//! `AllocState` is the allocator-global state guarded by the structural
//! lock: the tails, the highest recid, the tracked free size and the list of
//! deferred releases. An [`Allocator`] borrows that state together with the
//! volume and the index table for the duration of one structural operation.
//!
//! ## Data Allocation
//!
//! ```text
//! alloc_data(size):
//!   1. pop the exact size-class bucket
//!   2. else take the top catch-all range if it is big enough, splitting off
//!      the tail as new free space
//!   3. else bump the data tail, starting a new page when the current one
//!      cannot hold `size` (the old page's remainder becomes free space)
//! ```
//!
//! ## Deferred Releases
//!
//! Growing a long stack needs a fresh stack page, and releasing space pushes
//! onto a long stack. Stack pages therefore come from the data tail only, and
//! releases discovered while the allocator is itself manipulating a stack
//! (page remainders, emptied stack pages) are queued in `pending`. `finish`
//! drains the queue at the end of every structural operation, so the
//! accounting is exact whenever the structural lock is released.
//!
//! ## Free-Size Accounting
//!
//! `free_size` is maintained incrementally. [`calculate_free_size`] walks
//! every bucket and must agree with it at every quiescent point.

use eyre::Result;
use tracing::{debug, trace};

use super::index::IndexTable;
use super::io::StoreIo;
use super::long_stack::{self, decode_free_range, encode_free_range, Bucket};
use super::parity::parity4_set;
use crate::config::{
    ALIGNMENT, HEAD_DATA_TAIL, HEAD_FILE_TAIL, HEAD_MAX_RECID, MAX_RECORD_SIZE, PAGE_SIZE,
};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AllocState {
    pub data_tail: u64,
    pub file_tail: u64,
    pub max_recid: u64,
    pub free_size: u64,
    pending: Vec<(u64, u64)>,
}

impl AllocState {
    pub fn load<IO: StoreIo + ?Sized>(io: &IO) -> Result<Self> {
        let data_tail = io.get_long(HEAD_DATA_TAIL)?;
        let max_recid = io.get_long(HEAD_MAX_RECID)?;
        let file_tail = io.get_long(HEAD_FILE_TAIL)?;

        if file_tail < PAGE_SIZE || file_tail % PAGE_SIZE != 0 {
            return Err(StoreError::corruption(format!("file tail {file_tail} is not a page boundary")).into());
        }
        if data_tail > file_tail || data_tail % ALIGNMENT != 0 {
            return Err(StoreError::corruption(format!(
                "data tail {data_tail} is misaligned or past file tail {file_tail}"
            ))
            .into());
        }
        if file_tail > io.length() {
            return Err(StoreError::corruption(format!(
                "file tail {} is past the volume end {}",
                file_tail,
                io.length()
            ))
            .into());
        }

        Ok(Self {
            data_tail,
            file_tail,
            max_recid,
            free_size: calculate_free_size(io)?,
            pending: Vec::new(),
        })
    }
}

/// Total bytes held by the space buckets, computed from the volume.
pub(crate) fn calculate_free_size<IO: StoreIo + ?Sized>(io: &IO) -> Result<u64> {
    let mut total = 0;
    for bucket in Bucket::space() {
        match bucket.class_size() {
            Some(size) => total += long_stack::len(io, bucket)? * size,
            None => long_stack::for_each(io, bucket, |value| {
                total += decode_free_range(value).1;
                Ok(())
            })?,
        }
    }
    Ok(total)
}

/// Rounds a payload length up to its allocation size.
pub(crate) fn allocation_size(len: usize) -> u64 {
    (len as u64).div_ceil(ALIGNMENT) * ALIGNMENT
}

pub(crate) struct Allocator<'a, IO: StoreIo + ?Sized> {
    pub(super) io: &'a IO,
    pub(super) state: &'a mut AllocState,
    pub(super) index: &'a IndexTable,
}

impl<'a, IO: StoreIo + ?Sized> Allocator<'a, IO> {
    pub fn new(io: &'a IO, state: &'a mut AllocState, index: &'a IndexTable) -> Self {
        Self { io, state, index }
    }

    pub(super) fn defer_release(&mut self, offset: u64, size: u64) {
        self.state.pending.push((offset, size));
    }

    /// Drains deferred releases. Must run before the structural lock is
    /// released.
    pub fn finish(&mut self) -> Result<()> {
        while let Some((offset, size)) = self.state.pending.pop() {
            self.release_data(offset, size)?;
        }
        Ok(())
    }

    fn new_page(&mut self) -> Result<u64> {
        let page = self.state.file_tail;
        let file_tail = page + PAGE_SIZE;
        self.io.ensure_available(file_tail)?;
        self.io.put_long(HEAD_FILE_TAIL, file_tail)?;
        self.state.file_tail = file_tail;
        Ok(page)
    }

    /// Carves `size` bytes from the data tail. Touches no bucket.
    pub fn bump(&mut self, size: u64) -> Result<u64> {
        debug_assert!(size > 0 && size % ALIGNMENT == 0 && size <= PAGE_SIZE);
        let tail = self.state.data_tail;
        let in_page = tail % PAGE_SIZE;

        if tail == 0 || in_page == 0 || in_page + size > PAGE_SIZE {
            if tail != 0 && in_page != 0 {
                let remainder = PAGE_SIZE - in_page;
                trace!(offset = tail, size = remainder, "releasing data page remainder");
                self.defer_release(tail, remainder);
            }
            self.state.data_tail = self.new_page()?;
        }

        let offset = self.state.data_tail;
        self.state.data_tail = offset + size;
        self.io.put_long(HEAD_DATA_TAIL, self.state.data_tail)?;
        Ok(offset)
    }

    /// Appends one page to the index table.
    pub fn allocate_index_page(&mut self) -> Result<u64> {
        let page = self.new_page()?;
        self.io.put_long(page, 0)?;
        self.io.put_long(page + 8, 0)?;
        self.io.put_long(self.index.last_page(), parity4_set(page))?;
        self.index.push_page(page);
        debug!(page, pages = self.index.page_count(), "allocated index page");
        Ok(page)
    }

    /// Raises the recid high-water mark, growing the index table to cover it.
    pub fn set_max_recid(&mut self, max_recid: u64) -> Result<()> {
        while self.index.capacity() < max_recid {
            self.allocate_index_page()?;
        }
        self.io.put_long(HEAD_MAX_RECID, max_recid)?;
        self.state.max_recid = max_recid;
        Ok(())
    }

    pub fn alloc_recid(&mut self) -> Result<u64> {
        if let Some(recid) = self.long_stack_take(Bucket::Recid)? {
            if recid == 0 || recid > self.state.max_recid {
                return Err(StoreError::corruption(format!(
                    "free recid {} outside 1..={}",
                    recid, self.state.max_recid
                ))
                .into());
            }
            return Ok(recid);
        }
        let recid = self.state.max_recid + 1;
        self.set_max_recid(recid)?;
        Ok(recid)
    }

    pub fn release_recid(&mut self, recid: u64) -> Result<()> {
        self.long_stack_put(Bucket::Recid, recid)
    }

    /// Allocates `size` bytes; `size` is 16-aligned and at most one chunk.
    pub fn alloc_data(&mut self, size: u64) -> Result<u64> {
        debug_assert!(size > 0 && size % ALIGNMENT == 0 && size <= MAX_RECORD_SIZE as u64);

        if let Some(offset) = self.long_stack_take(Bucket::for_size(size))? {
            self.state.free_size -= size;
            return Ok(offset);
        }

        if let Some(top) = long_stack::peek(self.io, Bucket::Oversize)? {
            let (offset, len) = decode_free_range(top);
            if len >= size {
                self.long_stack_take(Bucket::Oversize)?;
                self.state.free_size -= len;
                if len > size {
                    self.release_data(offset + size, len - size)?;
                }
                return Ok(offset);
            }
        }

        self.bump(size)
    }

    pub fn release_data(&mut self, offset: u64, size: u64) -> Result<()> {
        debug_assert!(size > 0 && size % ALIGNMENT == 0);
        match Bucket::for_size(size) {
            Bucket::Oversize => {
                self.long_stack_put(Bucket::Oversize, encode_free_range(offset, size))?
            }
            bucket => self.long_stack_put(bucket, offset)?,
        }
        self.state.free_size += size;
        Ok(())
    }
}
