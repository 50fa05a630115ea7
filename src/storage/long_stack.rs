//! # Long Stacks
//!
//! A long stack is a LIFO list of 64-bit values persisted inside the volume
//! it manages. There is one stack per bucket: the free-recid bucket, the
//! catch-all bucket for free ranges larger than the biggest size class, and
//! one bucket per 16-byte size class.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -----------------------------------------------
//! 0       8     predecessor page (parity-4 link, 0 = bottom page)
//! 8       8*31  value slots, parity-1 over (value << 1)
//! ```
//!
//! ## Master Link
//!
//! The header holds one master link per bucket: the top page and how many
//! slots of it are used.
//!
//! ```text
//!  63          48 47                               4 3        0
//! +--------------+----------------------------------+----------+
//! |    count     |          top page offset         | parity-4 |
//! +--------------+----------------------------------+----------+
//! ```
//!
//! A raw zero master link is an empty stack. Every page below the top page
//! is full, so the total count is `count + 31 * (pages - 1)`.
//!
//! ## Recycling
//!
//! Stack pages are taken from the data tail only, never from a bucket, so
//! pushing onto one bucket can never pop another. A page emptied by a take
//! is handed to the allocator's pending list and becomes free space once the
//! current structural operation finishes.

use eyre::Result;

use super::allocator::Allocator;
use super::io::StoreIo;
use super::parity::{parity1_get, parity1_set, parity4_get, parity4_set};
use crate::config::{
    ALIGNMENT, LONG_STACK_PAGE_CAPACITY, LONG_STACK_PAGE_SIZE, MAX_RECORD_SIZE,
    OVERSIZE_LONG_STACK, RECID_LONG_STACK, SIZE_CLASS_COUNT, SIZE_LONG_STACK_START,
};
use crate::error::StoreError;

const COUNT_SHIFT: u32 = 48;
const PAGE_MASK: u64 = 0x0000_FFFF_FFFF_FFF0;

const FREE_RANGE_SIZE_SHIFT: u32 = 44;
const FREE_RANGE_OFFSET_MASK: u64 = (1 << FREE_RANGE_SIZE_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Deleted recids awaiting reuse.
    Recid,
    /// Free ranges larger than the largest size class.
    Oversize,
    /// Free allocations of exactly `(class + 1) * 16` bytes.
    Size(u16),
}

impl Bucket {
    /// Bucket for a free range of `size` bytes. `size` must be 16-aligned.
    pub fn for_size(size: u64) -> Self {
        debug_assert!(size > 0 && size % ALIGNMENT == 0);
        if size <= MAX_RECORD_SIZE as u64 {
            Bucket::Size((size / ALIGNMENT - 1) as u16)
        } else {
            Bucket::Oversize
        }
    }

    pub fn class_size(self) -> Option<u64> {
        match self {
            Bucket::Size(class) => Some((class as u64 + 1) * ALIGNMENT),
            _ => None,
        }
    }

    pub fn master_offset(self) -> u64 {
        match self {
            Bucket::Recid => RECID_LONG_STACK,
            Bucket::Oversize => OVERSIZE_LONG_STACK,
            Bucket::Size(class) => SIZE_LONG_STACK_START + class as u64 * 8,
        }
    }

    /// Buckets holding free space (all but the recid bucket).
    pub fn space() -> impl Iterator<Item = Bucket> {
        std::iter::once(Bucket::Oversize)
            .chain((0..SIZE_CLASS_COUNT as u16).map(Bucket::Size))
    }

    pub fn all() -> impl Iterator<Item = Bucket> {
        std::iter::once(Bucket::Recid).chain(Self::space())
    }
}

/// Catch-all values carry their size: `offset | (size / 16) << 44`.
pub(crate) fn encode_free_range(offset: u64, size: u64) -> u64 {
    debug_assert_eq!(offset & !FREE_RANGE_OFFSET_MASK, 0);
    offset | (size / ALIGNMENT) << FREE_RANGE_SIZE_SHIFT
}

pub(crate) fn decode_free_range(value: u64) -> (u64, u64) {
    (
        value & FREE_RANGE_OFFSET_MASK,
        (value >> FREE_RANGE_SIZE_SHIFT) * ALIGNMENT,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Master {
    count: u64,
    page: u64,
}

impl Master {
    const EMPTY: Master = Master { count: 0, page: 0 };

    fn decode(word: u64) -> Result<Self> {
        if word == 0 {
            return Ok(Self::EMPTY);
        }
        let value = parity4_get(word)?;
        let master = Master {
            count: value >> COUNT_SHIFT,
            page: value & PAGE_MASK,
        };
        if master.page == 0 || master.count == 0 || master.count > LONG_STACK_PAGE_CAPACITY {
            return Err(StoreError::corruption(format!(
                "malformed long-stack master link {word:#018x}"
            ))
            .into());
        }
        Ok(master)
    }

    fn encode(self) -> u64 {
        if self.page == 0 {
            return 0;
        }
        parity4_set(self.count << COUNT_SHIFT | self.page)
    }
}

fn decode_link(word: u64) -> Result<u64> {
    if word == 0 {
        Ok(0)
    } else {
        parity4_get(word)
    }
}

fn encode_link(page: u64) -> u64 {
    if page == 0 {
        0
    } else {
        parity4_set(page)
    }
}

fn decode_value(word: u64) -> Result<u64> {
    Ok(parity1_get(word)? >> 1)
}

fn slot_offset(page: u64, index: u64) -> u64 {
    page + 8 + index * 8
}

fn read_master<IO: StoreIo + ?Sized>(io: &IO, bucket: Bucket) -> Result<Master> {
    Master::decode(io.get_long(bucket.master_offset())?)
}

/// Visits every page of `bucket` from top to bottom together with the number
/// of used slots in it.
fn walk_pages<IO, F>(io: &IO, bucket: Bucket, mut f: F) -> Result<()>
where
    IO: StoreIo + ?Sized,
    F: FnMut(u64, u64) -> Result<()>,
{
    let master = read_master(io, bucket)?;
    let limit = io.length() / LONG_STACK_PAGE_SIZE + 1;

    let (mut page, mut count) = (master.page, master.count);
    let mut visited = 0u64;
    while page != 0 {
        visited += 1;
        if visited > limit {
            return Err(StoreError::corruption(format!("long stack {bucket:?} has a cycle")).into());
        }
        f(page, count)?;
        page = decode_link(io.get_long(page)?)?;
        count = LONG_STACK_PAGE_CAPACITY;
    }
    Ok(())
}

/// Visits the values of `bucket` in pop order without consuming them.
pub(crate) fn for_each<IO, F>(io: &IO, bucket: Bucket, mut f: F) -> Result<()>
where
    IO: StoreIo + ?Sized,
    F: FnMut(u64) -> Result<()>,
{
    walk_pages(io, bucket, |page, count| {
        for index in (0..count).rev() {
            f(decode_value(io.get_long(slot_offset(page, index))?)?)?;
        }
        Ok(())
    })
}

pub(crate) fn values<IO: StoreIo + ?Sized>(io: &IO, bucket: Bucket) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    for_each(io, bucket, |value| {
        out.push(value);
        Ok(())
    })?;
    Ok(out)
}

/// Number of values in `bucket`, counted from the page chain alone.
pub(crate) fn len<IO: StoreIo + ?Sized>(io: &IO, bucket: Bucket) -> Result<u64> {
    let mut total = 0;
    walk_pages(io, bucket, |_, count| {
        total += count;
        Ok(())
    })?;
    Ok(total)
}

/// Offsets of the pages backing `bucket`, top first.
pub(crate) fn pages<IO: StoreIo + ?Sized>(io: &IO, bucket: Bucket) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    walk_pages(io, bucket, |page, _| {
        out.push(page);
        Ok(())
    })?;
    Ok(out)
}

pub(crate) fn peek<IO: StoreIo + ?Sized>(io: &IO, bucket: Bucket) -> Result<Option<u64>> {
    let master = read_master(io, bucket)?;
    if master.page == 0 {
        return Ok(None);
    }
    let word = io.get_long(slot_offset(master.page, master.count - 1))?;
    decode_value(word).map(Some)
}

impl<IO: StoreIo + ?Sized> Allocator<'_, IO> {
    pub fn long_stack_put(&mut self, bucket: Bucket, value: u64) -> Result<()> {
        debug_assert!(value < 1 << 63);
        let master = read_master(self.io, bucket)?;

        let master = if master.page == 0 || master.count == LONG_STACK_PAGE_CAPACITY {
            let page = self.bump(LONG_STACK_PAGE_SIZE)?;
            self.io.put_long(page, encode_link(master.page))?;
            self.io.put_long(slot_offset(page, 0), parity1_set(value << 1))?;
            Master { count: 1, page }
        } else {
            self.io
                .put_long(slot_offset(master.page, master.count), parity1_set(value << 1))?;
            Master {
                count: master.count + 1,
                page: master.page,
            }
        };

        self.io.put_long(bucket.master_offset(), master.encode())
    }

    pub fn long_stack_take(&mut self, bucket: Bucket) -> Result<Option<u64>> {
        let master = read_master(self.io, bucket)?;
        if master.page == 0 {
            return Ok(None);
        }

        let slot = slot_offset(master.page, master.count - 1);
        let value = decode_value(self.io.get_long(slot)?)?;
        self.io.put_long(slot, 0)?;

        let next = if master.count == 1 {
            let prev = decode_link(self.io.get_long(master.page)?)?;
            self.defer_release(master.page, LONG_STACK_PAGE_SIZE);
            if prev == 0 {
                Master::EMPTY
            } else {
                Master {
                    count: LONG_STACK_PAGE_CAPACITY,
                    page: prev,
                }
            }
        } else {
            Master {
                count: master.count - 1,
                page: master.page,
            }
        };

        self.io.put_long(bucket.master_offset(), next.encode())?;
        Ok(Some(value))
    }
}
