//! # Index Table
//!
//! One 8-byte slot per recid maps the recid to its payload. Slots live in
//! the zero index page (the rest of page 0 after the header) and in further
//! index pages chained through the first word of each page's 16-byte header.
//!
//! ## Slot Encoding
//!
//! ```text
//!  63            48 47                                  4   3   2   1   0
//! +----------------+-------------------------------------+---+---+---+---+
//! |      size      |               offset                | L | A | - | P |
//! +----------------+-------------------------------------+---+---+---+---+
//!   L = linked   A = archive (live entry)   P = odd parity over the word
//! ```
//!
//! | Raw word / size        | Meaning                                   |
//! |------------------------|-------------------------------------------|
//! | `0`                    | never written (void)                      |
//! | size `0xFFFE`          | deleted (void)                            |
//! | size `0xFFFF`          | preallocated, holds the absent value      |
//! | other, L clear         | payload of `size` bytes at `offset`       |
//! | other, L set           | first chunk of a linked record            |
//!
//! The empty payload is stored as size 0 at offset 0.
//!
//! The archive flag marks an entry reachable: it is set on every stored and
//! preallocated slot and on chunk links, clear on deleted slots. Decoding
//! rejects a slot whose flag disagrees with its size, and compaction copies
//! exactly the slots carrying it.
//!
//! ## Recid to Offset
//!
//! Recids are 1-based. With `r = recid - 1`:
//!
//! ```text
//! r <  ZERO_PAGE_RECIDS   ->  HEAD_END + 16 + r * 8
//! r >= ZERO_PAGE_RECIDS   ->  pages[1 + q] + 16 + m * 8
//!                             where (q, m) = divmod(r - ZERO_PAGE_RECIDS, INDEX_PAGE_RECIDS)
//! ```
//!
//! The page list is loaded once at open by walking the chain and appended to
//! whenever the allocator grows the table, so the lookup never touches the
//! volume.

use eyre::Result;
use parking_lot::RwLock;

use super::io::StoreIo;
use super::parity::{parity1_get, parity1_set, parity4_get};
use crate::config::{
    DELETED_RECORD_SIZE, HEAD_END, HEAD_FIRST_INDEX_PAGE, INDEX_PAGE_HEADER_SIZE,
    INDEX_PAGE_RECIDS, NULL_RECORD_SIZE, PAGE_SIZE, ZERO_PAGE_RECIDS,
};
use crate::error::StoreError;

pub(crate) const OFFSET_MASK: u64 = 0x0000_FFFF_FFFF_FFF0;
const LINKED_BIT: u64 = 1 << 3;
const ARCHIVE_BIT: u64 = 1 << 2;
const SIZE_SHIFT: u32 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    size: u16,
    offset: u64,
    linked: bool,
    archive: bool,
}

impl IndexEntry {
    pub fn stored(size: u16, offset: u64, linked: bool) -> Self {
        debug_assert!(size < DELETED_RECORD_SIZE);
        debug_assert_eq!(offset & !OFFSET_MASK, 0);
        Self {
            size,
            offset,
            linked,
            archive: true,
        }
    }

    pub fn absent() -> Self {
        Self {
            size: NULL_RECORD_SIZE,
            offset: 0,
            linked: false,
            archive: true,
        }
    }

    pub fn deleted() -> Self {
        Self {
            size: DELETED_RECORD_SIZE,
            offset: 0,
            linked: false,
            archive: false,
        }
    }

    pub fn pack(self) -> u64 {
        let mut word = (self.size as u64) << SIZE_SHIFT | self.offset;
        if self.linked {
            word |= LINKED_BIT;
        }
        if self.archive {
            word |= ARCHIVE_BIT;
        }
        parity1_set(word)
    }

    pub fn unpack(word: u64) -> Result<Self> {
        let word = parity1_get(word)?;
        Ok(Self {
            size: (word >> SIZE_SHIFT) as u16,
            offset: word & OFFSET_MASK,
            linked: word & LINKED_BIT != 0,
            archive: word & ARCHIVE_BIT != 0,
        })
    }

    pub fn size(self) -> u16 {
        self.size
    }

    pub fn offset(self) -> u64 {
        self.offset
    }

    pub fn linked(self) -> bool {
        self.linked
    }

    pub fn archive(self) -> bool {
        self.archive
    }
}

/// Decoded meaning of one index slot. Void is a value here, not an error:
/// only the public boundary turns it into `StoreError::VoidAccess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Void,
    Absent,
    Plain { size: u16, offset: u64 },
    Linked { size: u16, offset: u64 },
}

impl SlotState {
    pub fn decode(word: u64) -> Result<Self> {
        if word == 0 {
            return Ok(SlotState::Void);
        }
        let entry = IndexEntry::unpack(word)?;
        if entry.archive() != (entry.size() != DELETED_RECORD_SIZE) {
            return Err(StoreError::corruption(format!(
                "index slot {word:#018x} has archive flag {} for size {:#06x}",
                entry.archive(),
                entry.size()
            ))
            .into());
        }
        Ok(match entry.size() {
            DELETED_RECORD_SIZE => SlotState::Void,
            NULL_RECORD_SIZE => SlotState::Absent,
            size if entry.linked() => SlotState::Linked {
                size,
                offset: entry.offset(),
            },
            size => SlotState::Plain {
                size,
                offset: entry.offset(),
            },
        })
    }

    pub fn is_live(self) -> bool {
        !matches!(self, SlotState::Void)
    }
}

#[derive(Debug)]
pub(crate) struct IndexTable {
    pages: RwLock<Vec<u64>>,
}

impl IndexTable {
    /// Table holding only the zero index page.
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(vec![HEAD_END]),
        }
    }

    /// Walks the page chain starting at the header's first-index-page link.
    pub fn load<IO: StoreIo + ?Sized>(io: &IO, file_tail: u64) -> Result<Self> {
        let first = parity4_get(io.get_long(HEAD_FIRST_INDEX_PAGE)?)?;
        if first != HEAD_END {
            return Err(StoreError::corruption(format!(
                "first index page at {first}, expected {HEAD_END}"
            ))
            .into());
        }

        let mut pages = vec![HEAD_END];
        let mut link = io.get_long(HEAD_END)?;
        while link != 0 {
            let page = parity4_get(link)?;
            if page == 0 || page % PAGE_SIZE != 0 || page >= file_tail {
                return Err(StoreError::corruption(format!(
                    "index page link {page} is not a page inside the file (tail {file_tail})"
                ))
                .into());
            }
            if pages.len() as u64 > file_tail / PAGE_SIZE {
                return Err(StoreError::corruption("index page chain has a cycle").into());
            }
            pages.push(page);
            link = io.get_long(page)?;
        }

        Ok(Self {
            pages: RwLock::new(pages),
        })
    }

    pub fn reset_from(&self, other: IndexTable) {
        *self.pages.write() = other.pages.into_inner();
    }

    /// Number of recids addressable without growing the table.
    pub fn capacity(&self) -> u64 {
        let extra = self.pages.read().len() as u64 - 1;
        ZERO_PAGE_RECIDS + extra * INDEX_PAGE_RECIDS
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    pub fn pages(&self) -> Vec<u64> {
        self.pages.read().clone()
    }

    pub fn last_page(&self) -> u64 {
        let pages = self.pages.read();
        pages[pages.len() - 1]
    }

    pub fn push_page(&self, page: u64) {
        self.pages.write().push(page);
    }

    /// Absolute offset of the 8-byte slot for `recid`.
    pub fn recid_to_offset(&self, recid: u64) -> Result<u64> {
        eyre::ensure!(recid > 0, "recid 0 is reserved");
        let r = recid - 1;
        if r < ZERO_PAGE_RECIDS {
            return Ok(HEAD_END + INDEX_PAGE_HEADER_SIZE + r * 8);
        }

        let r = r - ZERO_PAGE_RECIDS;
        let (page_no, slot) = (1 + r / INDEX_PAGE_RECIDS, r % INDEX_PAGE_RECIDS);
        let pages = self.pages.read();
        let page = pages.get(page_no as usize).copied().ok_or_else(|| {
            eyre::eyre!(
                "recid {} is beyond the index table ({} pages)",
                recid,
                pages.len()
            )
        })?;
        Ok(page + INDEX_PAGE_HEADER_SIZE + slot * 8)
    }
}
