//! # Store Layout Constants
//!
//! This module centralizes the numeric constants that define the on-volume
//! layout. Several of them are derived from each other; the derivations are
//! spelled out here and enforced with compile-time assertions so that a change
//! to one value cannot silently desynchronize the rest.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (1 MiB)
//!       │
//!       ├─> HEAD_END (header + master links, page 0 only)
//!       │     └─> ZERO_PAGE_RECIDS (index slots left in page 0)
//!       │
//!       └─> INDEX_PAGE_RECIDS (slots in every further index page)
//!
//! ALIGNMENT (16 bytes)
//!       │
//!       └─> MAX_RECORD_SIZE (largest 16-aligned size below the sentinels)
//!             └─> SIZE_CLASS_COUNT (one long-stack bucket per 16-byte class)
//!
//! LONG_STACK_PAGE_SIZE (256 bytes)
//!       └─> LONG_STACK_PAGE_CAPACITY (value slots after the 8-byte link)
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Every allocation size in `16..=MAX_RECORD_SIZE` maps to exactly one
//!    size class, and anything larger maps to the catch-all bucket.
//! 2. A single chunk always fits in one data page.
//! 3. The header and its master links end on a 16-byte boundary, so the zero
//!    index page starts aligned.

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

/// Size of a volume page in bytes. Index pages and data pages are whole pages.
pub const PAGE_SIZE: u64 = 1 << 20;

/// Alignment of every data allocation and of the data tail.
pub const ALIGNMENT: u64 = 16;

/// Bytes reserved at the start of every index page (next-page link + spare word).
pub const INDEX_PAGE_HEADER_SIZE: u64 = 16;

// ============================================================================
// RECORD SIZING
// ============================================================================

/// Largest payload stored in a single allocation. Larger payloads become
/// linked records.
pub const MAX_RECORD_SIZE: usize = 0xFFF0;

/// Size-field sentinel for a slot holding the absent value (preallocated).
pub const NULL_RECORD_SIZE: u16 = 0xFFFF;

/// Size-field sentinel for a deleted slot.
pub const DELETED_RECORD_SIZE: u16 = 0xFFFE;

/// Bytes at the start of every non-terminal chunk holding the link to the next.
pub const CHUNK_LINK_SIZE: usize = 8;

/// Payload bytes carried by a non-terminal chunk of a linked record.
pub const LINKED_CHUNK_PAYLOAD: usize = MAX_RECORD_SIZE - CHUNK_LINK_SIZE;

/// Number of exact 16-byte size classes (16, 32, .., MAX_RECORD_SIZE).
pub const SIZE_CLASS_COUNT: usize = MAX_RECORD_SIZE / ALIGNMENT as usize;

const _: () = assert!(
    MAX_RECORD_SIZE % ALIGNMENT as usize == 0,
    "MAX_RECORD_SIZE must be 16-byte aligned"
);

const _: () = assert!(
    MAX_RECORD_SIZE < DELETED_RECORD_SIZE as usize,
    "record sizes must not collide with the size sentinels"
);

const _: () = assert!(
    (MAX_RECORD_SIZE as u64) < PAGE_SIZE,
    "a chunk must fit into one data page"
);

// ============================================================================
// HEADER LAYOUT
// Byte offsets inside page 0. Control words are 8 bytes wide.
// ============================================================================

pub const HEAD_MAGIC: u64 = 0;
pub const HEAD_STORE_TYPE: u64 = 1;
pub const HEAD_FEATURES: u64 = 4;
pub const HEAD_VOLUME_CHECKSUM: u64 = 8;
pub const HEAD_STORE_FEATURES: u64 = 16;
pub const HEAD_CHECKSUM: u64 = 20;

/// First word covered by the header checksum.
pub const HEAD_CONTROL_START: u64 = 24;
pub const HEAD_DATA_TAIL: u64 = 24;
pub const HEAD_MAX_RECID: u64 = 32;
pub const HEAD_FILE_TAIL: u64 = 40;
pub const HEAD_FIRST_INDEX_PAGE: u64 = 48;

/// Master link of the free-recid bucket.
pub const RECID_LONG_STACK: u64 = 64;

/// Master link of the catch-all bucket for free ranges above the largest class.
pub const OVERSIZE_LONG_STACK: u64 = 72;

/// Master link of the first size class (16 bytes). Class `n` lives at
/// `SIZE_LONG_STACK_START + n * 8`.
pub const SIZE_LONG_STACK_START: u64 = 80;

/// End of the header. One reserved word follows the last size-class link.
pub const HEAD_END: u64 = SIZE_LONG_STACK_START + SIZE_CLASS_COUNT as u64 * 8 + 8;

const _: () = assert!(HEAD_END % ALIGNMENT == 0, "HEAD_END must be 16-byte aligned");

/// Index slots available in the zero index page (rest of page 0).
pub const ZERO_PAGE_RECIDS: u64 = (PAGE_SIZE - HEAD_END - INDEX_PAGE_HEADER_SIZE) / 8;

/// Index slots in every index page after the zero page.
pub const INDEX_PAGE_RECIDS: u64 = (PAGE_SIZE - INDEX_PAGE_HEADER_SIZE) / 8;

// ============================================================================
// LONG STACK
// ============================================================================

/// Size of one persisted long-stack page.
pub const LONG_STACK_PAGE_SIZE: u64 = 256;

/// Value slots per long-stack page (after the 8-byte predecessor link).
pub const LONG_STACK_PAGE_CAPACITY: u64 = (LONG_STACK_PAGE_SIZE - 8) / 8;

const _: () = assert!(
    LONG_STACK_PAGE_SIZE % ALIGNMENT == 0,
    "long-stack pages are ordinary 16-byte aligned allocations"
);

// ============================================================================
// CONCURRENCY
// ============================================================================

/// Default number of per-segment record locks.
pub const DEFAULT_SEGMENT_COUNT: usize = 16;

/// Upper bound for the configurable segment count.
pub const MAX_SEGMENT_COUNT: usize = 1024;

// ============================================================================
// WRITE-AHEAD LOG
// ============================================================================

/// Size of the WAL file header (magic, version, generation).
pub const WAL_HEADER_SIZE: u64 = 16;

/// Default size of the in-memory WAL append buffer before it is written out.
pub const DEFAULT_WAL_BUFFER_SIZE: usize = 1024 * 1024;
