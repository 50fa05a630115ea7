//! # Record Payload Layout
//!
//! A payload of up to `MAX_RECORD_SIZE` bytes occupies one allocation. Larger
//! payloads become linked records: a chain of chunks, each one allocation.
//!
//! ```text
//! index slot ──> chunk 0                chunk 1                chunk n (terminal)
//!               +------+-----------+   +------+-----------+   +----------------+
//!               | link | 65512 B   |──>| link | 65512 B   |──>| <= 65520 B     |
//!               +------+-----------+   +------+-----------+   +----------------+
//! ```
//!
//! The link is an index-entry word for the next chunk. Its linked flag is
//! set when the next chunk carries a link of its own; the terminal chunk has
//! none. The recid's slot carries the linked flag whenever the record spans
//! more than one chunk.
//!
//! Allocation happens under the structural lock (`allocate`), byte copying
//! outside it (`write`).

use eyre::Result;
use smallvec::SmallVec;

use super::allocator::{allocation_size, Allocator};
use super::index::{IndexEntry, SlotState};
use super::io::StoreIo;
use crate::config::{CHUNK_LINK_SIZE, LINKED_CHUNK_PAYLOAD, MAX_RECORD_SIZE};
use crate::error::StoreError;

/// One allocation of a payload: `offset` and the stored byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub offset: u64,
    pub len: usize,
}

impl Chunk {
    pub fn allocation(self) -> u64 {
        allocation_size(self.len)
    }
}

pub(crate) type Chunks = SmallVec<[Chunk; 4]>;

/// Stored byte counts of the chunks a payload of `len` bytes is split into.
pub(crate) fn chunk_lengths(len: usize) -> SmallVec<[usize; 4]> {
    let mut lengths = SmallVec::new();
    if len == 0 {
        return lengths;
    }
    let mut remaining = len;
    while remaining > MAX_RECORD_SIZE {
        lengths.push(MAX_RECORD_SIZE);
        remaining -= LINKED_CHUNK_PAYLOAD;
    }
    lengths.push(remaining);
    lengths
}

pub(crate) fn allocate<IO: StoreIo + ?Sized>(
    alloc: &mut Allocator<'_, IO>,
    len: usize,
) -> Result<Chunks> {
    chunk_lengths(len)
        .into_iter()
        .map(|len| {
            Ok(Chunk {
                offset: alloc.alloc_data(allocation_size(len))?,
                len,
            })
        })
        .collect()
}

/// Copies `data` into the chunks from `allocate` and returns the slot entry.
pub(crate) fn write<IO: StoreIo + ?Sized>(
    io: &IO,
    recid: u64,
    chunks: &[Chunk],
    data: &[u8],
) -> Result<IndexEntry> {
    let Some(first) = chunks.first() else {
        return Ok(IndexEntry::stored(0, 0, false));
    };
    if chunks.len() == 1 {
        io.put_data(first.offset, recid, data)?;
        return Ok(IndexEntry::stored(first.len as u16, first.offset, false));
    }

    let mut buf = vec![0u8; MAX_RECORD_SIZE];
    let mut rest = data;
    for (i, chunk) in chunks.iter().enumerate() {
        match chunks.get(i + 1) {
            Some(next) => {
                let more = i + 2 < chunks.len();
                let link = IndexEntry::stored(next.len as u16, next.offset, more).pack();
                buf[..CHUNK_LINK_SIZE].copy_from_slice(&link.to_le_bytes());
                buf[CHUNK_LINK_SIZE..].copy_from_slice(&rest[..LINKED_CHUNK_PAYLOAD]);
                io.put_data(chunk.offset, recid, &buf)?;
                rest = &rest[LINKED_CHUNK_PAYLOAD..];
            }
            None => {
                debug_assert_eq!(rest.len(), chunk.len);
                io.put_data(chunk.offset, recid, rest)?;
            }
        }
    }
    Ok(IndexEntry::stored(first.len as u16, first.offset, true))
}

/// Follows the chunk chain of a live slot. The empty payload has no chunks.
pub(crate) fn chunks<IO: StoreIo + ?Sized>(io: &IO, state: SlotState) -> Result<Chunks> {
    let mut out = Chunks::new();
    let (mut size, mut offset, mut linked) = match state {
        SlotState::Void | SlotState::Absent => return Ok(out),
        SlotState::Plain { size, offset } => (size, offset, false),
        SlotState::Linked { size, offset } => (size, offset, true),
    };
    if size == 0 {
        return Ok(out);
    }

    let limit = io.length() / LINKED_CHUNK_PAYLOAD as u64 + 1;
    loop {
        out.push(Chunk {
            offset,
            len: size as usize,
        });
        if !linked {
            return Ok(out);
        }
        if out.len() as u64 > limit {
            return Err(StoreError::corruption(format!("linked record at {offset} has a cycle")).into());
        }
        let link = IndexEntry::unpack(io.get_long(offset)?)?;
        if !link.archive() || link.size() == 0 || link.size() as usize > MAX_RECORD_SIZE {
            return Err(StoreError::corruption(format!(
                "chunk link at {} holds size {}",
                offset,
                link.size()
            ))
            .into());
        }
        size = link.size();
        offset = link.offset();
        linked = link.linked();
    }
}

/// Reads the value held by a slot. `Void` becomes `VoidAccess`.
pub(crate) fn read<IO: StoreIo + ?Sized>(
    io: &IO,
    recid: u64,
    state: SlotState,
) -> Result<Option<Vec<u8>>> {
    match state {
        SlotState::Void => Err(StoreError::VoidAccess { recid }.into()),
        SlotState::Absent => Ok(None),
        SlotState::Plain { size, offset } => {
            let mut buf = vec![0u8; size as usize];
            io.get_data(offset, &mut buf)?;
            Ok(Some(buf))
        }
        SlotState::Linked { .. } => {
            let chunks = chunks(io, state)?;
            let mut out = Vec::with_capacity(chunks.len() * LINKED_CHUNK_PAYLOAD);
            let mut buf = vec![0u8; MAX_RECORD_SIZE];
            for (i, chunk) in chunks.iter().enumerate() {
                let bytes = &mut buf[..chunk.len];
                io.get_data(chunk.offset, bytes)?;
                if i + 1 < chunks.len() {
                    out.extend_from_slice(&bytes[CHUNK_LINK_SIZE..]);
                } else {
                    out.extend_from_slice(bytes);
                }
            }
            Ok(Some(out))
        }
    }
}

pub(crate) fn release<IO: StoreIo + ?Sized>(alloc: &mut Allocator<'_, IO>, chunks: &[Chunk]) -> Result<()> {
    for chunk in chunks {
        alloc.release_data(chunk.offset, chunk.allocation())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::Fixture;

    fn store(fx: &Fixture, data: &[u8]) -> IndexEntry {
        let chunks = fx.with(|alloc| allocate(alloc, data.len()));
        write(&fx.io, 1, &chunks, data).unwrap()
    }

    fn state_of(entry: IndexEntry) -> SlotState {
        SlotState::decode(entry.pack()).unwrap()
    }

    #[test]
    fn chunk_lengths_split_at_threshold() {
        assert!(chunk_lengths(0).is_empty());
        assert_eq!(chunk_lengths(MAX_RECORD_SIZE).as_slice(), &[MAX_RECORD_SIZE]);
        assert_eq!(
            chunk_lengths(MAX_RECORD_SIZE + 1).as_slice(),
            &[MAX_RECORD_SIZE, CHUNK_LINK_SIZE + 1]
        );
        assert_eq!(
            chunk_lengths(3 * LINKED_CHUNK_PAYLOAD + 100).as_slice(),
            &[MAX_RECORD_SIZE, MAX_RECORD_SIZE, MAX_RECORD_SIZE, 100]
        );
    }

    #[test]
    fn empty_payload_needs_no_allocation() {
        let fx = Fixture::new();
        let entry = store(&fx, &[]);

        assert_eq!(entry, IndexEntry::stored(0, 0, false));
        assert_eq!(read(&fx.io, 1, state_of(entry)).unwrap(), Some(vec![]));
        assert_eq!(fx.state.lock().data_tail, 0);
    }

    #[test]
    fn small_payload_reads_back() {
        let fx = Fixture::new();
        let entry = store(&fx, b"hello");

        assert!(!entry.linked());
        assert_eq!(read(&fx.io, 1, state_of(entry)).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn linked_payload_reads_back() {
        let fx = Fixture::new();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let entry = store(&fx, &data);

        assert!(entry.linked());
        let chain = chunks(&fx.io, state_of(entry)).unwrap();
        assert_eq!(chain.len(), 4);
        assert_eq!(read(&fx.io, 1, state_of(entry)).unwrap().unwrap(), data);
    }

    #[test]
    fn release_returns_every_chunk() {
        let fx = Fixture::new();
        let data = vec![7u8; 2 * MAX_RECORD_SIZE];
        let entry = store(&fx, &data);
        let chain = chunks(&fx.io, state_of(entry)).unwrap();
        let total: u64 = chain.iter().map(|c| c.allocation()).sum();

        fx.with(|alloc| release(alloc, &chain));

        assert_eq!(fx.state.lock().free_size, total);
    }

    #[test]
    fn void_slot_is_void_access() {
        let fx = Fixture::new();
        let err = read(&fx.io, 9, SlotState::Void).unwrap_err();

        assert!(crate::error::StoreErrorExt::is_void_access(&err));
        assert_eq!(read(&fx.io, 9, SlotState::Absent).unwrap(), None);
    }
}
