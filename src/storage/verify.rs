//! # Structural Verification
//!
//! `verify` walks every persisted structure and fails with `DataCorruption`
//! on the first inconsistency. It is a diagnostic pass for tests and
//! tooling, run under every segment lock plus the structural lock.
//!
//! ## Checks
//!
//! | Structure      | Check                                                    |
//! |----------------|----------------------------------------------------------|
//! | long stacks    | parity of links and values, no cycles                    |
//! | free recids    | inside `1..=max_recid`, no duplicates, slot is void      |
//! | index slots    | parity; live slots are not free, void slots are free     |
//! | byte ranges    | free ranges, stack pages and live chunks are 16-aligned, |
//! |                | inside one data page below the file tail, below the data |
//! |                | tail on the current page, and pairwise disjoint          |
//! | free size      | sum over buckets equals the tracked value                |

use eyre::Result;
use hashbrown::HashSet;
use tracing::debug;

use super::allocator::AllocState;
use super::engine::StoreCore;
use super::index::SlotState;
use super::io::StoreIo;
use super::long_stack::{self, decode_free_range, Bucket};
use super::record;
use crate::config::{ALIGNMENT, LONG_STACK_PAGE_SIZE, PAGE_SIZE};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Free,
    StackPage(Bucket),
    Record(u64),
}

#[derive(Debug, Clone, Copy)]
struct Range {
    offset: u64,
    size: u64,
    owner: Owner,
}

fn corrupt(message: String) -> eyre::Report {
    StoreError::corruption(message).into()
}

impl<IO: StoreIo> StoreCore<IO> {
    pub fn verify(&self) -> Result<()> {
        self.check_open()?;
        let _segments = self.segments.write_all();
        let state = self.structural.lock();
        self.verify_locked(&state)?;
        debug!(max_recid = state.max_recid, free_size = state.free_size, "store verified");
        Ok(())
    }

    fn verify_locked(&self, state: &AllocState) -> Result<()> {
        let mut ranges = Vec::new();
        let mut free_recids = HashSet::new();
        let mut free_size = 0u64;

        for bucket in Bucket::all() {
            for page in long_stack::pages(&self.io, bucket)? {
                ranges.push(Range {
                    offset: page,
                    size: LONG_STACK_PAGE_SIZE,
                    owner: Owner::StackPage(bucket),
                });
            }
            long_stack::for_each(&self.io, bucket, |value| {
                match bucket {
                    Bucket::Recid => {
                        if value == 0 || value > state.max_recid {
                            return Err(corrupt(format!(
                                "free recid {} outside 1..={}",
                                value, state.max_recid
                            )));
                        }
                        if !free_recids.insert(value) {
                            return Err(corrupt(format!("recid {value} is free twice")));
                        }
                    }
                    Bucket::Oversize => {
                        let (offset, size) = decode_free_range(value);
                        free_size += size;
                        ranges.push(Range {
                            offset,
                            size,
                            owner: Owner::Free,
                        });
                    }
                    Bucket::Size(_) => {
                        let size = bucket.class_size().unwrap_or_default();
                        free_size += size;
                        ranges.push(Range {
                            offset: value,
                            size,
                            owner: Owner::Free,
                        });
                    }
                }
                Ok(())
            })?;
        }

        for recid in 1..=state.max_recid {
            let slot = self.read_slot(recid)?;
            match slot {
                SlotState::Void if !free_recids.contains(&recid) => {
                    return Err(corrupt(format!("void recid {recid} is not in the free bucket")));
                }
                SlotState::Void => {}
                _ if free_recids.contains(&recid) => {
                    return Err(corrupt(format!("live recid {recid} is in the free bucket")));
                }
                _ => {
                    for chunk in record::chunks(&self.io, slot)? {
                        ranges.push(Range {
                            offset: chunk.offset,
                            size: chunk.allocation(),
                            owner: Owner::Record(recid),
                        });
                    }
                }
            }
        }

        self.check_ranges(state, &mut ranges)?;

        if free_size != state.free_size {
            return Err(corrupt(format!(
                "tracked free size {} but buckets hold {}",
                state.free_size, free_size
            )));
        }
        Ok(())
    }

    fn check_ranges(&self, state: &AllocState, ranges: &mut [Range]) -> Result<()> {
        let index_pages: HashSet<u64> = self
            .index
            .pages()
            .into_iter()
            .map(|page| page / PAGE_SIZE)
            .collect();
        let data_page = state.data_tail / PAGE_SIZE;
        let open_page = state.data_tail % PAGE_SIZE != 0;

        for range in ranges.iter() {
            let end = range.offset + range.size;
            let page = range.offset / PAGE_SIZE;
            let fault = if range.size == 0 || range.offset % ALIGNMENT != 0 || range.size % ALIGNMENT != 0 {
                Some("is misaligned")
            } else if page != (end - 1) / PAGE_SIZE {
                Some("crosses a page boundary")
            } else if index_pages.contains(&page) {
                Some("lies in an index page")
            } else if end > state.file_tail {
                Some("ends past the file tail")
            } else if open_page && page == data_page && end > state.data_tail {
                Some("ends past the data tail")
            } else {
                None
            };
            if let Some(fault) = fault {
                return Err(corrupt(format!(
                    "range [{}, {}) owned by {:?} {}",
                    range.offset, end, range.owner, fault
                )));
            }
        }

        ranges.sort_unstable_by_key(|r| r.offset);
        for pair in ranges.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.offset + a.size > b.offset {
                return Err(corrupt(format!(
                    "range [{}, {}) owned by {:?} overlaps [{}, {}) owned by {:?}",
                    a.offset,
                    a.offset + a.size,
                    a.owner,
                    b.offset,
                    b.offset + b.size,
                    b.owner
                )));
            }
        }
        Ok(())
    }
}
