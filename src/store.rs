//! # Store Contract
//!
//! [`Store`] is everything collection code sees of a record store. Both
//! [`StoreDirect`](crate::StoreDirect) and [`StoreWal`](crate::StoreWal)
//! implement it.
//!
//! ## Slot Semantics
//!
//! | Slot state        | `get`          | `update` / `cas`  | `delete`       |
//! |-------------------|----------------|-------------------|----------------|
//! | stored value      | `Some(bytes)`  | replaces value    | frees recid    |
//! | preallocated      | `None`         | fills the slot    | frees recid    |
//! | deleted / never   | `VoidAccess`   | `VoidAccess`      | `VoidAccess`   |
//!
//! A freed recid is handed out again by a later `put` or `preallocate`.

use eyre::Result;

/// Counters describing the allocator and lock state of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Volume length claimed by the store (whole pages).
    pub file_tail: u64,
    /// Bump-allocation position inside the current data page.
    pub data_tail: u64,
    pub max_recid: u64,
    /// Bytes held by free-space buckets.
    pub free_size: u64,
    pub index_pages: usize,
    pub segments: usize,
    pub segment_locks_acquired: u64,
    pub segment_locks_contended: u64,
}

pub trait Store: Send + Sync {
    /// Stores `data` under a new recid.
    fn put(&self, data: &[u8]) -> Result<u64>;

    /// Returns the stored value, `None` for a preallocated slot.
    fn get(&self, recid: u64) -> Result<Option<Vec<u8>>>;

    fn update(&self, recid: u64, data: &[u8]) -> Result<()>;

    fn delete(&self, recid: u64) -> Result<()>;

    /// Replaces the value with `new` if it currently equals `expected`.
    /// `None` stands for the absent value on both sides; swapping to `None`
    /// keeps the recid allocated.
    fn compare_and_swap(
        &self,
        recid: u64,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        self.compare_and_swap_by(recid, expected, new, &|current, expected| current == expected)
    }

    /// [`compare_and_swap`](Self::compare_and_swap) with a caller-supplied
    /// equality, called as `eq(current, expected)`.
    fn compare_and_swap_by(
        &self,
        recid: u64,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        eq: &dyn Fn(Option<&[u8]>, Option<&[u8]>) -> bool,
    ) -> Result<bool>;

    /// Reserves a recid whose slot reads as absent.
    fn preallocate(&self) -> Result<u64>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn compact(&self) -> Result<()>;

    /// Walks every internal structure; fails with `DataCorruption` on the
    /// first inconsistency.
    fn verify(&self) -> Result<()>;

    /// Lazily lists every live recid in ascending order. Each call starts a
    /// fresh pass.
    fn get_all_recids(&self) -> Result<Box<dyn Iterator<Item = Result<u64>> + '_>>;

    /// Idempotent. Later operations fail with `Closed`.
    fn close(&self) -> Result<()>;

    fn stats(&self) -> StoreStats;

    /// Free space recomputed by walking every bucket.
    fn calculate_free_size(&self) -> Result<u64>;

    /// Free space as tracked incrementally by the allocator.
    fn tracked_free_size(&self) -> u64;
}
