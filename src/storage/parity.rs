//! Parity tags embedded in persisted words.
//!
//! Two flavours are used:
//!
//! - **parity-1**: bit 0 makes the total number of set bits odd. Index
//!   entries use it directly; long-stack values are stored as
//!   `parity1_set(value << 1)`. An all-zero word never passes, so a torn
//!   write that leaves zeros is caught.
//! - **parity-4**: the low four bits hold `(popcount(word >> 4) + 1) % 16`.
//!   Used for links (master links, stack-page predecessors, index-page
//!   chain) whose low four bits are free because offsets are 16-aligned.

use eyre::Result;

use crate::error::StoreError;

#[inline]
pub(crate) fn parity1_set(value: u64) -> u64 {
    debug_assert_eq!(value & 1, 0, "parity-1 bit already occupied");
    value | ((value.count_ones() as u64 + 1) & 1)
}

#[inline]
pub(crate) fn parity1_get(word: u64) -> Result<u64> {
    if word.count_ones() % 2 != 1 {
        return Err(StoreError::corruption(format!("parity-1 mismatch in word {word:#018x}")).into());
    }
    Ok(word & !1)
}

#[inline]
pub(crate) fn parity4_set(value: u64) -> u64 {
    debug_assert_eq!(value & 0xF, 0, "parity-4 bits already occupied");
    value | ((value.count_ones() as u64 + 1) & 0xF)
}

#[inline]
pub(crate) fn parity4_get(word: u64) -> Result<u64> {
    let value = word & !0xF;
    if word & 0xF != (value.count_ones() as u64 + 1) & 0xF {
        return Err(StoreError::corruption(format!("parity-4 mismatch in word {word:#018x}")).into());
    }
    Ok(value)
}
