//! # Store Header
//!
//! Page 0 starts with a 24-byte prefix followed by the control words and the
//! long-stack master links. The zero index page begins at `HEAD_END`.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------------
//!      0     1  magic
//!      1     1  store type (1 = direct, 2 = WAL)
//!      2     2  reserved
//!      4     4  feature bitmap
//!      8     8  volume checksum (CRC-64/ECMA over [HEAD_END, file tail))
//!     16     4  feature bitmap copy
//!     20     4  header checksum (fold of words [24, HEAD_END))
//!     24     8  data tail
//!     32     8  max recid
//!     40     8  file tail
//!     48     8  first index page (parity-4 link)
//!     56     8  reserved
//!     64     8  free-recid master link
//!     72     8  catch-all master link
//!     80  4095*8  size-class master links (16, 32, .., 65520 bytes)
//!  32840     8  reserved
//!  32848        HEAD_END
//! ```
//!
//! ## Feature Bits
//!
//! | Bit | Meaning                 |
//! |-----|-------------------------|
//! | 0   | volume checksum enabled |
//! | 1   | header checksum enabled |
//!
//! Any other bit is refused as `UnsupportedFormat`, so an older build never
//! opens a file written with features it does not understand.
//!
//! ## Checksum Coverage
//!
//! The header checksum covers the control words and master links but not the
//! prefix, so writing it never invalidates itself. The volume checksum covers
//! every byte after the header up to the file tail; bytes of the last mapped
//! page past the file tail are not part of the store.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::Result;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::parity::parity4_set;
use crate::config::{
    StoreConfig, HEAD_CHECKSUM, HEAD_CONTROL_START, HEAD_END, HEAD_FILE_TAIL,
    HEAD_FIRST_INDEX_PAGE, HEAD_VOLUME_CHECKSUM, PAGE_SIZE,
};
use crate::error::StoreError;
use crate::macros::le_getters;
use crate::volume::Volume;

pub const STORE_MAGIC: u8 = 0x52;

pub const HEADER_PREFIX_SIZE: usize = 24;

const VOLUME_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Direct = 1,
    Wal = 2,
}

impl StoreType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(StoreType::Direct),
            2 => Some(StoreType::Wal),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StoreType::Direct => "direct",
            StoreType::Wal => "wal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features(u32);

impl Features {
    pub const VOLUME_CHECKSUM: u32 = 1 << 0;
    pub const HEADER_CHECKSUM: u32 = 1 << 1;
    const KNOWN: u32 = Self::VOLUME_CHECKSUM | Self::HEADER_CHECKSUM;

    pub fn from_config(config: &StoreConfig) -> Self {
        let mut bits = 0;
        if config.volume_checksum() {
            bits |= Self::VOLUME_CHECKSUM;
        }
        if config.header_checksum() {
            bits |= Self::HEADER_CHECKSUM;
        }
        Features(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn volume_checksum(self) -> bool {
        self.0 & Self::VOLUME_CHECKSUM != 0
    }

    pub fn header_checksum(self) -> bool {
        self.0 & Self::HEADER_CHECKSUM != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeaderPrefix {
    magic: u8,
    store_type: u8,
    reserved: [u8; 2],
    features: U32,
    volume_checksum: U64,
    store_features: U32,
    header_checksum: U32,
}

const _: () = assert!(std::mem::size_of::<HeaderPrefix>() == HEADER_PREFIX_SIZE);
const _: () = assert!(HEAD_CHECKSUM as usize + 4 == HEADER_PREFIX_SIZE);
const _: () = assert!(HEAD_CONTROL_START as usize == HEADER_PREFIX_SIZE);

impl HeaderPrefix {
    pub fn new(store_type: StoreType, features: Features) -> Self {
        Self {
            magic: STORE_MAGIC,
            store_type: store_type as u8,
            reserved: [0; 2],
            features: U32::new(features.bits()),
            volume_checksum: U64::new(0),
            store_features: U32::new(features.bits()),
            header_checksum: U32::new(0),
        }
    }

    pub fn read(volume: &dyn Volume) -> Result<Self> {
        if volume.length() < PAGE_SIZE {
            return Err(StoreError::corruption(format!(
                "volume length {} is shorter than the header page",
                volume.length()
            ))
            .into());
        }
        let mut buf = [0u8; HEADER_PREFIX_SIZE];
        volume.get_data(0, &mut buf)?;
        Self::read_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("failed to parse store header: {:?}", e))
    }

    le_getters! {
        magic: u8,
        store_type: u8,
        features: u32,
        volume_checksum: u64,
        store_features: u32,
        header_checksum: u32,
    }

    /// Checks the prefix against what the caller is about to open it as.
    /// Returns the stored feature set on success.
    pub fn validate(&self, expected: StoreType, requested: Features) -> Result<Features> {
        if self.magic != STORE_MAGIC {
            return Err(StoreError::UnsupportedFormat(format!(
                "bad magic byte {:#04x}",
                self.magic
            ))
            .into());
        }

        let bits = self.features();
        if bits & !Features::KNOWN != 0 {
            return Err(StoreError::UnsupportedFormat(format!(
                "unknown feature bits {:#x}",
                bits & !Features::KNOWN
            ))
            .into());
        }
        if bits != self.store_features() {
            return Err(StoreError::corruption(format!(
                "feature bitmap {:#x} disagrees with its copy {:#x}",
                bits,
                self.store_features()
            ))
            .into());
        }

        match StoreType::from_byte(self.store_type) {
            None => {
                return Err(StoreError::UnsupportedFormat(format!(
                    "unknown store type {}",
                    self.store_type
                ))
                .into())
            }
            Some(found) if found != expected => {
                return Err(StoreError::WrongConfiguration(format!(
                    "volume holds a {} store, opened as {}",
                    found.name(),
                    expected.name()
                ))
                .into())
            }
            Some(_) => {}
        }

        let stored = Features(bits);
        if stored.volume_checksum() != requested.volume_checksum() {
            return Err(StoreError::WrongConfiguration(format!(
                "volume checksum is {} in the store but {} in the configuration",
                enabled(stored.volume_checksum()),
                enabled(requested.volume_checksum())
            ))
            .into());
        }
        if stored.header_checksum() != requested.header_checksum() {
            return Err(StoreError::WrongConfiguration(format!(
                "header checksum is {} in the store but {} in the configuration",
                enabled(stored.header_checksum()),
                enabled(requested.header_checksum())
            ))
            .into());
        }

        debug!(store_type = expected.name(), features = bits, "store header validated");
        Ok(stored)
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

/// Writes a fresh header into an empty volume: one page with an empty zero
/// index page and no data.
pub fn create(volume: &dyn Volume, store_type: StoreType, features: Features) -> Result<()> {
    volume.ensure_available(PAGE_SIZE)?;
    volume.put_data(0, HeaderPrefix::new(store_type, features).as_bytes())?;
    volume.put_long(HEAD_FILE_TAIL, PAGE_SIZE)?;
    volume.put_long(HEAD_FIRST_INDEX_PAGE, parity4_set(HEAD_END))?;
    volume.put_long(HEAD_END, 0)?;
    debug!(store_type = store_type.name(), features = features.bits(), "created store header");
    Ok(())
}

pub fn header_checksum(volume: &dyn Volume) -> Result<u32> {
    header_checksum_with(|offset: u64, buf: &mut [u8]| volume.get_data(offset, buf))
}

/// Header checksum over bytes supplied by `read`, which may be a buffered
/// view rather than the volume itself.
pub fn header_checksum_with<R>(mut read: R) -> Result<u32>
where
    R: FnMut(u64, &mut [u8]) -> Result<()>,
{
    let mut buf = vec![0u8; (HEAD_END - HEAD_CONTROL_START) as usize];
    read(HEAD_CONTROL_START, &mut buf)?;

    let mut sum = HEAD_END;
    for word in buf.chunks_exact(8) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(word);
        sum = sum.wrapping_mul(31).wrapping_add(u64::from_le_bytes(bytes));
    }
    Ok((sum ^ (sum >> 32)) as u32)
}

pub fn volume_checksum(volume: &dyn Volume, file_tail: u64) -> Result<u64> {
    volume_checksum_with(|offset: u64, buf: &mut [u8]| volume.get_data(offset, buf), file_tail)
}

pub fn volume_checksum_with<R>(mut read: R, file_tail: u64) -> Result<u64>
where
    R: FnMut(u64, &mut [u8]) -> Result<()>,
{
    let mut digest = VOLUME_CRC.digest();
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let mut offset = HEAD_END;
    while offset < file_tail {
        let len = (file_tail - offset).min(PAGE_SIZE) as usize;
        read(offset, &mut buf[..len])?;
        digest.update(&buf[..len]);
        offset += len as u64;
    }
    Ok(digest.finalize())
}

/// Refreshes the enabled checksums. The control words must already be final.
pub fn write_checksums(volume: &dyn Volume, features: Features, file_tail: u64) -> Result<()> {
    if features.volume_checksum() {
        volume.put_long(HEAD_VOLUME_CHECKSUM, volume_checksum(volume, file_tail)?)?;
    }
    if features.header_checksum() {
        volume.put_int(HEAD_CHECKSUM, header_checksum(volume)?)?;
    }
    Ok(())
}

pub fn verify_checksums(volume: &dyn Volume, features: Features, file_tail: u64) -> Result<()> {
    verify_checksums_with(
        |offset: u64, buf: &mut [u8]| volume.get_data(offset, buf),
        features,
        file_tail,
    )
}

/// Compares the stored checksums read through `read` with ones computed
/// from the same view.
pub fn verify_checksums_with<R>(mut read: R, features: Features, file_tail: u64) -> Result<()>
where
    R: FnMut(u64, &mut [u8]) -> Result<()>,
{
    if features.header_checksum() {
        let mut word = [0u8; 4];
        read(HEAD_CHECKSUM, &mut word)?;
        let stored = u32::from_le_bytes(word);
        let computed = header_checksum_with(&mut read)?;
        if stored != computed {
            return Err(StoreError::corruption(format!(
                "header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ))
            .into());
        }
    }
    if features.volume_checksum() {
        let mut word = [0u8; 8];
        read(HEAD_VOLUME_CHECKSUM, &mut word)?;
        let stored = u64::from_le_bytes(word);
        let computed = volume_checksum_with(&mut read, file_tail)?;
        if stored != computed {
            return Err(StoreError::corruption(format!(
                "volume checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
            ))
            .into());
        }
    }
    Ok(())
}
