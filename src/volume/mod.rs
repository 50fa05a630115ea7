//! # Volumes
//!
//! A volume is flat, byte-addressable storage. The store consumes nothing but
//! this contract: aligned integer access, byte ranges, growth, truncation and
//! sync. Three backends are provided:
//!
//! | Backend          | Type            | Growth                      | Sync              |
//! |------------------|-----------------|-----------------------------|-------------------|
//! | In-memory        | `MemoryVolume`  | `Vec` resize                | no-op             |
//! | Memory-mapped    | `MmapVolume`    | `set_len` + remap per page  | `msync`           |
//! | Random access    | `FileVolume`    | `set_len`                   | `fsync`           |
//!
//! ## Thread Safety
//!
//! All methods take `&self`. Every backend carries its own lock, so one
//! `Arc<dyn Volume>` is shared by the record engine, the allocator and the
//! index table. Record-level consistency is the store's job; the volume only
//! guarantees that a single `put_data` is never observed half-applied by a
//! concurrent `get_data` of the same range.
//!
//! ## Endianness
//!
//! Multi-byte integers are little-endian.

mod file;
mod memory;
mod mmap;

use std::sync::Arc;

use eyre::Result;

pub use file::FileVolume;
pub use memory::MemoryVolume;
pub use mmap::MmapVolume;

use crate::config::VolumeKind;

pub trait Volume: Send + Sync + std::fmt::Debug {
    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`. The range must already be available.
    fn put_data(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Grows the volume so that at least `length` bytes are addressable.
    /// Never shrinks. New bytes read as zero.
    fn ensure_available(&self, length: u64) -> Result<()>;

    /// Shrinks (or grows) the volume to exactly `length` bytes.
    fn truncate(&self, length: u64) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn is_read_only(&self) -> bool;

    fn length(&self) -> u64;

    fn get_long(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_data(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn put_long(&self, offset: u64, value: u64) -> Result<()> {
        self.put_data(offset, &value.to_le_bytes())
    }

    fn get_int(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get_data(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn put_int(&self, offset: u64, value: u32) -> Result<()> {
        self.put_data(offset, &value.to_le_bytes())
    }

    fn get_byte(&self, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_data(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn put_byte(&self, offset: u64, value: u8) -> Result<()> {
        self.put_data(offset, &[value])
    }
}

impl VolumeKind {
    /// Opens (creating if missing and writable) the volume this kind describes.
    pub fn open(&self, read_only: bool) -> Result<Arc<dyn Volume>> {
        Ok(match self {
            VolumeKind::Memory => Arc::new(MemoryVolume::new()),
            VolumeKind::MappedFile(path) => Arc::new(MmapVolume::open(path, read_only)?),
            VolumeKind::RandomAccessFile(path) => Arc::new(FileVolume::open(path, read_only)?),
        })
    }

    /// Opens the volume after discarding any existing content.
    pub fn create_empty(&self) -> Result<Arc<dyn Volume>> {
        let volume = self.open(false)?;
        volume.truncate(0)?;
        Ok(volume)
    }
}
