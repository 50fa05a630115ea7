//! Volume access as seen by the record engine.
//!
//! The engine never talks to a `Volume` directly. `StoreIo` adds the recid a
//! byte-range write belongs to (the WAL overlay logs it) and lets a store
//! swap its base volume after compaction. [`DirectIo`] forwards to the
//! volume; `wal::WalIo` redirects writes into a copy-on-write overlay.
//! Compacting a caller-provided volume ends in `install_image`, which the
//! WAL overlay routes through its log.

use std::sync::Arc;

use eyre::Result;
use parking_lot::RwLock;

use crate::config::PAGE_SIZE;
use crate::volume::Volume;

pub(crate) trait StoreIo: Send + Sync {
    fn get_long(&self, offset: u64) -> Result<u64>;

    fn put_long(&self, offset: u64, value: u64) -> Result<()>;

    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes a payload chunk belonging to `recid`.
    fn put_data(&self, offset: u64, recid: u64, data: &[u8]) -> Result<()>;

    fn ensure_available(&self, length: u64) -> Result<()>;

    /// Addressable length, including growth not yet applied to the volume.
    fn length(&self) -> u64;

    /// The committed volume underneath any buffering.
    fn volume(&self) -> Arc<dyn Volume>;

    fn replace_volume(&self, volume: Arc<dyn Volume>);

    /// Overwrites the committed volume with `image`, leaving it exactly
    /// `image.length()` bytes long. Any buffering is dropped.
    fn install_image(&self, image: &dyn Volume) -> Result<()>;
}

/// Copies `from` over `to`, page by page, truncating `to` to its length.
pub(crate) fn copy_volume(from: &dyn Volume, to: &dyn Volume) -> Result<()> {
    let length = from.length();
    to.truncate(length)?;
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let mut offset = 0;
    while offset < length {
        let len = (length - offset).min(PAGE_SIZE) as usize;
        from.get_data(offset, &mut buf[..len])?;
        to.put_data(offset, &buf[..len])?;
        offset += len as u64;
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct DirectIo {
    volume: RwLock<Arc<dyn Volume>>,
}

impl DirectIo {
    pub fn new(volume: Arc<dyn Volume>) -> Self {
        Self {
            volume: RwLock::new(volume),
        }
    }
}

impl StoreIo for DirectIo {
    fn get_long(&self, offset: u64) -> Result<u64> {
        self.volume.read().get_long(offset)
    }

    fn put_long(&self, offset: u64, value: u64) -> Result<()> {
        self.volume.read().put_long(offset, value)
    }

    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.volume.read().get_data(offset, buf)
    }

    fn put_data(&self, offset: u64, _recid: u64, data: &[u8]) -> Result<()> {
        self.volume.read().put_data(offset, data)
    }

    fn ensure_available(&self, length: u64) -> Result<()> {
        self.volume.read().ensure_available(length)
    }

    fn length(&self) -> u64 {
        self.volume.read().length()
    }

    fn volume(&self) -> Arc<dyn Volume> {
        Arc::clone(&self.volume.read())
    }

    fn replace_volume(&self, volume: Arc<dyn Volume>) {
        *self.volume.write() = volume;
    }

    fn install_image(&self, image: &dyn Volume) -> Result<()> {
        let volume = self.volume.read();
        copy_volume(image, &**volume)?;
        volume.sync()
    }
}
