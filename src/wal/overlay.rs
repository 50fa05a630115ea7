//! # Copy-on-Write Overlay
//!
//! `WalIo` is the [`StoreIo`] a WAL store runs its record engine on. Reads
//! see the committed base volume merged with the writes of the open
//! transaction; writes are logged to the WAL and then applied to private
//! copies of the 4 KiB blocks they touch. The base volume is only written
//! at commit, by replaying the log.
//!
//! ```text
//!             put_long / put_data
//!                     │
//!            ┌────────┴────────┐
//!            ▼                 ▼
//!     WriteAheadLog      overlay blocks ──┐
//!                                         ├──> get_long / get_data
//!                        base volume ─────┘
//! ```
//!
//! ## Growth
//!
//! `ensure_available` raises the overlay's logical length only. Bytes past
//! the end of the base read as zero, exactly what the base holds once it is
//! grown during replay.
//!
//! ## Compaction
//!
//! `install_image` logs a compacted image under its own commit marker
//! before overwriting the base, the same way a transaction reaches it.
//!
//! ## Lock Order
//!
//! base handle, then overlay, then the log's buffer lock. Logging and
//! applying a write happen under one overlay write lock, so the log records
//! overlapping writes in the order readers observed them.

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::log::WriteAheadLog;
use crate::config::PAGE_SIZE;
use crate::storage::io::{copy_volume, StoreIo};
use crate::volume::Volume;

const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Default)]
struct Overlay {
    blocks: HashMap<u64, Box<[u8]>>,
    /// Logical length requested through `ensure_available`.
    length: u64,
}

pub(crate) struct WalIo {
    base: RwLock<Arc<dyn Volume>>,
    log: WriteAheadLog,
    overlay: RwLock<Overlay>,
}

impl WalIo {
    pub fn new(base: Arc<dyn Volume>, log: WriteAheadLog) -> Self {
        Self {
            base: RwLock::new(base),
            log,
            overlay: RwLock::new(Overlay::default()),
        }
    }

    pub fn log(&self) -> &WriteAheadLog {
        &self.log
    }

    /// True when the open transaction changed anything.
    pub fn is_dirty(&self) -> bool {
        !self.overlay.read().blocks.is_empty()
    }

    /// Drops every buffered write.
    pub fn clear_overlay(&self) {
        *self.overlay.write() = Overlay::default();
    }

    /// Writes into the overlay without logging. Used to expose committed
    /// log entries on a store that cannot write its base volume.
    pub fn apply_unlogged(&self, offset: u64, data: &[u8]) -> Result<()> {
        let base = self.base.read();
        let mut overlay = self.overlay.write();
        let end = offset + data.len() as u64;
        overlay.length = overlay.length.max(end);
        write_blocks(&mut overlay, &**base, offset, data)
    }

    /// Raises the logical length without logging.
    pub fn grow_unlogged(&self, length: u64) {
        let mut overlay = self.overlay.write();
        overlay.length = overlay.length.max(length);
    }

    fn logical_length(&self, overlay: &Overlay, base: &dyn Volume) -> u64 {
        overlay.length.max(base.length())
    }
}

/// Fills `buf` from the committed base, zero past its end.
fn read_base(base: &dyn Volume, offset: u64, buf: &mut [u8]) -> Result<()> {
    let base_len = base.length();
    if offset >= base_len {
        buf.fill(0);
        return Ok(());
    }
    let available = ((base_len - offset) as usize).min(buf.len());
    base.get_data(offset, &mut buf[..available])?;
    buf[available..].fill(0);
    Ok(())
}

fn write_blocks(overlay: &mut Overlay, base: &dyn Volume, offset: u64, data: &[u8]) -> Result<()> {
    let mut pos = offset;
    let mut rest = data;
    while !rest.is_empty() {
        let block = pos / BLOCK_SIZE;
        let within = (pos % BLOCK_SIZE) as usize;
        let len = rest.len().min(BLOCK_SIZE as usize - within);

        let bytes = match overlay.blocks.entry(block) {
            hashbrown::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                let mut copy = vec![0u8; BLOCK_SIZE as usize].into_boxed_slice();
                read_base(base, block * BLOCK_SIZE, &mut copy)?;
                entry.insert(copy)
            }
        };
        bytes[within..within + len].copy_from_slice(&rest[..len]);

        pos += len as u64;
        rest = &rest[len..];
    }
    Ok(())
}

impl StoreIo for WalIo {
    fn get_long(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_data(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn put_long(&self, offset: u64, value: u64) -> Result<()> {
        let base = self.base.read();
        let mut overlay = self.overlay.write();
        let length = self.logical_length(&overlay, &**base);
        ensure!(
            offset + 8 <= length,
            "write at {} past the end of the store ({})",
            offset,
            length
        );
        self.log.log_long(offset, value)?;
        write_blocks(&mut overlay, &**base, offset, &value.to_le_bytes())
    }

    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let base = self.base.read();
        let overlay = self.overlay.read();
        let length = self.logical_length(&overlay, &**base);
        ensure!(
            offset + buf.len() as u64 <= length,
            "read [{}, {}) past the end of the store ({})",
            offset,
            offset + buf.len() as u64,
            length
        );

        let mut pos = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let block = pos / BLOCK_SIZE;
            let within = (pos % BLOCK_SIZE) as usize;
            let len = (buf.len() - filled).min(BLOCK_SIZE as usize - within);
            let out = &mut buf[filled..filled + len];
            match overlay.blocks.get(&block) {
                Some(bytes) => out.copy_from_slice(&bytes[within..within + len]),
                None => read_base(&**base, pos, out)?,
            }
            pos += len as u64;
            filled += len;
        }
        Ok(())
    }

    fn put_data(&self, offset: u64, recid: u64, data: &[u8]) -> Result<()> {
        let base = self.base.read();
        let mut overlay = self.overlay.write();
        let length = self.logical_length(&overlay, &**base);
        ensure!(
            offset + data.len() as u64 <= length,
            "write [{}, {}) past the end of the store ({})",
            offset,
            offset + data.len() as u64,
            length
        );
        self.log.log_bytes(recid, offset, data)?;
        write_blocks(&mut overlay, &**base, offset, data)
    }

    fn ensure_available(&self, length: u64) -> Result<()> {
        self.grow_unlogged(length);
        Ok(())
    }

    fn length(&self) -> u64 {
        let base = self.base.read();
        let overlay = self.overlay.read();
        self.logical_length(&overlay, &**base)
    }

    fn volume(&self) -> Arc<dyn Volume> {
        Arc::clone(&self.base.read())
    }

    fn replace_volume(&self, volume: Arc<dyn Volume>) {
        let mut base = self.base.write();
        *self.overlay.write() = Overlay::default();
        *base = volume;
    }

    /// Logs the whole image under one commit marker, then copies it over the
    /// base. A crash during the copy leaves a committed log that replay
    /// finishes.
    fn install_image(&self, image: &dyn Volume) -> Result<()> {
        let base = self.base.read();
        let length = image.length();
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        let mut offset = 0;
        while offset < length {
            let len = (length - offset).min(PAGE_SIZE) as usize;
            image.get_data(offset, &mut buf[..len])?;
            self.log.log_bytes(0, offset, &buf[..len])?;
            offset += len as u64;
        }
        self.log.log_commit(true)?;

        copy_volume(image, &**base)?;
        base.sync()?;
        self.log.reset()?;
        *self.overlay.write() = Overlay::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryVolume;

    fn io(base: &Arc<MemoryVolume>) -> (WalIo, Arc<MemoryVolume>) {
        let wal = Arc::new(MemoryVolume::new());
        let log = WriteAheadLog::open(Arc::clone(&wal) as Arc<dyn Volume>, 4096, false).unwrap();
        (WalIo::new(Arc::clone(base) as Arc<dyn Volume>, log), wal)
    }

    fn base() -> Arc<MemoryVolume> {
        let base = Arc::new(MemoryVolume::new());
        base.ensure_available(3 * BLOCK_SIZE).unwrap();
        base.put_data(100, b"committed").unwrap();
        base
    }

    #[test]
    fn writes_stay_out_of_the_base() {
        let base = base();
        let (io, _) = io(&base);

        io.put_data(102, 1, b"XX").unwrap();

        let mut buf = [0u8; 9];
        io.get_data(100, &mut buf).unwrap();
        assert_eq!(&buf, b"coXXitted");
        base.get_data(100, &mut buf).unwrap();
        assert_eq!(&buf, b"committed");
        assert!(io.is_dirty());
    }

    #[test]
    fn writes_spanning_blocks_read_back() {
        let base = base();
        let (io, _) = io(&base);
        let data: Vec<u8> = (0..6000u32).map(|i| i as u8).collect();

        io.put_data(BLOCK_SIZE - 10, 1, &data).unwrap();
        io.put_long(BLOCK_SIZE - 4, u64::MAX).unwrap();

        let mut buf = vec![0u8; data.len()];
        io.get_data(BLOCK_SIZE - 10, &mut buf).unwrap();
        assert_eq!(&buf[..6], &data[..6]);
        assert_eq!(&buf[6..14], &[0xFF; 8]);
        assert_eq!(&buf[14..], &data[14..]);
    }

    #[test]
    fn growth_past_base_reads_zero() {
        let base = base();
        let (io, _) = io(&base);
        let end = 5 * BLOCK_SIZE;

        assert!(io.get_long(end - 8).is_err());
        io.ensure_available(end).unwrap();

        assert_eq!(io.length(), end);
        assert_eq!(io.get_long(end - 8).unwrap(), 0);
        io.put_long(end - 8, 42).unwrap();
        assert_eq!(io.get_long(end - 8).unwrap(), 42);
        assert_eq!(base.length(), 3 * BLOCK_SIZE);
    }

    #[test]
    fn every_write_is_logged() {
        let base = base();
        let (io, wal) = io(&base);

        io.put_long(8, 1).unwrap();
        io.put_data(16, 3, b"abc").unwrap();
        io.log().flush().unwrap();

        assert!(!io.log().is_empty());
        assert!(wal.length() > crate::config::WAL_HEADER_SIZE);
    }

    #[test]
    fn clear_and_replace_drop_buffered_writes() {
        let base = base();
        let (io, _) = io(&base);
        io.put_long(0, 7).unwrap();
        io.clear_overlay();
        assert!(!io.is_dirty());
        assert_eq!(io.get_long(0).unwrap(), 0);

        io.put_long(0, 7).unwrap();
        let fresh = Arc::new(MemoryVolume::new());
        fresh.ensure_available(64).unwrap();
        fresh.put_long(0, 9).unwrap();
        io.replace_volume(fresh);

        assert!(!io.is_dirty());
        assert_eq!(io.get_long(0).unwrap(), 9);
    }

    #[test]
    fn installed_image_is_logged_then_applied() {
        let base = base();
        let (io, wal) = io(&base);
        io.put_long(0, 7).unwrap();
        let image = MemoryVolume::new();
        image.ensure_available(PAGE_SIZE + 100).unwrap();
        image.put_data(PAGE_SIZE + 10, b"compact").unwrap();

        io.install_image(&image).unwrap();

        assert!(!io.is_dirty());
        assert!(io.log().is_empty());
        assert_eq!(wal.length(), crate::config::WAL_HEADER_SIZE);
        assert_eq!(base.to_bytes(), image.to_bytes());
    }

    #[test]
    fn unlogged_writes_skip_the_log() {
        let base = base();
        let (io, _) = io(&base);

        io.apply_unlogged(200, b"replayed").unwrap();

        assert!(io.log().is_empty());
        let mut buf = [0u8; 8];
        io.get_data(200, &mut buf).unwrap();
        assert_eq!(&buf, b"replayed");
    }
}
