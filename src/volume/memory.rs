//! Growable in-memory volume.

use eyre::{ensure, Result};
use parking_lot::RwLock;

use super::Volume;

#[derive(Debug, Default)]
pub struct MemoryVolume {
    bytes: RwLock<Vec<u8>>,
    read_only: bool,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps existing content. Used to reopen a snapshot read-only in tests
    /// and by compaction when it builds a layout before copying it back.
    pub fn from_bytes(bytes: Vec<u8>, read_only: bool) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            read_only,
        }
    }

    /// Copy of the full content.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

fn check_range(offset: u64, len: usize, length: usize) -> Result<usize> {
    let start = offset as usize;
    ensure!(
        start.checked_add(len).is_some_and(|end| end <= length),
        "access [{}, {}) out of bounds (volume length {})",
        offset,
        offset + len as u64,
        length
    );
    Ok(start)
}

impl Volume for MemoryVolume {
    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = check_range(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn put_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "write to read-only memory volume");
        let mut bytes = self.bytes.write();
        let start = check_range(offset, data.len(), bytes.len())?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn ensure_available(&self, length: u64) -> Result<()> {
        let mut bytes = self.bytes.write();
        if (bytes.len() as u64) < length {
            ensure!(!self.read_only, "cannot grow read-only memory volume");
            bytes.resize(length as usize, 0);
        }
        Ok(())
    }

    fn truncate(&self, length: u64) -> Result<()> {
        ensure!(!self.read_only, "cannot truncate read-only memory volume");
        self.bytes.write().resize(length as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn length(&self) -> u64 {
        self.bytes.read().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_read_fails() {
        let volume = MemoryVolume::new();
        volume.ensure_available(8).unwrap();

        let mut buf = [0u8; 4];
        assert!(volume.get_data(6, &mut buf).is_err());
        assert!(volume.get_data(4, &mut buf).is_ok());
    }

    #[test]
    fn ensure_available_never_shrinks() {
        let volume = MemoryVolume::new();
        volume.ensure_available(100).unwrap();
        volume.ensure_available(10).unwrap();

        assert_eq!(volume.length(), 100);
    }

    #[test]
    fn truncate_shrinks_and_zero_fills_regrowth() {
        let volume = MemoryVolume::new();
        volume.ensure_available(16).unwrap();
        volume.put_long(8, u64::MAX).unwrap();

        volume.truncate(8).unwrap();
        volume.ensure_available(16).unwrap();

        assert_eq!(volume.get_long(8).unwrap(), 0);
    }

    #[test]
    fn read_only_rejects_writes() {
        let volume = MemoryVolume::from_bytes(vec![0; 16], true);

        assert!(volume.is_read_only());
        assert!(volume.put_long(0, 1).is_err());
        assert!(volume.ensure_available(32).is_err());
        assert_eq!(volume.get_long(0).unwrap(), 0);
    }
}
