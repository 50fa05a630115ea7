//! # Memory-Mapped Volume
//!
//! `MmapVolume` maps the store file into the process address space, so reads
//! and writes are plain memory copies and the OS page cache does the rest.
//!
//! ## Growth and Remapping
//!
//! A mapping becomes invalid when the file is grown and remapped. The mapping
//! lives behind a `parking_lot::RwLock`: accessors copy bytes out while holding
//! the read side, and `ensure_available`/`truncate` take the write side, flush
//! the old mapping, resize the file and map again. No slice into the mapping
//! ever escapes the lock, so no reader can observe an unmapped region.
//!
//! The file is grown in whole `PAGE_SIZE` steps to keep the number of remaps
//! proportional to the number of store pages.
//!
//! ## Empty Files
//!
//! A zero-length file cannot be mapped. Until the first `ensure_available`
//! the volume holds no mapping and every access is out of bounds.
//!
//! ## Platform Behavior
//!
//! - Linux/macOS: `mmap()` with `MAP_SHARED`; `sync()` is `msync()`
//! - Windows: `CreateFileMapping` / `MapViewOfFile`; `sync()` flushes the view

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;

use super::Volume;
use crate::config::PAGE_SIZE;

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(m) => m,
            Mapping::ReadWrite(m) => m,
        }
    }
}

#[derive(Debug)]
struct MappedFile {
    file: File,
    mapping: Option<Mapping>,
    length: u64,
}

#[derive(Debug)]
pub struct MmapVolume {
    path: PathBuf,
    read_only: bool,
    inner: RwLock<MappedFile>,
}

impl MmapVolume {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open volume file '{}'", path.display()))?;

        let length = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        let mapping = map(&file, length, read_only)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            inner: RwLock::new(MappedFile {
                file,
                mapping,
                length,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resize(&self, inner: &mut MappedFile, new_length: u64) -> Result<()> {
        if let Some(Mapping::ReadWrite(m)) = &inner.mapping {
            m.flush().wrap_err("failed to flush mmap before resize")?;
        }
        inner.mapping = None;

        inner
            .file
            .set_len(new_length)
            .wrap_err_with(|| format!("failed to resize '{}' to {} bytes", self.path.display(), new_length))?;

        inner.mapping = map(&inner.file, new_length, self.read_only)
            .wrap_err("failed to remap file after resize")?;
        inner.length = new_length;

        Ok(())
    }
}

fn map(file: &File, length: u64, read_only: bool) -> Result<Option<Mapping>> {
    if length == 0 {
        return Ok(None);
    }

    // SAFETY: mapping a file is unsafe because another process could modify or
    // truncate it underneath us. This is sound here because:
    // 1. The volume owns the file handle and store files are not shared between processes
    // 2. The mapping is replaced only under the write lock, so no access is in flight
    // 3. Every access is bounds-checked against `length`, which matches the file size
    let mapping = unsafe {
        if read_only {
            Mapping::ReadOnly(Mmap::map(file)?)
        } else {
            Mapping::ReadWrite(MmapMut::map_mut(file)?)
        }
    };

    Ok(Some(mapping))
}

fn check_range(offset: u64, len: usize, length: u64) -> Result<usize> {
    ensure!(
        offset.checked_add(len as u64).is_some_and(|end| end <= length),
        "access [{}, {}) out of bounds (volume length {})",
        offset,
        offset + len as u64,
        length
    );
    Ok(offset as usize)
}

impl Volume for MmapVolume {
    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.read();
        let start = check_range(offset, buf.len(), inner.length)?;
        if buf.is_empty() {
            return Ok(());
        }
        let bytes = inner
            .mapping
            .as_ref()
            .map(Mapping::bytes)
            .ok_or_else(|| eyre::eyre!("volume '{}' is not mapped", self.path.display()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn put_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            !self.read_only,
            "write to read-only volume '{}'",
            self.path.display()
        );
        let mut inner = self.inner.write();
        let start = check_range(offset, data.len(), inner.length)?;
        match inner.mapping.as_mut() {
            Some(Mapping::ReadWrite(m)) => {
                m[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ if data.is_empty() => Ok(()),
            _ => eyre::bail!("volume '{}' is not mapped writable", self.path.display()),
        }
    }

    fn ensure_available(&self, length: u64) -> Result<()> {
        if self.inner.read().length >= length {
            return Ok(());
        }
        ensure!(
            !self.read_only,
            "cannot grow read-only volume '{}'",
            self.path.display()
        );

        let mut inner = self.inner.write();
        if inner.length >= length {
            return Ok(());
        }
        let rounded = length.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        self.resize(&mut inner, rounded)
    }

    fn truncate(&self, length: u64) -> Result<()> {
        ensure!(
            !self.read_only,
            "cannot truncate read-only volume '{}'",
            self.path.display()
        );
        let mut inner = self.inner.write();
        self.resize(&mut inner, length)
    }

    fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Some(Mapping::ReadWrite(m)) = &inner.mapping {
            m.flush().wrap_err("failed to sync mmap to disk")?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn length(&self) -> u64 {
        self.inner.read().length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_file_has_no_mapping() {
        let dir = tempdir().unwrap();
        let volume = MmapVolume::open(dir.path().join("v"), false).unwrap();

        assert_eq!(volume.length(), 0);
        let mut buf = [0u8; 1];
        assert!(volume.get_data(0, &mut buf).is_err());
    }

    #[test]
    fn growth_is_page_granular() {
        let dir = tempdir().unwrap();
        let volume = MmapVolume::open(dir.path().join("v"), false).unwrap();

        volume.ensure_available(10).unwrap();
        assert_eq!(volume.length(), PAGE_SIZE);

        volume.ensure_available(PAGE_SIZE + 1).unwrap();
        assert_eq!(volume.length(), 2 * PAGE_SIZE);
    }

    #[test]
    fn growth_preserves_existing_data() {
        let dir = tempdir().unwrap();
        let volume = MmapVolume::open(dir.path().join("v"), false).unwrap();

        volume.ensure_available(16).unwrap();
        volume.put_long(8, 0xCAFE).unwrap();
        volume.ensure_available(3 * PAGE_SIZE).unwrap();

        assert_eq!(volume.get_long(8).unwrap(), 0xCAFE);
    }

    #[test]
    fn sync_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v");
        {
            let volume = MmapVolume::open(&path, false).unwrap();
            volume.ensure_available(64).unwrap();
            volume.put_data(50, &[0xBE, 0xEF]).unwrap();
            volume.sync().unwrap();
        }

        let volume = MmapVolume::open(&path, true).unwrap();
        let mut buf = [0u8; 2];
        volume.get_data(50, &mut buf).unwrap();

        assert_eq!(buf, [0xBE, 0xEF]);
        assert!(volume.put_data(50, &[0]).is_err());
    }

    #[test]
    fn truncate_to_zero_unmaps() {
        let dir = tempdir().unwrap();
        let volume = MmapVolume::open(dir.path().join("v"), false).unwrap();
        volume.ensure_available(16).unwrap();

        volume.truncate(0).unwrap();

        assert_eq!(volume.length(), 0);
        volume.ensure_available(8).unwrap();
        assert_eq!(volume.get_long(0).unwrap(), 0);
    }
}
