//! Random-access file volume: positioned reads and writes through one file
//! handle guarded by a mutex.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use super::Volume;

#[derive(Debug)]
struct FileState {
    file: File,
    length: u64,
}

#[derive(Debug)]
pub struct FileVolume {
    path: PathBuf,
    read_only: bool,
    state: Mutex<FileState>,
}

impl FileVolume {
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

        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            state: Mutex::new(FileState { file, length }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Volume for FileVolume {
    fn get_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            offset + buf.len() as u64 <= state.length,
            "read [{}, {}) past end of '{}' (length {})",
            offset,
            offset + buf.len() as u64,
            self.path.display(),
            state.length
        );

        state
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| state.file.read_exact(buf))
            .wrap_err_with(|| format!("failed to read {} bytes at {}", buf.len(), offset))
    }

    fn put_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            !self.read_only,
            "write to read-only volume '{}'",
            self.path.display()
        );
        let mut state = self.state.lock();
        ensure!(
            offset + data.len() as u64 <= state.length,
            "write [{}, {}) past end of '{}' (length {})",
            offset,
            offset + data.len() as u64,
            self.path.display(),
            state.length
        );

        state
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| state.file.write_all(data))
            .wrap_err_with(|| format!("failed to write {} bytes at {}", data.len(), offset))
    }

    fn ensure_available(&self, length: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.length >= length {
            return Ok(());
        }
        ensure!(
            !self.read_only,
            "cannot grow read-only volume '{}'",
            self.path.display()
        );

        state
            .file
            .set_len(length)
            .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", self.path.display(), length))?;
        state.length = length;
        Ok(())
    }

    fn truncate(&self, length: u64) -> Result<()> {
        ensure!(
            !self.read_only,
            "cannot truncate read-only volume '{}'",
            self.path.display()
        );
        let mut state = self.state.lock();
        state
            .file
            .set_len(length)
            .wrap_err_with(|| format!("failed to truncate '{}' to {} bytes", self.path.display(), length))?;
        state.length = length;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.state
            .lock()
            .file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn length(&self) -> u64 {
        self.state.lock().length
    }
}
