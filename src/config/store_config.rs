//! # Store Options
//!
//! `StoreConfig` carries the options chosen when a store is created or
//! reopened. Options that change the on-volume format (the two checksum
//! switches) are recorded as feature bits in the header; reopening with a
//! different choice fails with `WrongConfiguration` instead of silently
//! reinterpreting the file.
//!
//! ## Configuration Options
//!
//! | Option           | Default | Description                                   |
//! |------------------|---------|-----------------------------------------------|
//! | header_checksum  | true    | Checksum over the header control words        |
//! | volume_checksum  | false   | CRC-64 over everything past the header        |
//! | segment_count    | 16      | Number of per-segment record locks            |
//! | read_only        | false   | Reject all mutations                          |
//! | sync_on_commit   | true    | fsync volumes at commit                       |
//! | wal_buffer_size  | 1 MiB   | WAL bytes buffered in memory before writing   |
//!
//! ## Usage
//!
//! ```ignore
//! let config = StoreConfig::default()
//!     .with_volume_checksum(true)
//!     .with_segment_count(32);
//!
//! let store = StoreDirect::open(VolumeKind::mapped("./data.rs"), config)?;
//! ```

use std::path::{Path, PathBuf};

use super::{DEFAULT_SEGMENT_COUNT, DEFAULT_WAL_BUFFER_SIZE, MAX_SEGMENT_COUNT};

/// Options for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    header_checksum: bool,
    volume_checksum: bool,
    segment_count: usize,
    read_only: bool,
    sync_on_commit: bool,
    wal_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            header_checksum: true,
            volume_checksum: false,
            segment_count: DEFAULT_SEGMENT_COUNT,
            read_only: false,
            sync_on_commit: true,
            wal_buffer_size: DEFAULT_WAL_BUFFER_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the header checksum. Recorded in the header.
    pub fn with_header_checksum(mut self, enabled: bool) -> Self {
        self.header_checksum = enabled;
        self
    }

    /// Enables or disables the whole-volume checksum. Recorded in the header.
    ///
    /// The checksum is recomputed at every commit, which reads the entire
    /// volume, so it is intended for stores where corruption detection matters
    /// more than commit latency.
    pub fn with_volume_checksum(mut self, enabled: bool) -> Self {
        self.volume_checksum = enabled;
        self
    }

    /// Sets the number of per-segment record locks.
    ///
    /// The value is clamped to `1..=MAX_SEGMENT_COUNT` and rounded up to a
    /// power of two so the segment can be selected with a mask.
    pub fn with_segment_count(mut self, count: usize) -> Self {
        self.segment_count = count.clamp(1, MAX_SEGMENT_COUNT).next_power_of_two();
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn with_wal_buffer_size(mut self, bytes: usize) -> Self {
        self.wal_buffer_size = bytes.max(4096);
        self
    }

    pub fn header_checksum(&self) -> bool {
        self.header_checksum
    }

    pub fn volume_checksum(&self) -> bool {
        self.volume_checksum
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn sync_on_commit(&self) -> bool {
        self.sync_on_commit
    }

    pub fn wal_buffer_size(&self) -> usize {
        self.wal_buffer_size
    }
}

/// Volume backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    /// Growable heap buffer. Contents are lost when the store is dropped.
    Memory,

    /// Memory-mapped file at the given path.
    MappedFile(PathBuf),

    /// File accessed through positioned reads and writes.
    RandomAccessFile(PathBuf),
}

impl VolumeKind {
    pub fn mapped<P: Into<PathBuf>>(path: P) -> Self {
        VolumeKind::MappedFile(path.into())
    }

    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        VolumeKind::RandomAccessFile(path.into())
    }

    /// Returns the backing path, or `None` for in-memory volumes.
    pub fn path(&self) -> Option<&Path> {
        match self {
            VolumeKind::Memory => None,
            VolumeKind::MappedFile(path) | VolumeKind::RandomAccessFile(path) => Some(path),
        }
    }

    /// The same backend at `<path>.<suffix>`. In-memory volumes stay in memory.
    pub fn sibling(&self, suffix: &str) -> Self {
        let with_suffix = |path: &PathBuf| {
            let mut name = path.clone().into_os_string();
            name.push(".");
            name.push(suffix);
            PathBuf::from(name)
        };

        match self {
            VolumeKind::Memory => VolumeKind::Memory,
            VolumeKind::MappedFile(path) => VolumeKind::MappedFile(with_suffix(path)),
            VolumeKind::RandomAccessFile(path) => VolumeKind::RandomAccessFile(with_suffix(path)),
        }
    }
}
