//! # Write-Ahead Log File
//!
//! An append-only log of volume writes, kept on its own volume next to the
//! store (`<path>.wal`).
//!
//! ## File Format
//!
//! ```text
//! +----------------------+-------+-------+-----+--------+-------+-----+
//! | header (16 bytes)    | entry | entry | ... | commit | entry | ... |
//! | magic|version|gen    |       |       |     |        |       |     |
//! +----------------------+-------+-------+-----+--------+-------+-----+
//! ```
//!
//! ## Entry Format
//!
//! | Kind     | Layout                                                        |
//! |----------|---------------------------------------------------------------|
//! | `Long`   | tag 1, offset u64, value u64, crc u32                         |
//! | `Bytes`  | tag 2, recid u64, wal id u64, offset u64, len u32, data, crc  |
//! | `Commit` | tag 3, crc u32                                                |
//!
//! The CRC-32 covers the log generation followed by the entry bytes, so an
//! entry left behind by an earlier generation never validates after a reset.
//!
//! ## Replay
//!
//! Replay reads entries front to back and stops at the first zero tag,
//! short read, unknown tag or CRC mismatch. Everything before that point is
//! the valid log; anything after is a torn tail and is dropped. Entries are
//! delivered to a [`WalHandler`] in append order, with `commit` at every
//! commit marker and a final `rollback` if entries follow the last one.
//!
//! ## Buffering
//!
//! Appends go to an in-memory buffer that is written to the volume once it
//! exceeds the configured size, on `flush`, and always on `log_commit`.

use std::sync::Arc;

use crc::{Crc, Digest, CRC_32_ISCSI};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::WAL_HEADER_SIZE;
use crate::error::StoreError;
use crate::macros::le_getters;
use crate::volume::Volume;

pub const WAL_MAGIC: u32 = 0x4C57_4352;
pub const WAL_VERSION: u32 = 1;

const TAG_LONG: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_COMMIT: u8 = 3;

const CRC_SIZE: usize = 4;
const LONG_BODY: usize = 16;
const BYTES_PREFIX: usize = 28;

static ENTRY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalHeader {
    magic: U32,
    version: U32,
    generation: U64,
}

const _: () = assert!(std::mem::size_of::<WalHeader>() as u64 == WAL_HEADER_SIZE);

impl WalHeader {
    fn new(generation: u64) -> Self {
        Self {
            magic: U32::new(WAL_MAGIC),
            version: U32::new(WAL_VERSION),
            generation: U64::new(generation),
        }
    }

    le_getters! {
        magic: u32,
        version: u32,
        generation: u64,
    }
}

/// Receives replayed entries.
pub trait WalHandler {
    fn write_long(&mut self, offset: u64, value: u64) -> Result<()>;

    fn write_bytes(&mut self, recid: u64, wal_id: u64, offset: u64, data: &[u8]) -> Result<()>;

    /// Everything delivered since the previous commit belongs to a committed
    /// transaction.
    fn commit(&mut self) -> Result<()>;

    /// Everything delivered since the previous commit was never committed.
    fn rollback(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// `Long` and `Bytes` entries read, committed or not.
    pub entries: u64,
    pub commits: u64,
    /// Log offset just past the last valid entry.
    pub valid_end: u64,
    /// Replay stopped on a damaged entry rather than a clean end.
    pub torn: bool,
}

#[derive(Debug)]
struct LogState {
    generation: u64,
    /// Volume offset where the next buffered byte will land.
    tail: u64,
    buffer: Vec<u8>,
    next_wal_id: u64,
}

#[derive(Debug)]
pub struct WriteAheadLog {
    volume: Arc<dyn Volume>,
    buffer_size: usize,
    read_only: bool,
    state: Mutex<LogState>,
}

fn seeded_digest(generation: u64) -> Digest<'static, u32> {
    let mut digest = ENTRY_CRC.digest();
    digest.update(&generation.to_le_bytes());
    digest
}

impl WriteAheadLog {
    /// Opens the log on `volume`, writing a fresh header if it is empty. The
    /// append position is set after the last valid entry; unless `read_only`
    /// a torn tail is cut off.
    pub fn open(volume: Arc<dyn Volume>, buffer_size: usize, read_only: bool) -> Result<Self> {
        let read_only = read_only || volume.is_read_only();
        let generation = if volume.length() < WAL_HEADER_SIZE {
            if read_only {
                0
            } else {
                write_header(&*volume, 1)?;
                volume.sync()?;
                1
            }
        } else {
            let mut buf = [0u8; WAL_HEADER_SIZE as usize];
            volume.get_data(0, &mut buf)?;
            let header = WalHeader::read_from_bytes(&buf)
                .map_err(|e| eyre::eyre!("failed to parse WAL header: {:?}", e))?;
            if header.magic() != WAL_MAGIC || header.version() != WAL_VERSION {
                return Err(StoreError::UnsupportedFormat(format!(
                    "WAL header magic {:#010x} version {}",
                    header.magic(),
                    header.version()
                ))
                .into());
            }
            header.generation()
        };

        let log = Self {
            volume,
            buffer_size,
            read_only,
            state: Mutex::new(LogState {
                generation,
                tail: WAL_HEADER_SIZE,
                buffer: Vec::new(),
                next_wal_id: 1,
            }),
        };

        let outcome = log.scan(&mut Discard)?;
        {
            let mut state = log.state.lock();
            state.tail = outcome.valid_end;
        }
        if outcome.torn {
            warn!(valid_end = outcome.valid_end, "WAL has a torn tail");
        }
        if !read_only && log.volume.length() > outcome.valid_end {
            log.volume.truncate(outcome.valid_end)?;
        }
        debug!(
            generation,
            entries = outcome.entries,
            commits = outcome.commits,
            "WAL opened"
        );
        Ok(log)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// True when nothing has been logged since the last reset.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.tail <= WAL_HEADER_SIZE && state.buffer.is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly.into());
        }
        Ok(())
    }

    fn append(&self, state: &mut LogState, entry: &[u8]) -> Result<()> {
        let mut digest = seeded_digest(state.generation);
        digest.update(entry);
        state.buffer.extend_from_slice(entry);
        state.buffer.extend_from_slice(&digest.finalize().to_le_bytes());
        if state.buffer.len() >= self.buffer_size {
            self.flush_locked(state)?;
        }
        Ok(())
    }

    pub fn log_long(&self, offset: u64, value: u64) -> Result<()> {
        self.check_writable()?;
        let mut entry = [0u8; 1 + LONG_BODY];
        entry[0] = TAG_LONG;
        entry[1..9].copy_from_slice(&offset.to_le_bytes());
        entry[9..17].copy_from_slice(&value.to_le_bytes());
        let mut state = self.state.lock();
        self.append(&mut state, &entry)
    }

    /// Logs a byte-range write and returns the WAL id assigned to it.
    pub fn log_bytes(&self, recid: u64, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let len = u32::try_from(data.len())
            .map_err(|_| eyre::eyre!("WAL byte entry of {} bytes is too large", data.len()))?;
        let mut state = self.state.lock();
        let wal_id = state.next_wal_id;
        state.next_wal_id += 1;

        let mut entry = Vec::with_capacity(1 + BYTES_PREFIX + data.len());
        entry.push(TAG_BYTES);
        entry.extend_from_slice(&recid.to_le_bytes());
        entry.extend_from_slice(&wal_id.to_le_bytes());
        entry.extend_from_slice(&offset.to_le_bytes());
        entry.extend_from_slice(&len.to_le_bytes());
        entry.extend_from_slice(data);
        self.append(&mut state, &entry)?;
        Ok(wal_id)
    }

    /// Appends a commit marker and writes the buffer out, syncing the log
    /// volume when `sync` is set.
    pub fn log_commit(&self, sync: bool) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        self.append(&mut state, &[TAG_COMMIT])?;
        self.flush_locked(&mut state)?;
        if sync {
            self.volume.sync()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut LogState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let end = state.tail + state.buffer.len() as u64;
        self.volume.ensure_available(end)?;
        self.volume
            .put_data(state.tail, &state.buffer)
            .wrap_err_with(|| format!("failed to write WAL at offset {}", state.tail))?;
        trace!(offset = state.tail, len = state.buffer.len(), "WAL buffer written");
        state.tail = end;
        state.buffer.clear();
        Ok(())
    }

    /// Starts a new generation and drops every entry.
    pub fn reset(&self) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        write_header(&*self.volume, generation)?;
        self.volume.truncate(WAL_HEADER_SIZE)?;
        self.volume.sync()?;
        state.generation = generation;
        state.tail = WAL_HEADER_SIZE;
        state.buffer.clear();
        state.next_wal_id = 1;
        trace!(generation, "WAL reset");
        Ok(())
    }

    /// Writes out buffered entries, then feeds the log to `handler`.
    pub fn replay(&self, handler: &mut dyn WalHandler) -> Result<ReplayOutcome> {
        self.flush()?;
        let outcome = self.scan(handler)?;
        debug!(
            entries = outcome.entries,
            commits = outcome.commits,
            torn = outcome.torn,
            "WAL replayed"
        );
        Ok(outcome)
    }

    fn scan(&self, handler: &mut dyn WalHandler) -> Result<ReplayOutcome> {
        let generation = self.state.lock().generation;
        let end = self.volume.length();
        let mut reader = Reader {
            volume: &*self.volume,
            pos: WAL_HEADER_SIZE,
            end,
        };
        let mut outcome = ReplayOutcome {
            valid_end: WAL_HEADER_SIZE.min(end),
            ..Default::default()
        };
        if end < WAL_HEADER_SIZE {
            return Ok(outcome);
        }

        let mut pending = false;
        loop {
            match reader.next_entry(generation)? {
                Step::End => break,
                Step::Torn => {
                    outcome.torn = true;
                    break;
                }
                Step::Entry(entry) => {
                    match entry {
                        Entry::Long { offset, value } => {
                            handler.write_long(offset, value)?;
                            outcome.entries += 1;
                            pending = true;
                        }
                        Entry::Bytes {
                            recid,
                            wal_id,
                            offset,
                            data,
                        } => {
                            handler.write_bytes(recid, wal_id, offset, &data)?;
                            outcome.entries += 1;
                            pending = true;
                        }
                        Entry::Commit => {
                            handler.commit()?;
                            outcome.commits += 1;
                            pending = false;
                        }
                    }
                    outcome.valid_end = reader.pos;
                }
            }
        }
        if pending {
            handler.rollback()?;
        }
        Ok(outcome)
    }
}

fn write_header(volume: &dyn Volume, generation: u64) -> Result<()> {
    volume.ensure_available(WAL_HEADER_SIZE)?;
    volume.put_data(0, WalHeader::new(generation).as_bytes())
}

enum Entry {
    Long {
        offset: u64,
        value: u64,
    },
    Bytes {
        recid: u64,
        wal_id: u64,
        offset: u64,
        data: Vec<u8>,
    },
    Commit,
}

enum Step {
    Entry(Entry),
    End,
    Torn,
}

struct Reader<'a> {
    volume: &'a dyn Volume,
    pos: u64,
    end: u64,
}

impl Reader<'_> {
    /// Reads `buf.len()` bytes at the cursor. Returns false on a short read.
    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        if self.pos + buf.len() as u64 > self.end {
            return Ok(false);
        }
        self.volume.get_data(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(true)
    }

    fn check_crc(&mut self, digest: Digest<'_, u32>) -> Result<bool> {
        let mut crc = [0u8; CRC_SIZE];
        if !self.read(&mut crc)? {
            return Ok(false);
        }
        Ok(digest.finalize() == u32::from_le_bytes(crc))
    }

    fn next_entry(&mut self, generation: u64) -> Result<Step> {
        let start = self.pos;
        let mut tag = [0u8; 1];
        if !self.read(&mut tag)? {
            return Ok(Step::End);
        }
        let mut digest = seeded_digest(generation);
        digest.update(&tag);

        let entry = match tag[0] {
            0 => {
                self.pos = start;
                return Ok(Step::End);
            }
            TAG_LONG => {
                let mut body = [0u8; LONG_BODY];
                if !self.read(&mut body)? {
                    return Ok(Step::Torn);
                }
                digest.update(&body);
                Entry::Long {
                    offset: le_u64(&body[0..8]),
                    value: le_u64(&body[8..16]),
                }
            }
            TAG_BYTES => {
                let mut prefix = [0u8; BYTES_PREFIX];
                if !self.read(&mut prefix)? {
                    return Ok(Step::Torn);
                }
                let len = u32::from_le_bytes([prefix[24], prefix[25], prefix[26], prefix[27]]);
                if self.pos + len as u64 > self.end {
                    return Ok(Step::Torn);
                }
                let mut data = vec![0u8; len as usize];
                self.read(&mut data)?;
                digest.update(&prefix);
                digest.update(&data);
                Entry::Bytes {
                    recid: le_u64(&prefix[0..8]),
                    wal_id: le_u64(&prefix[8..16]),
                    offset: le_u64(&prefix[16..24]),
                    data,
                }
            }
            TAG_COMMIT => Entry::Commit,
            _ => return Ok(Step::Torn),
        };

        if self.check_crc(digest)? {
            Ok(Step::Entry(entry))
        } else {
            Ok(Step::Torn)
        }
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

struct Discard;

impl WalHandler for Discard {
    fn write_long(&mut self, _offset: u64, _value: u64) -> Result<()> {
        Ok(())
    }

    fn write_bytes(&mut self, _recid: u64, _wal_id: u64, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryVolume;

    #[derive(Debug, Default)]
    struct Recorder {
        pending: Vec<String>,
        committed: Vec<String>,
        rollbacks: usize,
    }

    impl WalHandler for Recorder {
        fn write_long(&mut self, offset: u64, value: u64) -> Result<()> {
            self.pending.push(format!("long {offset}={value}"));
            Ok(())
        }

        fn write_bytes(&mut self, recid: u64, wal_id: u64, offset: u64, data: &[u8]) -> Result<()> {
            self.pending
                .push(format!("bytes r{recid} w{wal_id} {offset}={data:?}"));
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.committed.append(&mut self.pending);
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.pending.clear();
            self.rollbacks += 1;
            Ok(())
        }
    }

    fn open(volume: &Arc<MemoryVolume>) -> WriteAheadLog {
        WriteAheadLog::open(Arc::clone(volume) as Arc<dyn Volume>, 4096, false).unwrap()
    }

    #[test]
    fn entries_replay_in_append_order() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        log.log_long(24, 7).unwrap();
        assert_eq!(log.log_bytes(3, 4096, b"abc").unwrap(), 1);
        assert_eq!(log.log_bytes(3, 8192, b"d").unwrap(), 2);
        log.log_commit(true).unwrap();

        let mut recorder = Recorder::default();
        let outcome = log.replay(&mut recorder).unwrap();

        assert_eq!(outcome.entries, 3);
        assert_eq!(outcome.commits, 1);
        assert!(!outcome.torn);
        assert_eq!(
            recorder.committed,
            vec![
                "long 24=7".to_string(),
                "bytes r3 w1 4096=[97, 98, 99]".to_string(),
                "bytes r3 w2 8192=[100]".to_string(),
            ]
        );
        assert_eq!(recorder.rollbacks, 0);
    }

    #[test]
    fn entries_after_last_commit_are_rolled_back() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        log.log_long(24, 1).unwrap();
        log.log_commit(true).unwrap();
        log.log_long(24, 2).unwrap();
        log.flush().unwrap();

        let mut recorder = Recorder::default();
        let outcome = log.replay(&mut recorder).unwrap();

        assert_eq!(outcome.entries, 2);
        assert_eq!(recorder.committed, vec!["long 24=1".to_string()]);
        assert_eq!(recorder.rollbacks, 1);
    }

    #[test]
    fn torn_tail_is_trimmed_on_open() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        log.log_long(24, 1).unwrap();
        log.log_commit(true).unwrap();
        let committed_end = volume.length();
        log.log_bytes(1, 4096, &[5u8; 100]).unwrap();
        log.flush().unwrap();
        drop(log);

        volume.truncate(volume.length() - 10).unwrap();
        let log = open(&volume);

        assert_eq!(volume.length(), committed_end);
        let mut recorder = Recorder::default();
        let outcome = log.replay(&mut recorder).unwrap();
        assert_eq!(outcome.commits, 1);
        assert_eq!(recorder.committed, vec!["long 24=1".to_string()]);
    }

    #[test]
    fn flipped_bit_ends_replay() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        log.log_long(24, 1).unwrap();
        log.log_commit(true).unwrap();
        log.log_long(32, 2).unwrap();
        log.log_commit(true).unwrap();
        drop(log);

        // second Long entry starts after: first Long (21) + Commit (5)
        let offset = WAL_HEADER_SIZE + 21 + 5 + 3;
        let byte = volume.get_byte(offset).unwrap();
        volume.put_byte(offset, byte ^ 0x10).unwrap();

        let log = open(&volume);
        let mut recorder = Recorder::default();
        log.replay(&mut recorder).unwrap();
        assert_eq!(recorder.committed, vec!["long 24=1".to_string()]);
    }

    #[test]
    fn reset_bumps_generation_and_empties_log() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        assert!(log.is_empty());
        log.log_long(24, 1).unwrap();
        log.log_commit(true).unwrap();
        assert!(!log.is_empty());

        log.reset().unwrap();

        assert!(log.is_empty());
        assert_eq!(log.generation(), 2);
        assert_eq!(volume.length(), WAL_HEADER_SIZE);
        assert_eq!(open(&volume).generation(), 2);
    }

    #[test]
    fn stale_generation_entries_do_not_validate() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        log.log_long(24, 1).unwrap();
        log.log_commit(true).unwrap();
        let image = volume.to_bytes();

        // Put the old entries back behind a newer header.
        log.reset().unwrap();
        volume.truncate(image.len() as u64).unwrap();
        volume
            .put_data(WAL_HEADER_SIZE, &image[WAL_HEADER_SIZE as usize..])
            .unwrap();

        let log = open(&volume);
        assert_eq!(volume.length(), WAL_HEADER_SIZE);
        let mut recorder = Recorder::default();
        let outcome = log.replay(&mut recorder).unwrap();
        assert_eq!(outcome.entries, 0);
        assert_eq!(outcome.commits, 0);
        assert!(recorder.committed.is_empty());
    }

    #[test]
    fn foreign_header_is_unsupported() {
        let volume = Arc::new(MemoryVolume::new());
        volume.ensure_available(WAL_HEADER_SIZE).unwrap();
        volume.put_int(0, 0xDEAD_BEEF).unwrap();

        let err = WriteAheadLog::open(volume as Arc<dyn Volume>, 4096, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn read_only_log_keeps_torn_tail_and_rejects_appends() {
        let volume = Arc::new(MemoryVolume::new());
        let log = open(&volume);
        log.log_long(24, 1).unwrap();
        log.log_commit(true).unwrap();
        volume.ensure_available(volume.length() + 7).unwrap();
        volume.put_byte(volume.length() - 7, TAG_LONG).unwrap();
        let length = volume.length();
        drop(log);

        let log = WriteAheadLog::open(Arc::clone(&volume) as Arc<dyn Volume>, 4096, true).unwrap();

        assert_eq!(volume.length(), length);
        let err = log.log_long(24, 2).unwrap_err();
        assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::ReadOnly));
        let mut recorder = Recorder::default();
        let outcome = log.replay(&mut recorder).unwrap();
        assert!(outcome.torn);
        assert_eq!(recorder.committed, vec!["long 24=1".to_string()]);
    }

    #[test]
    fn small_buffer_spills_before_commit() {
        let volume = Arc::new(MemoryVolume::new());
        let log = WriteAheadLog::open(Arc::clone(&volume) as Arc<dyn Volume>, 64, false).unwrap();
        for i in 0..8 {
            log.log_long(24, i).unwrap();
        }

        assert!(volume.length() > WAL_HEADER_SIZE);
    }
}
