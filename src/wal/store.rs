//! # WAL-Backed Store
//!
//! `StoreWal` runs the record engine on a [`WalIo`] overlay. Mutations of
//! the open transaction are logged and buffered; the base volume changes
//! only at `commit`.
//!
//! ## Transaction States
//!
//! ```text
//!            first mutation             commit()
//!   Idle ───────────────────> Dirty ─────────────> Committing ──> Idle
//!     ▲                         │
//!     │                         │ rollback()
//!     └──── RollingBack <───────┘
//!
//!   open after a crash: committed log entries are replayed, then Idle
//! ```
//!
//! ## Commit Protocol
//!
//! 1. every segment lock, then the structural lock
//! 2. compute the checksums of the overlay view and log them
//! 3. append a commit marker, write out and sync the log
//! 4. replay the log onto the base volume, size it to the file tail, sync
//! 5. reset the log, drop the overlay
//!
//! A crash before step 3 completes leaves a log without a commit marker for
//! the transaction; reopening discards it. A crash after step 3 leaves a
//! committed log; reopening replays it again, which is harmless since every
//! entry writes absolute bytes.
//!
//! Either way, open checks the checksums of what it ends up with. After a
//! replay the stored values are the logged ones, so base damage outside the
//! replayed ranges is still reported as corruption.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use tracing::{debug, warn};

use super::log::{ReplayOutcome, WalHandler, WriteAheadLog};
use super::overlay::WalIo;
use crate::config::{
    StoreConfig, VolumeKind, HEAD_CHECKSUM, HEAD_FILE_TAIL, HEAD_VOLUME_CHECKSUM,
};
use crate::error::StoreError;
use crate::storage::header::{self, Features};
use crate::storage::io::StoreIo;
use crate::storage::{validate_header, Bucket, StoreCore, StoreType};
use crate::store::{Store, StoreStats};
use crate::volume::{MemoryVolume, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No uncommitted changes.
    Idle,
    /// The open transaction has buffered changes.
    Dirty,
    Committing,
    RollingBack,
}

const PHASE_IDLE: u8 = 0;
const PHASE_COMMITTING: u8 = 1;
const PHASE_ROLLING_BACK: u8 = 2;

struct PhaseGuard<'a>(&'a AtomicU8);

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a AtomicU8, value: u8) -> Self {
        phase.store(value, Ordering::Release);
        Self(phase)
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(PHASE_IDLE, Ordering::Release);
    }
}

/// Buffers replayed writes until their commit marker is seen.
struct Apply<F> {
    pending: Vec<(u64, Vec<u8>)>,
    apply: F,
    applied: u64,
}

impl<F> Apply<F>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    fn new(apply: F) -> Self {
        Self {
            pending: Vec::new(),
            apply,
            applied: 0,
        }
    }
}

impl<F> WalHandler for Apply<F>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    fn write_long(&mut self, offset: u64, value: u64) -> Result<()> {
        self.pending.push((offset, value.to_le_bytes().to_vec()));
        Ok(())
    }

    fn write_bytes(&mut self, _recid: u64, _wal_id: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.pending.push((offset, data.to_vec()));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        for (offset, data) in self.pending.drain(..) {
            (self.apply)(offset, &data)?;
            self.applied += 1;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

fn apply_to_base(base: &dyn Volume, offset: u64, data: &[u8]) -> Result<()> {
    base.ensure_available(offset + data.len() as u64)?;
    base.put_data(offset, data)
}

/// Sizes the base to exactly its recorded file tail. Bytes past the tail are
/// left over from a layout that compaction replaced.
fn settle_base(base: &dyn Volume, sync: bool) -> Result<()> {
    let file_tail = base.get_long(HEAD_FILE_TAIL)?;
    if base.length() > file_tail {
        base.truncate(file_tail)?;
    }
    base.ensure_available(file_tail)?;
    if sync {
        base.sync()?;
    }
    Ok(())
}

/// Logs the checksums the base will hold once the open transaction is
/// applied.
fn log_checksums(io: &WalIo, features: Features) -> Result<()> {
    let read = |offset: u64, buf: &mut [u8]| io.get_data(offset, buf);
    let file_tail = io.get_long(HEAD_FILE_TAIL)?;
    if features.volume_checksum() {
        io.put_long(HEAD_VOLUME_CHECKSUM, header::volume_checksum_with(read, file_tail)?)?;
    }
    if features.header_checksum() {
        let checksum = header::header_checksum_with(read)?;
        io.put_data(HEAD_CHECKSUM, 0, &checksum.to_le_bytes())?;
    }
    Ok(())
}

/// Checks the checksums of the store as `io` sees it.
fn verify_view(io: &WalIo, features: Features) -> Result<()> {
    let file_tail = io.get_long(HEAD_FILE_TAIL)?;
    if file_tail > io.length() {
        return Err(StoreError::corruption(format!(
            "file tail {file_tail} is past the end of the volume ({})",
            io.length()
        ))
        .into());
    }
    header::verify_checksums_with(
        |offset: u64, buf: &mut [u8]| io.get_data(offset, buf),
        features,
        file_tail,
    )
}

/// Replays committed log entries left by an earlier session into the
/// overlay and verifies the result. Only then, and only when writable, is
/// the log applied to the base volume, so a store refused as corrupt is
/// left as it was found.
fn recover(io: &WalIo, features: Features, read_only: bool) -> Result<ReplayOutcome> {
    let mut handler = Apply::new(|offset, data: &[u8]| io.apply_unlogged(offset, data));
    let outcome = io.log().replay(&mut handler)?;
    if outcome.commits > 0 {
        io.grow_unlogged(io.get_long(HEAD_FILE_TAIL)?);
    }
    verify_view(io, features)?;

    if outcome.commits > 0 {
        if !read_only {
            let base = io.volume();
            let mut handler =
                Apply::new(|offset, data: &[u8]| apply_to_base(&*base, offset, data));
            io.log().replay(&mut handler)?;
            settle_base(&*base, true)?;
            io.clear_overlay();
        }
        debug!(
            entries = outcome.entries,
            commits = outcome.commits,
            torn = outcome.torn,
            "WAL store recovered committed transactions"
        );
    } else if outcome.entries > 0 {
        debug!(entries = outcome.entries, "WAL store discarded an uncommitted transaction");
    }
    Ok(outcome)
}

pub struct StoreWal {
    core: StoreCore<WalIo>,
    kind: Option<VolumeKind>,
    sync_on_commit: bool,
    phase: AtomicU8,
    recovery: ReplayOutcome,
}

impl StoreWal {
    /// Opens the store at `kind`, with its log at the `wal` sibling.
    pub fn open(kind: VolumeKind, config: StoreConfig) -> Result<Self> {
        let volume = kind.open(config.read_only())?;
        let wal_kind = kind.sibling("wal");
        let wal: Arc<dyn Volume> = match wal_kind.path() {
            Some(path) if config.read_only() && !path.exists() => {
                Arc::new(MemoryVolume::from_bytes(Vec::new(), true))
            }
            _ => wal_kind.open(config.read_only())?,
        };
        Self::assemble(volume, wal, Some(kind), &config)
    }

    /// Opens the store over caller-provided volumes.
    pub fn with_volumes(
        volume: Arc<dyn Volume>,
        wal: Arc<dyn Volume>,
        config: StoreConfig,
    ) -> Result<Self> {
        Self::assemble(volume, wal, None, &config)
    }

    fn assemble(
        volume: Arc<dyn Volume>,
        wal: Arc<dyn Volume>,
        kind: Option<VolumeKind>,
        config: &StoreConfig,
    ) -> Result<Self> {
        let read_only = config.read_only() || volume.is_read_only();
        let config = config.clone().with_read_only(read_only);
        let log = WriteAheadLog::open(wal, config.wal_buffer_size(), read_only)?;
        let io = WalIo::new(Arc::clone(&volume), log);

        let (core, recovery) = if volume.length() == 0 {
            if read_only {
                bail!("cannot create a store on a read-only volume");
            }
            if !io.log().is_empty() {
                warn!("discarding a write-ahead log without a store volume");
                io.log().reset()?;
            }
            let core = StoreCore::create(io, StoreType::Wal, &config)?;
            volume.sync()?;
            (core, ReplayOutcome::default())
        } else {
            let features = validate_header(&*volume, StoreType::Wal, &config)?;
            let recovery = recover(&io, features, read_only)?;
            if !read_only && !io.log().is_empty() {
                io.log().reset()?;
            }
            (
                StoreCore::assemble(io, StoreType::Wal, features, &config)?,
                recovery,
            )
        };

        Ok(Self {
            core,
            kind,
            sync_on_commit: config.sync_on_commit(),
            phase: AtomicU8::new(PHASE_IDLE),
            recovery,
        })
    }

    pub fn tx_state(&self) -> TxState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_COMMITTING => TxState::Committing,
            PHASE_ROLLING_BACK => TxState::RollingBack,
            _ if self.core.io.is_dirty() => TxState::Dirty,
            _ => TxState::Idle,
        }
    }

    /// What opening the store replayed from the log.
    pub fn recovery(&self) -> ReplayOutcome {
        self.recovery
    }

    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }

    /// Commit body. Callers hold every segment lock and the structural lock.
    fn commit_locked(&self) -> Result<()> {
        let io = &self.core.io;
        if !io.is_dirty() && io.log().is_empty() {
            return Ok(());
        }
        let _phase = PhaseGuard::enter(&self.phase, PHASE_COMMITTING);

        log_checksums(io, self.core.features)?;
        io.log().log_commit(self.sync_on_commit)?;
        let base = io.volume();
        let mut handler = Apply::new(|offset, data: &[u8]| apply_to_base(&*base, offset, data));
        io.log().replay(&mut handler)?;
        settle_base(&*base, self.sync_on_commit)?;

        io.log().reset()?;
        io.clear_overlay();
        debug!(writes = handler.applied, "WAL store committed");
        Ok(())
    }

    pub fn debug_long_stack_values(&self, bucket: Bucket) -> Result<Vec<u64>> {
        self.core.long_stack_values(bucket)
    }

    pub fn debug_max_recid(&self) -> u64 {
        self.core.max_recid()
    }
}

impl Store for StoreWal {
    fn put(&self, data: &[u8]) -> Result<u64> {
        self.core.put(data)
    }

    fn get(&self, recid: u64) -> Result<Option<Vec<u8>>> {
        self.core.get(recid)
    }

    fn update(&self, recid: u64, data: &[u8]) -> Result<()> {
        self.core.update(recid, data)
    }

    fn delete(&self, recid: u64) -> Result<()> {
        self.core.delete(recid)
    }

    fn compare_and_swap_by(
        &self,
        recid: u64,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        eq: &dyn Fn(Option<&[u8]>, Option<&[u8]>) -> bool,
    ) -> Result<bool> {
        self.core.compare_and_swap_by(recid, expected, new, eq)
    }

    fn preallocate(&self) -> Result<u64> {
        self.core.preallocate()
    }

    fn commit(&self) -> Result<()> {
        self.core.check_writable()?;
        let _segments = self.core.segments.write_all();
        let _state = self.core.structural.lock();
        self.commit_locked()
    }

    fn rollback(&self) -> Result<()> {
        self.core.check_writable()?;
        let _segments = self.core.segments.write_all();
        let mut state = self.core.structural.lock();
        let _phase = PhaseGuard::enter(&self.phase, PHASE_ROLLING_BACK);

        self.core.io.clear_overlay();
        self.core.io.log().reset()?;
        self.core.reload(&mut state)?;
        debug!(max_recid = state.max_recid, "WAL store rolled back");
        Ok(())
    }

    /// Commits the open transaction, then compacts.
    fn compact(&self) -> Result<()> {
        self.core.check_writable()?;
        let _segments = self.core.segments.write_all();
        let mut state = self.core.structural.lock();
        self.commit_locked()?;
        self.core.compact_locked(self.kind.as_ref(), &mut state)
    }

    fn verify(&self) -> Result<()> {
        self.core.verify()
    }

    fn get_all_recids(&self) -> Result<Box<dyn Iterator<Item = Result<u64>> + '_>> {
        Ok(Box::new(self.core.recids()?))
    }

    /// Uncommitted changes are discarded.
    fn close(&self) -> Result<()> {
        if !self.core.mark_closed() {
            return Ok(());
        }
        if self.core.io.is_dirty() {
            warn!("closing WAL store with uncommitted changes, they are discarded");
        }
        debug!("WAL store closed");
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.core.stats()
    }

    fn calculate_free_size(&self) -> Result<u64> {
        self.core.calculate_free_size()
    }

    fn tracked_free_size(&self) -> u64 {
        self.core.tracked_free_size()
    }
}

impl Drop for StoreWal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close WAL store: {e:#}");
        }
    }
}
