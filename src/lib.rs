//! # recstore - Embedded Record Store
//!
//! recstore persists variable-length byte records behind stable 64-bit
//! identifiers (recids) on a flat, page-organized volume. Collections such
//! as ordered trees or queues are built on top of its primitive operations
//! and never touch the layout directly.
//!
//! ## Quick Start
//!
//! ```ignore
//! use recstore::{Store, StoreConfig, StoreWal, VolumeKind};
//!
//! let store = StoreWal::open(VolumeKind::file("./records.db"), StoreConfig::default())?;
//!
//! let recid = store.put(b"hello")?;
//! store.commit()?;
//!
//! assert_eq!(store.get(recid)?.as_deref(), Some(&b"hello"[..]));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Store trait (put/get/cas/..)     │
//! ├────────────────────┬────────────────────┤
//! │    StoreDirect     │     StoreWal       │
//! │                    │  log + overlay     │
//! ├────────────────────┴────────────────────┤
//! │  Record engine: index table, linked     │
//! │  records, segment locks, compaction     │
//! ├─────────────────────────────────────────┤
//! │  Allocator: long-stack free lists       │
//! ├─────────────────────────────────────────┤
//! │  Volume: memory │ mmap │ random access  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants, `StoreConfig`, `VolumeKind`
//! - [`error`]: `StoreError` kinds carried inside `eyre::Report`
//! - [`volume`]: the `Volume` trait and its three backends
//! - `storage`: header, index table, long stacks, allocator, record engine
//! - [`store`]: the `Store` contract and `StoreStats`
//! - `direct`: `StoreDirect`, writes straight to the volume
//! - [`wal`]: write-ahead log and `StoreWal`
//!
//! ## Durability
//!
//! `StoreWal` survives a process kill at any point: reopening replays the
//! committed part of the log and discards the rest. `StoreDirect` is only
//! consistent after `commit` or `close`.

mod macros;

pub mod config;
mod direct;
pub mod error;
mod storage;
pub mod store;
pub mod volume;
pub mod wal;

pub use config::{StoreConfig, VolumeKind};
pub use direct::StoreDirect;
pub use error::{StoreError, StoreErrorExt};
pub use storage::{Bucket, LockStats, StoreType};
pub use store::{Store, StoreStats};
pub use volume::{FileVolume, MemoryVolume, MmapVolume, Volume};
pub use wal::{StoreWal, TxState};
