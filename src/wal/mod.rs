//! # Write-Ahead Logging
//!
//! Crash-safe commit and rollback for the record store.
//!
//! ## Module Organization
//!
//! | Module    | Role                                                        |
//! |-----------|-------------------------------------------------------------|
//! | `log`     | append-only log file, entry framing, replay                 |
//! | `overlay` | `StoreIo` that logs writes and buffers them copy-on-write   |
//! | `store`   | `StoreWal`: commit, rollback, recovery on open              |
//!
//! The log is usable on its own: [`WriteAheadLog::replay`] hands entries to
//! any [`WalHandler`].

mod log;
mod overlay;
mod store;

pub use log::{ReplayOutcome, WalHandler, WriteAheadLog, WAL_MAGIC, WAL_VERSION};
pub use store::{StoreWal, TxState};
