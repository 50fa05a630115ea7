//! # Store Error Kinds
//!
//! Every public operation returns `eyre::Result`. The failures a caller may
//! need to tell apart are raised as a [`StoreError`] inside the report, so
//! they can be recovered with a downcast:
//!
//! ```ignore
//! match store.get(recid) {
//!     Err(e) if e.is_void_access() => { /* recid not allocated */ }
//!     other => other?,
//! }
//! ```
//!
//! ## Propagation
//!
//! - `VoidAccess` is ordinary control flow (absence checks) and is never
//!   logged as an error.
//! - `DataCorruption`, `WrongConfiguration` and `UnsupportedFormat` are never
//!   retried; retrying cannot repair the volume.
//! - A torn WAL tail is not an error at all: replay trims it and continues.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Get, update or delete of a recid whose slot is empty or was never allocated.
    #[error("recid {recid} does not refer to an allocated record")]
    VoidAccess { recid: u64 },

    /// Parity mismatch, header checksum or volume checksum failure.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Store reopened with options incompatible with how it was created.
    #[error("wrong configuration: {0}")]
    WrongConfiguration(String),

    /// Unknown feature bit or foreign magic byte.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Bulk input was not delivered in ascending key order.
    #[error("input is not sorted in ascending order")]
    NotSorted,

    #[error("store is opened read-only")]
    ReadOnly,

    #[error("store is closed")]
    Closed,

    #[error("rollback requires a write-ahead-log store")]
    RollbackUnsupported,
}

impl StoreError {
    pub fn corruption(message: impl Into<String>) -> Self {
        StoreError::DataCorruption(message.into())
    }

    /// True for the kinds that mean the volume cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::DataCorruption(_)
                | StoreError::WrongConfiguration(_)
                | StoreError::UnsupportedFormat(_)
        )
    }
}

/// Downcast helpers for reports produced by this crate.
pub trait StoreErrorExt {
    fn store_error(&self) -> Option<&StoreError>;

    fn is_void_access(&self) -> bool {
        matches!(self.store_error(), Some(StoreError::VoidAccess { .. }))
    }

    fn is_corruption(&self) -> bool {
        matches!(self.store_error(), Some(StoreError::DataCorruption(_)))
    }
}

impl StoreErrorExt for eyre::Report {
    fn store_error(&self) -> Option<&StoreError> {
        self.downcast_ref::<StoreError>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn void_access_survives_report_round_trip() {
        let report: eyre::Report = StoreError::VoidAccess { recid: 7 }.into();

        assert!(report.is_void_access());
        assert!(!report.is_corruption());
        assert_eq!(
            report.store_error(),
            Some(&StoreError::VoidAccess { recid: 7 })
        );
    }

    #[test]
    fn plain_reports_have_no_store_error() {
        let report = eyre::eyre!("disk full");

        assert!(report.store_error().is_none());
        assert!(!report.is_void_access());
    }

    #[test]
    fn fatal_kinds() {
        assert!(StoreError::corruption("bad parity").is_fatal());
        assert!(StoreError::UnsupportedFormat("bit 7".into()).is_fatal());
        assert!(!StoreError::VoidAccess { recid: 1 }.is_fatal());
        assert!(!StoreError::ReadOnly.is_fatal());
    }
}
