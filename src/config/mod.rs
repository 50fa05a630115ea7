//! # Store Configuration Module
//!
//! Layout constants and the runtime `StoreConfig`. Constants that depend on
//! each other are co-located in [`constants`] and their relationships are
//! checked at compile time.
//!
//! ## Module Organization
//!
//! - [`constants`]: page geometry, size classes, long-stack and WAL sizing
//! - `store_config`: options chosen when a store is opened, and the volume
//!   backend selector `VolumeKind`

pub mod constants;
mod store_config;

pub use constants::*;
pub use store_config::{StoreConfig, VolumeKind};
