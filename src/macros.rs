//! # Internal Macros
//!
//! ## le_getters!
//!
//! Generates getters for fields of the on-volume header structs. Multi-byte
//! fields are zerocopy little-endian wrappers (`U32`, `U64`); single-byte
//! fields are plain `u8`. The structs are built whole by their constructors,
//! so no setters are generated.
//!
//! ```ignore
//! #[repr(C)]
//! struct WalFileHeader {
//!     magic: U32,
//!     version: u8,
//! }
//!
//! impl WalFileHeader {
//!     le_getters! {
//!         magic: u32,
//!         version: u8,
//!     }
//! }
//!
//! // Generates:
//! // pub fn magic(&self) -> u32 { self.magic.get() }
//! // pub fn version(&self) -> u8 { self.version }
//! ```

macro_rules! le_getters {
    (@impl $field:ident, u8) => {
        #[inline]
        pub fn $field(&self) -> u8 {
            self.$field
        }
    };
    (@impl $field:ident, $native:ty) => {
        #[inline]
        pub fn $field(&self) -> $native {
            self.$field.get()
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            le_getters!(@impl $field, $ty);
        )*
    };
}

pub(crate) use le_getters;
