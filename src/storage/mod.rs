//! # Storage Layer
//!
//! Everything that gives bytes on a volume their meaning lives here: the
//! header, the index table, the long-stack free lists, the allocator, the
//! record layout and the record engine shared by both stores.
//!
//! ## Volume Layout
//!
//! ```text
//! page 0                        page 1..n (in allocation order)
//! +--------+--------------+     +------------------+  +------------------+
//! | header | zero index   |     | index page       |  | data page        |
//! | 32848 B| page (slots) |     | 16 B hdr + slots |  | records, stack   |
//! +--------+--------------+     +------------------+  | pages, free gaps |
//!                                                     +------------------+
//! ```
//!
//! Index pages and data pages interleave in the order they were needed. The
//! file tail is always a page boundary; the data tail points into the page
//! currently being filled.
//!
//! ## Module Organization
//!
//! | Module       | Role                                                    |
//! |--------------|---------------------------------------------------------|
//! | `parity`     | parity tags for persisted words                         |
//! | `header`     | header prefix, feature bits, checksums                  |
//! | `index`      | slot encoding, recid to offset mapping                  |
//! | `long_stack` | persisted LIFO buckets                                  |
//! | `allocator`  | tails, recids, space buckets, free-size accounting      |
//! | `record`     | single and linked payload layout                        |
//! | `segments`   | per-segment record locks                                |
//! | `io`         | volume access seam between engine and WAL overlay       |
//! | `engine`     | put/get/update/delete/CAS over any `StoreIo`            |
//! | `compact`    | dense rebuild and swap                                  |
//! | `verify`     | structural consistency walk                             |

mod allocator;
mod compact;
mod engine;
pub(crate) mod header;
mod index;
pub(crate) mod io;
pub(crate) mod long_stack;
mod parity;
mod record;
mod segments;
mod verify;

pub(crate) use self::engine::{validate_header, verify_checksums, StoreCore};
pub use header::StoreType;
pub use long_stack::Bucket;
pub use segments::LockStats;
