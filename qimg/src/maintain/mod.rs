//! Disk image maintenance operations.
//!
//! The three externally visible operations:
//! - `inspect_size` / `inspect` - allocated-size and header introspection
//! - `reclaim` - rewrite the image, dropping unused space, optionally
//!   compressing retained data
//! - `resize` - grow the logical capacity in place
//!
//! All of them are blocking and should run on a background worker. None
//! take locks: the caller enforces that at most one maintenance operation
//! runs per image and that no guest is attached. Distinct images may be
//! maintained concurrently.

mod inspect;
mod reclaim;
mod resize;

pub use inspect::{ImageInfo, inspect, inspect_size};
pub use reclaim::{CancelFlag, ReclaimOptions, reclaim};
pub use resize::resize;
