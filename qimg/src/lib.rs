//! qimg - maintenance toolkit for QCOW2 disk images.
//!
//! Three operations over a single image file:
//! - [`inspect_size`] / [`inspect`] - allocated-size and header
//!   introspection (read-only, advisory)
//! - [`reclaim`] - rewrite the image into a fresh container, dropping
//!   unused space and optionally compressing retained data; atomic commit
//! - [`resize`] - grow the logical capacity, metadata-only
//!
//! Every operation either fully completes or leaves the original file
//! exactly as it was. The operations are blocking; callers schedule them
//! on their own worker (thread pool or async runtime) and must keep an
//! image exclusive for the duration of a call: one maintenance operation
//! per image at a time, never while a guest is attached.

pub mod drive;
pub mod errors;
pub mod maintain;
pub mod qcow2;

pub use errors::{ImageError, ImageResult};
pub use maintain::{CancelFlag, ImageInfo, ReclaimOptions, inspect, inspect_size, reclaim, resize};
