//! QCOW2 container format codec.
//!
//! This module provides the block-level pieces the maintenance operations
//! orchestrate:
//! - `Qcow2Header` - v3 header parse/serialize
//! - `Qcow2Image` - backing-chain reader with compressed cluster support
//! - `Qcow2Writer` - streaming standalone image writer
//! - `create_image` / `create_overlay` - new image formatting

pub mod constants;
mod create;
mod header;
mod image;
mod writer;

pub use create::{BackingFormat, create_image, create_overlay};
pub use header::Qcow2Header;
pub use image::Qcow2Image;
pub use writer::Qcow2Writer;
