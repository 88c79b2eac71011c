//! Error types for disk image maintenance.
//!
//! Every operation surfaces its failure cause verbatim; nothing retries
//! internally. A failed operation leaves the original image file exactly
//! as it was before the call.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ImageResult<T> = Result<T, ImageError>;

/// Failure causes for disk image maintenance operations.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The image path does not exist.
    #[error("disk image not found: {0}")]
    NotFound(PathBuf),

    /// Filesystem access failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Not enough free space in the image's filesystem for the temporary copy.
    #[error("insufficient space: {0}")]
    InsufficientSpace(String),

    /// The source container is malformed or uses an unsupported layout.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Requested size does not exceed the current minimum.
    #[error("invalid size: {requested} bytes requested, minimum is {minimum} bytes")]
    InvalidSize { requested: u64, minimum: u64 },

    /// The caller cancelled the operation before commit.
    #[error("operation cancelled")]
    Cancelled,
}

impl ImageError {
    /// Map an I/O error from `path`, classifying missing files and full disks.
    pub(crate) fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ImageError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::StorageFull => ImageError::InsufficientSpace(format!(
                "filesystem full while writing {}",
                path.display()
            )),
            _ => ImageError::Io(format!("{}: {}", path.display(), err)),
        }
    }
}
