//! Size inspection for disk images.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::{ImageError, ImageResult};
use crate::qcow2::Qcow2Header;

/// Report about a disk image, suitable for user-facing display.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    /// Path the report was taken from.
    pub path: PathBuf,
    /// Capacity visible to the guest, in bytes.
    pub virtual_size: u64,
    /// Bytes actually consumed on the host filesystem.
    pub allocated_size: u64,
    /// Cluster size of the container, in bytes.
    pub cluster_size: u64,
    /// Backing file path, for COW overlays.
    pub backing_file: Option<String>,
}

/// Return the allocated size of the image at `path`, in bytes.
///
/// This is host consumption (`st_blocks`-based on unix), not guest
/// capacity, so sparse and compressed images report what they actually
/// cost. Read-only and safe to call concurrently; the result is advisory
/// and may be stale as soon as it returns if a running guest is writing.
pub fn inspect_size(path: &Path) -> ImageResult<u64> {
    let metadata = std::fs::metadata(path).map_err(|e| ImageError::from_io(e, path))?;
    Ok(allocated_bytes(&metadata))
}

/// Read header-level details plus the allocated size.
pub fn inspect(path: &Path) -> ImageResult<ImageInfo> {
    let metadata = std::fs::metadata(path).map_err(|e| ImageError::from_io(e, path))?;
    let mut file = File::open(path).map_err(|e| ImageError::from_io(e, path))?;
    let header = Qcow2Header::read_from(&mut file, path)?;
    let backing_file = header.read_backing_path(&mut file, path)?;

    Ok(ImageInfo {
        path: path.to_path_buf(),
        virtual_size: header.size,
        allocated_size: allocated_bytes(&metadata),
        cluster_size: header.cluster_size(),
        backing_file,
    })
}

#[cfg(unix)]
fn allocated_bytes(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    // st_blocks counts 512-byte units regardless of filesystem block size.
    metadata.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}
