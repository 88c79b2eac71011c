//! Space reclaim and compression by full image re-conversion.
//!
//! The image is rewritten cluster by cluster into a temporary sibling
//! file, then renamed over the original. Until the rename, the original
//! is never touched; a failed or cancelled run only ever drops the temp
//! file. The rename is the single point of no return.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{ImageError, ImageResult};
use crate::maintain::inspect::inspect_size;
use crate::qcow2::{Qcow2Image, Qcow2Writer};

/// Cooperative cancellation flag, checked once per cluster.
///
/// Cancelling is always safe before the commit rename and has no effect
/// after it.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the operation holding this flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Options for [`reclaim`].
#[derive(Clone, Debug, Default)]
pub struct ReclaimOptions {
    /// Deflate-compress retained data clusters.
    ///
    /// Compression applies to existing data only; data written later by a
    /// guest is stored uncompressed by the emulator.
    pub compress: bool,
    /// Optional cooperative cancellation handle.
    pub cancel: Option<CancelFlag>,
}

/// Rewrite the image at `path`, dropping unallocated and zero clusters.
///
/// Logical content and capacity are preserved exactly. A backing chain is
/// merged into the standalone result, the same as re-converting with
/// `qemu-img convert`. The caller must guarantee no guest is attached and
/// no other maintenance runs against `path`; this function takes no lock.
pub fn reclaim(path: &Path, options: &ReclaimOptions) -> ImageResult<()> {
    let allocated_before = inspect_size(path)?;
    let dir = parent_dir(path);

    check_free_space(dir, allocated_before)?;

    let mut source = Qcow2Image::open(path)?;
    let virtual_size = source.virtual_size();
    let num_clusters = source.num_clusters();

    tracing::info!(
        path = %path.display(),
        virtual_size,
        allocated_before,
        compress = options.compress,
        "reclaiming disk image"
    );

    // Same-directory temp file: the commit rename never crosses a device
    // boundary, and a dropped temp file cleans itself up.
    let temp = tempfile::Builder::new()
        .prefix(".qimg-reclaim-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| ImageError::Io(format!("failed to create temp file in {}: {}", dir.display(), e)))?;

    let out_file = temp
        .as_file()
        .try_clone()
        .map_err(|e| ImageError::from_io(e, temp.path()))?;
    let mut writer = Qcow2Writer::new(
        out_file,
        temp.path(),
        virtual_size,
        source.header().cluster_bits,
    );

    for index in 0..num_clusters {
        if let Some(flag) = &options.cancel {
            if flag.is_cancelled() {
                tracing::info!(path = %path.display(), "reclaim cancelled before commit");
                return Err(ImageError::Cancelled);
            }
        }

        let Some(data) = source.read_cluster(index)? else {
            continue;
        };
        // Zero clusters read back as zero from sparse regions; don't
        // materialize them in the destination.
        if data.iter().all(|&b| b == 0) {
            continue;
        }
        writer.write_cluster(index, &data, options.compress)?;
    }

    writer.finish()?;

    // The destination must report the same capacity before we commit.
    let written = Qcow2Image::open(temp.path())?;
    if written.virtual_size() != virtual_size {
        return Err(ImageError::Conversion(format!(
            "converted image reports {} bytes, source has {}",
            written.virtual_size(),
            virtual_size
        )));
    }
    drop(written);

    // Point of no return.
    temp.persist(path)
        .map_err(|e| ImageError::Io(format!("failed to replace {}: {}", path.display(), e.error)))?;
    sync_dir(dir);

    let allocated_after = inspect_size(path).unwrap_or(0);
    tracing::info!(
        path = %path.display(),
        allocated_before,
        allocated_after,
        "reclaimed disk image"
    );
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// The temp copy can never exceed the source's allocated size, so that is
/// the free-space requirement.
#[cfg(unix)]
fn check_free_space(dir: &Path, needed: u64) -> ImageResult<()> {
    let stat = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| ImageError::Io(format!("statvfs {}: {}", dir.display(), e)))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < needed {
        return Err(ImageError::InsufficientSpace(format!(
            "need {} bytes free in {}, {} available",
            needed,
            dir.display(),
            available
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_free_space(_dir: &Path, _needed: u64) -> ImageResult<()> {
    // No portable statvfs; rely on ENOSPC surfacing during the write.
    Ok(())
}

/// Make the rename durable. Best effort: a failure here cannot corrupt
/// either file, the new image is already in place.
fn sync_dir(dir: &Path) {
    match std::fs::File::open(dir) {
        Ok(f) => {
            if let Err(e) = f.sync_all() {
                tracing::warn!("failed to sync directory {}: {}", dir.display(), e);
            }
        }
        Err(e) => tracing::warn!("failed to open directory {}: {}", dir.display(), e),
    }
}
