//! Logical capacity grow for QCOW2 images.
//!
//! Growing is metadata-only; no data cluster is rewritten. When the
//! existing L1 table already addresses the target capacity the grow is a
//! single header field patch. Otherwise a larger L1 table is appended at
//! the end of the file and the header is rewritten to point at it.
//!
//! Failure safety: every pre-commit write is either appended past the old
//! end of file or flips a previously-zero refcount entry, so the original
//! header keeps addressing valid metadata until the final header rewrite.
//! A crash mid-grow leaves the image readable at its old size, at worst
//! with a leaked appended cluster.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::{ImageError, ImageResult};
use crate::qcow2::Qcow2Header;
use crate::qcow2::constants::{BYTES_PER_MIB, OFFSET_MASK, REFCOUNT_ORDER};

/// Grow the image at `path` to `target_size_mib` mebibytes.
///
/// Fails with `InvalidSize` unless the target strictly exceeds the current
/// virtual size; shrinking is unsupported. The caller must guarantee no
/// guest is attached and no other maintenance runs against `path`.
pub fn resize(path: &Path, target_size_mib: u64) -> ImageResult<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| ImageError::from_io(e, path))?;
    let header = Qcow2Header::read_from(&mut file, path)?;
    header.validate(path)?;

    let target = target_size_mib
        .checked_mul(BYTES_PER_MIB)
        .ok_or(ImageError::InvalidSize {
            requested: u64::MAX,
            minimum: header.size,
        })?;
    if target <= header.size {
        return Err(ImageError::InvalidSize {
            requested: target,
            minimum: header.size,
        });
    }

    tracing::info!(
        path = %path.display(),
        current_size = header.size,
        target_size = target,
        "resizing disk image"
    );

    let l1_needed = target.div_ceil(header.bytes_per_l2());
    if l1_needed <= header.l1_size as u64 {
        grow_in_place(&mut file, path, &header, target)?;
    } else {
        grow_with_l1_relocation(&mut file, path, &header, target, l1_needed as u32)?;
    }

    tracing::info!(path = %path.display(), size = target, "resized disk image");
    Ok(())
}

/// The existing L1 table covers the target capacity: patch the size field.
fn grow_in_place(
    file: &mut File,
    path: &Path,
    header: &Qcow2Header,
    target: u64,
) -> ImageResult<()> {
    tracing::debug!(path = %path.display(), "growing within existing L1 coverage");
    let mut new_header = header.clone();
    new_header.size = target;
    commit_header(file, path, &new_header)
}

/// Append a larger L1 table at end of file, then commit a new header.
fn grow_with_l1_relocation(
    file: &mut File,
    path: &Path,
    header: &Qcow2Header,
    target: u64,
    new_l1_size: u32,
) -> ImageResult<()> {
    let cluster_size = header.cluster_size();

    // Only 16-bit refcounts are supported by the refcount update below.
    if header.refcount_order != REFCOUNT_ORDER {
        return Err(ImageError::Conversion(format!(
            "{}: refcount_order {} is not supported (expected {})",
            path.display(),
            header.refcount_order,
            REFCOUNT_ORDER
        )));
    }

    let file_len = file
        .metadata()
        .map_err(|e| ImageError::from_io(e, path))?
        .len();
    let new_l1_offset = file_len.next_multiple_of(cluster_size);
    let new_l1_clusters = (new_l1_size as u64 * 8).div_ceil(cluster_size);

    tracing::debug!(
        path = %path.display(),
        old_l1_size = header.l1_size,
        new_l1_size,
        new_l1_offset,
        "relocating L1 table"
    );

    // Copy the old L1 entries into a zero-padded replacement.
    file.seek(SeekFrom::Start(header.l1_table_offset))
        .map_err(|e| ImageError::from_io(e, path))?;
    let mut l1_buf = vec![0u8; (new_l1_clusters * cluster_size) as usize];
    file.read_exact(&mut l1_buf[..header.l1_size as usize * 8])
        .map_err(|e| {
            ImageError::Conversion(format!(
                "failed to read L1 table from {}: {}",
                path.display(),
                e
            ))
        })?;

    file.seek(SeekFrom::Start(new_l1_offset))
        .map_err(|e| ImageError::from_io(e, path))?;
    file.write_all(&l1_buf)
        .map_err(|e| ImageError::from_io(e, path))?;

    // Mark the appended clusters used. The old L1 clusters stay marked;
    // that is a small leak, not corruption, and keeps the pre-commit
    // writes append-only.
    let new_clusters: Vec<u64> =
        (0..new_l1_clusters).map(|i| new_l1_offset / cluster_size + i).collect();
    mark_clusters_used(file, path, header, new_clusters, new_l1_offset + l1_buf.len() as u64)?;

    file.sync_all().map_err(|e| ImageError::from_io(e, path))?;

    let mut new_header = header.clone();
    new_header.size = target;
    new_header.l1_size = new_l1_size;
    new_header.l1_table_offset = new_l1_offset;
    commit_header(file, path, &new_header)
}

/// Set refcount 1 for each cluster in `pending`, appending fresh refcount
/// blocks when the covering table slot is empty. Newly appended blocks are
/// queued so their own refcounts get set too.
fn mark_clusters_used(
    file: &mut File,
    path: &Path,
    header: &Qcow2Header,
    mut pending: Vec<u64>,
    mut alloc_end: u64,
) -> ImageResult<()> {
    let cluster_size = header.cluster_size();
    // 16-bit refcounts: cluster_size / 2 entries per block.
    let entries_per_block = cluster_size / 2;
    let table_capacity = header.refcount_table_clusters as u64 * cluster_size / 8;

    while let Some(cluster) = pending.pop() {
        let table_index = cluster / entries_per_block;
        if table_index >= table_capacity {
            return Err(ImageError::Conversion(format!(
                "{}: refcount table is full (cannot reference cluster {})",
                path.display(),
                cluster
            )));
        }

        let entry_pos = header.refcount_table_offset + table_index * 8;
        file.seek(SeekFrom::Start(entry_pos))
            .map_err(|e| ImageError::from_io(e, path))?;
        let mut entry_buf = [0u8; 8];
        file.read_exact(&mut entry_buf)
            .map_err(|e| ImageError::from_io(e, path))?;
        let mut block_offset = u64::from_be_bytes(entry_buf) & OFFSET_MASK;

        if block_offset == 0 {
            // No refcount block covers this range yet; append one.
            block_offset = alloc_end.next_multiple_of(cluster_size);
            alloc_end = block_offset + cluster_size;
            file.seek(SeekFrom::Start(block_offset))
                .map_err(|e| ImageError::from_io(e, path))?;
            file.write_all(&vec![0u8; cluster_size as usize])
                .map_err(|e| ImageError::from_io(e, path))?;
            file.seek(SeekFrom::Start(entry_pos))
                .map_err(|e| ImageError::from_io(e, path))?;
            file.write_all(&block_offset.to_be_bytes())
                .map_err(|e| ImageError::from_io(e, path))?;
            // The new block is itself an allocated cluster.
            pending.push(block_offset / cluster_size);
        }

        let slot = cluster % entries_per_block;
        file.seek(SeekFrom::Start(block_offset + slot * 2))
            .map_err(|e| ImageError::from_io(e, path))?;
        file.write_all(&1u16.to_be_bytes())
            .map_err(|e| ImageError::from_io(e, path))?;
    }
    Ok(())
}

/// Rewrite the 104-byte header in one write and fsync. This is the commit
/// point for every grow path.
fn commit_header(file: &mut File, path: &Path, header: &Qcow2Header) -> ImageResult<()> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ImageError::from_io(e, path))?;
    file.write_all(&header.to_bytes())
        .map_err(|e| ImageError::from_io(e, path))?;
    file.sync_all().map_err(|e| ImageError::from_io(e, path))
}
