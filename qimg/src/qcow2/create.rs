//! Creation of new QCOW2 images and copy-on-write overlays.
//!
//! New standalone images are formatted with `qcow2-rs`. Overlays get a
//! hand-built header with a backing file reference and an empty L1 table,
//! so every read falls through to the backing image until first write.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use qcow2_rs::meta::Qcow2Header as MetaHeader;

use crate::errors::{ImageError, ImageResult};
use crate::qcow2::constants::{
    BLOCK_SIZE, CLUSTER_BITS, EXT_BACKING_FORMAT, HEADER_LENGTH, REFCOUNT_ORDER,
};
use crate::qcow2::header::Qcow2Header;

/// Backing file format for COW overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingFormat {
    /// Raw disk image.
    Raw,
    /// QCOW2 disk image.
    Qcow2,
}

impl BackingFormat {
    /// Format string for the qcow2 backing format extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackingFormat::Raw => "raw",
            BackingFormat::Qcow2 => "qcow2",
        }
    }
}

/// Create a sparse standalone QCOW2 image of `virtual_size` bytes.
///
/// Fails if `path` already exists; this subsystem never clobbers an
/// existing image outside the reclaim commit path.
pub fn create_image(path: &Path, virtual_size: u64) -> ImageResult<()> {
    tracing::info!(
        path = %path.display(),
        virtual_size,
        "creating qcow2 image"
    );

    // Calculate required metadata size.
    let (rc_table, rc_block, _l1_table) = MetaHeader::calculate_meta_params(
        virtual_size,
        CLUSTER_BITS as usize,
        REFCOUNT_ORDER as u8,
        BLOCK_SIZE,
    );
    let clusters = 1 + rc_table.1 + rc_block.1;
    let buffer_size = ((clusters as usize) << CLUSTER_BITS) + BLOCK_SIZE;

    let mut header_buf = vec![0u8; buffer_size];
    MetaHeader::format_qcow2(
        &mut header_buf,
        virtual_size,
        CLUSTER_BITS as usize,
        REFCOUNT_ORDER as u8,
        BLOCK_SIZE,
    )
    .map_err(|e| {
        ImageError::Conversion(format!(
            "failed to format qcow2 header for {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .map_err(|e| ImageError::from_io(e, path))?;
    file.write_all(&header_buf)
        .and_then(|_| file.sync_all())
        .map_err(|e| ImageError::from_io(e, path))?;

    tracing::info!(path = %path.display(), "created qcow2 image");
    Ok(())
}

/// Create a COW overlay at `path` backed by `backing`.
///
/// The overlay starts empty: an all-zero L1 table sends every read to the
/// backing file. The backing path is stored canonicalized so the overlay
/// stays readable from any working directory.
pub fn create_overlay(
    path: &Path,
    backing: &Path,
    backing_format: BackingFormat,
    virtual_size: u64,
) -> ImageResult<()> {
    tracing::info!(
        path = %path.display(),
        backing = %backing.display(),
        format = backing_format.as_str(),
        "creating qcow2 overlay"
    );

    let backing_str = backing
        .canonicalize()
        .map_err(|e| ImageError::from_io(e, backing))?
        .to_string_lossy()
        .into_owned();
    let backing_bytes = backing_str.as_bytes();
    let format_bytes = backing_format.as_str().as_bytes();

    let cluster_size = 1u64 << CLUSTER_BITS;

    // The backing path lives right after the header extensions, at a fixed
    // offset inside cluster 0.
    let backing_offset: u64 = 512;
    if backing_bytes.len() > (cluster_size - backing_offset) as usize {
        return Err(ImageError::Conversion(format!(
            "backing path too long: {}",
            backing_str
        )));
    }

    // L1 sizing: one L1 entry addresses one L2 *table*, which covers
    // (cluster_size / 8) * cluster_size bytes of virtual address space.
    let bytes_per_l2 = (cluster_size / 8) * cluster_size;
    let l1_size = virtual_size.div_ceil(bytes_per_l2).max(1) as u32;
    let l1_clusters = (l1_size as u64 * 8).div_ceil(cluster_size);

    // Refcount table and a single refcount block follow the L1 table.
    let rc_table_cluster = 1 + l1_clusters;
    let rc_block_cluster = rc_table_cluster + 1;
    let total_clusters = rc_block_cluster + 1;

    let header = Qcow2Header {
        backing_file_offset: backing_offset,
        backing_file_size: backing_bytes.len() as u32,
        cluster_bits: CLUSTER_BITS,
        size: virtual_size,
        crypt_method: 0,
        l1_size,
        l1_table_offset: cluster_size,
        refcount_table_offset: rc_table_cluster * cluster_size,
        refcount_table_clusters: 1,
        nb_snapshots: 0,
        snapshots_offset: 0,
        incompatible_features: 0,
        compatible_features: 0,
        autoclear_features: 0,
        refcount_order: REFCOUNT_ORDER,
        header_length: HEADER_LENGTH,
    };

    let mut buf = vec![0u8; (total_clusters * cluster_size) as usize];
    buf[0..104].copy_from_slice(&header.to_bytes());

    // Backing format extension, then the end-of-extensions marker.
    let ext = 104usize;
    buf[ext..ext + 4].copy_from_slice(&EXT_BACKING_FORMAT.to_be_bytes());
    buf[ext + 4..ext + 8].copy_from_slice(&(format_bytes.len() as u32).to_be_bytes());
    buf[ext + 8..ext + 8 + format_bytes.len()].copy_from_slice(format_bytes);
    let end_ext = ext + 8 + format_bytes.len().next_multiple_of(8);
    buf[end_ext..end_ext + 8].fill(0);

    buf[backing_offset as usize..backing_offset as usize + backing_bytes.len()]
        .copy_from_slice(backing_bytes);

    // L1 table stays all zeros: every read goes to the backing file.

    // Refcount table entry 0 points at the refcount block, which marks
    // all metadata clusters with refcount 1.
    let rt = (rc_table_cluster * cluster_size) as usize;
    buf[rt..rt + 8].copy_from_slice(&(rc_block_cluster * cluster_size).to_be_bytes());
    let rb = (rc_block_cluster * cluster_size) as usize;
    for i in 0..total_clusters as usize {
        buf[rb + i * 2..rb + i * 2 + 2].copy_from_slice(&1u16.to_be_bytes());
    }

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .map_err(|e| ImageError::from_io(e, path))?;
    file.write_all(&buf)
        .and_then(|_| file.sync_all())
        .map_err(|e| ImageError::from_io(e, path))?;

    tracing::info!(path = %path.display(), "created qcow2 overlay");
    Ok(())
}
