//! Streaming writer for standalone QCOW2 v3 images.
//!
//! Output layout:
//!
//! ```text
//! Cluster 0:                          Header
//! Clusters 1..1+l1_clusters:          L1 table
//! Clusters l2_start..l2_start+num_l1: L2 tables (pre-allocated slots)
//! Clusters data_start..:              Data (plain clusters are cluster-
//!                                     aligned, compressed payloads are
//!                                     sector-aligned and packed)
//! After data:                         Refcount table + blocks
//! ```
//!
//! Clusters are accepted in any order; metadata is kept in memory and
//! written by [`Qcow2Writer::finish`], which ends with a fsync. The caller
//! owns durability of the *name* (rename + directory sync).

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::DeflateEncoder;

use crate::errors::{ImageError, ImageResult};
use crate::qcow2::constants::{L2_COMPRESSED, REFCOUNT_ORDER, SECTOR_SIZE};
use crate::qcow2::header::Qcow2Header;

pub struct Qcow2Writer {
    file: File,
    path: PathBuf,
    virtual_size: u64,
    cluster_bits: u32,
    /// Number of L1 entries == number of L2 table slots.
    num_l1: u32,
    /// Clusters occupied by the L1 table.
    l1_clusters: u64,
    /// First cluster of the L2 table region.
    l2_start: u64,
    /// First cluster of the data region.
    data_start: u64,
    /// Next free byte offset in the data region.
    data_cursor: u64,
    /// In-memory L2 tables, indexed by L1 entry.
    l2_tables: Vec<Vec<u64>>,
}

impl Qcow2Writer {
    /// Start a fresh image of `virtual_size` bytes in `file`.
    ///
    /// `path` is only used for diagnostics; `file` should be empty.
    pub fn new(file: File, path: &Path, virtual_size: u64, cluster_bits: u32) -> Self {
        let cluster_size = 1u64 << cluster_bits;
        let l2_entries = cluster_size / 8;
        let num_virtual_clusters = virtual_size.div_ceil(cluster_size);
        let num_l1 = num_virtual_clusters.div_ceil(l2_entries).max(1) as u32;
        let l1_clusters = (num_l1 as u64 * 8).div_ceil(cluster_size).max(1);
        let l2_start = 1 + l1_clusters;
        let data_start = l2_start + num_l1 as u64;

        Self {
            file,
            path: path.to_path_buf(),
            virtual_size,
            cluster_bits,
            num_l1,
            l1_clusters,
            l2_start,
            data_start,
            data_cursor: data_start * cluster_size,
            l2_tables: vec![vec![0u64; l2_entries as usize]; num_l1 as usize],
        }
    }

    fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    /// Write one virtual cluster.
    ///
    /// `data` must be exactly one cluster. With `compress` the payload is
    /// deflate-encoded; incompressible clusters fall back to plain storage.
    /// All-zero clusters should simply not be written (they stay sparse).
    pub fn write_cluster(&mut self, index: u64, data: &[u8], compress: bool) -> ImageResult<()> {
        let cluster_size = self.cluster_size();
        if data.len() as u64 != cluster_size {
            return Err(ImageError::Conversion(format!(
                "cluster {} has {} bytes, expected {}",
                index,
                data.len(),
                cluster_size
            )));
        }
        let l2_entries = cluster_size / 8;
        let l1_idx = (index / l2_entries) as usize;
        let l2_idx = (index % l2_entries) as usize;
        if l1_idx >= self.l2_tables.len() {
            return Err(ImageError::Conversion(format!(
                "cluster {} is beyond the image's virtual size",
                index
            )));
        }

        let entry = if compress {
            match self.write_compressed(data)? {
                Some(entry) => entry,
                None => self.write_plain(data)?,
            }
        } else {
            self.write_plain(data)?
        };

        self.l2_tables[l1_idx][l2_idx] = entry;
        Ok(())
    }

    /// Write a plain cluster at the next cluster-aligned offset.
    fn write_plain(&mut self, data: &[u8]) -> ImageResult<u64> {
        let cluster_size = self.cluster_size();
        let offset = self.data_cursor.next_multiple_of(cluster_size);
        self.write_at(offset, data)?;
        self.data_cursor = offset + cluster_size;
        Ok(offset)
    }

    /// Deflate and write a compressed cluster at the next sector boundary.
    ///
    /// Returns `None` when compression does not shrink the cluster, so the
    /// caller can store it plain instead (matching qemu-img behavior).
    fn write_compressed(&mut self, data: &[u8]) -> ImageResult<Option<u64>> {
        let cluster_size = self.cluster_size();

        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(cluster_size as usize / 2),
            Compression::default(),
        );
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| ImageError::Conversion(format!("cluster compression failed: {}", e)))
            .and_then(|compressed| {
                if compressed.len() as u64 >= cluster_size {
                    return Ok(None);
                }

                let offset = self.data_cursor.next_multiple_of(SECTOR_SIZE);
                self.write_at(offset, &compressed)?;
                self.data_cursor = offset + compressed.len() as u64;

                // Descriptor: bits [0, x-1] host offset, bits [x, 61]
                // occupied 512-byte sectors minus one, bit 62 compressed.
                let x = 62 - (self.cluster_bits - 8);
                let nb_sectors = (compressed.len() as u64).div_ceil(SECTOR_SIZE);
                Ok(Some(offset | ((nb_sectors - 1) << x) | L2_COMPRESSED))
            })
    }

    /// Write all metadata (L1, L2, refcounts, header) and fsync.
    pub fn finish(mut self) -> ImageResult<()> {
        let cluster_size = self.cluster_size();
        let data_end_cluster = self.data_cursor.div_ceil(cluster_size);

        // Refcount layout after the data region. The refcount structures
        // count themselves, so iterate until the total stabilizes.
        let rc_entries_per_block = cluster_size * 8 / (1u64 << REFCOUNT_ORDER);
        let rc_table_cluster = data_end_cluster;
        let rc_block_start = rc_table_cluster + 1;
        let mut total_clusters = rc_block_start;
        loop {
            let blocks_needed = total_clusters.div_ceil(rc_entries_per_block);
            let new_total = rc_block_start + blocks_needed;
            if new_total <= total_clusters {
                break;
            }
            total_clusters = new_total;
        }
        let num_rc_blocks = total_clusters - rc_block_start;
        let rc_table_offset = rc_table_cluster * cluster_size;

        let rc_table_entry_capacity = cluster_size / 8;
        if num_rc_blocks > rc_table_entry_capacity {
            return Err(ImageError::Conversion(format!(
                "image needs {} refcount blocks, more than one table cluster can hold",
                num_rc_blocks
            )));
        }

        // L1 table.
        let mut l1_buf = Vec::with_capacity(self.num_l1 as usize * 8);
        for (i, l2) in self.l2_tables.iter().enumerate() {
            let has_data = l2.iter().any(|&e| e != 0);
            let entry: u64 = if has_data {
                (self.l2_start + i as u64) * cluster_size
            } else {
                0
            };
            l1_buf.extend_from_slice(&entry.to_be_bytes());
        }
        self.write_at(cluster_size, &l1_buf)?;

        // L2 tables (only slots with data).
        for i in 0..self.l2_tables.len() {
            if self.l2_tables[i].iter().all(|&e| e == 0) {
                continue;
            }
            let mut l2_buf = Vec::with_capacity(cluster_size as usize);
            for entry in &self.l2_tables[i] {
                l2_buf.extend_from_slice(&entry.to_be_bytes());
            }
            let offset = (self.l2_start + i as u64) * cluster_size;
            self.write_at(offset, &l2_buf)?;
        }

        // Refcount table.
        let mut rc_table_buf = Vec::with_capacity(num_rc_blocks as usize * 8);
        for i in 0..num_rc_blocks {
            let block_offset = (rc_block_start + i) * cluster_size;
            rc_table_buf.extend_from_slice(&block_offset.to_be_bytes());
        }
        self.write_at(rc_table_offset, &rc_table_buf)?;

        // Refcount blocks. Used clusters: header, L1, referenced L2 slots,
        // the whole data region, refcount table and blocks. Alignment gaps
        // inside the data region are counted used; that leaks at most a few
        // sectors per compressed cluster and keeps the map simple.
        let mut used = vec![false; total_clusters as usize];
        used[0] = true;
        for c in 1..1 + self.l1_clusters {
            used[c as usize] = true;
        }
        for (i, l2) in self.l2_tables.iter().enumerate() {
            if l2.iter().any(|&e| e != 0) {
                used[(self.l2_start + i as u64) as usize] = true;
            }
        }
        for c in self.data_start..data_end_cluster {
            used[c as usize] = true;
        }
        for c in rc_table_cluster..total_clusters {
            used[c as usize] = true;
        }

        for bi in 0..num_rc_blocks {
            let mut block_buf = vec![0u8; cluster_size as usize];
            let first = (bi * rc_entries_per_block) as usize;
            for (slot, chunk) in block_buf.chunks_exact_mut(2).enumerate() {
                let refcount: u16 = if first + slot < used.len() && used[first + slot] {
                    1
                } else {
                    0
                };
                chunk.copy_from_slice(&refcount.to_be_bytes());
            }
            let block_offset = (rc_block_start + bi) * cluster_size;
            self.write_at(block_offset, &block_buf)?;
        }

        // Header last. Standalone image: no backing file reference.
        let header = Qcow2Header {
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits: self.cluster_bits,
            size: self.virtual_size,
            crypt_method: 0,
            l1_size: self.num_l1,
            l1_table_offset: cluster_size,
            refcount_table_offset: rc_table_offset,
            refcount_table_clusters: 1,
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: REFCOUNT_ORDER,
            header_length: 104,
        };
        let mut header_buf = [0u8; 112];
        header_buf[0..104].copy_from_slice(&header.to_bytes());
        // Bytes 104-111: end-of-extensions marker (all zeros).
        self.write_at(0, &header_buf)?;

        self.file
            .sync_all()
            .map_err(|e| ImageError::from_io(e, &self.path))?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> ImageResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| ImageError::from_io(e, &self.path))
    }
}
