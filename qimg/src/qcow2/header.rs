//! QCOW2 v3 header parsing and serialization.
//!
//! The 104-byte header is big-endian. Layout:
//!
//! ```text
//! 0-3:     magic (QFI\xfb)
//! 4-7:     version (3)
//! 8-15:    backing_file_offset
//! 16-19:   backing_file_size
//! 20-23:   cluster_bits (16 = 64KB clusters)
//! 24-31:   size (virtual disk size)
//! 32-35:   crypt_method (0 = none)
//! 36-39:   l1_size
//! 40-47:   l1_table_offset
//! 48-55:   refcount_table_offset
//! 56-59:   refcount_table_clusters
//! 60-63:   nb_snapshots
//! 64-71:   snapshots_offset
//! 72-79:   incompatible_features
//! 80-87:   compatible_features
//! 88-95:   autoclear_features
//! 96-99:   refcount_order (4 = 16-bit)
//! 100-103: header_length
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::errors::{ImageError, ImageResult};
use crate::qcow2::constants::{HEADER_LENGTH, QCOW2_MAGIC, QCOW2_VERSION};

/// Largest accepted L1 table, matching qemu's 32 MiB cap.
const MAX_L1_BYTES: u64 = 32 * 1024 * 1024;

/// Parsed QCOW2 v3 header.
#[derive(Debug, Clone)]
pub struct Qcow2Header {
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,
}

impl Qcow2Header {
    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    /// Number of L2 entries per L2 table (each entry is 8 bytes).
    pub fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }

    /// Bytes of virtual address space covered by one L2 table.
    pub fn bytes_per_l2(&self) -> u64 {
        self.l2_entries() * self.cluster_size()
    }

    /// Parse a header from raw bytes.
    ///
    /// Rejects bad magic and unsupported versions. Feature gating
    /// (encryption, snapshots) is done separately in [`validate`].
    ///
    /// [`validate`]: Qcow2Header::validate
    pub fn parse(buf: &[u8; 104], path: &Path) -> ImageResult<Self> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != QCOW2_MAGIC {
            return Err(ImageError::Conversion(format!(
                "invalid qcow2 magic in {}: 0x{:08x}",
                path.display(),
                magic
            )));
        }

        let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if version != QCOW2_VERSION {
            return Err(ImageError::Conversion(format!(
                "unsupported qcow2 version {} in {} (only v3 is supported)",
                version,
                path.display()
            )));
        }

        Ok(Self {
            backing_file_offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            backing_file_size: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            cluster_bits: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            size: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            crypt_method: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            l1_size: u32::from_be_bytes(buf[36..40].try_into().unwrap()),
            l1_table_offset: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            refcount_table_offset: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            refcount_table_clusters: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
            nb_snapshots: u32::from_be_bytes(buf[60..64].try_into().unwrap()),
            snapshots_offset: u64::from_be_bytes(buf[64..72].try_into().unwrap()),
            incompatible_features: u64::from_be_bytes(buf[72..80].try_into().unwrap()),
            compatible_features: u64::from_be_bytes(buf[80..88].try_into().unwrap()),
            autoclear_features: u64::from_be_bytes(buf[88..96].try_into().unwrap()),
            refcount_order: u32::from_be_bytes(buf[96..100].try_into().unwrap()),
            header_length: u32::from_be_bytes(buf[100..104].try_into().unwrap()),
        })
    }

    /// Serialize the header into its 104-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; 104] {
        let mut buf = [0u8; 104];
        buf[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&QCOW2_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.backing_file_offset.to_be_bytes());
        buf[16..20].copy_from_slice(&self.backing_file_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.cluster_bits.to_be_bytes());
        buf[24..32].copy_from_slice(&self.size.to_be_bytes());
        buf[32..36].copy_from_slice(&self.crypt_method.to_be_bytes());
        buf[36..40].copy_from_slice(&self.l1_size.to_be_bytes());
        buf[40..48].copy_from_slice(&self.l1_table_offset.to_be_bytes());
        buf[48..56].copy_from_slice(&self.refcount_table_offset.to_be_bytes());
        buf[56..60].copy_from_slice(&self.refcount_table_clusters.to_be_bytes());
        buf[60..64].copy_from_slice(&self.nb_snapshots.to_be_bytes());
        buf[64..72].copy_from_slice(&self.snapshots_offset.to_be_bytes());
        buf[72..80].copy_from_slice(&self.incompatible_features.to_be_bytes());
        buf[80..88].copy_from_slice(&self.compatible_features.to_be_bytes());
        buf[88..96].copy_from_slice(&self.autoclear_features.to_be_bytes());
        buf[96..100].copy_from_slice(&self.refcount_order.to_be_bytes());
        buf[100..104].copy_from_slice(&HEADER_LENGTH.to_be_bytes());
        buf
    }

    /// Read and parse the header from an open image file.
    pub fn read_from(file: &mut File, path: &Path) -> ImageResult<Self> {
        let mut buf = [0u8; 104];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ImageError::from_io(e, path))?;
        file.read_exact(&mut buf).map_err(|e| {
            ImageError::Conversion(format!(
                "failed to read qcow2 header from {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&buf, path)
    }

    /// Reject images this subsystem cannot safely rewrite.
    ///
    /// Encrypted images, images with internal snapshots, and images with
    /// unknown incompatible features would be silently mishandled by the
    /// reclaim and resize paths, so they fail up front.
    pub fn validate(&self, path: &Path) -> ImageResult<()> {
        if self.crypt_method != 0 {
            return Err(ImageError::Conversion(format!(
                "{}: encrypted images are not supported",
                path.display()
            )));
        }
        if self.nb_snapshots != 0 {
            return Err(ImageError::Conversion(format!(
                "{}: images with internal snapshots are not supported",
                path.display()
            )));
        }
        if self.incompatible_features != 0 {
            return Err(ImageError::Conversion(format!(
                "{}: unsupported incompatible features: 0x{:016x}",
                path.display(),
                self.incompatible_features
            )));
        }
        if self.cluster_bits < 9 || self.cluster_bits > 21 {
            return Err(ImageError::Conversion(format!(
                "{}: invalid cluster_bits {}",
                path.display(),
                self.cluster_bits
            )));
        }
        if self.l1_size as u64 * 8 > MAX_L1_BYTES {
            return Err(ImageError::Conversion(format!(
                "{}: L1 table of {} entries exceeds the {} MiB limit",
                path.display(),
                self.l1_size,
                MAX_L1_BYTES / (1024 * 1024)
            )));
        }
        // A header declaring a size its own L1 table cannot address is
        // corrupt; rejecting it here also bounds every per-cluster loop.
        if self.size.div_ceil(self.bytes_per_l2()) > self.l1_size as u64 {
            return Err(ImageError::Conversion(format!(
                "{}: declared size {} exceeds L1 table coverage",
                path.display(),
                self.size
            )));
        }
        Ok(())
    }

    /// Read the backing file path, if the header references one.
    pub fn read_backing_path(&self, file: &mut File, path: &Path) -> ImageResult<Option<String>> {
        if self.backing_file_offset == 0 || self.backing_file_size == 0 {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(self.backing_file_offset))
            .map_err(|e| ImageError::from_io(e, path))?;
        let mut buf = vec![0u8; self.backing_file_size as usize];
        file.read_exact(&mut buf).map_err(|e| {
            ImageError::Conversion(format!(
                "failed to read backing file path from {}: {}",
                path.display(),
                e
            ))
        })?;
        let backing = String::from_utf8(buf).map_err(|e| {
            ImageError::Conversion(format!(
                "invalid UTF-8 in backing file path of {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(backing))
    }
}
