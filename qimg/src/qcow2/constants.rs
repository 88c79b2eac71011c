//! QCOW2 on-disk format constants.
//!
//! Centralized location for all container-format configuration values.

/// QCOW2 magic number: "QFI\xfb".
pub const QCOW2_MAGIC: u32 = 0x514649fb;

/// Only version 3 ("qcow2 v3" / compat=1.1) images are supported.
pub const QCOW2_VERSION: u32 = 3;

/// QCOW2 v3 header length in bytes.
pub const HEADER_LENGTH: u32 = 104;

/// QCOW2 cluster size in bits (64KB = 2^16).
pub const CLUSTER_BITS: u32 = 16;

/// QCOW2 refcount order (16-bit refcounts = 2^4).
pub const REFCOUNT_ORDER: u32 = 4;

/// Block size for QCOW2 formatting (512 bytes).
pub const BLOCK_SIZE: usize = 512;

/// Sector size used by compressed cluster descriptors.
pub const SECTOR_SIZE: u64 = 512;

/// Header extension type carrying the backing file format string.
pub const EXT_BACKING_FORMAT: u32 = 0xE2792ACA;

/// L1/L2 entry: bits 9-55 hold the host cluster offset.
pub const OFFSET_MASK: u64 = 0x00FF_FFFF_FFFF_FE00;

/// L2 entry bit 62: cluster data is compressed.
pub const L2_COMPRESSED: u64 = 1 << 62;

/// Bytes per mebibyte.
pub const BYTES_PER_MIB: u64 = 1024 * 1024;
