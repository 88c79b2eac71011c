//! Read-side access to a QCOW2 image and its backing chain.
//!
//! Clusters are resolved top-to-bottom through the chain: a cluster
//! allocated in an overlay shadows the same range in its backing file.
//! Raw (non-QCOW2) base images are supported as the bottom of a chain.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::errors::{ImageError, ImageResult};
use crate::qcow2::constants::{L2_COMPRESSED, OFFSET_MASK, QCOW2_MAGIC, SECTOR_SIZE};
use crate::qcow2::header::Qcow2Header;

/// One layer of a backing chain.
#[derive(Debug)]
enum Layer {
    /// A QCOW2 layer with L1/L2 indirection.
    Qcow2 {
        file: File,
        path: PathBuf,
        header: Qcow2Header,
        l1_table: Vec<u64>,
    },
    /// A raw base image at the bottom of the chain.
    Raw { file: File, path: PathBuf, size: u64 },
}

/// A QCOW2 image opened for reading, including its full backing chain.
///
/// The top layer must be QCOW2; its header defines the virtual size and
/// cluster geometry used for all reads.
#[derive(Debug)]
pub struct Qcow2Image {
    /// Layers from top (index 0) to base (last index).
    layers: Vec<Layer>,
}

impl Qcow2Image {
    /// Open `path` and every layer of its backing chain.
    ///
    /// Relative backing references resolve against the directory of the
    /// image that holds them, per the qcow2 convention.
    pub fn open(path: &Path) -> ImageResult<Self> {
        let mut layers = Vec::new();
        let mut visited: Vec<PathBuf> = Vec::new();
        let mut current = path.to_path_buf();

        loop {
            let canonical =
                std::fs::canonicalize(&current).map_err(|e| ImageError::from_io(e, &current))?;
            if visited.contains(&canonical) {
                return Err(ImageError::Conversion(format!(
                    "{}: backing chain loops back to {}",
                    path.display(),
                    current.display()
                )));
            }
            visited.push(canonical);

            let (layer, backing) = Layer::open(&current)?;
            let is_top = layers.is_empty();
            if is_top && matches!(layer, Layer::Raw { .. }) {
                return Err(ImageError::Conversion(format!(
                    "{} is not a qcow2 image",
                    current.display()
                )));
            }
            layers.push(layer);
            match backing {
                Some(bp) => {
                    let next = PathBuf::from(bp);
                    current = if next.is_absolute() {
                        next
                    } else {
                        match current.parent() {
                            Some(dir) => dir.join(next),
                            None => next,
                        }
                    };
                }
                None => break,
            }
        }

        Ok(Self { layers })
    }

    /// Header of the top layer.
    pub fn header(&self) -> &Qcow2Header {
        match &self.layers[0] {
            Layer::Qcow2 { header, .. } => header,
            // open() guarantees the top layer is QCOW2.
            Layer::Raw { .. } => unreachable!("top layer is always qcow2"),
        }
    }

    /// Virtual (guest-visible) size in bytes.
    pub fn virtual_size(&self) -> u64 {
        self.header().size
    }

    /// Cluster size of the top layer in bytes.
    pub fn cluster_size(&self) -> u64 {
        self.header().cluster_size()
    }

    /// Number of virtual clusters addressed by this image.
    pub fn num_clusters(&self) -> u64 {
        self.virtual_size().div_ceil(self.cluster_size())
    }

    /// Whether the top layer references a backing file.
    pub fn has_backing(&self) -> bool {
        self.layers.len() > 1
    }

    /// Read one virtual cluster, resolving through the backing chain.
    ///
    /// Returns `None` for clusters unallocated in every layer (sparse).
    pub fn read_cluster(&mut self, index: u64) -> ImageResult<Option<Vec<u8>>> {
        let cluster_size = self.cluster_size();
        for layer in self.layers.iter_mut() {
            if let Some(data) = layer.read_cluster(index, cluster_size)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }
}

impl Layer {
    /// Open a file and determine whether it is QCOW2 or raw.
    ///
    /// Returns the layer plus the backing file path for QCOW2 layers
    /// that reference one.
    fn open(path: &Path) -> ImageResult<(Self, Option<String>)> {
        let mut file = File::open(path).map_err(|e| ImageError::from_io(e, path))?;

        let mut magic_buf = [0u8; 4];
        let is_qcow2 = match file.read_exact(&mut magic_buf) {
            Ok(()) => u32::from_be_bytes(magic_buf) == QCOW2_MAGIC,
            // A file shorter than the magic can only be a raw base.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(ImageError::from_io(e, path)),
        };
        if !is_qcow2 {
            // Raw base image: no metadata, no further chain.
            let size = file
                .metadata()
                .map_err(|e| ImageError::from_io(e, path))?
                .len();
            return Ok((
                Layer::Raw {
                    file,
                    path: path.to_path_buf(),
                    size,
                },
                None,
            ));
        }

        let header = Qcow2Header::read_from(&mut file, path)?;
        header.validate(path)?;
        let backing = header.read_backing_path(&mut file, path)?;

        // Read the full L1 table up front; it is small relative to the image.
        file.seek(SeekFrom::Start(header.l1_table_offset))
            .map_err(|e| ImageError::from_io(e, path))?;
        let mut l1_buf = vec![0u8; header.l1_size as usize * 8];
        file.read_exact(&mut l1_buf).map_err(|e| {
            ImageError::Conversion(format!(
                "failed to read L1 table from {}: {}",
                path.display(),
                e
            ))
        })?;
        let l1_table: Vec<u64> = l1_buf
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();

        Ok((
            Layer::Qcow2 {
                file,
                path: path.to_path_buf(),
                header,
                l1_table,
            },
            backing,
        ))
    }

    /// Read one virtual cluster from this layer only.
    ///
    /// Returns `None` if the cluster is not allocated here and the read
    /// should fall through to the next backing layer.
    fn read_cluster(&mut self, index: u64, cluster_size: u64) -> ImageResult<Option<Vec<u8>>> {
        match self {
            Layer::Raw { file, path, size } => {
                let offset = index * cluster_size;
                if offset >= *size {
                    return Ok(None);
                }
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| ImageError::from_io(e, path))?;
                let mut buf = vec![0u8; cluster_size as usize];
                let available = (*size - offset).min(cluster_size) as usize;
                file.read_exact(&mut buf[..available])
                    .map_err(|e| ImageError::from_io(e, path))?;
                Ok(Some(buf))
            }
            Layer::Qcow2 {
                file,
                path,
                header,
                l1_table,
            } => {
                let layer_cluster_size = header.cluster_size();
                if layer_cluster_size != cluster_size {
                    return Err(ImageError::Conversion(format!(
                        "{}: backing chain mixes cluster sizes ({} vs {})",
                        path.display(),
                        layer_cluster_size,
                        cluster_size
                    )));
                }

                let l2_entries = header.l2_entries();
                let l1_idx = (index / l2_entries) as usize;
                let l2_idx = index % l2_entries;

                if l1_idx >= l1_table.len() {
                    return Ok(None);
                }

                let l2_table_offset = l1_table[l1_idx] & OFFSET_MASK;
                if l2_table_offset == 0 {
                    return Ok(None);
                }

                // Read the single L2 entry we need.
                file.seek(SeekFrom::Start(l2_table_offset + l2_idx * 8))
                    .map_err(|e| ImageError::from_io(e, path))?;
                let mut entry_buf = [0u8; 8];
                file.read_exact(&mut entry_buf)
                    .map_err(|e| ImageError::from_io(e, path))?;
                let l2_entry = u64::from_be_bytes(entry_buf);

                if l2_entry & L2_COMPRESSED != 0 {
                    return read_compressed_cluster(file, path, header, l2_entry).map(Some);
                }

                let data_offset = l2_entry & OFFSET_MASK;
                if data_offset == 0 {
                    return Ok(None);
                }

                file.seek(SeekFrom::Start(data_offset))
                    .map_err(|e| ImageError::from_io(e, path))?;
                let mut buf = vec![0u8; cluster_size as usize];
                file.read_exact(&mut buf)
                    .map_err(|e| ImageError::from_io(e, path))?;
                Ok(Some(buf))
            }
        }
    }
}

/// Decode a compressed cluster.
///
/// Compressed L2 entry layout with `x = 62 - (cluster_bits - 8)`:
/// bits `[0, x-1]` hold the host byte offset, bits `[x, 61]` hold the
/// number of occupied 512-byte sectors minus one. The payload is a raw
/// deflate stream that inflates to exactly one cluster.
fn read_compressed_cluster(
    file: &mut File,
    path: &Path,
    header: &Qcow2Header,
    l2_entry: u64,
) -> ImageResult<Vec<u8>> {
    let cluster_size = header.cluster_size() as usize;
    let x = 62 - (header.cluster_bits - 8);
    let host_offset = l2_entry & ((1u64 << x) - 1);
    let nb_sectors = ((l2_entry >> x) & ((1u64 << (62 - x)) - 1)) + 1;
    let csize = (nb_sectors * SECTOR_SIZE - (host_offset % SECTOR_SIZE)) as usize;

    file.seek(SeekFrom::Start(host_offset))
        .map_err(|e| ImageError::from_io(e, path))?;
    let mut compressed = vec![0u8; csize];
    file.read_exact(&mut compressed)
        .map_err(|e| ImageError::from_io(e, path))?;

    let mut decoder = flate2::read::DeflateDecoder::new(&compressed[..]);
    let mut out = vec![0u8; cluster_size];
    let mut filled = 0;
    while filled < cluster_size {
        let n = decoder.read(&mut out[filled..]).map_err(|e| {
            ImageError::Conversion(format!(
                "{}: failed to decompress cluster at offset {}: {}",
                path.display(),
                host_offset,
                e
            ))
        })?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled != cluster_size {
        return Err(ImageError::Conversion(format!(
            "{}: compressed cluster at offset {} inflated to {} bytes, expected {}",
            path.display(),
            host_offset,
            filled,
            cluster_size
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qcow2::{BackingFormat, create_image, create_overlay};
    use tempfile::TempDir;

    /// Point the image's backing reference at `name` verbatim.
    fn set_backing_reference(path: &Path, name: &str) {
        let mut bytes = std::fs::read(path).unwrap();
        bytes[8..16].copy_from_slice(&512u64.to_be_bytes());
        bytes[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
        bytes[512..512 + name.len()].copy_from_slice(name.as_bytes());
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let err = Qcow2Image::open(Path::new("/nonexistent/image.qcow2")).unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }

    #[test]
    fn open_raw_top_layer_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.raw");
        std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();

        let err = Qcow2Image::open(&path).unwrap_err();
        assert!(matches!(err, ImageError::Conversion(_)));
    }

    #[test]
    fn truncated_header_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.qcow2");
        let mut buf = vec![0u8; 10];
        buf[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
        std::fs::write(&path, &buf).unwrap();

        let err = Qcow2Image::open(&path).unwrap_err();
        assert!(matches!(err, ImageError::Conversion(_)));
    }

    #[test]
    fn relative_backing_path_resolves_beside_the_image() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.raw");
        let mut data = vec![0u8; 1 << 16];
        data[0..4].copy_from_slice(b"ping");
        std::fs::write(&base, &data).unwrap();

        let overlay = dir.path().join("disk.qcow2");
        create_overlay(&overlay, &base, BackingFormat::Raw, 1 << 16).unwrap();
        // The directory is not the process CWD, so a bare file name only
        // resolves if it is joined onto the overlay's directory.
        set_backing_reference(&overlay, "base.raw");

        let mut image = Qcow2Image::open(&overlay).unwrap();
        assert!(image.has_backing());
        let cluster = image.read_cluster(0).unwrap().unwrap();
        assert_eq!(&cluster[0..4], b"ping");
    }

    #[test]
    fn backing_chain_loop_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.qcow2");
        create_image(&base, 1 << 20).unwrap();
        let overlay = dir.path().join("disk.qcow2");
        create_overlay(&overlay, &base, BackingFormat::Qcow2, 1 << 20).unwrap();
        // Clobber the base with the overlay so the chain points back at
        // itself.
        std::fs::copy(&overlay, &base).unwrap();

        let err = Qcow2Image::open(&overlay).unwrap_err();
        assert!(matches!(err, ImageError::Conversion(_)));
    }

    #[test]
    fn absurd_declared_size_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_image(&path, 1 << 20).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[24..32].copy_from_slice(&u64::MAX.to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let err = Qcow2Image::open(&path).unwrap_err();
        assert!(matches!(err, ImageError::Conversion(_)));
    }

    #[test]
    fn file_shorter_than_magic_is_treated_as_raw() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny");
        std::fs::write(&path, b"qc").unwrap();

        // Too short to hold the magic: classified as a raw base, which
        // is rejected as the top of a chain.
        let err = Qcow2Image::open(&path).unwrap_err();
        assert!(matches!(err, ImageError::Conversion(_)));
    }
}
