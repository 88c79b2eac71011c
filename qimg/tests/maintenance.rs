//! Integration tests for the disk image maintenance operations.
//!
//! Exercises the public API end to end against real files in a temp
//! directory: reclaim (with and without compression), resize, size
//! inspection, and the atomicity guarantees around failed or cancelled
//! operations.

use std::fs::File;
use std::path::{Path, PathBuf};

use qimg::qcow2::{BackingFormat, Qcow2Image, Qcow2Writer, create_image, create_overlay};
use qimg::{CancelFlag, ImageError, ReclaimOptions, inspect, inspect_size, reclaim, resize};
use tempfile::TempDir;

const CLUSTER_SIZE: u64 = 65536;
const MIB: u64 = 1024 * 1024;

/// Build a standalone image with the given clusters materialized.
///
/// `zero_clusters` are written as explicit all-zero data so the image
/// carries reclaimable waste.
fn build_image(
    dir: &TempDir,
    name: &str,
    virtual_clusters: u64,
    data_clusters: &[u64],
    zero_clusters: &[u64],
) -> PathBuf {
    let path = dir.path().join(name);
    let file = File::create(&path).unwrap();
    let mut writer = Qcow2Writer::new(file, &path, virtual_clusters * CLUSTER_SIZE, 16);
    for &index in data_clusters {
        let mut cluster = vec![0u8; CLUSTER_SIZE as usize];
        cluster[0..8].copy_from_slice(&(index + 1).to_be_bytes());
        cluster[8..16].copy_from_slice(&0xDEAD_BEEF_CAFE_F00Du64.to_be_bytes());
        writer.write_cluster(index, &cluster, false).unwrap();
    }
    for &index in zero_clusters {
        writer
            .write_cluster(index, &vec![0u8; CLUSTER_SIZE as usize], false)
            .unwrap();
    }
    writer.finish().unwrap();
    path
}

fn read_marker(path: &Path, index: u64) -> Option<u64> {
    let mut image = Qcow2Image::open(path).unwrap();
    image
        .read_cluster(index)
        .unwrap()
        .map(|c| u64::from_be_bytes(c[0..8].try_into().unwrap()))
}

// ── Size inspection ─────────────────────────────────────────────────

#[test]
fn inspect_size_missing_path_is_not_found() {
    let err = inspect_size(Path::new("/definitely/not/here.qcow2")).unwrap_err();
    assert!(matches!(err, ImageError::NotFound(_)));
}

#[test]
fn inspect_reports_virtual_and_allocated_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.qcow2");
    create_image(&path, 512 * MIB).unwrap();

    let info = inspect(&path).unwrap();
    assert_eq!(info.virtual_size, 512 * MIB);
    assert!(info.allocated_size > 0);
    assert!(info.allocated_size < 512 * MIB, "new image must be sparse");
}

// ── Reclaim ─────────────────────────────────────────────────────────

#[test]
fn reclaim_drops_zero_clusters_and_keeps_content() {
    let dir = TempDir::new().unwrap();
    // 4 data clusters, 12 materialized zero clusters of waste.
    let data: Vec<u64> = vec![0, 3, 7, 15];
    let waste: Vec<u64> = (16..28).collect();
    let path = build_image(&dir, "waste.qcow2", 32, &data, &waste);

    let allocated_before = inspect_size(&path).unwrap();
    let virtual_before = Qcow2Image::open(&path).unwrap().virtual_size();

    reclaim(&path, &ReclaimOptions::default()).unwrap();

    let allocated_after = inspect_size(&path).unwrap();
    assert!(
        allocated_after < allocated_before,
        "zero clusters must be reclaimed ({} -> {})",
        allocated_before,
        allocated_after
    );

    let reopened = Qcow2Image::open(&path).unwrap();
    assert_eq!(reopened.virtual_size(), virtual_before);
    drop(reopened);
    for &index in &data {
        assert_eq!(read_marker(&path, index), Some(index + 1));
    }
    for &index in &waste {
        assert_eq!(read_marker(&path, index), None, "cluster {} should be sparse", index);
    }
}

#[test]
fn reclaim_with_compression_is_lossless() {
    let dir = TempDir::new().unwrap();
    let data: Vec<u64> = (0..8).collect();
    let path = build_image(&dir, "comp.qcow2", 8, &data, &[]);

    // Capture full logical content before.
    let mut before = Vec::new();
    {
        let mut image = Qcow2Image::open(&path).unwrap();
        for i in 0..8 {
            before.push(image.read_cluster(i).unwrap());
        }
    }

    let options = ReclaimOptions {
        compress: true,
        cancel: None,
    };
    reclaim(&path, &options).unwrap();

    let mut image = Qcow2Image::open(&path).unwrap();
    for (i, want) in before.iter().enumerate() {
        let got = image.read_cluster(i as u64).unwrap();
        assert_eq!(&got, want, "cluster {} changed across compression", i);
    }
}

#[test]
fn reclaim_compression_reduces_allocation() {
    let dir = TempDir::new().unwrap();
    let data: Vec<u64> = (0..16).collect();
    let path = build_image(&dir, "big.qcow2", 16, &data, &[]);

    let allocated_before = inspect_size(&path).unwrap();
    let options = ReclaimOptions {
        compress: true,
        cancel: None,
    };
    reclaim(&path, &options).unwrap();

    let allocated_after = inspect_size(&path).unwrap();
    assert!(allocated_after < allocated_before);
}

#[test]
fn reclaim_merges_backing_chain() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.raw");
    let mut raw = vec![0u8; (2 * CLUSTER_SIZE) as usize];
    raw[0..8].copy_from_slice(&101u64.to_be_bytes());
    raw[CLUSTER_SIZE as usize..CLUSTER_SIZE as usize + 8].copy_from_slice(&102u64.to_be_bytes());
    std::fs::write(&base, &raw).unwrap();

    let overlay = dir.path().join("overlay.qcow2");
    create_overlay(&overlay, &base, BackingFormat::Raw, 2 * CLUSTER_SIZE).unwrap();

    reclaim(&overlay, &ReclaimOptions::default()).unwrap();

    let image = Qcow2Image::open(&overlay).unwrap();
    assert!(!image.has_backing());
    drop(image);
    assert_eq!(read_marker(&overlay, 0), Some(101));
    assert_eq!(read_marker(&overlay, 1), Some(102));

    // The base can now be deleted without breaking the image.
    std::fs::remove_file(&base).unwrap();
    assert_eq!(read_marker(&overlay, 0), Some(101));
}

#[test]
fn cancelled_reclaim_leaves_original_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path = build_image(&dir, "disk.qcow2", 8, &[1, 2], &[]);
    let before = std::fs::read(&path).unwrap();

    let flag = CancelFlag::new();
    flag.cancel();
    let options = ReclaimOptions {
        compress: false,
        cancel: Some(flag),
    };
    let err = reclaim(&path, &options).unwrap_err();
    assert!(matches!(err, ImageError::Cancelled));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

// ── Resize ──────────────────────────────────────────────────────────

#[test]
fn resize_grows_to_exact_target() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.qcow2");
    create_image(&path, 256 * MIB).unwrap();

    resize(&path, 300).unwrap();
    assert_eq!(Qcow2Image::open(&path).unwrap().virtual_size(), 300 * MIB);

    // Grow again, far past the original L1 coverage.
    resize(&path, 4096).unwrap();
    assert_eq!(Qcow2Image::open(&path).unwrap().virtual_size(), 4096 * MIB);
}

#[test]
fn resize_keeps_data_readable_after_l1_relocation() {
    let dir = TempDir::new().unwrap();
    let path = build_image(&dir, "disk.qcow2", 4, &[0, 3], &[]);

    // 4 clusters is 256 KiB; growing to 2 GiB forces an L1 relocation.
    resize(&path, 2048).unwrap();

    assert_eq!(Qcow2Image::open(&path).unwrap().virtual_size(), 2048 * MIB);
    assert_eq!(read_marker(&path, 0), Some(1));
    assert_eq!(read_marker(&path, 3), Some(4));
    assert_eq!(read_marker(&path, 2), None);
}

#[test]
fn resize_below_current_size_fails_and_preserves_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.qcow2");
    create_image(&path, 512 * MIB).unwrap();
    let before = std::fs::read(&path).unwrap();

    let err = resize(&path, 128).unwrap_err();
    match err {
        ImageError::InvalidSize { requested, minimum } => {
            assert_eq!(requested, 128 * MIB);
            assert_eq!(minimum, 512 * MIB);
        }
        other => panic!("expected InvalidSize, got {:?}", other),
    }
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn resized_image_survives_reclaim() {
    let dir = TempDir::new().unwrap();
    let path = build_image(&dir, "disk.qcow2", 4, &[1], &[2, 3]);

    resize(&path, 1024).unwrap();
    reclaim(&path, &ReclaimOptions::default()).unwrap();

    let image = Qcow2Image::open(&path).unwrap();
    assert_eq!(image.virtual_size(), 1024 * MIB);
    drop(image);
    assert_eq!(read_marker(&path, 1), Some(2));
    assert_eq!(read_marker(&path, 2), None);
}
