use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn qimg() -> Command {
    Command::new(env!("CARGO_BIN_EXE_qimg"))
}

#[test]
fn test_info_missing_file_fails() {
    qimg()
        .args(["info", "/nonexistent/disk.qcow2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_create_then_info() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.qcow2");

    qimg()
        .arg("create")
        .arg(&image)
        .arg("256")
        .assert()
        .success()
        .stdout(predicate::str::contains("created"));

    qimg()
        .arg("info")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("256.00 MiB"));
}

#[test]
fn test_info_json_output() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.qcow2");

    qimg().arg("create").arg(&image).arg("64").assert().success();

    let output = qimg()
        .arg("info")
        .arg(&image)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed["virtual_size"], 64 * 1024 * 1024);
    assert!(parsed["allocated_size"].as_u64().unwrap() > 0);
}

#[test]
fn test_create_refuses_existing_file() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.qcow2");
    std::fs::write(&image, b"occupied").unwrap();

    qimg().arg("create").arg(&image).arg("64").assert().failure();
}

#[test]
fn test_resize_and_info_roundtrip() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.qcow2");

    qimg().arg("create").arg(&image).arg("128").assert().success();

    qimg()
        .arg("resize")
        .arg(&image)
        .arg("512")
        .assert()
        .success()
        .stdout(predicate::str::contains("512 MiB"));

    qimg()
        .arg("info")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("512.00 MiB"));
}

#[test]
fn test_resize_shrink_fails() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.qcow2");

    qimg().arg("create").arg(&image).arg("128").assert().success();

    qimg()
        .arg("resize")
        .arg(&image)
        .arg("64")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid size"));
}

#[test]
fn test_reclaim_reports_sizes() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("disk.qcow2");

    qimg().arg("create").arg(&image).arg("64").assert().success();

    qimg()
        .arg("reclaim")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("reclaimed"));
}

#[test]
fn test_reclaim_compress_flag() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.raw");
    std::fs::write(&base, vec![0xABu8; 2 * 65536]).unwrap();
    let image = dir.path().join("overlay.qcow2");

    qimg()
        .arg("create")
        .arg(&image)
        .arg("1")
        .arg("--backing")
        .arg(&base)
        .arg("--backing-format")
        .arg("raw")
        .assert()
        .success();

    qimg()
        .arg("reclaim")
        .arg("--compress")
        .arg(&image)
        .assert()
        .success();

    // The reclaimed overlay is standalone; the base is no longer needed.
    std::fs::remove_file(&base).unwrap();
    qimg().arg("info").arg(&image).assert().success();
}
