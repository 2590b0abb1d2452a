//! Packaging tests

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use walkdir::WalkDir;

use labdeploy::deploy::packager::{extract, Packager};
use labdeploy::filesys::dir::Dir;

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn files(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut found: Vec<(PathBuf, Vec<u8>)> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, fs::read(entry.path()).unwrap())
        })
        .collect();
    found.sort();
    found
}

fn rendered_lab(workspace: &Path) -> PathBuf {
    let lab = workspace.join("rendered").join("nk1_netkit");
    write(&lab, "lab.conf", b"LAB_DESCRIPTION=\"AutoNetkit Lab\"\nr1[0]=A\n");
    write(&lab, "r1.startup", b"/sbin/ifconfig eth0 10.0.0.1 up\n");
    write(&lab, "r1/etc/zebra/bgpd.conf", b"router bgp 100\n");
    write(&lab, "r1/root/.ssh/authorized_keys", b"ssh-rsa AAAA ank@lab\n");
    write(&lab, "blob.bin", &[0u8, 159, 146, 150, 255, 10, 13]);
    lab
}

#[tokio::test]
async fn test_round_trip_is_byte_identical() {
    let workspace = TempDir::new().unwrap();
    let lab = rendered_lab(workspace.path());
    let out = workspace.path().join("out");
    fs::create_dir_all(&out).unwrap();

    let archive = assert_ok!(Packager::new(Dir::new(&out)).package(&lab, "nklab_nk1").await);
    assert_eq!(archive.path, out.join("nklab_nk1.tar.gz"));
    assert_eq!(archive.file_name(), "nklab_nk1.tar.gz");
    assert_eq!(archive.file_count, 5);
    assert_eq!(archive.sha256.len(), 64);

    let unpacked = TempDir::new().unwrap();
    assert_ok!(extract(&archive.path, unpacked.path()).await);

    assert_eq!(
        files(&unpacked.path().join(&archive.root)),
        files(&lab)
    );
}

#[tokio::test]
async fn test_repackaging_replaces_archive() {
    let workspace = TempDir::new().unwrap();
    let lab = rendered_lab(workspace.path());
    let packager = Packager::new(Dir::new(workspace.path()));

    let first = packager.package(&lab, "nklab_nk1").await.unwrap();
    write(&lab, "r2.startup", b"/sbin/ifconfig eth0 10.0.0.2 up\n");
    let second = packager.package(&lab, "nklab_nk1").await.unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(second.file_count, 6);
    assert_ne!(first.sha256, second.sha256);
}

#[tokio::test]
async fn test_extract_rejects_garbage() {
    let workspace = TempDir::new().unwrap();
    let bogus = workspace.path().join("nklab_bogus.tar.gz");
    fs::write(&bogus, b"definitely not gzip").unwrap();
    assert_err!(extract(&bogus, &workspace.path().join("out")).await);
}
