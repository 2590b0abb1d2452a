//! Gzip-compressed tar archives of rendered configuration

use std::fs;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;
use tracing::info;
use walkdir::WalkDir;

use crate::errors::LabError;
use crate::filesys::dir::Dir;
use crate::utils::sha256_hex;

/// An archive written by [`Packager::package`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    /// Archive file on the local machine
    pub path: PathBuf,

    /// Directory that was packed
    pub source: PathBuf,

    /// Path of the packed directory inside the archive
    pub root: PathBuf,

    pub file_count: usize,

    /// Hex SHA-256 of the archive bytes
    pub sha256: String,
}

impl Archive {
    /// Archive file name, used as the remote upload name
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Writes archives into one output directory
#[derive(Debug, Clone)]
pub struct Packager {
    output_dir: Dir,
}

impl Packager {
    pub fn new(output_dir: Dir) -> Self {
        Self { output_dir }
    }

    /// Pack `source` into `<output_dir>/<name>.tar.gz`, replacing any previous archive
    pub async fn package(&self, source: &Path, name: &str) -> Result<Archive, LabError> {
        let source = source.to_path_buf();
        let dest = self.output_dir.path().join(format!("{}.tar.gz", name));
        let root = archive_root(&source);

        let archive = {
            let (source, dest, root) = (source.clone(), dest.clone(), root.clone());
            tokio::task::spawn_blocking(move || write_archive(&source, &root, &dest))
                .await
                .map_err(|e| LabError::Internal(e.to_string()))??
        };

        info!(
            "Packaged {} files from {} into {} (sha256 {})",
            archive.0,
            source.display(),
            dest.display(),
            archive.1
        );

        Ok(Archive {
            path: dest,
            source,
            root,
            file_count: archive.0,
            sha256: archive.1,
        })
    }
}

/// Unpack an archive into `dest`, creating it if needed
pub async fn extract(archive: &Path, dest: &Path) -> Result<(), LabError> {
    let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let tar_gz = fs::File::open(&archive).map_err(|e| {
            LabError::PackagingError(format!("cannot open {}: {}", archive.display(), e))
        })?;
        fs::create_dir_all(&dest)?;
        tar::Archive::new(GzDecoder::new(tar_gz))
            .unpack(&dest)
            .map_err(|e| {
                LabError::PackagingError(format!("cannot unpack {}: {}", archive.display(), e))
            })
    })
    .await
    .map_err(|e| LabError::Internal(e.to_string()))?
}

/// Path the source directory is stored under inside the archive.
///
/// Relative sources keep their normal components, so `rendered/h1_netkit`
/// unpacks to `rendered/h1_netkit`. Absolute sources keep only their last component.
pub fn archive_root(source: &Path) -> PathBuf {
    let relative: PathBuf = if source.is_absolute() {
        PathBuf::new()
    } else {
        source
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    };
    if relative.as_os_str().is_empty() {
        source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("lab"))
    } else {
        relative
    }
}

fn write_archive(source: &Path, root: &Path, dest: &Path) -> Result<(usize, String), LabError> {
    if !source.is_dir() {
        return Err(LabError::PackagingError(format!(
            "{} is not a readable directory",
            source.display()
        )));
    }

    let mut file_count = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            LabError::PackagingError(format!("cannot read {}: {}", source.display(), e))
        })?;
        if entry.file_type().is_file() {
            file_count += 1;
        }
    }

    let packing_error = |e: std::io::Error| {
        LabError::PackagingError(format!("cannot write {}: {}", dest.display(), e))
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(packing_error)?;
    }
    if dest.exists() {
        fs::remove_file(dest).map_err(packing_error)?;
    }

    let tar_gz = fs::File::create(dest).map_err(packing_error)?;
    let encoder = GzEncoder::new(tar_gz, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(root, source).map_err(packing_error)?;
    let encoder = builder.into_inner().map_err(packing_error)?;
    encoder.finish().map_err(packing_error)?;

    let digest = sha256_hex(&fs::read(dest).map_err(packing_error)?);
    Ok((file_count, digest))
}
