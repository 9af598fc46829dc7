// restoretool/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::info;

/// Bundles a dump and its companion files into one `.tar.gz`.
///
/// Every entry is stored under its file name, so the bundle unpacks flat.
/// Directory-format dumps are added recursively under their directory name.
pub fn create_bundle(files: &[PathBuf], archive_dest_path: &Path) -> Result<PathBuf> {
    if let Some(parent) = archive_dest_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create parent directory for archive: {}",
                    parent.display()
                )
            })?;
        }
    }

    info!("🗜 Creating bundle {}", archive_dest_path.display());

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!("Failed to create archive file: {}", archive_dest_path.display())
    })?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for path in files {
        let name = path
            .file_name()
            .with_context(|| format!("Cannot bundle path without a file name: {}", path.display()))?;
        if path.is_dir() {
            tar_builder.append_dir_all(name, path).with_context(|| {
                format!("Failed to append directory {} to archive", path.display())
            })?;
        } else {
            tar_builder.append_path_with_name(path, name).with_context(|| {
                format!("Failed to append file {} to archive", path.display())
            })?;
        }
    }

    let encoder = tar_builder.into_inner().with_context(|| {
        format!(
            "Failed to get inner encoder from tar builder for archive: {}",
            archive_dest_path.display()
        )
    })?;
    encoder.finish().with_context(|| {
        format!(
            "Failed to finish Gzip encoding for archive: {}",
            archive_dest_path.display()
        )
    })?;

    info!("✓ Bundle created at {}", archive_dest_path.display());
    Ok(archive_dest_path.to_path_buf())
}

/// Extracts a `.tar.gz` bundle into `extract_to_dir`.
pub fn extract_bundle(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        return Err(anyhow::anyhow!(
            "Archive for extraction is not a file: {}",
            archive_path.display()
        ));
    }
    std::fs::create_dir_all(extract_to_dir).with_context(|| {
        format!("Failed to create extraction directory: {}", extract_to_dir.display())
    })?;

    info!(
        "Extracting {} to {}",
        archive_path.display(),
        extract_to_dir.display()
    );

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let gz_decoder = flate2::read::GzDecoder::new(archive_file);
    let mut archive = tar::Archive::new(gz_decoder);
    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack archive {} to {}",
            archive_path.display(),
            extract_to_dir.display()
        )
    })?;

    Ok(extract_to_dir.to_path_buf())
}

pub fn is_bundle(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use walkdir::WalkDir;

    /// Lists every regular file below `dir`, sorted, relative to `dir`.
    fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.with_context(|| format!("Failed to walk directory: {}", dir.display()))?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(dir)
                    .with_context(|| format!("Failed to strip prefix {}", dir.display()))?;
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    #[test]
    fn bundle_unpacks_flat() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let dump = source.path().join("metrics.dump");
        let roles = source.path().join("metrics.roles");
        fs::write(&dump, b"PGDMP")?;
        fs::write(&roles, "app_writer\n")?;
        let toc_dir = source.path().join("metrics_dir");
        fs::create_dir(&toc_dir)?;
        fs::write(toc_dir.join("toc.dat"), b"toc")?;

        let out = tempfile::tempdir()?;
        let bundle = out.path().join("nested").join("metrics_20240101.tar.gz");
        create_bundle(&[dump, roles, toc_dir], &bundle)?;
        assert!(is_bundle(&bundle));

        let target = tempfile::tempdir()?;
        extract_bundle(&bundle, target.path())?;
        assert_eq!(
            list_files(target.path())?,
            vec![
                PathBuf::from("metrics.dump"),
                PathBuf::from("metrics.roles"),
                PathBuf::from("metrics_dir/toc.dat"),
            ]
        );
        assert_eq!(fs::read_to_string(target.path().join("metrics.roles"))?, "app_writer\n");
        Ok(())
    }

    #[test]
    fn extracting_a_missing_file_fails() {
        let target = tempfile::tempdir().unwrap();
        assert!(extract_bundle(Path::new("/nonexistent/x.tar.gz"), target.path()).is_err());
    }

    #[test]
    fn bundle_detection() {
        assert!(is_bundle(Path::new("a.tgz")));
        assert!(!is_bundle(Path::new("a.dump")));
    }
}
