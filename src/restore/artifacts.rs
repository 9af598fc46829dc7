// restoretool/src/restore/artifacts.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup::archive;
use crate::config::parse_role_list;
use crate::timescale::SupplementaryStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// A single `pg_dump --format=custom` archive.
    Custom,
    /// A `pg_dump --format=directory` directory holding `toc.dat`.
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLocation {
    pub path: PathBuf,
    pub format: DumpFormat,
}

/// Paths of the optional files that travel with a dump, keyed by database name.
#[derive(Debug, Clone)]
pub struct Companions {
    pub dir: PathBuf,
    pub database: String,
}

impl Companions {
    pub fn new(dir: &Path, database: &str) -> Self {
        Companions {
            dir: dir.to_path_buf(),
            database: database.to_string(),
        }
    }

    pub fn roles_path(&self) -> PathBuf {
        self.dir.join(format!("{}.roles", self.database))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}_timescale_metadata.json", self.database))
    }

    pub fn step_path(&self, step: SupplementaryStep) -> PathBuf {
        self.dir.join(step.file_name(&self.database))
    }

    /// Roles listed in `<db>.roles`, or `None` when the file is absent.
    pub fn read_roles(&self) -> Result<Option<Vec<String>>> {
        let path = self.roles_path();
        if !path.is_file() {
            debug!("No roles file at {}", path.display());
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read roles file {}", path.display()))?;
        Ok(Some(parse_role_list(&content)))
    }

    /// True when the metadata file exists and holds something other than whitespace.
    pub fn has_metadata(&self) -> bool {
        fs::read_to_string(self.metadata_path())
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    }

    /// The SQL file for `step`, when one was shipped with the dump.
    pub fn step_file(&self, step: SupplementaryStep) -> Option<PathBuf> {
        let path = self.step_path(step);
        path.is_file().then_some(path)
    }
}

/// A backup reference resolved against the mount path.
///
/// Holds the temporary extraction directory alive when the reference was a bundle.
#[derive(Debug)]
pub struct ResolvedBackup {
    pub dump: Option<DumpLocation>,
    pub companions: Companions,
    _extracted: Option<TempDir>,
}

impl ResolvedBackup {
    pub fn resolve(mount_path: &Path, database: &str, reference: &str) -> Result<Self> {
        let candidate = {
            let reference = Path::new(reference);
            if reference.is_absolute() {
                reference.to_path_buf()
            } else {
                mount_path.join(reference)
            }
        };

        if !candidate.exists() {
            warn!("⚠️ Backup {} not found", candidate.display());
            return Ok(ResolvedBackup {
                dump: None,
                companions: Companions::new(mount_path, database),
                _extracted: None,
            });
        }

        if candidate.is_file() && archive::is_bundle(&candidate) {
            let extracted = tempfile::Builder::new()
                .prefix(&format!("restore_{}_", database))
                .tempdir()
                .context("Failed to create temporary extraction directory")?;
            archive::extract_bundle(&candidate, extracted.path())?;
            let dump = find_dump(extracted.path(), database)?;
            let companion_dir = match &dump {
                Some(found) => found
                    .path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| extracted.path().to_path_buf()),
                None => {
                    warn!("⚠️ Bundle {} contains no dump", candidate.display());
                    extracted.path().to_path_buf()
                }
            };
            return Ok(ResolvedBackup {
                dump,
                companions: Companions::new(&companion_dir, database),
                _extracted: Some(extracted),
            });
        }

        let format = if candidate.is_dir() {
            if !candidate.join("toc.dat").is_file() {
                anyhow::bail!(
                    "Backup directory {} is not a directory-format dump (no toc.dat)",
                    candidate.display()
                );
            }
            DumpFormat::Directory
        } else {
            DumpFormat::Custom
        };
        let companion_dir = candidate
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| mount_path.to_path_buf());
        info!("Using {:?} dump at {}", format, candidate.display());
        Ok(ResolvedBackup {
            dump: Some(DumpLocation { path: candidate, format }),
            companions: Companions::new(&companion_dir, database),
            _extracted: None,
        })
    }
}

/// Searches an extracted bundle for a dump, preferring `<db>.dump`.
fn find_dump(root: &Path, database: &str) -> Result<Option<DumpLocation>> {
    let preferred = format!("{}.dump", database);
    let mut fallback: Option<DumpLocation> = None;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", root.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if name == preferred {
                return Ok(Some(DumpLocation {
                    path: path.to_path_buf(),
                    format: DumpFormat::Custom,
                }));
            }
            if name == "toc.dat" {
                if let Some(dir) = path.parent() {
                    fallback.get_or_insert(DumpLocation {
                        path: dir.to_path_buf(),
                        format: DumpFormat::Directory,
                    });
                }
            } else if name.ends_with(".dump") {
                fallback.get_or_insert(DumpLocation {
                    path: path.to_path_buf(),
                    format: DumpFormat::Custom,
                });
            }
        }
    }
    Ok(fallback)
}
