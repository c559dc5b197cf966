//! tar.gz construction for full and differential runs.
//!
//! Filesystem entries keep their absolute path minus the leading `/`, so a
//! restore with `tar -xzf ... -C /` puts them back in place; database dumps
//! are stored under `databases/`.

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::discovery::BackupTargets;
use crate::layout::{staging_path_for, BackupKind};

const DUMPS_PREFIX: &str = "databases";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("cannot walk {path}: {source}")]
    Walk {
        path: String,
        source: walkdir::Error,
    },
    #[error("cannot add {path} to archive: {source}")]
    Append { path: String, source: io::Error },
    #[error("cannot write archive {path}: {source}")]
    Write { path: String, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDump {
    pub database: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// What was actually built; a differential request without a baseline
    /// yields `Full`.
    pub kind: BackupKind,
    pub files: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    /// Matches any path component with this exact name.
    Component(String),
    /// `*.log`: file names ending in the suffix. A bare `*` is taken literally.
    Suffix(String),
    /// `uploads/temp`: a contiguous run of components.
    Sequence(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().trim().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| {
                let suffix = p.trim_start_matches('*');
                if suffix.len() < p.len() && !suffix.is_empty() {
                    Pattern::Suffix(suffix.to_string())
                } else if p.contains('/') {
                    Pattern::Sequence(p.split('/').map(str::to_string).collect())
                } else {
                    Pattern::Component(p.to_string())
                }
            })
            .collect();
        Self { patterns }
    }

    /// `relative` is the path below the target root; the root itself is never
    /// excluded.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        let components: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if components.is_empty() {
            return false;
        }
        self.patterns.iter().any(|pattern| match pattern {
            Pattern::Component(name) => components.iter().any(|c| c == name),
            Pattern::Suffix(suffix) => components
                .last()
                .map(|c| c.ends_with(suffix.as_str()))
                .unwrap_or(false),
            Pattern::Sequence(seq) => components
                .windows(seq.len())
                .any(|w| w.iter().zip(seq).all(|(a, b)| a == b)),
        })
    }
}

pub struct ArchiveService {
    excludes: ExcludeSet,
}

impl ArchiveService {
    pub fn new(excludes: ExcludeSet) -> Self {
        Self { excludes }
    }

    pub fn build_full_archive(
        &self,
        targets: &BackupTargets,
        dumps: &[DatabaseDump],
        output: &Path,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let files = write_atomically(output, |builder| {
            let mut count = 0;
            for dump in dumps {
                let name = Path::new(DUMPS_PREFIX).join(
                    dump.path
                        .file_name()
                        .unwrap_or_else(|| dump.database.as_ref()),
                );
                builder
                    .append_path_with_name(&dump.path, &name)
                    .map_err(|source| ArchiveError::Append {
                        path: dump.path.display().to_string(),
                        source,
                    })?;
                count += 1;
            }
            for root in &targets.filesystem_paths {
                count += self.append_tree(builder, root, None)?;
            }
            Ok(count)
        })?;
        info!(path = %output.display(), files, databases = dumps.len(), "full archive created");
        Ok(ArchiveSummary {
            kind: BackupKind::Full,
            files,
            path: output.to_path_buf(),
        })
    }

    /// Archive only files modified after `baseline`. Without a baseline there
    /// is nothing to be differential against, so this builds a full archive
    /// from `dumps` instead.
    pub fn build_differential_archive(
        &self,
        targets: &BackupTargets,
        baseline: Option<DateTime<Utc>>,
        dumps: &[DatabaseDump],
        output: &Path,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let Some(baseline) = baseline else {
            warn!("no baseline full backup; building a full archive instead");
            return self.build_full_archive(targets, dumps, output);
        };

        let files = write_atomically(output, |builder| {
            let mut count = 0;
            for root in &targets.filesystem_paths {
                count += self.append_tree(builder, root, Some(baseline))?;
            }
            Ok(count)
        })?;
        if files == 0 {
            info!(baseline = %baseline, "no files changed since the baseline");
        }
        info!(path = %output.display(), files, baseline = %baseline, "differential archive created");
        Ok(ArchiveSummary {
            kind: BackupKind::Diff,
            files,
            path: output.to_path_buf(),
        })
    }

    /// Returns the number of regular files appended.
    fn append_tree<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        root: &Path,
        modified_after: Option<DateTime<Utc>>,
    ) -> Result<usize, ArchiveError> {
        let mut count = 0;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                let rel = e.path().strip_prefix(root).unwrap_or(e.path());
                !self.excludes.is_excluded(rel)
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if is_vanished(&e) => {
                    warn!(error = %e, "path vanished during archiving; skipped");
                    continue;
                }
                Err(source) => {
                    return Err(ArchiveError::Walk {
                        path: root.display().to_string(),
                        source,
                    })
                }
            };
            let file_type = entry.file_type();
            let path = entry.path();

            if let Some(after) = modified_after {
                // Differential runs carry changed files only, like `find -newer -type f`.
                if !file_type.is_file() {
                    continue;
                }
                let modified = match entry.metadata() {
                    Ok(meta) => meta.modified().ok().map(DateTime::<Utc>::from),
                    Err(e) if is_vanished(&e) => continue,
                    Err(source) => {
                        return Err(ArchiveError::Walk {
                            path: path.display().to_string(),
                            source,
                        })
                    }
                };
                if modified.map_or(true, |m| m <= after) {
                    continue;
                }
            }

            let name = archive_name(path);
            if name.as_os_str().is_empty() {
                continue;
            }
            let appended = if file_type.is_dir() {
                builder.append_dir(&name, path)
            } else {
                builder.append_path_with_name(path, &name)
            };
            match appended {
                Ok(()) => {
                    if file_type.is_file() {
                        count += 1;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(path = %path.display(), "file vanished during archiving; skipped");
                }
                Err(source) => {
                    return Err(ArchiveError::Append {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(count)
    }
}

/// Build the archive at a staging name beside `output` and rename it into
/// place only once it is complete and synced.
fn write_atomically<F>(output: &Path, fill: F) -> Result<usize, ArchiveError>
where
    F: FnOnce(&mut tar::Builder<GzEncoder<BufWriter<File>>>) -> Result<usize, ArchiveError>,
{
    let staging = staging_path_for(output);
    let write_err = |source: io::Error| ArchiveError::Write {
        path: output.display().to_string(),
        source,
    };

    let result = (|| -> Result<usize, ArchiveError> {
        let file = File::create(&staging).map_err(write_err)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        let count = fill(&mut builder)?;
        let encoder = builder.into_inner().map_err(write_err)?;
        let writer = encoder.finish().map_err(write_err)?;
        let file = writer.into_inner().map_err(|e| write_err(e.into_error()))?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&staging, output).map_err(write_err)?;
        Ok(count)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn archive_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn is_vanished(e: &walkdir::Error) -> bool {
    e.io_error()
        .map(|io| io.kind() == ErrorKind::NotFound)
        .unwrap_or(false)
}
