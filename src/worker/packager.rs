use std::fs::File;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::PackagingError;
use crate::scheduler::Job;
use crate::worker::executor::output_log_path;

/// What can be handed to the requester for a finished job.
#[derive(Debug)]
pub enum Delivery {
    /// Zip of the whole working directory.
    Archive(PathBuf),
    /// Packaging failed; the raw output log is sent instead.
    OutputLog { path: PathBuf, reason: PackagingError },
    /// Neither an archive nor an output log exists.
    Nothing { reason: PackagingError },
}

/// Bundles a finished job's working directory into a single zip.
#[derive(Debug, Clone, Default)]
pub struct Packager;

impl Packager {
    pub fn new() -> Self {
        Self
    }

    /// Zip every file in the job's working directory into `<workdir>/<name>.zip`.
    ///
    /// Files that cannot be read are skipped. An archive larger than
    /// `max_bytes` is removed and reported as [`PackagingError::ArchiveTooLarge`].
    pub async fn package(&self, job: &Job, max_bytes: u64) -> Result<PathBuf, PackagingError> {
        if !job.is_terminal() {
            return Err(PackagingError::NotTerminal(job.state));
        }

        let dir = job.working_directory.clone();
        let archive = archive_path(job);
        let job_id = job.id;

        let built = archive.clone();
        let (files, size) = tokio::task::spawn_blocking(move || build_archive(&dir, &built))
            .await
            .map_err(|e| PackagingError::Task(e.to_string()))??;

        if size > max_bytes {
            tracing::warn!(job_id = %job_id, size, limit = max_bytes, "Archive over size limit");
            if let Err(e) = tokio::fs::remove_file(&archive).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to remove oversized archive");
            }
            return Err(PackagingError::ArchiveTooLarge {
                size,
                limit: max_bytes,
            });
        }

        tracing::info!(job_id = %job_id, files, size, path = %archive.display(), "Job archive built");
        Ok(archive)
    }

    /// Package the job, falling back to its output log when that fails.
    pub async fn deliverable(&self, job: &Job, max_bytes: u64) -> Delivery {
        match self.package(job, max_bytes).await {
            Ok(path) => Delivery::Archive(path),
            Err(reason) => {
                let log = output_log_path(job);
                if tokio::fs::try_exists(&log).await.unwrap_or(false) {
                    tracing::info!(job_id = %job.id, reason = %reason, "Delivering output log instead of archive");
                    Delivery::OutputLog { path: log, reason }
                } else {
                    tracing::warn!(job_id = %job.id, reason = %reason, "No output log to deliver");
                    Delivery::Nothing { reason }
                }
            }
        }
    }
}

pub fn archive_path(job: &Job) -> PathBuf {
    job.working_directory.join(format!("{}.zip", job.name))
}

/// Returns the number of files written and the archive size in bytes.
fn build_archive(dir: &Path, archive: &Path) -> Result<(usize, u64), PackagingError> {
    let mut files = Vec::new();
    collect_files(dir, dir, archive, &mut files)?;
    files.sort();

    let mut zip = ZipWriter::new(File::create(archive)?);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut written = 0;
    for relative in &files {
        let path = dir.join(relative);
        let mut source = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let large = source
            .metadata()
            .map(|m| m.len() >= u32::MAX as u64)
            .unwrap_or(false);

        let entry = relative.to_string_lossy().replace('\\', "/");
        zip.start_file(entry, options.large_file(large))?;
        std::io::copy(&mut source, &mut zip)?;
        written += 1;
    }

    zip.finish()?;
    let size = std::fs::metadata(archive)?.len();
    Ok((written, size))
}

/// Collect paths relative to `root`, skipping the archive being written.
fn collect_files(
    root: &Path,
    dir: &Path,
    archive: &Path,
    files: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if path == archive {
            continue;
        }
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {
                if let Err(e) = collect_files(root, &path, archive, files) {
                    tracing::warn!(dir = %path.display(), error = %e, "Skipping unreadable directory");
                }
            }
            Ok(kind) if kind.is_file() => {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping entry with unknown type");
            }
        }
    }
    Ok(())
}
