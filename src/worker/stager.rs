use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use crate::error::StagingError;
use crate::scheduler::job::{sanitize_name, ArtifactSource, InputArtifact, Job, JobState};

/// Filename the primary input is always staged under.
pub const INPUT_FILENAME: &str = "input.inp";
/// Filename the external program's stdout and stderr are appended to.
pub const OUTPUT_FILENAME: &str = "output.out";

/// Prepares a job's working directory from its input artifacts.
#[derive(Debug, Clone)]
pub struct Stager {
    http: reqwest::Client,
    max_auxiliary: usize,
}

impl Stager {
    pub fn new(max_auxiliary: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            max_auxiliary,
        }
    }

    pub fn with_client(http: reqwest::Client, max_auxiliary: usize) -> Self {
        Self {
            http,
            max_auxiliary,
        }
    }

    /// Create the working directory and transfer every input artifact into it.
    ///
    /// On failure the job is moved to `Failed`. A partially written directory
    /// is left in place for inspection.
    pub async fn stage(&self, job: &mut Job) -> Result<(), StagingError> {
        if job.state != JobState::Queued {
            return Err(StagingError::InvalidState(job.state));
        }

        if let Err(e) = self.check_artifacts(&job.input_artifacts) {
            fail(job);
            return Err(e);
        }

        if let Err((from, to)) = job.transition(JobState::Staging) {
            tracing::error!(job_id = %job.id, %from, %to, "Unexpected state while staging");
            return Err(StagingError::InvalidState(from));
        }

        match self.populate(job).await {
            Ok(()) => {
                job.output_artifact_path = Some(job.working_directory.join(OUTPUT_FILENAME));
                tracing::info!(
                    job_id = %job.id,
                    dir = %job.working_directory.display(),
                    artifacts = job.input_artifacts.len(),
                    "Job staged"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Staging failed");
                fail(job);
                Err(e)
            }
        }
    }

    fn check_artifacts(&self, artifacts: &[InputArtifact]) -> Result<(), StagingError> {
        if artifacts.is_empty() {
            return Err(StagingError::MissingPrimaryInput);
        }
        let max = self.max_auxiliary + 1;
        if artifacts.len() > max {
            return Err(StagingError::TooManyArtifacts {
                given: artifacts.len(),
                max,
            });
        }
        Ok(())
    }

    async fn populate(&self, job: &Job) -> Result<(), StagingError> {
        let dir = &job.working_directory;
        if let Some(root) = dir.parent() {
            fs::create_dir_all(root)
                .await
                .map_err(|e| transfer_error(&root.display().to_string(), e))?;
        }
        match fs::create_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StagingError::DirectoryConflict(dir.clone()));
            }
            Err(e) => return Err(transfer_error(&dir.display().to_string(), e)),
        }

        for (index, artifact) in job.input_artifacts.iter().enumerate() {
            let target = dir.join(staged_filename(index, &artifact.filename));
            self.transfer(artifact, &target).await?;
            tracing::debug!(
                job_id = %job.id,
                source = %artifact.source,
                target = %target.display(),
                "Artifact transferred"
            );
        }
        Ok(())
    }

    async fn transfer(&self, artifact: &InputArtifact, target: &Path) -> Result<(), StagingError> {
        let name = artifact.filename.as_str();
        let mut file = File::create(target)
            .await
            .map_err(|e| transfer_error(name, e))?;

        match &artifact.source {
            ArtifactSource::Url(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| transfer_error(name, e))?;

                let mut body = std::pin::pin!(response.bytes_stream());
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|e| transfer_error(name, e))?;
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| transfer_error(name, e))?;
                }
            }
            ArtifactSource::Path(path) => {
                let mut source = File::open(path)
                    .await
                    .map_err(|e| transfer_error(name, e))?;
                tokio::io::copy(&mut source, &mut file)
                    .await
                    .map_err(|e| transfer_error(name, e))?;
            }
        }

        file.flush().await.map_err(|e| transfer_error(name, e))?;
        Ok(())
    }
}

/// Canonical name inside the working directory: the primary input is always
/// [`INPUT_FILENAME`], auxiliary inputs are numbered by position and keep
/// their extension.
pub fn staged_filename(index: usize, original: &str) -> PathBuf {
    if index == 0 {
        return PathBuf::from(INPUT_FILENAME);
    }
    let base = original.rsplit(['/', '\\']).next().unwrap_or(original);
    match base.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < base.len() => {
            let ext = sanitize_name(&base[dot + 1..]);
            PathBuf::from(format!("aux{}.{}", index, ext))
        }
        _ => PathBuf::from(format!("aux{}", index)),
    }
}

fn fail(job: &mut Job) {
    if let Err((from, to)) = job.transition(JobState::Failed) {
        tracing::warn!(job_id = %job.id, %from, %to, "Could not mark job failed");
    }
}

fn transfer_error(filename: &str, e: impl std::fmt::Display) -> StagingError {
    StagingError::TransferError {
        filename: filename.to_string(),
        reason: e.to_string(),
    }
}
