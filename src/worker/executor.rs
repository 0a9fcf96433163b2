use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::scheduler::{Job, JobState};
use crate::worker::stager::{INPUT_FILENAME, OUTPUT_FILENAME};

/// Runs the external compute program against a staged working directory.
///
/// The process is started as `<program> <workdir>/input.inp` with the
/// working directory as its cwd. Both stdout and stderr are attached to the
/// job's output log, so the log grows while the process runs.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the job to completion. Returns whether the process exited successfully.
    ///
    /// Cancelling `cancel` kills the process and yields [`ExecutionError::Cancelled`].
    pub async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<bool, ExecutionError> {
        if job.state != JobState::Running {
            return Err(ExecutionError::InvalidState(job.state));
        }

        let log_path = output_log_path(job);
        let stdout = open_log(&log_path).await?;
        let stderr = stdout
            .try_clone()
            .map_err(|source| ExecutionError::OutputLog {
                path: log_path.clone(),
                source,
            })?;

        let input = job.working_directory.join(INPUT_FILENAME);
        let program = self.config.program.display().to_string();
        tracing::info!(job_id = %job.id, program = %program, input = %input.display(), "Launching job process");

        let mut child = Command::new(&self.config.program)
            .arg(&input)
            .current_dir(&job.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                tracing::error!(job_id = %job.id, program = %program, error = %source, "Job launch failed");
                ExecutionError::LaunchError {
                    program: program.clone(),
                    source,
                }
            })?;

        let timeout = self.config.timeout;
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = deadline => Waited::TimedOut,
        };

        let status = match waited {
            Waited::Exited(status) => status.map_err(ExecutionError::Wait)?,
            Waited::Cancelled => {
                tracing::info!(job_id = %job.id, "Killing cancelled job process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to kill job process");
                }
                return Err(ExecutionError::Cancelled);
            }
            Waited::TimedOut => {
                let limit = timeout.unwrap_or_default();
                tracing::warn!(job_id = %job.id, ?limit, "Job exceeded time limit, killing process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to kill job process");
                }
                return Err(ExecutionError::TimedOut(limit));
            }
        };

        tracing::info!(
            job_id = %job.id,
            success = status.success(),
            exit_code = ?status.code(),
            "Job process exited"
        );
        Ok(status.success())
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Where a job's process output is written.
pub fn output_log_path(job: &Job) -> PathBuf {
    job.output_artifact_path
        .clone()
        .unwrap_or_else(|| job.working_directory.join(OUTPUT_FILENAME))
}

async fn open_log(path: &Path) -> Result<std::fs::File, ExecutionError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| ExecutionError::OutputLog {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.into_std().await)
}
