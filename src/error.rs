use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Primary input artifact was not provided")]
    MissingPrimaryInput,

    #[error("Too many input artifacts: {given} given, at most {max} allowed")]
    TooManyArtifacts { given: usize, max: usize },

    #[error("Job must be queued to be staged, found {0}")]
    InvalidState(JobState),

    #[error("Working directory already exists: {}", .0.display())]
    DirectoryConflict(PathBuf),

    #[error("Failed to transfer {filename}: {reason}")]
    TransferError { filename: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to launch {program}: {source}")]
    LaunchError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open output log {}: {source}", path.display())]
    OutputLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for process exit: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job exceeded its time limit of {0:?}")]
    TimedOut(std::time::Duration),

    #[error("Job must be running to execute, found {0}")]
    InvalidState(JobState),
}

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Archive is {size} bytes, over the {limit} byte limit")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("Job must be finished before packaging, found {0}")]
    NotTerminal(JobState),

    #[error("I/O error while packaging: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Packaging task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} does not hold the running slot")]
    NotRunning(Uuid),

    #[error("Job {id} cannot be cancelled in state {state}")]
    NotCancellable { id: Uuid, state: JobState },

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Job {0} was already admitted")]
    AlreadyAdmitted(Uuid),

    #[error("Job {0} was cancelled before it started")]
    CancelledWhileQueued(Uuid),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    Closed,

    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Setup is not complete, run the setup command first")]
    AdmissionRejected,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Input source not allowed: {0}")]
    SourceNotAllowed(String),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
