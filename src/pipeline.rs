use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::{HostConfig, RunnerConfig};
use crate::error::{ExecutionError, PackagingError, Result, RunnerError, SchedulerError};
use crate::notify::{send_best_effort, AttachmentKind, Notification, NotificationSink};
use crate::scheduler::job::format_elapsed;
use crate::scheduler::{
    Activity, Admission, CancelOutcome, InputArtifact, Job, JobQueue, JobState, Scheduler,
};
use crate::worker::executor::output_log_path;
use crate::worker::{Delivery, JobExecutor, OutputRelay, Packager, Stager};

/// A request to run one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub author: String,
    /// The first input is the primary one.
    pub inputs: Vec<InputArtifact>,
}

/// Handle to a job whose pipeline is running in the background.
#[derive(Debug)]
pub struct Submitted {
    pub job_id: Uuid,
    pub handle: JoinHandle<JobState>,
}

/// Wires the components together and drives each job from request to delivery.
///
/// Per job: stage -> admit -> wait for the slot -> run with relay ->
/// release the slot -> summary, delivery, ping. The slot is released on
/// every path once the job has started, including when any step of the job
/// task panics.
pub struct Pipeline {
    config: RunnerConfig,
    /// Current host settings, refreshed from `config.host_file` on submit.
    host: RwLock<HostConfig>,
    tasks: TaskTracker,
    stager: Stager,
    scheduler: Arc<Scheduler>,
    executor: JobExecutor,
    relay: OutputRelay,
    packager: Packager,
    sink: Arc<dyn NotificationSink>,
}

impl Pipeline {
    pub fn new(config: RunnerConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let queue = match config.archive_capacity {
            Some(capacity) => JobQueue::with_capacity(capacity),
            None => JobQueue::new(),
        };
        Self {
            host: RwLock::new(config.host.clone()),
            tasks: TaskTracker::new(),
            stager: Stager::new(config.max_auxiliary),
            scheduler: Arc::new(Scheduler::new(queue)),
            executor: JobExecutor::new(config.executor.clone()),
            relay: OutputRelay::new(config.relay.clone()),
            packager: Packager::new(),
            sink,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Host settings as of the last submit.
    pub async fn host(&self) -> HostConfig {
        self.host.read().await.clone()
    }

    /// Accept a request and process it in the background.
    ///
    /// Rejected with [`RunnerError::AdmissionRejected`] until setup is complete
    /// and with [`RunnerError::ShuttingDown`] once [`Pipeline::shutdown`] began.
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> Result<Submitted> {
        if self.tasks.is_closed() {
            return Err(RunnerError::ShuttingDown);
        }
        let host = self.refresh_host().await;
        if !host.is_complete() {
            return Err(RunnerError::AdmissionRejected);
        }

        let job = Job::new(request.author, request.inputs, &host.mount_root());
        let job_id = job.id;
        tracing::info!(job_id = %job_id, name = %job.name, author = %job.author, "Job submitted");

        let pipeline = Arc::clone(self);
        let handle = self.tasks.spawn(async move { pipeline.supervise(job).await });
        Ok(Submitted { job_id, handle })
    }

    async fn refresh_host(&self) -> HostConfig {
        if let Some(path) = &self.config.host_file {
            match HostConfig::read(path).await {
                Ok(host) => *self.host.write().await = host,
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to reload host settings, keeping previous values"
                ),
            }
        }
        self.host.read().await.clone()
    }

    /// Run [`Pipeline::process`] in its own task and clean up after it if it
    /// panics, so the slot and the requester are never left waiting.
    async fn supervise(self: Arc<Self>, job: Job) -> JobState {
        let submitted = job.clone();
        let pipeline = Arc::clone(&self);
        match tokio::spawn(async move { pipeline.process(job).await }).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(job_id = %submitted.id, error = %e, "Job task aborted, recovering");
                self.recover(submitted).await
            }
        }
    }

    async fn recover(&self, mut job: Job) -> JobState {
        let id = job.id;
        let finished = match self.scheduler.get(&id).await {
            Some(current) if current.is_terminal() => return current.state,
            Some(current) => {
                let running = current.state == JobState::Running;
                // stops the process if it is still alive
                if let Err(e) = self.scheduler.cancel(id).await {
                    tracing::warn!(job_id = %id, error = %e, "Could not cancel aborted job");
                }
                if running {
                    if let Err(e) = self.scheduler.complete(id, JobState::Failed).await {
                        tracing::error!(job_id = %id, error = %e, "Failed to release running slot");
                    }
                }
                self.scheduler.get(&id).await.unwrap_or(current)
            }
            None => {
                if let Err((from, to)) = job.transition(JobState::Failed) {
                    tracing::warn!(job_id = %id, %from, %to, "Could not mark job failed");
                }
                self.scheduler.record_failed(job.clone()).await;
                job
            }
        };

        self.summarize(&finished, Some("internal error while running the job".to_string()))
            .await;
        self.ping(&finished).await;
        finished.state
    }

    /// Drive one job to a terminal state and report it. Returns the final state.
    pub async fn process(&self, mut job: Job) -> JobState {
        let id = job.id;
        self.progress(id, format!("Preparing calculation on {}", job.name))
            .await;

        if let Err(e) = self.stager.stage(&mut job).await {
            tracing::warn!(job_id = %id, error = %e, "Job failed during staging");
            let state = job.state;
            self.scheduler.record_failed(job.clone()).await;
            self.summarize(&job, Some(e.to_string())).await;
            self.ping(&job).await;
            return state;
        }
        self.progress(id, "Files received").await;

        let staged = job.clone();
        match self.scheduler.admit(job).await {
            Ok(Admission::Started) => {
                self.progress(id, "Starting calculation now").await;
            }
            Ok(Admission::Queued { position }) => {
                self.progress(
                    id,
                    format!("Calculation queued at position {} in the backlog", position),
                )
                .await;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Job could not be admitted");
                self.summarize(&staged, Some(e.to_string())).await;
                self.ping(&staged).await;
                return staged.state;
            }
        }
        // admitted after shutdown's cancel sweep
        if self.tasks.is_closed() {
            if let Err(e) = self.scheduler.cancel(id).await {
                tracing::debug!(job_id = %id, error = %e, "Late cancel for shutdown failed");
            }
        }

        let cancel = match self.scheduler.wait_until_running(id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::info!(job_id = %id, reason = %e, "Job left the backlog without running");
                let job = self.scheduler.get(&id).await.unwrap_or(staged);
                self.summarize(&job, None).await;
                self.ping(&job).await;
                return job.state;
            }
        };

        let running = self.scheduler.get(&id).await.unwrap_or(staged);
        self.progress(
            id,
            format!("Running calculation on {} - {}", running.name, running.author),
        )
        .await;

        let (outcome, detail) = self.execute(running.clone(), cancel).await;

        let finished = match self.scheduler.complete(id, outcome).await {
            Ok(next) => {
                if let Some(next) = next {
                    tracing::info!(job_id = %id, next_job_id = %next, "Running slot handed over");
                }
                self.scheduler.get(&id).await.unwrap_or(running)
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to release running slot");
                running
            }
        };

        self.summarize(&finished, detail).await;
        self.deliver(&finished).await;
        self.ping(&finished).await;
        outcome
    }

    /// Run the process with the output relay alongside it. Never panics: a
    /// panicking run task is reported as a failure.
    async fn execute(&self, job: Job, cancel: CancellationToken) -> (JobState, Option<String>) {
        let id = job.id;
        let stop = CancellationToken::new();
        let _stop_relay = stop.clone().drop_guard();

        let relay = {
            let relay = self.relay.clone();
            let sink = Arc::clone(&self.sink);
            let path = output_log_path(&job);
            let stop = stop.clone();
            tokio::spawn(async move { relay.run(id, path, sink.as_ref(), stop).await })
        };

        let executor = self.executor.clone();
        let run = tokio::spawn(async move { executor.run(&job, cancel).await }).await;

        stop.cancel();
        if let Err(e) = relay.await {
            tracing::warn!(job_id = %id, error = %e, "Output relay task failed");
        }

        match run {
            Ok(Ok(true)) => (JobState::Succeeded, None),
            Ok(Ok(false)) => (JobState::Failed, None),
            Ok(Err(ExecutionError::Cancelled)) => (JobState::Cancelled, None),
            Ok(Err(e)) => {
                tracing::error!(job_id = %id, error = %e, "Job execution failed");
                (JobState::Failed, Some(e.to_string()))
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Job run task aborted");
                (JobState::Failed, Some("internal error while running the job".to_string()))
            }
        }
    }

    async fn summarize(&self, job: &Job, detail: Option<String>) {
        let elapsed = job.elapsed().map(format_elapsed);
        let timing = elapsed
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();

        let mut text = match job.state {
            JobState::Succeeded => {
                format!("Server has completed the calculation on {}{}", job.name, timing)
            }
            JobState::Cancelled => format!("Calculation on {} was cancelled{}", job.name, timing),
            _ => format!(
                "Server has encountered errors while running the calculation on {}{}",
                job.name, timing
            ),
        };
        if let Some(detail) = detail {
            text.push_str(&format!("\n{}", detail));
        }
        if job.state == JobState::Failed && job.output_artifact_path.is_some() {
            text.push_str("\nCheck the output file for errors.");
        }

        send_best_effort(
            self.sink.as_ref(),
            Notification::Summary {
                job_id: job.id,
                success: job.state == JobState::Succeeded,
                elapsed,
                text,
            },
        )
        .await;
    }

    async fn deliver(&self, job: &Job) {
        let host = self.host().await;
        let limit = host.max_archive_bytes().unwrap_or(u64::MAX);
        match self.packager.deliverable(job, limit).await {
            Delivery::Archive(path) => {
                self.attach(job.id, path, AttachmentKind::Archive).await;
            }
            Delivery::OutputLog { path, reason } => {
                let mut text = format!("Could not deliver the full archive: {}", reason);
                if matches!(reason, PackagingError::ArchiveTooLarge { .. }) {
                    if let Some(hint) = copy_hint(&host, &job.working_directory) {
                        text.push_str(&format!(
                            "\nCopy the job directory from the host with:\n{}",
                            hint
                        ));
                    }
                }
                self.progress(job.id, text).await;
                self.attach(job.id, path, AttachmentKind::OutputLog).await;
            }
            Delivery::Nothing { reason } => {
                self.progress(job.id, format!("No output files to deliver: {}", reason))
                    .await;
            }
        }
    }

    async fn attach(&self, job_id: Uuid, path: std::path::PathBuf, kind: AttachmentKind) {
        send_best_effort(
            self.sink.as_ref(),
            Notification::Attachment { job_id, path, kind },
        )
        .await;
    }

    async fn progress(&self, job_id: Uuid, text: impl Into<String>) {
        send_best_effort(
            self.sink.as_ref(),
            Notification::Progress {
                job_id,
                text: text.into(),
            },
        )
        .await;
    }

    async fn ping(&self, job: &Job) {
        send_best_effort(
            self.sink.as_ref(),
            Notification::Ping {
                job_id: job.id,
                author: job.author.clone(),
            },
        )
        .await;
    }

    pub async fn cancel(&self, id: Uuid) -> std::result::Result<CancelOutcome, SchedulerError> {
        self.scheduler.cancel(id).await
    }

    pub async fn activity(&self) -> Activity {
        self.scheduler.activity().await
    }

    pub async fn job(&self, id: &Uuid) -> Option<Job> {
        self.scheduler.get(id).await
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.scheduler.jobs().await
    }

    /// Stop accepting jobs, cancel queued ones, stop the running process and
    /// wait until every job has sent its summary and ping.
    pub async fn shutdown(&self) {
        tracing::info!("Cancelling active jobs for shutdown");
        self.tasks.close();
        self.scheduler.cancel_all().await;
        self.tasks.wait().await;
        tracing::info!("All job tasks finished");
    }
}

/// Command a requester can run to fetch a job directory that was too large
/// to deliver.
pub fn copy_hint(host: &HostConfig, dir: &Path) -> Option<String> {
    let hostname = host.hostname.as_deref().filter(|h| !h.is_empty())?;
    let port = match host.port {
        Some(0) | None => String::new(),
        Some(port) => format!("-P {} ", port),
    };
    Some(format!("scp {}-r {}:{} .", port, hostname, dir.display()))
}
