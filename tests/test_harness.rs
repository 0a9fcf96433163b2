//! Shared helpers for job runner integration tests.
//!
//! The external program is always `/bin/sh`, so a job's primary input is a
//! shell script. That avoids exec'ing freshly written files.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use stagehand::config::{HostConfig, RunnerConfig};
use stagehand::notify::{ChannelSink, Notification};
use stagehand::scheduler::{ArtifactSource, InputArtifact, Job, JobState};
use stagehand::worker::stager::INPUT_FILENAME;
use stagehand::{JobRequest, Pipeline};

pub const SHELL: &str = "/bin/sh";

/// Temporary mount root plus a scratch area for artifact sources.
pub struct TestMount {
    pub dir: TempDir,
}

impl TestMount {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("sources")).expect("create sources dir");
        Self { dir }
    }

    /// Where [`TestMount::source`] writes; the upload root of [`TestMount::config`].
    pub fn sources(&self) -> PathBuf {
        self.dir.path().join("sources")
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("mount")
    }

    /// Write an artifact source file outside the mount root.
    pub fn source(&self, name: &str, contents: &str) -> InputArtifact {
        let path = self.sources().join(name);
        std::fs::write(&path, contents).unwrap();
        InputArtifact::new(name, ArtifactSource::Path(path))
    }

    pub fn host(&self, max_archive_mb: u64) -> HostConfig {
        HostConfig::new("compute.test", self.root(), 22, max_archive_mb)
    }

    pub fn config(&self) -> RunnerConfig {
        RunnerConfig::new(self.host(10))
            .with_program(SHELL)
            .with_poll_interval(Duration::from_millis(20))
            .with_upload_root(self.sources())
    }
}

/// A job already in `Running` whose working directory holds `script` as its input.
pub fn running_job(mount: &Path, script: &str) -> Job {
    let mut job = Job::new(
        "alice",
        vec![InputArtifact::new(
            "calc.inp",
            ArtifactSource::Path(PathBuf::from("/unused")),
        )],
        mount,
    );
    std::fs::create_dir_all(&job.working_directory).unwrap();
    std::fs::write(job.working_directory.join(INPUT_FILENAME), script).unwrap();
    job.output_artifact_path = Some(job.working_directory.join("output.out"));
    job.transition(JobState::Staging).unwrap();
    job.transition(JobState::Running).unwrap();
    job
}

/// A staged job that has not touched the filesystem.
pub fn staged_job(name: &str) -> Job {
    let mut job = Job::new(
        "alice",
        vec![InputArtifact::new(
            format!("{}.inp", name),
            ArtifactSource::Path(PathBuf::from("/unused")),
        )],
        Path::new("/tmp/stagehand-test"),
    );
    job.transition(JobState::Staging).unwrap();
    job
}

pub fn pipeline(config: RunnerConfig) -> (Arc<Pipeline>, UnboundedReceiver<Notification>) {
    let (sink, rx) = ChannelSink::new();
    (Arc::new(Pipeline::new(config, Arc::new(sink))), rx)
}

pub fn request(inputs: Vec<InputArtifact>) -> JobRequest {
    JobRequest {
        author: "alice".to_string(),
        inputs,
    }
}

/// Everything currently buffered in the channel.
pub fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

pub fn for_job(notifications: &[Notification], id: Uuid) -> Vec<Notification> {
    notifications
        .iter()
        .filter(|n| n.job_id() == id)
        .cloned()
        .collect()
}

pub fn count_summaries(notifications: &[Notification]) -> usize {
    notifications
        .iter()
        .filter(|n| matches!(n, Notification::Summary { .. }))
        .count()
}

pub fn count_pings(notifications: &[Notification]) -> usize {
    notifications
        .iter()
        .filter(|n| matches!(n, Notification::Ping { .. }))
        .count()
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
