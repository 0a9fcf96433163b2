use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Staging,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Transitions only move forward and never leave a terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Staging | Failed | Cancelled)
                | (Staging, Running | Failed | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Staging => write!(f, "staging"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where an input artifact's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    Url(String),
    Path(PathBuf),
}

impl ArtifactSource {
    /// `http://` and `https://` references are downloaded, anything else is a
    /// local path (an optional `file://` prefix is stripped).
    pub fn parse(reference: &str) -> Self {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            ArtifactSource::Url(reference.to_string())
        } else {
            let path = reference.strip_prefix("file://").unwrap_or(reference);
            ArtifactSource::Path(PathBuf::from(path))
        }
    }
}

impl std::fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactSource::Url(url) => write!(f, "{}", url),
            ArtifactSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputArtifact {
    pub filename: String,
    pub source: ArtifactSource,
}

impl InputArtifact {
    pub fn new(filename: impl Into<String>, source: ArtifactSource) -> Self {
        Self {
            filename: filename.into(),
            source,
        }
    }

    /// Build an artifact from a reference, taking the filename from its last
    /// path segment.
    pub fn from_reference(reference: &str) -> Self {
        let source = ArtifactSource::parse(reference);
        let filename = reference
            .split(['?', '#'])
            .next()
            .unwrap_or(reference)
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("input")
            .to_string();
        Self { filename, source }
    }
}

/// One submitted computation request.
///
/// `input_artifacts[0]` is the primary input; the rest are auxiliary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub working_directory: PathBuf,
    pub input_artifacts: Vec<InputArtifact>,
    pub output_artifact_path: Option<PathBuf>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_outcome: Option<bool>,
}

impl Job {
    pub fn new(
        author: impl Into<String>,
        input_artifacts: Vec<InputArtifact>,
        mount_root: &Path,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), author, input_artifacts, mount_root)
    }

    pub fn with_id(
        id: Uuid,
        author: impl Into<String>,
        input_artifacts: Vec<InputArtifact>,
        mount_root: &Path,
    ) -> Self {
        let name = input_artifacts
            .first()
            .map(|a| sanitize_name(&a.filename))
            .unwrap_or_else(|| "job".to_string());
        let working_directory = mount_root.join(format!("{}-{}", name, id.simple()));

        Self {
            id,
            name,
            author: author.into(),
            working_directory,
            input_artifacts,
            output_artifact_path: None,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_outcome: None,
        }
    }

    /// Move to `next`, stamping timestamps and the exit outcome.
    ///
    /// Returns the rejected pair when the transition would go backwards.
    pub fn transition(&mut self, next: JobState) -> Result<(), (JobState, JobState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }

        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if self.state == JobState::Running {
            self.finished_at = Some(now);
        }
        match next {
            JobState::Succeeded => self.exit_outcome = Some(true),
            JobState::Failed => self.exit_outcome = Some(false),
            _ => {}
        }

        tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "Job transition");
        self.state = next;
        Ok(())
    }

    /// Run time for reporting only.
    pub fn elapsed(&self) -> Option<TimeDelta> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Render a duration as `1h 2m 3s`, dropping leading zero units.
pub fn format_elapsed(elapsed: TimeDelta) -> String {
    let total = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Reduce a filename to a safe path segment built from its stem.
pub fn sanitize_name(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();

    if cleaned.chars().all(|c| c == '_') {
        "job".to_string()
    } else {
        cleaned
    }
}
