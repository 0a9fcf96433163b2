use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::job::{Job, JobState};

/// Result of admitting a staged job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job took the free running slot.
    Started,
    /// The job waits in the backlog at this 1-based position.
    Queued { position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the backlog and marked cancelled.
    Removed,
    /// The job holds the running slot; its process must be told to stop.
    Running,
}

/// What the presence indicator should display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "name", rename_all = "snake_case")]
pub enum Activity {
    Running(String),
    Next(String),
    Idle,
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activity::Running(name) => write!(f, "Running {}", name),
            Activity::Next(name) => write!(f, "Next up: {}", name),
            Activity::Idle => write!(f, "Idle"),
        }
    }
}

/// Single-slot job queue: one running job, a FIFO backlog, and an archive of
/// every job ever admitted.
#[derive(Debug, Default)]
pub struct JobQueue {
    archive: HashMap<Uuid, Job>,
    order: Vec<Uuid>,
    backlog: VecDeque<Uuid>,
    running: Option<Uuid>,
    capacity: Option<usize>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue whose archive evicts the oldest finished jobs past `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Insert into the archive unless a job with the same id is already there.
    /// Returns true if the job was inserted.
    pub fn archive(&mut self, job: Job) -> bool {
        if self.archive.contains_key(&job.id) {
            return false;
        }
        self.order.push(job.id);
        self.archive.insert(job.id, job);
        true
    }

    /// Admit a staged job: take the slot if it is free, otherwise join the backlog.
    pub fn admit(&mut self, job: Job) -> Result<Admission, SchedulerError> {
        let id = job.id;
        if self.running == Some(id) || self.backlog.contains(&id) {
            return Err(SchedulerError::AlreadyAdmitted(id));
        }
        if !job.state.can_transition_to(JobState::Running) {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Running,
            });
        }

        self.archive(job);

        if self.running.is_some() {
            self.backlog.push_back(id);
            let position = self.backlog.len();
            tracing::info!(job_id = %id, position, "Job queued behind running job");
            Ok(Admission::Queued { position })
        } else {
            self.promote(id)?;
            Ok(Admission::Started)
        }
    }

    /// Release the running slot with a terminal `outcome` and start the next
    /// backlog job. Returns the id of the job that was started, if any.
    pub fn complete(&mut self, id: Uuid, outcome: JobState) -> Result<Option<Uuid>, SchedulerError> {
        if self.running != Some(id) {
            return Err(SchedulerError::NotRunning(id));
        }
        if !outcome.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: JobState::Running,
                to: outcome,
            });
        }

        self.transition(id, outcome)?;
        self.running = None;
        tracing::info!(job_id = %id, outcome = %outcome, "Job released running slot");

        let next = self.promote_next();
        self.evict_finished();
        Ok(next)
    }

    /// Cancel a job waiting in the backlog, or report that it is running.
    pub fn cancel(&mut self, id: Uuid) -> Result<CancelOutcome, SchedulerError> {
        if self.running == Some(id) {
            return Ok(CancelOutcome::Running);
        }
        if let Some(pos) = self.backlog.iter().position(|queued| *queued == id) {
            self.transition(id, JobState::Cancelled)?;
            self.backlog.remove(pos);
            tracing::info!(job_id = %id, "Queued job cancelled");
            return Ok(CancelOutcome::Removed);
        }

        match self.archive.get(&id) {
            Some(job) => Err(SchedulerError::NotCancellable {
                id,
                state: job.state,
            }),
            None => Err(SchedulerError::JobNotFound(id)),
        }
    }

    pub fn activity(&self) -> Activity {
        let name_of = |id: &Uuid| self.archive.get(id).map(|j| j.name.clone());
        if let Some(name) = self.running.as_ref().and_then(name_of) {
            Activity::Running(name)
        } else if let Some(name) = self.backlog.front().and_then(name_of) {
            Activity::Next(name)
        } else {
            Activity::Idle
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.archive.get(id)
    }

    /// Archived jobs in admission order.
    pub fn jobs(&self) -> Vec<&Job> {
        self.order
            .iter()
            .filter_map(|id| self.archive.get(id))
            .collect()
    }

    pub fn running(&self) -> Option<&Job> {
        self.running.as_ref().and_then(|id| self.archive.get(id))
    }

    pub fn running_id(&self) -> Option<Uuid> {
        self.running
    }

    pub fn backlog(&self) -> Vec<Uuid> {
        self.backlog.iter().copied().collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Number of archived jobs
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    /// Drop the oldest finished jobs until the archive fits its capacity.
    /// Active jobs are never evicted. Returns the number of jobs removed.
    pub fn evict_finished(&mut self) -> usize {
        let Some(capacity) = self.capacity else {
            return 0;
        };

        let mut excess = self.archive.len().saturating_sub(capacity);
        if excess == 0 {
            return 0;
        }

        let archive = &mut self.archive;
        let before = self.order.len();
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let finished = archive.get(id).is_some_and(|j| j.is_terminal());
            if finished {
                archive.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
        let removed = before - self.order.len();
        if removed > 0 {
            tracing::debug!(removed, "Evicted finished jobs from archive");
        }
        removed
    }

    fn promote_next(&mut self) -> Option<Uuid> {
        while let Some(id) = self.backlog.pop_front() {
            match self.promote(id) {
                Ok(()) => return Some(id),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Skipping unstartable backlog job"),
            }
        }
        None
    }

    fn promote(&mut self, id: Uuid) -> Result<(), SchedulerError> {
        self.transition(id, JobState::Running)?;
        self.running = Some(id);
        tracing::info!(job_id = %id, "Job started");
        Ok(())
    }

    fn transition(&mut self, id: Uuid, to: JobState) -> Result<(), SchedulerError> {
        let job = self
            .archive
            .get_mut(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        job.transition(to)
            .map_err(|(from, to)| SchedulerError::InvalidTransition { id, from, to })
    }
}
