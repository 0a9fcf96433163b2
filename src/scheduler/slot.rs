use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::job::{Job, JobState};
use crate::scheduler::queue::{Activity, Admission, CancelOutcome, JobQueue};

#[derive(Debug)]
struct SlotState {
    queue: JobQueue,
    /// Cancels the process of the job currently holding the slot.
    token: CancellationToken,
}

/// Shared handle to the single running slot.
///
/// All mutation of the slot goes through this type. Waiters are woken through a
/// watch channel carrying the id of the running job.
#[derive(Debug)]
pub struct Scheduler {
    state: RwLock<SlotState>,
    running_tx: watch::Sender<Option<Uuid>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(JobQueue::new())
    }
}

impl Scheduler {
    pub fn new(queue: JobQueue) -> Self {
        let (running_tx, _) = watch::channel(queue.running_id());
        Self {
            state: RwLock::new(SlotState {
                queue,
                token: CancellationToken::new(),
            }),
            running_tx,
        }
    }

    pub async fn admit(&self, job: Job) -> Result<Admission, SchedulerError> {
        let mut state = self.state.write().await;
        let admission = state.queue.admit(job)?;
        if admission == Admission::Started {
            state.token = CancellationToken::new();
            self.running_tx.send_replace(state.queue.running_id());
        }
        Ok(admission)
    }

    /// Release the slot held by `id` and hand it to the next backlog job.
    pub async fn complete(
        &self,
        id: Uuid,
        outcome: JobState,
    ) -> Result<Option<Uuid>, SchedulerError> {
        let mut state = self.state.write().await;
        let next = state.queue.complete(id, outcome)?;
        state.token = CancellationToken::new();
        self.running_tx.send_replace(next);
        Ok(next)
    }

    /// Cancel a queued job, or signal the running job's process to stop.
    ///
    /// A signalled job keeps the slot until its pipeline calls [`Scheduler::complete`].
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, SchedulerError> {
        let mut state = self.state.write().await;
        let outcome = state.queue.cancel(id)?;
        match outcome {
            CancelOutcome::Removed => {
                // wake the cancelled job's waiter
                self.running_tx.send_modify(|_| {});
            }
            CancelOutcome::Running => {
                tracing::info!(job_id = %id, "Signalling running job to stop");
                state.token.cancel();
            }
        }
        Ok(outcome)
    }

    /// Cancel every queued job and signal the running one.
    pub async fn cancel_all(&self) {
        let (running, backlog) = {
            let state = self.state.read().await;
            (state.queue.running_id(), state.queue.backlog())
        };
        for id in backlog.into_iter().chain(running) {
            if let Err(e) = self.cancel(id).await {
                tracing::debug!(job_id = %id, error = %e, "Job already left the queue");
            }
        }
    }

    pub async fn archive(&self, job: Job) -> bool {
        self.state.write().await.queue.archive(job)
    }

    /// Archive a job that failed before it could be admitted.
    pub async fn record_failed(&self, job: Job) {
        debug_assert!(job.is_terminal());
        self.archive(job).await;
    }

    /// Wait until `id` holds the running slot and return its cancellation token.
    pub async fn wait_until_running(&self, id: Uuid) -> Result<CancellationToken, SchedulerError> {
        let mut running_rx = self.running_tx.subscribe();
        loop {
            {
                let state = self.state.read().await;
                let job = state.queue.get(&id).ok_or(SchedulerError::JobNotFound(id))?;
                if state.queue.running_id() == Some(id) {
                    return Ok(state.token.clone());
                }
                if job.is_terminal() {
                    return Err(SchedulerError::CancelledWhileQueued(id));
                }
            }
            if running_rx.changed().await.is_err() {
                return Err(SchedulerError::JobNotFound(id));
            }
        }
    }

    pub async fn activity(&self) -> Activity {
        self.state.read().await.queue.activity()
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.state.read().await.queue.get(id).cloned()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state
            .read()
            .await
            .queue
            .jobs()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn running(&self) -> Option<Job> {
        self.state.read().await.queue.running().cloned()
    }

    pub async fn backlog_len(&self) -> usize {
        self.state.read().await.queue.backlog_len()
    }

    /// Subscribe to changes of the running job id.
    pub fn subscribe(&self) -> watch::Receiver<Option<Uuid>> {
        self.running_tx.subscribe()
    }
}
