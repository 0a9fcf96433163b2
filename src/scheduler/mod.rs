pub mod job;
pub mod queue;
pub mod slot;

pub use job::{ArtifactSource, InputArtifact, Job, JobState};
pub use queue::{Activity, Admission, CancelOutcome, JobQueue};
pub use slot::Scheduler;
