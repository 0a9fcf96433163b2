pub mod config;
pub mod dashboard;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{Result, RunnerError};
pub use pipeline::{JobRequest, Pipeline};
