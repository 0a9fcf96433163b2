//! Components that act on a single job's working directory.
//!
//! - [`Stager`]: creates the working directory and transfers input artifacts
//! - [`JobExecutor`]: runs the external program, appending its output to the log
//! - [`OutputRelay`]: tails the output log and forwards new text while the job runs
//! - [`Packager`]: zips the finished working directory under a size limit
//!
//! # Working directory layout
//!
//! ```text
//! <mount>/<name>-<id>/
//!     input.inp        primary input
//!     aux1.xyz ...     auxiliary inputs, numbered by position
//!     output.out       stdout + stderr of the program
//!     ...              anything else the program writes
//!     <name>.zip       delivery archive
//! ```
//!
//! None of these components touch another job's directory.

pub mod executor;
pub mod packager;
pub mod relay;
pub mod stager;

pub use executor::JobExecutor;
pub use packager::{Delivery, Packager};
pub use relay::{OutputRelay, OutputTail};
pub use stager::Stager;
