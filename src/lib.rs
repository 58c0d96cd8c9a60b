//! foreman: a process-backed job scheduler.
//!
//! Jobs submitted through a [`Client`] run in separate worker processes,
//! with inter-job dependencies, a concurrency cap, progress reporting, and
//! retry after failure. The scheduler owns all job state in a single task
//! and multiplexes over one channel per process.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod spawn;
pub mod worker;

pub use client::{Client, ClientOptions, JobHandle, JobSpec};
pub use config::SchedulerConfig;
pub use error::{ForemanError, Result};
pub use scheduler::{JobId, JobState, Scheduler, SchedulerHandle};
pub use worker::{JobContext, JobRegistry};
