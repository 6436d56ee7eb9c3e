//! # hive-scheduler
//!
//! The job side of ComputeHive:
//!
//! - [`lifecycle`]: the job state machine. Every status change goes through
//!   [`JobLifecycle`], which validates it against the transition table,
//!   commits it optimistically and settles escrow.
//! - [`retry`]: backoff and retry budgets for job faults and lost agents.
//! - [`scheduler`]: admission of direct submissions and the best-fit
//!   scheduling tick.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hive_scheduler::{DirectScheduler, SchedulerConfig};
//!
//! let job = scheduler.submit_job(submission)?;
//! let report = scheduler.tick();
//! assert_eq!(report.scheduled, 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;

pub use error::SchedulerError;
pub use lifecycle::JobLifecycle;
pub use retry::{InfraDecision, RetryDecision, RetryPolicy};
pub use scheduler::{DirectScheduler, SchedulerConfig, TickReport};
