//! # hive-registry
//!
//! Tracks contributor agents: what they can run, whether they are alive,
//! and which job (if any) is reserved on each of them.
//!
//! Reservation is a test-and-set on the agent record's version, so two
//! schedulers racing for the same agent cannot both win, and an agent
//! evicted between selection and commit is never handed a job.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod registry;

pub use error::RegistryError;
pub use registry::{Registry, RegistryConfig};
