//! # hive-node
//!
//! The ComputeHive daemon.
//!
//! This crate provides:
//!
//! - [`HiveService`], one facade over the registry, job lifecycle, direct
//!   scheduler and market
//! - TOML configuration with per-component sections
//! - Periodic workers for scheduling, matching, eviction and timeouts
//! - Logging collaborators for running without an agent transport or
//!   payment backend

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod service;
pub mod workers;

pub use collaborators::{LoggingAgentClient, LoggingPaymentGateway};
pub use config::HiveConfig;
pub use error::{NodeError, Result};
pub use service::{EvictionReport, HiveService};
pub use workers::{WorkerPeriods, Workers};
