//! Error types for hive-node.

use hive_market::MarketError;
use hive_proto::ErrorKind;
use hive_registry::RegistryError;
use hive_scheduler::SchedulerError;
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors surfaced by the daemon and its service facade.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Agent registry rejected the request.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Job operation failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Marketplace operation failed.
    #[error(transparent)]
    Market(#[from] MarketError),

    /// A periodic worker panicked or was cancelled.
    #[error("worker {name} failed: {reason}")]
    Worker {
        /// Worker name.
        name: &'static str,
        /// What happened.
        reason: String,
    },
}

impl NodeError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Validation,
            Self::Io(_) | Self::Worker { .. } => ErrorKind::InfrastructureFault,
            Self::Registry(e) => e.kind(),
            Self::Scheduler(e) => e.kind(),
            Self::Market(e) => e.kind(),
        }
    }
}
