//! Error types for the agent registry.

use hive_proto::{AgentId, AgentStatus, ErrorKind, JobId, ValidationError};
use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Agent is registered and not Offline.
    #[error("agent {0} is already registered")]
    DuplicateAgent(AgentId),

    /// Agent is not in the registry.
    #[error("agent {0} not found")]
    UnknownAgent(AgentId),

    /// Agent was evicted and must register again.
    #[error("agent {0} is offline and must re-register")]
    AgentOffline(AgentId),

    /// Agent cannot take the job.
    #[error("agent {agent_id} cannot take job {job_id}: {status}")]
    AgentUnavailable {
        /// Agent asked for.
        agent_id: AgentId,
        /// Job that wanted it.
        job_id: JobId,
        /// Agent status at commit time.
        status: AgentStatus,
    },

    /// Input failed validation.
    #[error("invalid registration: {0}")]
    Validation(#[from] ValidationError),

    /// Lost every optimistic-update attempt.
    #[error("concurrent update conflict on agent {0}")]
    Conflict(AgentId),
}

impl RegistryError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownAgent(_) => ErrorKind::UnknownEntity,
            Self::DuplicateAgent(_) | Self::AgentOffline(_) | Self::Conflict(_) => {
                ErrorKind::Conflict
            }
            Self::AgentUnavailable { .. } => ErrorKind::CapacityUnavailable,
        }
    }
}
