//! Error types for job scheduling and lifecycle management.

use hive_proto::{AgentId, CollaboratorError, ErrorKind, JobId, JobState, ProtoError, ValidationError};
use hive_registry::RegistryError;
use thiserror::Error;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur while admitting, scheduling or driving jobs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Submission or report failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Job not found.
    #[error("job not found: {0}")]
    UnknownJob(JobId),

    /// The transition table does not declare the requested move.
    #[error("job {job_id}: invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Job.
        job_id: JobId,
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },

    /// A status report came from an agent the job is not assigned to.
    #[error("job {job_id} is not assigned to agent {agent_id}")]
    WrongAgent {
        /// Job.
        job_id: JobId,
        /// Reporting agent.
        agent_id: AgentId,
    },

    /// Concurrent writers kept winning.
    #[error("job {0} was modified concurrently")]
    Conflict(JobId),

    /// Escrow could not be opened for a submission.
    #[error("escrow rejected: {0}")]
    Escrow(CollaboratorError),

    /// Agent registry refused the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SchedulerError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownJob(_) => ErrorKind::UnknownEntity,
            Self::InvalidTransition { .. } | Self::WrongAgent { .. } | Self::Conflict(_) => {
                ErrorKind::Conflict
            }
            Self::Escrow(e) => e.kind(),
            Self::Registry(e) => e.kind(),
        }
    }

    pub(crate) fn from_proto(job_id: JobId, err: ProtoError) -> Self {
        match err {
            ProtoError::InvalidTransition { from, to } => Self::InvalidTransition { job_id, from, to },
            ProtoError::Validation(e) => Self::Validation(e),
            ProtoError::InvalidId { kind, reason } => {
                Self::Validation(ValidationError::new(kind, reason))
            }
        }
    }
}
