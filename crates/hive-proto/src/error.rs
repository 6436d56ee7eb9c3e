//! Error types shared across the ComputeHive crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobState;
use crate::validation::ValidationError;

/// Classification every component error maps onto.
///
/// The kind decides how a failure is handled: surfaced immediately,
/// retried internally, or folded into the job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input. Never retried.
    Validation,
    /// The referenced record does not exist.
    UnknownEntity,
    /// Version mismatch or an undeclared transition.
    Conflict,
    /// No agent or offer can satisfy the request right now.
    CapacityUnavailable,
    /// An agent or collaborator became unreachable.
    InfrastructureFault,
    /// The job process itself failed.
    AgentFault,
}

impl ErrorKind {
    /// Whether the core retries work that failed with this kind.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::InfrastructureFault | Self::AgentFault
        )
    }

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::UnknownEntity => "unknown_entity",
            Self::Conflict => "conflict",
            Self::CapacityUnavailable => "capacity_unavailable",
            Self::InfrastructureFault => "infrastructure_fault",
            Self::AgentFault => "agent_fault",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the domain types themselves.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Identifier could not be parsed.
    #[error("invalid {kind} id: {reason}")]
    InvalidId {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// Parser message.
        reason: String,
    },

    /// Input failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The lifecycle table does not declare this transition.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },
}

impl ProtoError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidId { .. } | Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } => ErrorKind::Conflict,
        }
    }
}

/// Failure reported by an external collaborator (agent transport, payment service).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached.
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),

    /// The collaborator refused the request.
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_) => ErrorKind::InfrastructureFault,
            Self::Rejected(_) => ErrorKind::Conflict,
        }
    }
}
