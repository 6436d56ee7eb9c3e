//! Contributor agents as seen by the registry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, AgentId, JobId};
use crate::resources::ResourceVector;

/// Highest reputation score an agent or provider can carry.
pub const MAX_REPUTATION: u32 = 1000;

/// Agent liveness and occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Ready for work.
    Available,
    /// Running a job, or busy by its own report.
    Busy,
    /// Evicted or self-reported offline.
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// What an agent sends to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Account paid for work done on this agent.
    pub owner_id: AccountId,
    /// Advertised capacity.
    pub capability: ResourceVector,
    /// Region or zone.
    #[serde(default)]
    pub location: Option<String>,
    /// Reputation supplied by the reputation service.
    #[serde(default)]
    pub reputation: u32,
}

impl AgentRegistration {
    /// Registration with no location and zero reputation.
    #[must_use]
    pub fn new(owner_id: impl Into<AccountId>, capability: ResourceVector) -> Self {
        Self {
            owner_id: owner_id.into(),
            capability,
            location: None,
            reputation: 0,
        }
    }

    /// Set location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set reputation.
    #[must_use]
    pub const fn with_reputation(mut self, reputation: u32) -> Self {
        self.reputation = reputation;
        self
    }
}

/// Periodic liveness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Status as the agent sees it.
    pub status: AgentStatus,
    /// Current load, 0 to 100.
    pub load_percent: u8,
    /// Agent-side send time. Identifies the heartbeat for replay detection.
    pub sent_at: DateTime<Utc>,
}

impl Heartbeat {
    /// Heartbeat reporting `status` at `sent_at`.
    #[must_use]
    pub const fn new(status: AgentStatus, load_percent: u8, sent_at: DateTime<Utc>) -> Self {
        Self {
            status,
            load_percent,
            sent_at,
        }
    }
}

/// Registry record for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Identifier.
    pub id: AgentId,
    /// Account paid for work done here.
    pub owner_id: AccountId,
    /// Advertised capacity.
    pub capability: ResourceVector,
    /// Liveness and occupancy.
    pub status: AgentStatus,
    /// Server time of the last accepted heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Agent-side stamp of the last accepted heartbeat.
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    /// Job reserved on this agent.
    pub current_job_id: Option<JobId>,
    /// Reputation input, 0 to 1000.
    pub reputation: u32,
    /// Last reported load, 0 to 100.
    pub load_percent: u8,
    /// Region or zone.
    pub location: Option<String>,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Monotonic registration order, for deterministic tie-breaks.
    pub registration_seq: u64,
}

impl Agent {
    /// A freshly registered, Available agent.
    #[must_use]
    pub fn register(
        id: AgentId,
        registration: AgentRegistration,
        registration_seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_id: registration.owner_id,
            capability: registration.capability,
            status: AgentStatus::Available,
            last_heartbeat: now,
            last_heartbeat_sent: None,
            current_job_id: None,
            reputation: registration.reputation,
            load_percent: 0,
            location: registration.location,
            registered_at: now,
            registration_seq,
        }
    }

    /// Available with no job reserved.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.status, AgentStatus::Available) && self.current_job_id.is_none()
    }
}

/// Emitted when an evicted agent held a Scheduled or Running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLost {
    /// Evicted agent.
    pub agent_id: AgentId,
    /// Job it held.
    pub job_id: JobId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_starts_available() {
        let reg = AgentRegistration::new("owner", ResourceVector::new(4, 4096))
            .with_location("us-east-1")
            .with_reputation(700);
        let agent = Agent::register(AgentId::new(), reg, 1, Utc::now());

        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.is_free());
        assert_eq!(agent.location.as_deref(), Some("us-east-1"));
        assert_eq!(agent.reputation, 700);
    }

    #[test]
    fn test_agent_with_job_is_not_free() {
        let reg = AgentRegistration::new("owner", ResourceVector::new(4, 4096));
        let mut agent = Agent::register(AgentId::new(), reg, 1, Utc::now());
        agent.current_job_id = Some(JobId::new());
        assert!(!agent.is_free());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AgentStatus::Offline.to_string(), "offline");
    }
}
