//! Transition events.
//!
//! Each committed state change produces exactly one [`HiveEvent`]. The event
//! bus wraps it in an [`EventEnvelope`] carrying a global sequence number and
//! the version of the record that changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;
use crate::ids::{AgentId, BidId, JobId, MatchId, OfferId};
use crate::job::JobState;
use crate::market::{BidStatus, MatchStatus, OfferStatus, Party};

/// A state change in the scheduler or marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HiveEvent {
    /// Job admitted as Pending.
    JobSubmitted {
        /// Job.
        job_id: JobId,
        /// Priority tier.
        priority: u8,
    },
    /// Job moved Pending to Scheduled on an agent.
    JobAssigned {
        /// Job.
        job_id: JobId,
        /// Agent it was reserved on.
        agent_id: AgentId,
    },
    /// Any other job transition.
    JobUpdated {
        /// Job.
        job_id: JobId,
        /// Previous state.
        from: JobState,
        /// New state.
        to: JobState,
    },
    /// Agent registered or came back from Offline.
    AgentRegistered {
        /// Agent.
        agent_id: AgentId,
    },
    /// Agent status changed.
    AgentStatusChanged {
        /// Agent.
        agent_id: AgentId,
        /// Previous status.
        from: AgentStatus,
        /// New status.
        to: AgentStatus,
    },
    /// Offer published.
    OfferCreated {
        /// Offer.
        offer_id: OfferId,
    },
    /// Offer status changed.
    OfferStatusChanged {
        /// Offer.
        offer_id: OfferId,
        /// Previous status.
        from: OfferStatus,
        /// New status.
        to: OfferStatus,
    },
    /// Bid placed.
    BidCreated {
        /// Bid.
        bid_id: BidId,
    },
    /// Bid status changed.
    BidStatusChanged {
        /// Bid.
        bid_id: BidId,
        /// Previous status.
        from: BidStatus,
        /// New status.
        to: BidStatus,
    },
    /// Match proposed.
    MatchCreated {
        /// Match.
        match_id: MatchId,
        /// Bid side.
        bid_id: BidId,
        /// Offer side.
        offer_id: OfferId,
    },
    /// One side accepted a Pending match.
    MatchAccepted {
        /// Match.
        match_id: MatchId,
        /// Accepting side.
        party: Party,
    },
    /// Match status changed.
    MatchStatusChanged {
        /// Match.
        match_id: MatchId,
        /// Previous status.
        from: MatchStatus,
        /// New status.
        to: MatchStatus,
    },
}

impl HiveEvent {
    /// Dotted topic name used by push subscribers.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JobSubmitted { .. } => "job.submitted",
            Self::JobAssigned { .. } => "job.assigned",
            Self::JobUpdated { .. } => "job.updated",
            Self::AgentRegistered { .. } => "agent.registered",
            Self::AgentStatusChanged { .. } => "agent.updated",
            Self::OfferCreated { .. } => "offer.created",
            Self::OfferStatusChanged { .. } => "offer.updated",
            Self::BidCreated { .. } => "bid.created",
            Self::BidStatusChanged { .. } => "bid.updated",
            Self::MatchCreated { .. } => "match.created",
            Self::MatchAccepted { .. } => "match.accepted",
            Self::MatchStatusChanged { .. } => "match.updated",
        }
    }

    /// Job this event concerns, if any.
    #[must_use]
    pub const fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobSubmitted { job_id, .. }
            | Self::JobAssigned { job_id, .. }
            | Self::JobUpdated { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// New job state, for job events.
    #[must_use]
    pub const fn job_state(&self) -> Option<JobState> {
        match self {
            Self::JobSubmitted { .. } => Some(JobState::Pending),
            Self::JobAssigned { .. } => Some(JobState::Scheduled),
            Self::JobUpdated { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Global, gap-free publication order starting at 1.
    pub sequence: u64,
    /// Version of the record after the change.
    pub record_version: u64,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// The change.
    pub event: HiveEvent,
}
