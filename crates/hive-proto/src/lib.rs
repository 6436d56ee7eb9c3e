//! # hive-proto
//!
//! Shared domain model for the ComputeHive scheduler and marketplace.
//!
//! This crate owns the record types (agents, jobs, offers, bids, matches),
//! the job lifecycle transition table, admission validation, the event
//! vocabulary, and the contracts of the external collaborators the core
//! talks to (agents and the payment/escrow service).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod clock;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod market;
pub mod resources;
pub mod validation;

pub use agent::{Agent, AgentLost, AgentRegistration, AgentStatus, Heartbeat};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    AgentCall, AgentClient, EscrowKey, PaymentCall, PaymentGateway, RecordingAgentClient,
    RecordingPaymentGateway,
};
pub use error::{CollaboratorError, ErrorKind, ProtoError};
pub use events::{EventEnvelope, HiveEvent};
pub use ids::{AccountId, AgentId, BidId, JobId, MatchId, OfferId};
pub use job::{
    AttemptRecord, Failure, Job, JobFilter, JobPayload, JobState, JobSubmission, Settlement,
    StatusReport, is_valid_transition,
};
pub use market::{
    AvailabilityWindow, Bid, BidFilter, BidSpec, BidStatus, Match, MatchStatus, Offer,
    OfferFilter, OfferSpec, OfferStatus, Party,
};
pub use resources::{Leftover, Price, RateSheet, ResourceVector};
pub use validation::{ValidationError, ValidationResult};
