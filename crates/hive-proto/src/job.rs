//! Jobs and their lifecycle.
//!
//! [`is_valid_transition`] is the single source of truth for which status
//! changes are legal. Every mutation of a [`Job`]'s status goes through
//! [`Job::transition_to`], which checks the table before touching anything.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::EscrowKey;
use crate::error::{ErrorKind, ProtoError};
use crate::ids::{AccountId, AgentId, JobId, MatchId};
use crate::resources::{Price, ResourceVector};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for an agent.
    Pending,
    /// Reserved on an agent, payload delivered.
    Scheduled,
    /// Agent reported the process started.
    Running,
    /// Exited with code 0.
    Completed,
    /// Process failed. Terminal only once the retry budget is spent.
    Failed,
    /// Cancelled by the requester.
    Cancelled,
    /// Exceeded its runtime limit.
    Timeout,
    /// Transient state between a failure and re-admission.
    Retrying,
}

impl JobState {
    /// Every state, for exhaustive tests.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Scheduled,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
        Self::Retrying,
    ];

    /// States in which the job holds an agent.
    #[must_use]
    pub const fn holds_agent(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }

    /// States that can never be left.
    ///
    /// `Failed` is not listed: it is terminal only after retries are
    /// exhausted, see [`Job::is_terminal`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check if a state transition is declared by the lifecycle table.
#[must_use]
pub const fn is_valid_transition(from: JobState, to: JobState) -> bool {
    use JobState::{Cancelled, Completed, Failed, Pending, Retrying, Running, Scheduled, Timeout};
    matches!(
        (from, to),
        // Assignment, admission timeout, infrastructure retries exhausted, cancel
        (Pending, Scheduled | Failed | Cancelled)
            // Agent start, timeout, agent lost, cancel
            | (Scheduled, Running | Timeout | Pending | Cancelled)
            // Exit, timeout, agent lost, cancel
            | (Running, Completed | Failed | Timeout | Pending | Cancelled)
            // Retry budget left
            | (Failed, Retrying)
            // Retry budget left, or spent
            | (Timeout, Retrying | Failed)
            | (Retrying, Pending)
    )
}

/// What a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// A container image.
    Docker {
        /// Image reference, e.g. `python:3.11-slim`.
        image: String,
        /// Command override.
        #[serde(default)]
        command: Vec<String>,
        /// Environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A script shipped inline.
    Script {
        /// File name, used by the agent to pick an interpreter (`train.py`).
        name: String,
        /// Script source.
        source: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl JobPayload {
    /// Docker payload with no command override or env.
    #[must_use]
    pub fn docker(image: impl Into<String>) -> Self {
        Self::Docker {
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Script payload with no args or env.
    #[must_use]
    pub fn script(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::Script {
            name: name.into(),
            source: source.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Payload discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Docker { .. } => "docker",
            Self::Script { .. } => "script",
        }
    }

    /// Environment variables.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Docker { env, .. } | Self::Script { env, .. } => env,
        }
    }
}

/// One entry of a job's diagnostic trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Agent the attempt ran on, if it got that far.
    pub agent_id: Option<AgentId>,
    /// When the attempt ended.
    pub timestamp: DateTime<Utc>,
    /// Process exit code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the attempt ended.
    pub kind: ErrorKind,
}

/// Why a job is, or last was, failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable reason.
    pub reason: String,
    /// The job will not be retried.
    pub is_final: bool,
}

/// Money held for a job and who it goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Escrow the funds sit in.
    pub escrow: EscrowKey,
    /// Amount held.
    pub amount: Price,
    /// Who gets refunded.
    pub payer: AccountId,
    /// Who gets paid on completion. Known once an agent is bound.
    pub payee: Option<AccountId>,
}

/// Status update sent by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Reporting agent.
    pub agent_id: AgentId,
    /// Reported status: running, completed or failed.
    pub status: JobState,
    /// Exit code, for completed/failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Error description, for failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    /// The process started.
    #[must_use]
    pub const fn running(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            status: JobState::Running,
            exit_code: None,
            error: None,
        }
    }

    /// The process exited with code 0.
    #[must_use]
    pub const fn completed(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            status: JobState::Completed,
            exit_code: Some(0),
            error: None,
        }
    }

    /// The process failed.
    #[must_use]
    pub fn failed(agent_id: AgentId, exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            agent_id,
            status: JobState::Failed,
            exit_code,
            error: Some(error.into()),
        }
    }
}

/// Request to run a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Paying account.
    pub requester_id: AccountId,
    /// Minimum capability the agent must have.
    pub requirements: ResourceVector,
    /// 0 (lowest) to 10 (highest).
    pub priority: u8,
    /// What to run.
    pub payload: JobPayload,
    /// Runtime limit in seconds. Defaults to one hour.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Retry budget. Defaults to 3.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSubmission {
    /// A submission with default priority, timeout and retries.
    #[must_use]
    pub fn new(
        requester_id: impl Into<AccountId>,
        requirements: ResourceVector,
        payload: JobPayload,
    ) -> Self {
        Self {
            requester_id: requester_id.into(),
            requirements,
            priority: 5,
            payload,
            timeout_secs: None,
            max_retries: None,
        }
    }

    /// Set priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A unit of computation and its lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier.
    pub id: JobId,
    /// Paying account.
    pub requester_id: AccountId,
    /// Minimum capability.
    pub requirements: ResourceVector,
    /// 0 (lowest) to 10 (highest).
    pub priority: u8,
    /// What to run.
    pub payload: JobPayload,
    /// Runtime limit in seconds.
    pub timeout_secs: u64,
    /// Retry budget for job faults.
    pub max_retries: u32,
    /// Job faults consumed. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Lost-agent requeues consumed. Capped separately.
    pub infra_retry_count: u32,
    /// Current status.
    pub status: JobState,
    /// Set iff status is Scheduled or Running.
    pub assigned_agent_id: Option<AgentId>,
    /// Agent of the most recent attempt.
    pub last_agent_id: Option<AgentId>,
    /// Match this job was synthesized from.
    pub match_id: Option<MatchId>,
    /// Agent chosen by the marketplace, tried before a capability search.
    pub bound_agent_id: Option<AgentId>,
    /// FIFO position within a priority tier.
    pub queue_seq: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the current admission window.
    pub pending_since: DateTime<Utc>,
    /// Backoff gate: not scheduled before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Last assignment time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Last start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Escrowed funds.
    pub settlement: Option<Settlement>,
    /// Current or final failure.
    pub failure: Option<Failure>,
    /// Ordered record of every ended attempt.
    pub trail: Vec<AttemptRecord>,
    /// Last status report applied, for replay detection.
    pub last_report: Option<StatusReport>,
}

impl Job {
    /// A new Pending job.
    #[must_use]
    pub fn new(
        requester_id: AccountId,
        requirements: ResourceVector,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            requester_id,
            requirements,
            priority: 5,
            payload,
            timeout_secs: 3600,
            max_retries: 3,
            retry_count: 0,
            infra_retry_count: 0,
            status: JobState::Pending,
            assigned_agent_id: None,
            last_agent_id: None,
            match_id: None,
            bound_agent_id: None,
            queue_seq: 0,
            created_at: now,
            pending_since: now,
            not_before: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            settlement: None,
            failure: None,
            trail: Vec::new(),
            last_report: None,
        }
    }

    /// Use a specific id.
    #[must_use]
    pub const fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Set priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Attach escrowed funds.
    #[must_use]
    pub fn with_settlement(mut self, settlement: Settlement) -> Self {
        self.settlement = Some(settlement);
        self
    }

    /// Bind to a marketplace match and its agent.
    #[must_use]
    pub const fn with_match(mut self, match_id: MatchId, agent_id: AgentId) -> Self {
        self.match_id = Some(match_id);
        self.bound_agent_id = Some(agent_id);
        self
    }

    /// Runtime limit.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the job can never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
            || (self.status == JobState::Failed
                && self.failure.as_ref().is_some_and(|f| f.is_final))
    }

    /// Whether the scheduler may consider this job at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobState::Pending && self.not_before.is_none_or(|t| t <= now)
    }

    /// Check whether moving to `to` is declared.
    #[must_use]
    pub const fn can_transition_to(&self, to: JobState) -> bool {
        is_valid_transition(self.status, to)
    }

    /// Move to `to`, keeping timestamps and the agent assignment consistent.
    ///
    /// Leaving Scheduled/Running clears `assigned_agent_id`. Entering
    /// Scheduled does not set it; use [`Job::assign`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` without modifying the job if the table
    /// does not declare the move.
    pub fn transition_to(&mut self, to: JobState, now: DateTime<Utc>) -> Result<JobState, ProtoError> {
        let from = self.status;
        if !is_valid_transition(from, to) {
            return Err(ProtoError::InvalidTransition { from, to });
        }

        match to {
            JobState::Pending => {
                self.scheduled_at = None;
                self.started_at = None;
                self.pending_since = self.not_before.map_or(now, |t| t.max(now));
            }
            JobState::Scheduled => self.scheduled_at = Some(now),
            JobState::Running => self.started_at = Some(now),
            JobState::Completed | JobState::Cancelled => self.completed_at = Some(now),
            JobState::Failed | JobState::Timeout | JobState::Retrying => {}
        }

        if !to.holds_agent() {
            if let Some(agent) = self.assigned_agent_id.take() {
                self.last_agent_id = Some(agent);
            }
        }

        self.status = to;
        Ok(from)
    }

    /// Pending to Scheduled on `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the job is not Pending.
    pub fn assign(&mut self, agent_id: AgentId, now: DateTime<Utc>) -> Result<(), ProtoError> {
        self.transition_to(JobState::Scheduled, now)?;
        self.assigned_agent_id = Some(agent_id);
        self.not_before = None;
        Ok(())
    }

    /// Elapsed runtime measured from start, or from assignment if never started.
    #[must_use]
    pub fn runtime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.or(self.scheduled_at).map(|t| now - t)
    }

    /// Append to the diagnostic trail.
    pub fn record_attempt(
        &mut self,
        kind: ErrorKind,
        exit_code: Option<i32>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.trail.push(AttemptRecord {
            agent_id: self.assigned_agent_id.or(self.last_agent_id),
            timestamp: now,
            exit_code,
            error,
            kind,
        });
    }
}

/// Criteria for listing jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs of this requester.
    #[serde(default)]
    pub requester_id: Option<AccountId>,
    /// Only jobs in this status.
    #[serde(default)]
    pub status: Option<JobState>,
    /// Only jobs currently assigned to this agent.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

impl JobFilter {
    /// Whether `job` passes the filter.
    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.requester_id
            .as_ref()
            .is_none_or(|r| *r == job.requester_id)
            && self.status.is_none_or(|s| s == job.status)
            && self
                .agent_id
                .is_none_or(|a| job.assigned_agent_id == Some(a))
    }
}
