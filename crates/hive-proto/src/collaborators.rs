//! Contracts for the collaborators the core calls out to.
//!
//! Agents receive assignments and stop requests through [`AgentClient`];
//! escrow and payouts go through [`PaymentGateway`]. Both are transport
//! agnostic. The recording implementations keep every call in memory and
//! serve standalone runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CollaboratorError;
use crate::ids::{AccountId, AgentId, JobId, MatchId};
use crate::job::JobPayload;
use crate::resources::Price;

/// Outbound calls to agents.
pub trait AgentClient: Send + Sync {
    /// Deliver a job to the agent it was reserved on.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be reached or refuses the job.
    fn receive_assignment(
        &self,
        agent_id: AgentId,
        job_id: JobId,
        payload: &JobPayload,
    ) -> Result<(), CollaboratorError>;

    /// Ask an agent to stop a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be reached.
    fn stop_job(&self, agent_id: AgentId, job_id: JobId) -> Result<(), CollaboratorError>;
}

/// What an escrow is held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EscrowKey {
    /// A directly submitted job.
    Job(JobId),
    /// A confirmed marketplace match.
    Match(MatchId),
}

/// Escrow and payout service.
pub trait PaymentGateway: Send + Sync {
    /// Lock `amount` from `payer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the funds cannot be locked.
    fn create_escrow(
        &self,
        key: EscrowKey,
        payer: &AccountId,
        amount: Price,
    ) -> Result<(), CollaboratorError>;

    /// Pay out escrow for a completed job.
    ///
    /// # Errors
    ///
    /// Returns an error if the payout fails.
    fn release_payment(
        &self,
        job_id: JobId,
        amount: Price,
        payee: &AccountId,
    ) -> Result<(), CollaboratorError>;

    /// Return escrow for a failed or cancelled job.
    ///
    /// # Errors
    ///
    /// Returns an error if the refund fails.
    fn refund_payment(&self, job_id: JobId, payee: &AccountId) -> Result<(), CollaboratorError>;
}

/// A call made to a [`RecordingAgentClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    /// `receive_assignment`.
    Assign {
        /// Target agent.
        agent_id: AgentId,
        /// Delivered job.
        job_id: JobId,
    },
    /// `stop_job`.
    Stop {
        /// Target agent.
        agent_id: AgentId,
        /// Job to stop.
        job_id: JobId,
    },
}

/// Agent client that records calls and optionally fails deliveries.
#[derive(Debug, Default)]
pub struct RecordingAgentClient {
    calls: Mutex<Vec<AgentCall>>,
    unreachable: AtomicBool,
}

impl RecordingAgentClient {
    /// Client whose calls all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Jobs delivered to `agent_id`.
    #[must_use]
    pub fn assignments_for(&self, agent_id: AgentId) -> Vec<JobId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AgentCall::Assign { agent_id: a, job_id } if *a == agent_id => Some(*job_id),
                _ => None,
            })
            .collect()
    }

    /// Stop requests sent to `agent_id`.
    #[must_use]
    pub fn stops_for(&self, agent_id: AgentId) -> Vec<JobId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AgentCall::Stop { agent_id: a, job_id } if *a == agent_id => Some(*job_id),
                _ => None,
            })
            .collect()
    }

    fn check_reachable(&self, agent_id: AgentId) -> Result<(), CollaboratorError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unreachable(format!("agent {agent_id}")));
        }
        Ok(())
    }
}

impl AgentClient for RecordingAgentClient {
    fn receive_assignment(
        &self,
        agent_id: AgentId,
        job_id: JobId,
        _payload: &JobPayload,
    ) -> Result<(), CollaboratorError> {
        self.check_reachable(agent_id)?;
        debug!(agent_id = %agent_id, job_id = %job_id, "recorded assignment");
        self.calls.lock().push(AgentCall::Assign { agent_id, job_id });
        Ok(())
    }

    fn stop_job(&self, agent_id: AgentId, job_id: JobId) -> Result<(), CollaboratorError> {
        self.check_reachable(agent_id)?;
        debug!(agent_id = %agent_id, job_id = %job_id, "recorded stop");
        self.calls.lock().push(AgentCall::Stop { agent_id, job_id });
        Ok(())
    }
}

/// A call made to a [`RecordingPaymentGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentCall {
    /// `create_escrow`.
    Escrow {
        /// Escrow purpose.
        key: EscrowKey,
        /// Paying account.
        payer: AccountId,
        /// Locked amount.
        amount: Price,
    },
    /// `release_payment`.
    Release {
        /// Completed job.
        job_id: JobId,
        /// Paid amount.
        amount: Price,
        /// Paid account.
        payee: AccountId,
    },
    /// `refund_payment`.
    Refund {
        /// Failed or cancelled job.
        job_id: JobId,
        /// Refunded account.
        payee: AccountId,
    },
}

/// Payment gateway that records calls and optionally declines escrows.
#[derive(Debug, Default)]
pub struct RecordingPaymentGateway {
    calls: Mutex<Vec<PaymentCall>>,
    decline_escrow: AtomicBool,
}

impl RecordingPaymentGateway {
    /// Gateway whose calls all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_escrow` calls fail.
    pub fn set_decline_escrow(&self, decline: bool) {
        self.decline_escrow.store(decline, Ordering::SeqCst);
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<PaymentCall> {
        self.calls.lock().clone()
    }

    /// Calls concerning `job_id` (releases and refunds).
    #[must_use]
    pub fn settlements_for(&self, job_id: JobId) -> Vec<PaymentCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| match c {
                PaymentCall::Release { job_id: j, .. } | PaymentCall::Refund { job_id: j, .. } => {
                    *j == job_id
                }
                PaymentCall::Escrow { key, .. } => *key == EscrowKey::Job(job_id),
            })
            .cloned()
            .collect()
    }
}

impl PaymentGateway for RecordingPaymentGateway {
    fn create_escrow(
        &self,
        key: EscrowKey,
        payer: &AccountId,
        amount: Price,
    ) -> Result<(), CollaboratorError> {
        if self.decline_escrow.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected(format!(
                "insufficient funds for {payer}"
            )));
        }
        self.calls.lock().push(PaymentCall::Escrow {
            key,
            payer: payer.clone(),
            amount,
        });
        Ok(())
    }

    fn release_payment(
        &self,
        job_id: JobId,
        amount: Price,
        payee: &AccountId,
    ) -> Result<(), CollaboratorError> {
        self.calls.lock().push(PaymentCall::Release {
            job_id,
            amount,
            payee: payee.clone(),
        });
        Ok(())
    }

    fn refund_payment(&self, job_id: JobId, payee: &AccountId) -> Result<(), CollaboratorError> {
        self.calls.lock().push(PaymentCall::Refund {
            job_id,
            payee: payee.clone(),
        });
        Ok(())
    }
}
