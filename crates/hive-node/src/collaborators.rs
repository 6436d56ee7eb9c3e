//! Collaborators for a standalone daemon.
//!
//! Without an agent transport or payment backend wired in, outbound calls
//! are accepted and logged so the core can run end to end.

use hive_proto::{
    AccountId, AgentClient, AgentId, CollaboratorError, EscrowKey, JobId, JobPayload,
    PaymentGateway, Price,
};
use tracing::info;

/// Agent client that logs every call and always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAgentClient;

impl AgentClient for LoggingAgentClient {
    fn receive_assignment(
        &self,
        agent_id: AgentId,
        job_id: JobId,
        payload: &JobPayload,
    ) -> Result<(), CollaboratorError> {
        info!(
            agent_id = %agent_id,
            job_id = %job_id,
            payload = payload.kind(),
            "assignment sent"
        );
        Ok(())
    }

    fn stop_job(&self, agent_id: AgentId, job_id: JobId) -> Result<(), CollaboratorError> {
        info!(agent_id = %agent_id, job_id = %job_id, "stop sent");
        Ok(())
    }
}

/// Payment gateway that logs every call and always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPaymentGateway;

impl PaymentGateway for LoggingPaymentGateway {
    fn create_escrow(
        &self,
        key: EscrowKey,
        payer: &AccountId,
        amount: Price,
    ) -> Result<(), CollaboratorError> {
        info!(escrow = ?key, payer = %payer, amount = %amount, "escrow opened");
        Ok(())
    }

    fn release_payment(
        &self,
        job_id: JobId,
        amount: Price,
        payee: &AccountId,
    ) -> Result<(), CollaboratorError> {
        info!(job_id = %job_id, payee = %payee, amount = %amount, "payment released");
        Ok(())
    }

    fn refund_payment(&self, job_id: JobId, payee: &AccountId) -> Result<(), CollaboratorError> {
        info!(job_id = %job_id, payee = %payee, "payment refunded");
        Ok(())
    }
}
