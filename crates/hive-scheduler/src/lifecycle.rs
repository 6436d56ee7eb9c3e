//! Job lifecycle state machine.
//!
//! Every status change of a job is decided here against the transition
//! table in [`hive_proto::job`], committed with an optimistic version check
//! and published as one event per transition. Side effects on other records
//! (releasing the agent, settling escrow, telling the agent to stop) happen
//! after the job commit and are idempotent, so a lost race never leaves an
//! agent reserved for a job that moved on.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use hive_proto::{
    AgentClient, AgentId, AgentLost, Clock, ErrorKind, Failure, HiveEvent, Job, JobFilter, JobId,
    JobState, PaymentGateway, StatusReport, ValidationError,
};
use hive_registry::Registry;
use hive_store::{
    Committed, DEFAULT_UPDATE_ATTEMPTS, Decision, EventSink, RecordStore, UpdateError, Versioned,
    insert_record, update_with_retry,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::retry::{InfraDecision, RetryDecision, RetryPolicy};

/// Reason recorded when the admission timeout expires.
pub const NO_CAPACITY_REASON: &str = "no capacity";

/// Reason recorded when lost-agent requeues run out.
pub const INFRA_EXHAUSTED_REASON: &str = "infrastructure retries exhausted";

/// Drives jobs through their states and keeps agents and escrow in step.
pub struct JobLifecycle {
    jobs: Arc<dyn RecordStore<JobId, Job>>,
    registry: Arc<Registry>,
    agents: Arc<dyn AgentClient>,
    payments: Arc<dyn PaymentGateway>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    attempts: u32,
    next_seq: AtomicU64,
}

impl fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("jobs", &self.jobs.len())
            .field("retry", &self.retry)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

fn step(job: &mut Job, to: JobState, now: DateTime<Utc>, events: &mut Vec<HiveEvent>) -> Result<()> {
    let from = job
        .transition_to(to, now)
        .map_err(|e| SchedulerError::from_proto(job.id, e))?;
    events.push(HiveEvent::JobUpdated {
        job_id: job.id,
        from,
        to,
    });
    Ok(())
}

fn finalize(job: &mut Job, kind: ErrorKind, reason: impl Into<String>, now: DateTime<Utc>) {
    job.failure = Some(Failure {
        kind,
        reason: reason.into(),
        is_final: true,
    });
    job.not_before = None;
    job.completed_at = Some(now);
}

impl JobLifecycle {
    /// Lifecycle over `jobs`, reserving agents through `registry`.
    #[must_use]
    pub fn new(
        jobs: Arc<dyn RecordStore<JobId, Job>>,
        registry: Arc<Registry>,
        agents: Arc<dyn AgentClient>,
        payments: Arc<dyn PaymentGateway>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            registry,
            agents,
            payments,
            sink,
            clock,
            retry: RetryPolicy::default(),
            attempts: DEFAULT_UPDATE_ATTEMPTS,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Use a different retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the optimistic-update attempts per operation.
    #[must_use]
    pub const fn with_update_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Agent registry in use.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Clock in use.
    #[must_use]
    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Retry policy in use.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn update<F>(&self, job_id: JobId, decide: F) -> Result<Committed<Job>>
    where
        F: FnMut(&Versioned<Job>) -> Result<Decision<Job>>,
    {
        update_with_retry(&*self.jobs, &job_id, self.attempts, &*self.sink, decide).map_err(|e| {
            match e {
                UpdateError::NotFound(_) => SchedulerError::UnknownJob(job_id),
                UpdateError::Conflict { .. } => SchedulerError::Conflict(job_id),
                UpdateError::Rejected(e) => e,
            }
        })
    }

    /// Apply a job fault to a job already in Failed or Timeout.
    fn apply_fault(
        &self,
        job: &mut Job,
        reason: String,
        now: DateTime<Utc>,
        events: &mut Vec<HiveEvent>,
    ) -> Result<()> {
        match self.retry.on_job_failure(job.retry_count, job.max_retries, now) {
            RetryDecision::Retry {
                retry_count,
                not_before,
            } => {
                job.retry_count = retry_count;
                job.failure = Some(Failure {
                    kind: ErrorKind::AgentFault,
                    reason,
                    is_final: false,
                });
                step(job, JobState::Retrying, now, events)?;
                job.not_before = Some(not_before);
                step(job, JobState::Pending, now, events)?;
            }
            RetryDecision::GiveUp { retry_count } => {
                job.retry_count = retry_count;
                if job.status == JobState::Timeout {
                    step(job, JobState::Failed, now, events)?;
                }
                finalize(job, ErrorKind::AgentFault, reason, now);
            }
        }
        Ok(())
    }

    fn free_agent(&self, agent_id: AgentId, job_id: JobId) {
        if let Err(e) = self.registry.release(agent_id, job_id) {
            warn!(agent_id = %agent_id, job_id = %job_id, error = %e, "failed to release agent");
        }
    }

    fn stop(&self, agent_id: AgentId, job_id: JobId) {
        if let Err(e) = self.agents.stop_job(agent_id, job_id) {
            warn!(agent_id = %agent_id, job_id = %job_id, error = %e, "stop request failed");
        }
    }

    /// Pay out or refund escrow once a job is terminal.
    fn settle(&self, job: &Job) {
        let Some(settlement) = &job.settlement else {
            return;
        };
        let result = match job.status {
            JobState::Completed => match &settlement.payee {
                Some(payee) => self
                    .payments
                    .release_payment(job.id, settlement.amount, payee),
                None => {
                    warn!(job_id = %job.id, "completed job has no payee, escrow left in place");
                    return;
                }
            },
            _ if job.is_terminal() => self.payments.refund_payment(job.id, &settlement.payer),
            _ => return,
        };
        if let Err(e) = result {
            warn!(job_id = %job.id, status = %job.status, error = %e, "escrow settlement failed");
        }
    }

    // ==================== Admission ====================

    /// Insert a new Pending job at the back of its priority tier.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a job with the same id exists.
    pub fn admit(&self, mut job: Job) -> Result<Job> {
        let job_id = job.id;
        let priority = job.priority;
        job.queue_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let stored = insert_record(
            &*self.jobs,
            job_id,
            job,
            &*self.sink,
            vec![HiveEvent::JobSubmitted { job_id, priority }],
        )
        .map_err(|_| SchedulerError::Conflict(job_id))?;
        info!(
            job_id = %job_id,
            priority,
            requester = %stored.record.requester_id,
            "job admitted"
        );
        Ok(stored.record)
    }

    /// Admit a job and try to place it on `agent_id` straight away.
    ///
    /// If the agent cannot be reserved the job stays in the normal queue.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a job with the same id exists.
    pub fn admit_bound(&self, mut job: Job, agent_id: AgentId) -> Result<Job> {
        job.bound_agent_id = Some(agent_id);
        let admitted = self.admit(job)?;
        match self.assign(admitted.id, agent_id) {
            Ok(job) => Ok(job),
            Err(e) => {
                info!(
                    job_id = %admitted.id,
                    agent_id = %agent_id,
                    error = %e,
                    "bound agent unavailable, job queued"
                );
                Ok(self.get_job(admitted.id).unwrap_or(admitted))
            }
        }
    }

    // ==================== Assignment ====================

    /// Reserve `agent_id` and move the job Pending to Scheduled on it, then
    /// deliver the payload.
    ///
    /// A failed delivery, or an agent evicted before the commit landed,
    /// sends the job down the lost-agent path; the returned job then
    /// reflects that.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the agent cannot be reserved and
    /// `InvalidTransition` if the job is no longer Pending. The agent is
    /// never left reserved on error.
    pub fn assign(&self, job_id: JobId, agent_id: AgentId) -> Result<Job> {
        let current = self.get_job(job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        if current.status != JobState::Pending {
            return Err(SchedulerError::InvalidTransition {
                job_id,
                from: current.status,
                to: JobState::Scheduled,
            });
        }
        let agent = self.registry.reserve(agent_id, job_id)?;
        let now = self.clock.now();

        let result = self.update(job_id, |current| {
            let job = &current.record;
            if job.status != JobState::Pending {
                return Err(SchedulerError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to: JobState::Scheduled,
                });
            }
            let mut next = job.clone();
            next.assign(agent_id, now)
                .map_err(|e| SchedulerError::from_proto(job_id, e))?;
            next.last_report = None;
            if next.match_id.is_none() {
                if let Some(settlement) = next.settlement.as_mut() {
                    settlement.payee = Some(agent.owner_id.clone());
                }
            }
            Ok(Decision::write(
                next,
                vec![HiveEvent::JobAssigned { job_id, agent_id }],
            ))
        });

        let committed = match result {
            Ok(committed) => committed,
            Err(e) => {
                let holds = self
                    .get_job(job_id)
                    .is_some_and(|j| j.assigned_agent_id == Some(agent_id));
                if !holds {
                    self.free_agent(agent_id, job_id);
                }
                return Err(e);
            }
        };
        let job = committed.after.record;

        // Eviction may have taken the reservation between reserve and commit;
        // its lost-agent notice saw a Pending job and was dropped.
        let still_held = self
            .registry
            .get(agent_id)
            .is_some_and(|a| a.current_job_id == Some(job_id));
        if !still_held {
            warn!(
                job_id = %job_id,
                agent_id = %agent_id,
                "agent released before the job committed, treating agent as lost"
            );
            return self
                .agent_lost(AgentLost { agent_id, job_id })
                .map(|lost| lost.unwrap_or(job));
        }
        info!(job_id = %job_id, agent_id = %agent_id, "job scheduled");

        if let Err(e) = self.agents.receive_assignment(agent_id, job_id, &job.payload) {
            warn!(
                job_id = %job_id,
                agent_id = %agent_id,
                error = %e,
                "assignment delivery failed, treating agent as lost"
            );
            return self
                .agent_lost(AgentLost { agent_id, job_id })
                .map(|lost| lost.unwrap_or(job));
        }
        Ok(job)
    }

    // ==================== Agent Reports ====================

    /// Apply a status report from the job's agent.
    ///
    /// Replaying the last applied report is a no-op. A failure report runs
    /// the retry handler in the same commit.
    ///
    /// # Errors
    ///
    /// - `Validation` for a report that is not running/completed/failed, or
    ///   a completion with a non-zero exit code
    /// - `WrongAgent` if another agent holds the job
    /// - `InvalidTransition` if the table does not allow the move
    pub fn report_status(&self, job_id: JobId, report: StatusReport) -> Result<Job> {
        match report.status {
            JobState::Running | JobState::Failed => {}
            JobState::Completed => {
                if report.exit_code.is_some_and(|code| code != 0) {
                    return Err(ValidationError::new(
                        "exit_code",
                        "completed reports must carry exit code 0",
                    )
                    .into());
                }
            }
            other => {
                return Err(ValidationError::new(
                    "status",
                    format!("agents cannot report {other}"),
                )
                .into());
            }
        }
        let now = self.clock.now();

        let committed = self.update(job_id, |current| {
            let job = &current.record;
            if job.last_report.as_ref() == Some(&report) {
                return Ok(Decision::Keep);
            }
            if job.assigned_agent_id != Some(report.agent_id) {
                if job.status.holds_agent() {
                    return Err(SchedulerError::WrongAgent {
                        job_id,
                        agent_id: report.agent_id,
                    });
                }
                return Err(SchedulerError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to: report.status,
                });
            }

            let mut next = job.clone();
            let mut events = Vec::new();
            step(&mut next, report.status, now, &mut events)?;
            next.last_report = Some(report.clone());

            if report.status == JobState::Failed {
                let reason = report.error.clone().unwrap_or_else(|| {
                    report
                        .exit_code
                        .map_or_else(|| "job failed".to_string(), |c| format!("exit code {c}"))
                });
                next.record_attempt(ErrorKind::AgentFault, report.exit_code, report.error.clone(), now);
                self.apply_fault(&mut next, reason, now, &mut events)?;
            }
            Ok(Decision::write(next, events))
        })?;

        let job = committed.after.record.clone();
        if !committed.changed() {
            debug!(job_id = %job_id, status = %report.status, "duplicate status report ignored");
            return Ok(job);
        }

        if report.status != JobState::Running {
            self.free_agent(report.agent_id, job_id);
        }
        self.settle(&job);
        info!(
            job_id = %job_id,
            agent_id = %report.agent_id,
            reported = %report.status,
            status = %job.status,
            retry_count = job.retry_count,
            "status report applied"
        );
        Ok(job)
    }

    // ==================== Cancellation ====================

    /// Cancel a non-terminal job.
    ///
    /// A Running job's agent is told to stop before the commit; the agent is
    /// released and escrow refunded after it.
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` or `InvalidTransition` for a job that cannot be
    /// cancelled.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        let current = self
            .get_job(job_id)
            .ok_or(SchedulerError::UnknownJob(job_id))?;
        if !current.can_transition_to(JobState::Cancelled) {
            return Err(SchedulerError::InvalidTransition {
                job_id,
                from: current.status,
                to: JobState::Cancelled,
            });
        }

        let mut stopped = None;
        if current.status == JobState::Running {
            if let Some(agent_id) = current.assigned_agent_id {
                self.stop(agent_id, job_id);
                stopped = Some(agent_id);
            }
        }

        let now = self.clock.now();
        let committed = self.update(job_id, |current| {
            let mut next = current.record.clone();
            let mut events = Vec::new();
            step(&mut next, JobState::Cancelled, now, &mut events)?;
            next.not_before = None;
            Ok(Decision::write(next, events))
        })?;

        if let Some(agent_id) = committed.before.record.assigned_agent_id {
            if stopped != Some(agent_id) {
                self.stop(agent_id, job_id);
            }
            self.free_agent(agent_id, job_id);
        }
        let job = committed.after.record;
        self.settle(&job);
        info!(job_id = %job_id, from = %committed.before.record.status, "job cancelled");
        Ok(job)
    }

    // ==================== Timeouts ====================

    /// Time out Scheduled/Running jobs that exceeded their runtime limit.
    ///
    /// Returns the ids of the jobs timed out.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let overdue = |job: &Job| {
            job.status.holds_agent()
                && job.runtime(now).is_some_and(|runtime| {
                    chrono::Duration::from_std(job.timeout()).is_ok_and(|limit| runtime > limit)
                })
        };

        let candidates: Vec<JobId> = self
            .jobs
            .list()
            .into_iter()
            .filter(|v| overdue(&v.record))
            .map(|v| v.record.id)
            .collect();

        let mut timed_out = Vec::new();
        for job_id in candidates {
            let result = self.update(job_id, |current| {
                let job = &current.record;
                if !overdue(job) {
                    return Ok(Decision::Keep);
                }
                let mut next = job.clone();
                let mut events = Vec::new();
                step(&mut next, JobState::Timeout, now, &mut events)?;
                let reason = format!("timed out after {}s", job.timeout_secs);
                next.record_attempt(ErrorKind::AgentFault, None, Some(reason.clone()), now);
                self.apply_fault(&mut next, reason, now, &mut events)?;
                Ok(Decision::write(next, events))
            });

            match result {
                Ok(committed) if committed.changed() => {
                    if let Some(agent_id) = committed.before.record.assigned_agent_id {
                        self.stop(agent_id, job_id);
                        self.free_agent(agent_id, job_id);
                    }
                    let job = committed.after.record;
                    self.settle(&job);
                    warn!(
                        job_id = %job_id,
                        status = %job.status,
                        retry_count = job.retry_count,
                        "job timed out"
                    );
                    timed_out.push(job_id);
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "timeout sweep failed"),
            }
        }
        timed_out
    }

    // ==================== Lost Agents ====================

    /// Requeue the job a lost agent held, without touching its retry budget.
    ///
    /// Returns `None` if the notice is stale (the job moved on or is held by
    /// another agent).
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist.
    pub fn agent_lost(&self, notice: AgentLost) -> Result<Option<Job>> {
        let AgentLost { agent_id, job_id } = notice;
        let now = self.clock.now();

        let committed = self.update(job_id, |current| {
            let job = &current.record;
            if !job.status.holds_agent() || job.assigned_agent_id != Some(agent_id) {
                return Ok(Decision::Keep);
            }
            let mut next = job.clone();
            let mut events = Vec::new();
            next.record_attempt(
                ErrorKind::InfrastructureFault,
                None,
                Some("agent lost".to_string()),
                now,
            );
            step(&mut next, JobState::Pending, now, &mut events)?;
            match self.retry.on_agent_lost(job.infra_retry_count) {
                InfraDecision::Requeue { infra_retry_count } => {
                    next.infra_retry_count = infra_retry_count;
                }
                InfraDecision::Exhausted => {
                    step(&mut next, JobState::Failed, now, &mut events)?;
                    finalize(&mut next, ErrorKind::InfrastructureFault, INFRA_EXHAUSTED_REASON, now);
                }
            }
            Ok(Decision::write(next, events))
        })?;

        if !committed.changed() {
            debug!(job_id = %job_id, agent_id = %agent_id, "stale agent-lost notice ignored");
            return Ok(None);
        }
        self.free_agent(agent_id, job_id);
        let job = committed.after.record;
        self.settle(&job);
        warn!(
            job_id = %job_id,
            agent_id = %agent_id,
            status = %job.status,
            infra_retry_count = job.infra_retry_count,
            "job's agent lost"
        );
        Ok(Some(job))
    }

    // ==================== Admission Timeout ====================

    /// Fail a Pending job that waited longer than `admission_timeout`.
    ///
    /// Re-checks the wait at commit time; returns the job unchanged if it
    /// was scheduled or re-queued in the meantime.
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if the job does not exist.
    pub fn fail_unschedulable(
        &self,
        job_id: JobId,
        admission_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let committed = self.update(job_id, |current| {
            let job = &current.record;
            if job.status != JobState::Pending || now - job.pending_since <= admission_timeout {
                return Ok(Decision::Keep);
            }
            let mut next = job.clone();
            let mut events = Vec::new();
            next.record_attempt(
                ErrorKind::CapacityUnavailable,
                None,
                Some(NO_CAPACITY_REASON.to_string()),
                now,
            );
            step(&mut next, JobState::Failed, now, &mut events)?;
            finalize(&mut next, ErrorKind::CapacityUnavailable, NO_CAPACITY_REASON, now);
            Ok(Decision::write(next, events))
        })?;

        let changed = committed.changed();
        let job = committed.after.record;
        if changed {
            self.settle(&job);
            warn!(
                job_id = %job_id,
                waited_secs = (now - committed.before.record.pending_since).num_seconds(),
                "job failed: no capacity"
            );
        }
        Ok(job)
    }

    // ==================== Queries ====================

    /// Look up one job.
    #[must_use]
    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).map(|v| v.record)
    }

    /// Jobs passing `filter`, in admission order.
    #[must_use]
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|j| filter.matches(j))
            .collect();
        jobs.sort_by_key(|j| j.queue_seq);
        jobs
    }

    /// Pending jobs past their backoff gate, in queue order: priority
    /// descending, then FIFO.
    #[must_use]
    pub fn eligible_pending(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|j| j.is_eligible(now))
            .collect();
        jobs.sort_by_key(|j| (std::cmp::Reverse(j.priority), j.queue_seq));
        jobs
    }
}
