//! Direct job submission and the best-fit scheduling tick.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hive_proto::validation::validate_submission;
use hive_proto::{
    Agent, EscrowKey, Job, JobState, JobSubmission, PaymentGateway, RateSheet, ResourceVector,
    Settlement,
};
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::lifecycle::JobLifecycle;

/// Direct scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long a job may stay Pending without a candidate before failing.
    pub admission_timeout: Duration,
    /// Runtime limit when a submission omits one.
    pub default_timeout_secs: u64,
    /// Retry budget when a submission omits one.
    pub default_max_retries: u32,
    /// Largest retry budget a submission may ask for.
    pub max_retries_cap: u32,
    /// Rates used to size the escrow of a direct submission.
    pub escrow_rates: RateSheet,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_secs(300),
            default_timeout_secs: 3600,
            default_max_retries: 3,
            max_retries_cap: 100,
            escrow_rates: RateSheet::REFERENCE,
        }
    }
}

/// Outcome of one scheduling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs moved to Scheduled.
    pub scheduled: usize,
    /// Jobs left Pending for lack of a free agent.
    pub waiting: usize,
    /// Jobs failed after the admission timeout.
    pub failed_no_capacity: usize,
    /// Jobs whose assignment could not be delivered and were requeued.
    pub requeued: usize,
}

/// Admits direct submissions and places Pending jobs on agents.
pub struct DirectScheduler {
    lifecycle: Arc<JobLifecycle>,
    payments: Arc<dyn PaymentGateway>,
    config: SchedulerConfig,
}

impl fmt::Debug for DirectScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectScheduler")
            .field("lifecycle", &self.lifecycle)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Placement {
    Scheduled,
    Requeued,
    Gone,
    NoAgent,
}

impl DirectScheduler {
    /// Scheduler driving `lifecycle`.
    #[must_use]
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        payments: Arc<dyn PaymentGateway>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lifecycle,
            payments,
            config,
        }
    }

    /// Lifecycle this scheduler feeds.
    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate a submission, escrow its estimated cost and queue it.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first offending field, or `Escrow`
    /// if the payment gateway refuses to lock the funds.
    pub fn submit_job(&self, submission: JobSubmission) -> Result<Job> {
        validate_submission(&submission, self.config.max_retries_cap).into_result()?;

        let now = self.lifecycle.clock().now();
        let job = Job::new(
            submission.requester_id,
            submission.requirements,
            submission.payload,
            now,
        )
        .with_priority(submission.priority)
        .with_timeout_secs(
            submission
                .timeout_secs
                .unwrap_or(self.config.default_timeout_secs),
        )
        .with_max_retries(
            submission
                .max_retries
                .unwrap_or(self.config.default_max_retries),
        );

        let amount = self
            .config
            .escrow_rates
            .cost_for(&job.requirements, job.timeout());
        let escrow = EscrowKey::Job(job.id);
        self.payments
            .create_escrow(escrow, &job.requester_id, amount)
            .map_err(SchedulerError::Escrow)?;
        debug!(job_id = %job.id, amount = %amount, "escrow opened");

        let payer = job.requester_id.clone();
        let job_id = job.id;
        let job = job.with_settlement(Settlement {
            escrow,
            amount,
            payer: payer.clone(),
            payee: None,
        });

        self.lifecycle.admit(job).inspect_err(|_| {
            if let Err(e) = self.payments.refund_payment(job_id, &payer) {
                warn!(job_id = %job_id, error = %e, "refund after failed admission failed");
            }
        })
    }

    /// Free agents able to run `requirements`, best fit first.
    ///
    /// Best fit leaves the least spare capacity, compared GPU count first,
    /// then CPU, memory, storage and network. Ties go to the least loaded,
    /// then the earliest registered agent.
    #[must_use]
    pub fn candidates(&self, requirements: &ResourceVector) -> Vec<Agent> {
        let mut agents = self.lifecycle.registry().list_available(requirements);
        agents.sort_by_cached_key(|a| {
            (
                a.capability.leftover(requirements),
                a.load_percent,
                a.registration_seq,
            )
        });
        agents
    }

    fn place(&self, job: &Job, agents: impl IntoIterator<Item = Agent>) -> Placement {
        for agent in agents {
            match self.lifecycle.assign(job.id, agent.id) {
                Ok(placed) if placed.status == JobState::Scheduled => return Placement::Scheduled,
                Ok(_) => return Placement::Requeued,
                Err(SchedulerError::Registry(e)) => {
                    debug!(job_id = %job.id, agent_id = %agent.id, error = %e, "candidate taken");
                }
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "job left the queue during tick");
                    return Placement::Gone;
                }
            }
        }
        Placement::NoAgent
    }

    /// Run one scheduling pass over the eligible Pending queue.
    pub fn tick(&self) -> TickReport {
        let now = self.lifecycle.clock().now();
        let admission_timeout =
            chrono::Duration::from_std(self.config.admission_timeout).unwrap_or(chrono::Duration::MAX);
        let mut report = TickReport::default();

        for job in self.lifecycle.eligible_pending(now) {
            let bound = job
                .bound_agent_id
                .and_then(|id| self.lifecycle.registry().get(id));
            let mut placement = match bound {
                Some(agent) => self.place(&job, [agent]),
                None => Placement::NoAgent,
            };
            if matches!(placement, Placement::NoAgent) {
                placement = self.place(&job, self.candidates(&job.requirements));
            }

            match placement {
                Placement::Scheduled => report.scheduled += 1,
                Placement::Requeued => report.requeued += 1,
                Placement::Gone => {}
                Placement::NoAgent if now - job.pending_since > admission_timeout => {
                    match self
                        .lifecycle
                        .fail_unschedulable(job.id, admission_timeout, now)
                    {
                        Ok(failed) if failed.status == JobState::Failed => {
                            report.failed_no_capacity += 1;
                        }
                        Ok(_) => report.waiting += 1,
                        Err(e) => warn!(job_id = %job.id, error = %e, "admission timeout failed"),
                    }
                }
                Placement::NoAgent => report.waiting += 1,
            }
        }

        if report != TickReport::default() {
            info!(
                scheduled = report.scheduled,
                waiting = report.waiting,
                failed = report.failed_no_capacity,
                requeued = report.requeued,
                "scheduling tick"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_proto::{
        AgentId, AgentRegistration, Clock, ErrorKind, JobPayload, ManualClock, PaymentCall, Price,
        RecordingAgentClient, RecordingPaymentGateway,
    };
    use hive_registry::{Registry, RegistryConfig};
    use hive_store::{EventBus, MemoryStore};
    use std::thread;
    use test_case::test_case;

    struct Fixture {
        scheduler: Arc<DirectScheduler>,
        registry: Arc<Registry>,
        payments: Arc<RecordingPaymentGateway>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let bus = Arc::new(EventBus::new(1024, 0, clock.clone()));
        let registry = Arc::new(Registry::in_memory(
            bus.clone(),
            clock.clone(),
            RegistryConfig::default(),
        ));
        let payments = Arc::new(RecordingPaymentGateway::new());
        let lifecycle = Arc::new(JobLifecycle::new(
            Arc::new(MemoryStore::new()),
            registry.clone(),
            Arc::new(RecordingAgentClient::new()),
            payments.clone(),
            bus,
            clock.clone(),
        ));
        let scheduler = Arc::new(DirectScheduler::new(
            lifecycle,
            payments.clone(),
            SchedulerConfig {
                admission_timeout: Duration::from_secs(60),
                ..SchedulerConfig::default()
            },
        ));
        Fixture {
            scheduler,
            registry,
            payments,
            clock,
        }
    }

    impl Fixture {
        fn agent(&self, capability: ResourceVector) -> AgentId {
            let id = AgentId::new();
            self.registry
                .register(id, AgentRegistration::new("provider", capability))
                .unwrap();
            id
        }

        fn submit(&self, cpu: u32, mem: u64) -> Job {
            self.scheduler
                .submit_job(JobSubmission::new(
                    "alice",
                    ResourceVector::new(cpu, mem),
                    JobPayload::docker("alpine:3.19"),
                ))
                .unwrap()
        }

        fn job(&self, job: &Job) -> Job {
            self.scheduler.lifecycle().get_job(job.id).unwrap()
        }
    }

    fn submission() -> JobSubmission {
        JobSubmission::new(
            "alice",
            ResourceVector::new(2, 2048),
            JobPayload::docker("alpine:3.19"),
        )
    }

    // ==================== Submission Tests ====================

    #[test]
    fn test_submit_applies_defaults_and_escrows() {
        let f = fixture();
        let job = f.submit(2, 2048);

        assert_eq!(job.status, JobState::Pending);
        assert_eq!(job.timeout_secs, 3600);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.priority, 5);

        // 2 cores at $0.05 plus 2 GiB at $0.01, for one hour.
        let expected = Price::from_micros(120_000);
        assert_eq!(job.settlement.as_ref().unwrap().amount, expected);
        assert_eq!(
            f.payments.calls(),
            vec![PaymentCall::Escrow {
                key: EscrowKey::Job(job.id),
                payer: "alice".into(),
                amount: expected,
            }]
        );
    }

    #[test_case(submission().with_priority(11), "priority"; "priority above ten")]
    #[test_case(JobSubmission::new("alice", ResourceVector::new(0, 2048), JobPayload::docker("alpine")), "requirements.cpu_cores"; "zero cpu")]
    #[test_case(JobSubmission::new("alice", ResourceVector::new(2, 0), JobPayload::docker("alpine")), "requirements.memory_mb"; "zero memory")]
    #[test_case(JobSubmission::new("alice", ResourceVector::new(2, 2048), JobPayload::docker("")), "payload.image"; "empty image")]
    #[test_case(submission().with_timeout_secs(0), "timeout_secs"; "zero timeout")]
    #[test_case(submission().with_max_retries(101), "max_retries"; "retries above cap")]
    fn test_submit_validation(submission: JobSubmission, field: &str) {
        let f = fixture();
        let err = f.scheduler.submit_job(submission).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(err, SchedulerError::Validation(e) if e.field == field));
        assert!(f.payments.calls().is_empty());
    }

    #[test]
    fn test_declined_escrow_rejects_submission() {
        let f = fixture();
        f.payments.set_decline_escrow(true);

        let err = f.scheduler.submit_job(submission()).unwrap_err();
        assert!(matches!(err, SchedulerError::Escrow(_)));
        assert!(f
            .scheduler
            .lifecycle()
            .list_jobs(&hive_proto::JobFilter::default())
            .is_empty());
    }

    // ==================== Tick Tests ====================

    #[test]
    fn test_tick_schedules_on_capable_agent() {
        let f = fixture();
        let agent = f.agent(ResourceVector::new(4, 4096));
        let job = f.submit(2, 2048);

        let report = f.scheduler.tick();
        assert_eq!(report.scheduled, 1);

        let job = f.job(&job);
        assert_eq!(job.status, JobState::Scheduled);
        assert_eq!(job.assigned_agent_id, Some(agent));
        assert_eq!(f.registry.get(agent).unwrap().current_job_id, Some(job.id));
    }

    #[test]
    fn test_tick_prefers_best_fit() {
        let f = fixture();
        let _big = f.agent(ResourceVector::new(32, 65_536));
        let snug = f.agent(ResourceVector::new(4, 4096));
        let _gpu = f.agent(ResourceVector::new(4, 4096).with_gpus(1));
        let job = f.submit(2, 2048);

        f.scheduler.tick();
        assert_eq!(f.job(&job).assigned_agent_id, Some(snug));
    }

    #[test]
    fn test_candidates_break_ties_on_registration() {
        let f = fixture();
        let first = f.agent(ResourceVector::new(4, 4096));
        let second = f.agent(ResourceVector::new(4, 4096));

        let ids: Vec<_> = f
            .scheduler
            .candidates(&ResourceVector::new(1, 1024))
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_tick_serves_higher_priority_first() {
        let f = fixture();
        let agent = f.agent(ResourceVector::new(4, 4096));
        let low = f.submit(2, 2048);
        let high = f
            .scheduler
            .submit_job(submission().with_priority(9))
            .unwrap();

        let report = f.scheduler.tick();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.waiting, 1);
        assert_eq!(f.job(&high).assigned_agent_id, Some(agent));
        assert_eq!(f.job(&low).status, JobState::Pending);
    }

    #[test]
    fn test_tick_fails_job_after_admission_timeout() {
        let f = fixture();
        f.agent(ResourceVector::new(1, 1024));
        let job = f.submit(64, 65_536);

        assert_eq!(f.scheduler.tick().waiting, 1);
        f.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(f.scheduler.tick().failed_no_capacity, 1);

        let job = f.job(&job);
        assert_eq!(job.status, JobState::Failed);
        assert!(job.failure.unwrap().reason.contains("no capacity"));
        assert!(f
            .payments
            .settlements_for(job.id)
            .iter()
            .any(|c| matches!(c, PaymentCall::Refund { .. })));
    }

    #[test]
    fn test_tick_skips_jobs_in_backoff() {
        let f = fixture();
        let agent = f.agent(ResourceVector::new(4, 4096));
        let job = f.submit(2, 2048);
        f.scheduler.tick();
        let lifecycle = f.scheduler.lifecycle();
        lifecycle
            .report_status(job.id, hive_proto::StatusReport::running(agent))
            .unwrap();
        lifecycle
            .report_status(job.id, hive_proto::StatusReport::failed(agent, Some(1), "x"))
            .unwrap();

        assert_eq!(f.scheduler.tick(), TickReport::default());
        f.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(f.scheduler.tick().scheduled, 1);
    }

    #[test]
    fn test_bound_job_goes_to_its_agent() {
        let f = fixture();
        let snug = f.agent(ResourceVector::new(2, 2048));
        let bound = f.agent(ResourceVector::new(16, 16_384));
        let lifecycle = f.scheduler.lifecycle();
        f.registry.reserve(bound, hive_proto::JobId::new()).unwrap();
        let job = lifecycle
            .admit_bound(
                Job::new(
                    "bob".into(),
                    ResourceVector::new(2, 2048),
                    JobPayload::docker("alpine"),
                    f.clock.now(),
                ),
                bound,
            )
            .unwrap();
        assert_eq!(job.status, JobState::Pending);

        // Bound agent still busy: falls back to the normal search.
        f.scheduler.tick();
        assert_eq!(f.job(&job).assigned_agent_id, Some(snug));
    }

    // ==================== Concurrency Tests ====================

    #[test]
    fn test_concurrent_ticks_never_double_book() {
        let f = fixture();
        let agents: Vec<_> = (0..4)
            .map(|_| f.agent(ResourceVector::new(4, 4096)))
            .collect();
        for _ in 0..12 {
            f.submit(2, 2048);
        }

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let scheduler = Arc::clone(&f.scheduler);
                thread::spawn(move || scheduler.tick().scheduled)
            })
            .collect();
        let scheduled: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(scheduled, agents.len());
        for agent in agents {
            let holding = f.scheduler.lifecycle().list_jobs(&hive_proto::JobFilter {
                agent_id: Some(agent),
                ..hive_proto::JobFilter::default()
            });
            assert_eq!(holding.len(), 1);
        }
    }
}
