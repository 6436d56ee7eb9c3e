//! Shared fixture: a full service on a manual clock with recording
//! collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hive_node::{HiveConfig, HiveService};
use hive_proto::{
    AgentId, AgentRegistration, AgentStatus, AvailabilityWindow, BidSpec, Clock, JobFilter,
    JobPayload, JobState, JobSubmission, ManualClock, OfferSpec, PaymentGateway, Price,
    RateSheet, RecordingAgentClient, RecordingPaymentGateway, ResourceVector,
};

pub struct Hive {
    pub service: Arc<HiveService>,
    pub clock: Arc<ManualClock>,
    pub agents: Arc<RecordingAgentClient>,
    pub payments: Arc<RecordingPaymentGateway>,
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

impl Hive {
    pub fn new() -> Self {
        Self::with_config(&HiveConfig::default())
    }

    pub fn with_config(config: &HiveConfig) -> Self {
        Self::build(config, |payments| -> Arc<dyn PaymentGateway> { payments })
    }

    /// Route payments through `wrap`; calls still land in `payments`.
    pub fn with_gateway<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<RecordingPaymentGateway>) -> Arc<dyn PaymentGateway>,
    {
        Self::build(&HiveConfig::default(), wrap)
    }

    fn build<F>(config: &HiveConfig, wrap: F) -> Self
    where
        F: FnOnce(Arc<RecordingPaymentGateway>) -> Arc<dyn PaymentGateway>,
    {
        let clock = Arc::new(ManualClock::new(epoch()));
        let agents = Arc::new(RecordingAgentClient::new());
        let payments = Arc::new(RecordingPaymentGateway::new());
        let service = Arc::new(HiveService::new(
            config,
            agents.clone(),
            wrap(payments.clone()),
            clock.clone(),
        ));
        Self {
            service,
            clock,
            agents,
            payments,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn agent(&self, cpu: u32, memory_mb: u64) -> AgentId {
        let agent_id = AgentId::new();
        self.service
            .register_agent(
                agent_id,
                AgentRegistration::new("provider", ResourceVector::new(cpu, memory_mb)),
            )
            .unwrap();
        agent_id
    }

    pub fn located_agent(&self, cpu: u32, memory_mb: u64, location: &str) -> AgentId {
        let agent_id = AgentId::new();
        self.service
            .register_agent(
                agent_id,
                AgentRegistration::new("provider", ResourceVector::new(cpu, memory_mb))
                    .with_location(location),
            )
            .unwrap();
        agent_id
    }

    pub fn offer_spec(&self, agent_id: AgentId, cpu: u32, cents_per_core: u64) -> OfferSpec {
        OfferSpec::new(
            "provider",
            agent_id,
            ResourceVector::new(cpu, 65536),
            RateSheet::per_cpu_core(Price::from_cents(cents_per_core)),
            AvailabilityWindow::starting_at(self.now(), Duration::from_secs(24 * 3600)),
        )
    }

    /// Jobs currently holding `agent_id`.
    pub fn holders_of(&self, agent_id: AgentId) -> usize {
        self.service
            .list_jobs(&JobFilter {
                agent_id: Some(agent_id),
                ..JobFilter::default()
            })
            .iter()
            .filter(|j| j.status.holds_agent())
            .count()
    }

    /// Check the cross-record invariants between jobs and agents.
    pub fn assert_consistent(&self) {
        for agent in self.service.list_agents() {
            assert!(
                self.holders_of(agent.id) <= 1,
                "agent {} holds more than one job",
                agent.id
            );
            if let Some(job_id) = agent.current_job_id {
                let job = self.service.get_job(job_id).unwrap();
                assert!(job.status.holds_agent(), "agent points at {} job", job.status);
                assert_eq!(job.assigned_agent_id, Some(agent.id));
                assert_eq!(agent.status, AgentStatus::Busy);
            }
        }
        for job in self.service.list_jobs(&JobFilter::default()) {
            assert!(job.retry_count <= job.max_retries);
            assert_eq!(job.assigned_agent_id.is_some(), job.status.holds_agent());
            if let Some(agent_id) = job.assigned_agent_id {
                let agent = self.service.get_agent(agent_id).unwrap();
                assert_eq!(agent.current_job_id, Some(job.id));
            }
            if job.status == JobState::Failed && job.is_terminal() {
                assert!(!job.trail.is_empty(), "final failure without attempt trail");
            }
        }
    }
}

pub fn submission(cpu: u32, memory_mb: u64) -> JobSubmission {
    JobSubmission::new(
        "alice",
        ResourceVector::new(cpu, memory_mb),
        JobPayload::docker("alpine:3.19"),
    )
}

pub fn bid_spec(cpu: u32, max_dollars_per_hour: u64, hours: u64) -> BidSpec {
    BidSpec::new(
        "alice",
        ResourceVector::new(cpu, 16384),
        Price::from_dollars(max_dollars_per_hour),
        Duration::from_secs(hours * 3600),
        JobPayload::docker("trainer:latest"),
    )
}
