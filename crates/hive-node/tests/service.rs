//! End-to-end tests of the service facade and its periodic passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use hive_node::{EvictionReport, HiveConfig, HiveService, NodeError};
use hive_proto::{
    AgentId, AgentRegistration, AgentStatus, AvailabilityWindow, BidSpec, Clock, ErrorKind,
    Heartbeat, HiveEvent, JobFilter, JobPayload, JobState, JobSubmission, ManualClock,
    MatchStatus, OfferSpec, Party, PaymentCall, Price, RateSheet, RecordingAgentClient,
    RecordingPaymentGateway, ResourceVector, StatusReport,
};

struct Harness {
    service: HiveService,
    clock: Arc<ManualClock>,
    agents: Arc<RecordingAgentClient>,
    payments: Arc<RecordingPaymentGateway>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(&HiveConfig::default())
    }

    fn with_config(config: &HiveConfig) -> Self {
        let start = chrono::Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let agents = Arc::new(RecordingAgentClient::new());
        let payments = Arc::new(RecordingPaymentGateway::new());
        let service = HiveService::new(config, agents.clone(), payments.clone(), clock.clone());
        Self {
            service,
            clock,
            agents,
            payments,
        }
    }

    fn agent(&self, cpu: u32, memory_mb: u64) -> AgentId {
        let agent_id = AgentId::new();
        self.service
            .register_agent(
                agent_id,
                AgentRegistration::new("provider", ResourceVector::new(cpu, memory_mb)),
            )
            .unwrap();
        agent_id
    }

    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

fn submission(cpu: u32) -> JobSubmission {
    JobSubmission::new(
        "alice",
        ResourceVector::new(cpu, 1024),
        JobPayload::docker("alpine:3.19"),
    )
}

// ==================== Direct Scheduling Tests ====================

#[test]
fn test_submit_schedule_complete() {
    let h = Harness::new();
    let agent_id = h.agent(4, 8192);
    let job = h.service.submit_job(submission(2)).unwrap();

    let report = h.service.run_scheduling_tick();
    assert_eq!(report.scheduled, 1);
    assert_eq!(h.agents.assignments_for(agent_id), vec![job.id]);

    h.service
        .report_status(job.id, StatusReport::running(agent_id))
        .unwrap();
    let done = h
        .service
        .report_status(job.id, StatusReport::completed(agent_id))
        .unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!(
        h.service.get_agent(agent_id).unwrap().status,
        AgentStatus::Available
    );
    assert!(
        h.payments
            .settlements_for(job.id)
            .iter()
            .any(|call| matches!(call, PaymentCall::Release { .. }))
    );
}

#[test]
fn test_unknown_job_maps_to_unknown_entity() {
    let h = Harness::new();
    let err = h.service.get_job(hive_proto::JobId::new()).unwrap_err();
    assert!(matches!(err, NodeError::Scheduler(_)));
    assert_eq!(err.kind(), ErrorKind::UnknownEntity);
}

#[test]
fn test_cancel_through_facade() {
    let h = Harness::new();
    let job = h.service.submit_job(submission(2)).unwrap();
    let cancelled = h.service.cancel_job(job.id).unwrap();
    assert_eq!(cancelled.status, JobState::Cancelled);

    let pending = h.service.list_jobs(&JobFilter {
        status: Some(JobState::Pending),
        ..JobFilter::default()
    });
    assert!(pending.is_empty());
}

// ==================== Eviction Tests ====================

#[test]
fn test_eviction_requeues_onto_another_agent() {
    let h = Harness::new();
    let first = h.agent(4, 8192);
    let job = h.service.submit_job(submission(2)).unwrap();
    h.service.run_scheduling_tick();
    assert_eq!(h.service.get_job(job.id).unwrap().assigned_agent_id, Some(first));

    // Default timeout is three 30s heartbeat intervals.
    h.advance(120);
    let second = h.agent(4, 8192);
    let report = h.service.evict_stale_agents();
    assert_eq!(
        report,
        EvictionReport {
            lost: 1,
            requeued: 1,
            failed: 0,
        }
    );
    assert_eq!(h.service.get_agent(first).unwrap().status, AgentStatus::Offline);

    let requeued = h.service.get_job(job.id).unwrap();
    assert_eq!(requeued.status, JobState::Pending);
    assert_eq!(requeued.infra_retry_count, 1);
    assert_eq!(requeued.retry_count, 0);

    h.service.run_scheduling_tick();
    assert_eq!(
        h.service.get_job(job.id).unwrap().assigned_agent_id,
        Some(second)
    );
}

#[test]
fn test_heartbeats_keep_agent_alive() {
    let h = Harness::new();
    let agent_id = h.agent(4, 8192);
    for _ in 0..4 {
        h.advance(30);
        h.service
            .heartbeat(
                agent_id,
                Heartbeat::new(AgentStatus::Available, 10, h.clock_now()),
            )
            .unwrap();
    }
    assert_eq!(h.service.evict_stale_agents(), EvictionReport::default());
    assert_eq!(
        h.service.get_agent(agent_id).unwrap().status,
        AgentStatus::Available
    );
}

// ==================== Timeout Tests ====================

#[test]
fn test_timeout_sweep_through_facade() {
    let h = Harness::new();
    let agent_id = h.agent(4, 8192);
    let job = h
        .service
        .submit_job(submission(2).with_timeout_secs(60).with_max_retries(0))
        .unwrap();
    h.service.run_scheduling_tick();
    h.service
        .report_status(job.id, StatusReport::running(agent_id))
        .unwrap();

    h.advance(30);
    assert!(h.service.sweep_timeouts().is_empty());

    h.advance(31);
    assert_eq!(h.service.sweep_timeouts(), vec![job.id]);

    let timed_out = h.service.get_job(job.id).unwrap();
    assert_eq!(timed_out.status, JobState::Failed);
    assert_eq!(h.agents.stops_for(agent_id), vec![job.id]);
    assert!(h.service.get_agent(agent_id).unwrap().current_job_id.is_none());
}

// ==================== Marketplace Tests ====================

#[test]
fn test_market_flow_through_facade() {
    let h = Harness::new();
    let agent_id = h.agent(16, 65536);
    let now = h.clock_now();

    let offer = h
        .service
        .create_offer(OfferSpec::new(
            "provider",
            agent_id,
            ResourceVector::new(16, 65536),
            RateSheet::per_cpu_core(Price::from_cents(10)),
            AvailabilityWindow::starting_at(now, Duration::from_secs(24 * 3600)),
        ))
        .unwrap();
    let bid = h
        .service
        .create_bid(BidSpec::new(
            "alice",
            ResourceVector::new(8, 16384),
            Price::from_dollars(1),
            Duration::from_secs(2 * 3600),
            JobPayload::docker("trainer:latest"),
        ))
        .unwrap();

    let report = h.service.run_matching();
    assert_eq!(report.matched.len(), 1);
    let match_id = report.matched[0];

    let pending = h.service.get_match(match_id).unwrap();
    assert_eq!(pending.offer_id, offer.id);
    assert_eq!(pending.bid_id, bid.id);
    assert_eq!(pending.total_price, Price::from_cents(160));

    h.service.confirm_match(match_id, Party::Consumer).unwrap();
    let confirmed = h.service.confirm_match(match_id, Party::Provider).unwrap();
    assert_eq!(confirmed.status, MatchStatus::Confirmed);

    let job_id = confirmed.job_id.unwrap();
    let job = h.service.get_job(job_id).unwrap();
    assert_eq!(job.status, JobState::Scheduled);
    assert_eq!(job.assigned_agent_id, Some(agent_id));
    assert_eq!(
        h.service.list_matches(Some(MatchStatus::Confirmed)).len(),
        1
    );
}

#[test]
fn test_unknown_match_maps_to_unknown_entity() {
    let h = Harness::new();
    let err = h.service.get_match(hive_proto::MatchId::new()).unwrap_err();
    assert!(matches!(err, NodeError::Market(_)));
    assert_eq!(err.kind(), ErrorKind::UnknownEntity);
}

// ==================== Event Tests ====================

#[test]
fn test_events_since_catches_up() {
    let h = Harness::new();
    let agent_id = h.agent(4, 8192);
    let before = h.service.last_sequence();

    let job = h.service.submit_job(submission(2)).unwrap();
    h.service.run_scheduling_tick();

    let events = h.service.events_since(before);
    assert!(events.iter().all(|e| e.sequence > before));
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        HiveEvent::JobSubmitted { job_id, .. } if *job_id == job.id
    )));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        HiveEvent::JobAssigned { job_id, agent_id: assigned, .. }
            if *job_id == job.id && *assigned == agent_id
    )));
}

#[tokio::test]
async fn test_subscribers_see_live_events() {
    let h = Harness::new();
    let mut events = h.service.subscribe();
    let agent_id = h.agent(4, 8192);

    let envelope = events.recv().await.unwrap();
    assert_eq!(envelope.event.name(), "agent.registered");
    assert!(matches!(
        envelope.event,
        HiveEvent::AgentRegistered { agent_id: registered, .. } if registered == agent_id
    ));
}

// ==================== Configuration Tests ====================

#[test]
fn test_config_tunes_the_core() {
    let config = HiveConfig::from_toml(
        r#"
        [registry]
        heartbeat_interval_secs = 5

        [scheduler]
        admission_timeout_secs = 10
        "#,
    )
    .unwrap();
    let h = Harness::with_config(&config);
    let job = h.service.submit_job(submission(2)).unwrap();

    h.advance(11);
    let report = h.service.run_scheduling_tick();
    assert_eq!(report.failed_no_capacity, 1);
    let failed = h.service.get_job(job.id).unwrap();
    assert_eq!(failed.status, JobState::Failed);
    assert_eq!(
        failed.failure.map(|f| f.kind),
        Some(ErrorKind::CapacityUnavailable)
    );

    let agent_id = h.agent(4, 8192);
    h.advance(16);
    h.service.evict_stale_agents();
    assert_eq!(h.service.get_agent(agent_id).unwrap().status, AgentStatus::Offline);
}
