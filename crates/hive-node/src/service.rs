//! Service facade.
//!
//! [`HiveService`] wires the registry, lifecycle, direct scheduler and
//! market over one event bus and exposes every operation the daemon offers.
//! The periodic passes the workers drive are here too, so a test can run
//! them by hand against a [`ManualClock`](hive_proto::ManualClock).

use std::fmt;
use std::sync::Arc;

use hive_market::{Market, MarketError, MatchingReport};
use hive_proto::{
    Agent, AgentClient, AgentId, AgentRegistration, Bid, BidFilter, BidSpec, Clock,
    EventEnvelope, Heartbeat, Job, JobFilter, JobId, JobSubmission, Match, MatchId, MatchStatus,
    Offer, OfferFilter, OfferSpec, Party, PaymentGateway, StatusReport,
};
use hive_registry::Registry;
use hive_scheduler::{DirectScheduler, JobLifecycle, SchedulerError, TickReport};
use hive_store::{EventBus, MemoryStore};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::HiveConfig;
use crate::error::Result;

/// Outcome of one stale-agent eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Evicted agents that were holding a job.
    pub lost: usize,
    /// Jobs sent back to Pending.
    pub requeued: usize,
    /// Jobs failed because their infrastructure retries ran out.
    pub failed: usize,
}

/// The scheduler and marketplace behind one facade.
pub struct HiveService {
    registry: Arc<Registry>,
    lifecycle: Arc<JobLifecycle>,
    scheduler: DirectScheduler,
    market: Market,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for HiveService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiveService")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("market", &self.market)
            .finish_non_exhaustive()
    }
}

impl HiveService {
    /// Build the core from `config` with in-memory stores.
    #[must_use]
    pub fn new(
        config: &HiveConfig,
        agents: Arc<dyn AgentClient>,
        payments: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let attempts = config.store.update_attempts;
        let bus = Arc::new(EventBus::new(
            config.events.capacity,
            config.events.history_limit,
            Arc::clone(&clock),
        ));
        let registry = Arc::new(Registry::in_memory(
            bus.clone(),
            Arc::clone(&clock),
            config.registry.to_config(attempts),
        ));
        let lifecycle = Arc::new(
            JobLifecycle::new(
                Arc::new(MemoryStore::new()),
                registry.clone(),
                agents,
                Arc::clone(&payments),
                bus.clone(),
                Arc::clone(&clock),
            )
            .with_retry_policy(config.retry.to_policy())
            .with_update_attempts(attempts),
        );
        let scheduler = DirectScheduler::new(
            lifecycle.clone(),
            Arc::clone(&payments),
            config.scheduler.to_config(),
        );
        let market = Market::new(
            lifecycle.clone(),
            payments,
            bus.clone(),
            config.market.to_config(attempts),
        );

        Self {
            registry,
            lifecycle,
            scheduler,
            market,
            bus,
            clock,
        }
    }

    /// Clock in use.
    #[must_use]
    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ==================== Agents ====================

    /// Register an agent or bring an Offline one back.
    ///
    /// # Errors
    ///
    /// Returns a registry error for invalid or duplicate registrations.
    pub fn register_agent(&self, agent_id: AgentId, registration: AgentRegistration) -> Result<Agent> {
        Ok(self.registry.register(agent_id, registration)?)
    }

    /// Record an agent heartbeat.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the agent is unknown or Offline.
    pub fn heartbeat(&self, agent_id: AgentId, heartbeat: Heartbeat) -> Result<Agent> {
        Ok(self.registry.heartbeat(agent_id, heartbeat)?)
    }

    /// Look up an agent.
    #[must_use]
    pub fn get_agent(&self, agent_id: AgentId) -> Option<Agent> {
        self.registry.get(agent_id)
    }

    /// Every agent, in registration order.
    #[must_use]
    pub fn list_agents(&self) -> Vec<Agent> {
        self.registry.list()
    }

    // ==================== Jobs ====================

    /// Submit a job for direct scheduling.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error if validation or escrow fails.
    pub fn submit_job(&self, submission: JobSubmission) -> Result<Job> {
        Ok(self.scheduler.submit_job(submission)?)
    }

    /// Look up a job.
    ///
    /// # Errors
    ///
    /// Returns `UnknownJob` if no such job exists.
    pub fn get_job(&self, job_id: JobId) -> Result<Job> {
        Ok(self
            .lifecycle
            .get_job(job_id)
            .ok_or(SchedulerError::UnknownJob(job_id))?)
    }

    /// Jobs passing `filter`, in queue order.
    #[must_use]
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.lifecycle.list_jobs(filter)
    }

    /// Cancel a non-terminal job.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error if the job is unknown or already terminal.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        Ok(self.lifecycle.cancel_job(job_id)?)
    }

    /// Apply an agent's status report.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error for malformed, misdirected or out-of-order
    /// reports.
    pub fn report_status(&self, job_id: JobId, report: StatusReport) -> Result<Job> {
        Ok(self.lifecycle.report_status(job_id, report)?)
    }

    // ==================== Marketplace ====================

    /// Publish an offer.
    ///
    /// # Errors
    ///
    /// Returns a market error if the offer is invalid.
    pub fn create_offer(&self, spec: OfferSpec) -> Result<Offer> {
        Ok(self.market.create_offer(spec)?)
    }

    /// Place a bid.
    ///
    /// # Errors
    ///
    /// Returns a market error if the bid is invalid.
    pub fn create_bid(&self, spec: BidSpec) -> Result<Bid> {
        Ok(self.market.create_bid(spec)?)
    }

    /// Offers passing `filter`.
    #[must_use]
    pub fn list_offers(&self, filter: &OfferFilter) -> Vec<Offer> {
        self.market.list_offers(filter)
    }

    /// Bids passing `filter`.
    #[must_use]
    pub fn list_bids(&self, filter: &BidFilter) -> Vec<Bid> {
        self.market.list_bids(filter)
    }

    /// Look up a match.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMatch` if no such match exists.
    pub fn get_match(&self, match_id: MatchId) -> Result<Match> {
        Ok(self
            .market
            .get_match(match_id)
            .ok_or(MarketError::UnknownMatch(match_id))?)
    }

    /// Matches, optionally only those in `status`.
    #[must_use]
    pub fn list_matches(&self, status: Option<MatchStatus>) -> Vec<Match> {
        self.market.list_matches(status)
    }

    /// Accept a match on behalf of `party`.
    ///
    /// # Errors
    ///
    /// Returns a market error if the match is closed or escrow fails.
    pub fn confirm_match(&self, match_id: MatchId, party: Party) -> Result<Match> {
        Ok(self.market.confirm_match(match_id, party)?)
    }

    /// Reject a Pending match.
    ///
    /// # Errors
    ///
    /// Returns a market error if the match is unknown or Confirmed.
    pub fn reject_match(&self, match_id: MatchId) -> Result<Match> {
        Ok(self.market.reject_match(match_id)?)
    }

    // ==================== Events ====================

    /// Live stream of every transition from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    /// Retained events with a sequence above `sequence`, for catching up.
    #[must_use]
    pub fn events_since(&self, sequence: u64) -> Vec<EventEnvelope> {
        self.bus.since(sequence)
    }

    /// Sequence of the last published event.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.bus.last_sequence()
    }

    // ==================== Periodic Passes ====================

    /// Place eligible Pending jobs.
    pub fn run_scheduling_tick(&self) -> TickReport {
        self.scheduler.tick()
    }

    /// Expire unconfirmed matches and stale listings, then match bids.
    pub fn run_matching(&self) -> MatchingReport {
        self.market.run_matching(self.clock.now())
    }

    /// Take silent agents Offline and requeue what they were running.
    pub fn evict_stale_agents(&self) -> EvictionReport {
        let lost = self.registry.evict_stale(self.clock.now());
        let mut report = EvictionReport {
            lost: lost.len(),
            ..EvictionReport::default()
        };
        for notice in lost {
            let job_id = notice.job_id;
            match self.lifecycle.agent_lost(notice) {
                Ok(Some(job)) if job.is_terminal() => report.failed += 1,
                Ok(Some(_)) => report.requeued += 1,
                Ok(None) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to handle lost agent"),
            }
        }
        if report.lost > 0 {
            info!(
                lost = report.lost,
                requeued = report.requeued,
                failed = report.failed,
                "jobs on lost agents handled"
            );
        }
        report
    }

    /// Time out jobs past their runtime limit.
    pub fn sweep_timeouts(&self) -> Vec<JobId> {
        self.lifecycle.sweep_timeouts(self.clock.now())
    }
}
