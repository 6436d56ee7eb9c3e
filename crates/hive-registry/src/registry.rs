//! Agent registry for tracking contributor agents and their capacity.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_proto::validation::validate_registration;
use hive_proto::{
    Agent, AgentId, AgentLost, AgentRegistration, AgentStatus, Clock, Heartbeat, HiveEvent,
    JobId, ResourceVector,
};
use hive_store::{
    DEFAULT_UPDATE_ATTEMPTS, Decision, EventSink, MemoryStore, RecordStore, StoreError,
    UpdateError, insert_record, update_with_retry,
};
use tracing::{debug, info, warn};

use crate::error::RegistryError;

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How often agents are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which an agent is evicted. Defaults to three intervals.
    pub heartbeat_timeout: Option<Duration>,
    /// Optimistic-update attempts per operation.
    pub update_attempts: u32,
}

impl RegistryConfig {
    /// Effective eviction threshold.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
            .unwrap_or_else(|| self.heartbeat_interval.saturating_mul(3))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: None,
            update_attempts: DEFAULT_UPDATE_ATTEMPTS,
        }
    }
}

/// Registry of contributor agents.
pub struct Registry {
    agents: Arc<dyn RecordStore<AgentId, Agent>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    next_seq: AtomicU64,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("agents", &self.agents.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lift(agent_id: AgentId, err: UpdateError<RegistryError>) -> RegistryError {
    match err {
        UpdateError::NotFound(_) => RegistryError::UnknownAgent(agent_id),
        UpdateError::Conflict { .. } => RegistryError::Conflict(agent_id),
        UpdateError::Rejected(e) => e,
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl Registry {
    /// Registry over `agents`, publishing to `sink`.
    #[must_use]
    pub fn new(
        agents: Arc<dyn RecordStore<AgentId, Agent>>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            agents,
            sink,
            clock,
            config,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Registry over a fresh in-memory store.
    #[must_use]
    pub fn in_memory(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), sink, clock, config)
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an agent, or bring an Offline one back with new capacity.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAgent` if the agent exists and is not Offline, or
    /// `Validation` if the registration is malformed.
    pub fn register(
        &self,
        agent_id: AgentId,
        registration: AgentRegistration,
    ) -> Result<Agent, RegistryError> {
        validate_registration(&registration).into_result()?;
        let now = self.clock.now();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let fresh = Agent::register(agent_id, registration, seq, now);

        match insert_record(
            &*self.agents,
            agent_id,
            fresh.clone(),
            &*self.sink,
            vec![HiveEvent::AgentRegistered { agent_id }],
        ) {
            Ok(stored) => {
                info!(
                    agent_id = %agent_id,
                    capability = %stored.record.capability,
                    "agent registered"
                );
                return Ok(stored.record);
            }
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "agent insert failed");
                return Err(RegistryError::Conflict(agent_id));
            }
        }

        let committed = update_with_retry(
            &*self.agents,
            &agent_id,
            self.config.update_attempts,
            &*self.sink,
            |current| {
                if current.record.status != AgentStatus::Offline {
                    return Err(RegistryError::DuplicateAgent(agent_id));
                }
                Ok(Decision::write(
                    fresh.clone(),
                    vec![HiveEvent::AgentRegistered { agent_id }],
                ))
            },
        )
        .map_err(|e| lift(agent_id, e))?;

        info!(agent_id = %agent_id, "offline agent re-registered");
        Ok(committed.after.record)
    }

    /// Record a heartbeat.
    ///
    /// A heartbeat not newer than the last accepted one is ignored. An agent
    /// holding a job stays Busy whatever it reports.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgent` if the agent never registered, or
    /// `AgentOffline` if it was evicted and must re-register.
    pub fn heartbeat(&self, agent_id: AgentId, heartbeat: Heartbeat) -> Result<Agent, RegistryError> {
        let now = self.clock.now();

        let committed = update_with_retry(
            &*self.agents,
            &agent_id,
            self.config.update_attempts,
            &*self.sink,
            |current| {
                let agent = &current.record;
                if agent.status == AgentStatus::Offline {
                    return Err(RegistryError::AgentOffline(agent_id));
                }
                if agent
                    .last_heartbeat_sent
                    .is_some_and(|last| heartbeat.sent_at <= last)
                {
                    return Ok(Decision::Keep);
                }

                let mut next = agent.clone();
                next.last_heartbeat = now;
                next.last_heartbeat_sent = Some(heartbeat.sent_at);
                next.load_percent = heartbeat.load_percent.min(100);
                next.status = if agent.current_job_id.is_some() {
                    AgentStatus::Busy
                } else {
                    heartbeat.status
                };

                let mut events = Vec::new();
                if next.status != agent.status {
                    events.push(HiveEvent::AgentStatusChanged {
                        agent_id,
                        from: agent.status,
                        to: next.status,
                    });
                }
                Ok(Decision::write(next, events))
            },
        )
        .map_err(|e| lift(agent_id, e))?;

        if committed.changed() {
            debug!(
                agent_id = %agent_id,
                status = %committed.after.record.status,
                load = committed.after.record.load_percent,
                "heartbeat accepted"
            );
        }
        Ok(committed.after.record)
    }

    /// Available agents with no job whose capability dominates `min`.
    ///
    /// Ordered by lowest load, then earliest registration.
    #[must_use]
    pub fn list_available(&self, min: &ResourceVector) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|a| a.is_free() && a.capability.dominates(min))
            .collect();
        agents.sort_by_key(|a| (a.load_percent, a.registration_seq));
        agents
    }

    /// Mark agents silent for longer than the heartbeat timeout as Offline.
    ///
    /// Returns a notice for every evicted agent that held a job. The agent's
    /// job reference is dropped at once.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<AgentLost> {
        let timeout = to_chrono(self.config.heartbeat_timeout());
        let is_stale =
            |agent: &Agent| agent.status != AgentStatus::Offline && now - agent.last_heartbeat > timeout;

        let stale: Vec<AgentId> = self
            .agents
            .list()
            .into_iter()
            .filter(|v| is_stale(&v.record))
            .map(|v| v.record.id)
            .collect();

        let mut lost = Vec::new();
        for agent_id in stale {
            let result = update_with_retry(
                &*self.agents,
                &agent_id,
                self.config.update_attempts,
                &*self.sink,
                |current| {
                    let agent = &current.record;
                    if !is_stale(agent) {
                        return Ok::<_, RegistryError>(Decision::Keep);
                    }
                    let mut next = agent.clone();
                    next.status = AgentStatus::Offline;
                    next.current_job_id = None;
                    Ok(Decision::write(
                        next,
                        vec![HiveEvent::AgentStatusChanged {
                            agent_id,
                            from: agent.status,
                            to: AgentStatus::Offline,
                        }],
                    ))
                },
            );

            match result {
                Ok(committed) if committed.changed() => {
                    let held = committed.before.record.current_job_id;
                    warn!(
                        agent_id = %agent_id,
                        last_heartbeat = %committed.before.record.last_heartbeat,
                        job_id = ?held,
                        "agent evicted after missed heartbeats"
                    );
                    if let Some(job_id) = held {
                        lost.push(AgentLost { agent_id, job_id });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %lift(agent_id, e), "eviction failed");
                }
            }
        }
        lost
    }

    /// Reserve an agent for a job.
    ///
    /// Re-checks at commit time that the agent is still Available with no
    /// job. Reserving the same job twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AgentUnavailable` if the agent is busy, offline or holds
    /// another job.
    pub fn reserve(&self, agent_id: AgentId, job_id: JobId) -> Result<Agent, RegistryError> {
        let committed = update_with_retry(
            &*self.agents,
            &agent_id,
            self.config.update_attempts,
            &*self.sink,
            |current| {
                let agent = &current.record;
                if agent.current_job_id == Some(job_id) {
                    return Ok(Decision::Keep);
                }
                if !agent.is_free() {
                    return Err(RegistryError::AgentUnavailable {
                        agent_id,
                        job_id,
                        status: agent.status,
                    });
                }
                let mut next = agent.clone();
                next.status = AgentStatus::Busy;
                next.current_job_id = Some(job_id);
                Ok(Decision::write(
                    next,
                    vec![HiveEvent::AgentStatusChanged {
                        agent_id,
                        from: AgentStatus::Available,
                        to: AgentStatus::Busy,
                    }],
                ))
            },
        )
        .map_err(|e| lift(agent_id, e))?;

        debug!(agent_id = %agent_id, job_id = %job_id, "agent reserved");
        Ok(committed.after.record)
    }

    /// Free an agent from a job. No-op if the agent holds something else.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgent` if the agent does not exist.
    pub fn release(&self, agent_id: AgentId, job_id: JobId) -> Result<Agent, RegistryError> {
        let committed = update_with_retry(
            &*self.agents,
            &agent_id,
            self.config.update_attempts,
            &*self.sink,
            |current| {
                let agent = &current.record;
                if agent.current_job_id != Some(job_id) {
                    return Ok(Decision::Keep);
                }
                let mut next = agent.clone();
                next.current_job_id = None;
                if next.status == AgentStatus::Busy {
                    next.status = AgentStatus::Available;
                }
                let mut events = Vec::new();
                if next.status != agent.status {
                    events.push(HiveEvent::AgentStatusChanged {
                        agent_id,
                        from: agent.status,
                        to: next.status,
                    });
                }
                Ok(Decision::write(next, events))
            },
        )
        .map_err(|e| lift(agent_id, e))?;

        if committed.changed() {
            debug!(agent_id = %agent_id, job_id = %job_id, "agent released");
        }
        Ok(committed.after.record)
    }

    /// Replace an agent's reputation score.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgent` if absent or `Validation` if the score exceeds 1000.
    pub fn set_reputation(&self, agent_id: AgentId, reputation: u32) -> Result<Agent, RegistryError> {
        if reputation > hive_proto::agent::MAX_REPUTATION {
            return Err(hive_proto::ValidationError::new(
                "reputation",
                format!("cannot exceed {}", hive_proto::agent::MAX_REPUTATION),
            )
            .into());
        }
        let committed = update_with_retry(
            &*self.agents,
            &agent_id,
            self.config.update_attempts,
            &*self.sink,
            |current| {
                if current.record.reputation == reputation {
                    return Ok(Decision::Keep);
                }
                let mut next = current.record.clone();
                next.reputation = reputation;
                Ok(Decision::write(next, Vec::new()))
            },
        )
        .map_err(|e| lift(agent_id, e))?;
        Ok(committed.after.record)
    }

    /// Look up one agent.
    #[must_use]
    pub fn get(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.get(&agent_id).map(|v| v.record)
    }

    /// Every agent, in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.list().into_iter().map(|v| v.record).collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }

    /// Number of registered agents, Offline included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent ever registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
