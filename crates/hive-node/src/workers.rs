//! Periodic background workers.
//!
//! Four independent loops drive the time-based parts of the core: the
//! scheduling tick, the matching pass, stale-agent eviction and the runtime
//! sweep. Each pass runs on the blocking pool because the core is
//! synchronous. All loops stop on one shared shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::WorkersSection;
use crate::error::{NodeError, Result};
use crate::service::HiveService;

/// How often each worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPeriods {
    /// Scheduling tick.
    pub tick: Duration,
    /// Matching pass and confirmation expiry.
    pub matching: Duration,
    /// Stale-agent eviction.
    pub eviction: Duration,
    /// Runtime-limit sweep.
    pub timeout_sweep: Duration,
}

impl From<&WorkersSection> for WorkerPeriods {
    fn from(section: &WorkersSection) -> Self {
        Self {
            tick: Duration::from_secs(section.tick_interval_secs),
            matching: Duration::from_secs(section.matching_interval_secs),
            eviction: Duration::from_secs(section.eviction_interval_secs),
            timeout_sweep: Duration::from_secs(section.timeout_sweep_interval_secs),
        }
    }
}

/// Handle to the running workers.
#[derive(Debug)]
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Start every worker against `service`.
#[must_use]
pub fn spawn(service: Arc<HiveService>, periods: WorkerPeriods) -> Workers {
    let (shutdown, signal) = watch::channel(false);
    let handles = vec![
        (
            "scheduler",
            spawn_worker("scheduler", periods.tick, &service, signal.clone(), |s| {
                s.run_scheduling_tick();
            }),
        ),
        (
            "matching",
            spawn_worker("matching", periods.matching, &service, signal.clone(), |s| {
                s.run_matching();
            }),
        ),
        (
            "eviction",
            spawn_worker("eviction", periods.eviction, &service, signal.clone(), |s| {
                s.evict_stale_agents();
            }),
        ),
        (
            "timeouts",
            spawn_worker("timeouts", periods.timeout_sweep, &service, signal, |s| {
                s.sweep_timeouts();
            }),
        ),
    ];
    info!(?periods, "workers started");
    Workers { shutdown, handles }
}

fn spawn_worker(
    name: &'static str,
    period: Duration,
    service: &Arc<HiveService>,
    mut shutdown: watch::Receiver<bool>,
    pass: fn(&HiveService),
) -> JoinHandle<()> {
    let service = Arc::clone(service);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let service = Arc::clone(&service);
            if let Err(e) = tokio::task::spawn_blocking(move || pass(&service)).await {
                error!(worker = name, error = %e, "worker pass panicked");
            }
        }
        debug!(worker = name, "worker stopped");
    })
}

impl Workers {
    /// Ask every worker to stop after its current pass.
    pub fn shutdown(&self) {
        // Receivers live as long as their loops; an error means all exited.
        let _ = self.shutdown.send(true);
    }

    /// Wait for every worker to exit.
    ///
    /// # Errors
    ///
    /// Returns `Worker` naming the first loop that panicked or was aborted.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(worker = name, error = %e, "worker exited abnormally");
                first_error.get_or_insert(NodeError::Worker {
                    name,
                    reason: e.to_string(),
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Signal shutdown and wait for every worker.
    ///
    /// # Errors
    ///
    /// See [`Workers::join`].
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.join().await?;
        info!("workers stopped");
        Ok(())
    }

    /// Names of the running workers.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }
}
