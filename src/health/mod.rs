/// Backend health monitoring
///
/// A single recurring job walks every known backend, checks its uptime
/// window, probes live clusters for readiness and load, and pushes the
/// resulting health transitions to the management API.
pub mod trino;

use crate::api::GatewayApi;
use crate::config::{LoadWeights, MonitorConfig};
use crate::core::Backend;
use crate::error::ProbeError;
use crate::metrics::GatewayMetrics;
use crate::utils;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use trino::TrinoProbe;

/// Per-state query counts reported by a cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterLoadStats {
    pub queued: i64,
    pub waiting_for_resources: i64,
    pub dispatching: i64,
    pub planning: i64,
    pub starting: i64,
    pub running: i64,
    pub finishing: i64,
}

impl ClusterLoadStats {
    /// Fold `(state, count)` rows into stats; unknown states are ignored
    pub fn from_state_counts<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let mut stats = Self::default();
        for (state, count) in rows {
            match state {
                "QUEUED" => stats.queued = count,
                "WAITING_FOR_RESOURCES" => stats.waiting_for_resources = count,
                "DISPATCHING" => stats.dispatching = count,
                "PLANNING" => stats.planning = count,
                "STARTING" => stats.starting = count,
                "RUNNING" => stats.running = count,
                "FINISHING" => stats.finishing = count,
                _ => {}
            }
        }
        stats
    }

    /// Single load score, see [`LoadWeights`]
    pub fn load(&self, weights: &LoadWeights) -> i32 {
        let active = self.planning + self.dispatching + self.finishing + self.running;
        let waiting = self.queued + self.starting;
        let divisor = weights.queued_divisor.max(1);
        let load = weights.running_weight * active + waiting / divisor;
        i32::try_from(load).unwrap_or(i32::MAX)
    }
}

/// Live checks against one backend cluster
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Coordinator reachable, reports a version and has finished starting
    async fn is_cluster_up(&self, backend: &Backend) -> Result<bool, ProbeError>;

    /// Health check query drains without error
    async fn is_cluster_healthy(&self, backend: &Backend) -> Result<bool, ProbeError>;

    async fn cluster_load_stats(&self, backend: &Backend) -> Result<ClusterLoadStats, ProbeError>;
}

/// Result of a single monitor run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { healthy: usize, unhealthy: usize },
    /// Previous run still in flight
    Rescheduled,
    /// Backends could not be listed
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed { healthy, unhealthy } => {
                write!(f, "Completed ({} healthy, {} unhealthy)", healthy, unhealthy)
            }
            RunOutcome::Rescheduled => write!(f, "Rescheduled"),
            RunOutcome::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Backends partitioned by their next health state
#[derive(Debug, Default)]
pub struct BackendsNewState {
    pub healthy: Vec<Backend>,
    pub unhealthy: Vec<Backend>,
}

/// Recurring health job for all backends
pub struct HealthMonitor {
    api: Arc<dyn GatewayApi>,
    probe: Arc<dyn ClusterProbe>,
    metrics: Arc<GatewayMetrics>,
    config: MonitorConfig,
    running: AtomicBool,
}

/// Clears the in-flight flag when a run ends, including on cancellation
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthMonitor {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        probe: Arc<dyn ClusterProbe>,
        metrics: Arc<GatewayMetrics>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            api,
            probe,
            metrics,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_sec.max(1))
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.probe_timeout_sec.max(1))
    }

    /// Run one monitoring pass unless another one is still in flight
    pub async fn execute(&self) -> RunOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Previous monitor run still in progress, rescheduling");
            return RunOutcome::Rescheduled;
        }
        let _guard = RunGuard(&self.running);

        let started = Instant::now();
        info!("Starting monitor run");

        let state = match self.evaluate_backend_new_state().await {
            Some(state) => state,
            None => return RunOutcome::Aborted,
        };

        if state.healthy.is_empty() {
            warn!("No healthy backends found");
        }

        self.apply(&state).await;

        let elapsed = started.elapsed();
        self.metrics
            .record_monitor_run(elapsed, utils::epoch_seconds());
        info!(
            healthy = state.healthy.len(),
            unhealthy = state.unhealthy.len(),
            duration = %utils::format_duration(elapsed),
            "Monitor run finished"
        );

        RunOutcome::Completed {
            healthy: state.healthy.len(),
            unhealthy: state.unhealthy.len(),
        }
    }

    /// Decide the next health state of every backend
    pub async fn evaluate_backend_new_state(&self) -> Option<BackendsNewState> {
        let backends = match self.api.list_all_backends().await {
            Ok(backends) => backends,
            Err(e) => {
                error!(error = %e, "Unable to list backends, aborting monitor run");
                return None;
            }
        };

        let mut state = BackendsNewState::default();
        for backend in backends {
            if self.evaluate_backend(&backend).await {
                state.healthy.push(backend);
            } else {
                state.unhealthy.push(backend);
            }
        }
        Some(state)
    }

    async fn evaluate_backend(&self, backend: &Backend) -> bool {
        match utils::is_time_in_cron(Utc::now(), &backend.uptime_schedule) {
            Ok(true) => {}
            Ok(false) => {
                debug!(backend_id = %backend.id, "Outside uptime window");
                return false;
            }
            Err(e) => {
                error!(
                    backend_id = %backend.id,
                    schedule = %backend.uptime_schedule,
                    error = %e,
                    "Unable to parse uptime schedule, marking as unhealthy"
                );
                return false;
            }
        }

        match timeout(self.probe_timeout(), self.is_backend_healthy(backend)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                warn!(backend_id = %backend.id, error = %e, "Probe failed, assuming unhealthy");
                false
            }
            Err(_) => {
                warn!(
                    backend_id = %backend.id,
                    timeout = ?self.probe_timeout(),
                    "Probe timed out, assuming unhealthy"
                );
                false
            }
        }
    }

    async fn is_backend_healthy(&self, backend: &Backend) -> Result<bool, ProbeError> {
        if !self.probe.is_cluster_up(backend).await? {
            info!(backend_id = %backend.id, "Cluster not ready");
            return Ok(false);
        }
        if !self.probe.is_cluster_healthy(backend).await? {
            info!(backend_id = %backend.id, "Health check query failed");
            return Ok(false);
        }

        let stats = self.probe.cluster_load_stats(backend).await?;
        let load = stats.load(&self.config.load_weights);
        self.metrics.set_backend_load(&backend.id, load);
        if let Err(e) = self.api.update_cluster_load(&backend.id, load).await {
            error!(backend_id = %backend.id, load, error = %e, "Unable to update cluster load");
        }

        let threshold = self.threshold_for(backend);
        if threshold == 0 || load <= threshold {
            debug!(backend_id = %backend.id, load, threshold, "Cluster load within threshold");
            Ok(true)
        } else {
            info!(backend_id = %backend.id, load, threshold, "Cluster load above threshold");
            Ok(false)
        }
    }

    /// Backend's own threshold, else the configured default; 0 disables
    fn threshold_for(&self, backend: &Backend) -> i32 {
        if backend.threshold_cluster_load != 0 {
            backend.threshold_cluster_load
        } else {
            self.config.default_load_threshold
        }
    }

    /// Push every transition concurrently and wait for all of them
    async fn apply(&self, state: &BackendsNewState) {
        let healthy = state.healthy.iter().map(|b| async move {
            if let Err(e) = self.api.mark_healthy_backend(&b.id).await {
                error!(backend_id = %b.id, error = %e, "Unable to mark backend healthy");
            }
        });
        let unhealthy = state.unhealthy.iter().map(|b| async move {
            if let Err(e) = self.api.mark_unhealthy_backend(&b.id).await {
                error!(backend_id = %b.id, error = %e, "Unable to mark backend unhealthy");
            }
        });
        futures::join!(join_all(healthy), join_all(unhealthy));
    }

    /// Run on the configured interval until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        outcome = self.execute() => debug!(%outcome, "Monitor run ended"),
                        _ = shutdown.changed() => {
                            info!("Shutdown requested, abandoning monitor run");
                            break;
                        }
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}

#[async_trait]
impl BackgroundService for HealthMonitor {
    async fn start(&self, shutdown: ShutdownWatch) {
        info!(interval = ?self.interval(), "Health monitor started");
        self.run(shutdown).await;
    }
}
