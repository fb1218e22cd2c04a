//! Per-instance health check loops
//!
//! Each registered instance gets its own cancellable task. The task owns
//! its consecutive success/failure counters and the status it last
//! reported; transitions are sent to the registry as messages, the task
//! never touches registry state directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meridian_core::HealthConfig;

use super::prober::{HealthResult, Prober};
use crate::discovery::{ServiceInstance, ServiceStatus};
use crate::error::Error;

/// Tunables for the per-instance check loop
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    /// Budget for a single probe; exceeding it counts as a failure
    pub timeout: Duration,
    /// Consecutive passes needed to come Up (from Starting or Down)
    pub success_threshold: u32,
    /// Consecutive failures needed to go Down
    pub failure_threshold: u32,
    /// Also report every passing probe, not only transitions
    pub report_passes: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthCheckConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.probe_interval_ms),
            timeout: Duration::from_millis(config.probe_timeout_ms),
            success_threshold: config.success_threshold.max(1),
            failure_threshold: config.failure_threshold.max(1),
            report_passes: false,
        }
    }
}

/// Message from a check loop to the registry
#[derive(Debug, Clone)]
pub enum SupervisorReport {
    /// The instance crossed a threshold
    Transition {
        instance_id: String,
        epoch: u64,
        from: ServiceStatus,
        to: ServiceStatus,
        result: HealthResult,
    },
    /// A probe passed (only sent when `report_passes` is set)
    Passed {
        instance_id: String,
        epoch: u64,
        observed_at: DateTime<Utc>,
    },
}

/// Consecutive outcome counters. A pass resets failures and vice versa.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeCounters {
    pub successes: u32,
    pub failures: u32,
}

impl ProbeCounters {
    pub(crate) fn record(&mut self, passed: bool) {
        if passed {
            self.failures = 0;
            self.successes = self.successes.saturating_add(1);
        } else {
            self.successes = 0;
            self.failures = self.failures.saturating_add(1);
        }
    }
}

/// Status the instance should move to, if any
pub(crate) fn next_status(
    current: ServiceStatus,
    counters: ProbeCounters,
    config: &HealthCheckConfig,
) -> Option<ServiceStatus> {
    let up = counters.successes >= config.success_threshold;
    let down = counters.failures >= config.failure_threshold;

    match current {
        ServiceStatus::Starting if up => Some(ServiceStatus::Up),
        ServiceStatus::Starting if down => Some(ServiceStatus::Down),
        ServiceStatus::Up if down => Some(ServiceStatus::Down),
        ServiceStatus::Down if up => Some(ServiceStatus::Up),
        _ => None,
    }
}

/// Spawns and owns the configuration of check loops
pub struct HealthSupervisor {
    prober: Arc<dyn Prober>,
    config: HealthCheckConfig,
    reports: mpsc::UnboundedSender<SupervisorReport>,
}

impl HealthSupervisor {
    #[must_use]
    pub fn new(
        prober: Arc<dyn Prober>,
        config: HealthCheckConfig,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> Self {
        Self {
            prober,
            config,
            reports,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start the check loop for one registration of an instance
    ///
    /// `epoch` identifies this registration; reports carry it so the
    /// registry can discard those that outlive it.
    pub fn spawn(
        &self,
        instance: &ServiceInstance,
        epoch: u64,
        parent: &CancellationToken,
    ) -> SupervisorHandle {
        let cancel = parent.child_token();
        let check = CheckLoop {
            instance_id: instance.id.clone(),
            endpoint: instance.endpoint.clone(),
            epoch,
            status: instance.status,
            counters: ProbeCounters::default(),
            prober: self.prober.clone(),
            config: self.config.clone(),
            reports: self.reports.clone(),
        };

        let task = tokio::spawn(check.run(cancel.clone()));
        SupervisorHandle { cancel, task }
    }
}

/// Owned handle to a running check loop
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Cancel the loop and wait until it has exited
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "Health check loop panicked");
            }
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct CheckLoop {
    instance_id: String,
    endpoint: String,
    epoch: u64,
    status: ServiceStatus,
    counters: ProbeCounters,
    prober: Arc<dyn Prober>,
    config: HealthCheckConfig,
    reports: mpsc::UnboundedSender<SupervisorReport>,
}

impl CheckLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(instance_id = %self.instance_id, prober = self.prober.name(), "Health check loop started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.probe_once() => result,
            };

            if !self.observe(result) {
                // Registry is gone
                break;
            }
        }

        debug!(instance_id = %self.instance_id, "Health check loop stopped");
    }

    async fn probe_once(&self) -> HealthResult {
        let budget = self.config.timeout;
        match tokio::time::timeout(budget, self.prober.probe(&self.endpoint, budget)).await {
            Ok(result) => result,
            Err(_) => HealthResult::fail(Error::Probe(format!("probe timed out after {budget:?}"))),
        }
    }

    /// Feed one outcome through the state machine. Returns false once the
    /// report channel is closed.
    fn observe(&mut self, result: HealthResult) -> bool {
        let passed = result.is_pass();
        self.counters.record(passed);

        if !passed {
            debug!(
                instance_id = %self.instance_id,
                consecutive_failures = self.counters.failures,
                error = result.error.as_deref().unwrap_or_default(),
                "Probe failed"
            );
        }

        if passed && self.config.report_passes {
            let report = SupervisorReport::Passed {
                instance_id: self.instance_id.clone(),
                epoch: self.epoch,
                observed_at: result.observed_at,
            };
            if self.reports.send(report).is_err() {
                return false;
            }
        }

        let Some(next) = next_status(self.status, self.counters, &self.config) else {
            return true;
        };

        match next {
            ServiceStatus::Down => warn!(
                instance_id = %self.instance_id,
                from = %self.status,
                consecutive_failures = self.counters.failures,
                error = result.error.as_deref().unwrap_or_default(),
                "Instance is down (probe)"
            ),
            _ => info!(
                instance_id = %self.instance_id,
                from = %self.status,
                to = %next,
                "Instance is up (probe)"
            ),
        }

        let report = SupervisorReport::Transition {
            instance_id: self.instance_id.clone(),
            epoch: self.epoch,
            from: self.status,
            to: next,
            result,
        };
        self.status = next;
        self.reports.send(report).is_ok()
    }
}
