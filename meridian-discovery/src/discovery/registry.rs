//! Authoritative in-memory instance registry
//!
//! All instance records live behind one reader/writer lock. The lock is
//! never held across an `.await`: store calls, supervisor shutdown and
//! event publication all happen after it is released. Ids with a
//! register/deregister/expiry in progress are parked in `in_flight` so a
//! second mutation of the same id cannot interleave with the first.
//!
//! Events are published under `publish_order`, taken before the state
//! lock. A health transition is applied and published under it too, so a
//! watcher never sees a status change for an instance it has not been
//! told about, nor one after its removal.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meridian_core::Config;

use super::events::{EventBus, Watcher};
use super::instance::{EventKind, ServiceEvent, ServiceInstance, ServiceStatus};
use crate::error::{Error, Result};
use crate::health::{HealthCheckConfig, HealthSupervisor, Prober, SupervisorHandle, SupervisorReport};
use crate::store::InstanceStore;

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Instances silent for longer than this are evicted by the sweep
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub event_queue_capacity: usize,
    /// Treat a passing probe as a heartbeat
    pub probe_refreshes_heartbeat: bool,
    pub health: HealthCheckConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(config.discovery.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(config.discovery.sweep_interval_secs),
            event_queue_capacity: config.discovery.event_queue_capacity,
            probe_refreshes_heartbeat: config.discovery.probe_refreshes_heartbeat,
            health: HealthCheckConfig::from(&config.health),
        }
    }
}

struct Record {
    instance: ServiceInstance,
    /// Fencing token of this registration; supervisor reports must match it
    epoch: u64,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<String, Record>,
    /// Supervision table: one running check loop per live record
    supervisors: HashMap<String, SupervisorHandle>,
    in_flight: HashSet<String>,
    /// Per-service revision, bumped on every change that affects resolution
    revisions: HashMap<String, u64>,
    revision_seq: u64,
    /// Check loops are only spawned once the report applier runs
    running: bool,
}

impl RegistryState {
    fn bump(&mut self, service: &str) {
        self.revision_seq += 1;
        self.revisions.insert(service.to_string(), self.revision_seq);
    }

    fn is_busy(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.in_flight.contains(id)
    }
}

/// Clears an `in_flight` marker if the owning operation is abandoned
struct InFlightGuard<'a> {
    state: &'a RwLock<RegistryState>,
    id: String,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.write().in_flight.remove(&self.id);
        }
    }
}

/// Service registry
///
/// Construct with [`Registry::new`], then call [`Registry::start`] to run
/// the heartbeat sweep and apply health transitions.
pub struct Registry {
    state: RwLock<RegistryState>,
    store: Arc<dyn InstanceStore>,
    supervisor: HealthSupervisor,
    events: EventBus,
    publish_order: Mutex<()>,
    config: RegistryConfig,
    next_epoch: AtomicU64,
    reports: Mutex<Option<mpsc::UnboundedReceiver<SupervisorReport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl Registry {
    #[must_use]
    pub fn new(config: RegistryConfig, store: Arc<dyn InstanceStore>, prober: Arc<dyn Prober>) -> Arc<Self> {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let mut health = config.health.clone();
        health.report_passes = config.probe_refreshes_heartbeat;

        Arc::new(Self {
            state: RwLock::new(RegistryState::default()),
            store,
            supervisor: HealthSupervisor::new(prober, health, reports_tx),
            events: EventBus::new(config.event_queue_capacity),
            publish_order: Mutex::new(()),
            config,
            next_epoch: AtomicU64::new(1),
            reports: Mutex::new(Some(reports_rx)),
            tasks: Mutex::new(Vec::new()),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Start the heartbeat sweep and the health report applier
    ///
    /// Check loops for instances registered or loaded before this call are
    /// spawned here.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let reports = self
            .reports
            .lock()
            .take()
            .ok_or_else(|| Error::Configuration("Registry already started".to_string()))?;

        let applier = self.spawn_report_applier(reports);
        let sweeper = self.spawn_sweeper();
        self.tasks.lock().extend([applier, sweeper]);

        let supervised = {
            let _order = self.publish_order.lock();
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.running = true;
            for (id, record) in &state.records {
                if !state.supervisors.contains_key(id) {
                    let handle = self.supervisor.spawn(&record.instance, record.epoch, &self.cancel_token);
                    state.supervisors.insert(id.clone(), handle);
                }
            }
            state.supervisors.len()
        };

        info!(
            supervised,
            heartbeat_timeout = ?self.config.heartbeat_timeout,
            sweep_interval = ?self.config.sweep_interval,
            "Registry started"
        );
        Ok(())
    }

    /// Stop every background task and check loop
    pub async fn shutdown(&self) {
        info!("Registry shutting down");
        self.cancel_token.cancel();

        let supervisors: Vec<SupervisorHandle> = {
            let mut state = self.state.write();
            state.supervisors.drain().map(|(_, handle)| handle).collect()
        };
        futures::future::join_all(supervisors.into_iter().map(SupervisorHandle::stop)).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Registry background task panicked");
                }
            }
        }
    }

    /// Load persisted instances into memory
    ///
    /// Loaded instances start over as `Starting` with a fresh heartbeat and
    /// are announced as `Registered`; they are probed once the registry is
    /// started. Ids already present are left alone.
    pub async fn bootstrap(&self) -> Result<usize> {
        let stored = self.store.list().await?;
        let now = Utc::now();
        let mut loaded = Vec::new();

        let _order = self.publish_order.lock();
        {
            let mut state = self.state.write();
            for mut instance in stored {
                if instance.id.is_empty() || instance.endpoint.is_empty() {
                    warn!(instance_id = %instance.id, "Skipping malformed stored instance");
                    continue;
                }
                if state.is_busy(&instance.id) {
                    debug!(instance_id = %instance.id, "Stored instance already registered");
                    continue;
                }

                instance.status = ServiceStatus::Starting;
                instance.last_heartbeat = now;

                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                if state.running {
                    let handle = self.supervisor.spawn(&instance, epoch, &self.cancel_token);
                    state.supervisors.insert(instance.id.clone(), handle);
                }
                state.bump(&instance.name);
                state.records.insert(
                    instance.id.clone(),
                    Record {
                        instance: instance.clone(),
                        epoch,
                    },
                );
                loaded.push(instance);
            }
        }

        for instance in &loaded {
            self.events.publish(&ServiceEvent::new(EventKind::Registered, instance.clone()));
        }

        info!(count = loaded.len(), "Registry bootstrapped from store");
        Ok(loaded.len())
    }

    /// Register a new instance
    ///
    /// The record is persisted before it becomes visible; a store failure
    /// leaves the registry untouched. Returns the stored copy.
    pub async fn register(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        if instance.id.trim().is_empty() {
            return Err(Error::Invalid("instance id must not be empty".to_string()));
        }
        if instance.endpoint.trim().is_empty() {
            return Err(Error::Invalid(format!("instance {} has no endpoint", instance.id)));
        }
        if instance.name.trim().is_empty() {
            return Err(Error::Invalid(format!("instance {} has no service name", instance.id)));
        }
        if self.cancel_token.is_cancelled() {
            return Err(Error::Configuration("Registry is shut down".to_string()));
        }

        let mut guard = {
            let mut state = self.state.write();
            if state.is_busy(&instance.id) {
                return Err(Error::AlreadyExists(format!(
                    "service instance already registered: {}",
                    instance.id
                )));
            }
            state.in_flight.insert(instance.id.clone());
            InFlightGuard {
                state: &self.state,
                id: instance.id.clone(),
                armed: true,
            }
        };

        let now = Utc::now();
        instance.status = ServiceStatus::Starting;
        instance.registered_at = now;
        instance.last_heartbeat = now;

        if let Err(e) = self.store.save(&instance).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to persist instance, registration aborted");
            return Err(e);
        }

        let _order = self.publish_order.lock();
        {
            let mut state = self.state.write();
            state.in_flight.remove(&instance.id);
            guard.disarm();

            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
            // Spawn under the lock so the loop's first report finds the record
            if state.running {
                let handle = self.supervisor.spawn(&instance, epoch, &self.cancel_token);
                state.supervisors.insert(instance.id.clone(), handle);
            }
            state.bump(&instance.name);
            state.records.insert(
                instance.id.clone(),
                Record {
                    instance: instance.clone(),
                    epoch,
                },
            );
        }

        info!(
            instance_id = %instance.id,
            service = %instance.name,
            endpoint = %instance.endpoint,
            "Instance registered"
        );
        self.events.publish(&ServiceEvent::new(EventKind::Registered, instance.clone()));

        Ok(instance)
    }

    /// Remove an instance
    ///
    /// Does not return before the instance's check loop has exited. A failed
    /// store delete is logged; the in-memory removal still happens.
    pub async fn deregister(&self, id: &str) -> Result<ServiceInstance> {
        let (mut guard, handle) = {
            let mut state = self.state.write();
            if !state.records.contains_key(id) || state.in_flight.contains(id) {
                return Err(Error::NotFound(format!("service instance not found: {id}")));
            }
            state.in_flight.insert(id.to_string());
            let guard = InFlightGuard {
                state: &self.state,
                id: id.to_string(),
                armed: true,
            };
            (guard, state.supervisors.remove(id))
        };

        if let Some(handle) = handle {
            handle.stop().await;
        }

        if let Err(e) = self.store.delete(id).await {
            warn!(instance_id = %id, error = %e, "Failed to delete instance from store");
        }

        let _order = self.publish_order.lock();
        let record = {
            let mut state = self.state.write();
            state.in_flight.remove(id);
            guard.disarm();
            let record = state.records.remove(id);
            if let Some(record) = &record {
                state.bump(&record.instance.name);
            }
            record
        };

        let Some(record) = record else {
            return Err(Error::NotFound(format!("service instance not found: {id}")));
        };

        info!(instance_id = %id, service = %record.instance.name, "Instance deregistered");
        self.events.publish(&ServiceEvent::new(EventKind::Deregistered, record.instance.clone()));

        Ok(record.instance)
    }

    /// Refresh an instance's heartbeat. Never changes its status.
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("service instance not found: {id}")))?;
        record.instance.touch(Utc::now());
        Ok(())
    }

    /// Snapshot of a service's instances, sorted by id
    ///
    /// `Down` instances are left out unless `include_down` is set.
    #[must_use]
    pub fn list(&self, name: &str, include_down: bool) -> Vec<ServiceInstance> {
        let mut instances: Vec<ServiceInstance> = {
            let state = self.state.read();
            state
                .records
                .values()
                .map(|r| &r.instance)
                .filter(|i| i.name == name && (include_down || i.status != ServiceStatus::Down))
                .cloned()
                .collect()
        };
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceInstance> {
        self.state.read().records.get(id).map(|r| r.instance.clone())
    }

    /// Distinct service names with at least one instance, sorted
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = {
            let state = self.state.read();
            state.records.values().map(|r| r.instance.name.clone()).collect()
        };
        names.sort();
        names.dedup();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current revision of a service; changes whenever its resolvable set may have
    #[must_use]
    pub fn revision(&self, name: &str) -> u64 {
        self.state.read().revisions.get(name).copied().unwrap_or(0)
    }

    /// Subscribe to registry events, optionally for a single service
    pub fn watch(&self, service: Option<&str>) -> Watcher {
        self.events.subscribe(service.map(str::to_string))
    }

    /// Events dropped because a watcher's queue was full
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Evict every instance whose heartbeat is older than the timeout,
    /// whatever its probe status. Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout;

        let expired: Vec<(ServiceInstance, Option<SupervisorHandle>)> = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let ids: Vec<String> = state
                .records
                .iter()
                .filter(|(id, r)| !state.in_flight.contains(*id) && r.instance.is_stale(timeout, now))
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(record) = state.records.remove(&id) else { continue };
                let handle = state.supervisors.remove(&id);
                state.bump(&record.instance.name);
                state.in_flight.insert(id);
                expired.push((record.instance, handle));
            }
            expired
        };

        if expired.is_empty() {
            return 0;
        }

        let (instances, handles): (Vec<_>, Vec<_>) = expired.into_iter().unzip();
        futures::future::join_all(handles.into_iter().flatten().map(SupervisorHandle::stop)).await;

        for instance in &instances {
            if let Err(e) = self.store.delete(&instance.id).await {
                warn!(instance_id = %instance.id, error = %e, "Failed to delete expired instance from store");
            }
            let _order = self.publish_order.lock();
            self.state.write().in_flight.remove(&instance.id);

            info!(
                instance_id = %instance.id,
                service = %instance.name,
                last_heartbeat = %instance.last_heartbeat,
                "Instance expired: heartbeat timeout"
            );
            self.events.publish(&ServiceEvent::new(EventKind::Expired, instance.clone()));
        }

        instances.len()
    }

    /// Apply one message from a check loop
    fn apply_report(&self, report: SupervisorReport) {
        match report {
            SupervisorReport::Transition {
                instance_id,
                epoch,
                to,
                result,
                ..
            } => {
                let _order = self.publish_order.lock();
                let event = {
                    let mut state = self.state.write();
                    if state.in_flight.contains(&instance_id) {
                        return;
                    }
                    let Some(record) = state.records.get_mut(&instance_id) else {
                        debug!(instance_id = %instance_id, "Dropping report for unknown instance");
                        return;
                    };
                    if record.epoch != epoch {
                        debug!(
                            instance_id = %instance_id,
                            report_epoch = epoch,
                            live_epoch = record.epoch,
                            "Dropping report from a previous registration"
                        );
                        return;
                    }
                    if record.instance.status == to {
                        return;
                    }

                    let previous = record.instance.status;
                    record.instance.status = to;
                    if self.config.probe_refreshes_heartbeat && to == ServiceStatus::Up {
                        record.instance.touch(result.observed_at);
                    }
                    let snapshot = record.instance.clone();
                    state.bump(&snapshot.name);
                    ServiceEvent::status_changed(snapshot, previous)
                };

                info!(
                    instance_id = %event.instance.id,
                    service = %event.instance.name,
                    from = ?event.previous_status,
                    to = %event.instance.status,
                    "Instance status changed"
                );
                self.events.publish(&event);
            }
            SupervisorReport::Passed {
                instance_id,
                epoch,
                observed_at,
            } => {
                let mut state = self.state.write();
                if let Some(record) = state.records.get_mut(&instance_id) {
                    if record.epoch == epoch {
                        record.instance.touch(observed_at);
                    }
                }
            }
        }
    }

    fn spawn_report_applier(
        self: &Arc<Self>,
        mut reports: mpsc::UnboundedReceiver<SupervisorReport>,
    ) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                let report = tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => break,
                    report = reports.recv() => match report {
                        Some(report) => report,
                        None => break,
                    },
                };
                let Some(registry) = registry.upgrade() else { break };
                registry.apply_report(report);
            }
            debug!("Health report applier stopped");
        })
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let cancel_token = self.cancel_token.clone();
        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else { break };
                let expired = registry.sweep().await;
                if expired > 0 {
                    debug!(expired, "Heartbeat sweep finished");
                }
            }
            debug!("Heartbeat sweep stopped");
        })
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
