//! Server Health Monitoring
//!
//! Tracks a health state per registered server and keeps it current with
//! two independent inputs:
//!
//! - **Probes**: one periodic, jittered task per enabled server calls the
//!   adapter's `health_check()`. Probes of one server are serialized by a
//!   per-server mutex; probes of different servers run in parallel, bounded
//!   by a global semaphore.
//! - **Live calls**: the dispatcher reports every attempt outcome so
//!   repeated live failures demote a server before its next probe.
//!
//! # State Machine
//!
//! ```text
//!                success                      failure
//! +---------+ ------------> +---------+ -----------------> +----------+
//! | Unknown |               | Healthy |                    | Degraded |
//! +---------+ ------------> +---------+ <----------------- +----------+
//!               failure          ^          success             |
//!             (Degraded)         |                              | 3 consecutive
//!                                |          success             v failures
//!                                +------------------------ +-----------+
//!                                                          | Unhealthy |
//!                                                          +-----------+
//! ```
//!
//! A success above the optional latency threshold lands in `Degraded`
//! instead of `Healthy`.
//!
//! # Precedence
//!
//! Probes and live calls can finish out of order. Every observation is
//! stamped when its operation *starts*; an observation whose stamp is older
//! than the last one applied to that server is dropped. The most recently
//! started operation always wins, whichever source it came from.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adapter::AdapterSet;
use crate::clock::SharedClock;
use crate::registry::{RegistryEvent, ServerRegistry};

// ============================================================================
// Health State
// ============================================================================

/// Health state of a server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No observation yet
    #[default]
    Unknown,

    /// Answering normally
    Healthy,

    /// Answering, but recently failed or slow
    Degraded,

    /// Repeatedly failing; excluded from routing
    Unhealthy,
}

impl HealthState {
    /// Whether the router may send regular traffic
    #[must_use]
    pub fn is_routable(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for health monitoring
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Time between scheduled probes of one server
    pub check_interval: Duration,

    /// Random phase offset per server, as a fraction of `check_interval`
    pub jitter_factor: f64,

    /// Consecutive failures before a server is marked unhealthy
    pub failure_threshold: u32,

    /// Samples in the latency moving average window
    pub latency_window: u32,

    /// Successful observations slower than this count as degraded
    pub degraded_latency_ms: Option<f64>,

    /// Probes allowed in flight across all servers
    pub max_concurrent_probes: usize,

    /// Override for the category probe timeout
    pub probe_timeout: Option<Duration>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            jitter_factor: 0.1,
            failure_threshold: 3,
            latency_window: 20,
            degraded_latency_ms: None,
            max_concurrent_probes: 8,
            probe_timeout: None,
        }
    }
}

impl HealthConfig {
    /// EMA smoothing factor for an N-sample window
    fn ema_alpha(&self) -> f64 {
        2.0 / (f64::from(self.latency_window.max(1)) + 1.0)
    }
}

// ============================================================================
// Health Status
// ============================================================================

/// Snapshot of one server's health
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthStatus {
    pub server_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub average_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    /// Instant of the most recent failure, for least-recently-failed ordering
    #[serde(skip)]
    pub last_failure: Option<Instant>,
}

impl HealthStatus {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            state: HealthState::Unknown,
            consecutive_failures: 0,
            last_checked_at: None,
            average_latency_ms: None,
            last_error: None,
            last_failure: None,
        }
    }
}

/// Counts across all enabled servers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SystemHealth {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub total_servers: usize,
}

impl SystemHealth {
    /// Servers the router can currently use
    pub fn routable(&self) -> usize {
        self.total_servers - self.unhealthy
    }
}

// ============================================================================
// Observations
// ============================================================================

/// Orders observations by the start of the operation that produced them
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObservationStamp {
    started_at: Instant,
    seq: u64,
}

/// Result of a probe or live call
#[derive(Clone, Debug)]
pub enum Observation {
    Success { latency: Duration },
    Failure { error: String },
}

/// Where an observation came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationSource {
    Probe,
    Live,
}

impl ObservationSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Live => "live",
        }
    }
}

// ============================================================================
// Per-Server Health
// ============================================================================

struct ServerHealth {
    record: RwLock<HealthRecord>,
    /// Held for the whole duration of a probe
    probe_lock: tokio::sync::Mutex<()>,
}

struct HealthRecord {
    status: HealthStatus,
    last_applied: Option<ObservationStamp>,
}

enum Applied {
    Stale,
    Unchanged,
    Transition { from: HealthState, to: HealthState },
}

impl ServerHealth {
    fn new(server_id: &str) -> Self {
        Self {
            record: RwLock::new(HealthRecord {
                status: HealthStatus::new(server_id),
                last_applied: None,
            }),
            probe_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn snapshot(&self) -> HealthStatus {
        self.record.read().status.clone()
    }

    fn apply(
        &self,
        stamp: ObservationStamp,
        observation: &Observation,
        config: &HealthConfig,
        now: Instant,
    ) -> Applied {
        let mut record = self.record.write();
        if record.last_applied.is_some_and(|last| stamp < last) {
            return Applied::Stale;
        }
        record.last_applied = Some(stamp);

        let status = &mut record.status;
        let from = status.state;
        status.last_checked_at = Some(Utc::now());

        match observation {
            Observation::Success { latency } => {
                let sample = latency.as_secs_f64() * 1000.0;
                let average = match status.average_latency_ms {
                    Some(avg) => {
                        let alpha = config.ema_alpha();
                        alpha * sample + (1.0 - alpha) * avg
                    }
                    None => sample,
                };
                status.average_latency_ms = Some(average);
                status.consecutive_failures = 0;
                status.last_error = None;

                let slow = config
                    .degraded_latency_ms
                    .is_some_and(|threshold| average > threshold);
                status.state = if slow {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                };
            }
            Observation::Failure { error } => {
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.last_error = Some(error.clone());
                status.last_failure = Some(now);

                status.state = if status.consecutive_failures >= config.failure_threshold {
                    HealthState::Unhealthy
                } else {
                    match from {
                        HealthState::Unknown | HealthState::Healthy => HealthState::Degraded,
                        other => other,
                    }
                };
            }
        }

        if status.state == from {
            Applied::Unchanged
        } else {
            Applied::Transition {
                from,
                to: status.state,
            }
        }
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Probes servers and owns their health state
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    adapters: Arc<AdapterSet>,
    clock: SharedClock,
    config: HealthConfig,

    servers: DashMap<String, Arc<ServerHealth>>,
    probe_permits: Semaphore,

    /// Scheduled probe task per server
    tasks: DashMap<String, JoinHandle<()>>,
    listener: Mutex<Option<JoinHandle<()>>>,

    /// Bumped on every state transition
    generation: AtomicU64,
    seq: AtomicU64,
    shutdown: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        adapters: Arc<AdapterSet>,
        clock: SharedClock,
        config: HealthConfig,
    ) -> Self {
        let permits = config.max_concurrent_probes.max(1);
        Self {
            registry,
            adapters,
            clock,
            config,
            servers: DashMap::new(),
            probe_permits: Semaphore::new(permits),
            tasks: DashMap::new(),
            listener: Mutex::new(None),
            generation: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Counter bumped whenever any server changes state
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn entry(&self, server_id: &str) -> Arc<ServerHealth> {
        if let Some(health) = self.servers.get(server_id) {
            return health.clone();
        }
        self.servers
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(ServerHealth::new(server_id)))
            .clone()
    }

    /// Stamp taken when an operation starts
    pub fn stamp(&self) -> ObservationStamp {
        ObservationStamp {
            started_at: self.clock.now(),
            seq: self.seq.fetch_add(1, Ordering::AcqRel),
        }
    }

    fn observe(
        &self,
        server_id: &str,
        stamp: ObservationStamp,
        observation: &Observation,
        source: ObservationSource,
    ) -> bool {
        let health = self.entry(server_id);
        match health.apply(stamp, observation, &self.config, self.clock.now()) {
            Applied::Stale => {
                tracing::trace!(
                    server = %server_id,
                    source = source.as_str(),
                    "Discarded stale health observation"
                );
                false
            }
            Applied::Unchanged => true,
            Applied::Transition { from, to } => {
                self.generation.fetch_add(1, Ordering::AcqRel);
                let status = health.snapshot();
                match to {
                    HealthState::Healthy => tracing::info!(
                        server = %server_id,
                        source = source.as_str(),
                        from = %from,
                        "Server healthy"
                    ),
                    _ => tracing::warn!(
                        server = %server_id,
                        source = source.as_str(),
                        from = %from,
                        to = %to,
                        consecutive_failures = status.consecutive_failures,
                        error = status.last_error.as_deref().unwrap_or(""),
                        "Server health changed"
                    ),
                }
                true
            }
        }
    }

    /// Fast-path signal from a live call
    ///
    /// Returns false when a newer observation already superseded this one.
    pub fn report_live(
        &self,
        server_id: &str,
        stamp: ObservationStamp,
        observation: Observation,
    ) -> bool {
        self.observe(server_id, stamp, &observation, ObservationSource::Live)
    }

    /// Run a probe now and return the resulting status
    ///
    /// Waits for any probe already running against the same server. Returns
    /// `None` for unknown servers.
    pub async fn force_check(&self, server_id: &str) -> Option<HealthStatus> {
        let descriptor = self.registry.get(server_id)?;
        let Some(adapter) = self.adapters.get(server_id) else {
            tracing::debug!(server = %server_id, "No adapter, skipping probe");
            return Some(self.entry(server_id).snapshot());
        };

        let health = self.entry(server_id);
        let _probe = health.probe_lock.lock().await;
        let Ok(_permit) = self.probe_permits.acquire().await else {
            return Some(health.snapshot());
        };

        let stamp = self.stamp();
        let timeout = self
            .config
            .probe_timeout
            .unwrap_or_else(|| descriptor.category.probe_timeout());
        let started = self.clock.now();

        let observation = match tokio::time::timeout(timeout, adapter.health_check()).await {
            Ok(Ok(())) => Observation::Success {
                latency: self.clock.now().saturating_duration_since(started),
            },
            Ok(Err(e)) => Observation::Failure {
                error: e.to_string(),
            },
            Err(_) => Observation::Failure {
                error: format!("Health check timed out after {}ms", timeout.as_millis()),
            },
        };

        self.observe(server_id, stamp, &observation, ObservationSource::Probe);
        Some(health.snapshot())
    }

    /// Current status of one server
    pub fn get_health(&self, server_id: &str) -> Option<HealthStatus> {
        if let Some(health) = self.servers.get(server_id) {
            return Some(health.snapshot());
        }
        self.registry
            .get(server_id)
            .map(|_| HealthStatus::new(server_id))
    }

    /// Current state of one server, `Unknown` if never observed
    pub fn state(&self, server_id: &str) -> HealthState {
        self.servers
            .get(server_id)
            .map_or(HealthState::Unknown, |h| h.record.read().status.state)
    }

    /// Status of every enabled server, ordered by id
    pub fn get_all_health(&self) -> Vec<HealthStatus> {
        self.registry
            .list_enabled()
            .iter()
            .map(|d| {
                self.servers
                    .get(&d.id)
                    .map_or_else(|| HealthStatus::new(&d.id), |h| h.snapshot())
            })
            .collect()
    }

    /// Aggregate counts across enabled servers
    pub fn get_system_health(&self) -> SystemHealth {
        let mut summary = SystemHealth::default();
        for status in self.get_all_health() {
            summary.total_servers += 1;
            match status.state {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Schedule probes for every enabled server and follow registry changes
    ///
    /// Each server gets an immediate cold-start probe.
    pub fn start(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        self.spawn_registry_listener();
        for descriptor in self.registry.list_enabled() {
            self.spawn_probe_task(descriptor.id);
        }

        tracing::info!(
            servers = self.tasks.len(),
            interval_secs = self.config.check_interval.as_secs(),
            "Health monitor started"
        );
    }

    /// Number of servers with a scheduled probe task
    pub fn scheduled_count(&self) -> usize {
        self.tasks.len()
    }

    fn spawn_probe_task(self: &Arc<Self>, server_id: String) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.entry(&server_id);

        let period = self.config.check_interval.max(Duration::from_millis(1));
        let max_offset = period.as_secs_f64() * self.config.jitter_factor.max(0.0);
        let offset = if max_offset > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=max_offset))
        } else {
            Duration::ZERO
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let id = server_id.clone();
        let handle = tokio::spawn(async move {
            // Cold start
            match weak.upgrade() {
                Some(monitor) => {
                    monitor.force_check(&id).await;
                }
                None => return,
            }

            let first = tokio::time::Instant::now() + period + offset;
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                if monitor.shutdown.load(Ordering::Acquire) {
                    break;
                }
                monitor.force_check(&id).await;
            }
        });

        if let Some(previous) = self.tasks.insert(server_id, handle) {
            previous.abort();
        }
    }

    fn stop_probing(&self, server_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(server_id) {
            handle.abort();
            tracing::debug!(server = %server_id, "Stopped health probes");
        }
    }

    fn spawn_registry_listener(self: &Arc<Self>) {
        let mut events = self.registry.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(monitor) = weak.upgrade() else { break };
                match event {
                    Ok(event) => monitor.handle_registry_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Registry events lagged, resynchronizing probes");
                        monitor.resync();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    fn handle_registry_event(self: &Arc<Self>, event: &RegistryEvent) {
        match event {
            RegistryEvent::Added(id) | RegistryEvent::Changed(id) => {
                match self.registry.get(id) {
                    Some(descriptor) if descriptor.enabled => self.spawn_probe_task(id.clone()),
                    _ => self.stop_probing(id),
                }
            }
            RegistryEvent::Removed(id) => self.stop_probing(id),
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn resync(self: &Arc<Self>) {
        let enabled: Vec<String> = self
            .registry
            .list_enabled()
            .into_iter()
            .map(|d| d.id)
            .collect();

        let stale: Vec<String> = self
            .tasks
            .iter()
            .map(|t| t.key().clone())
            .filter(|id| !enabled.contains(id))
            .collect();
        for id in stale {
            self.stop_probing(&id);
        }

        for id in enabled {
            if !self.tasks.contains_key(&id) {
                self.spawn_probe_task(id);
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Cancel every scheduled probe and stop following the registry
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.probe_permits.close();

        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let ids: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for id in ids {
            self.stop_probing(&id);
        }

        tracing::info!("Health monitor stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("servers", &self.servers.len())
            .field("scheduled", &self.tasks.len())
            .field("generation", &self.generation())
            .finish()
    }
}
