//! Dispatch Metrics
//!
//! Observability for the dispatch layer including:
//! - Per-server call outcomes and latency distributions
//! - Per-server in-flight counters (used for load-aware routing and backpressure)
//! - Recent success rate per server
//! - Global invocation, cache and failover counters
//!
//! Everything here is lock-free on the hot path except the short per-server
//! outcome window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Outcomes kept per server for the recent success rate
const RECENT_OUTCOME_WINDOW: usize = 50;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Total count
    total_count: AtomicU64,
    /// Sum of all values
    sum: AtomicU64,
    /// Minimum value seen
    min: AtomicU64,
    /// Maximum value seen
    max: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Create with default latency buckets (in milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![
            5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));

        if let Some(count) = self.counts.get(bucket_idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);

        // min/max are best effort under contention
        let value_u64 = value as u64;
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max,
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Get percentile value (bucket upper bound)
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        *self.buckets.last().unwrap_or(&0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p90(&self) -> f64 {
        self.percentile(0.9)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Server Metrics
// ============================================================================

/// Outcome of a single call attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Call returned a value
    Success,
    /// Call failed
    Failure,
    /// Call was cancelled by its deadline
    Timeout,
}

/// Metrics for a single server
#[derive(Debug)]
pub struct ServerMetrics {
    /// Server ID
    pub server_id: String,
    /// Total attempts
    pub requests: Counter,
    /// Successful attempts
    pub successes: Counter,
    /// Failed attempts (timeouts included)
    pub failures: Counter,
    /// Attempts cancelled by timeout
    pub timeouts: Counter,
    /// Attempt latency histogram
    pub latency: Histogram,
    /// Calls currently executing
    in_flight: AtomicU64,
    /// Most recent outcomes, newest at the back
    recent: Mutex<VecDeque<bool>>,
}

impl ServerMetrics {
    pub fn new(server_id: String) -> Self {
        Self {
            server_id,
            requests: Counter::new(),
            successes: Counter::new(),
            failures: Counter::new(),
            timeouts: Counter::new(),
            latency: Histogram::latency_default(),
            in_flight: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_OUTCOME_WINDOW)),
        }
    }

    /// Calls currently executing
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Success ratio over the recent window, 1.0 with no history
    pub fn recent_success_rate(&self) -> f64 {
        let recent = self.recent.lock();
        if recent.is_empty() {
            return 1.0;
        }
        recent.iter().filter(|ok| **ok).count() as f64 / recent.len() as f64
    }

    /// Get error rate over the lifetime of the process
    pub fn error_rate(&self) -> f64 {
        let total = self.requests.get();
        if total == 0 {
            return 0.0;
        }
        self.failures.get() as f64 / total as f64
    }

    fn record(&self, latency_ms: u64, outcome: AttemptOutcome) {
        self.requests.inc();
        self.latency.record(latency_ms as f64);
        let ok = outcome == AttemptOutcome::Success;
        match outcome {
            AttemptOutcome::Success => self.successes.inc(),
            AttemptOutcome::Failure => self.failures.inc(),
            AttemptOutcome::Timeout => {
                self.failures.inc();
                self.timeouts.inc();
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_OUTCOME_WINDOW {
            recent.pop_front();
        }
        recent.push_back(ok);
    }

    /// Get summary
    pub fn summary(&self) -> ServerMetricsSummary {
        let latency = self.latency.snapshot();

        ServerMetricsSummary {
            server_id: self.server_id.clone(),
            total_requests: self.requests.get(),
            successful_requests: self.successes.get(),
            failed_requests: self.failures.get(),
            timeout_requests: self.timeouts.get(),
            error_rate: self.error_rate(),
            recent_success_rate: self.recent_success_rate(),
            in_flight: self.in_flight(),
            latency_p50_ms: latency.p50(),
            latency_p90_ms: latency.p90(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
        }
    }
}

/// Summary of server metrics
#[derive(Clone, Debug, Serialize)]
pub struct ServerMetricsSummary {
    pub server_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub error_rate: f64,
    pub recent_success_rate: f64,
    pub in_flight: u64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_mean_ms: f64,
}

// ============================================================================
// In-Flight Slot
// ============================================================================

/// A reserved concurrency slot on a server; released on drop
#[derive(Debug)]
pub struct InFlightGuard {
    metrics: Arc<ServerMetrics>,
}

impl InFlightGuard {
    /// Server this slot belongs to
    pub fn server_id(&self) -> &str {
        &self.metrics.server_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Metrics Aggregator
// ============================================================================

/// Centralized metrics for the dispatch layer
pub struct MetricsAggregator {
    /// Per-server metrics
    servers: DashMap<String, Arc<ServerMetrics>>,

    /// Global counters
    pub total_invocations: Counter,
    pub total_successes: Counter,
    pub total_failures: Counter,
    pub total_cache_hits: Counter,
    pub total_failovers: Counter,
    pub total_stale_served: Counter,
    pub total_no_server: Counter,

    /// End-to-end invoke latency (cache hits included)
    pub invoke_latency: Histogram,

    /// When metrics collection started
    started_at: Instant,
}

impl MetricsAggregator {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            total_invocations: Counter::new(),
            total_successes: Counter::new(),
            total_failures: Counter::new(),
            total_cache_hits: Counter::new(),
            total_failovers: Counter::new(),
            total_stale_served: Counter::new(),
            total_no_server: Counter::new(),
            invoke_latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    /// Get or create metrics for a server
    pub fn server_metrics(&self, server_id: &str) -> Arc<ServerMetrics> {
        if let Some(metrics) = self.servers.get(server_id) {
            return metrics.clone();
        }
        self.servers
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(ServerMetrics::new(server_id.to_string())))
            .clone()
    }

    /// Reserve an in-flight slot unless the server is at `max_concurrency`
    pub fn try_acquire_slot(&self, server_id: &str, max_concurrency: u32) -> Option<InFlightGuard> {
        let metrics = self.server_metrics(server_id);
        let limit = u64::from(max_concurrency);

        let mut current = metrics.in_flight.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match metrics.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(InFlightGuard { metrics }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Calls currently executing on a server
    pub fn in_flight(&self, server_id: &str) -> u64 {
        self.servers.get(server_id).map_or(0, |m| m.in_flight())
    }

    /// Recent success rate of a server, 1.0 with no history
    pub fn success_rate(&self, server_id: &str) -> f64 {
        self.servers
            .get(server_id)
            .map_or(1.0, |m| m.recent_success_rate())
    }

    /// Record one call attempt against a server
    pub fn record_attempt(&self, server_id: &str, latency: Duration, outcome: AttemptOutcome) {
        self.server_metrics(server_id)
            .record(latency.as_millis() as u64, outcome);
    }

    /// Record a finished invocation
    pub fn record_invocation(&self, latency: Duration, success: bool) {
        self.total_invocations.inc();
        self.invoke_latency.record(latency.as_millis() as f64);
        if success {
            self.total_successes.inc();
        } else {
            self.total_failures.inc();
        }
    }

    /// Record an invocation answered from cache
    pub fn record_cache_hit(&self) {
        self.total_cache_hits.inc();
    }

    /// Record a failover between candidates
    pub fn record_failover(&self, from_server: &str, to_server: &str) {
        self.total_failovers.inc();
        tracing::debug!(
            from = from_server,
            to = to_server,
            "Request failed over to next candidate"
        );
    }

    /// Record a stale cache value served after live failures
    pub fn record_stale_served(&self) {
        self.total_stale_served.inc();
    }

    /// Record an invocation with no routable server
    pub fn record_no_server(&self) {
        self.total_no_server.inc();
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Get all server summaries, ordered by id
    pub fn all_server_summaries(&self) -> Vec<ServerMetricsSummary> {
        let mut summaries: Vec<ServerMetricsSummary> =
            self.servers.iter().map(|m| m.summary()).collect();
        summaries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        summaries
    }

    /// Global performance summary
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let latency = self.invoke_latency.snapshot();

        PerformanceMetrics {
            uptime_seconds: self.uptime().as_secs(),
            total_invocations: self.total_invocations.get(),
            successful_invocations: self.total_successes.get(),
            failed_invocations: self.total_failures.get(),
            cache_hits: self.total_cache_hits.get(),
            failovers: self.total_failovers.get(),
            stale_served: self.total_stale_served.get(),
            no_server_rejections: self.total_no_server.get(),
            invoke_p50_ms: latency.p50(),
            invoke_p90_ms: latency.p90(),
            invoke_p99_ms: latency.p99(),
            servers: self.all_server_summaries(),
        }
    }

    /// Export as Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "# HELP relay_invocations_total Invocations received\n\
             # TYPE relay_invocations_total counter\n\
             relay_invocations_total {}\n\n",
            self.total_invocations.get()
        ));

        output.push_str(&format!(
            "# HELP relay_invocation_failures_total Invocations that surfaced an error\n\
             # TYPE relay_invocation_failures_total counter\n\
             relay_invocation_failures_total {}\n\n",
            self.total_failures.get()
        ));

        output.push_str(&format!(
            "# HELP relay_cache_hits_total Invocations answered from cache\n\
             # TYPE relay_cache_hits_total counter\n\
             relay_cache_hits_total {}\n\n",
            self.total_cache_hits.get()
        ));

        output.push_str(&format!(
            "# HELP relay_failovers_total Candidate failovers\n\
             # TYPE relay_failovers_total counter\n\
             relay_failovers_total {}\n\n",
            self.total_failovers.get()
        ));

        let summaries = self.all_server_summaries();
        if !summaries.is_empty() {
            output.push_str(
                "# HELP relay_server_requests_total Attempts per server\n\
                 # TYPE relay_server_requests_total counter\n",
            );
            for summary in &summaries {
                output.push_str(&format!(
                    "relay_server_requests_total{{server=\"{}\"}} {}\n",
                    summary.server_id, summary.total_requests
                ));
            }
            output.push('\n');

            output.push_str(
                "# HELP relay_server_in_flight Calls currently executing per server\n\
                 # TYPE relay_server_in_flight gauge\n",
            );
            for summary in &summaries {
                output.push_str(&format!(
                    "relay_server_in_flight{{server=\"{}\"}} {}\n",
                    summary.server_id, summary.in_flight
                ));
            }
            output.push('\n');

            for summary in &summaries {
                output.push_str(&format!(
                    "relay_server_errors_total{{server=\"{}\"}} {}\n",
                    summary.server_id, summary.failed_requests
                ));
                output.push_str(&format!(
                    "relay_server_latency_p99_ms{{server=\"{}\"}} {}\n",
                    summary.server_id, summary.latency_p99_ms
                ));
            }
        }

        output
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("servers", &self.servers.len())
            .field("total_invocations", &self.total_invocations.get())
            .finish()
    }
}

/// Global metrics summary
#[derive(Clone, Debug, Serialize)]
pub struct PerformanceMetrics {
    pub uptime_seconds: u64,
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub cache_hits: u64,
    pub failovers: u64,
    pub stale_served: u64,
    pub no_server_rejections: u64,
    pub invoke_p50_ms: f64,
    pub invoke_p90_ms: f64,
    pub invoke_p99_ms: f64,
    pub servers: Vec<ServerMetricsSummary>,
}
