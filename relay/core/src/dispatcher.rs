//! Client Dispatcher
//!
//! Orchestrates one invocation end to end:
//!
//! 1. Cache lookup for cacheable calls
//! 2. Candidate selection through the router
//! 3. Per-candidate attempts under a timeout, each failure classified and
//!    fed to the retry state machine; failover once a candidate's budget
//!    is spent
//! 4. Write-through cache and metrics on success
//! 5. Stale-on-error, then an aggregated error, once every candidate failed
//!
//! Every attempt is reported to the health monitor as it finishes, so live
//! traffic can demote a server before its next scheduled probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::{AdapterError, AdapterSet};
use crate::cache::{CacheKey, CacheLayer};
use crate::clock::SharedClock;
use crate::health::{HealthMonitor, Observation};
use crate::metrics::{AttemptOutcome, MetricsAggregator};
use crate::registry::{Category, Region};
use crate::resilience::{
    redact_params, CredentialRefresher, ErrorCategory, ErrorClassifier, ErrorRecord,
    RetryDecision, RetryPolicy, Severity,
};
use crate::router::{Candidate, RequestRouter, RouteConstraints};

// ============================================================================
// Options / Responses
// ============================================================================

/// Per-call options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Per-attempt timeout; defaults to the server category's timeout
    pub timeout: Option<Duration>,
    /// Serve from and write to the cache
    pub cacheable: bool,
    /// Retries per candidate; defaults to the retry policy
    pub max_retries: Option<u32>,
    /// Required hosting region
    pub residency: Option<Region>,
    /// Session for sticky routing rules
    pub session_key: Option<String>,
    /// Cache TTL for this result; defaults to the cache TTL
    pub ttl: Option<Duration>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_residency(mut self, region: Region) -> Self {
        self.residency = Some(region);
        self
    }

    #[must_use]
    pub fn with_session(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn constraints(&self) -> RouteConstraints {
        RouteConstraints {
            residency: self.residency,
            session_key: self.session_key.clone(),
        }
    }
}

/// Where a response value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Live,
    Cache,
    /// Expired cache entry served after every candidate failed
    StaleCache,
}

/// Successful invocation
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InvokeResponse {
    pub request_id: Uuid,
    pub value: Value,
    pub source: ResponseSource,
    /// Server that produced the value; `None` for cache responses
    pub server_id: Option<String>,
    /// Calls made to servers
    pub attempts: u32,
    /// Retries on the same candidate, summed over candidates
    pub retries: u32,
    /// Times the dispatcher moved on to another candidate
    pub failovers: u32,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// One failed candidate in an aggregated error
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub server_id: String,
    pub category: ErrorCategory,
    pub message: String,
}

// ============================================================================
// Dispatch Errors
// ============================================================================

/// Errors surfaced by [`Dispatcher::invoke`]
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request itself was rejected; never retried
    #[error("Validation failed for '{method}' on {server_id}: {message}")]
    Validation {
        method: String,
        server_id: String,
        message: String,
    },

    /// Every server was filtered out
    #[error("No available server for '{method}'")]
    NoAvailableServer { method: String },

    /// Every candidate failed and no fallback applied
    #[error("All candidates failed for '{method}': {}", summarize(.attempts))]
    Exhausted {
        method: String,
        attempts: Vec<AttemptFailure>,
    },

    /// The dispatcher no longer accepts calls
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({}): {}", a.server_id, a.category, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DispatchError {
    /// Category of the failure that ended the call
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Validation { .. } => Some(ErrorCategory::Validation),
            Self::Exhausted { attempts, .. } => attempts.last().map(|a| a.category),
            Self::NoAvailableServer { .. } | Self::ShuttingDown => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation { .. } => Severity::Medium,
            Self::NoAvailableServer { .. } => Severity::Critical,
            Self::Exhausted { .. } => Severity::High,
            Self::ShuttingDown => Severity::Low,
        }
    }

    /// Every attempted `{server, category, message}`
    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            Self::Exhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

// ============================================================================
// Request Context
// ============================================================================

/// Final state of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Success,
    CacheHit,
    StaleFallback,
    Failed,
}

/// Bookkeeping for one inbound call, dropped after it is logged
#[derive(Clone, Debug, Serialize)]
pub struct RequestContext {
    pub id: Uuid,
    pub method: String,
    /// Redacted copy of the params
    pub params: Value,
    pub requested_at: DateTime<Utc>,
    pub attempt: u32,
    pub chosen_server_id: Option<String>,
    pub outcome: Option<RequestOutcome>,
    pub latency_ms: Option<u64>,
}

impl RequestContext {
    fn new(method: &str, params: &Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.to_string(),
            params: redact_params(params),
            requested_at: Utc::now(),
            attempt: 0,
            chosen_server_id: None,
            outcome: None,
            latency_ms: None,
        }
    }

    fn finish(&mut self, outcome: RequestOutcome, latency: Duration) {
        self.outcome = Some(outcome);
        self.latency_ms = Some(latency.as_millis() as u64);
        tracing::debug!(
            request_id = %self.id,
            method = %self.method,
            server = self.chosen_server_id.as_deref().unwrap_or("-"),
            attempts = self.attempt,
            outcome = ?outcome,
            latency_ms = self.latency_ms,
            "Invocation finished"
        );
    }
}

// ============================================================================
// Call Timeouts
// ============================================================================

/// Per-category call timeouts, falling back to the category default
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallTimeouts {
    overrides: HashMap<Category, Duration>,
}

impl CallTimeouts {
    #[must_use]
    pub fn with(mut self, category: Category, timeout: Duration) -> Self {
        self.overrides.insert(category, timeout);
        self
    }

    pub fn for_category(&self, category: Category) -> Duration {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_call_timeout())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Tuning for the dispatcher
#[derive(Clone, Default)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    pub timeouts: CallTimeouts,
    pub refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl std::fmt::Debug for DispatchSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSettings")
            .field("retry", &self.retry)
            .field("timeouts", &self.timeouts)
            .field("refresher", &self.refresher.is_some())
            .finish()
    }
}

enum CandidateOutcome {
    Success { value: Value },
    Failed { failure: AttemptFailure },
    Aborted { record: ErrorRecord },
    /// No slot could be taken; nothing was sent
    Busy,
}

struct CandidateRun {
    outcome: CandidateOutcome,
    attempts: u32,
    retries: u32,
}

/// Executes invocations against the selected servers
pub struct Dispatcher {
    router: Arc<RequestRouter>,
    health: Arc<HealthMonitor>,
    cache: Arc<CacheLayer>,
    metrics: Arc<MetricsAggregator>,
    adapters: Arc<AdapterSet>,
    clock: SharedClock,

    classifier: ErrorClassifier,
    settings: DispatchSettings,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        router: Arc<RequestRouter>,
        health: Arc<HealthMonitor>,
        cache: Arc<CacheLayer>,
        metrics: Arc<MetricsAggregator>,
        adapters: Arc<AdapterSet>,
        clock: SharedClock,
        settings: DispatchSettings,
    ) -> Self {
        let classifier = ErrorClassifier::new().with_auth_refresh(settings.refresher.is_some());
        Self {
            router,
            health,
            cache,
            metrics,
            adapters,
            clock,
            classifier,
            settings,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Stop accepting new invocations
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Invoke `method` with `params`
    ///
    /// # Errors
    ///
    /// - `Validation` as soon as a server rejects the input
    /// - `NoAvailableServer` when routing leaves no candidate
    /// - `Exhausted` when every candidate failed and no stale value exists
    /// - `ShuttingDown` after [`shutdown`](Self::shutdown)
    pub async fn invoke(
        &self,
        method: &str,
        params: Value,
        options: InvokeOptions,
    ) -> Result<InvokeResponse, DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }

        let started = self.clock.now();
        let mut ctx = RequestContext::new(method, &params);

        let cache_key = options
            .cacheable
            .then(|| CacheKey::new(self.router.category_for(method), method, &params));

        if let Some(key) = &cache_key {
            if let Some(value) = self.cache.get(key) {
                let latency = self.elapsed_since(started);
                self.metrics.record_cache_hit();
                self.metrics.record_invocation(latency, true);
                ctx.finish(RequestOutcome::CacheHit, latency);
                return Ok(InvokeResponse {
                    request_id: ctx.id,
                    value,
                    source: ResponseSource::Cache,
                    server_id: None,
                    attempts: 0,
                    retries: 0,
                    failovers: 0,
                    latency,
                });
            }
        }

        let candidates = self
            .router
            .select_candidates(method, &options.constraints())
            .await;
        if candidates.is_empty() {
            let latency = self.elapsed_since(started);
            self.metrics.record_no_server();
            self.metrics.record_invocation(latency, false);
            ctx.finish(RequestOutcome::Failed, latency);
            tracing::warn!(method, component = "dispatcher", "No available server");
            return Err(DispatchError::NoAvailableServer {
                method: method.to_string(),
            });
        }

        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut failovers = 0u32;
        let mut previous: Option<String> = None;

        for candidate in &candidates {
            if let Some(prev) = &previous {
                failovers += 1;
                self.metrics.record_failover(prev, candidate.id());
            }
            previous = Some(candidate.id().to_string());
            ctx.chosen_server_id = Some(candidate.id().to_string());

            let run = self
                .run_candidate(candidate, method, &params, &options, &ctx)
                .await;
            attempts += run.attempts;
            retries += run.retries;
            ctx.attempt = attempts;

            match run.outcome {
                CandidateOutcome::Success { value } => {
                    if let Some(key) = cache_key {
                        match options.ttl {
                            Some(ttl) => self.cache.set_with_ttl(key, value.clone(), ttl),
                            None => self.cache.set(key, value.clone()),
                        }
                    }
                    if let Some(session) = &options.session_key {
                        self.router.record_session(method, session, candidate.id());
                    }

                    let latency = self.elapsed_since(started);
                    self.metrics.record_invocation(latency, true);
                    ctx.finish(RequestOutcome::Success, latency);
                    return Ok(InvokeResponse {
                        request_id: ctx.id,
                        value,
                        source: ResponseSource::Live,
                        server_id: Some(candidate.id().to_string()),
                        attempts,
                        retries,
                        failovers,
                        latency,
                    });
                }
                CandidateOutcome::Failed { failure } => failures.push(failure),
                CandidateOutcome::Aborted { record } => {
                    let latency = self.elapsed_since(started);
                    self.metrics.record_invocation(latency, false);
                    ctx.finish(RequestOutcome::Failed, latency);
                    return Err(DispatchError::Validation {
                        method: method.to_string(),
                        server_id: candidate.id().to_string(),
                        message: record.cause,
                    });
                }
                CandidateOutcome::Busy => {
                    tracing::debug!(server = %candidate.id(), method, "Candidate at capacity, skipping");
                }
            }
        }

        // Stale-on-error
        if let Some(key) = &cache_key {
            if let Some(value) = self.cache.get_stale(key) {
                let latency = self.elapsed_since(started);
                self.metrics.record_stale_served();
                self.metrics.record_invocation(latency, true);
                ctx.finish(RequestOutcome::StaleFallback, latency);
                tracing::warn!(
                    method,
                    component = "dispatcher",
                    failed_candidates = failures.len(),
                    "Serving stale cached value after all candidates failed"
                );
                return Ok(InvokeResponse {
                    request_id: ctx.id,
                    value,
                    source: ResponseSource::StaleCache,
                    server_id: None,
                    attempts,
                    retries,
                    failovers,
                    latency,
                });
            }
        }

        let latency = self.elapsed_since(started);
        self.metrics.record_invocation(latency, false);
        ctx.finish(RequestOutcome::Failed, latency);

        if failures.is_empty() {
            // Every candidate filled up between routing and dispatch
            return Err(DispatchError::NoAvailableServer {
                method: method.to_string(),
            });
        }

        tracing::error!(
            method,
            component = "dispatcher",
            request_id = %ctx.id,
            failures = %summarize(&failures),
            "All candidates exhausted"
        );
        Err(DispatchError::Exhausted {
            method: method.to_string(),
            attempts: failures,
        })
    }

    async fn run_candidate(
        &self,
        candidate: &Candidate,
        method: &str,
        params: &Value,
        options: &InvokeOptions,
        ctx: &RequestContext,
    ) -> CandidateRun {
        let server_id = candidate.id();
        let mut attempts = 0u32;

        let Some(adapter) = self.adapters.get(server_id) else {
            tracing::warn!(server = %server_id, method, "No adapter registered for server");
            return CandidateRun {
                outcome: CandidateOutcome::Failed {
                    failure: AttemptFailure {
                        server_id: server_id.to_string(),
                        category: ErrorCategory::Unknown,
                        message: "no adapter registered".to_string(),
                    },
                },
                attempts,
                retries: 0,
            };
        };

        // Recovery candidates get exactly one attempt
        let budget = if candidate.recovery {
            0
        } else {
            options.max_retries.unwrap_or(self.settings.retry.max_retries)
        };
        let mut state = self.settings.retry.start(budget);
        let timeout = options.timeout.unwrap_or_else(|| {
            self.settings
                .timeouts
                .for_category(candidate.descriptor.category)
        });

        let mut last_failure: Option<ErrorRecord> = None;

        loop {
            let Some(slot) = self
                .metrics
                .try_acquire_slot(server_id, candidate.descriptor.max_concurrency)
            else {
                // A retry that lost its slot still reports the failure it saw
                let outcome = match last_failure {
                    Some(record) => CandidateOutcome::Failed {
                        failure: failure_of(server_id, record.exhausted()),
                    },
                    None => CandidateOutcome::Busy,
                };
                return CandidateRun {
                    outcome,
                    attempts,
                    retries: state.retries(),
                };
            };

            let stamp = self.health.stamp();
            let attempt_started = self.clock.now();
            let result = tokio::time::timeout(timeout, adapter.call(method, params, timeout)).await;
            let latency = self.elapsed_since(attempt_started);
            drop(slot);
            attempts += 1;

            let error = match result {
                Ok(Ok(value)) => {
                    self.metrics
                        .record_attempt(server_id, latency, AttemptOutcome::Success);
                    self.health
                        .report_live(server_id, stamp, Observation::Success { latency });
                    return CandidateRun {
                        outcome: CandidateOutcome::Success { value },
                        attempts,
                        retries: state.retries(),
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => AdapterError::Timeout(timeout),
            };

            let record = self.classifier.classify(&error, method, state.attempt());
            let outcome = if record.category == ErrorCategory::Timeout {
                AttemptOutcome::Timeout
            } else {
                AttemptOutcome::Failure
            };
            self.metrics.record_attempt(server_id, latency, outcome);
            if record.category.penalizes_server() {
                self.health.report_live(
                    server_id,
                    stamp,
                    Observation::Failure {
                        error: record.cause.clone(),
                    },
                );
            }

            tracing::warn!(
                operation = method,
                component = "dispatcher",
                request_id = %ctx.id,
                server = %server_id,
                attempt = record.attempt,
                category = %record.category,
                params = %ctx.params,
                error = %record.cause,
                "Attempt failed"
            );

            match state.next(&record) {
                RetryDecision::RetryAfter(delay) => {
                    last_failure = Some(record);
                    self.clock.sleep(delay).await;
                }
                RetryDecision::RefreshCredentials => {
                    let refreshed = match &self.settings.refresher {
                        Some(refresher) => refresher.refresh(server_id).await,
                        None => Err(AdapterError::Other("no credential refresher".into())),
                    };
                    if let Err(e) = refreshed {
                        tracing::warn!(server = %server_id, error = %e, "Credential refresh failed");
                        return CandidateRun {
                            outcome: CandidateOutcome::Failed {
                                failure: failure_of(server_id, record.exhausted()),
                            },
                            attempts,
                            retries: state.retries(),
                        };
                    }
                    last_failure = Some(record);
                }
                RetryDecision::Failover => {
                    return CandidateRun {
                        outcome: CandidateOutcome::Failed {
                            failure: failure_of(server_id, record.exhausted()),
                        },
                        attempts,
                        retries: state.retries(),
                    };
                }
                RetryDecision::Abort => {
                    return CandidateRun {
                        outcome: CandidateOutcome::Aborted { record },
                        attempts,
                        retries: state.retries(),
                    };
                }
            }
        }
    }

    fn elapsed_since(&self, started: std::time::Instant) -> Duration {
        self.clock.now().saturating_duration_since(started)
    }
}

fn failure_of(server_id: &str, record: ErrorRecord) -> AttemptFailure {
    AttemptFailure {
        server_id: server_id.to_string(),
        category: record.category,
        message: record.cause,
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
