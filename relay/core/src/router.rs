//! Request Router
//!
//! Computes the ordered candidate list for a method:
//!
//! 1. Registry lookup (or the first matching [`RoutingRule`], which restricts
//!    and orders the servers)
//! 2. Residency filter against the caller's required region
//! 3. Health filter: unhealthy servers are dropped, unless every remaining
//!    server is unhealthy, in which case the least recently failed one is
//!    kept as a recovery candidate
//! 4. Backpressure: servers at their concurrency cap are dropped
//! 5. Within a preference rank the larger concurrency cap goes first;
//!    remaining ties are broken by in-flight load (ascending), then recent
//!    success rate (descending)
//! 6. Sticky sessions move the pinned server to the front
//!
//! Steps 1 and the health lookup are cached per method and invalidated when
//! the registry, the rule set or any health state changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::health::{HealthMonitor, HealthState};
use crate::metrics::MetricsAggregator;
use crate::registry::{Category, Region, RoutingRule, ServerDescriptor, ServerRegistry};

// ============================================================================
// Request Constraints / Results
// ============================================================================

/// Per-request routing constraints
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteConstraints {
    /// Required hosting region; `None` accepts any
    pub residency: Option<Region>,
    /// Caller session for sticky rules
    pub session_key: Option<String>,
}

impl RouteConstraints {
    pub fn new() -> Self {
        Self::default()
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
}

/// A server eligible for a call
#[derive(Clone, Debug)]
pub struct Candidate {
    pub descriptor: ServerDescriptor,
    /// Kept only because every option was unhealthy; gets a single attempt
    pub recovery: bool,
    pub in_flight: u64,
    pub success_rate: f64,
}

impl Candidate {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Why a server was left out
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FilterReason {
    /// A routing rule for this method does not list the server
    NotInRule { rule: String },
    /// Hosted outside the required region
    ResidencyMismatch { region: Region, required: Region },
    /// Health state excludes it
    Unhealthy,
    /// At its concurrency cap
    AtCapacity { in_flight: u64, max_concurrency: u32 },
}

/// A filtered server and the reason
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilteredServer {
    pub server_id: String,
    #[serde(flatten)]
    pub reason: FilterReason,
}

/// Routing decision explained, without performing a call
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingDiagnostics {
    pub method: String,
    pub selected_server: Option<String>,
    pub available_servers: Vec<String>,
    pub filtered_out: Vec<FilteredServer>,
    pub matched_rule: Option<String>,
    pub recovery: bool,
}

// ============================================================================
// Cached Routing Table
// ============================================================================

#[derive(Clone, Debug)]
struct RouteEntry {
    descriptor: ServerDescriptor,
    state: HealthState,
    rank: i64,
}

#[derive(Debug)]
struct BaseRoute {
    entries: Vec<RouteEntry>,
    rule: Option<RoutingRule>,
    excluded_by_rule: Vec<String>,
}

#[derive(Debug, Default)]
struct RouteTable {
    /// (registry generation, health generation, rules generation)
    key: (u64, u64, u64),
    routes: HashMap<String, Arc<BaseRoute>>,
}

struct RoutePlan {
    candidates: Vec<Candidate>,
    filtered: Vec<FilteredServer>,
    rule: Option<RoutingRule>,
    recovery: bool,
}

// ============================================================================
// Request Router
// ============================================================================

/// Selects candidate servers for methods
pub struct RequestRouter {
    registry: Arc<ServerRegistry>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsAggregator>,

    rules: RwLock<Vec<RoutingRule>>,
    rules_generation: AtomicU64,
    table: RwLock<RouteTable>,

    /// Sticky session pins: "pattern \0 session" -> server id
    sessions: DashMap<String, String>,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<ServerRegistry>,
        health: Arc<HealthMonitor>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            registry,
            health,
            metrics,
            rules: RwLock::new(Vec::new()),
            rules_generation: AtomicU64::new(0),
            table: RwLock::new(RouteTable::default()),
            sessions: DashMap::new(),
        }
    }

    /// Replace the routing rules; the first matching rule wins
    pub fn set_rules(&self, rules: Vec<RoutingRule>) {
        *self.rules.write() = rules;
        self.rules_generation.fetch_add(1, Ordering::AcqRel);
        self.sessions.clear();
    }

    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    /// Number of methods with a cached route under the current generations
    pub fn cached_routes(&self) -> usize {
        let table = self.table.read();
        if table.key == self.table_key() {
            table.routes.len()
        } else {
            0
        }
    }

    /// Category of the preferred server for `method`, for cache keying
    pub fn category_for(&self, method: &str) -> Category {
        self.base_route(method)
            .entries
            .first()
            .map_or(Category::Other, |e| e.descriptor.category)
    }

    /// Ordered candidates for `method`
    ///
    /// A recovery candidate is probed with `force_check` before it is
    /// returned; it is still returned if the probe fails.
    pub async fn select_candidates(
        &self,
        method: &str,
        constraints: &RouteConstraints,
    ) -> Vec<Candidate> {
        let plan = self.plan(method, constraints);

        if plan.recovery {
            if let Some(candidate) = plan.candidates.first() {
                tracing::info!(
                    server = %candidate.id(),
                    method,
                    "All candidates unhealthy, probing least recently failed"
                );
                self.health.force_check(candidate.id()).await;
            }
        }

        plan.candidates
    }

    /// Explain the routing decision for `method` without calling anything
    pub fn test_routing(&self, method: &str, constraints: &RouteConstraints) -> RoutingDiagnostics {
        let plan = self.plan(method, constraints);
        RoutingDiagnostics {
            method: method.to_string(),
            selected_server: plan.candidates.first().map(|c| c.id().to_string()),
            available_servers: plan.candidates.iter().map(|c| c.id().to_string()).collect(),
            filtered_out: plan.filtered,
            matched_rule: plan.rule.map(|r| r.method_pattern),
            recovery: plan.recovery,
        }
    }

    /// Remember which server served a sticky session
    pub fn record_session(&self, method: &str, session_key: &str, server_id: &str) {
        let sticky_rule = self
            .rules
            .read()
            .iter()
            .find(|r| r.matches(method))
            .filter(|r| r.sticky_session)
            .map(|r| r.method_pattern.clone());

        if let Some(pattern) = sticky_rule {
            self.sessions
                .insert(session_slot(&pattern, session_key), server_id.to_string());
        }
    }

    fn table_key(&self) -> (u64, u64, u64) {
        (
            self.registry.generation(),
            self.health.generation(),
            self.rules_generation.load(Ordering::Acquire),
        )
    }

    fn base_route(&self, method: &str) -> Arc<BaseRoute> {
        let key = self.table_key();
        {
            let table = self.table.read();
            if table.key == key {
                if let Some(route) = table.routes.get(method) {
                    return route.clone();
                }
            }
        }

        let route = Arc::new(self.compute_base_route(method));

        let mut table = self.table.write();
        if table.key != key {
            table.routes.clear();
            table.key = key;
        }
        table.routes.insert(method.to_string(), route.clone());
        route
    }

    fn compute_base_route(&self, method: &str) -> BaseRoute {
        let rule = self.rules.read().iter().find(|r| r.matches(method)).cloned();
        let mut excluded_by_rule = Vec::new();

        let mut entries: Vec<RouteEntry> = Vec::new();
        for descriptor in self.registry.find_by_method(method) {
            let rank = match &rule {
                Some(rule) => match rule.rank_of(&descriptor.id) {
                    Some(rank) => rank as i64,
                    None => {
                        excluded_by_rule.push(descriptor.id);
                        continue;
                    }
                },
                None => i64::from(descriptor.priority),
            };
            let state = self.health.state(&descriptor.id);
            entries.push(RouteEntry {
                descriptor,
                state,
                rank,
            });
        }

        // find_by_method order is kept within equal ranks
        entries.sort_by_key(|e| e.rank);

        BaseRoute {
            entries,
            rule,
            excluded_by_rule,
        }
    }

    fn plan(&self, method: &str, constraints: &RouteConstraints) -> RoutePlan {
        let base = self.base_route(method);
        let rule_label = base.rule.as_ref().map(|r| r.method_pattern.clone());

        let mut filtered: Vec<FilteredServer> = base
            .excluded_by_rule
            .iter()
            .map(|id| FilteredServer {
                server_id: id.clone(),
                reason: FilterReason::NotInRule {
                    rule: rule_label.clone().unwrap_or_default(),
                },
            })
            .collect();

        // Residency
        let resident: Vec<&RouteEntry> = base
            .entries
            .iter()
            .filter(|entry| match constraints.residency {
                Some(required) if !entry.descriptor.region.satisfies(required) => {
                    filtered.push(FilteredServer {
                        server_id: entry.descriptor.id.clone(),
                        reason: FilterReason::ResidencyMismatch {
                            region: entry.descriptor.region,
                            required,
                        },
                    });
                    false
                }
                _ => true,
            })
            .collect();

        // Health
        let (routable, unhealthy): (Vec<&RouteEntry>, Vec<&RouteEntry>) = resident
            .into_iter()
            .partition(|entry| entry.state.is_routable());

        let mut recovery = false;
        let pool: Vec<&RouteEntry> = if routable.is_empty() && !unhealthy.is_empty() {
            // Never-failed sorts first, then the oldest failure
            let chosen = unhealthy
                .iter()
                .min_by_key(|entry| {
                    self.health
                        .get_health(&entry.descriptor.id)
                        .and_then(|status| status.last_failure)
                })
                .copied();
            for entry in &unhealthy {
                if chosen.is_some_and(|c| c.descriptor.id == entry.descriptor.id) {
                    continue;
                }
                filtered.push(FilteredServer {
                    server_id: entry.descriptor.id.clone(),
                    reason: FilterReason::Unhealthy,
                });
            }
            recovery = chosen.is_some();
            chosen.into_iter().collect()
        } else {
            for entry in &unhealthy {
                filtered.push(FilteredServer {
                    server_id: entry.descriptor.id.clone(),
                    reason: FilterReason::Unhealthy,
                });
            }
            routable
        };

        // Backpressure
        let mut ranked: Vec<(i64, Candidate)> = Vec::with_capacity(pool.len());
        for entry in pool {
            let id = &entry.descriptor.id;
            let in_flight = self.metrics.in_flight(id);
            if in_flight >= u64::from(entry.descriptor.max_concurrency) {
                filtered.push(FilteredServer {
                    server_id: id.clone(),
                    reason: FilterReason::AtCapacity {
                        in_flight,
                        max_concurrency: entry.descriptor.max_concurrency,
                    },
                });
                continue;
            }
            ranked.push((
                entry.rank,
                Candidate {
                    descriptor: entry.descriptor.clone(),
                    recovery,
                    in_flight,
                    success_rate: self.metrics.success_rate(id),
                },
            ));
        }

        // Registry order (priority, then larger concurrency cap) first; load
        // and success rate only break what remains tied
        ranked.sort_by(|(rank_a, a), (rank_b, b)| {
            rank_a
                .cmp(rank_b)
                .then_with(|| {
                    b.descriptor
                        .max_concurrency
                        .cmp(&a.descriptor.max_concurrency)
                })
                .then_with(|| a.in_flight.cmp(&b.in_flight))
                .then_with(|| b.success_rate.total_cmp(&a.success_rate))
        });
        let mut candidates: Vec<Candidate> = ranked.into_iter().map(|(_, c)| c).collect();

        // Sticky session
        if let (Some(rule), Some(session)) = (&base.rule, &constraints.session_key) {
            if rule.sticky_session {
                let pinned = self
                    .sessions
                    .get(&session_slot(&rule.method_pattern, session))
                    .map(|s| s.clone());
                if let Some(pinned) = pinned {
                    if let Some(pos) = candidates.iter().position(|c| c.id() == pinned) {
                        let candidate = candidates.remove(pos);
                        candidates.insert(0, candidate);
                    }
                }
            }
        }

        RoutePlan {
            candidates,
            filtered,
            rule: base.rule.clone(),
            recovery,
        }
    }
}

fn session_slot(pattern: &str, session_key: &str) -> String {
    format!("{pattern}\0{session_key}")
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("rules", &self.rules.read().len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
