//! Gateway
//!
//! The single owned handle that wires the registry, health monitor, cache,
//! metrics, router and dispatcher together. Nothing in the crate lives in a
//! module-level static: every piece of shared state hangs off a `Gateway`,
//! so two gateways in one process (or one per test) never interfere.
//!
//! ```text
//!   invoke() ──► Dispatcher ──► Cache ─── hit ──► value
//!                    │
//!                    ▼
//!                 Router ◄── Registry (descriptors, events)
//!                    │   ◄── HealthMonitor (states)
//!                    │   ◄── Metrics (in-flight, success rate)
//!                    ▼
//!               ServerAdapter::call ──► fast-path signal ──► HealthMonitor
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::adapter::{AdapterSet, SharedAdapter};
use crate::cache::{CacheConfig, CacheLayer, CacheStats};
use crate::clock::{SharedClock, SystemClock};
use crate::config::RelayConfig;
use crate::dispatcher::{
    CallTimeouts, DispatchError, DispatchSettings, Dispatcher, InvokeOptions, InvokeResponse,
};
use crate::health::{HealthConfig, HealthMonitor, HealthStatus, SystemHealth};
use crate::metrics::{MetricsAggregator, PerformanceMetrics};
use crate::registry::{ConfigDiff, RegistryError, RoutingRule, ServerDescriptor, ServerRegistry};
use crate::resilience::{CredentialRefresher, RetryPolicy};
use crate::router::{RequestRouter, RouteConstraints, RoutingDiagnostics};

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Gateway`]
pub struct GatewayBuilder {
    clock: SharedClock,
    health: HealthConfig,
    cache: CacheConfig,
    retry: RetryPolicy,
    timeouts: CallTimeouts,
    servers: Vec<ServerDescriptor>,
    rules: Vec<RoutingRule>,
    adapters: AdapterSet,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            clock: SystemClock::shared(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: CallTimeouts::default(),
            servers: Vec::new(),
            rules: Vec::new(),
            adapters: AdapterSet::new(),
            refresher: None,
        }
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded with every section of a registry document
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            health: config.health_config(),
            cache: config.cache_config(),
            retry: config.retry_policy(),
            timeouts: config.call_timeouts(),
            servers: config.descriptors(),
            rules: config.routing_rules.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_health_config(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    #[must_use]
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_server(mut self, descriptor: ServerDescriptor) -> Self {
        self.servers.push(descriptor);
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn with_adapter(self, adapter: SharedAdapter) -> Self {
        self.adapters.insert(adapter);
        self
    }

    /// Replace the adapter set wholesale
    #[must_use]
    pub fn with_adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = adapters;
        self
    }

    #[must_use]
    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Register the servers and wire the components
    ///
    /// Background work only begins with [`Gateway::start`].
    ///
    /// # Errors
    ///
    /// `RegistryError` if a descriptor is invalid or an id repeats.
    pub fn build(self) -> Result<Gateway, RegistryError> {
        let registry = Arc::new(ServerRegistry::new());
        for descriptor in self.servers {
            registry.register(descriptor)?;
        }

        for server in registry.list_enabled() {
            if !self.adapters.contains(&server.id) {
                tracing::warn!(server = %server.id, "Server registered without an adapter");
            }
        }

        let adapters = Arc::new(self.adapters);
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            adapters.clone(),
            self.clock.clone(),
            self.health,
        ));
        let cache = Arc::new(CacheLayer::new(self.cache, self.clock.clone()));
        let metrics = Arc::new(MetricsAggregator::new());
        let router = Arc::new(RequestRouter::new(
            registry.clone(),
            health.clone(),
            metrics.clone(),
        ));
        router.set_rules(self.rules);

        let dispatcher = Dispatcher::new(
            router.clone(),
            health.clone(),
            cache.clone(),
            metrics.clone(),
            adapters.clone(),
            self.clock.clone(),
            DispatchSettings {
                retry: self.retry,
                timeouts: self.timeouts,
                refresher: self.refresher,
            },
        );

        Ok(Gateway {
            clock: self.clock,
            registry,
            adapters,
            health,
            cache,
            metrics,
            router,
            dispatcher,
            started: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Owned context for every relay component
pub struct Gateway {
    clock: SharedClock,
    registry: Arc<ServerRegistry>,
    adapters: Arc<AdapterSet>,
    health: Arc<HealthMonitor>,
    cache: Arc<CacheLayer>,
    metrics: Arc<MetricsAggregator>,
    router: Arc<RequestRouter>,
    dispatcher: Dispatcher,
    started: AtomicBool,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Connect adapters, start health probing and the cache sweeper
    ///
    /// Adapter connection failures are logged, not fatal: the health monitor
    /// will mark those servers down on their first probe.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        for (server, error) in self.adapters.connect_all().await {
            tracing::warn!(server = %server, error = %error, "Adapter failed to connect");
        }

        self.health.start();
        self.cache.start_sweeper();

        tracing::info!(
            servers = self.registry.list_enabled().len(),
            adapters = self.adapters.len(),
            "Gateway started"
        );
    }

    /// Stop accepting calls, cancel every probe and release the cache
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.health.shutdown();
        self.cache.destroy();
        tracing::info!("Gateway shut down");
    }

    /// Invoke `method` on the best available server
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::invoke`].
    pub async fn invoke(
        &self,
        method: &str,
        params: Value,
        options: InvokeOptions,
    ) -> Result<InvokeResponse, DispatchError> {
        self.dispatcher.invoke(method, params, options).await
    }

    // ------------------------------------------------------------------------
    // Registry management
    // ------------------------------------------------------------------------

    /// Add a server together with the adapter that reaches it
    ///
    /// # Errors
    ///
    /// `RegistryError` if the descriptor is invalid or its id is taken.
    pub fn register_server(
        &self,
        descriptor: ServerDescriptor,
        adapter: SharedAdapter,
    ) -> Result<(), RegistryError> {
        descriptor.validate()?;
        if adapter.id() != descriptor.id {
            return Err(RegistryError::InvalidDescriptor {
                id: descriptor.id,
                reason: format!("adapter id '{}' does not match", adapter.id()),
            });
        }
        // A known id keeps its adapter; disabled servers count as known
        if self.registry.get(&descriptor.id).is_some() {
            return Err(RegistryError::DuplicateId(descriptor.id));
        }
        // The adapter goes in first so the cold-start probe triggered by
        // registration can reach it
        let previous = self.adapters.get(&descriptor.id);
        self.adapters.insert(adapter);
        let id = descriptor.id.clone();
        if let Err(e) = self.registry.register(descriptor) {
            // Lost a race with a concurrent registration of the same id
            match previous {
                Some(previous) => {
                    self.adapters.insert(previous);
                }
                None => {
                    self.adapters.remove(&id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Take a server out of rotation
    ///
    /// # Errors
    ///
    /// `RegistryError::NotFound` for unknown ids.
    pub fn unregister_server(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.unregister(id)
    }

    /// Reconcile the registry and routing rules with a new document
    ///
    /// Adapters in `adapters` replace existing ones with the same id.
    ///
    /// # Errors
    ///
    /// `RegistryError` when the document is malformed; nothing is changed.
    pub fn apply_config(
        &self,
        config: &RelayConfig,
        adapters: AdapterSet,
    ) -> Result<ConfigDiff, RegistryError> {
        let diff = self.registry.apply_config(config.descriptors())?;
        for server in &config.servers {
            if let Some(adapter) = adapters.get(&server.id) {
                self.adapters.insert(adapter);
            }
        }
        self.router.set_rules(config.routing_rules.clone());

        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Registry document applied"
        );
        Ok(diff)
    }

    pub fn set_routing_rules(&self, rules: Vec<RoutingRule>) {
        self.router.set_rules(rules);
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    pub fn system_health(&self) -> SystemHealth {
        self.health.get_system_health()
    }

    pub fn server_health(&self, id: &str) -> Option<HealthStatus> {
        self.health.get_health(id)
    }

    pub fn all_health(&self) -> Vec<HealthStatus> {
        self.health.get_all_health()
    }

    /// Explain how `method` would be routed right now
    pub fn routing_diagnostics(
        &self,
        method: &str,
        constraints: &RouteConstraints,
    ) -> RoutingDiagnostics {
        self.router.test_routing(method, constraints)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.metrics.performance_metrics()
    }

    /// Metrics in Prometheus text exposition format
    pub fn prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Drop cached entries whose method matches `pattern`
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern)
    }

    // ------------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------------

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("servers", &self.registry.len())
            .field("adapters", &self.adapters)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
