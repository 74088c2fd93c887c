//! Relay Core - Health-Aware Request Routing for Heterogeneous Providers
//!
//! This crate sits between callers and a fleet of backend capability
//! providers (databases, search engines, AI models, dev tools...). A caller
//! invokes a method by name; relay picks the best healthy server for it,
//! retries and fails over on error, caches results and keeps per-server
//! health and performance statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Gateway                                │
//! │                                                                   │
//! │   invoke(method, params, options)                                 │
//! │        │                                                          │
//! │        ▼                                                          │
//! │  ┌────────────┐   hit   ┌─────────────┐                           │
//! │  │ Dispatcher │ ──────► │ CacheLayer  │                           │
//! │  └─────┬──────┘         └─────────────┘                           │
//! │        │ candidates                                               │
//! │        ▼                                                          │
//! │  ┌────────────┐  ┌────────────────┐  ┌───────────────────┐        │
//! │  │   Router   │◄─│ ServerRegistry │  │ MetricsAggregator │        │
//! │  └─────┬──────┘  └────────────────┘  └───────────────────┘        │
//! │        │ ▲                                                        │
//! │        │ └──────── HealthMonitor ◄── probes / fast-path signals   │
//! │        ▼                                                          │
//! │  ServerAdapter::call  (HTTP, in-process, ...)                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: Owned handle wiring every component; the public entry point
//! - [`ServerAdapter`]: Capability interface each provider implements
//! - [`ServerRegistry`]: Catalog of [`ServerDescriptor`]s
//! - [`HealthMonitor`]: Probe scheduling and per-server health state
//! - [`RequestRouter`]: Candidate selection and routing diagnostics
//! - [`Dispatcher`]: Retry, failover and stale-on-error around each call
//! - [`Clock`]: Injected time source, swapped for [`ManualClock`] in tests
//!
//! # Example
//!
//! ```ignore
//! use relay_core::{Gateway, InvokeOptions, ServerDescriptor, Category};
//!
//! let gateway = Gateway::builder()
//!     .with_server(ServerDescriptor::new("pg-main", Category::Database).with_methods(["db.*"]))
//!     .with_adapter(pg_adapter)
//!     .build()?;
//! gateway.start().await;
//!
//! let response = gateway
//!     .invoke("db.query", json!({"sql": "SELECT 1"}), InvokeOptions::new().cacheable())
//!     .await?;
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod test_utils;

// Re-export commonly used types
pub use adapter::{
    create_http_adapters, AdapterError, AdapterSet, HttpJsonAdapter, ServerAdapter, SharedAdapter,
};
pub use cache::{CacheConfig, CacheKey, CacheLayer, CacheStats};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    default_config_path, load_config, load_config_from_path, parse_config, ConfigError,
    ConfigOverrides, ConfigSource, RelayConfig, ServerConfig,
};
pub use dispatcher::{
    AttemptFailure, CallTimeouts, DispatchError, DispatchSettings, Dispatcher, InvokeOptions,
    InvokeResponse, RequestContext, RequestOutcome, ResponseSource,
};
pub use gateway::{Gateway, GatewayBuilder};
pub use health::{HealthConfig, HealthMonitor, HealthState, HealthStatus, SystemHealth};
pub use metrics::{MetricsAggregator, PerformanceMetrics, ServerMetricsSummary};
pub use registry::{
    Category, ConfigDiff, Region, RegistryError, RegistryEvent, RoutingRule, ServerDescriptor,
    ServerRegistry,
};
pub use resilience::{
    CredentialRefresher, ErrorCategory, ErrorClassifier, ErrorRecord, RetryPolicy, Severity,
};
pub use router::{
    Candidate, FilterReason, FilteredServer, RequestRouter, RouteConstraints, RoutingDiagnostics,
};
