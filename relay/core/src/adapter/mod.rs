//! Server Adapters
//!
//! The uniform capability interface every backend provider is reached
//! through. The dispatcher and the health monitor only ever talk to
//! [`ServerAdapter`] trait objects; what sits behind one (an HTTP service,
//! an in-process fake, a database client) is the adapter's business.

mod http;

pub use http::HttpJsonAdapter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::config::RelayConfig;

// ============================================================================
// Server Adapter Trait
// ============================================================================

/// Shared adapter handle
pub type SharedAdapter = Arc<dyn ServerAdapter>;

/// Trait for provider adapters
#[async_trait]
pub trait ServerAdapter: Send + Sync {
    /// Id of the server this adapter reaches
    fn id(&self) -> &str;

    /// Establish any connection state before the first call
    async fn connect(&self) -> Result<(), AdapterError> {
        // Default: connectionless
        Ok(())
    }

    /// Invoke `method` with `params`, giving up after `timeout`
    async fn call(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, AdapterError>;

    /// Liveness check used by the health monitor
    async fn health_check(&self) -> Result<(), AdapterError>;
}

// ============================================================================
// Adapter Errors
// ============================================================================

/// Raw failures reported by adapters, before classification
#[derive(Clone, Debug, thiserror::Error)]
pub enum AdapterError {
    /// The provider rejected the request shape or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials missing, expired or lacking permission
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Provider asked the caller to slow down
    #[error("Rate limited{}", .retry_after.map(|d| format!(", retry after {}ms", d.as_millis())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Connection refused, reset or name resolution failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The call did not finish before its deadline
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Provider-side failure
    #[error("Provider fault{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    ServerFault {
        status: Option<u16>,
        message: String,
    },

    /// Anything the adapter could not put in a better bucket
    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Adapter Set
// ============================================================================

/// Adapters keyed by server id
#[derive(Default)]
pub struct AdapterSet {
    adapters: DashMap<String, SharedAdapter>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the adapter for its server id
    pub fn insert(&self, adapter: SharedAdapter) -> Option<SharedAdapter> {
        self.adapters.insert(adapter.id().to_string(), adapter)
    }

    pub fn get(&self, server_id: &str) -> Option<SharedAdapter> {
        self.adapters.get(server_id).map(|a| a.clone())
    }

    pub fn remove(&self, server_id: &str) -> Option<SharedAdapter> {
        self.adapters.remove(server_id).map(|(_, a)| a)
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.adapters.contains_key(server_id)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Call `connect()` on every adapter, returning the failures
    pub async fn connect_all(&self) -> Vec<(String, AdapterError)> {
        let adapters: Vec<SharedAdapter> = self.adapters.iter().map(|a| a.clone()).collect();
        let results = futures::future::join_all(adapters.iter().map(|adapter| async move {
            (adapter.id().to_string(), adapter.connect().await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<String> = self.adapters.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        f.debug_struct("AdapterSet").field("servers", &ids).finish()
    }
}

/// Build HTTP adapters for every server in the document that declares an endpoint
pub fn create_http_adapters(config: &RelayConfig) -> Result<AdapterSet, AdapterError> {
    let set = AdapterSet::new();
    for server in &config.servers {
        let Some(endpoint) = &server.endpoint else {
            tracing::debug!(server = %server.id, "No endpoint configured, skipping adapter");
            continue;
        };

        let mut adapter = HttpJsonAdapter::new(
            server.id.clone(),
            endpoint.clone(),
            server.health_check_path.clone(),
        )?;

        if let Some(var) = &server.api_key_env {
            match std::env::var(var) {
                Ok(token) if !token.is_empty() => adapter = adapter.with_bearer_token(token),
                _ => tracing::warn!(server = %server.id, env = %var, "API key variable not set"),
            }
        }

        set.insert(Arc::new(adapter));
    }
    Ok(set)
}
