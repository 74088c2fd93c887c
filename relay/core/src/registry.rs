//! Server Registry
//!
//! Catalog of provider descriptors. A descriptor is created when a server is
//! registered (or when a registry document is applied) and is never physically
//! removed while the process runs: unregistering a server only disables it.
//!
//! Every mutation bumps a generation counter and is broadcast as a
//! [`RegistryEvent`]. The health monitor listens to those events to start and
//! cancel probe tasks; the router compares generations to invalidate its
//! cached routing table.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Category / Region
// ============================================================================

/// Provider category, drives default timeouts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Relational / document databases
    Database,
    /// Search indexes
    Search,
    /// Model inference and embedding providers
    Ai,
    /// Analytics and warehousing
    Analytics,
    /// Object and file storage
    Storage,
    /// Messaging, email, notifications
    Communication,
    /// Developer tooling (VCS, CI, issue trackers)
    DevTool,
    /// Anything else
    Other,
}

impl Category {
    /// Timeout for a single health probe
    ///
    /// Lightweight categories get a short budget, data and AI providers a long one.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        match self {
            Self::DevTool => Duration::from_secs(5),
            Self::Communication | Self::Other => Duration::from_secs(10),
            Self::Search | Self::Storage => Duration::from_secs(15),
            Self::Database | Self::Analytics => Duration::from_secs(20),
            Self::Ai => Duration::from_secs(30),
        }
    }

    /// Default timeout for a single call attempt
    #[must_use]
    pub fn default_call_timeout(&self) -> Duration {
        match self {
            Self::DevTool => Duration::from_secs(10),
            Self::Communication => Duration::from_secs(15),
            Self::Search => Duration::from_secs(20),
            Self::Database | Self::Storage | Self::Other => Duration::from_secs(30),
            Self::Analytics => Duration::from_secs(45),
            Self::Ai => Duration::from_secs(60),
        }
    }

    /// Stable label used in cache keys and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Search => "search",
            Self::Ai => "ai",
            Self::Analytics => "analytics",
            Self::Storage => "storage",
            Self::Communication => "communication",
            Self::DevTool => "dev_tool",
            Self::Other => "other",
        }
    }

    /// All categories, in declaration order
    #[must_use]
    pub fn all() -> [Category; 8] {
        [
            Self::Database,
            Self::Search,
            Self::Ai,
            Self::Analytics,
            Self::Storage,
            Self::Communication,
            Self::DevTool,
            Self::Other,
        ]
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data residency region a provider is hosted in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Vietnam
    Vn,
    /// Asia-Pacific
    Apac,
    /// European Union
    Eu,
    /// United States
    Us,
    /// No residency guarantee
    Global,
}

impl Region {
    /// Whether a server hosted in this region satisfies `required`
    #[must_use]
    pub fn satisfies(&self, required: Region) -> bool {
        *self == required
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vn => "vn",
            Self::Apac => "apac",
            Self::Eu => "eu",
            Self::Us => "us",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Method Patterns
// ============================================================================

/// Match a method name against a pattern
///
/// `*` matches everything, a trailing `.*` matches any method under that
/// namespace (`db.*` matches `db.query` and `db.admin.vacuum`), anything else
/// must match exactly.
#[must_use]
pub fn method_matches(pattern: &str, method: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => method.starts_with(prefix) && method.len() > prefix.len(),
        None => pattern == method,
    }
}

// ============================================================================
// Server Descriptor
// ============================================================================

/// Description of one backend capability provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub display_name: String,

    /// Provider category
    pub category: Category,

    /// Methods (or method patterns) this server handles
    pub supported_methods: BTreeSet<String>,

    /// Hosting region
    pub region: Region,

    /// Lower is preferred
    pub priority: i32,

    /// Maximum simultaneous in-flight calls
    pub max_concurrency: u32,

    /// Disabled servers are never routed to or probed
    pub enabled: bool,

    /// Path probed by the health monitor
    pub health_check_path: String,
}

impl ServerDescriptor {
    /// Create an enabled descriptor with defaults
    pub fn new(id: impl Into<String>, category: Category) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            category,
            supported_methods: BTreeSet::new(),
            region: Region::Global,
            priority: 100,
            max_concurrency: 16,
            enabled: true,
            health_check_path: "/health".to_string(),
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Add supported methods
    #[must_use]
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_methods
            .extend(methods.into_iter().map(Into::into));
        self
    }

    /// Set the hosting region
    #[must_use]
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the concurrency cap
    #[must_use]
    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the health check path
    #[must_use]
    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    /// Mark as disabled
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether this server handles `method`
    #[must_use]
    pub fn supports(&self, method: &str) -> bool {
        self.supported_methods
            .iter()
            .any(|pattern| method_matches(pattern, method))
    }

    /// Check the descriptor is well formed
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidDescriptor` on an empty id, an empty
    /// method set or a zero concurrency cap.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidDescriptor {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.supported_methods.is_empty() {
            return Err(invalid("at least one supported method is required"));
        }
        if self.supported_methods.iter().any(|m| m.trim().is_empty()) {
            return Err(invalid("method patterns must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Routing Rule
// ============================================================================

/// Explicit routing override for a method pattern
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Pattern matched with [`method_matches`]
    pub method_pattern: String,

    /// Servers allowed to handle matching methods, in preference order
    pub eligible_server_ids: Vec<String>,

    /// Pin a caller session to the server that last served it
    #[serde(default)]
    pub sticky_session: bool,
}

impl RoutingRule {
    /// Create a rule
    pub fn new(method_pattern: impl Into<String>, eligible: Vec<String>) -> Self {
        Self {
            method_pattern: method_pattern.into(),
            eligible_server_ids: eligible,
            sticky_session: false,
        }
    }

    /// Enable session stickiness
    #[must_use]
    pub fn sticky(mut self) -> Self {
        self.sticky_session = true;
        self
    }

    /// Whether this rule applies to `method`
    #[must_use]
    pub fn matches(&self, method: &str) -> bool {
        method_matches(&self.method_pattern, method)
    }

    /// Rank of `server_id` within this rule, if eligible
    #[must_use]
    pub fn rank_of(&self, server_id: &str) -> Option<usize> {
        self.eligible_server_ids.iter().position(|id| id == server_id)
    }
}

// ============================================================================
// Events / Errors
// ============================================================================

/// Change notification emitted on every registry mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A new server was registered
    Added(String),
    /// A server was disabled
    Removed(String),
    /// A server's descriptor was replaced
    Changed(String),
}

impl RegistryEvent {
    /// Server the event refers to
    #[must_use]
    pub fn server_id(&self) -> &str {
        match self {
            Self::Added(id) | Self::Removed(id) | Self::Changed(id) => id,
        }
    }
}

/// Result of applying a new registry document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    /// Newly registered ids
    pub added: Vec<String>,
    /// Ids disabled because they disappeared from the document
    pub removed: Vec<String>,
    /// Ids whose descriptor changed
    pub changed: Vec<String>,
}

impl ConfigDiff {
    /// Whether nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A server with this id already exists
    #[error("server id already registered: {0}")]
    DuplicateId(String),

    /// No server with this id
    #[error("server not found: {0}")]
    NotFound(String),

    /// Malformed descriptor
    #[error("invalid descriptor for '{id}': {reason}")]
    InvalidDescriptor {
        /// Offending id
        id: String,
        /// What is wrong
        reason: String,
    },
}

// ============================================================================
// Server Registry
// ============================================================================

/// Thread-safe catalog of server descriptors
pub struct ServerRegistry {
    servers: DashMap<String, ServerDescriptor>,
    generation: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            servers: DashMap::new(),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Monotonic counter bumped on every mutation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register a new server
    ///
    /// # Errors
    ///
    /// `DuplicateId` if the id is already known (including disabled servers),
    /// `InvalidDescriptor` if validation fails.
    pub fn register(&self, descriptor: ServerDescriptor) -> Result<(), RegistryError> {
        descriptor.validate()?;
        let id = descriptor.id.clone();

        match self.servers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
            }
        }

        tracing::info!(server = %id, "Registered server");
        self.publish(RegistryEvent::Added(id));
        Ok(())
    }

    /// Disable a server; its descriptor stays readable through [`get`](Self::get)
    ///
    /// # Errors
    ///
    /// `NotFound` if the id was never registered.
    pub fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        {
            let mut entry = self
                .servers
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if !entry.enabled {
                return Ok(());
            }
            entry.enabled = false;
        }

        tracing::info!(server = %id, "Unregistered server");
        self.publish(RegistryEvent::Removed(id.to_string()));
        Ok(())
    }

    /// Look up a descriptor
    pub fn get(&self, id: &str) -> Option<ServerDescriptor> {
        self.servers.get(id).map(|d| d.clone())
    }

    /// Enabled servers handling `method`
    ///
    /// Ordered by ascending priority, then descending concurrency cap, then id.
    pub fn find_by_method(&self, method: &str) -> Vec<ServerDescriptor> {
        let mut found: Vec<ServerDescriptor> = self
            .servers
            .iter()
            .filter(|e| e.enabled && e.supports(method))
            .map(|e| e.value().clone())
            .collect();

        found.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.max_concurrency.cmp(&a.max_concurrency))
                .then_with(|| a.id.cmp(&b.id))
        });
        found
    }

    /// All enabled servers, ordered by id
    pub fn list_enabled(&self) -> Vec<ServerDescriptor> {
        let mut enabled: Vec<ServerDescriptor> = self
            .servers
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.value().clone())
            .collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        enabled
    }

    /// Number of known servers, enabled or not
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Reconcile the registry with a full document
    ///
    /// Servers absent from `descriptors` are disabled, new ones registered and
    /// modified ones replaced. The document is validated as a whole first, so
    /// a bad entry leaves the registry untouched.
    ///
    /// # Errors
    ///
    /// `InvalidDescriptor` or `DuplicateId` when the document is malformed.
    pub fn apply_config(
        &self,
        descriptors: Vec<ServerDescriptor>,
    ) -> Result<ConfigDiff, RegistryError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.id.clone()) {
                return Err(RegistryError::DuplicateId(descriptor.id.clone()));
            }
        }

        let mut diff = ConfigDiff::default();

        for descriptor in descriptors {
            let id = descriptor.id.clone();
            match self.servers.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(descriptor);
                    diff.added.push(id);
                }
                Entry::Occupied(mut slot) => {
                    if *slot.get() != descriptor {
                        slot.insert(descriptor);
                        diff.changed.push(id);
                    }
                }
            }
        }

        for mut entry in self.servers.iter_mut() {
            if entry.enabled && !seen.contains(entry.key()) {
                entry.enabled = false;
                diff.removed.push(entry.key().clone());
            }
        }

        diff.added.sort();
        diff.changed.sort();
        diff.removed.sort();

        if !diff.is_empty() {
            tracing::info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                changed = diff.changed.len(),
                "Applied registry configuration"
            );
        }

        let events = diff
            .added
            .iter()
            .cloned()
            .map(RegistryEvent::Added)
            .chain(diff.removed.iter().cloned().map(RegistryEvent::Removed))
            .chain(diff.changed.iter().cloned().map(RegistryEvent::Changed));
        for event in events {
            self.publish(event);
        }

        Ok(diff)
    }

    fn publish(&self, event: RegistryEvent) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.servers.len())
            .field("generation", &self.generation())
            .finish()
    }
}
