//! Test Utilities
//!
//! [`ScriptedAdapter`] is an in-process [`ServerAdapter`] whose responses,
//! delays and health are driven by the test. Calls consume scripted results
//! in order; once the script is empty the fallback applies (a fixed error
//! when `fail_always` was set, otherwise the default value).
//!
//! [`ConcurrencyGauge`] tracks how many operations overlap; several adapters
//! can share one to observe a limit that spans servers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::adapter::{AdapterError, ServerAdapter};

/// Current and peak count of overlapping operations
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest overlap seen so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Scriptable in-memory adapter
pub struct ScriptedAdapter {
    id: String,
    script: Mutex<VecDeque<Result<Value, AdapterError>>>,
    fallback: Mutex<Result<Value, AdapterError>>,
    call_delay: Mutex<Duration>,
    health_delay: Mutex<Duration>,
    healthy: AtomicBool,

    calls: AtomicU32,
    connects: AtomicU32,
    health_checks: AtomicU32,
    health_gauge: ConcurrencyGauge,
    shared_health_gauge: Mutex<Option<Arc<ConcurrencyGauge>>>,
    last_method: Mutex<Option<String>>,
}

impl ScriptedAdapter {
    /// Healthy adapter answering `{"server": id}` to every call
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let fallback = Ok(json!({ "server": id }));
        Self {
            id,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            call_delay: Mutex::new(Duration::ZERO),
            health_delay: Mutex::new(Duration::ZERO),
            healthy: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
            health_gauge: ConcurrencyGauge::default(),
            shared_health_gauge: Mutex::new(None),
            last_method: Mutex::new(None),
        }
    }

    /// Queue one result
    pub fn push(&self, result: Result<Value, AdapterError>) {
        self.script.lock().push_back(result);
    }

    /// Queue `n` copies of `error`
    pub fn push_failures(&self, n: usize, error: AdapterError) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Err(error.clone()));
        }
    }

    /// Answer `error` once the script is empty
    pub fn fail_always(&self, error: AdapterError) {
        *self.fallback.lock() = Err(error);
    }

    /// Answer `value` once the script is empty
    pub fn respond_with(&self, value: Value) {
        *self.fallback.lock() = Ok(value);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock() = delay;
    }

    pub fn set_health_delay(&self, delay: Duration) {
        *self.health_delay.lock() = delay;
    }

    /// Also count this adapter's health checks on `gauge`
    pub fn share_health_gauge(&self, gauge: Arc<ConcurrencyGauge>) {
        *self.shared_health_gauge.lock() = Some(gauge);
    }

    /// Calls received, successful or not
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Highest number of health checks that overlapped
    pub fn max_concurrent_health_checks(&self) -> usize {
        self.health_gauge.peak()
    }

    pub fn last_method(&self) -> Option<String> {
        self.last_method.lock().clone()
    }
}

#[async_trait]
impl ServerAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        _params: &Value,
        _timeout: Duration,
    ) -> Result<Value, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_method.lock() = Some(method.to_string());

        let delay = *self.call_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => self.fallback.lock().clone(),
        }
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared_health_gauge.lock().clone();
        self.health_gauge.enter();
        if let Some(gauge) = &shared {
            gauge.enter();
        }

        let delay = *self.health_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.health_gauge.exit();
        if let Some(gauge) = &shared {
            gauge.exit();
        }

        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::ConnectionFailed(format!(
                "{} is unreachable",
                self.id
            )))
        }
    }
}

impl std::fmt::Debug for ScriptedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedAdapter")
            .field("id", &self.id)
            .field("calls", &self.calls())
            .field("healthy", &self.healthy.load(Ordering::SeqCst))
            .finish()
    }
}
