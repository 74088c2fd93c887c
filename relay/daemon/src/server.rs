//! Daemon Server
//!
//! Owns the [`Gateway`] for the lifetime of the process: builds it from the
//! registry document, drives the diagnostics report timer and applies
//! document reloads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use relay_core::{
    create_http_adapters, default_config_path, load_config_from_path, ConfigOverrides, Gateway,
    GatewayBuilder, RelayConfig,
};

/// How often the run loop checks the signal flags
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Load, override and validate the registry document
pub fn load_document(path: Option<PathBuf>, overrides: &ConfigOverrides) -> Result<RelayConfig> {
    let path = path.or_else(default_config_path);
    let mut config = load_config_from_path(path.clone())
        .with_context(|| format!("Failed to load registry document {path:?}"))?;
    overrides.apply(&mut config);
    config
        .validate()
        .context("Registry document invalid after CLI overrides")?;
    Ok(config)
}

/// Long-running host for one gateway
pub struct DaemonServer {
    config_path: Option<PathBuf>,
    overrides: ConfigOverrides,
    report_interval: Duration,
    gateway: Gateway,
}

impl DaemonServer {
    /// Build the gateway from the registry document
    pub fn new(
        config_path: Option<PathBuf>,
        overrides: ConfigOverrides,
        report_interval: Duration,
    ) -> Result<Self> {
        let config = load_document(config_path.clone(), &overrides)?;
        let adapters = create_http_adapters(&config).context("Failed to create HTTP adapters")?;

        info!(
            servers = config.servers.len(),
            adapters = adapters.len(),
            rules = config.routing_rules.len(),
            source = %config.source(),
            "Registry document loaded"
        );

        let gateway = GatewayBuilder::from_config(&config)
            .with_adapters(adapters)
            .build()
            .context("Failed to build gateway")?;

        Ok(Self {
            config_path,
            overrides,
            report_interval,
            gateway,
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Run until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>, reload: Arc<AtomicBool>) -> Result<()> {
        self.gateway.start().await;

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut report = tokio::time::interval(self.report_interval);
        // The first tick completes immediately; skip it so the first report
        // reflects at least one probe round
        report.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if reload.swap(false, Ordering::SeqCst) {
                        if let Err(e) = self.reload() {
                            warn!(error = %e, "Registry reload failed, keeping current registry");
                        }
                    }
                }
                _ = report.tick() => {
                    let report = self.report();
                    info!(report = %report, "Diagnostics");
                    debug!(metrics = %self.gateway.prometheus(), "Prometheus export");
                }
            }
        }

        info!("Shutting down gateway");
        self.gateway.shutdown();
        Ok(())
    }

    /// Re-read the registry document and reconcile the running gateway
    pub fn reload(&self) -> Result<()> {
        let config = load_document(self.config_path.clone(), &self.overrides)?;
        let adapters = create_http_adapters(&config).context("Failed to create HTTP adapters")?;
        let diff = self
            .gateway
            .apply_config(&config, adapters)
            .context("Failed to apply registry document")?;

        if diff.is_empty() {
            info!("Registry document unchanged");
        }
        Ok(())
    }

    /// Point-in-time diagnostics as JSON
    pub fn report(&self) -> Value {
        json!({
            "system_health": self.gateway.system_health(),
            "servers": self.gateway.all_health(),
            "cache": self.gateway.cache_stats(),
            "performance": self.gateway.performance_metrics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn document(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const TWO_SERVERS: &str = r#"
        [[servers]]
        id = "search-a"
        category = "search"
        methods = ["search.*"]

        [[servers]]
        id = "search-b"
        category = "search"
        methods = ["search.*"]
        endpoint = "http://127.0.0.1:9"
    "#;

    #[test]
    fn test_load_document_applies_overrides() {
        let file = document(TWO_SERVERS);
        let config = load_document(
            Some(file.path().to_path_buf()),
            &ConfigOverrides::new().with_health_interval_secs(5),
        )
        .unwrap();
        assert_eq!(config.health.interval_secs, 5);
        assert_eq!(config.servers.len(), 2);
    }

    #[test]
    fn test_override_to_invalid_value_is_rejected() {
        let file = document(TWO_SERVERS);
        let result = load_document(
            Some(file.path().to_path_buf()),
            &ConfigOverrides::new().with_cache_max_entries(0),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_report_shape() {
        let file = document(TWO_SERVERS);
        let server = DaemonServer::new(
            Some(file.path().to_path_buf()),
            ConfigOverrides::new(),
            Duration::from_secs(60),
        )
        .unwrap();

        let report = server.report();
        assert_eq!(report["system_health"]["total_servers"], 2);
        assert_eq!(report["servers"].as_array().map(Vec::len), Some(2));
        assert_eq!(report["cache"]["total_entries"], 0);
        assert_eq!(report["performance"]["total_invocations"], 0);
    }

    #[tokio::test]
    async fn test_reload_applies_changes() {
        let file = document(TWO_SERVERS);
        let server = DaemonServer::new(
            Some(file.path().to_path_buf()),
            ConfigOverrides::new(),
            Duration::from_secs(60),
        )
        .unwrap();

        std::fs::write(
            file.path(),
            r#"
            [[servers]]
            id = "search-a"
            category = "search"
            methods = ["search.*"]
            "#,
        )
        .unwrap();

        server.reload().unwrap();
        assert_eq!(server.gateway().system_health().total_servers, 1);
    }
}
