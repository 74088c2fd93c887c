//! Registry document loading wired into a running Gateway

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

use relay_core::test_utils::ScriptedAdapter;
use relay_core::{
    create_http_adapters, load_config_from_path, AdapterSet, Category, ConfigError,
    ConfigOverrides, ConfigSource, GatewayBuilder, InvokeOptions, ManualClock, Region,
    RouteConstraints,
};

const DOCUMENT: &str = r#"
[health]
interval_secs = 120
failure_threshold = 2

[cache]
max_entries = 64
default_ttl_ms = 30000

[retry]
max_retries = 1
base_delay_ms = 50
max_delay_ms = 1000
jitter_factor = 0.0

[timeouts]
database = 15000

[[servers]]
id = "pg-vn"
category = "database"
methods = ["db.*"]
region = "vn"
priority = 10

[[servers]]
id = "pg-eu"
category = "database"
supported_methods = ["db.*"]
region = "eu"
priority = 20
endpoint = "http://127.0.0.1:9"

[[routing_rules]]
method_pattern = "db.export"
eligible_server_ids = ["pg-eu"]
"#;

fn write_document(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_document_drives_gateway() {
    let file = write_document(DOCUMENT);
    let config = assert_ok!(load_config_from_path(Some(file.path().to_path_buf())));

    assert_eq!(config.source(), ConfigSource::File);
    assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[1].methods, vec!["db.*".to_string()]);
    assert_eq!(config.health_config().failure_threshold, 2);
    assert_eq!(
        config.call_timeouts().for_category(Category::Database),
        Duration::from_secs(15)
    );

    let adapters = AdapterSet::new();
    let vn = Arc::new(ScriptedAdapter::new("pg-vn"));
    let eu = Arc::new(ScriptedAdapter::new("pg-eu"));
    adapters.insert(vn.clone());
    adapters.insert(eu.clone());

    let gateway = assert_ok!(GatewayBuilder::from_config(&config)
        .with_clock(ManualClock::shared())
        .with_adapters(adapters)
        .build());

    // Priority order without a rule
    let response = assert_ok!(
        gateway
            .invoke("db.query", json!({}), InvokeOptions::new())
            .await
    );
    assert_eq!(response.server_id.as_deref(), Some("pg-vn"));

    // The rule pins exports to the EU server
    let response = assert_ok!(
        gateway
            .invoke("db.export", json!({}), InvokeOptions::new())
            .await
    );
    assert_eq!(response.server_id.as_deref(), Some("pg-eu"));

    let diagnostics = gateway.routing_diagnostics(
        "db.query",
        &RouteConstraints::new().with_residency(Region::Eu),
    );
    assert_eq!(diagnostics.available_servers, vec!["pg-eu".to_string()]);

    assert_eq!(gateway.cache_stats().max_entries, 64);
}

#[test]
fn test_http_adapters_only_for_endpoints() {
    let file = write_document(DOCUMENT);
    let config = assert_ok!(load_config_from_path(Some(file.path().to_path_buf())));

    let adapters = assert_ok!(create_http_adapters(&config));
    assert_eq!(adapters.len(), 1);
    assert!(adapters.contains("pg-eu"));
    assert!(!adapters.contains("pg-vn"));
}

#[test]
fn test_rule_with_unknown_server_is_fatal() {
    let file = write_document(
        r#"
        [[servers]]
        id = "a"
        category = "search"
        methods = ["search"]

        [[routing_rules]]
        method_pattern = "search"
        eligible_server_ids = ["ghost"]
        "#,
    );

    let err = assert_err!(load_config_from_path(Some(file.path().to_path_buf())));
    assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("ghost")));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_document("[[servers]\nid = ");
    let err = assert_err!(load_config_from_path(Some(file.path().to_path_buf())));
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn test_cli_overrides_win() {
    let file = write_document(DOCUMENT);
    let mut config = assert_ok!(load_config_from_path(Some(file.path().to_path_buf())));

    ConfigOverrides::new()
        .with_health_interval_secs(15)
        .with_cache_max_entries(8)
        .apply(&mut config);

    assert_eq!(config.source(), ConfigSource::Cli);
    assert_eq!(config.health_config().check_interval, Duration::from_secs(15));
    assert_eq!(config.cache_config().max_entries, 8);
}
