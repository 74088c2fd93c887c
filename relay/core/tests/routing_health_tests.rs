//! Routing and health monitoring through the public Gateway API
//!
//! Residency filtering, backpressure, sticky sessions, probe serialization
//! and the precedence rule between live signals and probes.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::assert_ok;

use relay_core::health::Observation;
use relay_core::test_utils::ScriptedAdapter;
use relay_core::{
    Category, FilterReason, Gateway, HealthConfig, HealthState, InvokeOptions, ManualClock,
    Region, RouteConstraints, RoutingRule, ServerDescriptor, SystemClock,
};

fn scripted(id: &str) -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(id))
}

// =============================================================================
// Residency
// =============================================================================

#[tokio::test]
async fn test_residency_filter_keeps_only_matching_region() {
    let vn = scripted("pg-vn");
    let global = scripted("pg-global");
    let gateway = assert_ok!(Gateway::builder()
        .with_clock(ManualClock::shared())
        .with_server(
            ServerDescriptor::new("pg-vn", Category::Database)
                .with_methods(["db.*"])
                .with_region(Region::Vn)
                .with_priority(50),
        )
        .with_server(
            ServerDescriptor::new("pg-global", Category::Database)
                .with_methods(["db.*"])
                .with_region(Region::Global)
                .with_priority(1),
        )
        .with_adapter(vn.clone())
        .with_adapter(global.clone())
        .build());

    let health = gateway.health();
    for id in ["pg-vn", "pg-global"] {
        health.report_live(
            id,
            health.stamp(),
            Observation::Success {
                latency: Duration::from_millis(3),
            },
        );
    }

    let constraints = RouteConstraints::new().with_residency(Region::Vn);
    let candidates = gateway
        .router()
        .select_candidates("db.query", &constraints)
        .await;
    let ids: Vec<&str> = candidates.iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec!["pg-vn"]);

    let diagnostics = gateway.routing_diagnostics("db.query", &constraints);
    assert_eq!(diagnostics.selected_server.as_deref(), Some("pg-vn"));
    assert_eq!(diagnostics.filtered_out.len(), 1);
    assert_eq!(
        diagnostics.filtered_out[0].reason,
        FilterReason::ResidencyMismatch {
            region: Region::Global,
            required: Region::Vn,
        }
    );

    // Without a requirement the higher priority global server leads
    let response = assert_ok!(
        gateway
            .invoke("db.query", json!({}), InvokeOptions::new())
            .await
    );
    assert_eq!(response.server_id.as_deref(), Some("pg-global"));

    let response = assert_ok!(
        gateway
            .invoke(
                "db.query",
                json!({}),
                InvokeOptions::new().with_residency(Region::Vn)
            )
            .await
    );
    assert_eq!(response.server_id.as_deref(), Some("pg-vn"));
    assert_eq!(vn.calls(), 1);
    assert_eq!(global.calls(), 1);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_server_at_capacity_is_skipped() {
    let a = scripted("a");
    let b = scripted("b");
    a.set_call_delay(Duration::from_secs(1));

    let gateway = assert_ok!(Gateway::builder()
        .with_clock(SystemClock::shared())
        .with_server(
            ServerDescriptor::new("a", Category::Search)
                .with_methods(["search"])
                .with_priority(0)
                .with_max_concurrency(1),
        )
        .with_server(
            ServerDescriptor::new("b", Category::Search)
                .with_methods(["search"])
                .with_priority(1),
        )
        .with_adapter(a.clone())
        .with_adapter(b.clone())
        .build());

    let (first, second) = tokio::join!(
        gateway.invoke("search", json!({"q": 1}), InvokeOptions::new()),
        gateway.invoke("search", json!({"q": 2}), InvokeOptions::new()),
    );

    let mut served: Vec<String> = [assert_ok!(first), assert_ok!(second)]
        .into_iter()
        .filter_map(|r| r.server_id)
        .collect();
    served.sort();
    assert_eq!(served, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(a.calls(), 1);
    assert_eq!(gateway.metrics().in_flight("a"), 0);
}

// =============================================================================
// Routing rules
// =============================================================================

#[tokio::test]
async fn test_rule_restricts_and_orders_servers() {
    let gateway = assert_ok!(Gateway::builder()
        .with_clock(ManualClock::shared())
        .with_server(ServerDescriptor::new("x", Category::Ai).with_methods(["ai.*"]).with_priority(0))
        .with_server(ServerDescriptor::new("y", Category::Ai).with_methods(["ai.*"]).with_priority(1))
        .with_server(ServerDescriptor::new("z", Category::Ai).with_methods(["ai.*"]).with_priority(2))
        .with_adapter(scripted("x"))
        .with_adapter(scripted("y"))
        .with_adapter(scripted("z"))
        .with_rule(RoutingRule::new("ai.embed", vec!["z".into(), "y".into()]))
        .build());

    let diagnostics = gateway.routing_diagnostics("ai.embed", &RouteConstraints::new());
    assert_eq!(diagnostics.available_servers, vec!["z".to_string(), "y".to_string()]);
    assert_eq!(diagnostics.matched_rule.as_deref(), Some("ai.embed"));
    assert_eq!(diagnostics.filtered_out[0].server_id, "x");

    // Methods without a rule fall back to priority order
    let diagnostics = gateway.routing_diagnostics("ai.chat", &RouteConstraints::new());
    assert_eq!(diagnostics.selected_server.as_deref(), Some("x"));
}

#[tokio::test]
async fn test_sticky_session_follows_last_server() {
    let a = scripted("a");
    let b = scripted("b");
    let gateway = assert_ok!(Gateway::builder()
        .with_clock(ManualClock::shared())
        .with_server(ServerDescriptor::new("a", Category::Ai).with_methods(["ai.chat"]))
        .with_server(ServerDescriptor::new("b", Category::Ai).with_methods(["ai.chat"]))
        .with_adapter(a.clone())
        .with_adapter(b.clone())
        .with_rule(RoutingRule::new("ai.chat", vec!["a".into(), "b".into()]).sticky())
        .build());

    let session = InvokeOptions::new().with_session("conv-42").with_max_retries(0);

    a.push(Err(relay_core::AdapterError::ServerFault {
        status: Some(502),
        message: "bad gateway".into(),
    }));
    let first = assert_ok!(gateway.invoke("ai.chat", json!({}), session.clone()).await);
    assert_eq!(first.server_id.as_deref(), Some("b"));

    // a is routable again but the session stays on b
    let second = assert_ok!(gateway.invoke("ai.chat", json!({}), session).await);
    assert_eq!(second.server_id.as_deref(), Some("b"));
    assert_eq!(a.calls(), 1);

    // Other sessions still prefer a
    let other = assert_ok!(
        gateway
            .invoke("ai.chat", json!({}), InvokeOptions::new().with_session("conv-7"))
            .await
    );
    assert_eq!(other.server_id.as_deref(), Some("a"));
}

// =============================================================================
// Health monitoring
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_at_most_one_probe_in_flight_per_server() {
    let adapter = scripted("slow");
    adapter.set_health_delay(Duration::from_millis(500));

    let gateway = assert_ok!(Gateway::builder()
        .with_clock(SystemClock::shared())
        .with_server(ServerDescriptor::new("slow", Category::Storage).with_methods(["fs.*"]))
        .with_adapter(adapter.clone())
        .build());
    let health = gateway.health().clone();

    let (r1, r2, r3) = tokio::join!(
        health.force_check("slow"),
        health.force_check("slow"),
        health.force_check("slow"),
    );
    assert!(r1.is_some() && r2.is_some() && r3.is_some());
    assert_eq!(adapter.health_checks(), 3);
    assert_eq!(adapter.max_concurrent_health_checks(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_probes_mark_server_unhealthy() {
    let adapter = scripted("a");
    let gateway = assert_ok!(Gateway::builder()
        .with_clock(SystemClock::shared())
        .with_health_config(HealthConfig {
            check_interval: Duration::from_secs(30),
            jitter_factor: 0.0,
            ..Default::default()
        })
        .with_server(ServerDescriptor::new("a", Category::Other).with_methods(["metrics.*"]))
        .with_adapter(adapter.clone())
        .build());

    gateway.start().await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(gateway.health().state("a"), HealthState::Healthy);

    adapter.set_healthy(false);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(gateway.health().state("a"), HealthState::Degraded);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(gateway.health().state("a"), HealthState::Unhealthy);
    let status = gateway.server_health("a").unwrap();
    assert_eq!(status.consecutive_failures, 3);
    assert!(status.last_error.unwrap().contains("unreachable"));

    gateway.shutdown();
}

#[tokio::test]
async fn test_older_observation_never_overrides_newer() {
    let gateway = assert_ok!(Gateway::builder()
        .with_clock(ManualClock::shared())
        .with_server(ServerDescriptor::new("a", Category::Database).with_methods(["db.*"]))
        .with_adapter(scripted("a"))
        .build());
    let health = gateway.health();

    // A probe starts, then a live call starts and finishes first
    let probe_started = health.stamp();
    let live_started = health.stamp();
    assert!(health.report_live(
        "a",
        live_started,
        Observation::Success {
            latency: Duration::from_millis(4)
        }
    ));

    // The slower probe reports a failure that predates the live success
    assert!(!health.report_live(
        "a",
        probe_started,
        Observation::Failure {
            error: "probe timed out".into()
        }
    ));
    assert_eq!(health.state("a"), HealthState::Healthy);
}

#[tokio::test]
async fn test_prometheus_export_lists_servers() {
    let gateway = assert_ok!(Gateway::builder()
        .with_clock(ManualClock::shared())
        .with_server(ServerDescriptor::new("a", Category::Search).with_methods(["search"]))
        .with_adapter(scripted("a"))
        .build());

    assert_ok!(
        gateway
            .invoke("search", json!({}), InvokeOptions::new())
            .await
    );
    let text = gateway.prometheus();
    assert!(text.contains("relay_invocations_total 1"));
    assert!(text.contains("relay_server_requests_total{server=\"a\"} 1"));
}
