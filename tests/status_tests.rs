mod support;

use ash_warden::{
    AggregatedStatus, FailureCause, HealthResult, Registry, ServicePhase, ServiceSnapshot, Verdict,
    sweep,
};
use chrono::Utc;
use std::sync::Arc;
use support::{ScriptedProbe, service};

fn snapshot(name: &str, phase: ServicePhase) -> ServiceSnapshot {
    ServiceSnapshot {
        name: name.to_string(),
        phase,
        consecutive_failures: 0,
        retry_count: 0,
        last_checked_at: None,
        last_transition_at: Utc::now(),
        last_result: None,
        last_latency_ms: None,
        blocked_by: Vec::new(),
        failure: None,
    }
}

#[test]
fn test_verdict_all_healthy() {
    let services = [
        snapshot("db", ServicePhase::Healthy),
        snapshot("api", ServicePhase::Healthy),
    ];
    assert_eq!(Verdict::of(&services, false), Verdict::AllHealthy);
    assert_eq!(Verdict::AllHealthy.exit_code(), 0);
}

#[test]
fn test_verdict_ignores_stopped_services() {
    let services = [
        snapshot("db", ServicePhase::Healthy),
        snapshot("batch", ServicePhase::Stopped),
    ];
    assert_eq!(Verdict::of(&services, false), Verdict::AllHealthy);
    assert_eq!(Verdict::of(&[], false), Verdict::AllHealthy);
}

#[test]
fn test_verdict_degraded_on_unhealthy() {
    let services = [
        snapshot("db", ServicePhase::Healthy),
        snapshot("api", ServicePhase::Unhealthy),
        snapshot("web", ServicePhase::Starting),
    ];
    assert_eq!(Verdict::of(&services, false), Verdict::Degraded);
    assert_eq!(Verdict::Degraded.exit_code(), 1);
}

#[test]
fn test_verdict_critical_on_failed() {
    let services = [
        snapshot("db", ServicePhase::Failed),
        snapshot("api", ServicePhase::Unhealthy),
    ];
    assert_eq!(Verdict::of(&services, false), Verdict::Critical);
    assert_eq!(Verdict::Critical.exit_code(), 2);
}

#[test]
fn test_verdict_critical_when_halted() {
    let services = [snapshot("db", ServicePhase::Healthy)];
    assert_eq!(Verdict::of(&services, true), Verdict::Critical);
}

#[test]
fn test_verdict_converging_while_starting() {
    let services = [
        snapshot("db", ServicePhase::Healthy),
        snapshot("api", ServicePhase::Starting),
        snapshot("web", ServicePhase::Pending),
    ];
    assert_eq!(Verdict::of(&services, false), Verdict::Converging);
    assert_eq!(Verdict::Converging.exit_code(), 3);
}

#[test]
fn test_status_json_round_trip() {
    let mut db = snapshot("db", ServicePhase::Failed);
    db.consecutive_failures = 4;
    db.last_result = Some(HealthResult::TimedOut);
    db.failure = Some(FailureCause::RetriesExhausted {
        failures: 4,
        last_error: "timed out".to_string(),
    });
    let mut api = snapshot("api", ServicePhase::Pending);
    api.blocked_by = vec!["db".to_string()];

    let status = AggregatedStatus::from_services("edge", vec![db, api], None);
    let json = status.to_json().unwrap();
    assert!(json.contains("\"verdict\": \"critical\""));
    assert!(json.contains("\"phase\": \"failed\""));
    assert!(!json.contains("halted"));

    let parsed = AggregatedStatus::from_json(&json).unwrap();
    assert_eq!(parsed, status);
    assert_eq!(parsed.exit_code(), 2);
}

#[test]
fn test_status_read_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status.json");

    let status = AggregatedStatus::from_services(
        "edge",
        vec![snapshot("db", ServicePhase::Healthy)],
        Some("supervisor edge failed: state transition requested for unknown service x".to_string()),
    );
    std::fs::write(&path, status.to_json().unwrap()).unwrap();

    let loaded = AggregatedStatus::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(loaded.verdict, Verdict::Critical);
    assert!(loaded.halted.is_some());
}

#[test]
fn test_stopped_supervisor_never_reads_as_healthy() {
    let services = vec![
        snapshot("db", ServicePhase::Stopped),
        snapshot("api", ServicePhase::Stopped),
    ];
    let mut status = AggregatedStatus::from_services("edge", services, None);
    assert_eq!(status.verdict, Verdict::AllHealthy);
    assert!(!status.to_json().unwrap().contains("\"stopped\": true"));

    status.mark_stopped();
    assert_eq!(status.verdict, Verdict::Critical);
    assert_eq!(status.exit_code(), 2);
    assert!(status.render_text().contains("stopped: supervisor has shut down"));

    let loaded = AggregatedStatus::from_json(&status.to_json().unwrap()).unwrap();
    assert!(loaded.stopped);
    assert_eq!(loaded.exit_code(), 2);
}

#[test]
fn test_render_text_lists_every_service() {
    let mut api = snapshot("api", ServicePhase::Pending);
    api.blocked_by = vec!["db".to_string()];
    let mut db = snapshot("db", ServicePhase::Unhealthy);
    db.consecutive_failures = 2;
    db.last_latency_ms = Some(12);
    db.last_result = Some(HealthResult::Unhealthy("503".to_string()));

    let status = AggregatedStatus::from_services("edge", vec![db, api], None);
    let text = status.render_text();

    assert!(text.starts_with("edge: DEGRADED"));
    let db_line = text.lines().find(|l| l.trim_start().starts_with("db ")).unwrap();
    assert!(db_line.contains("unhealthy"));
    assert!(db_line.contains("12ms"));
    assert!(db_line.contains("unhealthy: 503"));
    let api_line = text.lines().find(|l| l.trim_start().starts_with("api ")).unwrap();
    assert!(api_line.contains("waiting for db"));
    assert_eq!(status.to_string(), text);
}

#[tokio::test]
async fn test_sweep_probes_every_service_once() {
    let registry = Registry::load([
        service("db"),
        service("api").depends_on("db"),
        service("cache"),
    ])
    .unwrap();
    let probe = ScriptedProbe::new();
    probe.fail("api", "503");

    let status = sweep("edge", &registry, Arc::new(probe.clone())).await;

    assert_eq!(status.supervisor, "edge");
    let names: Vec<&str> = status.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["db", "api", "cache"]);
    assert_eq!(status.phase_of("db"), Some(ServicePhase::Healthy));
    assert_eq!(status.phase_of("api"), Some(ServicePhase::Unhealthy));
    assert_eq!(status.verdict, Verdict::Degraded);
    assert!(status.services.iter().all(|s| s.last_latency_ms.is_some()));

    for name in ["db", "api", "cache"] {
        assert_eq!(probe.calls(name), 1);
    }
}
