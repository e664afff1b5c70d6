#![allow(dead_code)]

use ash_warden::{
    AggregatedStatus, ControlError, HealthCheck, HealthProbe, HealthResult, RestartPolicy,
    ServiceControl, ServiceSpec, StatusReporter,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Probe whose answer per service can be flipped while a supervisor runs.
/// Services without an answer are healthy. A service marked with
/// [`ScriptedProbe::hang`] never gets an answer at all.
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    inner: Arc<Mutex<ProbeScript>>,
}

#[derive(Default)]
struct ProbeScript {
    results: HashMap<String, HealthResult>,
    hanging: HashSet<String>,
    calls: HashMap<String, u32>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, service: &str, result: HealthResult) {
        let mut script = self.inner.lock().unwrap();
        script.hanging.remove(service);
        script.results.insert(service.to_string(), result);
    }

    /// Every later check of `service` stays pending forever.
    pub fn hang(&self, service: &str) {
        self.inner
            .lock()
            .unwrap()
            .hanging
            .insert(service.to_string());
    }

    pub fn fail(&self, service: &str, reason: &str) {
        self.set(service, HealthResult::Unhealthy(reason.to_string()));
    }

    pub fn heal(&self, service: &str) {
        self.set(service, HealthResult::Healthy);
    }

    pub fn calls(&self, service: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(service)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, spec: &ServiceSpec) -> HealthResult {
        let answer = {
            let mut script = self.inner.lock().unwrap();
            *script.calls.entry(spec.name.clone()).or_default() += 1;
            if script.hanging.contains(&spec.name) {
                None
            } else {
                Some(
                    script
                        .results
                        .get(&spec.name)
                        .cloned()
                        .unwrap_or(HealthResult::Healthy),
                )
            }
        };
        match answer {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// Control that records every lifecycle call as `"<action> <service>"`.
#[derive(Clone, Default)]
pub struct RecordingControl {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, action: &str) -> Vec<String> {
        let prefix = format!("{} ", action);
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, action: &str, spec: &ServiceSpec) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", action, spec.name));
    }
}

#[async_trait]
impl ServiceControl for RecordingControl {
    async fn start(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.record("start", spec);
        Ok(())
    }

    async fn stop(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.record("stop", spec);
        Ok(())
    }

    async fn kill(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.record("kill", spec);
        Ok(())
    }

    async fn restart(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.record("restart", spec);
        Ok(())
    }
}

/// Service with a short check timeout and fast backoff.
pub fn service(name: &str) -> ServiceSpec {
    ServiceSpec::new(
        name,
        HealthCheck::tcp("127.0.0.1", 1).with_timeout(Duration::from_millis(100)),
    )
    .with_poll_interval(Duration::from_secs(1))
    .with_restart_policy(RestartPolicy::new(
        3,
        Duration::from_millis(10),
        Duration::from_millis(100),
    ))
}

/// Waits (in virtual time) until `predicate` holds.
pub async fn wait_until<F>(reporter: &mut StatusReporter, predicate: F) -> AggregatedStatus
where
    F: FnMut(&AggregatedStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), reporter.wait_for(predicate))
        .await
        .expect("condition not reached")
}
