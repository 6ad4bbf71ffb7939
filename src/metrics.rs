//! Metrics helpers for gatehouse.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded; the
//! embedding application installs whatever recorder it wants.
//!
//! Provided metrics:
//! * `gatehouse_admission_rejected_total` (counter, labels `tier`, `kind`)
//! * `gatehouse_connections_invalidated_total` (counter, label `reason`)
//! * `gatehouse_active_connections` (gauge)
//! * `gatehouse_endpoint_health` (gauge per `backend`, `endpoint`)
//! * `gatehouse_registry_version` (gauge)
//! * `gatehouse_health_probe_duration_seconds` (histogram per `backend`)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const GATEHOUSE_ADMISSION_REJECTED_TOTAL: &str = "gatehouse_admission_rejected_total";
pub const GATEHOUSE_CONNECTIONS_INVALIDATED_TOTAL: &str =
    "gatehouse_connections_invalidated_total";
pub const GATEHOUSE_ACTIVE_CONNECTIONS: &str = "gatehouse_active_connections";
pub const GATEHOUSE_ENDPOINT_HEALTH: &str = "gatehouse_endpoint_health";
pub const GATEHOUSE_REGISTRY_VERSION: &str = "gatehouse_registry_version";
pub const GATEHOUSE_HEALTH_PROBE_DURATION_SECONDS: &str =
    "gatehouse_health_probe_duration_seconds";

/// Last reported health value per endpoint label.
pub static ENDPOINT_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        GATEHOUSE_ADMISSION_REJECTED_TOTAL,
        Unit::Count,
        "Requests or connections refused by admission control."
    );
    describe_counter!(
        GATEHOUSE_CONNECTIONS_INVALIDATED_TOTAL,
        Unit::Count,
        "Connections closed because a reload made their binding stale."
    );
    describe_gauge!(
        GATEHOUSE_ACTIVE_CONNECTIONS,
        "Number of tracked proxy connections."
    );
    describe_gauge!(
        GATEHOUSE_ENDPOINT_HEALTH,
        "Endpoint health (1 for healthy, 0 for unhealthy)"
    );
    describe_gauge!(
        GATEHOUSE_REGISTRY_VERSION,
        "Current registry snapshot version."
    );
    describe_histogram!(
        GATEHOUSE_HEALTH_PROBE_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of active health probes."
    );

    Mutex::new(HashMap::new())
});

/// Record an endpoint health flip. `label` is `backend/endpoint`.
pub fn set_endpoint_health_status(label: &str, is_healthy: bool) {
    let value = if is_healthy { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = ENDPOINT_HEALTH_GAUGES.lock() {
        gauges.insert(label.to_string(), value);
    } else {
        tracing::error!("Failed to acquire lock for endpoint health gauges");
        return;
    }

    let (backend, endpoint) = label.split_once('/').unwrap_or((label, ""));
    gauge!(
        GATEHOUSE_ENDPOINT_HEALTH,
        "backend" => backend.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .set(value);
}

/// Count one admission rejection. `kind` is `qps` or `connection`.
pub fn increment_admission_rejected(tier: &'static str, kind: &'static str) {
    counter!(GATEHOUSE_ADMISSION_REJECTED_TOTAL, "tier" => tier, "kind" => kind).increment(1);
}

pub fn increment_connections_invalidated(reason: &'static str) {
    counter!(GATEHOUSE_CONNECTIONS_INVALIDATED_TOTAL, "reason" => reason).increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!(GATEHOUSE_ACTIVE_CONNECTIONS).set(count as f64);
}

pub fn set_registry_version(version: u64) {
    gauge!(GATEHOUSE_REGISTRY_VERSION).set(version as f64);
}

/// RAII helper measuring one health probe.
pub struct ProbeTimer {
    start: Instant,
    backend: String,
}

impl ProbeTimer {
    pub fn new(backend: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
        }
    }
}

impl Drop for ProbeTimer {
    fn drop(&mut self) {
        histogram!(
            GATEHOUSE_HEALTH_PROBE_DURATION_SECONDS,
            "backend" => self.backend.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&ENDPOINT_HEALTH_GAUGES);
    tracing::debug!("metric descriptions registered");
    Ok(())
}

/// Snapshot of endpoint health gauges, keyed by endpoint label.
pub fn get_current_metrics() -> HashMap<String, f64> {
    ENDPOINT_HEALTH_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_endpoint_health_status() {
        set_endpoint_health_status("metrics-test/10.0.0.1@p1", true);
        assert_eq!(
            get_current_metrics().get("metrics-test/10.0.0.1@p1"),
            Some(&1.0)
        );

        set_endpoint_health_status("metrics-test/10.0.0.1@p1", false);
        assert_eq!(
            get_current_metrics().get("metrics-test/10.0.0.1@p1"),
            Some(&0.0)
        );
    }

    #[test]
    fn test_probe_timer() {
        let timer = ProbeTimer::new("svc");
        // Duration is recorded on drop
        drop(timer);
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
    }
}
