//! Active health checking.
//!
//! One [`HealthCheckTask`] per probed endpoint runs a periodic probe and feeds
//! the endpoint's shared [`EndpointHealth`] state machine. The
//! [`HealthCheckManager`] reconciles tasks against the backend table after every
//! reload: surviving endpoints keep their task and counters, new endpoints get a
//! task, and tasks of removed endpoints are stopped.
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use scc::HashMap;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::health_probe::{HttpProbe, TcpProbe},
    config::{HealthCheckConfig, HealthStatus, ProbeKind},
    core::backend::{Backend, BackendTable, EndpointHealth, EndpointKey, Protocol},
    metrics::ProbeTimer,
    ports::health_probe::{HealthProbe, ProbeError, ProbeTarget},
    tracing_setup::component_span,
};

/// Periodic probe of a single endpoint.
pub struct HealthCheckTask {
    backend: String,
    key: EndpointKey,
    target: ProbeTarget,
    config: HealthCheckConfig,
    health: Arc<EndpointHealth>,
    probe: Arc<dyn HealthProbe>,
    cancel: CancellationToken,
    // Held while recording an outcome; `stop` takes it so nothing is recorded after it returns.
    stopped: Mutex<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthCheckTask {
    pub fn new(
        backend: impl Into<String>,
        key: EndpointKey,
        target: ProbeTarget,
        config: HealthCheckConfig,
        health: Arc<EndpointHealth>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            backend: backend.into(),
            key,
            target,
            config,
            health,
            probe,
            cancel: CancellationToken::new(),
            stopped: Mutex::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn health(&self) -> &Arc<EndpointHealth> {
        &self.health
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probe once and feed the state machine. Returns the new status on a transition.
    pub async fn run_once(&self) -> Option<HealthStatus> {
        let outcome = {
            let _timer = ProbeTimer::new(&self.backend);
            match timeout(
                Duration::from_secs(self.config.timeout_secs),
                self.probe.probe(&self.target, &self.config),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(self.config.timeout_secs)),
            }
        };
        self.record(outcome)
    }

    fn record(&self, outcome: Result<(), ProbeError>) -> Option<HealthStatus> {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return None;
        }

        let transition = match &outcome {
            Ok(()) => self.health.record_success(self.config.success_threshold),
            Err(_) => self.health.record_failure(self.config.failure_threshold),
        };

        match (&outcome, transition) {
            (_, Some(HealthStatus::Healthy)) => tracing::info!(
                backend = %self.backend,
                endpoint = %self.key,
                successes = self.health.consecutive_successes(),
                "endpoint is now HEALTHY"
            ),
            (Err(e), Some(HealthStatus::Unhealthy)) => tracing::warn!(
                backend = %self.backend,
                endpoint = %self.key,
                failures = self.health.consecutive_failures(),
                error = %e,
                "endpoint is now UNHEALTHY"
            ),
            (Err(e), _) => tracing::debug!(
                backend = %self.backend,
                endpoint = %self.key,
                failures = self.health.consecutive_failures(),
                error = %e,
                "health probe failed"
            ),
            _ => {}
        }
        transition
    }

    /// Spawn the probe loop on the current runtime. No-op if already started or stopped.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let task = Arc::clone(self);
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = task.cancel.cancelled() => break,
                            _ = task.run_once() => {}
                        }
                    }
                }
            }
            tracing::debug!(backend = %task.backend, endpoint = %task.key, "health check task exited");
        }
        .instrument(component_span("health_check"))));
    }

    /// Cancel the timer. Idempotent; returns false if already stopped.
    pub fn stop(&self) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return false;
        }
        *stopped = true;
        self.cancel.cancel();
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        true
    }
}

type TaskKey = (String, EndpointKey);

/// Owns the health check tasks of every probed endpoint.
pub struct HealthCheckManager {
    defaults: ArcSwap<HealthCheckConfig>,
    tasks: HashMap<TaskKey, Arc<HealthCheckTask>>,
    tcp_probe: Arc<dyn HealthProbe>,
    http_probe: Arc<dyn HealthProbe>,
    running: AtomicBool,
}

impl HealthCheckManager {
    pub fn new(defaults: HealthCheckConfig) -> Self {
        Self::with_probes(defaults, Arc::new(TcpProbe::new()), Arc::new(HttpProbe::new()))
    }

    pub fn with_probes(
        defaults: HealthCheckConfig,
        tcp_probe: Arc<dyn HealthProbe>,
        http_probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            defaults: ArcSwap::from_pointee(defaults),
            tasks: HashMap::new(),
            tcp_probe,
            http_probe,
            running: AtomicBool::new(false),
        }
    }

    pub fn set_defaults(&self, defaults: HealthCheckConfig) {
        self.defaults.store(Arc::new(defaults));
    }

    /// Probe config in effect for `backend`: its override, else the defaults.
    pub fn effective_config(&self, backend: &Backend) -> HealthCheckConfig {
        backend
            .health_check()
            .cloned()
            .unwrap_or_else(|| HealthCheckConfig::clone(&self.defaults.load()))
    }

    fn probe_for(&self, kind: ProbeKind) -> Arc<dyn HealthProbe> {
        match kind {
            ProbeKind::Tcp => self.tcp_probe.clone(),
            ProbeKind::Http => self.http_probe.clone(),
        }
    }

    /// Bring the task set in line with `backends`.
    pub fn reconcile(&self, backends: &BackendTable) {
        let mut wanted: HashSet<TaskKey> = HashSet::new();
        let mut created = 0usize;

        for backend in backends.values() {
            let config = self.effective_config(backend);
            if !config.enabled {
                for endpoint in backend.endpoints() {
                    endpoint.health().mark_healthy();
                }
                continue;
            }

            for endpoint in backend.endpoints() {
                let key = (backend.name().to_string(), endpoint.key().clone());
                let target = ProbeTarget::new(
                    endpoint.host(),
                    backend.port_for(endpoint, Protocol::Http),
                );
                wanted.insert(key.clone());

                let unchanged = self
                    .tasks
                    .read(&key, |_, task| {
                        task.config() == &config
                            && task.target() == &target
                            && Arc::ptr_eq(task.health(), endpoint.health())
                    })
                    .unwrap_or(false);
                if unchanged {
                    continue;
                }

                let task = Arc::new(HealthCheckTask::new(
                    backend.name(),
                    endpoint.key().clone(),
                    target,
                    config.clone(),
                    endpoint.health().clone(),
                    self.probe_for(config.kind),
                ));
                if let Some(previous) = self.tasks.upsert(key, task.clone()) {
                    previous.stop();
                }
                if self.running.load(Ordering::Acquire) {
                    task.start();
                }
                created += 1;
            }
        }

        let mut removed = 0usize;
        self.tasks.retain(|key, task| {
            let keep = wanted.contains(key);
            if !keep {
                task.stop();
                removed += 1;
            }
            keep
        });

        tracing::info!(
            tasks = self.tasks.len(),
            created,
            removed,
            "health check tasks reconciled"
        );
    }

    /// Start every task; tasks added by later reconciles start immediately.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        self.tasks.scan(|_, task| task.start());
    }

    pub fn stop_all(&self) {
        self.running.store(false, Ordering::Release);
        self.tasks.retain(|_, task| {
            task.stop();
            false
        });
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, backend: &str, key: &EndpointKey) -> Option<Arc<HealthCheckTask>> {
        self.tasks
            .read(&(backend.to_string(), key.clone()), |_, task| task.clone())
    }
}

impl Drop for HealthCheckManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
