use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use crate::{
    config::{
        BackendConfig, EndpointConfig, HealthCheckConfig, HealthStatus, LoadBalanceStrategy,
        PortConfig, RateLimitConfig,
    },
    core::{
        error::EntityError,
        load_balancer::{LoadBalancer, LoadBalancerFactory},
    },
    metrics::set_endpoint_health_status,
};

// Constants for health status to replace magic numbers
const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Protocols an endpoint can be reached with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Grpc,
}

impl Protocol {
    /// Port used when neither the endpoint nor its backend configures one.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Grpc => 50051,
        }
    }

    fn port_in(&self, ports: &PortConfig) -> Option<u16> {
        match self {
            Protocol::Http => ports.http,
            Protocol::Grpc => ports.grpc,
        }
    }
}

/// Identity of an endpoint: `(host, ports, priority)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub ports: Option<PortConfig>,
    pub priority: i32,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ports {
            Some(PortConfig {
                http: Some(port), ..
            }) => write!(f, "{}:{}@p{}", self.host, port, self.priority),
            _ => write!(f, "{}@p{}", self.host, self.priority),
        }
    }
}

/// Health state machine of one endpoint.
///
/// The externally visible flag only flips once the consecutive success or failure
/// count reaches the configured threshold. All fields are atomics so probes and
/// the request path never contend on a lock.
#[derive(Debug)]
pub struct EndpointHealth {
    label: String,
    status: AtomicU8, // Uses HEALTH_STATUS_* constants
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl EndpointHealth {
    /// New tracker, initially healthy.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Record a successful probe. Returns the new status if this probe caused a transition.
    pub fn record_success(&self, success_threshold: u32) -> Option<HealthStatus> {
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        self.consecutive_failures.store(0, Ordering::Release);

        if successes >= success_threshold
            && self
                .status
                .compare_exchange(
                    HEALTH_STATUS_UNHEALTHY,
                    HEALTH_STATUS_HEALTHY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            set_endpoint_health_status(&self.label, true);
            return Some(HealthStatus::Healthy);
        }
        None
    }

    /// Record a failed probe. Returns the new status if this probe caused a transition.
    pub fn record_failure(&self, failure_threshold: u32) -> Option<HealthStatus> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.consecutive_successes.store(0, Ordering::Release);

        if failures >= failure_threshold
            && self
                .status
                .compare_exchange(
                    HEALTH_STATUS_HEALTHY,
                    HEALTH_STATUS_UNHEALTHY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            set_endpoint_health_status(&self.label, false);
            return Some(HealthStatus::Unhealthy);
        }
        None
    }

    /// Force healthy and clear counters (endpoints without a probe).
    pub fn mark_healthy(&self) {
        self.status.store(HEALTH_STATUS_HEALTHY, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        set_endpoint_health_status(&self.label, true);
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// One upstream address of a backend.
#[derive(Debug)]
pub struct Endpoint {
    key: EndpointKey,
    health: Arc<EndpointHealth>,
}

impl Endpoint {
    pub fn new(key: EndpointKey, health: Arc<EndpointHealth>) -> Self {
        Self { key, health }
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn priority(&self) -> i32 {
        self.key.priority
    }

    pub fn ports(&self) -> Option<&PortConfig> {
        self.key.ports.as_ref()
    }

    pub fn health(&self) -> &Arc<EndpointHealth> {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

/// A named backend service: endpoints, strategy and limits.
///
/// Owns its load balancer, so replacing a `Backend` on reload also resets
/// round-robin cursors and least-connection counts.
pub struct Backend {
    name: String,
    strategy: LoadBalanceStrategy,
    ports: Option<PortConfig>,
    endpoints: Vec<Arc<Endpoint>>,
    rate_limit: Option<RateLimitConfig>,
    health_check: Option<HealthCheckConfig>,
    load_balancer: Box<dyn LoadBalancer>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("ports", &self.ports)
            .field("endpoints", &self.endpoints)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

impl Backend {
    /// Build a backend from configuration with fresh health trackers.
    pub fn from_config(config: &BackendConfig) -> Result<Self, EntityError> {
        Self::build(config, None)
    }

    /// Build a backend, reusing the health trackers of `previous` for endpoints
    /// whose identity did not change.
    pub fn build(config: &BackendConfig, previous: Option<&Backend>) -> Result<Self, EntityError> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(EntityError::EmptyBackendName);
        }
        if config.endpoints.is_empty() {
            return Err(EntityError::NoEndpoints(name.to_string()));
        }
        if let Some(ports) = &config.ports {
            validate_ports(ports, || format!("backend '{name}'"))?;
        }

        let endpoints = config
            .endpoints
            .iter()
            .map(|ep| -> Result<Arc<Endpoint>, EntityError> {
                let key = endpoint_key(name, ep)?;
                let health = previous
                    .and_then(|prev| prev.endpoint(&key))
                    .map(|prev| prev.health().clone())
                    .unwrap_or_else(|| Arc::new(EndpointHealth::new(format!("{name}/{key}"))));
                Ok(Arc::new(Endpoint::new(key, health)))
            })
            .collect::<Result<Vec<_>, EntityError>>()?;

        Ok(Self {
            name: name.to_string(),
            strategy: config.load_balance,
            ports: config.ports,
            endpoints,
            rate_limit: config.rate_limit,
            health_check: config.health_check.clone(),
            load_balancer: LoadBalancerFactory::create(&config.load_balance),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    pub fn ports(&self) -> Option<&PortConfig> {
        self.ports.as_ref()
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, key: &EndpointKey) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.key() == key)
    }

    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.rate_limit.as_ref()
    }

    /// Probe override for this backend, if any.
    pub fn health_check(&self) -> Option<&HealthCheckConfig> {
        self.health_check.as_ref()
    }

    pub fn load_balancer(&self) -> &dyn LoadBalancer {
        self.load_balancer.as_ref()
    }

    /// Endpoint identities as an unordered set.
    pub fn endpoint_keys(&self) -> HashSet<&EndpointKey> {
        self.endpoints.iter().map(|e| e.key()).collect()
    }

    /// Whether connections bound to `self` can keep running against `other`:
    /// same endpoint set (unordered) and same port configuration.
    pub fn same_topology(&self, other: &Backend) -> bool {
        self.ports == other.ports && self.endpoint_keys() == other.endpoint_keys()
    }

    /// Effective port of `endpoint` for `protocol`: endpoint override, then
    /// backend port map, then the protocol default.
    pub fn port_for(&self, endpoint: &Endpoint, protocol: Protocol) -> u16 {
        endpoint
            .ports()
            .and_then(|p| protocol.port_in(p))
            .or_else(|| self.ports.as_ref().and_then(|p| protocol.port_in(p)))
            .unwrap_or_else(|| protocol.default_port())
    }
}

fn validate_ports(ports: &PortConfig, context: impl Fn() -> String) -> Result<(), EntityError> {
    if ports.http == Some(0) || ports.grpc == Some(0) {
        return Err(EntityError::InvalidPort { context: context() });
    }
    Ok(())
}

fn endpoint_key(backend: &str, config: &EndpointConfig) -> Result<EndpointKey, EntityError> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(EntityError::EmptyEndpointHost {
            backend: backend.to_string(),
        });
    }
    if let Some(ports) = &config.ports {
        validate_ports(ports, || format!("endpoint '{host}' of backend '{backend}'"))?;
    }
    Ok(EndpointKey {
        host: host.to_string(),
        ports: config.ports,
        priority: config.priority,
    })
}

/// Immutable name → backend map held by the registry.
#[derive(Debug, Default)]
pub struct BackendTable {
    backends: HashMap<String, Arc<Backend>>,
}

impl BackendTable {
    /// Build a complete table; any invalid or duplicate entry fails the whole build.
    pub fn build(
        configs: &[BackendConfig],
        previous: Option<&BackendTable>,
    ) -> Result<Self, EntityError> {
        let mut backends = HashMap::with_capacity(configs.len());
        for config in configs {
            let prev = previous.and_then(|p| p.get(config.name.trim()));
            let backend = Backend::build(config, prev.map(|b| b.as_ref()))?;
            if backends.contains_key(backend.name()) {
                return Err(EntityError::DuplicateBackend(backend.name().to_string()));
            }
            backends.insert(backend.name().to_string(), Arc::new(backend));
        }
        Ok(Self { backends })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Backend>)> {
        self.backends.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.values()
    }

    /// Key-set equality (size and membership), not deep equality.
    pub fn same_keys(&self, other: &BackendTable) -> bool {
        self.backends.len() == other.backends.len()
            && self.backends.keys().all(|k| other.backends.contains_key(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_config(endpoints: Vec<EndpointConfig>) -> BackendConfig {
        BackendConfig::new("svc", endpoints)
    }

    #[test]
    fn test_endpoint_health_initial_state() {
        let health = EndpointHealth::new("svc/a");
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert_eq!(health.consecutive_successes(), 0);
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn test_health_transitions_respect_thresholds() {
        let health = EndpointHealth::new("svc/a");

        assert_eq!(health.record_failure(2), None);
        assert!(health.is_healthy());
        assert_eq!(health.record_failure(2), Some(HealthStatus::Unhealthy));
        assert!(!health.is_healthy());
        assert_eq!(health.record_failure(2), None);

        assert_eq!(health.record_success(2), None);
        assert_eq!(health.consecutive_failures(), 0);
        assert!(!health.is_healthy());
        assert_eq!(health.record_success(2), Some(HealthStatus::Healthy));
        assert!(health.is_healthy());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let health = EndpointHealth::new("svc/a");
        health.record_failure(3);
        health.record_failure(3);
        health.record_success(1);
        assert_eq!(health.record_failure(3), None);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_backend_rejects_invalid_config() {
        let err = Backend::from_config(&BackendConfig::new("  ", vec![])).unwrap_err();
        assert_eq!(err, EntityError::EmptyBackendName);

        let err = Backend::from_config(&backend_config(vec![])).unwrap_err();
        assert_eq!(err, EntityError::NoEndpoints("svc".to_string()));

        let err = Backend::from_config(&backend_config(vec![EndpointConfig::new("", 1)]))
            .unwrap_err();
        assert!(matches!(err, EntityError::EmptyEndpointHost { .. }));
    }

    #[test]
    fn test_port_resolution_order() {
        let mut ep = EndpointConfig::new("10.0.0.1", 1);
        ep.ports = Some(PortConfig {
            http: Some(8081),
            grpc: None,
        });
        let config = backend_config(vec![ep, EndpointConfig::new("10.0.0.2", 1)]).with_ports(
            PortConfig {
                http: Some(8080),
                grpc: Some(9848),
            },
        );
        let backend = Backend::from_config(&config).unwrap();
        let (a, b) = (&backend.endpoints()[0], &backend.endpoints()[1]);

        assert_eq!(backend.port_for(a, Protocol::Http), 8081);
        assert_eq!(backend.port_for(a, Protocol::Grpc), 9848);
        assert_eq!(backend.port_for(b, Protocol::Http), 8080);

        let bare = Backend::from_config(&backend_config(vec![EndpointConfig::new("h", 1)])).unwrap();
        assert_eq!(
            bare.port_for(&bare.endpoints()[0], Protocol::Grpc),
            Protocol::Grpc.default_port()
        );
    }

    #[test]
    fn test_same_topology_ignores_endpoint_order() {
        let a = Backend::from_config(&backend_config(vec![
            EndpointConfig::new("h1", 1),
            EndpointConfig::new("h2", 2),
        ]))
        .unwrap();
        let b = Backend::from_config(&backend_config(vec![
            EndpointConfig::new("h2", 2),
            EndpointConfig::new("h1", 1),
        ]))
        .unwrap();
        assert!(a.same_topology(&b));

        let c = Backend::from_config(&backend_config(vec![
            EndpointConfig::new("h1", 1),
            EndpointConfig::new("h2", 1),
        ]))
        .unwrap();
        assert!(!a.same_topology(&c));

        let d = Backend::from_config(
            &backend_config(vec![
                EndpointConfig::new("h1", 1),
                EndpointConfig::new("h2", 2),
            ])
            .with_ports(PortConfig {
                http: Some(8080),
                grpc: None,
            }),
        )
        .unwrap();
        assert!(!a.same_topology(&d));
    }

    #[test]
    fn test_rebuild_shares_health_of_unchanged_endpoints() {
        let first = backend_config(vec![
            EndpointConfig::new("h1", 1),
            EndpointConfig::new("h2", 1),
        ]);
        let old = Backend::from_config(&first).unwrap();
        old.endpoints()[0].health().record_failure(1);

        let second = backend_config(vec![
            EndpointConfig::new("h1", 1),
            EndpointConfig::new("h3", 1),
        ]);
        let new = Backend::build(&second, Some(&old)).unwrap();
        assert!(Arc::ptr_eq(
            new.endpoints()[0].health(),
            old.endpoints()[0].health()
        ));
        assert!(!new.endpoints()[0].is_healthy());
        assert!(new.endpoints()[1].is_healthy());
    }

    #[test]
    fn test_backend_table_rejects_duplicates() {
        let configs = vec![
            backend_config(vec![EndpointConfig::new("h1", 1)]),
            backend_config(vec![EndpointConfig::new("h2", 1)]),
        ];
        let err = BackendTable::build(&configs, None).unwrap_err();
        assert_eq!(err, EntityError::DuplicateBackend("svc".to_string()));
    }
}
