//! Core gateway orchestration service.
//!
//! `GatewayService` owns the registry, the rate limit tiers, the connection
//! table and the active health checker, and wires them together:
//! * host → route → backend → endpoint resolution
//! * connection admission and per-request QPS checks
//! * configuration (re)application with stale connection invalidation
//! * background tasks: health probing, idle client eviction, config watching
//!
//! No socket I/O happens here; the proxy data path calls into this service
//! and moves bytes itself.
use std::{
    fmt,
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::health_checker::HealthCheckManager,
    config::GatewayConfig,
    core::{
        backend::{Backend, Endpoint, Protocol},
        connection::{ConnectionLease, ConnectionManager},
        error::{EntityKind, GatewayError, GatewayResult},
        load_balancer::EndpointSelector,
        rate_limit_manager::RateLimitManager,
        registry::GatewayRegistry,
        route::{Route, RouteTable},
        route_matcher::{RouteMatcher, normalize_host},
    },
    ports::config_provider::ConfigProvider,
    tracing_setup::{component_span, connection_span},
};

/// Where a request for a host should go.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub route: Arc<Route>,
    pub backend: Arc<Backend>,
    pub endpoint: Arc<Endpoint>,
}

impl Resolution {
    /// Effective port of the selected endpoint.
    pub fn port(&self, protocol: Protocol) -> u16 {
        self.backend.port_for(&self.endpoint, protocol)
    }
}

/// Central orchestrator. Share it behind an `Arc`.
pub struct GatewayService {
    registry: Arc<GatewayRegistry>,
    matcher: RouteMatcher,
    rate_limits: Arc<RateLimitManager>,
    connections: ConnectionManager,
    health: Arc<HealthCheckManager>,
    config: Arc<ArcSwap<GatewayConfig>>,
    reload_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayService")
            .field("registry", &self.registry)
            .field("connections", &self.connections.active_connection_count())
            .field("health_tasks", &self.health.task_count())
            .finish()
    }
}

impl GatewayService {
    /// Build the service and apply the initial configuration.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let health = Arc::new(HealthCheckManager::new(config.health_check.clone()));
        Self::with_health_manager(config, health)
    }

    /// Like [`new`](Self::new) with a caller supplied health checker (custom probes).
    pub fn with_health_manager(
        config: GatewayConfig,
        health: Arc<HealthCheckManager>,
    ) -> GatewayResult<Self> {
        let registry = Arc::new(GatewayRegistry::new());
        let rate_limits = Arc::new(RateLimitManager::new(config.server.rate_limit));
        let connections = ConnectionManager::new(rate_limits.clone()).with_registry(&registry);
        registry.add_listener(Arc::new(connections.clone()));

        let service = Self {
            matcher: RouteMatcher::new(registry.clone()),
            registry,
            rate_limits,
            connections,
            health,
            config: Arc::new(ArcSwap::from_pointee(config.clone())),
            reload_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        };
        service.apply_config(config)?;
        Ok(service)
    }

    /// Apply a complete configuration. Returns the registry version afterwards.
    ///
    /// Route patterns are compiled up front so a bad route list leaves the
    /// running configuration untouched.
    pub fn apply_config(&self, config: GatewayConfig) -> GatewayResult<u64> {
        let _guard = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        RouteTable::build(&config.routes).map_err(|source| {
            GatewayError::RegistryUpdateFailed {
                kind: EntityKind::Routes,
                source,
            }
        })?;

        self.registry.update_backends(&config.backends)?;

        self.rate_limits
            .update_server_rate_limit_config(config.server.rate_limit);
        for backend in &config.backends {
            self.rate_limits.update_backend_limiter(&backend.name, backend);
        }
        for name in self.rate_limits.backend_names() {
            if config.backend(&name).is_none() {
                self.rate_limits.remove_backend_limiter(&name);
            }
        }

        let version = self.registry.update_routes(&config.routes)?;

        self.health.set_defaults(config.health_check.clone());
        let snapshot = self.registry.snapshot();
        self.health.reconcile(&snapshot.backends);

        // Registry events only fire on key set changes; in-place edits are caught here.
        let invalidated = self
            .connections
            .disconnect_invalid_connections(&snapshot.routes, &snapshot.backends);

        tracing::info!(
            version,
            routes = snapshot.routes.len(),
            backends = snapshot.backends.len(),
            invalidated,
            "configuration applied"
        );
        self.config.store(Arc::new(config));
        Ok(version)
    }

    /// Route, backend and endpoint for `host`.
    pub fn resolve(&self, host: &str) -> GatewayResult<Resolution> {
        let host = normalize_host(host);
        let route = self
            .matcher
            .find(host)
            .ok_or_else(|| GatewayError::RouteNotFound {
                host: host.to_string(),
            })?;
        let backend = self.registry.get_backend(route.backend()).ok_or_else(|| {
            GatewayError::BackendNotFound {
                name: route.backend().to_string(),
            }
        })?;
        let endpoint =
            EndpointSelector::select(&backend).ok_or_else(|| GatewayError::NoHealthyEndpoint {
                backend: backend.name().to_string(),
            })?;
        Ok(Resolution {
            route,
            backend,
            endpoint,
        })
    }

    /// Resolve `host` and admit a new connection from `client_ip`.
    ///
    /// A reload landing between resolution and tracking triggers one fresh
    /// resolution against the new configuration.
    pub fn admit(&self, host: &str, client_ip: IpAddr) -> GatewayResult<ConnectionLease> {
        let lease = match self.try_admit(host, client_ip) {
            Err(GatewayError::ConnectionInvalidated { reason }) => {
                tracing::debug!(host, %reason, "configuration changed during admission, retrying");
                self.try_admit(host, client_ip)?
            }
            result => result?,
        };
        let span = connection_span(lease.id(), host, client_ip);
        span.record("backend", lease.connection().backend().name());
        span.record("endpoint", tracing::field::display(lease.connection().endpoint()));
        span.in_scope(|| tracing::debug!("connection admitted"));
        Ok(lease)
    }

    fn try_admit(&self, host: &str, client_ip: IpAddr) -> GatewayResult<ConnectionLease> {
        let resolution = self.resolve(host)?;
        self.connections.add_connection(
            resolution.route,
            resolution.backend,
            resolution.endpoint,
            client_ip,
        )
    }

    /// Per-request QPS check for a request travelling over `lease`.
    pub fn check_request(&self, lease: &ConnectionLease) -> GatewayResult<()> {
        let connection = lease.connection();
        self.rate_limits
            .check_qps(connection.backend().name(), connection.client_ip())
            .map_err(|tier| GatewayError::LimitExceeded { tier })
    }

    /// Start health probing and the idle client eviction loop.
    pub fn start_background_tasks(&self) -> JoinHandle<()> {
        self.health.start();
        self.spawn_client_eviction()
    }

    fn spawn_client_eviction(&self) -> JoinHandle<()> {
        let rate_limits = self.rate_limits.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let idle = move || Duration::from_secs(config.load().server.client_idle_timeout_secs.max(1));
        let period = (idle() / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        rate_limits.evict_idle_clients(idle());
                    }
                }
            }
        }
        .instrument(component_span("client_eviction")))
    }

    /// Reload from `provider` whenever it signals a change.
    ///
    /// Signals arriving within `debounce` of each other are coalesced into one
    /// reload. A configuration that fails to load or apply is logged and the
    /// running one stays in place. Returns `None` when the provider's change
    /// stream was already taken.
    pub fn watch_config(
        self: &Arc<Self>,
        provider: Arc<dyn ConfigProvider>,
        debounce: Duration,
    ) -> Option<JoinHandle<()>> {
        let mut changes = provider.watch()?;
        let service = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        Some(tokio::spawn(async move {
            tracing::info!("config watcher started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = changes.recv() => {
                        if signal.is_none() {
                            break;
                        }
                    }
                }

                tokio::time::sleep(debounce).await;
                while changes.try_recv().is_ok() {}

                match provider.load_config().await {
                    Ok(config) => match service.apply_config(config) {
                        Ok(version) => tracing::info!(version, "configuration reloaded"),
                        Err(e) => tracing::error!(error = %e, "failed to apply configuration"),
                    },
                    Err(e) => tracing::error!(error = ?e, "failed to load configuration"),
                }
            }
            tracing::info!("config watcher stopped");
        }
        .instrument(component_span("config_watcher"))))
    }

    /// Stop background tasks and close every tracked connection.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.health.stop_all();
        let closed = self.connections.close_all();
        tracing::info!(closed, "gateway shut down");
        closed
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitManager> {
        &self.rate_limits
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn health(&self) -> &Arc<HealthCheckManager> {
        &self.health
    }

    /// The configuration most recently applied.
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
