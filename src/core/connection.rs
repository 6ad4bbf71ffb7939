//! Connection lifecycle: admission permits bound to physical connections and
//! invalidation of connections made stale by a reload.
//!
//! Each admitted connection is tracked as a [`ProxyConnection`] together with the
//! [`ConnectionPermit`] it was admitted under. The I/O layer holds a
//! [`ConnectionLease`]; dropping it (or an invalidation) removes the entry, which
//! closes the connection and releases the permit exactly once.
use std::{
    fmt,
    net::IpAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    core::{
        backend::{Backend, BackendTable, Endpoint},
        error::{GatewayError, GatewayResult},
        rate_limit_manager::{ConnectionPermit, RateLimitManager},
        registry::{EntityChangeEvent, GatewayRegistry, RegistryListener},
        route::{Route, RouteTable},
    },
    metrics,
};

/// Unique identifier for a connection
pub type ConnectionId = u64;

/// Why a tracked connection was closed by a reload. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    RouteRemoved,
    RouteTargetChanged,
    BackendRemoved,
    BackendChanged,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::RouteRemoved => "route_removed",
            InvalidationReason::RouteTargetChanged => "route_target_changed",
            InvalidationReason::BackendRemoved => "backend_removed",
            InvalidationReason::BackendChanged => "backend_changed",
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client connection and what it was resolved to.
pub struct ProxyConnection {
    id: ConnectionId,
    route: Arc<Route>,
    backend: Arc<Backend>,
    endpoint: Arc<Endpoint>,
    client_ip: IpAddr,
    created_at: Instant,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ProxyConnection {
    fn new(
        id: ConnectionId,
        route: Arc<Route>,
        backend: Arc<Backend>,
        endpoint: Arc<Endpoint>,
        client_ip: IpAddr,
    ) -> Self {
        Self {
            id,
            route,
            backend,
            endpoint,
            client_ip,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed for any reason.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token cancelled on close, for tasks that outlive a borrow.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Signal the I/O side and notify the balancer. Returns false if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.backend.load_balancer().on_connection_close(&self.endpoint);
        true
    }

    /// First reason, if any, this connection no longer matches the given tables.
    pub fn invalidation_reason(
        &self,
        routes: &RouteTable,
        backends: &BackendTable,
    ) -> Option<InvalidationReason> {
        let Some(route) = routes.get(self.route.id()) else {
            return Some(InvalidationReason::RouteRemoved);
        };
        if route.backend() != self.route.backend() {
            return Some(InvalidationReason::RouteTargetChanged);
        }
        let Some(backend) = backends.get(self.backend.name()) else {
            return Some(InvalidationReason::BackendRemoved);
        };
        if !self.backend.same_topology(backend) {
            return Some(InvalidationReason::BackendChanged);
        }
        None
    }
}

impl fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("id", &self.id)
            .field("route", &self.route.id())
            .field("backend", &self.backend.name())
            .field("endpoint", &self.endpoint.key())
            .field("client_ip", &self.client_ip)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Tracked {
    connection: Arc<ProxyConnection>,
    _permit: ConnectionPermit,
}

/// Tracks live proxy connections and their admission permits.
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<HashMap<ConnectionId, Tracked>>,
    rate_limits: Arc<RateLimitManager>,
    // Weak: the manager is itself registered as a listener on the registry.
    registry: Option<Weak<GatewayRegistry>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(rate_limits: Arc<RateLimitManager>) -> Self {
        Self {
            connections: Arc::new(HashMap::new()),
            rate_limits,
            registry: None,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Re-check every new connection against the live tables of `registry`.
    pub fn with_registry(mut self, registry: &Arc<GatewayRegistry>) -> Self {
        self.registry = Some(Arc::downgrade(registry));
        self
    }

    /// Admit and track a connection.
    ///
    /// On error nothing is tracked and no permit is held. With a registry
    /// attached, a connection whose binding no longer matches the live tables
    /// is closed again and reported as `ConnectionInvalidated`.
    pub fn add_connection(
        &self,
        route: Arc<Route>,
        backend: Arc<Backend>,
        endpoint: Arc<Endpoint>,
        client_ip: IpAddr,
    ) -> GatewayResult<ConnectionLease> {
        let permit = self
            .rate_limits
            .try_acquire_connection(backend.name(), client_ip)
            .map_err(|tier| GatewayError::LimitExceeded { tier })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(ProxyConnection::new(id, route, backend, endpoint, client_ip));
        connection
            .backend
            .load_balancer()
            .on_connection_open(&connection.endpoint);

        let tracked = Tracked {
            connection: connection.clone(),
            _permit: permit,
        };
        if let Err((_, tracked)) = self.connections.insert(id, tracked) {
            tracked.connection.close();
            tracing::error!(connection_id = id, "connection id already tracked");
            return Err(GatewayError::DuplicateConnection { id });
        }
        metrics::set_active_connections(self.connections.len());

        // A reload may have swapped and swept between resolution and insert.
        if let Some(reason) = self.stale_against_registry(&connection) {
            self.remove_connection(id);
            metrics::increment_connections_invalidated(reason.as_str());
            tracing::debug!(
                connection_id = id,
                %reason,
                "connection resolved against a replaced configuration"
            );
            return Err(GatewayError::ConnectionInvalidated { reason });
        }

        tracing::debug!(
            connection_id = id,
            client_ip = %connection.client_ip,
            route = %connection.route.id(),
            endpoint = %connection.endpoint,
            total_connections = self.connections.len(),
            "connection added"
        );

        Ok(ConnectionLease {
            connection,
            manager: self.clone(),
        })
    }

    fn stale_against_registry(&self, connection: &ProxyConnection) -> Option<InvalidationReason> {
        let registry = self.registry.as_ref()?.upgrade()?;
        connection.invalidation_reason(&registry.routes(), &registry.backends())
    }

    /// Stop tracking `id`, close it and release its permit. No-op if unknown.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let Some((_, tracked)) = self.connections.remove(&id) else {
            return false;
        };
        tracked.connection.close();
        drop(tracked);
        metrics::set_active_connections(self.connections.len());
        tracing::debug!(connection_id = id, "connection removed");
        true
    }

    /// Close every connection whose binding no longer matches the given tables.
    /// Returns how many were closed.
    pub fn disconnect_invalid_connections(
        &self,
        routes: &RouteTable,
        backends: &BackendTable,
    ) -> usize {
        let mut stale = Vec::new();
        self.connections.scan(|id, tracked| {
            if let Some(reason) = tracked.connection.invalidation_reason(routes, backends) {
                stale.push((*id, reason));
            }
        });

        let mut closed = 0;
        for (id, reason) in stale {
            if self.remove_connection(id) {
                closed += 1;
                metrics::increment_connections_invalidated(reason.as_str());
                tracing::info!(connection_id = id, %reason, "connection invalidated");
            }
        }
        closed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ProxyConnection>> {
        self.connections.read(&id, |_, t| t.connection.clone())
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn get_all_connections(&self) -> Vec<Arc<ProxyConnection>> {
        let mut connections = Vec::with_capacity(self.connections.len());
        self.connections
            .scan(|_, t| connections.push(t.connection.clone()));
        connections
    }

    /// Close and release everything, e.g. on shutdown.
    pub fn close_all(&self) -> usize {
        let mut ids = Vec::new();
        self.connections.scan(|id, _| ids.push(*id));
        ids.into_iter()
            .filter(|id| self.remove_connection(*id))
            .count()
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitManager> {
        &self.rate_limits
    }
}

impl RegistryListener for ConnectionManager {
    fn on_change(&self, event: &EntityChangeEvent) -> eyre::Result<()> {
        let closed = self.disconnect_invalid_connections(&event.routes, &event.backends);
        if closed > 0 {
            tracing::info!(version = event.version, closed, "stale connections closed after reload");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "connection_manager"
    }
}

/// Handle the I/O layer keeps for the lifetime of a physical connection.
///
/// Dropping it removes the connection from the manager.
#[must_use = "dropping the lease closes the connection"]
pub struct ConnectionLease {
    connection: Arc<ProxyConnection>,
    manager: ConnectionManager,
}

impl ConnectionLease {
    pub fn id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn connection(&self) -> &Arc<ProxyConnection> {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Resolves when the connection is invalidated or otherwise closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.connection.closed()
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionLease")
            .field(&self.connection)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.manager.remove_connection(self.connection.id);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{
        config::{
            BackendConfig, EndpointConfig, LoadBalanceStrategy, PortConfig, RateLimitConfig,
            RouteConfig,
        },
        core::error::LimitTier,
    };

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));

    fn tables(
        routes: &[(&str, &str)],
        backends: &[BackendConfig],
    ) -> (Arc<RouteTable>, Arc<BackendTable>) {
        let routes: Vec<RouteConfig> = routes
            .iter()
            .map(|(h, b)| RouteConfig::new(*h, *b))
            .collect();
        (
            Arc::new(RouteTable::build(&routes).unwrap()),
            Arc::new(BackendTable::build(backends, None).unwrap()),
        )
    }

    fn backend(name: &str, hosts: &[&str]) -> BackendConfig {
        BackendConfig::new(
            name,
            hosts.iter().map(|h| EndpointConfig::new(*h, 1)).collect(),
        )
    }

    fn manager(server: RateLimitConfig) -> ConnectionManager {
        ConnectionManager::new(Arc::new(RateLimitManager::new(server)))
    }

    fn connect(
        manager: &ConnectionManager,
        routes: &RouteTable,
        backends: &BackendTable,
        host: &str,
    ) -> GatewayResult<ConnectionLease> {
        let route = routes.get(host).unwrap().clone();
        let backend = backends.get(route.backend()).unwrap().clone();
        let endpoint = backend.endpoints()[0].clone();
        manager.add_connection(route, backend, endpoint, CLIENT)
    }

    #[test]
    fn test_lease_drop_releases_permit() {
        let manager = manager(RateLimitConfig {
            max_connections: 1,
            ..RateLimitConfig::unlimited()
        });
        let (routes, backends) = tables(&[("a.example.com", "a")], &[backend("a", &["h1"])]);

        let lease = connect(&manager, &routes, &backends, "a.example.com").unwrap();
        assert_eq!(manager.active_connection_count(), 1);

        let err = connect(&manager, &routes, &backends, "a.example.com").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::LimitExceeded {
                tier: LimitTier::Global
            }
        ));
        assert_eq!(manager.active_connection_count(), 1);

        let connection = lease.connection().clone();
        drop(lease);
        assert!(connection.is_closed());
        assert_eq!(manager.active_connection_count(), 0);
        assert_eq!(manager.rate_limits().global_connections(), 0);
        assert!(connect(&manager, &routes, &backends, "a.example.com").is_ok());
    }

    #[test]
    fn test_id_collision_releases_the_new_permit() {
        let manager = manager(RateLimitConfig {
            max_connections: 5,
            ..RateLimitConfig::unlimited()
        });
        let (routes, backends) = tables(&[("a.example.com", "a")], &[backend("a", &["h1"])]);
        let first = connect(&manager, &routes, &backends, "a.example.com").unwrap();

        manager.next_id.store(first.id(), Ordering::Relaxed);
        let err = connect(&manager, &routes, &backends, "a.example.com").unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateConnection { id } if id == first.id()));
        assert_eq!(manager.active_connection_count(), 1);
        assert_eq!(manager.rate_limits().global_connections(), 1);
        assert!(!first.is_closed());
    }

    #[test]
    fn test_remove_connection_is_idempotent() {
        let manager = manager(RateLimitConfig {
            max_connections: 5,
            ..RateLimitConfig::unlimited()
        });
        let (routes, backends) = tables(&[("a.example.com", "a")], &[backend("a", &["h1"])]);
        let lease = connect(&manager, &routes, &backends, "a.example.com").unwrap();
        let id = lease.id();

        assert!(manager.remove_connection(id));
        assert!(!manager.remove_connection(id));
        drop(lease);
        assert_eq!(manager.rate_limits().global_connections(), 0);
    }

    #[test]
    fn test_invalidation_reasons_in_order() {
        let manager = manager(RateLimitConfig::unlimited());
        let (routes, backends) = tables(
            &[("a.example.com", "a"), ("b.example.com", "b")],
            &[backend("a", &["h1"]), backend("b", &["h2"])],
        );
        let lease = connect(&manager, &routes, &backends, "a.example.com").unwrap();
        let conn = lease.connection();

        // Route gone and backend gone: route removal is reported.
        let (r, b) = tables(&[("b.example.com", "b")], &[backend("b", &["h2"])]);
        assert_eq!(
            conn.invalidation_reason(&r, &b),
            Some(InvalidationReason::RouteRemoved)
        );

        // Target changed while the old backend also changed: target wins.
        let (r, b) = tables(
            &[("a.example.com", "b")],
            &[backend("a", &["h9"]), backend("b", &["h2"])],
        );
        assert_eq!(
            conn.invalidation_reason(&r, &b),
            Some(InvalidationReason::RouteTargetChanged)
        );

        let (r, b) = tables(&[("a.example.com", "a")], &[backend("b", &["h2"])]);
        assert_eq!(
            conn.invalidation_reason(&r, &b),
            Some(InvalidationReason::BackendRemoved)
        );

        let (r, b) = tables(&[("a.example.com", "a")], &[backend("a", &["h1", "h3"])]);
        assert_eq!(
            conn.invalidation_reason(&r, &b),
            Some(InvalidationReason::BackendChanged)
        );

        let ported = backend("a", &["h1"]).with_ports(PortConfig {
            http: Some(8080),
            grpc: None,
        });
        let (r, b) = tables(&[("a.example.com", "a")], &[ported]);
        assert_eq!(
            conn.invalidation_reason(&r, &b),
            Some(InvalidationReason::BackendChanged)
        );

        // Rebuilt but identical: still valid.
        let (r, b) = tables(&[("a.example.com", "a")], &[backend("a", &["h1"])]);
        assert_eq!(conn.invalidation_reason(&r, &b), None);
    }

    #[tokio::test]
    async fn test_disconnect_closes_only_stale_connections() {
        let manager = manager(RateLimitConfig {
            max_connections: 10,
            ..RateLimitConfig::unlimited()
        });
        let (routes, backends) = tables(
            &[("a.example.com", "a"), ("b.example.com", "b")],
            &[backend("a", &["h1", "h2"]), backend("b", &["h3"])],
        );
        let stale = connect(&manager, &routes, &backends, "a.example.com").unwrap();
        let kept = connect(&manager, &routes, &backends, "b.example.com").unwrap();

        let (routes, backends) = tables(
            &[("a.example.com", "a"), ("b.example.com", "b")],
            &[backend("a", &["h1"]), backend("b", &["h3"])],
        );
        assert_eq!(manager.disconnect_invalid_connections(&routes, &backends), 1);

        // The I/O side observes the close through the lease.
        stale.closed().await;
        assert!(stale.is_closed());
        assert!(!kept.is_closed());
        assert_eq!(manager.active_connection_count(), 1);
        assert_eq!(manager.rate_limits().global_connections(), 1);

        drop(stale);
        assert_eq!(manager.rate_limits().global_connections(), 1);
    }

    #[test]
    fn test_least_connections_hooks_follow_lifecycle() {
        let manager = manager(RateLimitConfig::unlimited());
        let config = backend("a", &["h1", "h2"]).with_strategy(LoadBalanceStrategy::LeastConnections);
        let (routes, backends) = tables(&[("a.example.com", "a")], &[config]);
        let backend = backends.get("a").unwrap().clone();
        let route = routes.get("a.example.com").unwrap().clone();

        let first = manager
            .add_connection(
                route.clone(),
                backend.clone(),
                backend.endpoints()[0].clone(),
                CLIENT,
            )
            .unwrap();
        // h1 is busy, so the balancer now prefers h2.
        let candidates = backend.endpoints().to_vec();
        assert_eq!(
            backend.load_balancer().select(&candidates).unwrap().host(),
            "h2"
        );

        let second = manager
            .add_connection(route, backend.clone(), backend.endpoints()[1].clone(), CLIENT)
            .unwrap();
        drop(second);
        drop(first);
        let third = manager
            .add_connection(
                routes.get("a.example.com").unwrap().clone(),
                backend.clone(),
                backend.endpoints()[1].clone(),
                CLIENT,
            )
            .unwrap();
        // Both earlier connections released their counts; only h2 is busy now.
        assert_eq!(
            backend.load_balancer().select(&candidates).unwrap().host(),
            "h1"
        );
        drop(third);
    }

    #[test]
    fn test_close_all() {
        let manager = manager(RateLimitConfig::unlimited());
        let (routes, backends) = tables(&[("a.example.com", "a")], &[backend("a", &["h1"])]);
        let a = connect(&manager, &routes, &backends, "a.example.com").unwrap();
        let b = connect(&manager, &routes, &backends, "a.example.com").unwrap();
        assert_eq!(manager.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(manager.active_connection_count(), 0);
    }
}
