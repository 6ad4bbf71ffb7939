//! Versioned holder of the live route and backend tables.
//!
//! Readers load an `Arc` to the current table without locking and never see a
//! partially built one. Writers build a complete new table from configuration and
//! swap it in; a failed build leaves the live table and the version untouched.
//!
//! Writers are serialized, and change events are delivered while the writer
//! still holds the update lock. Listeners therefore observe events in version
//! order and always get the snapshot produced by that very update. A listener
//! must not call back into `update_*`.
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::{
    config::{BackendConfig, RouteConfig},
    core::{
        backend::{Backend, BackendTable},
        error::{EntityError, EntityKind, GatewayError, GatewayResult},
        route::{Route, RouteTable},
    },
    metrics,
};

/// Which table changed, with both versions.
#[derive(Debug, Clone)]
pub enum EntityChange {
    Routes {
        old: Arc<RouteTable>,
        new: Arc<RouteTable>,
    },
    Backends {
        old: Arc<BackendTable>,
        new: Arc<BackendTable>,
    },
}

impl EntityChange {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityChange::Routes { .. } => EntityKind::Routes,
            EntityChange::Backends { .. } => EntityKind::Backends,
        }
    }
}

/// Emitted after a swap that changed the key set of a table.
#[derive(Debug, Clone)]
pub struct EntityChangeEvent {
    pub change: EntityChange,
    pub version: u64,
    /// Route table live right after the swap.
    pub routes: Arc<RouteTable>,
    /// Backend table live right after the swap.
    pub backends: Arc<BackendTable>,
}

/// Receives registry change events synchronously.
pub trait RegistryListener: Send + Sync + 'static {
    fn on_change(&self, event: &EntityChangeEvent) -> eyre::Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Handle returned by [`GatewayRegistry::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, Arc<dyn RegistryListener>)>;

/// Consistent view of both tables and the version they were read at.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub routes: Arc<RouteTable>,
    pub backends: Arc<BackendTable>,
    pub version: u64,
}

pub struct GatewayRegistry {
    routes: ArcSwap<RouteTable>,
    backends: ArcSwap<BackendTable>,
    version: AtomicU64,
    update_lock: Mutex<()>,
    listeners: ArcSwap<ListenerList>,
    next_listener_id: AtomicU64,
}

impl fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("version", &self.version())
            .field("routes", &self.routes.load().len())
            .field("backends", &self.backends.load().len())
            .field("listeners", &self.listeners.load().len())
            .finish()
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(RouteTable::default()),
            backends: ArcSwap::from_pointee(BackendTable::default()),
            version: AtomicU64::new(0),
            update_lock: Mutex::new(()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    pub fn backends(&self) -> Arc<BackendTable> {
        self.backends.load_full()
    }

    pub fn get_route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.load().get(id).cloned()
    }

    pub fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.load().get(name).cloned()
    }

    /// Both tables read under the update lock, so they belong together.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            routes: self.routes.load_full(),
            backends: self.backends.load_full(),
            version: self.version(),
        }
    }

    /// Replace the route table. Returns the new version.
    pub fn update_routes(&self, configs: &[RouteConfig]) -> GatewayResult<u64> {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let old = self.routes.load_full();

        let new = match RouteTable::build(configs) {
            Ok(table) => Arc::new(table),
            Err(source) => return Err(self.roll_back(EntityKind::Routes, source)),
        };
        self.routes.store(new.clone());
        metrics::set_registry_version(version);
        tracing::info!(version, routes = new.len(), "route table swapped");

        if !old.same_keys(&new) {
            self.notify(&EntityChangeEvent {
                change: EntityChange::Routes {
                    old,
                    new: new.clone(),
                },
                version,
                routes: new,
                backends: self.backends.load_full(),
            });
        }
        Ok(version)
    }

    /// Replace the backend table. Endpoints that survive keep their health state.
    /// Returns the new version.
    pub fn update_backends(&self, configs: &[BackendConfig]) -> GatewayResult<u64> {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let old = self.backends.load_full();

        let new = match BackendTable::build(configs, Some(&old)) {
            Ok(table) => Arc::new(table),
            Err(source) => return Err(self.roll_back(EntityKind::Backends, source)),
        };
        self.backends.store(new.clone());
        metrics::set_registry_version(version);
        tracing::info!(version, backends = new.len(), "backend table swapped");

        if !old.same_keys(&new) {
            self.notify(&EntityChangeEvent {
                change: EntityChange::Backends {
                    old,
                    new: new.clone(),
                },
                version,
                routes: self.routes.load_full(),
                backends: new,
            });
        }
        Ok(version)
    }

    /// The live table was never replaced, so only the version needs undoing.
    fn roll_back(&self, kind: EntityKind, source: EntityError) -> GatewayError {
        let version = self.version.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::warn!(%kind, version, error = %source, "registry update rejected");
        GatewayError::RegistryUpdateFailed { kind, source }
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.rcu(|current| {
            let mut next = ListenerList::clone(current);
            next.push((id, listener.clone()));
            next
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: ListenerList = current
                .iter()
                .filter(|(lid, _)| *lid != id)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    /// Deliver to every listener; failures are logged and do not stop delivery.
    fn notify(&self, event: &EntityChangeEvent) {
        let listeners = self.listeners.load_full();
        tracing::debug!(
            kind = %event.change.kind(),
            version = event.version,
            listeners = listeners.len(),
            "dispatching change event"
        );
        for (_, listener) in listeners.iter() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_change(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(listener = listener.name(), error = %e, "registry listener failed");
                }
                Err(_) => {
                    tracing::error!(listener = listener.name(), "registry listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::EndpointConfig;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(EntityKind, u64)>>,
    }

    impl RegistryListener for Recorder {
        fn on_change(&self, event: &EntityChangeEvent) -> eyre::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event.change.kind(), event.version));
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
        panic: bool,
    }

    impl RegistryListener for Failing {
        fn on_change(&self, _event: &EntityChangeEvent) -> eyre::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("listener blew up");
            }
            Err(eyre::eyre!("listener failed"))
        }
    }

    fn backend(name: &str, hosts: &[&str]) -> BackendConfig {
        BackendConfig::new(
            name,
            hosts.iter().map(|h| EndpointConfig::new(*h, 1)).collect(),
        )
    }

    #[test]
    fn test_failed_route_update_restores_previous_state() {
        let registry = GatewayRegistry::new();
        let v1 = registry
            .update_routes(&[RouteConfig::new("api.example.com", "a")])
            .unwrap();
        assert_eq!(v1, 1);
        let before = registry.routes();

        let err = registry
            .update_routes(&[
                RouteConfig::new("ok.example.com", "a"),
                RouteConfig::new("bad..*.com", "b"),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RegistryUpdateFailed {
                kind: EntityKind::Routes,
                ..
            }
        ));
        assert_eq!(registry.version(), 1);
        assert!(Arc::ptr_eq(&before, &registry.routes()));
        assert!(registry.get_route("ok.example.com").is_none());
    }

    #[test]
    fn test_failed_backend_update_restores_previous_state() {
        let registry = GatewayRegistry::new();
        registry.update_backends(&[backend("a", &["h1"])]).unwrap();
        let before = registry.backends();

        let err = registry
            .update_backends(&[backend("a", &["h1"]), backend("a", &["h2"])])
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(registry.version(), 1);
        assert!(Arc::ptr_eq(&before, &registry.backends()));
    }

    #[test]
    fn test_events_only_on_key_set_change() {
        let registry = GatewayRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone());

        registry
            .update_routes(&[RouteConfig::new("a.example.com", "x")])
            .unwrap();
        // Same id, different target: no event.
        registry
            .update_routes(&[RouteConfig::new("a.example.com", "y")])
            .unwrap();
        registry.update_backends(&[backend("x", &["h1"])]).unwrap();
        // Same name, different endpoints: no event.
        registry.update_backends(&[backend("x", &["h2"])]).unwrap();
        registry
            .update_backends(&[backend("x", &["h2"]), backend("y", &["h3"])])
            .unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (EntityKind::Routes, 1),
                (EntityKind::Backends, 3),
                (EntityKind::Backends, 5)
            ]
        );
        assert_eq!(registry.version(), 5);
        assert_eq!(registry.get_route("a.example.com").unwrap().backend(), "y");
    }

    #[test]
    fn test_listener_failures_are_isolated() {
        let registry = GatewayRegistry::new();
        let erroring = Arc::new(Failing {
            calls: AtomicUsize::new(0),
            panic: false,
        });
        let panicking = Arc::new(Failing {
            calls: AtomicUsize::new(0),
            panic: true,
        });
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(erroring.clone());
        registry.add_listener(panicking.clone());
        registry.add_listener(recorder.clone());

        let result = registry.update_routes(&[RouteConfig::new("a.example.com", "x")]);
        assert!(result.is_ok());
        assert_eq!(erroring.calls.load(Ordering::SeqCst), 1);
        assert_eq!(panicking.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);

        // The update lock survives a panicking listener.
        assert!(
            registry
                .update_routes(&[RouteConfig::new("b.example.com", "x")])
                .is_ok()
        );
    }

    #[test]
    fn test_remove_listener() {
        let registry = GatewayRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let id = registry.add_listener(recorder.clone());
        assert_eq!(registry.listener_count(), 1);
        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));

        registry
            .update_routes(&[RouteConfig::new("a.example.com", "x")])
            .unwrap();
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_backend_reload_keeps_health_of_surviving_endpoints() {
        let registry = GatewayRegistry::new();
        registry.update_backends(&[backend("a", &["h1", "h2"])]).unwrap();
        let old = registry.get_backend("a").unwrap();
        old.endpoints()[0].health().record_failure(1);

        registry.update_backends(&[backend("a", &["h1", "h3"])]).unwrap();
        let new = registry.get_backend("a").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!new.endpoints()[0].is_healthy());
        assert!(new.endpoints()[1].is_healthy());
    }

    #[test]
    fn test_snapshot_reads_both_tables() {
        let registry = GatewayRegistry::new();
        registry.update_backends(&[backend("a", &["h1"])]).unwrap();
        registry
            .update_routes(&[RouteConfig::new("a.example.com", "a")])
            .unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.routes.len(), 1);
        assert!(snapshot.backends.contains("a"));
    }
}
