//! Three-tier admission control: global → backend → client.
//!
//! QPS checks are advisory and hold nothing. Connection admission is all or
//! nothing: a failure at a later tier releases the tiers already taken for the
//! same attempt. A successful admission yields a [`ConnectionPermit`] that
//! remembers the exact limiter instances it drew from, so a reload that swaps
//! limiters never redirects the release of permits taken before it.
use std::{fmt, net::IpAddr, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use scc::HashMap;

use crate::{
    config::{BackendConfig, RateLimitConfig},
    core::{
        error::LimitTier,
        rate_limiter::{BackendRateLimiter, ClientRateLimiter, GlobalRateLimiter},
    },
    metrics,
};

/// Client limiters are scoped per backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub backend: String,
    pub client_ip: IpAddr,
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client_ip, self.backend)
    }
}

type ClientMap = HashMap<ClientKey, Arc<ClientRateLimiter>>;

pub struct RateLimitManager {
    global: ArcSwap<GlobalRateLimiter>,
    backends: HashMap<String, Arc<BackendRateLimiter>>,
    clients: Arc<ClientMap>,
}

impl fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitManager")
            .field("global", &self.global.load().config())
            .field("backends", &self.backends.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl RateLimitManager {
    pub fn new(server: RateLimitConfig) -> Self {
        Self {
            global: ArcSwap::from_pointee(GlobalRateLimiter::new(server)),
            backends: HashMap::new(),
            clients: Arc::new(HashMap::new()),
        }
    }

    fn backend_limiter(&self, backend: &str) -> Option<Arc<BackendRateLimiter>> {
        self.backends.read(backend, |_, limiter| limiter.clone())
    }

    /// Existing client limiter or a new one built from the current settings.
    fn client_limiter(
        &self,
        global: &GlobalRateLimiter,
        backend_limiter: Option<&BackendRateLimiter>,
        key: ClientKey,
    ) -> Arc<ClientRateLimiter> {
        if let Some(existing) = self.clients.read(&key, |_, c| c.clone()) {
            existing.touch();
            return existing;
        }
        let client = self
            .clients
            .entry(key)
            .or_insert_with(|| {
                let settings = global
                    .config()
                    .client_settings(backend_limiter.map(|b| b.config()));
                Arc::new(ClientRateLimiter::new(settings))
            })
            .get()
            .clone();
        client.touch();
        client
    }

    fn is_live_client(&self, key: &ClientKey, client: &Arc<ClientRateLimiter>) -> bool {
        self.clients
            .read(key, |_, current| Arc::ptr_eq(current, client))
            .unwrap_or(false)
    }

    /// Per-request QPS admission. Tiers consumed before a rejection are not
    /// rolled back.
    pub fn try_acquire(&self, backend: &str, client_ip: IpAddr) -> bool {
        self.check_qps(backend, client_ip).is_ok()
    }

    /// Like [`try_acquire`](Self::try_acquire) but reports the rejecting tier.
    pub fn check_qps(&self, backend: &str, client_ip: IpAddr) -> Result<(), LimitTier> {
        let global = self.global.load();
        if let Some(qps) = global.qps()
            && !qps.try_acquire()
        {
            return Err(reject(LimitTier::Global, "qps"));
        }

        let backend_limiter = self.backend_limiter(backend);
        if let Some(qps) = backend_limiter.as_deref().and_then(|b| b.qps())
            && !qps.try_acquire()
        {
            return Err(reject(LimitTier::Backend, "qps"));
        }

        let key = ClientKey {
            backend: backend.to_string(),
            client_ip,
        };
        let client = self.client_limiter(&global, backend_limiter.as_deref(), key);
        if let Some(qps) = client.qps()
            && !qps.try_acquire()
        {
            return Err(reject(LimitTier::Client, "qps"));
        }
        Ok(())
    }

    /// Take one connection permit at every tier or none at all.
    pub fn try_acquire_connection(
        &self,
        backend: &str,
        client_ip: IpAddr,
    ) -> Result<ConnectionPermit, LimitTier> {
        let global = self.global.load_full();
        let global_held = match global.connections() {
            Some(limiter) if !limiter.try_acquire() => {
                return Err(reject(LimitTier::Global, "connection"));
            }
            Some(_) => Some(global.clone()),
            None => None,
        };

        let backend_limiter = self.backend_limiter(backend);
        let backend_held = match backend_limiter.as_ref().and_then(|b| b.connections()) {
            Some(limiter) if !limiter.try_acquire() => {
                release_global(global_held.as_deref());
                return Err(reject(LimitTier::Backend, "connection"));
            }
            Some(_) => backend_limiter.clone(),
            None => None,
        };

        let key = ClientKey {
            backend: backend.to_string(),
            client_ip,
        };
        let client = loop {
            let client = self.client_limiter(&global, backend_limiter.as_deref(), key.clone());
            let acquired = client.connections().try_acquire();
            // A vacant entry may be dropped between lookup and acquire. Once a
            // connection is held it stays, so a limiter still in the map is the live one.
            if self.is_live_client(&key, &client) {
                if acquired {
                    break client;
                }
                release_backend(backend_held.as_deref());
                release_global(global_held.as_deref());
                return Err(reject(LimitTier::Client, "connection"));
            }
            if acquired {
                client.connections().release();
            }
        };

        tracing::debug!(client = %key, "connection admitted");
        Ok(ConnectionPermit {
            global: global_held,
            backend: backend_held,
            client,
            key,
            clients: self.clients.clone(),
            released: false,
        })
    }

    /// Explicit release; equivalent to dropping the permit.
    pub fn release_connection(&self, permit: ConnectionPermit) {
        drop(permit);
    }

    /// Install (or replace) the limiter for a backend.
    ///
    /// An unchanged config keeps the installed limiter and its counts.
    /// Otherwise permits already held keep pointing at the old limiter, and idle
    /// client entries of the backend are dropped so they pick up the new overrides.
    pub fn update_backend_limiter(&self, name: &str, config: &BackendConfig) {
        let installed = self.backend_limiter(name).map(|b| *b.config());
        if installed == config.rate_limit {
            return;
        }
        match config.rate_limit {
            Some(rate_limit) => {
                self.backends
                    .upsert(name.to_string(), Arc::new(BackendRateLimiter::new(rate_limit)));
            }
            None => {
                self.backends.remove(name);
            }
        }
        self.clients
            .retain(|key, client| key.backend != name || !client.is_vacant());
        tracing::debug!(backend = name, rate_limit = ?config.rate_limit, "backend limiter updated");
    }

    pub fn remove_backend_limiter(&self, name: &str) {
        self.backends.remove(name);
        self.clients
            .retain(|key, client| key.backend != name || !client.is_vacant());
    }

    /// Names of backends that currently have a limiter installed.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.backends.len());
        self.backends.scan(|name, _| names.push(name.clone()));
        names
    }

    /// Replace the global tier and the per-client defaults.
    pub fn update_server_rate_limit_config(&self, config: RateLimitConfig) {
        if *self.global.load().config() == config {
            return;
        }
        self.global.store(Arc::new(GlobalRateLimiter::new(config)));
        self.clients.retain(|_, client| !client.is_vacant());
        tracing::info!(?config, "server rate limits updated");
    }

    /// Drop client entries holding no connection that were not used for `idle`.
    /// Returns how many were removed.
    pub fn evict_idle_clients(&self, idle: Duration) -> usize {
        let mut evicted = 0;
        self.clients.retain(|_, client| {
            let keep = !client.is_vacant() || client.idle_for() < idle;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            tracing::debug!(evicted, "idle client limiters evicted");
        }
        evicted
    }

    pub fn server_config(&self) -> RateLimitConfig {
        *self.global.load().config()
    }

    pub fn global_connections(&self) -> i64 {
        self.global
            .load()
            .connections()
            .map(|c| c.current_connections())
            .unwrap_or(0)
    }

    pub fn backend_connections(&self, backend: &str) -> i64 {
        self.backend_limiter(backend)
            .and_then(|b| b.connections().map(|c| c.current_connections()))
            .unwrap_or(0)
    }

    pub fn client_connections(&self, backend: &str, client_ip: IpAddr) -> i64 {
        let key = ClientKey {
            backend: backend.to_string(),
            client_ip,
        };
        self.clients
            .read(&key, |_, c| c.connections().current_connections())
            .unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn reject(tier: LimitTier, kind: &'static str) -> LimitTier {
    metrics::increment_admission_rejected(tier.as_str(), kind);
    tracing::debug!(%tier, kind, "admission rejected");
    tier
}

fn release_global(global: Option<&GlobalRateLimiter>) {
    if let Some(limiter) = global.and_then(|g| g.connections()) {
        limiter.release();
    }
}

fn release_backend(backend: Option<&BackendRateLimiter>) {
    if let Some(limiter) = backend.and_then(|b| b.connections()) {
        limiter.release();
    }
}

/// Connection permits held at each tier for one connection.
///
/// Released exactly once, in global → backend → client order, when dropped.
/// The client entry is removed from the manager once it holds nothing.
#[must_use = "dropping the permit releases the connection slots immediately"]
pub struct ConnectionPermit {
    global: Option<Arc<GlobalRateLimiter>>,
    backend: Option<Arc<BackendRateLimiter>>,
    client: Arc<ClientRateLimiter>,
    key: ClientKey,
    clients: Arc<ClientMap>,
    released: bool,
}

impl ConnectionPermit {
    pub fn client_key(&self) -> &ClientKey {
        &self.key
    }

    fn release_all(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        release_global(self.global.as_deref());
        release_backend(self.backend.as_deref());
        self.client.connections().release();

        let client = &self.client;
        self.clients.remove_if(&self.key, |current| {
            Arc::ptr_eq(current, client) && current.is_vacant()
        });
    }
}

impl fmt::Debug for ConnectionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPermit")
            .field("client", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.release_all();
    }
}
