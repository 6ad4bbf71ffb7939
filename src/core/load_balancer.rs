use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;
use scc::HashMap;

use crate::{
    config::LoadBalanceStrategy,
    core::backend::{Backend, Endpoint, EndpointKey},
};

/// Trait defining the interface for load balancing strategies.
///
/// `select` receives the already filtered candidate group (healthy endpoints of the
/// best priority). The connection hooks are no-ops unless a strategy keeps state
/// per endpoint.
pub trait LoadBalancer: Send + Sync + 'static {
    /// Select an endpoint from a list of candidates
    fn select(&self, candidates: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>>;

    /// Strategy implemented by this balancer
    fn strategy(&self) -> LoadBalanceStrategy;

    /// A connection to `endpoint` was opened.
    fn on_connection_open(&self, _endpoint: &Endpoint) {}

    /// A connection to `endpoint` was closed.
    fn on_connection_close(&self, _endpoint: &Endpoint) {}

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancer>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinBalancer {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, candidates: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(candidates[count % candidates.len()].clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::RoundRobin
    }
}

/// Random selection load balancing strategy
pub struct RandomBalancer;

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomBalancer {
    /// Create a new random selection strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn select(&self, candidates: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..candidates.len());
        Some(candidates[index].clone())
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::Random
    }
}

/// Picks the candidate with the fewest open connections.
///
/// Counts are kept per endpoint identity; an entry is dropped once its count
/// returns to zero, and absent entries count as zero.
#[derive(Default)]
pub struct LeastConnectionsBalancer {
    open: HashMap<EndpointKey, usize>,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open connections currently attributed to `key`.
    pub fn open_connections(&self, key: &EndpointKey) -> usize {
        self.open.read(key, |_, count| *count).unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(&self, candidates: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        candidates
            .iter()
            .min_by_key(|endpoint| self.open_connections(endpoint.key()))
            .cloned()
    }

    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::LeastConnections
    }

    fn on_connection_open(&self, endpoint: &Endpoint) {
        self.open
            .entry(endpoint.key().clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    fn on_connection_close(&self, endpoint: &Endpoint) {
        self.open.remove_if(endpoint.key(), |count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// Factory for creating load balancers from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancer based on configuration
    pub fn create(strategy: &LoadBalanceStrategy) -> Box<dyn LoadBalancer> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinBalancer::new().boxed(),
            LoadBalanceStrategy::Random => RandomBalancer::new().boxed(),
            LoadBalanceStrategy::LeastConnections => LeastConnectionsBalancer::new().boxed(),
        }
    }
}

/// Health and priority aware endpoint selection.
///
/// Only healthy endpoints are considered, and among those only the group sharing
/// the numerically smallest priority. The backend's own balancer picks within
/// that group, which gives active/standby failover across priority tiers.
pub struct EndpointSelector;

impl EndpointSelector {
    pub fn select(backend: &Backend) -> Option<Arc<Endpoint>> {
        let group = Self::eligible(backend);
        backend.load_balancer().select(&group)
    }

    /// The healthy endpoints of the best priority group.
    pub fn eligible(backend: &Backend) -> Vec<Arc<Endpoint>> {
        let best = backend
            .endpoints()
            .iter()
            .filter(|e| e.is_healthy())
            .map(|e| e.priority())
            .min();

        match best {
            Some(priority) => backend
                .endpoints()
                .iter()
                .filter(|e| e.is_healthy() && e.priority() == priority)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}
