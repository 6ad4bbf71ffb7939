use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    config::RouteConfig,
    core::{error::EntityError, route_matcher::HostMatcher},
};

/// A host pattern bound to a backend name.
///
/// The pattern string is the route's identity. Routes are immutable; a reload
/// builds new ones and the registry swaps the whole table.
#[derive(Debug)]
pub struct Route {
    id: String,
    matcher: HostMatcher,
    backend: String,
}

impl Route {
    pub fn from_config(config: &RouteConfig) -> Result<Self, EntityError> {
        let host = config.host.trim();
        let matcher = HostMatcher::compile(host)?;
        let backend = config.backend.trim();
        if backend.is_empty() {
            return Err(EntityError::EmptyRouteTarget {
                host: host.to_string(),
            });
        }
        Ok(Self {
            id: host.to_string(),
            matcher,
            backend: backend.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the backend this route forwards to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn matches(&self, host: &str) -> bool {
        self.matcher.matches(host)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.id, self.backend)
    }
}

/// Ordered route list with an id index.
///
/// Iteration follows configuration order. A later entry reusing an id replaces
/// the earlier one in place, so the table never holds two routes with the same id.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    index: HashMap<String, usize>,
}

impl RouteTable {
    pub fn build(configs: &[RouteConfig]) -> Result<Self, EntityError> {
        let mut table = Self {
            routes: Vec::with_capacity(configs.len()),
            index: HashMap::with_capacity(configs.len()),
        };
        for config in configs {
            let route = Arc::new(Route::from_config(config)?);
            match table.index.get(route.id()) {
                Some(&pos) => {
                    tracing::warn!(route = %route.id(), "duplicate route id, later entry wins");
                    table.routes[pos] = route;
                }
                None => {
                    table.index.insert(route.id().to_string(), table.routes.len());
                    table.routes.push(route);
                }
            }
        }
        Ok(table)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Route>> {
        self.index.get(id).map(|&pos| &self.routes[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Key-set equality (size and membership), not deep equality.
    pub fn same_keys(&self, other: &RouteTable) -> bool {
        self.index.len() == other.index.len()
            && self.index.keys().all(|k| other.index.contains_key(k))
    }
}

impl<'a> IntoIterator for &'a RouteTable {
    type Item = &'a Arc<Route>;
    type IntoIter = std::slice::Iter<'a, Arc<Route>>;

    fn into_iter(self) -> Self::IntoIter {
        self.routes.iter()
    }
}
