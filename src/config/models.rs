//! Configuration data structures for gatehouse.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and carry defaults so that minimal configs remain concise. The
//! control plane never reads files itself: a loader produces a [`GatewayConfig`] and
//! hands the route / backend lists to the registry update entry points.
use serde::{Deserialize, Deserializer, Serialize};

/// Sentinel for "no limit" in every rate limit field.
pub const UNLIMITED: i64 = -1;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_client_idle_timeout_secs() -> u64 {
    300
}

fn default_priority() -> i32 {
    1
}

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Ordered route list; the first matching host pattern wins.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Default active probe configuration, overridable per backend.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Look up a backend definition by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

/// Listener level settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Global tier limits plus the per-client defaults. Omitted fields are unlimited.
    #[serde(
        default = "RateLimitConfig::unlimited",
        deserialize_with = "deserialize_server_rate_limit"
    )]
    pub rate_limit: RateLimitConfig,
    /// Client limiter entries with no open connections are reclaimed after this long.
    #[serde(default = "default_client_idle_timeout_secs")]
    pub client_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            rate_limit: RateLimitConfig::unlimited(),
            client_idle_timeout_secs: default_client_idle_timeout_secs(),
        }
    }
}

/// Rate limit settings shared by the server and backend levels.
///
/// At the server level `-1` means unlimited and `0` rejects everything. At the
/// backend level `0` means "not set": the backend tier is skipped for that field
/// and the per-client fields inherit the server defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_qps: i64,
    pub max_connections: i64,
    pub max_qps_per_client: i64,
    pub max_connections_per_client: i64,
}

impl RateLimitConfig {
    /// All tiers unlimited (server-level default).
    pub fn unlimited() -> Self {
        Self {
            max_qps: UNLIMITED,
            max_connections: UNLIMITED,
            max_qps_per_client: UNLIMITED,
            max_connections_per_client: UNLIMITED,
        }
    }

    /// Per-client settings: `self` holds the defaults, non-zero fields of
    /// `overrides` replace them one by one.
    pub fn client_settings(&self, overrides: Option<&RateLimitConfig>) -> ClientLimitSettings {
        let pick = |default: i64, over: Option<i64>| match over {
            Some(v) if v != 0 => v,
            _ => default,
        };
        ClientLimitSettings {
            max_qps: pick(
                self.max_qps_per_client,
                overrides.map(|o| o.max_qps_per_client),
            ),
            max_connections: pick(
                self.max_connections_per_client,
                overrides.map(|o| o.max_connections_per_client),
            ),
        }
    }
}

fn unlimited() -> i64 {
    UNLIMITED
}

/// Server level fields default to unlimited, not to the backend "unset" `0`.
fn deserialize_server_rate_limit<'de, D>(deserializer: D) -> Result<RateLimitConfig, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct ServerRateLimit {
        #[serde(default = "unlimited")]
        max_qps: i64,
        #[serde(default = "unlimited")]
        max_connections: i64,
        #[serde(default = "unlimited")]
        max_qps_per_client: i64,
        #[serde(default = "unlimited")]
        max_connections_per_client: i64,
    }

    let fields = ServerRateLimit::deserialize(deserializer)?;
    Ok(RateLimitConfig {
        max_qps: fields.max_qps,
        max_connections: fields.max_connections,
        max_qps_per_client: fields.max_qps_per_client,
        max_connections_per_client: fields.max_connections_per_client,
    })
}

/// Effective limits for a single client after override resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLimitSettings {
    pub max_qps: i64,
    pub max_connections: i64,
}

/// A host pattern routed to a named backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Exact host or a pattern with `*` labels, e.g. `*.example.com`.
    pub host: String,
    pub backend: String,
}

impl RouteConfig {
    pub fn new(host: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            backend: backend.into(),
        }
    }
}

/// Protocol → port map.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(default)]
pub struct PortConfig {
    pub http: Option<u16>,
    pub grpc: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    /// Lower value = preferred group.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub ports: Option<PortConfig>,
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, priority: i32) -> Self {
        Self {
            host: host.into(),
            priority,
            ports: None,
        }
    }
}

/// Named backend service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub ports: Option<PortConfig>,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-backend probe override.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            name: name.into(),
            load_balance: LoadBalanceStrategy::default(),
            ports: None,
            endpoints,
            rate_limit: None,
            health_check: None,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.load_balance = strategy;
        self
    }

    pub fn with_ports(mut self, ports: PortConfig) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(alias = "round-robin")]
    RoundRobin,
    Random,
    #[serde(alias = "least-connections")]
    LeastConnections,
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalanceStrategy::Random => write!(f, "random"),
            LoadBalanceStrategy::LeastConnections => write!(f, "least_connections"),
        }
    }
}

/// How an endpoint is probed.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Reachable TCP connect.
    #[default]
    Tcp,
    /// HTTP GET on `path`, any 2xx is a success.
    Http,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub kind: ProbeKind,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ProbeKind::Tcp,
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            success_threshold: 2,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    server: Option<ServerConfig>,
    routes: Vec<RouteConfig>,
    backends: Vec<BackendConfig>,
    health_check: Option<HealthCheckConfig>,
}

impl GatewayConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        let mut server = self.server.take().unwrap_or_default();
        server.listen_addr = addr.into();
        self.server = Some(server);
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        let mut server = self.server.take().unwrap_or_default();
        server.rate_limit = rate_limit;
        self.server = Some(server);
        self
    }

    /// Append a route; order of calls is match order.
    pub fn route(mut self, host: impl Into<String>, backend: impl Into<String>) -> Self {
        self.routes.push(RouteConfig::new(host, backend));
        self
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn build(self) -> GatewayConfig {
        GatewayConfig {
            server: self.server.unwrap_or_default(),
            routes: self.routes,
            backends: self.backends,
            health_check: self.health_check.unwrap_or_default(),
        }
    }
}
