pub mod backend;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod load_balancer;
pub mod rate_limit_manager;
pub mod rate_limiter;
pub mod registry;
pub mod route;
pub mod route_matcher;

pub use backend::{Backend, BackendTable, Endpoint, EndpointHealth, EndpointKey, Protocol};
pub use connection::{ConnectionLease, ConnectionManager, InvalidationReason, ProxyConnection};
pub use error::{EntityError, GatewayError, GatewayResult, LimitTier};
pub use gateway::{GatewayService, Resolution};
pub use load_balancer::{EndpointSelector, LoadBalancer, LoadBalancerFactory};
pub use rate_limit_manager::{ConnectionPermit, RateLimitManager};
pub use registry::{EntityChange, EntityChangeEvent, GatewayRegistry, RegistryListener};
pub use route::{Route, RouteTable};
pub use route_matcher::RouteMatcher;
