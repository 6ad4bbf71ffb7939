use std::fmt;

use thiserror::Error;

use crate::core::connection::InvalidationReason;

/// Admission tier a limit was hit at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitTier {
    Global,
    Backend,
    Client,
}

impl LimitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitTier::Global => "global",
            LimitTier::Backend => "backend",
            LimitTier::Client => "client",
        }
    }
}

impl fmt::Display for LimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which entity set a registry update targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Routes,
    Backends,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Routes => f.write_str("routes"),
            EntityKind::Backends => f.write_str("backends"),
        }
    }
}

/// Errors raised while building a route, backend or endpoint from configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EntityError {
    #[error("route host pattern cannot be empty")]
    EmptyHost,

    #[error("invalid host pattern '{pattern}': {reason}")]
    InvalidHostPattern { pattern: String, reason: String },

    #[error("route '{host}' has an empty backend name")]
    EmptyRouteTarget { host: String },

    #[error("backend name cannot be empty")]
    EmptyBackendName,

    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),

    #[error("backend '{0}' has no endpoints")]
    NoEndpoints(String),

    #[error("backend '{backend}' has an endpoint with an empty host")]
    EmptyEndpointHost { backend: String },

    #[error("port 0 configured for {context}")]
    InvalidPort { context: String },
}

/// Control plane error kinds surfaced to the I/O layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("no route matches host '{host}'")]
    RouteNotFound { host: String },

    #[error("backend '{name}' not found")]
    BackendNotFound { name: String },

    #[error("backend '{backend}' has no healthy endpoint")]
    NoHealthyEndpoint { backend: String },

    #[error("{tier} limit exceeded")]
    LimitExceeded { tier: LimitTier },

    #[error("connection resolved against a replaced configuration: {reason}")]
    ConnectionInvalidated { reason: InvalidationReason },

    #[error("connection id {id} is already tracked")]
    DuplicateConnection { id: u64 },

    #[error("{kind} update rejected, previous snapshot restored: {source}")]
    RegistryUpdateFailed {
        kind: EntityKind,
        #[source]
        source: EntityError,
    },
}

impl GatewayError {
    /// HTTP status the I/O layer is expected to answer with.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => http::StatusCode::NOT_FOUND,
            GatewayError::BackendNotFound { .. }
            | GatewayError::NoHealthyEndpoint { .. }
            | GatewayError::ConnectionInvalidated { .. } => {
                http::StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::LimitExceeded { .. } => http::StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RegistryUpdateFailed { .. } | GatewayError::DuplicateConnection { .. } => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Result type for control plane operations
pub type GatewayResult<T> = Result<T, GatewayError>;
