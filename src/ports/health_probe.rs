use std::net::IpAddr;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

use crate::config::HealthCheckConfig;

/// Reasons a probe did not succeed. Never surfaced beyond the health checker.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProbeError {
    /// Could not reach the endpoint
    #[error("connection error: {0}")]
    Connect(String),

    /// No answer within the configured timeout
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// The probe target could not be turned into a request
    #[error("invalid probe target: {0}")]
    InvalidTarget(String),

    /// HTTP probe answered with a non-2xx status
    #[error("unhealthy status {0}")]
    Status(StatusCode),
}

/// Result type alias for probe outcomes
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Address a probe is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// HealthProbe defines the port for checking a single endpoint.
///
/// `Ok(())` is a successful probe. The caller enforces the timeout in
/// `config.timeout_secs`; implementations may enforce it as well.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, target: &ProbeTarget, config: &HealthCheckConfig) -> ProbeResult<()>;
}
