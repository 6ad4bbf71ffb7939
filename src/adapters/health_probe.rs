//! Probe adapters: plain TCP connect and HTTP/1 GET.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::Request;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::{net::TcpStream, time::timeout};

use crate::{
    config::HealthCheckConfig,
    ports::health_probe::{HealthProbe, ProbeError, ProbeResult, ProbeTarget},
};

/// Healthy when a TCP connection can be opened.
#[derive(Debug, Default, Clone)]
pub struct TcpProbe;

impl TcpProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, target: &ProbeTarget, config: &HealthCheckConfig) -> ProbeResult<()> {
        let authority = target.authority();
        match timeout(
            Duration::from_secs(config.timeout_secs),
            TcpStream::connect(&authority),
        )
        .await
        {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Connect(format!("{authority}: {e}"))),
            Err(_) => Err(ProbeError::Timeout(config.timeout_secs)),
        }
    }
}

/// Healthy when `GET http://host:port{path}` answers 2xx.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);
        Self { client }
    }

    fn uri(target: &ProbeTarget, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("http://{}{}", target.authority(), path)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &ProbeTarget, config: &HealthCheckConfig) -> ProbeResult<()> {
        let uri = Self::uri(target, &config.path);
        let request = Request::builder()
            .method("GET")
            .uri(&uri)
            .header(http::header::USER_AGENT, "gatehouse-health-check")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::InvalidTarget(format!("{uri}: {e}")))?;

        match timeout(
            Duration::from_secs(config.timeout_secs),
            self.client.request(request),
        )
        .await
        {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(ProbeError::Status(response.status())),
            Ok(Err(e)) => Err(ProbeError::Connect(format!("{uri}: {e}"))),
            Err(_) => Err(ProbeError::Timeout(config.timeout_secs)),
        }
    }
}
