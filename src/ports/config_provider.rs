use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::GatewayConfig;

/// Trait for configuration providers that can load and watch for configuration changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration.
    async fn load_config(&self) -> Result<GatewayConfig>;

    /// Take the channel that signals configuration changes. The receiver
    /// should trigger a reload by calling `load_config`. Only the first call
    /// gets the channel; later calls return `None`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
