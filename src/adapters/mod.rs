pub mod config_providers;
pub mod health_checker;
pub mod health_probe;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use health_checker::{HealthCheckManager, HealthCheckTask};
pub use health_probe::{HttpProbe, TcpProbe};
