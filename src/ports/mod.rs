//! Traits at the edges of the control plane.
pub mod config_provider;
pub mod health_probe;

pub use config_provider::ConfigProvider;
pub use health_probe::{HealthProbe, ProbeError, ProbeResult, ProbeTarget};
