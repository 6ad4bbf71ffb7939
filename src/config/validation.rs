use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{
    BackendConfig, GatewayConfig, HealthCheckConfig, RateLimitConfig, RouteConfig, UNLIMITED,
};
use crate::core::route_matcher::HostMatcher;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route '{host}' references unknown backend '{backend}'")]
    UnknownBackend { host: String, backend: String },

    #[error("Duplicate backend name '{name}'")]
    DuplicateBackend { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Configuration validator. Collects every problem instead of stopping at the first.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Self::collect_errors(config);
        if errors.len() > 1 {
            return Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            });
        }
        match errors.pop() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Every validation problem, in configuration order.
    pub fn collect_errors(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.server.listen_addr) {
            errors.push(e);
        }
        errors.extend(Self::validate_rate_limit(
            "server.rate_limit",
            &config.server.rate_limit,
        ));
        if config.server.client_idle_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.client_idle_timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        errors.extend(Self::validate_health_check_config(
            "health_check",
            &config.health_check,
        ));

        let mut names = HashSet::new();
        for (i, backend) in config.backends.iter().enumerate() {
            let name = backend.name.trim();
            if !name.is_empty() && !names.insert(name) {
                errors.push(ValidationError::DuplicateBackend {
                    name: name.to_string(),
                });
            }
            errors.extend(Self::validate_backend(i, backend));
        }

        for (i, route) in config.routes.iter().enumerate() {
            errors.extend(Self::validate_route(i, route, &names));
        }

        errors
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    fn validate_route(
        index: usize,
        route: &RouteConfig,
        backends: &HashSet<&str>,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = HostMatcher::compile(&route.host) {
            errors.push(ValidationError::InvalidField {
                field: format!("routes[{index}].host"),
                message: e.to_string(),
            });
        }
        let backend = route.backend.trim();
        if backend.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("routes[{index}].backend"),
            });
        } else if !backends.contains(backend) {
            errors.push(ValidationError::UnknownBackend {
                host: route.host.clone(),
                backend: backend.to_string(),
            });
        }
        errors
    }

    fn validate_backend(index: usize, backend: &BackendConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = |suffix: &str| format!("backends[{index}].{suffix}");

        if backend.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: field("name"),
            });
        }
        if backend.endpoints.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: field("endpoints"),
                message: "at least one endpoint is required".to_string(),
            });
        }
        let zero_port = |p: &crate::config::PortConfig| p.http == Some(0) || p.grpc == Some(0);
        if backend.ports.as_ref().is_some_and(zero_port) {
            errors.push(ValidationError::InvalidField {
                field: field("ports"),
                message: "port 0 is not allowed".to_string(),
            });
        }
        for (j, endpoint) in backend.endpoints.iter().enumerate() {
            if endpoint.host.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: field(&format!("endpoints[{j}].host")),
                });
            }
            if endpoint.ports.as_ref().is_some_and(zero_port) {
                errors.push(ValidationError::InvalidField {
                    field: field(&format!("endpoints[{j}].ports")),
                    message: "port 0 is not allowed".to_string(),
                });
            }
        }
        if let Some(rate_limit) = &backend.rate_limit {
            errors.extend(Self::validate_rate_limit(&field("rate_limit"), rate_limit));
        }
        if let Some(health_check) = &backend.health_check {
            errors.extend(Self::validate_health_check_config(
                &field("health_check"),
                health_check,
            ));
        }
        errors
    }

    fn validate_rate_limit(prefix: &str, config: &RateLimitConfig) -> Vec<ValidationError> {
        [
            ("max_qps", config.max_qps),
            ("max_connections", config.max_connections),
            ("max_qps_per_client", config.max_qps_per_client),
            ("max_connections_per_client", config.max_connections_per_client),
        ]
        .into_iter()
        .filter(|(_, value)| *value < UNLIMITED)
        .map(|(name, value)| ValidationError::InvalidField {
            field: format!("{prefix}.{name}"),
            message: format!("{value} is below -1 (unlimited)"),
        })
        .collect()
    }

    fn validate_health_check_config(
        prefix: &str,
        config: &HealthCheckConfig,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.enabled {
            return errors;
        }
        let mut positive = |name: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("{prefix}.{name}"),
                    message: "must be greater than 0 when health checks are enabled".to_string(),
                });
            }
        };
        positive("interval_secs", config.interval_secs);
        positive("timeout_secs", config.timeout_secs);
        positive("success_threshold", u64::from(config.success_threshold));
        positive("failure_threshold", u64::from(config.failure_threshold));

        if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("{prefix}.path"),
                message: "must start with '/'".to_string(),
            });
        }
        errors
    }

    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        let mut message = format!("{} configuration errors:", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("\n  {}. {}", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, PortConfig};

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .route("api.example.com", "api")
            .route("*.example.com", "api")
            .backend(BackendConfig::new(
                "api",
                vec![EndpointConfig::new("10.0.0.1", 1)],
            ))
            .build()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert_eq!(ServerConfigValidator::validate(&minimal_valid_config()), Ok(()));
    }

    #[test]
    fn validate_rejects_unknown_backend_reference() {
        let mut config = minimal_valid_config();
        config.routes.push(RouteConfig::new("x.example.com", "nope"));
        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownBackend {
                host: "x.example.com".to_string(),
                backend: "nope".to_string()
            }
        );
    }

    #[test]
    fn validate_aggregates_errors() {
        let mut config = minimal_valid_config();
        config.server.listen_addr = "not-an-address".to_string();
        config.server.rate_limit.max_qps = -5;
        config.routes.push(RouteConfig::new("*..bad", "api"));
        config
            .backends
            .push(BackendConfig::new("api", vec![]).with_ports(PortConfig {
                http: Some(0),
                grpc: None,
            }));

        let errors = ServerConfigValidator::collect_errors(&config);
        assert!(errors.contains(&ValidationError::DuplicateBackend {
            name: "api".to_string()
        }));
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::InvalidListenAddress { .. }))
        );
        assert!(errors.iter().any(
            |e| matches!(e, ValidationError::InvalidField { field, .. } if field == "server.rate_limit.max_qps")
        ));
        assert!(errors.iter().any(
            |e| matches!(e, ValidationError::InvalidField { field, .. } if field == "routes[2].host")
        ));
        assert!(errors.iter().any(
            |e| matches!(e, ValidationError::InvalidField { field, .. } if field == "backends[1].ports")
        ));

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("configuration errors"));
    }

    #[test]
    fn validate_rejects_zero_health_check_interval_when_enabled() {
        let mut config = minimal_valid_config();
        config.health_check = HealthCheckConfig {
            enabled: true,
            interval_secs: 0,
            ..HealthCheckConfig::default()
        };
        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("health_check.interval_secs"));
    }

    #[test]
    fn validate_ignores_disabled_health_check_values() {
        let mut config = minimal_valid_config();
        config.health_check = HealthCheckConfig {
            enabled: false,
            interval_secs: 0,
            path: "no-slash".to_string(),
            ..HealthCheckConfig::default()
        };
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_invalid_health_check_path_when_enabled() {
        let mut config = minimal_valid_config();
        config.backends[0].health_check = Some(HealthCheckConfig {
            enabled: true,
            path: "health".to_string(),
            ..HealthCheckConfig::default()
        });
        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("backends[0].health_check.path"));
    }
}
