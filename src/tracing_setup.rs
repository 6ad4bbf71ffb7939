use std::net::IpAddr;

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("gatehouse structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("gatehouse console logging initialized");
    Ok(())
}

/// Initialize tracing with an explicit filter directive, e.g. `info` or
/// `gatehouse=debug,warn`.
pub fn init_tracing_with_config(level: &str, json_format: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(true).with_span_list(true))
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json_format, "gatehouse logging initialized");
    Ok(())
}

/// Span for a long-lived component task (health checker, config watcher).
pub fn component_span(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Span covering one proxied connection.
pub fn connection_span(connection_id: u64, host: &str, client_ip: IpAddr) -> tracing::Span {
    tracing::info_span!(
        "connection",
        connection.id = connection_id,
        host = host,
        client.ip = %client_ip,
        backend = tracing::field::Empty,
        endpoint = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_init_tracing_with_config_rejects_bad_filter() {
        assert!(init_tracing_with_config("gatehouse=verbose", true).is_err());
    }

    #[test]
    fn test_connection_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = connection_span(7, "api.example.com", IpAddr::V4(Ipv4Addr::LOCALHOST));
            let metadata = span.metadata().unwrap();
            assert_eq!(metadata.name(), "connection");
            assert!(metadata.fields().field("backend").is_some());
            assert!(metadata.fields().field("endpoint").is_some());
        });
    }

    #[test]
    fn test_component_span() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = component_span("health_checker");
            assert_eq!(span.metadata().map(|m| m.name()), Some("component"));
        });
    }
}
