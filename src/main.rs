use std::{net::IpAddr, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gatehouse::{
    FileConfigProvider, GatewayService, GracefulShutdown,
    config::{ServerConfigValidator, loader::load_config_unchecked},
    core::Protocol,
    metrics,
    ports::config_provider::ConfigProvider,
    tracing_setup,
};

const CONFIG_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gatehouse.yaml")]
    config: String,

    /// Log as pretty console output instead of JSON
    #[clap(long, global = true)]
    console: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gatehouse.yaml")]
        config: String,
    },
    /// Resolve a host against a configuration without starting anything
    Resolve {
        #[clap(short, long, default_value = "gatehouse.yaml")]
        config: String,
        /// Host header value, e.g. api.example.com:443
        #[clap(long)]
        host: String,
        /// Client address used for the admission dry-run
        #[clap(long, default_value = "127.0.0.1")]
        client_ip: IpAddr,
    },
    /// Run the control plane with health checks and hot reload (default)
    Run {
        /// Configuration file to use
        #[clap(short, long, default_value = "gatehouse.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Resolve {
            config,
            host,
            client_ip,
        }) => resolve_command(&config, &host, client_ip).await,
        Some(Commands::Run { config }) => run_command(&config, args.console).await,
        None => run_command(&args.config, args.console).await,
    }
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    let config = load_config_unchecked(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    let errors = ServerConfigValidator::collect_errors(&config);
    if !errors.is_empty() {
        println!("Configuration has {} error(s):", errors.len());
        for (i, error) in errors.iter().enumerate() {
            println!("  {}. {}", i + 1, error);
        }
        return Err(eyre!("Configuration validation failed"));
    }

    println!("Configuration is valid");
    println!("  Listen address: {}", config.server.listen_addr);
    println!("  Routes: {}", config.routes.len());
    for route in &config.routes {
        println!("    {} -> {}", route.host, route.backend);
    }
    println!("  Backends: {}", config.backends.len());
    for backend in &config.backends {
        println!(
            "    {} ({}, {} endpoint(s))",
            backend.name,
            backend.load_balance,
            backend.endpoints.len()
        );
    }
    println!(
        "  Health checks: {}",
        if config.health_check.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}

async fn resolve_command(config_path: &str, host: &str, client_ip: IpAddr) -> Result<()> {
    let config = gatehouse::config::load_config(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    // No probes run here, every endpoint starts healthy.
    let gateway = GatewayService::new(config).context("Failed to build gateway")?;

    let lease = match gateway.admit(host, client_ip) {
        Ok(lease) => lease,
        Err(e) => {
            println!("{host}: {} ({e})", e.status_code());
            return Err(eyre!("Host {host} is not admitted"));
        }
    };

    let connection = lease.connection();
    let backend = connection.backend();
    let endpoint = connection.endpoint();
    println!("{host}");
    println!("  route:    {}", connection.route());
    println!("  backend:  {} ({})", backend.name(), backend.strategy());
    println!("  endpoint: {endpoint}");
    println!(
        "  ports:    http {} / grpc {}",
        backend.port_for(endpoint, Protocol::Http),
        backend.port_for(endpoint, Protocol::Grpc)
    );
    Ok(())
}

async fn run_command(config_path: &str, console: bool) -> Result<()> {
    if console {
        tracing_setup::init_console_tracing()?;
    } else {
        tracing_setup::init_tracing()?;
    }
    metrics::init_metrics().context("Failed to initialize metrics")?;

    tracing::info!(config = config_path, "loading initial configuration");
    let provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config = provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    let gateway = Arc::new(GatewayService::new(config).context("Failed to build gateway")?);
    let background = gateway.start_background_tasks();
    let watcher = gateway.watch_config(provider, CONFIG_DEBOUNCE);

    tracing::info!(
        listen_addr = %gateway.config().server.listen_addr,
        version = gateway.registry().version(),
        "gatehouse control plane running"
    );

    let shutdown = GracefulShutdown::new();
    let reason = shutdown.run_signal_handler().await?;
    tracing::info!(?reason, "shutting down");

    let forced = shutdown.drain(gateway.connections()).await;
    gateway.shutdown();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    let _ = background.await;
    tracing::info!(forced, "gatehouse stopped");
    Ok(())
}
