use bifrost_gateway::config::{GatewayConfig, GatewayMode, LoggingConfig};
use bifrost_gateway::engine::ProxyEngine;
use bifrost_gateway::error::GatewayError;
use bifrost_gateway::{config_validation, logging, server};
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(
    version,
    about = "API gateway: longest-prefix routing, auth, retries, health checks and circuit breaking"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", env = "GATEWAY_CONFIG", help = "Gateway configuration file (JSON)")]
    config: Option<String>,

    #[clap(short, long, value_name = "MODE", env = "GATEWAY_MODE", help = "Gateway mode: whitelist or proxy_all")]
    mode: Option<String>,

    #[clap(short, long, value_name = "ADDR", env = "GATEWAY_LISTEN", help = "Listen address (e.g., 127.0.0.1:8088)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", env = "GATEWAY_ROUTES_FILE", help = "Routing document (YAML)")]
    routes: Option<PathBuf>,

    #[clap(long, value_name = "SECONDS", env = "UPSTREAM_TIMEOUT", help = "Default upstream timeout in seconds")]
    upstream_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", env = "UPSTREAM_RETRIES", help = "Retries for idempotent GET requests")]
    upstream_retries: Option<u32>,

    #[clap(long, value_name = "SECONDS", env = "HEALTH_INTERVAL", help = "Active health check interval in seconds")]
    health_interval: Option<u64>,

    #[clap(long, value_name = "SECRET", env = "JWT_SECRET", hide_env_values = true, help = "HS256 secret for the validate auth strategy")]
    jwt_secret: Option<String>,

    #[clap(long, value_name = "BYTES", env = "MAX_BODY_BYTES", help = "Largest request body accepted for forwarding")]
    max_body_bytes: Option<usize>,

    #[clap(long, value_name = "SECONDS", env = "CIRCUIT_WINDOW", help = "Circuit breaker sliding window in seconds")]
    circuit_window: Option<u64>,

    #[clap(long, value_name = "RATIO", env = "CIRCUIT_THRESHOLD", help = "Failure ratio that opens the circuit")]
    circuit_threshold: Option<f64>,

    #[clap(long, value_name = "SECONDS", env = "CIRCUIT_COOLDOWN", help = "How long an open circuit rejects requests")]
    circuit_cooldown: Option<u64>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        sample_config().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                return Err(format!("Configuration file not found: {}", config_file).into());
            }
            GatewayConfig::from_file(config_file)?
        }
        None => GatewayConfig::default(),
    };
    apply_overrides(&mut config, &args)?;

    logging::init(config.logging.clone())?;

    let validation = config_validation::validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid {
        for err in &validation.errors {
            error!("{}", err);
        }
        return Err(GatewayError::Config(validation.errors.join("; ")).into());
    }

    info!("Starting gateway in {} mode...", config.mode);
    let engine = Arc::new(ProxyEngine::new(&config)?);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                signal_token.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl+C: {}", e),
        }
    });

    engine.start(shutdown.clone());
    match engine.wait_until_ready(&shutdown).await {
        Ok(()) => info!("Gateway ready"),
        Err(GatewayError::Cancelled) => {
            info!("Shutdown requested before the gateway became ready");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    server::run(
        engine,
        config.listen_addr,
        config.private_key.as_deref(),
        config.certificate.as_deref(),
        shutdown,
    )
    .await?;

    info!("Gateway stopped. Goodbye!");
    Ok(())
}

fn apply_overrides(config: &mut GatewayConfig, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(mode) = &args.mode {
        config.mode = mode.parse()?;
    }
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse()?;
    }
    if let Some(routes) = &args.routes {
        config.routes_file = Some(routes.clone());
    }
    if let Some(timeout) = args.upstream_timeout {
        config.upstream_timeout_secs = timeout;
    }
    if let Some(retries) = args.upstream_retries {
        config.upstream_retries = retries;
    }
    if let Some(interval) = args.health_interval {
        config.health_interval_secs = interval;
    }
    if let Some(secret) = &args.jwt_secret {
        config.jwt_secret = Some(secret.clone());
    }
    if let Some(max) = args.max_body_bytes {
        config.max_body_bytes = max;
    }
    if let Some(window) = args.circuit_window {
        config.circuit_window_secs = window;
    }
    if let Some(threshold) = args.circuit_threshold {
        config.circuit_threshold = threshold;
    }
    if let Some(cooldown) = args.circuit_cooldown {
        config.circuit_cooldown_secs = cooldown;
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    if let Some(level) = &args.log_level {
        let level = logging::parse_log_level(level)?;
        config.logging.get_or_insert_with(LoggingConfig::default).level = Some(level);
    }
    Ok(())
}

fn sample_config() -> GatewayConfig {
    GatewayConfig {
        mode: GatewayMode::ProxyAll,
        routes_file: Some(PathBuf::from("routes.yml")),
        jwt_secret: Some("change-me".to_string()),
        logging: Some(LoggingConfig::default()),
        ..GatewayConfig::default()
    }
}
