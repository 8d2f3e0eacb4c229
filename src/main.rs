//! Redfire PBX main application

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use redfire_pbx::{config::PbxConfig, core::PbxGateway, utils::setup_logging, Result};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "redfire-pbx")]
#[command(about = "Software PBX with SIP call control, RTP relay, and telephony features")]
#[command(version = redfire_pbx::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the PBX
    Start,
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli).await?;
    setup_logging(&config.logging)?;

    info!("Starting {} v{}", redfire_pbx::NAME, redfire_pbx::VERSION);
    info!("Description: {}", redfire_pbx::DESCRIPTION);

    match &cli.command {
        Some(Commands::Start) | None => run_pbx(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config).await,
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()).await,
    }
}

async fn load_configuration(cli: &Cli) -> Result<PbxConfig> {
    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path.display());
        PbxConfig::load_from_file(config_path)?
    } else {
        info!("No configuration file specified, trying environment variables");
        match PbxConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => {
                info!("No environment configuration found, using defaults");
                PbxConfig::default_config()
            }
        }
    };

    config.validate()?;
    info!("Configuration loaded and validated successfully");

    Ok(config)
}

async fn run_pbx(config: PbxConfig) -> Result<()> {
    info!("Initializing Redfire PBX");

    let gateway = PbxGateway::new(config).await?;
    gateway.start().await?;

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    // Calls in flight get `SHUTDOWN_DEADLINE` to wind down on their own
    // before the ingress loop and its background tasks are aborted
    // regardless, so a stuck call task can never hang the process exit.
    let active = gateway.active_call_count();
    if active > 0 {
        info!(active, "waiting for in-flight calls to end before shutdown");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        while gateway.active_call_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if gateway.active_call_count() > 0 {
            error!(
                remaining = gateway.active_call_count(),
                "shutdown deadline reached with calls still active, forcing stop"
            );
        }
    }

    gateway.stop().await;
    info!("Redfire PBX shutdown complete");
    Ok(())
}

async fn validate_configuration(config: &PbxConfig) -> Result<()> {
    info!("Validating configuration...");

    config.validate()?;

    println!("Configuration is valid");
    println!("  SIP: {}:{}", config.server.sip_host, config.server.sip_port);
    println!(
        "  RTP port range: {}-{}",
        config.server.rtp_port_range_start, config.server.rtp_port_range_end
    );
    println!("  Extensions configured: {}", config.extensions.len());
    println!("  Trunks configured: {}", config.trunk.trunks.len());
    println!("  LCR enabled: {}", config.lcr.enabled);
    println!("  DNS SRV failover enabled: {}", config.features.dns_srv_failover.enabled);

    Ok(())
}

async fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = PbxConfig::default_config();
    let yaml_content = serde_yaml::to_string(&config)
        .map_err(|e| redfire_pbx::Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, yaml_content)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", yaml_content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_generation() {
        let result = generate_default_config(None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_config_validation() {
        let config = PbxConfig::default_config();
        let result = validate_configuration(&config).await;
        assert!(result.is_ok());
    }
}
