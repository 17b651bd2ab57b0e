//! Ferry Daemon
//!
//! Serves a directory over an authenticated WebSocket.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::auth::generate_token;
use daemon::config::{default_config_path, Config};
use daemon::server::Server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Ferry Daemon - serves a directory over an authenticated WebSocket.
#[derive(Parser, Debug)]
#[command(name = "ferry-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, global = true)]
    pub host: Option<IpAddr>,

    /// Port to listen on (default: random in 49152-65535)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Directory to serve (default: the working directory)
    #[arg(short, long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Bandwidth cap for file streams in megabits per second (0 = unlimited)
    #[arg(long, global = true)]
    pub mbps: Option<f64>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, global = true, value_name = "FILE")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, global = true, value_name = "FILE")]
    pub tls_key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve the root directory until interrupted
    Serve,

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Applies command-line flags over file and environment values.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host.to_string();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(root) = &self.root {
            config.server.root = Some(root.clone());
        }
        if let Some(mbps) = self.mbps {
            config.transfer.mbps_limit = mbps;
        }
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_path = Some(cert.clone());
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_path = Some(key.clone());
        }
        if self.verbose {
            config.daemon.log_level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.startup_log_level(cli.verbose)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config_path.exists() {
        tracing::debug!("Config file not found at {:?}, using defaults", config_path);
    }
    config.apply_env_overrides();
    cli.apply_overrides(&mut config);
    config.validate()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            config.save(&config_path)?;
            println!("Configuration written to {}", config_path.display());
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Ferry daemon starting...");

    let token = generate_token();
    let server = Server::bind(config, token.clone()).await?;
    let endpoint = server.endpoint()?;
    let state = server.state();
    let context = state.router.context();

    tracing::info!(
        root = %context.root.path().display(),
        mbps = context.megabit_per_second_limit(),
        tls = server.is_tls(),
        "Serving"
    );
    tracing::info!("Listening on {}", endpoint);
    tracing::info!("Token: {}", token);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    server
        .serve(shutdown)
        .await
        .context("Daemon stopped with an error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["ferry-daemon"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::try_parse_from([
            "ferry-daemon",
            "--host",
            "127.0.0.1",
            "--port",
            "50000",
            "--mbps",
            "2.5",
            "--tls-cert",
            "cert.pem",
            "--tls-key",
            "key.pem",
            "-v",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 50000);
        assert_eq!(config.transfer.mbps_limit, 2.5);
        assert_eq!(config.tls.cert_path, Some(PathBuf::from("cert.pem")));
        assert_eq!(config.tls.key_path, Some(PathBuf::from("key.pem")));
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_cli_init_config_subcommand() {
        let cli = Cli::try_parse_from(["ferry-daemon", "init-config", "--force"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::InitConfig { force: true })));
    }

    #[test]
    fn test_cli_rejects_bad_host() {
        assert!(Cli::try_parse_from(["ferry-daemon", "--host", "not-an-ip"]).is_err());
    }
}
