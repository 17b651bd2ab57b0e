//! Ferry Client
//!
//! Connects to a Ferry daemon and runs an interactive session on stdin.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use client::{
    connect, ping, CertificatePin, ConnectionConfig, Orchestrator, DEFAULT_MAX_SESSION_DURATION,
};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Environment variable checked for the session token.
const TOKEN_ENV: &str = "FERRY_TOKEN";

/// Grace period for blocking tasks (the stdin reader) once the session ends.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(250);

/// Ferry - browse and transfer files on a Ferry daemon.
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Server endpoint, e.g. http://127.0.0.1:50000 or https://host:8443
    pub endpoint: String,

    /// Local directory mirroring the server root (default: the working directory)
    #[arg(short, long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Maximum session length in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_MAX_SESSION_DURATION.as_secs())]
    pub max_session_duration: u64,

    /// Accept a certificate valid for this name when the endpoint host does not match
    #[arg(long, value_name = "NAME")]
    pub ssl_cert_subject: Option<String>,

    /// Accept the certificate with this SHA-1 or SHA-256 thumbprint (hex)
    #[arg(long, value_name = "HEX")]
    pub ssl_cert_thumbprint: Option<String>,

    /// Cap file streams at this many megabits per second instead of the server's limit
    #[arg(long, value_name = "MBPS", value_parser = parse_mbps)]
    pub mbps: Option<f64>,

    /// Hide progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    fn certificate_pin(&self) -> CertificatePin {
        CertificatePin {
            subject: self.ssl_cert_subject.clone(),
            thumbprint: self.ssl_cert_thumbprint.clone(),
        }
    }
}

fn parse_mbps(value: &str) -> Result<f64, String> {
    match value.parse::<f64>() {
        Ok(mbps) if mbps.is_finite() && mbps > 0.0 => Ok(mbps),
        _ => Err(format!("expected a positive number, got {value}")),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let token = match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
        _ => read_token(&mut std::io::stdin().lock())?,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = rt.block_on(run(cli, token));
    // tokio's stdin reader may still be parked in a blocking read.
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run(cli: Cli, token: String) -> anyhow::Result<()> {
    let mut config = ConnectionConfig::new(&cli.endpoint, token)?;
    config.pin = cli.certificate_pin();

    ping(&config)
        .await
        .with_context(|| format!("Server at {} is not reachable", cli.endpoint))?;
    let channel = connect(&config).await?;
    tracing::info!(endpoint = %config.endpoint(), "Connected");

    let working_dir = match cli.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Cannot determine the working directory")?,
    };
    let mut session = Orchestrator::new(channel, working_dir).with_progress(!cli.no_progress);
    if let Some(mbps) = cli.mbps {
        session = session.with_mbps_limit(mbps);
    }
    session
        .run(
            BufReader::new(tokio::io::stdin()),
            Duration::from_secs(cli.max_session_duration),
        )
        .await?;
    Ok(())
}

fn read_token<R: BufRead>(input: &mut R) -> anyhow::Result<String> {
    eprint!("Token: ");
    let mut line = String::new();
    input.read_line(&mut line)?;
    let token = line.trim();
    if token.is_empty() {
        anyhow::bail!("No token given (set {TOKEN_ENV} or type it at the prompt)");
    }
    Ok(token.to_string())
}
