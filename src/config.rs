//! Command-line and environment configuration for the router binary.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the router will listen.
    #[arg(short = 'p', long, env = "BEACON_PORT", default_value_t = 8000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "beacon")]
    pub metrics_prefix: String,

    /// The file from which to read the provider fleet. When omitted, the
    /// fleet is built from environment variables instead.
    #[arg(short = 'f', long, env = "BEACON_PROVIDERS_FILE")]
    pub providers: Option<PathBuf>,

    /// Seconds between background health check rounds.
    #[arg(long, env = "BEACON_HEALTH_INTERVAL_SECS", default_value_t = 30)]
    pub health_interval_secs: u64,

    /// Whether to start the per-region queue workers.
    #[arg(long, default_value_t = true)]
    pub queue_workers: bool,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if let Some(providers) = &self.providers
            && !providers.exists()
        {
            return Err(anyhow!(
                "Providers file '{}' does not exist",
                providers.display()
            ));
        }
        if self.health_interval_secs == 0 {
            return Err(anyhow!("Health check interval must be at least 1 second"));
        }
        Ok(self)
    }
}
